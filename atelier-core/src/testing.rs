//! Fakes for the engine and the transfer capability.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::{
    Artifact, Dispatcher, DownloadOrchestrator, Fetcher, FluxVariant, ImageSink, InferenceParams,
    LoadRequest, Loader, ModelDescriptor, ModelLike, ModelStore, ModelVariant, Precision, Registry,
    SlotManager, StylePreset,
};

pub(crate) const FAKE_ARTIFACTS: &[Artifact] = &[
    Artifact::new("test/model", "weights.safetensors"),
    Artifact::new("test/model", "config.json"),
];

type Shared<T> = Arc<Mutex<T>>;

#[derive(Default)]
pub(crate) struct FakeLoader {
    pub loads: Arc<AtomicUsize>,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub reclaims: Arc<AtomicUsize>,
    /// Ordered log of load/infer/release events.
    pub timeline: Shared<Vec<String>>,
    /// Parameters every inference received.
    pub inputs: Shared<Vec<InferenceParams>>,
    released: Shared<Vec<String>>,
    fail_loading: Shared<HashSet<String>>,
    fail_release: Shared<HashSet<String>>,
    load_delay: Shared<Duration>,
    infer_delay: Shared<Duration>,
}

impl FakeLoader {
    pub fn bytes_for(key: &str) -> u64 {
        key.len() as u64 * 1_000
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn inputs(&self) -> Vec<InferenceParams> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn fail_loading(&self, key: &str) {
        self.fail_loading.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_release(&self, key: &str) {
        self.fail_release.lock().unwrap().insert(key.to_string());
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub fn set_infer_delay(&self, delay: Duration) {
        *self.infer_delay.lock().unwrap() = delay;
    }
}

impl Loader for FakeLoader {
    fn load(&self, request: LoadRequest<'_>) -> Result<Box<dyn ModelLike>> {
        let key = request.descriptor.key;
        std::thread::sleep(*self.load_delay.lock().unwrap());
        if self.fail_loading.lock().unwrap().contains(key) {
            anyhow::bail!("corrupt weights for {key}");
        }
        anyhow::ensure!(request.dir.is_dir(), "{} is not a directory", request.dir.display());

        self.loads.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.timeline.lock().unwrap().push(format!("load:{key}"));

        Ok(Box::new(FakeModel {
            key: key.to_string(),
            live: self.live.clone(),
            timeline: self.timeline.clone(),
            inputs: self.inputs.clone(),
            released: self.released.clone(),
            fail_release: self.fail_release.lock().unwrap().contains(key),
            infer_delay: *self.infer_delay.lock().unwrap(),
        }))
    }

    fn device_name(&self) -> String {
        "fake:0".to_string()
    }

    fn reclaim(&self) -> Result<()> {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeModel {
    key: String,
    live: Arc<AtomicUsize>,
    timeline: Shared<Vec<String>>,
    inputs: Shared<Vec<InferenceParams>>,
    released: Shared<Vec<String>>,
    fail_release: bool,
    infer_delay: Duration,
}

impl ModelLike for FakeModel {
    fn run(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        self.timeline
            .lock()
            .unwrap()
            .push(format!("infer-start:{}", self.key));
        self.inputs.lock().unwrap().push(params.clone());
        std::thread::sleep(self.infer_delay);
        self.timeline
            .lock()
            .unwrap()
            .push(format!("infer-end:{}", self.key));
        Ok(DynamicImage::new_rgb8(4, 4))
    }

    fn resident_bytes(&self) -> u64 {
        FakeLoader::bytes_for(&self.key)
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.released.lock().unwrap().push(self.key.clone());
        self.timeline
            .lock()
            .unwrap()
            .push(format!("release:{}", self.key));
        if self.fail_release {
            anyhow::bail!("device reset while freeing {}", self.key);
        }
        Ok(())
    }
}

/// Writes a small file per artifact, optionally failing or stalling on one
/// file name.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pub calls: AtomicUsize,
    pub fail_on: Mutex<Option<&'static str>>,
    pub stall_on: Mutex<Option<&'static str>>,
    pub delay: Mutex<Duration>,
    unstall: Notify,
}

impl FakeFetcher {
    pub fn release_stall(&self) {
        self.unstall.notify_one();
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, artifact: &Artifact, dest: &Path, _token: Option<&str>) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let stall_on = *self.stall_on.lock().unwrap();
        if stall_on == Some(artifact.file) {
            self.unstall.notified().await;
        }
        let fail_on = *self.fail_on.lock().unwrap();
        if fail_on == Some(artifact.file) {
            anyhow::bail!("connection reset while fetching {}", artifact.file);
        }
        tokio::fs::create_dir_all(dest).await?;
        let path = dest.join(artifact.file);
        tokio::fs::write(&path, artifact.repo.as_bytes()).await?;
        Ok(path)
    }
}

pub(crate) fn descriptor(key: &'static str) -> ModelDescriptor {
    ModelDescriptor {
        key,
        name: key,
        remote_id: "test/model",
        variant: ModelVariant::Flux(FluxVariant::Schnell),
        requires_auth: key.starts_with("gated"),
        default_steps: 4,
        default_guidance: 0.0,
        default_width: 512,
        default_height: 512,
        needs_memory_optimization: false,
        artifacts: FAKE_ARTIFACTS,
    }
}

/// Scratch directories plus a registry of fake models.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub registry: Arc<Registry>,
    pub store: ModelStore,
    pub loader: Arc<FakeLoader>,
    pub fetcher: Arc<FakeFetcher>,
}

impl Fixture {
    /// Registers and downloads every key.
    pub fn new(keys: &[&'static str]) -> Self {
        Self::with_downloaded(keys, keys)
    }

    pub fn with_downloaded(keys: &[&'static str], downloaded: &[&'static str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(keys.iter().copied().map(descriptor).collect()));
        let store = ModelStore::new(dir.path().join("models"));
        let fixture = Self {
            dir,
            registry,
            store,
            loader: Arc::new(FakeLoader::default()),
            fetcher: Arc::new(FakeFetcher::default()),
        };
        for key in downloaded {
            fixture.download(key);
        }
        fixture
    }

    pub fn download(&self, key: &str) {
        let dir = self.store.directory_for(key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("weights.safetensors"), b"weights").unwrap();
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn slot(&self) -> SlotManager {
        SlotManager::new(
            self.registry.clone(),
            self.store.clone(),
            self.loader.clone(),
            Precision::Auto,
        )
    }

    pub fn dispatcher(&self, slot: SlotManager) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            slot,
            ImageSink::new(self.output_dir()),
            StylePreset::None,
        )
    }

    pub fn downloads(&self, token: Option<&str>) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            self.registry.clone(),
            self.store.clone(),
            self.fetcher.clone(),
            self.loader.clone(),
            Precision::Auto,
            token.map(str::to_string),
        )
    }
}
