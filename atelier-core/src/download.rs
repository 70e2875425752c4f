//! Artifact downloads observed through an ordered stream of progress events.
//!
//! Each call to [`DownloadOrchestrator::download`] spawns a producer task that
//! feeds a bounded channel. The stream always ends with exactly one
//! `complete` or `error` event. Downloads never touch the model slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::fetch::Fetcher;
use crate::loader::{LoadRequest, Loader};
use crate::registry::{ModelDescriptor, Registry};
use crate::store::{DiskState, ModelStore};
use crate::Precision;

const PROGRESS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Downloading,
    Saving,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_seconds: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_downloaded: bool,
}

impl ProgressEvent {
    fn new(phase: Phase, percent: u8, message: impl Into<String>) -> Self {
        Self {
            phase,
            percent,
            message: message.into(),
            download_seconds: None,
            already_downloaded: false,
        }
    }

    fn error(err: &LifecycleError) -> Self {
        Self::new(Phase::Error, 0, err.to_string())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Error)
    }
}

pub type ProgressStream = ReceiverStream<ProgressEvent>;

/// Keys with a transfer in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveDownloads(Arc<Mutex<HashSet<String>>>);

impl ActiveDownloads {
    pub fn contains(&self, key: &str) -> bool {
        self.0.lock().map(|keys| keys.contains(key)).unwrap_or(false)
    }

    /// Reserves `key` until the returned claim is dropped.
    pub(crate) fn claim(&self, key: &str) -> Result<DownloadClaim> {
        let mut keys = self
            .0
            .lock()
            .map_err(|_| LifecycleError::TransferFailed("download registry poisoned".into()))?;
        if !keys.insert(key.to_string()) {
            return Err(LifecycleError::DownloadInProgress(key.to_string()));
        }
        Ok(DownloadClaim {
            active: self.clone(),
            key: key.to_string(),
        })
    }
}

pub(crate) struct DownloadClaim {
    active: ActiveDownloads,
    key: String,
}

impl Drop for DownloadClaim {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.active.0.lock() {
            keys.remove(&self.key);
        }
    }
}

struct Progress(mpsc::Sender<ProgressEvent>);

impl Progress {
    async fn emit(&self, event: ProgressEvent) {
        debug!(phase = ?event.phase, percent = event.percent, "{}", event.message);
        if self.0.send(event).await.is_err() {
            debug!("progress consumer went away, download continues");
        }
    }
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    registry: Arc<Registry>,
    store: ModelStore,
    fetcher: Arc<dyn Fetcher>,
    loader: Arc<dyn Loader>,
    precision: Precision,
    token: Option<String>,
    active: ActiveDownloads,
}

impl DownloadOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        store: ModelStore,
        fetcher: Arc<dyn Fetcher>,
        loader: Arc<dyn Loader>,
        precision: Precision,
        token: Option<String>,
    ) -> Self {
        Self {
            registry,
            store,
            fetcher,
            loader,
            precision,
            token,
            active: ActiveDownloads::default(),
        }
    }

    pub fn active(&self) -> ActiveDownloads {
        self.active.clone()
    }

    pub fn disk_state(&self, key: &str) -> DiskState {
        if self.active.contains(key) {
            DiskState::Downloading
        } else {
            self.store.state(key)
        }
    }

    /// Starts downloading `key`. Unknown keys and duplicate downloads fail
    /// here, before any event is produced.
    pub async fn download(&self, key: &str) -> Result<ProgressStream> {
        let descriptor = self.registry.resolve(key)?.clone();
        let (sender, receiver) = mpsc::channel(PROGRESS_CAPACITY);
        let progress = Progress(sender);

        // Claimed before the presence check: files appear on disk as soon as
        // a transfer starts, so only the claim tells a partial model apart.
        let claim = self.active.claim(key)?;
        if self.store.is_present(key) {
            drop(claim);
            info!(model = key, "model already downloaded");
            let mut event = ProgressEvent::new(Phase::Complete, 100, format!("{key} is already downloaded"));
            event.already_downloaded = true;
            progress.emit(event).await;
            return Ok(ReceiverStream::new(receiver));
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run(descriptor, &progress).await;
            // the key must be free again by the time the stream ends
            drop(claim);
            drop(progress);
        });
        Ok(ReceiverStream::new(receiver))
    }

    async fn run(&self, descriptor: ModelDescriptor, progress: &Progress) {
        let start = Instant::now();
        let key = descriptor.key;
        info!(model = key, remote = descriptor.remote_id, "download started");

        match self.transfer_and_verify(&descriptor, progress).await {
            Ok(()) => {
                progress
                    .emit(ProgressEvent::new(Phase::Saving, 90, "Finalizing model files"))
                    .await;
                let seconds = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
                let mut event = ProgressEvent::new(
                    Phase::Complete,
                    100,
                    format!("{} downloaded in {seconds:.2}s", descriptor.name),
                );
                event.download_seconds = Some(seconds);
                info!(model = key, seconds, "download complete");
                progress.emit(event).await;
            }
            Err(err) => {
                warn!(model = key, error = %err, "download failed");
                progress.emit(ProgressEvent::error(&err)).await;
            }
        }
    }

    async fn transfer_and_verify(&self, descriptor: &ModelDescriptor, progress: &Progress) -> Result<()> {
        progress
            .emit(ProgressEvent::new(
                Phase::Starting,
                0,
                format!("Preparing download of {}", descriptor.name),
            ))
            .await;
        if descriptor.requires_auth && self.token.is_none() {
            return Err(LifecycleError::TransferFailed(format!(
                "{} is gated, configure an access token (HF_TOKEN)",
                descriptor.remote_id
            )));
        }

        progress
            .emit(ProgressEvent::new(
                Phase::Downloading,
                10,
                format!("Downloading {}", descriptor.remote_id),
            ))
            .await;
        let dest = self.store.directory_for(descriptor.key);
        let total = descriptor.artifacts.len();
        for (index, artifact) in descriptor.artifacts.iter().enumerate() {
            self.fetcher
                .fetch(artifact, &dest, self.token.as_deref())
                .await
                .map_err(|cause| LifecycleError::TransferFailed(format!("{cause:#}")))?;
            let done = index + 1;
            if done < total {
                let percent = 10 + (60 * done / total) as u8;
                progress
                    .emit(ProgressEvent::new(
                        Phase::Downloading,
                        percent,
                        format!("Fetched {} ({done}/{total})", artifact.file),
                    ))
                    .await;
            }
        }

        progress
            .emit(ProgressEvent::new(
                Phase::Downloading,
                70,
                "Transfer complete, verifying model",
            ))
            .await;
        self.verify(descriptor).await
    }

    /// Loads the fresh artifact once and discards it. The slot is not involved.
    async fn verify(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let key = descriptor.key;
        let loader = self.loader.clone();
        let descriptor = descriptor.clone();
        let dir = self.store.directory_for(key);
        let precision = self.precision;

        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let model = loader.load(LoadRequest {
                descriptor: &descriptor,
                dir: &dir,
                precision,
                optimize_memory: descriptor.needs_memory_optimization,
            })?;
            model.release()
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(model = key, "verification load succeeded");
                Ok(())
            }
            Ok(Err(cause)) => Err(LifecycleError::load_failed(key, &cause)),
            Err(join) => Err(LifecycleError::ModelLoadFailed {
                key: key.to_string(),
                cause: join.to_string(),
            }),
        }
    }
}
