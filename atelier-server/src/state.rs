use std::path::PathBuf;
use std::sync::Arc;

use atelier_core::{
    Config, DeletionGuard, Dispatcher, DownloadOrchestrator, Fetcher, ImageSink, Loader,
    ModelStore, Registry, SlotManager, StylePreset,
};

/// Everything the handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: ModelStore,
    pub slot: SlotManager,
    pub dispatcher: Dispatcher,
    pub downloads: DownloadOrchestrator,
    pub guard: DeletionGuard,
    pub output_dir: PathBuf,
    pub default_style: StylePreset,
}

impl AppState {
    pub fn new(
        config: &Config,
        registry: Registry,
        loader: Arc<dyn Loader>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let registry = Arc::new(registry);
        let store = ModelStore::new(config.models_dir.clone());
        let slot = SlotManager::new(
            registry.clone(),
            store.clone(),
            loader.clone(),
            config.precision,
        );
        let downloads = DownloadOrchestrator::new(
            registry.clone(),
            store.clone(),
            fetcher,
            loader,
            config.precision,
            config.hf_token.clone(),
        );
        let guard = DeletionGuard::new(
            registry.clone(),
            store.clone(),
            slot.clone(),
            downloads.active(),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            slot.clone(),
            ImageSink::new(config.output_dir.clone()),
            config.default_style,
        );
        Self {
            registry,
            store,
            slot,
            dispatcher,
            downloads,
            guard,
            output_dir: config.output_dir.clone(),
            default_style: config.default_style,
        }
    }
}
