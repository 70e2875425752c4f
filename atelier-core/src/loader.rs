use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::registry::{Artifact, ModelDescriptor};
use crate::{ModelLike, Precision};

/// Everything an engine needs to instantiate a model from local files.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub descriptor: &'a ModelDescriptor,
    pub dir: &'a Path,
    pub precision: Precision,
    /// Attention slicing / staged offload, when the variant supports it.
    pub optimize_memory: bool,
}

/// The inference engine as seen by the lifecycle manager.
///
/// Implementations are called from blocking threads and may take as long
/// as they need.
pub trait Loader: Send + Sync {
    fn load(&self, request: LoadRequest<'_>) -> Result<Box<dyn ModelLike>>;

    /// Human readable device description for health reporting.
    fn device_name(&self) -> String {
        "unknown".to_string()
    }

    /// Best-effort release of memory the engine can reclaim asynchronously.
    fn reclaim(&self) -> Result<()> {
        Ok(())
    }
}

/// Locates a downloaded artifact inside a model directory.
///
/// Model directories use the hf-hub cache layout, so lookups go through
/// `hf_hub::Cache` without touching the network.
pub fn resolve_artifact(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    hf_hub::Cache::new(dir.to_path_buf())
        .repo(artifact.hub_repo())
        .get(artifact.file)
        .with_context(|| {
            format!(
                "{}/{} is missing from {}",
                artifact.repo,
                artifact.file,
                dir.display()
            )
        })
}

/// Bytes of weights a set of resolved files will occupy once loaded.
pub fn weights_size(files: &[&Path]) -> u64 {
    files
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum()
}
