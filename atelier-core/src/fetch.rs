use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use tracing::debug;

use crate::registry::Artifact;

/// Transfers one artifact file into a model directory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, artifact: &Artifact, dest: &Path, token: Option<&str>) -> Result<PathBuf>;
}

/// Fetches from the Hugging Face hub into an hf-hub cache rooted at `dest`.
#[derive(Debug, Default, Clone)]
pub struct HubFetcher;

#[async_trait]
impl Fetcher for HubFetcher {
    async fn fetch(&self, artifact: &Artifact, dest: &Path, token: Option<&str>) -> Result<PathBuf> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .with_cache_dir(dest.to_path_buf())
            .with_token(token.map(str::to_string))
            .build()
            .context("failed to create hf hub API")?;
        debug!(repo = artifact.repo, file = artifact.file, "fetching artifact");
        api.repo(artifact.hub_repo())
            .get(artifact.file)
            .await
            .with_context(|| format!("failed to fetch {}/{}", artifact.repo, artifact.file))
    }
}
