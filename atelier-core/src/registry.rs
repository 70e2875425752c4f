//! Static catalog of the models the server knows how to fetch and run.

use serde::Serialize;

use crate::error::{LifecycleError, Result};
use crate::flux::{self, FluxVariant};
use crate::stable_diffusion::{self, SdVariant};
use crate::ModelVariant;

/// One file of a model artifact, addressed on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub repo: &'static str,
    pub revision: Option<&'static str>,
    pub file: &'static str,
}

impl Artifact {
    pub const fn new(repo: &'static str, file: &'static str) -> Self {
        Self {
            repo,
            revision: None,
            file,
        }
    }

    pub const fn with_revision(repo: &'static str, revision: &'static str, file: &'static str) -> Self {
        Self {
            repo,
            revision: Some(revision),
            file,
        }
    }

    pub fn hub_repo(&self) -> hf_hub::Repo {
        match self.revision {
            Some(revision) => hf_hub::Repo::with_revision(
                self.repo.to_string(),
                hf_hub::RepoType::Model,
                revision.to_string(),
            ),
            None => hf_hub::Repo::model(self.repo.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub remote_id: &'static str,
    pub variant: ModelVariant,
    pub requires_auth: bool,
    pub default_steps: usize,
    pub default_guidance: f64,
    pub default_width: usize,
    pub default_height: usize,
    pub needs_memory_optimization: bool,
    #[serde(skip)]
    pub artifacts: &'static [Artifact],
}

#[derive(Debug, Clone)]
pub struct Registry {
    models: Vec<ModelDescriptor>,
}

impl Registry {
    /// The first descriptor is the default model.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        assert!(!models.is_empty(), "registry needs at least one model");
        Self { models }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ModelDescriptor {
                key: "flux-schnell",
                name: "FLUX.1 [schnell]",
                remote_id: "black-forest-labs/FLUX.1-schnell",
                variant: ModelVariant::Flux(FluxVariant::Schnell),
                requires_auth: false,
                default_steps: 4,
                default_guidance: 0.0,
                default_width: 1360,
                default_height: 768,
                needs_memory_optimization: false,
                artifacts: flux::SCHNELL_ARTIFACTS,
            },
            ModelDescriptor {
                key: "flux-dev",
                name: "FLUX.1 [dev]",
                remote_id: "black-forest-labs/FLUX.1-dev",
                variant: ModelVariant::Flux(FluxVariant::Dev),
                requires_auth: true,
                default_steps: 28,
                default_guidance: 3.5,
                default_width: 1024,
                default_height: 1024,
                needs_memory_optimization: true,
                artifacts: flux::DEV_ARTIFACTS,
            },
            ModelDescriptor {
                key: "sdxl-turbo",
                name: "SDXL Turbo",
                remote_id: "stabilityai/sdxl-turbo",
                variant: ModelVariant::StableDiffusion(SdVariant::XlTurbo),
                requires_auth: false,
                default_steps: 4,
                default_guidance: 1.0,
                default_width: 1024,
                default_height: 1024,
                needs_memory_optimization: false,
                artifacts: stable_diffusion::XL_TURBO_ARTIFACTS,
            },
            ModelDescriptor {
                key: "sdxl",
                name: "Stable Diffusion XL 1.0",
                remote_id: "stabilityai/stable-diffusion-xl-base-1.0",
                variant: ModelVariant::StableDiffusion(SdVariant::Xl),
                requires_auth: false,
                default_steps: 30,
                default_guidance: 7.5,
                default_width: 1024,
                default_height: 1024,
                needs_memory_optimization: true,
                artifacts: stable_diffusion::XL_ARTIFACTS,
            },
        ])
    }

    pub fn resolve(&self, key: &str) -> Result<&ModelDescriptor> {
        self.models
            .iter()
            .find(|model| model.key == key)
            .ok_or_else(|| LifecycleError::InvalidModel(key.to_string()))
    }

    pub fn default_key(&self) -> &'static str {
        self.models[0].key
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}
