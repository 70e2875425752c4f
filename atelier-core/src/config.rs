use std::path::PathBuf;

use crate::{DeviceMap, Precision, StylePreset};

/// Runtime settings for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// One sub-directory per model key lives here.
    pub models_dir: PathBuf,
    /// Generated images are written here.
    pub output_dir: PathBuf,
    /// Hub token for gated repositories.
    pub hf_token: Option<String>,
    pub precision: Precision,
    pub device_map: DeviceMap,
    pub default_style: StylePreset,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("data/output"),
            hf_token: None,
            precision: Precision::Auto,
            device_map: DeviceMap::default(),
            default_style: StylePreset::None,
        }
    }
}

impl Config {
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.models_dir)?;
        std::fs::create_dir_all(&self.output_dir)
    }
}
