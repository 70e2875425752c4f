use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use atelier_core::{CandleLoader, Config, DeviceMap, HubFetcher, Precision, Registry, StylePreset};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod error;
mod routes;
mod state;

use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Atelier image generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 9090)]
    port: u16,

    /// One sub-directory per model is kept here
    #[arg(long, env = "MODELS_DIR", default_value = "./models")]
    models_dir: PathBuf,

    /// Generated images are written here
    #[arg(long, env = "OUTPUT_DIR", default_value = "./data/output")]
    output_dir: PathBuf,

    /// Hugging Face token, required for gated models
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// GPU ordinal to run on
    #[arg(long, default_value_t = 0)]
    device_ordinal: usize,

    /// Weight precision: auto, f32, f16 or bf16
    #[arg(long, env = "PRECISION", default_value = "auto", value_parser = Precision::parse)]
    precision: Precision,

    /// Style preset applied when a request names none or an unknown one
    #[arg(long, env = "DEFAULT_STYLE", default_value = "none")]
    default_style: String,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let default_style = StylePreset::from_key(&self.default_style)
            .with_context(|| format!("unknown style preset `{}`", self.default_style))?;
        Ok(Config {
            models_dir: self.models_dir,
            output_dir: self.output_dir,
            hf_token: self.hf_token.filter(|token| !token.is_empty()),
            precision: self.precision,
            device_map: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                DeviceMap::Ordinal(self.device_ordinal)
            },
            default_style,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bind_address = format!("{}:{}", args.host, args.port);
    let config = args.into_config()?;
    config
        .create_dirs()
        .context("failed to create model or output directory")?;

    let loader = CandleLoader::new(config.device_map)?;
    let state = AppState::new(
        &config,
        Registry::builtin(),
        Arc::new(loader),
        Arc::new(HubFetcher),
    );
    info!(
        models_dir = %config.models_dir.display(),
        output_dir = %config.output_dir.display(),
        precision = %config.precision,
        default_style = %config.default_style.key(),
        "configuration loaded"
    );

    let app = routes::router(state);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
