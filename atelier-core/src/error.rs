use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Failures surfaced by the lifecycle manager.
///
/// Engine and transfer errors arrive as `anyhow::Error` and are flattened
/// into the message here, so callers never see a raw engine error type.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("unknown model `{0}`")]
    InvalidModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model `{0}` is not downloaded, download it first")]
    ModelNotDownloaded(String),

    #[error("failed to load model `{key}`: {cause}")]
    ModelLoadFailed { key: String, cause: String },

    #[error("model `{0}` is currently loaded, unload it first")]
    ModelInUse(String),

    #[error("model `{0}` is already being downloaded")]
    DownloadInProgress(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("failed to release model `{key}`: {cause}")]
    UnloadFailed { key: String, cause: String },

    #[error("failed to persist image: {0}")]
    PersistFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub(crate) fn load_failed(key: &str, cause: &anyhow::Error) -> Self {
        Self::ModelLoadFailed {
            key: key.to_string(),
            cause: format!("{cause:#}"),
        }
    }

    pub(crate) fn inference_failed(cause: &anyhow::Error) -> Self {
        Self::InferenceFailed(format!("{cause:#}"))
    }

    /// Stable machine-readable code for error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidModel(_) => "INVALID_MODEL",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ModelNotDownloaded(_) => "MODEL_NOT_DOWNLOADED",
            Self::ModelLoadFailed { .. } => "MODEL_LOAD_FAILED",
            Self::ModelInUse(_) => "MODEL_IN_USE",
            Self::DownloadInProgress(_) => "DOWNLOAD_IN_PROGRESS",
            Self::TransferFailed(_) => "TRANSFER_FAILED",
            Self::InferenceFailed(_) => "INFERENCE_FAILED",
            Self::UnloadFailed { .. } => "UNLOAD_FAILED",
            Self::PersistFailed(_) => "PERSIST_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// True when the caller can fix the failure by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidModel(_)
                | Self::InvalidRequest(_)
                | Self::ModelNotDownloaded(_)
                | Self::ModelInUse(_)
                | Self::DownloadInProgress(_)
        )
    }
}
