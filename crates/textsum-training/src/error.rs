use textsum_models::{HubError, ModelError};
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration documents are missing, malformed or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("training queue error: {0}")]
    Queue(String),

    /// The running job was cancelled.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() { Self::Cancelled } else { Self::Other(anyhow::anyhow!("task failed: {err}")) }
    }
}
