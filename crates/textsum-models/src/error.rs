use thiserror::Error;

/// Errors raised while loading, training or running a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Tokenizer could not be loaded or failed to encode/decode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Checkpoint or adapter files are missing or malformed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// The adapter configuration does not fit the base model.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Inputs passed to the model are inconsistent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the HuggingFace Hub client.
#[derive(Debug, Error)]
pub enum HubError {
    /// The repository (or revision) does not exist.
    #[error("repository not found: {0}")]
    NotFound(String),

    /// The token is missing or lacks access.
    #[error("unauthorized access to {0} (check HUGGINGFACE_HUB_TOKEN)")]
    Unauthorized(String),

    /// The repository id is not of the form `name` or `namespace/name`.
    #[error("invalid repository id: {0}")]
    InvalidRepoId(String),

    /// A listed file would land outside the destination directory.
    #[error("refusing unsafe file path '{0}'")]
    UnsafePath(String),

    /// Transport-level failure.
    #[error("hub request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Any other non-success status.
    #[error("hub returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
