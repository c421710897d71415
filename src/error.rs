use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

impl IngestError {
    /// Short label used for the `reason` dimension of failure metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::MalformedPayload(_) => "malformed",
            IngestError::StorageUnavailable(_) => "storage",
            IngestError::Transport(_) => "transport",
        }
    }
}
