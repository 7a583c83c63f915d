use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message text is empty")]
    EmptyMessage,

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("backend unavailable: {0}")]
    Backend(#[from] anyhow::Error),
}

impl ChatError {
    /// Backend failures are transient and worth retrying; everything
    /// else is a caller error and must be surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Backend(_))
    }
}
