/// Shared error type used across all Switchboard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("provider {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        /// Rate limits, timeouts, connection resets — worth retrying.
        transient: bool,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the executor's bounded retry loop should retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Provider { transient: true, .. } | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
