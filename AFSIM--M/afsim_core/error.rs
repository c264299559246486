use thiserror::Error;

/// Errors raised by the scenario, entity and simulation services.
#[derive(Debug, Error)]
pub enum AfsimError {
    /// A required field was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Unknown scenario, platform, component or run, or a missing file.
    #[error("{0}")]
    NotFound(String),
    /// A platform with the same name already exists.
    #[error("{0}")]
    AlreadyExists(String),
    /// Launching or signalling an external process failed.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AfsimError {
    /// Stable machine-readable label for the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AfsimError>;
