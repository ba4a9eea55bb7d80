use crate::backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum WaveError {
    #[error("Invalid configuration")]
    InvalidConfig,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Wave '{0}' not found")]
    WaveNotFound(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("Host '{0}' not found")]
    HostNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    SerdeError(String),
}

impl From<toml::de::Error> for WaveError {
    fn from(err: toml::de::Error) -> Self {
        WaveError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for WaveError {
    fn from(err: serde_json::Error) -> Self {
        WaveError::SerdeError(err.to_string())
    }
}
