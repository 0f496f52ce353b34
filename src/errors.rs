use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Container state error: {0}")]
    ContainerState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::IoError(err.to_string())
    }
}
