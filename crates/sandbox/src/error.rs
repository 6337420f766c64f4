#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("worker not available: {0}")]
    WorkerNotAvailable(String),

    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("result channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
