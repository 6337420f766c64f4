mod config;
mod error;
mod sandbox;
mod types;

pub use config::{DEFAULT_TIMEOUT, EngineLimits, ResourceLimits};
pub use error::{Result, SandboxError};
pub use sandbox::Sandbox;
pub use types::{ExecutionRequest, ExecutionResult, FailureKind};
