use async_trait::async_trait;

use crate::types::{ExecutionRequest, ExecutionResult};

/// Runs one script per call in an isolated environment.
///
/// Implementations never return an error: every outcome (success, script
/// fault, capability denial, timeout, lost worker) is folded into the
/// returned [`ExecutionResult`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable name for this backend (e.g. "process").
    fn name(&self) -> &str;

    /// Execute a request to completion or until its deadline expires.
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult;
}
