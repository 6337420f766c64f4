use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TIMEOUT;
use crate::error::{Result, SandboxError};

/// One script submission. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    source: String,
    stdin: String,
    timeout: Duration,
}

impl ExecutionRequest {
    /// Build a request with the default 30 second deadline.
    pub fn new(source: impl Into<String>, stdin: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stdin: stdin.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Replace the deadline. Zero is rejected.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(SandboxError::InvalidRequest(
                "timeout must be greater than zero".into(),
            ));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_timeout_secs(self, secs: u64) -> Result<Self> {
        self.with_timeout(Duration::from_secs(secs))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stdin(&self) -> &str {
        &self.stdin
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script reached for a built-in or module outside the allowlist.
    CapabilityDenied,
    /// The script raised an error (including syntax errors).
    RuntimeFault,
    /// The supervisor killed the worker at the deadline.
    DeadlineExceeded,
    /// The worker vanished or never started without reporting an outcome.
    ChannelFault,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapabilityDenied => f.write_str("capability denied"),
            Self::RuntimeFault => f.write_str("runtime fault"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
            Self::ChannelFault => f.write_str("channel fault"),
        }
    }
}

/// Normalized outcome of one execution.
///
/// Either `succeeded` with no error, or failed with both an error message and
/// a [`FailureKind`]; the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    succeeded: bool,
    stdout: String,
    stderr: String,
    return_value: Option<serde_json::Value>,
    error_message: Option<String>,
    failure: Option<FailureKind>,
    elapsed_seconds: f64,
}

impl ExecutionResult {
    pub fn success(
        stdout: String,
        stderr: String,
        return_value: Option<serde_json::Value>,
        elapsed: Duration,
    ) -> Self {
        Self {
            succeeded: true,
            stdout,
            stderr,
            return_value,
            error_message: None,
            failure: None,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = kind.to_string();
        }
        Self {
            succeeded: false,
            stdout,
            stderr,
            return_value: None,
            error_message: Some(message),
            failure: Some(kind),
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn return_value(&self) -> Option<&serde_json::Value> {
        self.return_value.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }
}
