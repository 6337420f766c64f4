use std::path::PathBuf;
use std::time::Duration;

use sandbox::{EngineLimits, ResourceLimits};

/// How long teardown may take after the deadline before we stop waiting.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessSandboxConfig {
    /// Path to the `script-worker` binary.
    pub worker_path: PathBuf,
    pub resources: ResourceLimits,
    pub engine: EngineLimits,
    pub termination_grace: Duration,
}

impl ProcessSandboxConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            resources: ResourceLimits::default(),
            engine: EngineLimits::default(),
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}
