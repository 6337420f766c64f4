//! Script runner: sandboxed execution plus named script collections.

mod config;
mod error;
mod facade;
mod lock;
mod sanitize;
mod store;

use std::sync::Arc;
use std::time::Duration;

use sandbox_proc::{ProcessSandbox, ProcessSandboxConfig, WORKER_BIN};
use tracing::{info, warn};

pub use config::{RunnerConfig, SandboxSettings, load as load_config};
pub use error::{RunnerError, RunnerResult};
pub use facade::{ListedScript, LoadedScript, ScriptRunner};
pub use sanitize::sanitize_name;
pub use store::{
    CollectionStore, DEFAULT_COLLECTION, SCRIPT_EXTENSION, ScriptMetadata, StoreError, StoreResult,
};

/// Assemble a [`ScriptRunner`] backed by the process sandbox.
///
/// A worker that cannot be located is not fatal here: storage commands still
/// work, and every execution reports a channel fault.
pub async fn build(config: &RunnerConfig) -> RunnerResult<ScriptRunner> {
    let sandbox_config = match config.process_sandbox_config() {
        Ok(sandbox_config) => sandbox_config,
        Err(e) => {
            warn!(error = %e, "script worker not located; executions will fail");
            ProcessSandboxConfig {
                resources: config.sandbox.resources.clone(),
                engine: config.engine.clone(),
                termination_grace: Duration::from_millis(config.sandbox.termination_grace_ms),
                ..ProcessSandboxConfig::new(WORKER_BIN)
            }
        }
    };
    info!(
        worker = %sandbox_config.worker_path.display(),
        base_dir = %config.base_dir.display(),
        "runner ready"
    );

    let store = CollectionStore::open(&config.base_dir).await?;
    let sandbox = Arc::new(ProcessSandbox::new(sandbox_config));
    Ok(ScriptRunner::new(sandbox, store).with_default_timeout(config.default_timeout()))
}
