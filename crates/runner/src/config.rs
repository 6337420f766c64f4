use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{EngineLimits, ResourceLimits};
use sandbox_proc::ProcessSandboxConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_BASE_DIR: &str = "scripts";
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_TERMINATION_GRACE_MS: u64 = 2000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root of the script collections.
    pub base_dir: PathBuf,
    pub sandbox: SandboxSettings,
    pub engine: EngineLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            sandbox: SandboxSettings::default(),
            engine: EngineLimits::default(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Explicit `script-worker` path. Looked up next to this binary, then on
    /// `PATH`, when unset.
    pub worker: Option<PathBuf>,
    pub timeout_secs: u64,
    pub termination_grace_ms: u64,
    #[serde(flatten)]
    pub resources: ResourceLimits,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            worker: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            resources: ResourceLimits::default(),
        }
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config).await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> RunnerResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| RunnerError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(RunnerError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

async fn validate(config: &RunnerConfig) -> RunnerResult<()> {
    if config.sandbox.timeout_secs == 0 {
        return Err(RunnerError::Config(
            "sandbox.timeout_secs must be greater than zero".into(),
        ));
    }
    if config.sandbox.resources.max_open_files < 8 {
        return Err(RunnerError::Config(
            "sandbox.max_open_files must be at least 8".into(),
        ));
    }
    if let Some(worker) = &config.sandbox.worker {
        check_path_exists(worker, "script worker").await?;
    }
    Ok(())
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        if let Some(worker) = &mut self.sandbox.worker {
            resolve(worker);
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.timeout_secs)
    }

    /// Build the supervisor config, locating the worker binary.
    pub fn process_sandbox_config(&self) -> RunnerResult<ProcessSandboxConfig> {
        let worker = sandbox_proc::locate_worker(self.sandbox.worker.as_deref())?;
        Ok(ProcessSandboxConfig {
            worker_path: worker,
            resources: self.sandbox.resources.clone(),
            engine: self.engine.clone(),
            termination_grace: Duration::from_millis(self.sandbox.termination_grace_ms),
        })
    }
}
