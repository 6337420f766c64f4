use std::path::{Path, PathBuf};

use sandbox::{Result, SandboxError};

/// File name of the worker binary.
pub const WORKER_BIN: &str = "script-worker";

/// Find the worker binary: the configured path, else next to the current
/// executable, else on `PATH`.
pub fn locate_worker(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SandboxError::WorkerNotAvailable(format!(
            "configured worker {} does not exist",
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(WORKER_BIN);
        if sibling.is_file() {
            return Ok(sibling);
        }
    }

    which::which(WORKER_BIN)
        .map_err(|e| SandboxError::WorkerNotAvailable(format!("{WORKER_BIN}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = locate_worker(Some(&missing)).unwrap_err();
        assert!(matches!(err, SandboxError::WorkerNotAvailable(_)));
    }

    #[test]
    fn configured_path_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join(WORKER_BIN);
        std::fs::write(&worker, b"").unwrap();
        assert_eq!(locate_worker(Some(&worker)).unwrap(), worker);
    }
}
