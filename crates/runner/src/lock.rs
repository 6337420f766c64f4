use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};

use crate::store::{StoreError, StoreResult};

/// Acquire an exclusive flock on the given path, blocking until available.
///
/// Serializes store writers across `sandbox-runner` processes; in-process
/// callers are already ordered by the store's async mutexes. The returned
/// guard holds the lock until dropped.
pub(crate) async fn acquire(path: PathBuf) -> StoreResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::Lock(format!("open {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, e)| StoreError::Lock(format!("flock {}: {e}", path.display())))
    })
    .await
    .map_err(|e| StoreError::Lock(format!("lock task: {e}")))?
}
