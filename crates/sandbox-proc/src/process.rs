use std::time::Duration;

use nix::sys::resource::{Resource, setrlimit};
use sandbox::{EngineLimits, ResourceLimits};

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the child has already been reaped or the PID
/// cannot be represented as `i32`.
pub fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

/// Command-line flags that hand `limits` to the worker.
pub fn engine_args(limits: &EngineLimits) -> Vec<String> {
    vec![
        format!("--max-operations={}", limits.max_operations),
        format!("--max-call-levels={}", limits.max_call_levels),
        format!("--max-expr-depth={}", limits.max_expr_depth),
        format!("--max-string-size={}", limits.max_string_size),
        format!("--max-array-size={}", limits.max_array_size),
        format!("--max-map-size={}", limits.max_map_size),
        format!("--max-output-bytes={}", limits.max_output_bytes),
    ]
}

/// Limits applied in the forked child before `exec`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildLimits {
    address_space: u64,
    open_files: u64,
    cpu_seconds: u64,
}

impl ChildLimits {
    pub(crate) fn new(resources: &ResourceLimits, timeout: Duration) -> Self {
        Self {
            address_space: resources.memory_mb.saturating_mul(1024 * 1024),
            open_files: resources.max_open_files,
            // CPU backstop a little past the wall clock deadline.
            cpu_seconds: timeout.as_secs().saturating_add(1),
        }
    }

    /// Runs between fork and exec: only raw syscalls, no allocation.
    pub(crate) fn apply(&self) -> std::io::Result<()> {
        nix::sys::prctl::set_no_new_privs()?;
        nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)?;

        setrlimit(Resource::RLIMIT_AS, self.address_space, self.address_space)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_FSIZE, 0, 0)?;
        Ok(())
    }
}
