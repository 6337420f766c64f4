mod channel;
mod config;
mod locate;
mod process;
mod sandbox;

pub use config::{DEFAULT_TERMINATION_GRACE, ProcessSandboxConfig};
pub use locate::{WORKER_BIN, locate_worker};
pub use process::{engine_args, kill_process_group};
pub use sandbox::ProcessSandbox;
