use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecutionRequest, ExecutionResult, FailureKind, Sandbox};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use worker_proto::{STATUS_CAPABILITY_DENIED, STATUS_OK, STATUS_RUNTIME_FAULT};

use crate::channel::{self, Collected, WorkerOutcome};
use crate::config::ProcessSandboxConfig;
use crate::locate::locate_worker;
use crate::process::{ChildLimits, engine_args, kill_process_group};

const TIMEOUT_MESSAGE: &str = "Timeout exceeded";
const NO_RESULT_MESSAGE: &str = "execution failed without producing a result";

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Spawning,
    Running,
    Completed,
    TimedOut,
    CrashedWithoutResult,
}

impl RunState {
    fn can_move_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Spawning)
                | (Self::Spawning, Self::Running | Self::CrashedWithoutResult)
                | (
                    Self::Running,
                    Self::Completed | Self::TimedOut | Self::CrashedWithoutResult
                )
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Spawning => f.write_str("spawning"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::CrashedWithoutResult => f.write_str("crashed without result"),
        }
    }
}

/// Per-execution bookkeeping: correlation id, state and start time.
struct Run {
    id: String,
    state: RunState,
    started: Instant,
}

impl Run {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: RunState::Idle,
            started: Instant::now(),
        }
    }

    fn transition(&mut self, to: RunState) {
        debug_assert!(
            self.state.can_move_to(to),
            "invalid transition {} -> {to}",
            self.state
        );
        debug!(id = %self.id, from = %self.state, to = %to, "state");
        self.state = to;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Runs every request in a fresh `script-worker` process.
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: ProcessSandboxConfig) -> Self {
        Self { config }
    }

    /// Default limits with the worker found via [`locate_worker`].
    pub fn with_located_worker() -> sandbox::Result<Self> {
        let worker = locate_worker(None)?;
        Ok(Self::new(ProcessSandboxConfig::new(worker)))
    }

    pub fn config(&self) -> &ProcessSandboxConfig {
        &self.config
    }

    fn spawn(&self, workdir: &std::path::Path, timeout: Duration) -> std::io::Result<Child> {
        let mut cmd = tokio::process::Command::new(&self.config.worker_path);
        cmd.args(engine_args(&self.config.engine))
            .env_clear()
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let limits = ChildLimits::new(&self.config.resources, timeout);
        // SAFETY: the closure only issues prctl/setrlimit syscalls, which are
        // async-signal-safe, and touches no memory shared with the parent.
        unsafe {
            cmd.pre_exec(move || limits.apply());
        }
        cmd.spawn()
    }

    async fn run(&self, run: &mut Run, request: &ExecutionRequest) -> ExecutionResult {
        run.transition(RunState::Spawning);
        let deadline = run.started + request.timeout();

        let workdir = match tempfile::Builder::new().prefix("script-run-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return crashed(run, format!("workdir: {e}")),
        };
        let mut child = match self.spawn(workdir.path(), request.timeout()) {
            Ok(child) => child,
            Err(e) => {
                warn!(id = %run.id, worker = %self.config.worker_path.display(), error = %e, "spawn failed");
                return crashed(run, format!("failed to start worker: {e}"));
            }
        };
        run.transition(RunState::Running);

        if let Some(stderr) = child.stderr.take() {
            forward_diagnostics(run.id.clone(), stderr);
        }
        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_process_group(&child);
            return crashed(run, "worker pipes unavailable".into());
        };

        let mut collected = Collected::default();
        let finished = tokio::time::timeout_at(deadline, async {
            if let Err(e) = channel::send_request(stdin, request.source(), request.stdin()).await {
                debug!(id = %run.id, error = %e, "request not fully delivered");
            }
            channel::read_frames(&mut stdout, &mut collected).await;
        })
        .await;

        if finished.is_err() {
            kill_process_group(&child);
            // Drain and reap share one grace period.
            let grace_deadline = Instant::now() + self.config.termination_grace;
            // Frames written before the kill are still in the pipe.
            let _ = tokio::time::timeout_at(
                grace_deadline,
                channel::read_frames(&mut stdout, &mut collected),
            )
            .await;
            if tokio::time::timeout_at(grace_deadline, child.wait())
                .await
                .is_err()
            {
                warn!(id = %run.id, "worker not reaped within termination grace");
            }
            run.transition(RunState::TimedOut);
            info!(id = %run.id, timeout = ?request.timeout(), "deadline exceeded");
            let mut stderr = collected.stderr;
            stderr.push('\n');
            stderr.push_str(TIMEOUT_MESSAGE);
            return ExecutionResult::failure(
                FailureKind::DeadlineExceeded,
                TIMEOUT_MESSAGE,
                collected.stdout,
                stderr,
                request.timeout(),
            );
        }

        let status = self.reap(&run.id, &mut child).await;
        drop(workdir);

        let Some(outcome) = collected.outcome.take() else {
            let mut detail = match status {
                Some(status) => format!("worker exited with {status}"),
                None => "worker did not exit".to_owned(),
            };
            if let Some(fault) = collected.fault.take() {
                detail = format!("{detail}; {fault}");
            }
            if collected.pending() > 0 {
                detail = format!("{detail}; {} bytes of an unfinished frame", collected.pending());
            }
            return crashed_with_output(run, collected, detail);
        };

        if let Some(status) = status.filter(|s| !s.success()) {
            warn!(id = %run.id, %status, "worker exited abnormally after reporting");
        }
        run.transition(RunState::Completed);
        completed(run, collected, outcome)
    }

    /// Wait for a worker that closed its channel; kill it if it lingers.
    async fn reap(&self, id: &str, child: &mut Child) -> Option<ExitStatus> {
        match tokio::time::timeout(self.config.termination_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "wait failed");
                None
            }
            Err(_) => {
                kill_process_group(child);
                tokio::time::timeout(self.config.termination_grace, child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let mut run = Run::new();
        debug!(id = %run.id, timeout = ?request.timeout(), "execution accepted");
        let result = self.run(&mut run, request).await;
        info!(
            id = %run.id,
            state = %run.state,
            succeeded = result.succeeded(),
            elapsed = ?run.elapsed(),
            "execution finished"
        );
        result
    }
}

fn completed(run: &Run, collected: Collected, outcome: WorkerOutcome) -> ExecutionResult {
    let elapsed = run.elapsed();
    let kind = match outcome.status {
        STATUS_OK => {
            return ExecutionResult::success(
                collected.stdout,
                collected.stderr,
                outcome.value,
                elapsed,
            );
        }
        STATUS_RUNTIME_FAULT => FailureKind::RuntimeFault,
        STATUS_CAPABILITY_DENIED => FailureKind::CapabilityDenied,
        other => {
            warn!(id = %run.id, status = other, "unknown outcome status");
            FailureKind::ChannelFault
        }
    };
    ExecutionResult::failure(kind, outcome.error, collected.stdout, collected.stderr, elapsed)
}

fn crashed(run: &mut Run, detail: String) -> ExecutionResult {
    crashed_with_output(run, Collected::default(), detail)
}

fn crashed_with_output(run: &mut Run, collected: Collected, detail: String) -> ExecutionResult {
    run.transition(RunState::CrashedWithoutResult);
    warn!(id = %run.id, detail = %detail, "no result from worker");
    let mut stderr = collected.stderr;
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&detail);
    ExecutionResult::failure(
        FailureKind::ChannelFault,
        NO_RESULT_MESSAGE,
        collected.stdout,
        stderr,
        run.elapsed(),
    )
}

/// Forward worker diagnostics to our log.
fn forward_diagnostics(id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                debug!(id = %id, "worker: {line}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(RunState::Idle.can_move_to(RunState::Spawning));
        assert!(RunState::Spawning.can_move_to(RunState::CrashedWithoutResult));
        assert!(RunState::Running.can_move_to(RunState::TimedOut));
        assert!(!RunState::Idle.can_move_to(RunState::Completed));
        assert!(!RunState::Completed.can_move_to(RunState::Running));
    }

    #[test]
    fn unknown_status_is_a_channel_fault() {
        let run = Run::new();
        let outcome = WorkerOutcome {
            status: 9,
            value: None,
            error: "?".into(),
        };
        let result = completed(&run, Collected::default(), outcome);
        assert_eq!(result.failure_kind(), Some(FailureKind::ChannelFault));
    }

    #[test]
    fn denied_status_maps_to_capability_denied() {
        let run = Run::new();
        let outcome = WorkerOutcome {
            status: STATUS_CAPABILITY_DENIED,
            value: None,
            error: "use of 'os' is not allowed".into(),
        };
        let result = completed(&run, Collected::default(), outcome);
        assert_eq!(result.failure_kind(), Some(FailureKind::CapabilityDenied));
        assert_eq!(result.error_message(), Some("use of 'os' is not allowed"));
    }

    #[tokio::test]
    async fn missing_worker_is_a_channel_fault() {
        let sandbox = ProcessSandbox::new(ProcessSandboxConfig::new("/nonexistent/script-worker"));
        let result = sandbox.execute(&ExecutionRequest::new("1", "")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ChannelFault));
        assert_eq!(result.error_message(), Some(NO_RESULT_MESSAGE));
        assert!(result.stderr().contains("failed to start worker"));
    }
}
