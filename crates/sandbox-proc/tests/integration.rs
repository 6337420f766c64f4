#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::process::Stdio;
use std::time::{Duration, Instant};

use sandbox::{EngineLimits, ExecutionRequest, FailureKind, Sandbox};
use sandbox_proc::{ProcessSandbox, ProcessSandboxConfig, kill_process_group};
use tokio::io::{AsyncBufReadExt, BufReader};

const WORKER: &str = env!("CARGO_BIN_EXE_script-worker");

fn sandbox() -> ProcessSandbox {
    ProcessSandbox::new(ProcessSandboxConfig::new(WORKER))
}

fn request(source: &str, stdin: &str, timeout_secs: u64) -> ExecutionRequest {
    ExecutionRequest::new(source, stdin)
        .with_timeout_secs(timeout_secs)
        .unwrap()
}

#[tokio::test]
async fn main_prints_and_returns() {
    let result = sandbox()
        .execute(&request(r#"fn main() { print("hi"); 42 }"#, "", 10))
        .await;

    assert!(result.succeeded(), "{result:?}");
    assert_eq!(result.stdout(), "hi\n");
    assert_eq!(result.return_value(), Some(&serde_json::json!(42)));
    assert!(result.error_message().is_none());
    assert!(result.elapsed_seconds() >= 0.0);
}

#[tokio::test]
async fn infinite_loop_hits_the_deadline() {
    let started = Instant::now();
    let result = sandbox()
        .execute(&request(r#"print("start"); while true {}"#, "", 1))
        .await;
    let took = started.elapsed();

    assert!(!result.succeeded());
    assert_eq!(result.failure_kind(), Some(FailureKind::DeadlineExceeded));
    assert_eq!(result.error_message(), Some("Timeout exceeded"));
    assert!(result.stderr().ends_with("\nTimeout exceeded"));
    assert_eq!(result.stdout(), "start\n");
    assert!((result.elapsed_seconds() - 1.0).abs() < f64::EPSILON);
    assert!(took >= Duration::from_secs(1));
    assert!(took < Duration::from_secs(5), "took {took:?}");
}

#[tokio::test]
async fn denied_import_preserves_earlier_output() {
    let result = sandbox()
        .execute(&request(
            r#"print("before"); import "socket" as s; print("after");"#,
            "",
            10,
        ))
        .await;

    assert!(!result.succeeded());
    assert_eq!(result.failure_kind(), Some(FailureKind::CapabilityDenied));
    assert!(result.error_message().unwrap().contains("socket"));
    assert_eq!(result.stdout(), "before\n");
}

#[tokio::test]
async fn reading_past_stdin_fails_with_eof() {
    let result = sandbox()
        .execute(&request(
            "let a = input(); let b = input(); print(b);",
            "first\n",
            10,
        ))
        .await;

    assert!(!result.succeeded());
    assert_eq!(result.failure_kind(), Some(FailureKind::RuntimeFault));
    assert!(result.error_message().unwrap().contains("EOFError"));
    assert_eq!(result.stdout(), "first\n");
}

#[tokio::test]
async fn runtime_error_reports_trace() {
    let source = r#"
        fn helper() { throw "bad input"; }
        fn main() { helper() }
    "#;
    let result = sandbox().execute(&request(source, "", 10)).await;

    assert_eq!(result.failure_kind(), Some(FailureKind::RuntimeFault));
    assert_eq!(result.error_message(), Some("bad input"));
    assert!(result.stderr().contains("helper"));
}

#[tokio::test]
async fn repeated_runs_are_independent() {
    let sandbox = sandbox();
    let source = r#"let n = input(); print(`got ${n}`); fn main() { 1 }"#;
    let first = sandbox.execute(&request(source, "x\n", 10)).await;
    let second = sandbox.execute(&request(source, "x\n", 10)).await;

    assert!(first.succeeded());
    assert_eq!(first.stdout(), second.stdout());
    assert_eq!(first.stderr(), second.stderr());
    assert_eq!(first.return_value(), second.return_value());
}

#[tokio::test]
async fn concurrent_runs_do_not_mix_output() {
    let sandbox = std::sync::Arc::new(sandbox());
    let mut handles = Vec::new();
    for i in 0..4 {
        let sandbox = sandbox.clone();
        handles.push(tokio::spawn(async move {
            let source = format!(r#"for n in 0..50 {{ print("{i}"); }}"#);
            sandbox.execute(&request(&source, "", 10)).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert!(result.succeeded(), "{result:?}");
        assert!(result.stdout().lines().all(|l| l == i.to_string()));
        assert_eq!(result.stdout().lines().count(), 50);
    }
}

#[tokio::test]
async fn output_limit_truncates() {
    let mut config = ProcessSandboxConfig::new(WORKER);
    config.engine = EngineLimits {
        max_output_bytes: 32,
        ..EngineLimits::default()
    };
    let result = ProcessSandbox::new(config)
        .execute(&request(r#"loop { print("spam spam spam"); }"#, "", 2))
        .await;

    // The loop still runs to the deadline; only its output is capped.
    assert_eq!(result.failure_kind(), Some(FailureKind::DeadlineExceeded));
    assert_eq!(result.stdout().len(), 32);
    assert!(result.stderr().contains("[output truncated]"));
}

#[tokio::test]
async fn worker_without_result_is_a_channel_fault() {
    let sandbox = ProcessSandbox::new(ProcessSandboxConfig::new(which::which("true").unwrap()));
    let result = sandbox.execute(&request("1", "", 5)).await;

    assert!(!result.succeeded());
    assert_eq!(result.failure_kind(), Some(FailureKind::ChannelFault));
    assert_eq!(
        result.error_message(),
        Some("execution failed without producing a result")
    );
    assert!(result.stderr().contains("worker exited with"));
}

#[tokio::test]
async fn teardown_stays_within_one_grace_period() {
    use std::os::unix::fs::PermissionsExt;

    // A detached sleeper keeps the output pipe open after the group kill, so
    // draining runs to the end of the grace period.
    let dir = tempfile::tempdir().unwrap();
    let worker = dir.path().join("stuck-worker");
    let script = format!(
        "#!/bin/sh\n{} {} 5 &\nexec {} 30\n",
        which::which("setsid").unwrap().display(),
        which::which("sleep").unwrap().display(),
        which::which("sleep").unwrap().display(),
    );
    std::fs::write(&worker, script).unwrap();
    std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = ProcessSandboxConfig::new(&worker);
    config.termination_grace = Duration::from_millis(1500);
    let started = Instant::now();
    let result = ProcessSandbox::new(config)
        .execute(&request("1", "", 1))
        .await;
    let took = started.elapsed();

    assert_eq!(result.failure_kind(), Some(FailureKind::DeadlineExceeded));
    assert!(took >= Duration::from_millis(2500), "took {took:?}");
    assert!(took < Duration::from_millis(4000), "took {took:?}");
}

/// Is `pid` gone, or at least a zombie?
fn is_dead(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

#[tokio::test]
async fn process_group_kill_reaches_grandchildren() {
    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "sleep 30 & echo $!; wait"])
        .stdout(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let line = BufReader::new(stdout)
        .lines()
        .next_line()
        .await
        .unwrap()
        .unwrap();
    let grandchild: u32 = line.trim().parse().unwrap();
    assert!(!is_dead(grandchild));

    kill_process_group(&child);
    child.wait().await.unwrap();

    let mut dead = false;
    for _ in 0..50 {
        if is_dead(grandchild) {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dead, "grandchild {grandchild} survived the group kill");
}
