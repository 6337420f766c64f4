//! Hosts exactly one script evaluation.
//!
//! Reads one request frame from stdin, streams output frames to stdout while
//! the script runs, then writes one outcome frame and exits. Diagnostics go
//! to stderr and never enter the result channel.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use sandbox::{EngineLimits, FailureKind};
use script_engine::{Evaluation, OutputSink};
use tracing::{debug, error};
use worker_proto::{
    Decoder, MSG_OUTCOME, MSG_REQUEST, MSG_STDERR, MSG_STDOUT, STATUS_CAPABILITY_DENIED,
    STATUS_OK, STATUS_RUNTIME_FAULT,
};

#[derive(Parser)]
#[command(name = "script-worker", version)]
struct Args {
    #[arg(long, default_value_t = EngineLimits::default().max_operations)]
    max_operations: u64,
    #[arg(long, default_value_t = EngineLimits::default().max_call_levels)]
    max_call_levels: usize,
    #[arg(long, default_value_t = EngineLimits::default().max_expr_depth)]
    max_expr_depth: usize,
    #[arg(long, default_value_t = EngineLimits::default().max_string_size)]
    max_string_size: usize,
    #[arg(long, default_value_t = EngineLimits::default().max_array_size)]
    max_array_size: usize,
    #[arg(long, default_value_t = EngineLimits::default().max_map_size)]
    max_map_size: usize,
    #[arg(long, default_value_t = EngineLimits::default().max_output_bytes)]
    max_output_bytes: usize,
}

impl Args {
    fn limits(&self) -> EngineLimits {
        EngineLimits {
            max_operations: self.max_operations,
            max_call_levels: self.max_call_levels,
            max_expr_depth: self.max_expr_depth,
            max_string_size: self.max_string_size,
            max_array_size: self.max_array_size,
            max_map_size: self.max_map_size,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

/// Writes each chunk of output as its own frame, flushed immediately so it
/// survives if we are killed mid-run.
struct FrameSink<W: Write> {
    out: W,
    broken: bool,
}

impl<W: Write> FrameSink<W> {
    fn new(out: W) -> Self {
        Self { out, broken: false }
    }

    fn send(&mut self, msg_type: u8, payload: &[u8]) -> std::io::Result<()> {
        let frame = worker_proto::encode(msg_type, payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.out.write_all(&frame)?;
        self.out.flush()
    }

    fn text(&mut self, msg_type: u8, text: &str) {
        if self.broken {
            return;
        }
        for chunk in worker_proto::text_chunks(text) {
            if let Err(e) = self.send(msg_type, chunk.as_bytes()) {
                error!(error = %e, "result channel closed");
                self.broken = true;
                return;
            }
        }
    }
}

impl<W: Write> OutputSink for FrameSink<W> {
    fn stdout(&mut self, text: &str) {
        self.text(MSG_STDOUT, text);
    }

    fn stderr(&mut self, text: &str) {
        self.text(MSG_STDERR, text);
    }
}

fn read_request() -> Result<(String, String), String> {
    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .map_err(|e| format!("read request: {e}"))?;
    let msgs = Decoder::new()
        .decode(&raw)
        .map_err(|e| format!("decode request: {e}"))?;
    let msg = msgs.first().ok_or("no request frame")?;
    if msg.msg_type != MSG_REQUEST {
        return Err(format!("unexpected frame 0x{:02x}", msg.msg_type));
    }
    let request = worker_proto::decode_request(&msg.payload).map_err(|e| e.to_string())?;
    Ok((request.source.to_owned(), request.stdin.to_owned()))
}

fn status_of(evaluation: &Evaluation) -> u8 {
    match evaluation.kind {
        None if evaluation.success => STATUS_OK,
        Some(FailureKind::CapabilityDenied) => STATUS_CAPABILITY_DENIED,
        _ => STATUS_RUNTIME_FAULT,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time()
        .init();

    let args = Args::parse();
    let (source, stdin) = match read_request() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "no usable request");
            return ExitCode::from(2);
        }
    };
    debug!(source_len = source.len(), stdin_len = stdin.len(), "request received");

    let sink = Rc::new(RefCell::new(FrameSink::new(std::io::stdout())));
    let limits = args.limits();
    let evaluation = catch_unwind(AssertUnwindSafe(|| {
        script_engine::evaluate(&source, &stdin, &limits, sink.clone())
    }))
    .unwrap_or_else(|_| {
        sink.borrow_mut().stderr("internal error: evaluation panicked\n");
        Evaluation {
            success: false,
            return_value: None,
            error: Some("internal error: evaluation panicked".to_owned()),
            kind: Some(FailureKind::RuntimeFault),
        }
    });

    let value = evaluation.return_value.as_ref().map(|v| v.to_string());
    let payload = worker_proto::encode_outcome(
        status_of(&evaluation),
        value.as_deref(),
        evaluation.error.as_deref().unwrap_or_default(),
    );
    if let Err(e) = sink.borrow_mut().send(MSG_OUTCOME, &payload) {
        error!(error = %e, "failed to report outcome");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
