//! Restricted evaluation of Rhai scripts.
//!
//! Everything here runs inside the worker process. The supervisor only sees
//! what [`evaluate`] reports through an [`OutputSink`] and the returned
//! [`Evaluation`].

mod allowlist;
mod builtins;
mod capture;
mod evaluate;
mod input;

pub use allowlist::{Builtin, CapabilityAllowlist, CapabilityDenied, allowlist};
pub use capture::{BufferSink, LimitedSink, OutputSink, SharedSink, TRUNCATION_MARKER};
pub use evaluate::{Evaluation, evaluate};
pub use input::{EndOfInput, InputEmulator};
