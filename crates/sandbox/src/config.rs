use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wall-clock budget for a request that does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// OS-level limits applied to every worker process before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space ceiling (RLIMIT_AS).
    pub memory_mb: u64,
    /// Descriptor ceiling (RLIMIT_NOFILE).
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            max_open_files: 64,
        }
    }
}

/// Interpreter limits handed to the worker on its command line.
///
/// A `max_operations` of zero means "unlimited"; the wall-clock deadline is
/// enforced by the supervisor regardless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    /// Combined stdout + stderr bytes a script may produce.
    pub max_output_bytes: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_output_bytes: 1024 * 1024,
        }
    }
}
