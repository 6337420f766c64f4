use std::collections::VecDeque;

use crate::capture::OutputSink;

/// Raised when a script asks for more lines than stdin supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("EOFError: EOF when reading a line")]
pub struct EndOfInput;

/// Feeds a fixed stdin text to the script one line at a time, echoing each
/// line to captured stdout the way a terminal would.
#[derive(Debug, Default)]
pub struct InputEmulator {
    lines: VecDeque<String>,
}

impl InputEmulator {
    pub fn new(stdin: &str) -> Self {
        Self {
            lines: stdin.lines().map(str::to_owned).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }

    /// Write `prompt` (no newline), then consume and echo the next line.
    ///
    /// The prompt is written even when input is exhausted.
    pub fn next_line(
        &mut self,
        prompt: Option<&str>,
        sink: &mut dyn OutputSink,
    ) -> Result<String, EndOfInput> {
        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            sink.stdout(prompt);
        }
        let line = self.lines.pop_front().ok_or(EndOfInput)?;
        sink.stdout(&line);
        sink.stdout("\n");
        Ok(line)
    }
}
