use std::cell::RefCell;
use std::rc::Rc;

/// Appended to stderr the first time the output budget runs out.
pub const TRUNCATION_MARKER: &str = "[output truncated]\n";

/// Destination for everything a script prints.
pub trait OutputSink {
    fn stdout(&mut self, text: &str);
    fn stderr(&mut self, text: &str);
}

/// Sink shared between the engine callbacks and the caller.
pub type SharedSink = Rc<RefCell<dyn OutputSink>>;

/// Collects output in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferSink {
    pub stdout: String,
    pub stderr: String,
}

impl OutputSink for BufferSink {
    fn stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }

    fn stderr(&mut self, text: &str) {
        self.stderr.push_str(text);
    }
}

/// Caps combined stdout + stderr bytes forwarded to an inner sink.
///
/// Text past the budget is dropped and [`TRUNCATION_MARKER`] is written to
/// stderr once. The marker itself does not count against the budget, and
/// neither does the failure report `evaluate` writes to the inner sink.
pub struct LimitedSink {
    inner: SharedSink,
    remaining: usize,
    truncated: bool,
}

impl LimitedSink {
    pub fn new(inner: SharedSink, max_bytes: usize) -> Self {
        Self {
            inner,
            remaining: max_bytes,
            truncated: false,
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Longest prefix of `text` that fits the remaining budget.
    fn admit<'a>(&mut self, text: &'a str) -> &'a str {
        if text.len() <= self.remaining {
            self.remaining -= text.len();
            return text;
        }
        let mut end = self.remaining;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.remaining = 0;
        text.get(..end).unwrap_or_default()
    }

    fn write(&mut self, text: &str, to_stderr: bool) {
        if self.truncated {
            return;
        }
        let admitted = self.admit(text);
        let cut = admitted.len() < text.len();
        let mut inner = self.inner.borrow_mut();
        if !admitted.is_empty() {
            if to_stderr {
                inner.stderr(admitted);
            } else {
                inner.stdout(admitted);
            }
        }
        if cut {
            self.truncated = true;
            inner.stderr(TRUNCATION_MARKER);
        }
    }
}

impl OutputSink for LimitedSink {
    fn stdout(&mut self, text: &str) {
        self.write(text, false);
    }

    fn stderr(&mut self, text: &str) {
        self.write(text, true);
    }
}
