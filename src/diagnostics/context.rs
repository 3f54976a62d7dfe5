//! Diagnostic context - thread and collection state awareness.

use std::thread::ThreadId;

/// Runtime state attached to a diagnostic.
#[derive(Debug, Clone)]
pub struct DiagContext {
    /// Current thread ID.
    pub thread_id: ThreadId,
    /// Thread name (if available).
    pub thread_name: Option<String>,
    /// Collections started so far.
    pub gc_epoch: u64,
    /// Free-form detail from the caller.
    pub detail: Option<String>,
}

impl DiagContext {
    /// Capture the calling thread with the given collection epoch.
    pub fn capture(gc_epoch: u64) -> Self {
        let thread = std::thread::current();
        Self {
            thread_id: thread.id(),
            thread_name: thread.name().map(String::from),
            gc_epoch,
            detail: None,
        }
    }

    /// Attach caller detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Format context for diagnostic output.
    pub fn format(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ref name) = self.thread_name {
            parts.push(format!("thread=\"{}\"", name));
        } else {
            parts.push(format!("thread={:?}", self.thread_id));
        }

        parts.push(format!("gc_epoch={}", self.gc_epoch));

        if let Some(ref detail) = self.detail {
            parts.push(detail.clone());
        }

        parts.join(", ")
    }
}

impl std::fmt::Display for DiagContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}
