//! Diagnostic emission backend.
//!
//! Handles routing diagnostics to the log facade, stderr, or custom sinks.

#[cfg(feature = "diagnostics")]
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::Diagnostic;
use crate::sync::mutex::Mutex;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Suppress all diagnostic output from [`LogSink`].
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// A diagnostic sink for custom output.
///
/// Sinks are called from runtime callbacks and must not block for long.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic, with optional runtime context.
    fn emit(&self, diag: &Diagnostic, context: Option<&str>);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &S {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        (**self).emit(diag, context)
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        (**self).emit(diag, context)
    }
}

/// Default sink: the `log` facade, plus stderr with the `diagnostics` feature.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        if is_suppressed() {
            return;
        }

        emit_to_log(diag, context);

        #[cfg(feature = "diagnostics")]
        emit_to_stderr(diag, context);
    }
}

fn emit_to_log(diag: &Diagnostic, context: Option<&str>) {
    let level = diag.kind.log_level();
    match context {
        Some(context) => log::log!(level, "[{}] {} ({})", diag.code, diag.message, context),
        None => log::log!(level, "[{}] {}", diag.code, diag.message),
    }

    if let Some(note) = diag.note {
        log::debug!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::debug!("  help: {}", help);
    }
}

#[cfg(feature = "diagnostics")]
fn emit_to_stderr(diag: &Diagnostic, context: Option<&str>) {
    let mut stderr = std::io::stderr();

    let _ = writeln!(
        stderr,
        "[strdedup][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );

    if let Some(context) = context {
        let _ = writeln!(stderr, "  context: {}", context);
    }
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }

    let _ = writeln!(stderr);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<(Diagnostic, Option<String>)>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    /// Codes of all collected diagnostics, in emission order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.diagnostics.lock().iter().map(|(d, _)| d.code).collect()
    }

    /// Context recorded with the first diagnostic carrying `code`.
    pub fn context_of(&self, code: &str) -> Option<String> {
        self.diagnostics
            .lock()
            .iter()
            .find(|(d, _)| d.code == code)
            .and_then(|(_, ctx)| ctx.clone())
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|(d, _)| d.kind == super::kind::DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic, context: Option<&str>) {
        self.diagnostics
            .lock()
            .push((diag.clone(), context.map(String::from)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::kind::{SD201, SD301};

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.emit(&SD301, None);
        sink.emit(&SD201, Some("hash 0x7"));

        assert_eq!(sink.codes(), vec!["SD301", "SD201"]);
        assert!(sink.has_errors());
        assert_eq!(sink.context_of("SD201").as_deref(), Some("hash 0x7"));

        sink.clear();
        assert!(sink.diagnostics().is_empty());
    }

    #[test]
    fn test_suppression() {
        suppress_diagnostics(true);
        assert!(is_suppressed());
        LogSink.emit(&SD301, None);
        suppress_diagnostics(false);
        assert!(!is_suppressed());
    }
}
