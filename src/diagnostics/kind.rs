//! Diagnostic kinds and predefined codes.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - the agent lost a feature or disabled itself.
    Error,
    /// A warning - the agent degraded but keeps running.
    Warning,
    /// Additional context about the agent's configuration.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }

    /// Matching `log` level.
    pub fn log_level(&self) -> log::Level {
        match self {
            DiagnosticKind::Error => log::Level::Error,
            DiagnosticKind::Warning => log::Level::Warn,
            DiagnosticKind::Note | DiagnosticKind::Help => log::Level::Info,
        }
    }
}

/// A diagnostic message with code, message, and optional context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "SD201").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new note diagnostic.
    pub const fn note(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Note,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (SD0xx - Attach)
// =============================================================================

/// SD001: Another agent owns the profiling slot.
pub const SD001: Diagnostic = Diagnostic::error(
    "SD001",
    "string deduplication disabled: an instrumentation agent is already attached"
).with_note("the runtime permits a single profiling attachment per process")
 .with_help("detach the other profiler, or run without string deduplication");

/// SD002: Platform cannot host the agent.
pub const SD002: Diagnostic = Diagnostic::error(
    "SD002",
    "string deduplication disabled: unsupported runtime or platform"
).with_note("the instrumentation interface is only known to work for one runtime family and target")
 .with_help("the process continues unmodified; no action is required");

/// SD003: Runtime rejected the handshake.
pub const SD003: Diagnostic = Diagnostic::error(
    "SD003",
    "string deduplication disabled: the runtime rejected the attach handshake"
).with_note("callback registration returned a failure status")
 .with_help("check that the agent was loaded before significant allocation volume");

// =============================================================================
// Predefined diagnostics (SD1xx - Interception)
// =============================================================================

/// SD101: String payload could not be read.
pub const SD101: Diagnostic = Diagnostic::warning(
    "SD101",
    "could not read the payload of an allocated string"
).with_note("the allocation was let through unmodified")
 .with_help("verify the string layout reported by the runtime");

/// SD102: A callback panicked.
pub const SD102: Diagnostic = Diagnostic::error(
    "SD102",
    "a runtime callback panicked; deduplication disabled"
).with_note("the panic was contained and did not reach the application")
 .with_help("please report this issue with the logged context");

// =============================================================================
// Predefined diagnostics (SD2xx - Table)
// =============================================================================

/// SD201: Table invariant violated.
pub const SD201: Diagnostic = Diagnostic::error(
    "SD201",
    "dedup table invariant violated; deduplication disabled"
).with_note("continuing could compare against freed or moved memory")
 .with_help("the process continues without memory savings");

/// SD202: Table reached its entry limit.
pub const SD202: Diagnostic = Diagnostic::warning(
    "SD202",
    "dedup table is full; new content is no longer registered"
).with_note("existing canonical entries keep deduplicating")
 .with_help("raise max_entries or STRDEDUP_MAX_ENTRIES");

// =============================================================================
// Predefined diagnostics (SD3xx - Rewrite)
// =============================================================================

/// SD301: Redirect primitive unavailable.
pub const SD301: Diagnostic = Diagnostic::warning(
    "SD301",
    "runtime refused to redirect a duplicate; falling back to deferred folding"
).with_note("duplicates are recorded and folded at the next collection");

/// SD302: No rewrite primitive left.
pub const SD302: Diagnostic = Diagnostic::warning(
    "SD302",
    "no rewrite primitive available; running in observe-only mode"
).with_note("duplicates are counted but no memory is reclaimed");

/// SD303: Deferred queue overflowed.
pub const SD303: Diagnostic = Diagnostic::warning(
    "SD303",
    "deferred substitution queue is full; extra duplicates are only observed"
).with_help("raise pending_capacity or STRDEDUP_PENDING");

// =============================================================================
// Predefined diagnostics (SD4xx - GC coordination)
// =============================================================================

/// SD401: Addresses do not survive a collection.
pub const SD401: Diagnostic = Diagnostic::note(
    "SD401",
    "runtime does not report every move and reclaim; the table is purged after each collection"
).with_note("deduplication restarts from an empty table every cycle");

/// SD402: Heap walk unavailable.
pub const SD402: Diagnostic = Diagnostic::note(
    "SD402",
    "runtime cannot walk reference slots; GC-time consolidation disabled"
);

// =============================================================================
// Predefined diagnostics (SD9xx - Internal)
// =============================================================================

/// SD901: Internal agent error.
pub const SD901: Diagnostic = Diagnostic::error(
    "SD901",
    "internal agent error"
).with_note("this indicates a bug in strdedup")
 .with_help("please report this issue at the strdedup repository");
