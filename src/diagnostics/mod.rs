//! Diagnostics for the dedup agent.
//!
//! The agent runs inside someone else's process, so nothing here may
//! panic or write to the application's streams by default. Diagnostics go
//! to a [`DiagnosticSink`]; the default [`LogSink`] forwards them to the
//! `log` facade and, with the `diagnostics` feature, mirrors them to stderr.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | SD0xx | Attach issues                  |
//! | SD1xx | Allocation interception        |
//! | SD2xx | Dedup table                    |
//! | SD3xx | Rewrite engine                 |
//! | SD4xx | GC coordination                |
//! | SD9xx | Internal errors                |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strdedup::{sd_emit, diagnostics::LogSink};
//!
//! let sink = LogSink;
//! sd_emit!(sink, SD301);
//! sd_emit!(sink, SD201, "hash 0x1f, two live entries");
//! ```

pub mod context;
pub mod emit;
pub mod kind;
pub mod macros;

pub use context::DiagContext;
pub use emit::{is_suppressed, suppress_diagnostics, CollectingSink, DiagnosticSink, LogSink};
pub use kind::{Diagnostic, DiagnosticKind};

pub use kind::{
    SD001, SD002, SD003, SD101, SD102, SD201, SD202, SD301, SD302, SD303, SD401, SD402, SD901,
};
