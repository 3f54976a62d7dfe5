//! # strdedup
//!
//! Allocation-time string deduplication for managed runtimes.
//!
//! The agent attaches to a runtime's profiling interface, sees every string
//! allocation, and collapses duplicates onto one canonical instance per
//! distinct content value.
//!
//! ## Features
//!
//! - Content-addressed table, sharded by hash, exact byte comparison on collision
//! - Canonical references as (address, token) pairs; stale ones fail closed
//! - Redirect, deferred fold, or observe-only rewriting, chosen per runtime
//! - Moves and reclaims applied in one batch per collection
//! - GC-time consolidation of duplicates the allocation path missed
//! - C ABI for loading as a native agent module
//! - Simulated runtime for tests and experiments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strdedup::{attach, DedupConfig, SimulatedRuntime};
//!
//! let runtime = Arc::new(SimulatedRuntime::compacting());
//! let session = attach(Arc::clone(&runtime), SimulatedRuntime::STRING_TYPE, DedupConfig::default())
//!     .expect("attach");
//!
//! let a = runtime.alloc_string("hello");
//! let b = runtime.alloc_string("hello");
//! assert_eq!(runtime.resolve(b), a);
//!
//! println!("{}", session.agent().stats());
//! ```

pub mod api;
pub mod diagnostics;
pub mod ffi;
pub mod host;

mod core;
mod sync;
mod util;

// Re-export public API at crate root for convenience
pub use api::agent::DedupAgent;
pub use api::config::{
    DedupConfig, LockPolicy, RewriteMode, MAX_PENDING_CAPACITY, MAX_SHARD_COUNT,
};
pub use api::error::{AgentError, AttachError, RewritePrimitive, RewriteUnsupported, TableCorruption};
pub use api::session::{attach, attach_with_sink, Session};
pub use api::stats::DedupStats;

// Core types
pub use crate::core::consolidate::ConsolidationReport;
pub use crate::core::gc::CycleReport;
pub use crate::core::hash::{content_hash, ContentHasher};
pub use crate::core::interceptor::CandidateAllocation;
pub use crate::core::rewrite::{CollapseOutcome, RewriteStrategy};
pub use crate::core::state::AgentStatus;
pub use crate::core::table::{
    BypassReason, CanonicalRef, DedupTable, DuplicateReport, Lookup, Relocation,
};

// Host bindings
pub use host::{
    CollectorKind, ContentSource, EventMask, EventSink, HostCapabilities, HostRuntime,
    ObjectAddress, ReferenceSlot, SimulatedRuntime, StringLayout, Substitution, TypeHandle,
    WalkReport,
};

// Diagnostics
pub use diagnostics::{CollectingSink, DiagContext, Diagnostic, DiagnosticKind, DiagnosticSink, LogSink};
pub use diagnostics::{
    SD001, SD002, SD003, SD101, SD102, SD201, SD202, SD301, SD302, SD303, SD401, SD402, SD901,
};
