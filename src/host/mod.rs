//! Host runtime bindings.
//!
//! ## Backends
//! - [`SimulatedRuntime`]: an in-process managed heap, always available
//! - `ffi`: a runtime reached through the C ABI vtable

// Always present: the capability interface the core is written against
pub mod traits;
pub use traits::{
    CollectorKind, ContentSource, EventMask, EventSink, HostCapabilities, HostRuntime,
    ObjectAddress, ReferenceSlot, Substitution, TypeHandle, WalkReport,
};

pub mod layout;
pub use layout::StringLayout;

// Simulated heap for tests, benches and demos
pub mod simulated;
pub use simulated::{CollectionSummary, SimulatedRuntime};
