//! Core dedup machinery.
//!
//! These modules are internal; the agent in `api` wires them together.

pub mod consolidate;
pub mod gc;
pub mod hash;
pub mod interceptor;
pub mod rewrite;
pub(crate) mod state;
pub mod table;
