//! Public API for strdedup.
//!
//! This module contains all user-facing types and functions.
//! Most users should only interact with types from this module.

pub mod agent;
pub mod config;
pub mod error;
pub mod session;
pub mod stats;
