//! Error taxonomy.
//!
//! None of these ever reach the monitored application: attach errors turn
//! the feature off, rewrite errors degrade to observe-only, and table
//! corruption disables the agent for the rest of the process.

use std::fmt;

use crate::host::ObjectAddress;

/// Failure to establish the instrumentation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// Another agent (or an earlier session) already owns the profiling slot.
    AlreadyAttached,
    /// The host runtime, OS or architecture cannot support the agent.
    UnsupportedPlatform(&'static str),
    /// The runtime refused the callback registration.
    HandshakeRejected {
        /// Raw status reported by the runtime.
        status: i32,
    },
}

impl AttachError {
    /// Non-zero status surfaced through the C entry point.
    pub fn status_code(&self) -> i32 {
        match self {
            AttachError::AlreadyAttached => 1,
            AttachError::UnsupportedPlatform(_) => 2,
            AttachError::HandshakeRejected { .. } => 3,
        }
    }
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::AlreadyAttached => {
                write!(f, "an instrumentation agent is already attached to this process")
            }
            AttachError::UnsupportedPlatform(reason) => write!(f, "unsupported platform: {}", reason),
            AttachError::HandshakeRejected { status } => {
                write!(f, "runtime rejected the attach handshake (status {:#x})", status)
            }
        }
    }
}

impl std::error::Error for AttachError {}

/// A runtime primitive the rewrite engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewritePrimitive {
    /// Redirect a duplicate object to the canonical one.
    Redirect,
    /// Fold recorded substitutions during the collector's trace.
    FoldReferences,
    /// Walk reference slots of the managed heap.
    WalkHeap,
}

impl fmt::Display for RewritePrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewritePrimitive::Redirect => write!(f, "redirect"),
            RewritePrimitive::FoldReferences => write!(f, "fold-references"),
            RewritePrimitive::WalkHeap => write!(f, "walk-heap"),
        }
    }
}

/// The runtime lacks (or refused) a primitive needed to collapse duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteUnsupported {
    /// Which primitive failed.
    pub primitive: RewritePrimitive,
}

impl RewriteUnsupported {
    /// Create an error for the given primitive.
    pub const fn new(primitive: RewritePrimitive) -> Self {
        Self { primitive }
    }
}

impl fmt::Display for RewriteUnsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime does not support the {} primitive", self.primitive)
    }
}

impl std::error::Error for RewriteUnsupported {}

/// An internal invariant of the dedup table was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableCorruption {
    /// Two live canonical entries hold identical content.
    DuplicateCanonical {
        /// Content hash of the bucket.
        hash: u64,
        /// First canonical address.
        first: ObjectAddress,
        /// Second canonical address.
        second: ObjectAddress,
    },
    /// An address was allocated again while still registered as canonical.
    AddressReused {
        /// The reused address.
        address: ObjectAddress,
    },
    /// The address index and the content buckets disagree.
    IndexMismatch {
        /// The address found in one structure but not the other.
        address: ObjectAddress,
    },
}

impl fmt::Display for TableCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableCorruption::DuplicateCanonical { hash, first, second } => write!(
                f,
                "two canonical entries for identical content (hash {:#018x}): {} and {}",
                hash, first, second
            ),
            TableCorruption::AddressReused { address } => {
                write!(f, "address {} allocated while still canonical", address)
            }
            TableCorruption::IndexMismatch { address } => {
                write!(f, "address index and buckets disagree about {}", address)
            }
        }
    }
}

impl std::error::Error for TableCorruption {}

/// Any failure the agent can record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Session could not be established.
    Attach(AttachError),
    /// A rewrite primitive was unavailable.
    Rewrite(RewriteUnsupported),
    /// The table lost an invariant.
    Corruption(TableCorruption),
    /// A runtime callback panicked and was contained.
    CallbackPanicked(&'static str),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Attach(e) => write!(f, "attach failed: {}", e),
            AgentError::Rewrite(e) => write!(f, "rewrite unavailable: {}", e),
            AgentError::Corruption(e) => write!(f, "table corruption: {}", e),
            AgentError::CallbackPanicked(callback) => {
                write!(f, "panic contained in the {} callback", callback)
            }
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Attach(e) => Some(e),
            AgentError::Rewrite(e) => Some(e),
            AgentError::Corruption(e) => Some(e),
            AgentError::CallbackPanicked(_) => None,
        }
    }
}

impl From<AttachError> for AgentError {
    fn from(e: AttachError) -> Self {
        AgentError::Attach(e)
    }
}

impl From<RewriteUnsupported> for AgentError {
    fn from(e: RewriteUnsupported) -> Self {
        AgentError::Rewrite(e)
    }
}

impl From<TableCorruption> for AgentError {
    fn from(e: TableCorruption) -> Self {
        AgentError::Corruption(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_non_zero() {
        let errors = [
            AttachError::AlreadyAttached,
            AttachError::UnsupportedPlatform("no profiling api"),
            AttachError::HandshakeRejected { status: 0 },
        ];
        for e in &errors {
            assert_ne!(e.status_code(), 0, "{}", e);
        }
    }

    #[test]
    fn test_agent_error_source() {
        use std::error::Error;

        let err = AgentError::from(RewriteUnsupported::new(RewritePrimitive::Redirect));
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "rewrite unavailable: runtime does not support the redirect primitive"
        );
    }
}
