//! Shared agent state: run status and lock-free counters.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::error::AgentError;
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;

/// Whether the agent is still processing callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Callbacks are processed.
    Running,
    /// The agent turned itself off; every callback returns immediately.
    Disabled,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Run status plus the error that ended it.
///
/// Disabling is one-way: once off, the agent stays off for the rest of
/// the process.
pub(crate) struct AgentState {
    disabled: AtomicBool,
    reason: Mutex<Option<AgentError>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            disabled: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> AgentStatus {
        if self.is_disabled() {
            AgentStatus::Disabled
        } else {
            AgentStatus::Running
        }
    }

    /// Disable the agent. Returns true for the call that actually did it;
    /// later errors are dropped.
    pub fn disable(&self, error: AgentError) -> bool {
        if self.disabled.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.reason.lock() = Some(error);
        true
    }

    /// Disable without recording an error (explicit detach).
    pub fn stop(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn reason(&self) -> Option<AgentError> {
        self.reason.lock().clone()
    }
}

/// Event counters behind [`DedupStats`](crate::api::stats::DedupStats).
#[derive(Default)]
pub(crate) struct AgentCounters {
    pub allocations_seen: AtomicCounter,
    pub strings_seen: AtomicCounter,
    pub filtered: AtomicCounter,
    pub unreadable: AtomicCounter,
    pub hits: AtomicCounter,
    pub misses: AtomicCounter,
    pub bypassed: AtomicCounter,
    pub duplicate_bytes: AtomicCounter,

    pub redirected: AtomicCounter,
    pub deferred: AtomicCounter,
    pub folded: AtomicCounter,
    pub dropped_stale: AtomicCounter,
    pub observed: AtomicCounter,
    pub queue_overflows: AtomicCounter,

    pub collections: AtomicCounter,
    pub evictions: AtomicCounter,
    pub relocations: AtomicCounter,
    pub purges: AtomicCounter,
    pub consolidated_slots: AtomicCounter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let state = AgentState::new();
        assert_eq!(state.status(), AgentStatus::Running);

        assert!(state.disable(AgentError::CallbackPanicked("object_allocated")));
        assert!(!state.disable(AgentError::CallbackPanicked("collection_finished")));

        assert!(state.is_disabled());
        assert_eq!(
            state.reason(),
            Some(AgentError::CallbackPanicked("object_allocated"))
        );
    }
}
