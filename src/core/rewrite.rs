//! Duplicate collapse.
//!
//! Three strategies, strongest first:
//!
//! - `Redirect`: the runtime makes the duplicate resolve to the canonical
//!   instance immediately.
//! - `DeferredFold`: the substitution is queued and handed to the collector
//!   when the next collection starts, before anything moves.
//! - `ObserveOnly`: duplicates are counted and left alone.
//!
//! A primitive that fails moves the engine one step down, once, for the
//! rest of the session.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::api::config::{DedupConfig, RewriteMode};
use crate::core::state::AgentCounters;
use crate::core::table::{CanonicalRef, DedupTable};
use crate::diagnostics::DiagnosticSink;
use crate::host::{HostCapabilities, HostRuntime, ObjectAddress, Substitution};
use crate::{sd_emit, sd_emit_once};

/// How duplicates are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RewriteStrategy {
    /// Redirect the duplicate at allocation time.
    Redirect = 0,
    /// Queue the substitution for the next collection.
    DeferredFold = 1,
    /// Count only.
    ObserveOnly = 2,
}

impl RewriteStrategy {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RewriteStrategy::Redirect,
            1 => RewriteStrategy::DeferredFold,
            _ => RewriteStrategy::ObserveOnly,
        }
    }

    /// Strongest strategy the runtime and config allow.
    pub fn select(capabilities: &HostCapabilities, mode: RewriteMode) -> Self {
        match mode {
            RewriteMode::ObserveOnly => RewriteStrategy::ObserveOnly,
            RewriteMode::Auto if capabilities.can_redirect => RewriteStrategy::Redirect,
            RewriteMode::Auto if capabilities.can_fold_references => RewriteStrategy::DeferredFold,
            RewriteMode::Auto => RewriteStrategy::ObserveOnly,
        }
    }
}

impl std::fmt::Display for RewriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteStrategy::Redirect => write!(f, "redirect"),
            RewriteStrategy::DeferredFold => write!(f, "deferred-fold"),
            RewriteStrategy::ObserveOnly => write!(f, "observe-only"),
        }
    }
}

/// What happened to one duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseOutcome {
    /// The runtime redirected it.
    Redirected,
    /// Queued for the next collection.
    Deferred,
    /// Counted only.
    Observed,
    /// The canonical reference went stale before the rewrite; nothing done.
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct PendingSubstitution {
    duplicate: ObjectAddress,
    canonical: CanonicalRef,
    epoch: u64,
}

/// Collapses duplicates with the strongest primitive still working.
pub(crate) struct RewriteEngine {
    strategy: AtomicU8,
    can_fold: bool,
    pending: ArrayQueue<PendingSubstitution>,
    diagnostics: Arc<dyn DiagnosticSink>,
    overflow_reported: AtomicBool,
}

impl RewriteEngine {
    pub fn new(
        capabilities: &HostCapabilities,
        config: &DedupConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let strategy = RewriteStrategy::select(capabilities, config.rewrite_mode);
        if strategy == RewriteStrategy::ObserveOnly && config.rewrite_mode == RewriteMode::Auto {
            sd_emit!(diagnostics, SD302, "no redirect or fold primitive");
        }

        Self {
            strategy: AtomicU8::new(strategy as u8),
            can_fold: capabilities.can_fold_references,
            pending: ArrayQueue::new(config.effective_pending_capacity()),
            diagnostics,
            overflow_reported: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn strategy(&self) -> RewriteStrategy {
        RewriteStrategy::from_u8(self.strategy.load(Ordering::Acquire))
    }

    /// Substitutions waiting for the next collection.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Move from `from` to the next weaker strategy. Only the caller that
    /// wins the transition reports it.
    fn downgrade(&self, from: RewriteStrategy, detail: &str) -> RewriteStrategy {
        let to = match from {
            RewriteStrategy::Redirect if self.can_fold => RewriteStrategy::DeferredFold,
            _ => RewriteStrategy::ObserveOnly,
        };

        match self.strategy.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::warn!("rewrite strategy downgraded: {} -> {} ({})", from, to, detail);
                match to {
                    RewriteStrategy::DeferredFold => sd_emit!(self.diagnostics, SD301, detail),
                    _ => sd_emit!(self.diagnostics, SD302, detail),
                }
                to
            }
            Err(current) => RewriteStrategy::from_u8(current),
        }
    }

    /// Collapse `duplicate` onto `canonical`.
    pub fn collapse<R>(
        &self,
        host: &R,
        table: &DedupTable,
        duplicate: ObjectAddress,
        canonical: CanonicalRef,
        counters: &AgentCounters,
    ) -> CollapseOutcome
    where
        R: HostRuntime + ?Sized,
    {
        let mut strategy = self.strategy();
        loop {
            match strategy {
                RewriteStrategy::Redirect => {
                    if !table.is_current(&canonical) {
                        counters.dropped_stale.increment();
                        return CollapseOutcome::Stale;
                    }
                    match host.redirect(duplicate, canonical.address()) {
                        Ok(()) => {
                            counters.redirected.increment();
                            return CollapseOutcome::Redirected;
                        }
                        Err(e) => strategy = self.downgrade(strategy, &e.to_string()),
                    }
                }
                RewriteStrategy::DeferredFold => {
                    let entry = PendingSubstitution {
                        duplicate,
                        canonical,
                        epoch: table.epoch(),
                    };
                    if self.pending.push(entry).is_ok() {
                        counters.deferred.increment();
                        return CollapseOutcome::Deferred;
                    }
                    counters.queue_overflows.increment();
                    sd_emit_once!(
                        self.overflow_reported,
                        self.diagnostics,
                        SD303,
                        format_args!("capacity {}", self.pending.capacity())
                    );
                    counters.observed.increment();
                    return CollapseOutcome::Observed;
                }
                RewriteStrategy::ObserveOnly => {
                    counters.observed.increment();
                    return CollapseOutcome::Observed;
                }
            }
        }
    }

    /// Drain the queue, keeping only substitutions whose canonical instance
    /// is still current and which were recorded in the current epoch.
    ///
    /// Must run before the collection phase begins.
    pub fn take_pending(&self, table: &DedupTable, counters: &AgentCounters) -> Vec<Substitution> {
        let epoch = table.epoch();
        let mut batch = Vec::with_capacity(self.pending.len());
        while let Some(entry) = self.pending.pop() {
            if entry.epoch == epoch && table.is_current(&entry.canonical) {
                batch.push(Substitution {
                    duplicate: entry.duplicate,
                    canonical: entry.canonical.address(),
                });
            } else {
                counters.dropped_stale.increment();
            }
        }
        batch
    }

    /// Hand a batch to the collector's trace.
    pub fn fold<R>(&self, host: &R, batch: &[Substitution], counters: &AgentCounters) -> usize
    where
        R: HostRuntime + ?Sized,
    {
        if batch.is_empty() {
            return 0;
        }

        match host.fold_references(batch) {
            Ok(folded) => {
                counters.folded.add(folded as u64);
                folded
            }
            Err(e) => {
                if self.strategy() == RewriteStrategy::DeferredFold {
                    self.downgrade(RewriteStrategy::DeferredFold, &e.to_string());
                }
                counters.observed.add(batch.len() as u64);
                0
            }
        }
    }
}
