//! The dedup agent.
//!
//! [`DedupAgent`] is the callback target the host runtime drives. It owns
//! the table and wires the interceptor, rewrite engine, GC coordinator and
//! consolidation pass together. Every callback is contained: errors and
//! panics disable the agent instead of reaching the application.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::api::config::DedupConfig;
use crate::api::error::{AgentError, TableCorruption};
use crate::api::stats::DedupStats;
use crate::core::consolidate::{ConsolidationReport, Consolidator};
use crate::core::gc::GcCoordinator;
use crate::core::interceptor::{CandidateAllocation, Interceptor};
use crate::core::rewrite::{RewriteEngine, RewriteStrategy};
use crate::core::state::{AgentCounters, AgentState, AgentStatus};
use crate::core::table::{DedupTable, DuplicateReport};
use crate::diagnostics::{DiagContext, DiagnosticSink};
use crate::host::{EventSink, HostCapabilities, HostRuntime, ObjectAddress, TypeHandle};
use crate::sd_emit;

/// String deduplication agent bound to one host runtime.
pub struct DedupAgent<R: HostRuntime> {
    host: Arc<R>,
    capabilities: HostCapabilities,

    table: DedupTable,
    interceptor: Interceptor,
    rewrite: RewriteEngine,
    gc: GcCoordinator,
    consolidator: Consolidator,

    state: AgentState,
    counters: AgentCounters,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl<R: HostRuntime> DedupAgent<R> {
    pub(crate) fn new(
        host: Arc<R>,
        string_type: TypeHandle,
        config: &DedupConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let capabilities = host.capabilities();

        Self {
            table: DedupTable::new(config),
            interceptor: Interceptor::new(string_type, config, Arc::clone(&diagnostics)),
            rewrite: RewriteEngine::new(&capabilities, config, Arc::clone(&diagnostics)),
            gc: GcCoordinator::new(&capabilities, &diagnostics),
            consolidator: Consolidator::new(string_type, &capabilities, config, &diagnostics),
            host,
            capabilities,
            state: AgentState::new(),
            counters: AgentCounters::default(),
            diagnostics,
        }
    }

    /// The host this agent is attached to.
    pub fn host(&self) -> &Arc<R> {
        &self.host
    }

    /// Capabilities reported at attach time.
    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    /// The string type being deduplicated.
    pub fn string_type(&self) -> TypeHandle {
        self.interceptor.string_type()
    }

    /// The dedup table.
    pub fn table(&self) -> &DedupTable {
        &self.table
    }

    /// Current run status.
    pub fn status(&self) -> AgentStatus {
        self.state.status()
    }

    /// Whether the agent turned itself off.
    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    /// The error that disabled the agent, if any.
    pub fn last_error(&self) -> Option<AgentError> {
        self.state.reason()
    }

    /// Rewrite strategy in effect.
    pub fn rewrite_strategy(&self) -> RewriteStrategy {
        self.rewrite.strategy()
    }

    /// Whether the table is emptied after every collection.
    pub fn purges_each_cycle(&self) -> bool {
        self.gc.purges_each_cycle()
    }

    /// Whether the GC-time consolidation pass is active.
    pub fn consolidates(&self) -> bool {
        self.consolidator.is_enabled()
    }

    /// Most duplicated content.
    pub fn top_duplicates(&self, n: usize) -> Vec<DuplicateReport> {
        self.table.top_duplicates(n)
    }

    /// Check table consistency against the heap. A failure disables the agent.
    pub fn verify(&self) -> Result<(), TableCorruption> {
        self.table.verify(&*self.host).map_err(|e| {
            self.fail(AgentError::Corruption(e.clone()));
            e
        })
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> DedupStats {
        let c = &self.counters;
        DedupStats {
            status: self.status(),
            strategy: self.rewrite.strategy(),
            allocations_seen: c.allocations_seen.get(),
            strings_seen: c.strings_seen.get(),
            filtered: c.filtered.get(),
            unreadable: c.unreadable.get(),
            hits: c.hits.get(),
            misses: c.misses.get(),
            bypassed: c.bypassed.get(),
            duplicate_bytes: c.duplicate_bytes.get(),
            redirected: c.redirected.get(),
            deferred: c.deferred.get(),
            folded: c.folded.get(),
            observed: c.observed.get(),
            dropped_stale: c.dropped_stale.get(),
            queue_overflows: c.queue_overflows.get(),
            pending: self.rewrite.pending_len(),
            entries: self.table.len(),
            peak_entries: self.table.peak_len(),
            collections: c.collections.get(),
            evictions: c.evictions.get(),
            relocations: c.relocations.get(),
            purges: c.purges.get(),
            consolidated_slots: c.consolidated_slots.get(),
        }
    }

    /// Turn the agent off for good.
    pub(crate) fn disable(&self, error: AgentError) {
        self.fail(error);
    }

    /// Stop processing callbacks and release the table.
    pub(crate) fn stop(&self) {
        self.state.stop();
        self.table.purge();
    }

    fn fail(&self, error: AgentError) {
        let context = DiagContext::capture(self.table.epoch()).with_detail(error.to_string());
        if !self.state.disable(error.clone()) {
            return;
        }

        log::error!("string deduplication disabled: {}", error);
        match error {
            AgentError::Corruption(_) => sd_emit!(self.diagnostics, SD201, context),
            AgentError::CallbackPanicked(_) => sd_emit!(self.diagnostics, SD102, context),
            AgentError::Attach(_) | AgentError::Rewrite(_) => {
                sd_emit!(self.diagnostics, SD901, context)
            }
        }

        // The table may be inconsistent; stop pinning memory with it.
        self.table.purge();
    }

    /// Run `f` unless disabled, containing panics.
    fn guarded(&self, callback: &'static str, f: impl FnOnce() -> Result<(), AgentError>) {
        if self.state.is_disabled() {
            return;
        }
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(_) => self.fail(AgentError::CallbackPanicked(callback)),
        }
    }

    fn on_allocated(&self, type_handle: TypeHandle, object: ObjectAddress) -> Result<(), AgentError> {
        self.counters.allocations_seen.increment();
        if !self.interceptor.is_string(type_handle) {
            return Ok(());
        }

        let canonical = {
            let Some(contents) = self.host.string_contents(object) else {
                self.interceptor.unreadable(object, &self.counters);
                return Ok(());
            };
            let candidate = CandidateAllocation::new(object, type_handle, contents.as_ref());
            self.interceptor
                .intercept(&candidate, &self.table, &*self.host, &self.counters)?
        };

        if let Some(canonical) = canonical {
            self.rewrite
                .collapse(&*self.host, &self.table, object, canonical, &self.counters);
        }
        Ok(())
    }

    fn on_collection_started(&self) {
        // Fold before the phase flips: pending canonical refs are validated
        // against pre-collection addresses.
        let batch = self.rewrite.take_pending(&self.table, &self.counters);
        self.gc.collection_started(&self.table, &self.counters);
        self.rewrite.fold(&*self.host, &batch, &self.counters);
    }

    fn on_collection_finished(&self, reclaimed: &[ObjectAddress]) -> Result<(), AgentError> {
        self.gc
            .collection_finished(&self.table, reclaimed, &self.counters)?;

        let ConsolidationReport { retargeted, .. } =
            self.consolidator
                .run(&*self.host, &self.table, &self.diagnostics)?;
        self.counters.consolidated_slots.add(retargeted as u64);
        Ok(())
    }
}

impl<R: HostRuntime> EventSink for DedupAgent<R> {
    fn object_allocated(&self, type_handle: TypeHandle, object: ObjectAddress) {
        self.guarded("object_allocated", || self.on_allocated(type_handle, object));
    }

    fn collection_started(&self) {
        self.guarded("collection_started", || {
            self.on_collection_started();
            Ok(())
        });
    }

    fn object_moved(&self, old: ObjectAddress, new: ObjectAddress) {
        self.guarded("object_moved", || {
            self.gc.object_moved(&self.table, old, new);
            Ok(())
        });
    }

    fn objects_moved_range(&self, old_start: ObjectAddress, new_start: ObjectAddress, len: usize) {
        self.guarded("objects_moved_range", || {
            self.gc
                .objects_moved_range(&self.table, old_start, new_start, len);
            Ok(())
        });
    }

    fn collection_finished(&self, reclaimed: &[ObjectAddress]) {
        self.guarded("collection_finished", || self.on_collection_finished(reclaimed));
    }
}
