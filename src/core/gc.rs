//! Collection coordination.
//!
//! Keeps table addresses in step with the collector. Moves reported during
//! a collection are buffered and applied as one batch when it finishes;
//! until then the table is in its collecting phase and every lookup fails
//! closed.

use std::sync::Arc;

use crate::api::error::TableCorruption;
use crate::core::state::AgentCounters;
use crate::core::table::{DedupTable, Relocation};
use crate::diagnostics::DiagnosticSink;
use crate::host::{HostCapabilities, ObjectAddress};
use crate::sd_emit;
use crate::sync::mutex::Mutex;

/// Table maintenance done at the end of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries dropped because their canonical instance was reclaimed.
    pub evicted: usize,
    /// Entries moved to a new address.
    pub relocated: usize,
    /// Entries dropped by a full purge.
    pub purged: usize,
}

/// Applies collector notifications to the dedup table.
pub(crate) struct GcCoordinator {
    moves: Mutex<Vec<Relocation>>,
    purge_each_cycle: bool,
}

impl GcCoordinator {
    pub fn new(capabilities: &HostCapabilities, diagnostics: &Arc<dyn DiagnosticSink>) -> Self {
        let purge_each_cycle = !capabilities.addresses_survive_collection();
        if purge_each_cycle {
            sd_emit!(
                diagnostics,
                SD401,
                format_args!(
                    "collector {:?}, moves reported: {}, reclaims reported: {}",
                    capabilities.collector,
                    capabilities.reports_moves,
                    capabilities.reports_reclaimed
                )
            );
        }

        Self {
            moves: Mutex::new(Vec::new()),
            purge_each_cycle,
        }
    }

    /// Whether the table is emptied after every collection.
    pub fn purges_each_cycle(&self) -> bool {
        self.purge_each_cycle
    }

    /// Enter the collecting phase. Returns false if a window was already
    /// open (a move arrived first).
    pub fn collection_started(&self, table: &DedupTable, counters: &AgentCounters) -> bool {
        counters.collections.increment();
        table.begin_collection()
    }

    /// Buffer one move.
    pub fn object_moved(&self, table: &DedupTable, old: ObjectAddress, new: ObjectAddress) {
        self.record(table, Relocation::Object { old, new });
    }

    /// Buffer a block move.
    pub fn objects_moved_range(
        &self,
        table: &DedupTable,
        old_start: ObjectAddress,
        new_start: ObjectAddress,
        len: usize,
    ) {
        self.record(
            table,
            Relocation::Range {
                old_start,
                new_start,
                len,
            },
        );
    }

    fn record(&self, table: &DedupTable, relocation: Relocation) {
        // Moves outside a collection still invalidate addresses.
        if !table.is_collecting() && table.begin_collection() {
            log::debug!("move reported outside a collection; opening an implicit window");
        }
        self.moves.lock().push(relocation);
    }

    /// Finish the collection: evict reclaimed entries, apply buffered
    /// moves, purge if addresses cannot be trusted, and reopen lookups.
    ///
    /// Reclaimed addresses are pre-collection addresses, and a survivor may
    /// be moved into one of them, so eviction runs before relocation.
    pub fn collection_finished(
        &self,
        table: &DedupTable,
        reclaimed: &[ObjectAddress],
        counters: &AgentCounters,
    ) -> Result<CycleReport, TableCorruption> {
        let moves = std::mem::take(&mut *self.moves.lock());
        let mut report = CycleReport::default();

        let outcome = if self.purge_each_cycle {
            report.purged = table.purge();
            counters.purges.increment();
            Ok(())
        } else {
            table.evict(reclaimed).and_then(|evicted| {
                report.evicted = evicted;
                report.relocated = table.apply_relocations(&moves)?;
                Ok(())
            })
        };

        table.end_collection();
        outcome?;

        counters.evictions.add(report.evicted as u64);
        counters.relocations.add(report.relocated as u64);
        log::trace!(
            "collection {} finished: {} evicted, {} relocated, {} purged",
            table.epoch(),
            report.evicted,
            report.relocated,
            report.purged
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::DedupConfig;
    use crate::core::table::Lookup;
    use crate::diagnostics::CollectingSink;
    use crate::host::{CollectorKind, ContentSource};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Heap(HashMap<ObjectAddress, Vec<u8>>);

    impl Heap {
        fn put(&mut self, raw: usize, content: &str) -> ObjectAddress {
            let address = ObjectAddress::new(raw);
            self.0.insert(address, content.as_bytes().to_vec());
            address
        }
    }

    impl ContentSource for Heap {
        type Contents<'a> = &'a [u8];

        fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>> {
            self.0.get(&object).map(Vec::as_slice)
        }
    }

    fn coordinator(capabilities: HostCapabilities) -> (GcCoordinator, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let diagnostics: Arc<dyn DiagnosticSink> = sink.clone();
        (GcCoordinator::new(&capabilities, &diagnostics), sink)
    }

    #[test]
    fn test_moves_applied_at_finish() {
        let (gc, sink) = coordinator(HostCapabilities::observe_only(CollectorKind::Compacting));
        assert!(sink.codes().is_empty());
        let table = DedupTable::new(&DedupConfig::minimal());
        let counters = AgentCounters::default();
        let mut heap = Heap::default();
        let old = heap.put(0x100, "moved");
        table.lookup_or_register(old, b"moved", &heap).unwrap();

        assert!(gc.collection_started(&table, &counters));
        gc.object_moved(&table, old, ObjectAddress::new(0x40));

        let duplicate = heap.put(0x500, "moved");
        assert!(matches!(
            table.lookup_or_register(duplicate, b"moved", &heap).unwrap(),
            Lookup::Bypassed(_)
        ));

        let report = gc.collection_finished(&table, &[], &counters).unwrap();
        assert_eq!(report.relocated, 1);
        assert!(!table.is_collecting());

        let mut moved = Heap::default();
        moved.put(0x40, "moved");
        table.verify(&moved).unwrap();
    }

    #[test]
    fn test_reclaimed_address_reused_by_survivor() {
        let (gc, _) = coordinator(HostCapabilities::observe_only(CollectorKind::Compacting));
        let table = DedupTable::new(&DedupConfig::minimal());
        let counters = AgentCounters::default();
        let mut heap = Heap::default();
        let dead = heap.put(0x100, "dead");
        let live = heap.put(0x200, "live");
        table.lookup_or_register(dead, b"dead", &heap).unwrap();
        table.lookup_or_register(live, b"live", &heap).unwrap();

        gc.collection_started(&table, &counters);
        gc.object_moved(&table, live, dead);
        let report = gc.collection_finished(&table, &[dead], &counters).unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(report.relocated, 1);
        assert_eq!(table.len(), 1);

        let mut after = Heap::default();
        after.put(0x100, "live");
        table.verify(&after).unwrap();
    }

    #[test]
    fn test_implicit_window() {
        let (gc, _) = coordinator(HostCapabilities::observe_only(CollectorKind::Compacting));
        let table = DedupTable::new(&DedupConfig::minimal());
        let counters = AgentCounters::default();

        gc.objects_moved_range(
            &table,
            ObjectAddress::new(0x1000),
            ObjectAddress::new(0x2000),
            0x100,
        );
        assert!(table.is_collecting());
        assert!(!gc.collection_started(&table, &counters));
        gc.collection_finished(&table, &[], &counters).unwrap();
        assert!(!table.is_collecting());
    }

    #[test]
    fn test_purge_without_move_reports() {
        let mut caps = HostCapabilities::observe_only(CollectorKind::Compacting);
        caps.reports_moves = false;
        let (gc, sink) = coordinator(caps);
        assert!(gc.purges_each_cycle());
        assert_eq!(sink.codes(), vec!["SD401"]);

        let table = DedupTable::new(&DedupConfig::minimal());
        let counters = AgentCounters::default();
        let mut heap = Heap::default();
        let a = heap.put(0x100, "a1");
        table.lookup_or_register(a, b"a1", &heap).unwrap();

        gc.collection_started(&table, &counters);
        let report = gc.collection_finished(&table, &[], &counters).unwrap();
        assert_eq!(report.purged, 1);
        assert!(table.is_empty());
        assert_eq!(counters.purges.get(), 1);
    }
}
