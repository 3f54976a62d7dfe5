//! Dedup statistics.

use crate::core::rewrite::RewriteStrategy;
use crate::core::state::AgentStatus;
use crate::util::size::format_bytes;

/// Snapshot of agent activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupStats {
    /// Agent status when the snapshot was taken.
    pub status: AgentStatus,

    /// Rewrite strategy in effect.
    pub strategy: RewriteStrategy,

    /// Allocation callbacks received.
    pub allocations_seen: u64,

    /// Of those, string allocations.
    pub strings_seen: u64,

    /// Strings skipped by the length filters.
    pub filtered: u64,

    /// Strings whose payload could not be read.
    pub unreadable: u64,

    /// Lookups that found an existing canonical instance.
    pub hits: u64,

    /// Lookups that registered a new canonical instance.
    pub misses: u64,

    /// Lookups that failed closed.
    pub bypassed: u64,

    /// Payload bytes held by duplicates found at allocation time.
    pub duplicate_bytes: u64,

    /// Duplicates redirected immediately.
    pub redirected: u64,

    /// Duplicates queued for folding.
    pub deferred: u64,

    /// Substitutions folded by the collector.
    pub folded: u64,

    /// Duplicates counted without any rewrite.
    pub observed: u64,

    /// Rewrites skipped because the canonical reference went stale.
    pub dropped_stale: u64,

    /// Deferred substitutions lost to a full queue.
    pub queue_overflows: u64,

    /// Substitutions waiting for the next collection.
    pub pending: usize,

    /// Canonical entries.
    pub entries: usize,

    /// Peak canonical entries.
    pub peak_entries: usize,

    /// Collections observed.
    pub collections: u64,

    /// Entries dropped because their instance was reclaimed.
    pub evictions: u64,

    /// Entries moved by the collector.
    pub relocations: u64,

    /// Full table purges.
    pub purges: u64,

    /// Reference slots retargeted by consolidation.
    pub consolidated_slots: u64,
}

impl DedupStats {
    /// Duplicates found, however they were handled.
    pub fn duplicates(&self) -> u64 {
        self.hits
    }

    /// Fraction of examined strings that were duplicates.
    pub fn hit_ratio(&self) -> f64 {
        let examined = self.hits + self.misses;
        if examined == 0 {
            return 0.0;
        }
        self.hits as f64 / examined as f64
    }
}

impl std::fmt::Display for DedupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "String Dedup Statistics ({}, {}):", self.status, self.strategy)?;
        writeln!(f, "  Allocations:     {}", self.allocations_seen)?;
        writeln!(f, "  Strings:         {}", self.strings_seen)?;
        writeln!(f, "  Hits:            {} ({:.1}%)", self.hits, self.hit_ratio() * 100.0)?;
        writeln!(f, "  Misses:          {}", self.misses)?;
        writeln!(f, "  Bypassed:        {}", self.bypassed)?;
        writeln!(f, "  Duplicate bytes: {}", format_bytes(self.duplicate_bytes))?;
        writeln!(f, "  Redirected:      {}", self.redirected)?;
        writeln!(f, "  Deferred:        {} ({} folded, {} pending)", self.deferred, self.folded, self.pending)?;
        writeln!(f, "  Observed only:   {}", self.observed)?;
        writeln!(f, "  Entries:         {} (peak {})", self.entries, self.peak_entries)?;
        writeln!(f, "  Collections:     {}", self.collections)?;
        writeln!(f, "  Evictions:       {}", self.evictions)?;
        writeln!(f, "  Relocations:     {}", self.relocations)?;
        writeln!(f, "  Consolidated:    {}", self.consolidated_slots)?;
        Ok(())
    }
}
