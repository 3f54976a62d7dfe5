//! GC-time consolidation.
//!
//! After a collection the agent walks reference fields of old objects and
//! points every field that holds a duplicate string at the canonical
//! instance. This folds duplicates the allocation path could not collapse:
//! strings allocated before the agent attached, and allocations let
//! through while the table was bypassed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::config::{DedupConfig, RewriteMode};
use crate::api::error::TableCorruption;
use crate::core::table::{DedupTable, Lookup};
use crate::diagnostics::DiagnosticSink;
use crate::host::{HostCapabilities, HostRuntime, ObjectAddress, ReferenceSlot, TypeHandle};
use crate::sd_emit;

/// Result of one consolidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Reference slots visited.
    pub visited: usize,
    /// Slots the runtime actually retargeted to a canonical instance.
    pub retargeted: usize,
}

pub(crate) struct Consolidator {
    enabled: AtomicBool,
    string_type: TypeHandle,
    min_generation: u8,
    min_length: usize,
    max_length: usize,
}

impl Consolidator {
    pub fn new(
        string_type: TypeHandle,
        capabilities: &HostCapabilities,
        config: &DedupConfig,
        diagnostics: &Arc<dyn DiagnosticSink>,
    ) -> Self {
        let wanted = config.consolidate_on_gc && config.rewrite_mode == RewriteMode::Auto;
        if wanted && !capabilities.can_walk_heap {
            sd_emit!(diagnostics, SD402);
        }

        Self {
            enabled: AtomicBool::new(wanted && capabilities.can_walk_heap),
            string_type,
            min_generation: config.consolidate_min_generation,
            min_length: config.min_length,
            max_length: config.max_length,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Walk the heap once. A runtime that refuses the walk turns the pass
    /// off for good.
    pub fn run<R>(
        &self,
        host: &R,
        table: &DedupTable,
        diagnostics: &Arc<dyn DiagnosticSink>,
    ) -> Result<ConsolidationReport, TableCorruption>
    where
        R: HostRuntime + ?Sized,
    {
        if !self.is_enabled() {
            return Ok(ConsolidationReport::default());
        }

        let mut failure: Option<TableCorruption> = None;

        let mut visit = |slot: ReferenceSlot| -> Option<ObjectAddress> {
            if failure.is_some() || slot.target_type != self.string_type {
                return None;
            }
            let content = host.string_contents(slot.target)?;
            let content = content.as_ref();
            if content.len() < self.min_length || content.len() > self.max_length {
                return None;
            }

            match table.resolve(slot.target, content, host) {
                Ok(Lookup::Hit(canonical)) if canonical.address() != slot.target => {
                    Some(canonical.address())
                }
                Ok(_) => None,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        };

        let walk = match host.walk_reference_slots(self.min_generation, &mut visit) {
            Ok(walk) => walk,
            Err(e) => {
                self.enabled.store(false, Ordering::Relaxed);
                sd_emit!(diagnostics, SD402, e);
                return Ok(ConsolidationReport::default());
            }
        };

        if let Some(e) = failure {
            return Err(e);
        }

        if walk.rewritten > 0 {
            log::debug!(
                "consolidation retargeted {} of {} reference slots",
                walk.rewritten,
                walk.visited
            );
        }
        Ok(ConsolidationReport {
            visited: walk.visited,
            retargeted: walk.rewritten,
        })
    }
}
