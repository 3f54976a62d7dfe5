//! Allocation interception.
//!
//! Runs on the allocating thread for every object the runtime reports.
//! The non-string path is a single comparison; the string path costs one
//! hash over the payload plus one shard critical section.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::api::config::DedupConfig;
use crate::api::error::TableCorruption;
use crate::core::state::AgentCounters;
use crate::core::table::{BypassReason, CanonicalRef, DedupTable, Lookup};
use crate::diagnostics::DiagnosticSink;
use crate::host::{ContentSource, ObjectAddress, TypeHandle};
use crate::sd_emit_once;

/// A string allocation under inspection.
///
/// Borrows the payload for the duration of one callback only.
#[derive(Debug, Clone, Copy)]
pub struct CandidateAllocation<'a> {
    /// Address of the new instance.
    pub object: ObjectAddress,
    /// Its type handle.
    pub type_handle: TypeHandle,
    /// Payload bytes.
    pub content: &'a [u8],
}

impl<'a> CandidateAllocation<'a> {
    /// Describe a freshly allocated string.
    pub fn new(object: ObjectAddress, type_handle: TypeHandle, content: &'a [u8]) -> Self {
        Self {
            object,
            type_handle,
            content,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Filters allocations down to dedup candidates and looks them up.
pub(crate) struct Interceptor {
    string_type: TypeHandle,
    min_length: usize,
    max_length: usize,
    diagnostics: Arc<dyn DiagnosticSink>,
    unreadable_reported: AtomicBool,
    table_full_reported: AtomicBool,
}

impl Interceptor {
    pub fn new(
        string_type: TypeHandle,
        config: &DedupConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            string_type,
            min_length: config.min_length,
            max_length: config.max_length,
            diagnostics,
            unreadable_reported: AtomicBool::new(false),
            table_full_reported: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn is_string(&self, type_handle: TypeHandle) -> bool {
        type_handle == self.string_type
    }

    pub fn string_type(&self) -> TypeHandle {
        self.string_type
    }

    /// Record a string whose payload could not be read.
    pub fn unreadable(&self, object: ObjectAddress, counters: &AgentCounters) {
        counters.unreadable.increment();
        sd_emit_once!(
            self.unreadable_reported,
            self.diagnostics,
            SD101,
            format_args!("object {}", object)
        );
    }

    /// Look a candidate up in the table.
    ///
    /// Returns the canonical instance when the candidate is a duplicate of
    /// it; `None` when the candidate became canonical or was let through.
    pub fn intercept<S>(
        &self,
        candidate: &CandidateAllocation<'_>,
        table: &DedupTable,
        source: &S,
        counters: &AgentCounters,
    ) -> Result<Option<CanonicalRef>, TableCorruption>
    where
        S: ContentSource + ?Sized,
    {
        counters.strings_seen.increment();

        let len = candidate.len();
        if len < self.min_length || len > self.max_length {
            counters.filtered.increment();
            return Ok(None);
        }

        match table.lookup_or_register(candidate.object, candidate.content, source)? {
            Lookup::Hit(canonical) => {
                counters.hits.increment();
                counters.duplicate_bytes.add(len as u64);
                Ok(Some(canonical))
            }
            Lookup::Miss(_) => {
                counters.misses.increment();
                Ok(None)
            }
            Lookup::Bypassed(reason) => {
                counters.bypassed.increment();
                if reason == BypassReason::TableFull {
                    sd_emit_once!(
                        self.table_full_reported,
                        self.diagnostics,
                        SD202,
                        format_args!("{} entries", table.len())
                    );
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use std::collections::HashMap;

    const STRING: TypeHandle = TypeHandle::new(0x51);

    #[derive(Default)]
    struct Heap(HashMap<ObjectAddress, Vec<u8>>);

    impl ContentSource for Heap {
        type Contents<'a> = &'a [u8];

        fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>> {
            self.0.get(&object).map(Vec::as_slice)
        }
    }

    fn setup(config: DedupConfig) -> (Interceptor, DedupTable, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let interceptor = Interceptor::new(STRING, &config, sink.clone());
        (interceptor, DedupTable::new(&config), sink)
    }

    #[test]
    fn test_type_filter() {
        let (interceptor, _, _) = setup(DedupConfig::minimal());
        assert!(interceptor.is_string(STRING));
        assert!(!interceptor.is_string(TypeHandle::new(0x52)));
    }

    #[test]
    fn test_duplicate_returns_canonical() {
        let (interceptor, table, _) = setup(DedupConfig::minimal());
        let counters = AgentCounters::default();
        let mut heap = Heap::default();
        heap.0.insert(ObjectAddress::new(0x10), b"dup".to_vec());
        heap.0.insert(ObjectAddress::new(0x20), b"dup".to_vec());

        let first = CandidateAllocation::new(ObjectAddress::new(0x10), STRING, b"dup");
        let second = CandidateAllocation::new(ObjectAddress::new(0x20), STRING, b"dup");

        assert_eq!(interceptor.intercept(&first, &table, &heap, &counters).unwrap(), None);
        let canonical = interceptor
            .intercept(&second, &table, &heap, &counters)
            .unwrap()
            .unwrap();
        assert_eq!(canonical.address(), ObjectAddress::new(0x10));
        assert_eq!(counters.hits.get(), 1);
        assert_eq!(counters.misses.get(), 1);
        assert_eq!(counters.duplicate_bytes.get(), 3);
    }

    #[test]
    fn test_length_filter() {
        let (interceptor, table, _) = setup(DedupConfig::minimal().with_length_range(2, 4));
        let counters = AgentCounters::default();
        let heap = Heap::default();

        for content in [&b"x"[..], b"toolong"] {
            let candidate = CandidateAllocation::new(ObjectAddress::new(0x10), STRING, content);
            assert_eq!(interceptor.intercept(&candidate, &table, &heap, &counters).unwrap(), None);
        }
        assert_eq!(counters.filtered.get(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_full_reported_once() {
        let (interceptor, table, sink) = setup(DedupConfig::minimal().with_max_entries(1));
        let counters = AgentCounters::default();
        let heap = Heap::default();

        for (i, content) in [&b"aa"[..], b"bb", b"cc"].into_iter().enumerate() {
            let candidate =
                CandidateAllocation::new(ObjectAddress::new(0x10 * (i + 1)), STRING, content);
            interceptor.intercept(&candidate, &table, &heap, &counters).unwrap();
        }
        assert_eq!(counters.bypassed.get(), 2);
        assert_eq!(sink.codes(), vec!["SD202"]);
    }
}
