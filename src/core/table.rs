//! Content-addressed dedup table.
//!
//! Maps payload hashes to the single canonical live instance holding that
//! payload. The table never owns an instance: entries are (address, token)
//! pairs kept in step with the collector through [`DedupTable::apply_relocations`]
//! and [`DedupTable::evict`].
//!
//! The address index is split by address into its own set of locks. Lock
//! order is always content shard before index shard. Paths that start from
//! an address read the index, drop it, and only then take a content shard.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use nohash_hasher::BuildNoHashHasher;

use crate::api::config::{DedupConfig, LockPolicy};
use crate::api::error::TableCorruption;
use crate::core::hash::{content_hash, ContentHasher};
use crate::host::{ContentSource, ObjectAddress};
use crate::sync::atomics::AtomicGauge;
use crate::sync::mutex::{Mutex, MutexGuard};

/// A non-owning, liveness-tracked reference to a canonical instance.
///
/// The token changes whenever the entry is created or relocated, so a
/// reference handed out before a move can be recognized as stale without
/// dereferencing the old address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalRef {
    address: ObjectAddress,
    token: u64,
    hash: u64,
}

impl CanonicalRef {
    /// Address of the canonical instance when this reference was issued.
    pub fn address(&self) -> ObjectAddress {
        self.address
    }

    /// Validation token.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Content hash, which names the shard holding the entry.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Why a lookup neither hit nor registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// A collection is in progress; stored addresses may be stale.
    Collecting,
    /// The entry limit was reached.
    TableFull,
    /// The shard was busy and the lock policy said not to wait.
    Contended,
}

/// Result of [`DedupTable::lookup_or_register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Identical content already has a canonical instance.
    Hit(CanonicalRef),
    /// First sighting; the candidate is now canonical.
    Miss(CanonicalRef),
    /// Failed closed; the candidate was neither compared nor registered.
    Bypassed(BypassReason),
}

/// A relocation reported by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// A single object moved.
    Object {
        /// Address before the collection.
        old: ObjectAddress,
        /// Address after the collection.
        new: ObjectAddress,
    },
    /// A contiguous block of objects moved by the same offset.
    Range {
        /// Start of the block before the collection.
        old_start: ObjectAddress,
        /// Start of the block after the collection.
        new_start: ObjectAddress,
        /// Block length in bytes.
        len: usize,
    },
}

/// Content with repeated sightings, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateReport {
    /// Canonical instance.
    pub address: ObjectAddress,
    /// Payload length in bytes.
    pub length: usize,
    /// Duplicates seen since the entry was created.
    pub duplicates: u64,
}

#[derive(Debug)]
struct Entry {
    address: ObjectAddress,
    token: u64,
    len: usize,
    duplicates: u64,
}

impl Entry {
    fn canonical_ref(&self, hash: u64) -> CanonicalRef {
        CanonicalRef {
            address: self.address,
            token: self.token,
            hash,
        }
    }
}

/// Canonical address -> content hash, for one slice of the address space
type IndexShard = BTreeMap<ObjectAddress, u64>;

#[derive(Default)]
struct Shard {
    buckets: HashMap<u64, Vec<Entry>, BuildNoHashHasher<u64>>,
}

impl Shard {
    fn remove(&mut self, hash: u64, address: ObjectAddress) -> bool {
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|e| e.address == address) else {
            return false;
        };
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        true
    }

    fn entry_mut(&mut self, hash: u64, address: ObjectAddress) -> Option<&mut Entry> {
        self.buckets
            .get_mut(&hash)?
            .iter_mut()
            .find(|e| e.address == address)
    }

    fn entry_by_token_mut(&mut self, hash: u64, token: u64) -> Option<&mut Entry> {
        self.buckets
            .get_mut(&hash)?
            .iter_mut()
            .find(|e| e.token == token)
    }
}

/// Process-wide table of canonical string instances.
pub struct DedupTable {
    shards: Box<[Mutex<Shard>]>,
    shard_mask: usize,

    /// Address index, sharded by address with the same mask
    index: Box<[Mutex<IndexShard>]>,

    hasher: ContentHasher,
    lock_policy: LockPolicy,
    max_entries: usize,

    len: AtomicGauge,
    peak: AtomicGauge,
    next_token: AtomicU64,

    /// Even while idle, odd during a collection; half of it counts collections.
    phase: AtomicU64,
}

impl DedupTable {
    /// Create a table sized by `config`.
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_hasher(config, content_hash)
    }

    /// Create a table with a custom content hash.
    pub fn with_hasher(config: &DedupConfig, hasher: ContentHasher) -> Self {
        let shard_count = config.effective_shard_count();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let index = (0..shard_count)
            .map(|_| Mutex::new(IndexShard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            shard_mask: shard_count - 1,
            index,
            hasher,
            lock_policy: config.lock_policy,
            max_entries: config.max_entries,
            len: AtomicGauge::new(0),
            peak: AtomicGauge::new(0),
            next_token: AtomicU64::new(1),
            phase: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &Mutex<Shard> {
        &self.shards[(hash >> 40) as usize & self.shard_mask]
    }

    #[inline]
    fn index_for(&self, address: ObjectAddress) -> &Mutex<IndexShard> {
        // Objects are at least 8-byte aligned.
        &self.index[(address.get() >> 3) & self.shard_mask]
    }

    fn lock_shard(&self, hash: u64) -> Option<MutexGuard<'_, Shard>> {
        lock_with(self.shard_for(hash), self.lock_policy)
    }

    fn issue_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Find the canonical instance for `content`, registering `candidate`
    /// if there is none.
    ///
    /// Registration is linearizable per content: the shard lock is held
    /// from the bucket scan to the insert, so racing threads converge on
    /// one canonical survivor and every loser sees a `Hit`.
    pub fn lookup_or_register<S>(
        &self,
        candidate: ObjectAddress,
        content: &[u8],
        source: &S,
    ) -> Result<Lookup, TableCorruption>
    where
        S: ContentSource + ?Sized,
    {
        self.lookup_inner(candidate, content, source, false)
    }

    /// Find the canonical instance for a live object that may itself be
    /// canonical already.
    ///
    /// Used by heap walks, which revisit registered instances. A canonical
    /// candidate resolves to its own entry, and hits do not bump the
    /// duplicate counters.
    pub fn resolve<S>(
        &self,
        candidate: ObjectAddress,
        content: &[u8],
        source: &S,
    ) -> Result<Lookup, TableCorruption>
    where
        S: ContentSource + ?Sized,
    {
        self.lookup_inner(candidate, content, source, true)
    }

    fn lookup_inner<S>(
        &self,
        candidate: ObjectAddress,
        content: &[u8],
        source: &S,
        revisit: bool,
    ) -> Result<Lookup, TableCorruption>
    where
        S: ContentSource + ?Sized,
    {
        if self.is_collecting() {
            return Ok(Lookup::Bypassed(BypassReason::Collecting));
        }

        let hash = (self.hasher)(content);
        let Some(mut shard) = self.lock_shard(hash) else {
            return Ok(Lookup::Bypassed(BypassReason::Contended));
        };

        // A collection may have started while we waited.
        if self.is_collecting() {
            return Ok(Lookup::Bypassed(BypassReason::Collecting));
        }

        if let Some(bucket) = shard.buckets.get_mut(&hash) {
            let mut found: Option<usize> = None;

            for (pos, entry) in bucket.iter().enumerate() {
                if entry.address == candidate {
                    if revisit {
                        return Ok(Lookup::Hit(entry.canonical_ref(hash)));
                    }
                    return Err(TableCorruption::AddressReused { address: candidate });
                }
                if entry.len != content.len() {
                    continue;
                }
                let Some(existing) = source.string_contents(entry.address) else {
                    continue;
                };
                if existing.as_ref() != content {
                    continue;
                }
                if let Some(first) = found {
                    return Err(TableCorruption::DuplicateCanonical {
                        hash,
                        first: bucket[first].address,
                        second: entry.address,
                    });
                }
                found = Some(pos);
            }

            if let Some(pos) = found {
                let entry = &mut bucket[pos];
                if !revisit {
                    entry.duplicates += 1;
                }
                return Ok(Lookup::Hit(entry.canonical_ref(hash)));
            }
        }

        // Reserve before inserting so the limit holds across shards.
        let Some(len) = self.len.try_add(1, self.max_entries) else {
            return Ok(Lookup::Bypassed(BypassReason::TableFull));
        };

        {
            let Some(mut index) = lock_with(self.index_for(candidate), self.lock_policy) else {
                self.len.sub(1);
                return Ok(Lookup::Bypassed(BypassReason::Contended));
            };
            if index.contains_key(&candidate) {
                self.len.sub(1);
                return Err(TableCorruption::AddressReused { address: candidate });
            }
            index.insert(candidate, hash);
        }

        let entry = Entry {
            address: candidate,
            token: self.issue_token(),
            len: content.len(),
            duplicates: 0,
        };
        let canonical = entry.canonical_ref(hash);
        shard.buckets.entry(hash).or_default().push(entry);
        self.peak.update_max(len);

        Ok(Lookup::Miss(canonical))
    }

    /// Check that `canonical` still names a registered, unmoved entry.
    ///
    /// Takes only the entry's shard, under the configured lock policy. A
    /// busy shard under [`LockPolicy::SkipWhenContended`] reads as stale.
    pub fn is_current(&self, canonical: &CanonicalRef) -> bool {
        if self.is_collecting() {
            return false;
        }
        let Some(mut shard) = self.lock_shard(canonical.hash) else {
            return false;
        };
        shard
            .entry_mut(canonical.hash, canonical.address)
            .map_or(false, |e| e.token == canonical.token)
    }

    /// Move the entry registered at `old`, if any, to `new`.
    pub fn relocate(&self, old: ObjectAddress, new: ObjectAddress) -> Result<bool, TableCorruption> {
        Ok(self.apply_relocations(&[Relocation::Object { old, new }])? == 1)
    }

    /// Move every entry inside `old_start..old_start + len` by the same offset.
    pub fn relocate_range(
        &self,
        old_start: ObjectAddress,
        new_start: ObjectAddress,
        len: usize,
    ) -> Result<usize, TableCorruption> {
        self.apply_relocations(&[Relocation::Range {
            old_start,
            new_start,
            len,
        }])
    }

    /// Apply a batch of relocations reported by one collection.
    ///
    /// Every `old` address refers to the layout before the collection, so
    /// all old keys leave the index before any new key enters it. Returns
    /// the number of entries relocated.
    pub fn apply_relocations(&self, relocations: &[Relocation]) -> Result<usize, TableCorruption> {
        if relocations.is_empty() {
            return Ok(0);
        }

        let mut moved: Vec<(ObjectAddress, ObjectAddress, u64)> = Vec::new();
        for relocation in relocations {
            match *relocation {
                Relocation::Object { old, new } => {
                    if let Some(hash) = self.index_for(old).lock().remove(&old) {
                        moved.push((old, new, hash));
                    }
                }
                Relocation::Range { old_start, new_start, len } => {
                    let end = ObjectAddress::new(old_start.get().saturating_add(len));
                    for index in self.index.iter() {
                        let mut index = index.lock();
                        let hits: Vec<(ObjectAddress, usize, u64)> = index
                            .range(old_start..end)
                            .filter_map(|(addr, hash)| {
                                Some((*addr, addr.offset_in(old_start, len)?, *hash))
                            })
                            .collect();
                        for (old, offset, hash) in hits {
                            index.remove(&old);
                            moved.push((old, ObjectAddress::new(new_start.get() + offset), hash));
                        }
                    }
                }
            }
        }

        // Resolve every entry by its old address before rewriting any of
        // them: a new address may equal another entry's old one.
        let mut tokens = Vec::with_capacity(moved.len());
        for &(old, _, hash) in &moved {
            let mut shard = self.shard_for(hash).lock();
            match shard.entry_mut(hash, old) {
                Some(entry) => tokens.push(entry.token),
                None => return Err(TableCorruption::IndexMismatch { address: old }),
            }
        }

        for (&(old, new, hash), token) in moved.iter().zip(tokens) {
            let fresh = self.issue_token();
            let mut shard = self.shard_for(hash).lock();
            match shard.entry_by_token_mut(hash, token) {
                Some(entry) => {
                    entry.address = new;
                    entry.token = fresh;
                }
                None => return Err(TableCorruption::IndexMismatch { address: old }),
            }
        }

        for &(_, new, hash) in &moved {
            if self.index_for(new).lock().insert(new, hash).is_some() {
                return Err(TableCorruption::IndexMismatch { address: new });
            }
        }

        Ok(moved.len())
    }

    /// Drop entries whose canonical instance was reclaimed.
    ///
    /// Addresses that were never canonical are ignored. Returns the number
    /// of entries removed.
    pub fn evict(&self, reclaimed: &[ObjectAddress]) -> Result<usize, TableCorruption> {
        let mut removed = 0;
        for &address in reclaimed {
            let Some(hash) = self.index_for(address).lock().remove(&address) else {
                continue;
            };
            if !self.shard_for(hash).lock().remove(hash, address) {
                return Err(TableCorruption::IndexMismatch { address });
            }
            removed += 1;
        }
        self.len.sub(removed);
        Ok(removed)
    }

    /// Forget every entry.
    pub fn purge(&self) -> usize {
        let mut removed = 0;
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.lock()).collect();
        for shard in guards.iter_mut() {
            removed += shard.buckets.values().map(Vec::len).sum::<usize>();
            shard.buckets.clear();
        }
        for index in self.index.iter() {
            index.lock().clear();
        }
        drop(guards);
        self.len.set(0);
        removed
    }

    /// Enter the collecting phase. Returns false if already collecting.
    pub fn begin_collection(&self) -> bool {
        let mut phase = self.phase.load(Ordering::Acquire);
        loop {
            if phase & 1 == 1 {
                return false;
            }
            match self.phase.compare_exchange_weak(
                phase,
                phase + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(p) => phase = p,
            }
        }
    }

    /// Leave the collecting phase. Returns false if no collection was open.
    pub fn end_collection(&self) -> bool {
        let mut phase = self.phase.load(Ordering::Acquire);
        loop {
            if phase & 1 == 0 {
                return false;
            }
            match self.phase.compare_exchange_weak(
                phase,
                phase + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(p) => phase = p,
            }
        }
    }

    /// Whether a collection is in progress.
    #[inline]
    pub fn is_collecting(&self) -> bool {
        self.phase.load(Ordering::Acquire) & 1 == 1
    }

    /// Number of collections started so far.
    pub fn epoch(&self) -> u64 {
        (self.phase.load(Ordering::Acquire) + 1) / 2
    }

    /// Number of canonical entries.
    pub fn len(&self) -> usize {
        self.len.get()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest entry count observed.
    pub fn peak_len(&self) -> usize {
        self.peak.get()
    }

    /// The `n` entries with the most duplicates, most duplicated first.
    pub fn top_duplicates(&self, n: usize) -> Vec<DuplicateReport> {
        let mut reports = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            reports.extend(
                shard
                    .buckets
                    .values()
                    .flatten()
                    .filter(|e| e.duplicates > 0)
                    .map(|e| DuplicateReport {
                        address: e.address,
                        length: e.len,
                        duplicates: e.duplicates,
                    }),
            );
        }
        reports.sort_by(|a, b| b.duplicates.cmp(&a.duplicates).then(a.address.cmp(&b.address)));
        reports.truncate(n);
        reports
    }

    /// Full consistency check between buckets, index and content.
    ///
    /// Meant for quiescent points; concurrent registrations may be reported
    /// as mismatches.
    pub fn verify<S>(&self, source: &S) -> Result<(), TableCorruption>
    where
        S: ContentSource + ?Sized,
    {
        let mut index = IndexShard::new();
        for shard in self.index.iter() {
            index.extend(shard.lock().iter().map(|(addr, hash)| (*addr, *hash)));
        }
        let mut seen = std::collections::HashSet::new();

        for shard in self.shards.iter() {
            let shard = shard.lock();
            for (&hash, bucket) in &shard.buckets {
                for (i, entry) in bucket.iter().enumerate() {
                    seen.insert(entry.address);
                    if index.get(&entry.address) != Some(&hash) {
                        return Err(TableCorruption::IndexMismatch {
                            address: entry.address,
                        });
                    }
                    let Some(content) = source.string_contents(entry.address) else {
                        continue;
                    };
                    for other in &bucket[i + 1..] {
                        if other.len != entry.len {
                            continue;
                        }
                        let same = source
                            .string_contents(other.address)
                            .map_or(false, |c| c.as_ref() == content.as_ref());
                        if same {
                            return Err(TableCorruption::DuplicateCanonical {
                                hash,
                                first: entry.address,
                                second: other.address,
                            });
                        }
                    }
                }
            }
        }

        match index.keys().find(|address| !seen.contains(*address)) {
            Some(&stray) => Err(TableCorruption::IndexMismatch { address: stray }),
            None => Ok(()),
        }
    }
}

fn lock_with<T>(mutex: &Mutex<T>, policy: LockPolicy) -> Option<MutexGuard<'_, T>> {
    match policy {
        LockPolicy::Wait => Some(mutex.lock()),
        LockPolicy::SkipWhenContended => mutex.try_lock(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Address -> payload map standing in for a managed heap.
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

    fn table() -> DedupTable {
        DedupTable::new(&DedupConfig::minimal())
    }

    fn colliding_table() -> DedupTable {
        DedupTable::with_hasher(&DedupConfig::minimal(), |_| 7)
    }

    #[test]
    fn test_miss_then_hit() {
        let table = table();
        let mut heap = Heap::default();
        let first = heap.put(0x100, "hello");
        let second = heap.put(0x200, "hello");

        let miss = table.lookup_or_register(first, b"hello", &heap).unwrap();
        let Lookup::Miss(canonical) = miss else {
            panic!("expected miss, got {:?}", miss);
        };
        assert_eq!(canonical.address(), first);

        let hit = table.lookup_or_register(second, b"hello", &heap).unwrap();
        assert_eq!(hit, Lookup::Hit(canonical));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_repeated_lookups_are_idempotent() {
        let table = table();
        let mut heap = Heap::default();
        let first = heap.put(0x100, "same");
        table.lookup_or_register(first, b"same", &heap).unwrap();

        let a = heap.put(0x200, "same");
        let b = heap.put(0x300, "same");
        let hit_a = table.lookup_or_register(a, b"same", &heap).unwrap();
        let hit_b = table.lookup_or_register(b, b"same", &heap).unwrap();
        assert_eq!(hit_a, hit_b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_collisions_compare_bytes() {
        let table = colliding_table();
        let mut heap = Heap::default();
        let abc = heap.put(0x100, "abc");
        let xyz = heap.put(0x200, "xyz");

        assert!(matches!(
            table.lookup_or_register(abc, b"abc", &heap).unwrap(),
            Lookup::Miss(_)
        ));
        assert!(matches!(
            table.lookup_or_register(xyz, b"xyz", &heap).unwrap(),
            Lookup::Miss(_)
        ));
        assert_eq!(table.len(), 2);

        let again = heap.put(0x300, "xyz");
        match table.lookup_or_register(again, b"xyz", &heap).unwrap() {
            Lookup::Hit(canonical) => assert_eq!(canonical.address(), xyz),
            other => panic!("expected hit on xyz, got {:?}", other),
        }
    }

    #[test]
    fn test_relocation_then_lookup_returns_new_address() {
        let table = table();
        let mut heap = Heap::default();
        let old = heap.put(0x100, "moving");
        let Lookup::Miss(before) = table.lookup_or_register(old, b"moving", &heap).unwrap() else {
            panic!("expected miss");
        };

        heap.0.remove(&old);
        let new = heap.put(0x900, "moving");
        table.begin_collection();
        assert!(table.relocate(old, new).unwrap());
        table.end_collection();

        assert!(!table.is_current(&before));
        let duplicate = heap.put(0x500, "moving");
        match table.lookup_or_register(duplicate, b"moving", &heap).unwrap() {
            Lookup::Hit(canonical) => {
                assert_eq!(canonical.address(), new);
                assert!(table.is_current(&canonical));
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_relocations_apply_as_one_batch() {
        // b moves into the slot a vacated.
        let table = table();
        let mut heap = Heap::default();
        let a = heap.put(0x100, "first");
        let b = heap.put(0x200, "second");
        table.lookup_or_register(a, b"first", &heap).unwrap();
        table.lookup_or_register(b, b"second", &heap).unwrap();

        let moves = [
            Relocation::Object { old: b, new: a },
            Relocation::Object {
                old: a,
                new: ObjectAddress::new(0x50),
            },
        ];
        table.begin_collection();
        assert_eq!(table.apply_relocations(&moves).unwrap(), 2);
        table.end_collection();

        let mut moved_heap = Heap::default();
        moved_heap.put(0x50, "first");
        moved_heap.put(0x100, "second");
        table.verify(&moved_heap).unwrap();
    }

    #[test]
    fn test_range_relocation() {
        let table = table();
        let mut heap = Heap::default();
        let inside = heap.put(0x1010, "inside");
        let outside = heap.put(0x3000, "outside");
        table.lookup_or_register(inside, b"inside", &heap).unwrap();
        table.lookup_or_register(outside, b"outside", &heap).unwrap();

        let relocated = table
            .relocate_range(ObjectAddress::new(0x1000), ObjectAddress::new(0x8000), 0x100)
            .unwrap();
        assert_eq!(relocated, 1);

        let mut moved_heap = Heap::default();
        moved_heap.put(0x8010, "inside");
        moved_heap.put(0x3000, "outside");
        table.verify(&moved_heap).unwrap();
    }

    #[test]
    fn test_eviction_reseeds() {
        let table = table();
        let mut heap = Heap::default();
        let first = heap.put(0x100, "hello");
        table.lookup_or_register(first, b"hello", &heap).unwrap();

        assert_eq!(table.evict(&[first, ObjectAddress::new(0xdead)]).unwrap(), 1);
        heap.0.remove(&first);
        assert!(table.is_empty());

        let next = heap.put(0x200, "hello");
        match table.lookup_or_register(next, b"hello", &heap).unwrap() {
            Lookup::Miss(canonical) => assert_eq!(canonical.address(), next),
            other => panic!("expected miss, got {:?}", other),
        }
    }

    #[test]
    fn test_collecting_phase_fails_closed() {
        let table = table();
        let mut heap = Heap::default();
        let first = heap.put(0x100, "hello");
        table.lookup_or_register(first, b"hello", &heap).unwrap();

        assert!(table.begin_collection());
        assert!(!table.begin_collection());
        let second = heap.put(0x200, "hello");
        assert_eq!(
            table.lookup_or_register(second, b"hello", &heap).unwrap(),
            Lookup::Bypassed(BypassReason::Collecting)
        );
        assert!(table.end_collection());
        assert_eq!(table.epoch(), 1);
    }

    #[test]
    fn test_table_full_bypasses() {
        let table = DedupTable::new(&DedupConfig::minimal().with_max_entries(1));
        let mut heap = Heap::default();
        let a = heap.put(0x100, "a1");
        let b = heap.put(0x200, "b2");
        table.lookup_or_register(a, b"a1", &heap).unwrap();
        assert_eq!(
            table.lookup_or_register(b, b"b2", &heap).unwrap(),
            Lookup::Bypassed(BypassReason::TableFull)
        );
    }

    #[test]
    fn test_address_reuse_is_corruption() {
        let table = table();
        let mut heap = Heap::default();
        let a = heap.put(0x100, "first");
        table.lookup_or_register(a, b"first", &heap).unwrap();

        heap.put(0x100, "other");
        let err = table.lookup_or_register(a, b"other", &heap).unwrap_err();
        assert_eq!(err, TableCorruption::AddressReused { address: a });
    }

    #[test]
    fn test_resolve_accepts_canonical_candidate() {
        let table = table();
        let mut heap = Heap::default();
        let first = heap.put(0x100, "walked");
        let second = heap.put(0x200, "walked");

        let Lookup::Miss(canonical) = table.resolve(first, b"walked", &heap).unwrap() else {
            panic!("expected miss");
        };
        assert_eq!(table.resolve(first, b"walked", &heap).unwrap(), Lookup::Hit(canonical));
        assert_eq!(table.resolve(second, b"walked", &heap).unwrap(), Lookup::Hit(canonical));
        assert!(table.top_duplicates(1).is_empty());
    }

    #[test]
    fn test_purge() {
        let table = table();
        let mut heap = Heap::default();
        for i in 0..10 {
            let content = format!("s{}", i);
            let address = heap.put(0x100 * (i + 1), &content);
            table.lookup_or_register(address, content.as_bytes(), &heap).unwrap();
        }
        assert_eq!(table.purge(), 10);
        assert!(table.is_empty());
        assert_eq!(table.peak_len(), 10);
        table.verify(&heap).unwrap();
    }

    #[test]
    fn test_top_duplicates() {
        let table = table();
        let mut heap = Heap::default();
        let hot = heap.put(0x100, "hot");
        let warm = heap.put(0x200, "warm");
        table.lookup_or_register(hot, b"hot", &heap).unwrap();
        table.lookup_or_register(warm, b"warm", &heap).unwrap();
        for i in 0..3 {
            let dup = heap.put(0x1000 + i * 0x10, "hot");
            table.lookup_or_register(dup, b"hot", &heap).unwrap();
        }
        let dup = heap.put(0x2000, "warm");
        table.lookup_or_register(dup, b"warm", &heap).unwrap();

        let top = table.top_duplicates(1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].address, hot);
        assert_eq!(top[0].duplicates, 3);
    }

    #[test]
    fn test_concurrent_registration_single_survivor() {
        let table = Arc::new(table());
        let mut heap = Heap::default();
        let addresses: Vec<_> = (0..8).map(|i| heap.put(0x100 * (i + 1), "race")).collect();
        let heap = Arc::new(heap);

        let handles: Vec<_> = addresses
            .into_iter()
            .map(|address| {
                let table = Arc::clone(&table);
                let heap = Arc::clone(&heap);
                std::thread::spawn(move || table.lookup_or_register(address, b"race", &*heap).unwrap())
            })
            .collect();

        let results: Vec<Lookup> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let misses: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Lookup::Miss(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(misses.len(), 1);
        for result in &results {
            match result {
                Lookup::Hit(c) => assert_eq!(*c, misses[0]),
                Lookup::Miss(_) => {}
                Lookup::Bypassed(reason) => panic!("unexpected bypass {:?}", reason),
            }
        }
        assert_eq!(table.len(), 1);
        table.verify(&*heap).unwrap();
    }

    fn skipping_table() -> DedupTable {
        DedupTable::new(&DedupConfig::minimal().with_lock_policy(LockPolicy::SkipWhenContended))
    }

    #[test]
    fn test_contended_shard_bypasses_under_skip_policy() {
        let table = skipping_table();
        let mut heap = Heap::default();
        let object = heap.put(0x100, "busy");
        let hash = content_hash(b"busy");

        let held = table.shard_for(hash).lock();
        let result = table.lookup_or_register(object, b"busy", &heap).unwrap();
        assert_eq!(result, Lookup::Bypassed(BypassReason::Contended));
        drop(held);

        assert_eq!(table.len(), 0);
        assert!(matches!(
            table.lookup_or_register(object, b"busy", &heap).unwrap(),
            Lookup::Miss(_)
        ));
    }

    #[test]
    fn test_contended_index_releases_reserved_slot() {
        let table = skipping_table();
        let mut heap = Heap::default();
        let object = heap.put(0x100, "busy");

        let held = table.index_for(object).lock();
        let result = table.lookup_or_register(object, b"busy", &heap).unwrap();
        assert_eq!(result, Lookup::Bypassed(BypassReason::Contended));
        drop(held);

        assert_eq!(table.len(), 0);
        table.verify(&heap).unwrap();
    }

    #[test]
    fn test_is_current_fails_closed_on_busy_shard() {
        let table = skipping_table();
        let mut heap = Heap::default();
        let object = heap.put(0x100, "canon");
        let Lookup::Miss(canonical) = table.lookup_or_register(object, b"canon", &heap).unwrap() else {
            panic!("expected miss");
        };

        let held = table.shard_for(canonical.hash()).lock();
        assert!(!table.is_current(&canonical));
        drop(held);
        assert!(table.is_current(&canonical));
    }

    #[test]
    fn test_is_current_does_not_touch_index() {
        let table = Arc::new(table());
        let mut heap = Heap::default();
        let object = heap.put(0x100, "canon");
        let Lookup::Miss(canonical) = table.lookup_or_register(object, b"canon", &heap).unwrap() else {
            panic!("expected miss");
        };

        let held = table.index_for(object).lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let checker = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || tx.send(table.is_current(&canonical)).unwrap())
        };
        let current = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(held);
        checker.join().unwrap();

        assert_eq!(current, Ok(true));
    }

    #[test]
    fn test_entry_limit_is_exact_under_races() {
        let table = Arc::new(DedupTable::new(&DedupConfig::minimal().with_max_entries(4)));
        let mut heap = Heap::default();
        let objects: Vec<_> = (0..16)
            .map(|i| (heap.put(0x100 * (i + 1), &format!("text-{}", i)), format!("text-{}", i)))
            .collect();
        let heap = Arc::new(heap);

        let handles: Vec<_> = objects
            .into_iter()
            .map(|(address, text)| {
                let table = Arc::clone(&table);
                let heap = Arc::clone(&heap);
                std::thread::spawn(move || {
                    table.lookup_or_register(address, text.as_bytes(), &*heap).unwrap()
                })
            })
            .collect();

        let results: Vec<Lookup> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let misses = results.iter().filter(|r| matches!(r, Lookup::Miss(_))).count();
        let full = results
            .iter()
            .filter(|r| **r == Lookup::Bypassed(BypassReason::TableFull))
            .count();

        assert_eq!(misses, 4);
        assert_eq!(full, 12);
        assert_eq!(table.len(), 4);
        assert_eq!(table.peak_len(), 4);
    }

    #[test]
    fn test_oversized_shard_count_is_clamped() {
        let mut config = DedupConfig::minimal();
        config.shard_count = usize::MAX;
        let table = DedupTable::new(&config);

        assert_eq!(table.shards.len(), crate::api::config::MAX_SHARD_COUNT);
        assert_eq!(table.index.len(), table.shards.len());
    }
}
