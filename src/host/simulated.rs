//! Simulated managed runtime.
//!
//! A small heap of strings and records with roots, generations and a
//! mark-sweep collector that can compact. It implements every host
//! primitive, each switchable through [`HostCapabilities`], so the agent
//! can be driven end to end without a real runtime.
//!
//! Event delivery follows a real runtime's rules: allocation callbacks run
//! on the allocating thread, collections stop the world, and no heap lock
//! is held while the agent is called.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::api::error::{AttachError, RewritePrimitive, RewriteUnsupported};
use crate::sync::mutex::{Mutex, RwLock};
use crate::util::layout::align_up;

use super::traits::{
    CollectorKind, ContentSource, EventMask, EventSink, HostCapabilities, HostRuntime,
    ObjectAddress, ReferenceSlot, Substitution, TypeHandle, WalkReport,
};

const HEAP_BASE: usize = 0x1_0000;
const OBJECT_ALIGN: usize = 16;
const HEADER_SIZE: usize = 16;
const OLDEST_GENERATION: u8 = 2;

#[derive(Debug)]
enum Payload {
    String(Arc<[u8]>),
    Record(Vec<ObjectAddress>),
}

#[derive(Debug)]
struct SimObject {
    type_handle: TypeHandle,
    size: usize,
    generation: u8,
    payload: Payload,
}

#[derive(Default)]
struct SimHeap {
    objects: BTreeMap<ObjectAddress, SimObject>,
    roots: Vec<ObjectAddress>,
    /// Redirected duplicate -> canonical
    forwarding: HashMap<ObjectAddress, ObjectAddress>,
    /// Substitutions handed over for the next trace
    pending_folds: Vec<Substitution>,
    top: usize,
}

impl SimHeap {
    fn bump(&mut self, size: usize) -> ObjectAddress {
        if self.top == 0 {
            self.top = HEAP_BASE;
        }
        let address = ObjectAddress::new(self.top);
        self.top += align_up(size, OBJECT_ALIGN);
        address
    }

    fn forward(&self, mut address: ObjectAddress) -> ObjectAddress {
        while let Some(&next) = self.forwarding.get(&address) {
            address = next;
        }
        address
    }

    fn retarget(&mut self, from: ObjectAddress, to: ObjectAddress) {
        for root in self.roots.iter_mut().filter(|r| **r == from) {
            *root = to;
        }
        for object in self.objects.values_mut() {
            if let Payload::Record(fields) = &mut object.payload {
                for field in fields.iter_mut().filter(|f| **f == from) {
                    *field = to;
                }
            }
        }
    }

    fn apply_folds(&mut self) {
        for substitution in std::mem::take(&mut self.pending_folds) {
            if self.objects.contains_key(&substitution.canonical) {
                self.retarget(substitution.duplicate, substitution.canonical);
            }
        }
    }

    /// Mark from roots, resolving forwarded references along the way.
    fn mark(&mut self) -> HashSet<ObjectAddress> {
        let mut marked = HashSet::new();

        let roots: Vec<ObjectAddress> = self.roots.iter().map(|r| self.forward(*r)).collect();
        self.roots = roots.clone();
        let mut stack: Vec<ObjectAddress> = roots;

        while let Some(address) = stack.pop() {
            if address.is_null() || !marked.insert(address) {
                continue;
            }

            let Some(fields) = (match self.objects.get(&address) {
                Some(SimObject {
                    payload: Payload::Record(fields),
                    ..
                }) => Some(fields.clone()),
                _ => None,
            }) else {
                continue;
            };

            let resolved: Vec<ObjectAddress> = fields.iter().map(|f| self.forward(*f)).collect();
            if let Some(SimObject {
                payload: Payload::Record(slots),
                ..
            }) = self.objects.get_mut(&address)
            {
                slots.copy_from_slice(&resolved);
            }
            stack.extend(resolved);
        }

        marked
    }

    /// Slide survivors toward the heap base. Returns (old, new, size) per
    /// object that actually moved.
    fn compact(&mut self) -> Vec<(ObjectAddress, ObjectAddress, usize)> {
        let mut moves = Vec::new();
        let mut relocated = BTreeMap::new();
        let mut cursor = HEAP_BASE;

        for (old, object) in std::mem::take(&mut self.objects) {
            let new = ObjectAddress::new(cursor);
            cursor += align_up(object.size, OBJECT_ALIGN);
            if new != old {
                moves.push((old, new, object.size));
            }
            relocated.insert(new, object);
        }
        self.objects = relocated;
        self.top = cursor;

        let map: HashMap<ObjectAddress, ObjectAddress> =
            moves.iter().map(|&(old, new, _)| (old, new)).collect();
        let fix = |address: &mut ObjectAddress| {
            if let Some(&new) = map.get(address) {
                *address = new;
            }
        };
        self.roots.iter_mut().for_each(fix);
        for object in self.objects.values_mut() {
            if let Payload::Record(fields) = &mut object.payload {
                fields.iter_mut().for_each(fix);
            }
        }

        moves
    }
}

/// One move notification as the runtime would deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveEvent {
    Object(ObjectAddress, ObjectAddress),
    Range(ObjectAddress, ObjectAddress, usize),
}

/// Coalesce adjacent objects that moved by the same offset into ranges.
fn coalesce_moves(moves: &[(ObjectAddress, ObjectAddress, usize)]) -> Vec<MoveEvent> {
    let mut events = Vec::new();
    let mut i = 0;
    while i < moves.len() {
        let (old_start, new_start, size) = moves[i];
        let delta = old_start.get() - new_start.get();
        let mut end = old_start.get() + align_up(size, OBJECT_ALIGN);
        let mut j = i + 1;
        while j < moves.len() {
            let (old, new, size) = moves[j];
            if old.get() != end || old.get() - new.get() != delta {
                break;
            }
            end = old.get() + align_up(size, OBJECT_ALIGN);
            j += 1;
        }
        if j - i == 1 {
            events.push(MoveEvent::Object(old_start, new_start));
        } else {
            events.push(MoveEvent::Range(old_start, new_start, end - old_start.get()));
        }
        i = j;
    }
    events
}

/// What one simulated collection did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Objects freed.
    pub reclaimed: Vec<ObjectAddress>,
    /// Objects relocated.
    pub moved: usize,
    /// Substitutions folded during the trace.
    pub folded: usize,
    /// Live objects after the collection.
    pub live: usize,
}

/// In-process managed heap implementing [`HostRuntime`].
pub struct SimulatedRuntime {
    capabilities: HostCapabilities,
    handshake_status: i32,

    heap: Mutex<SimHeap>,
    /// Allocations hold it shared, collections exclusively.
    world: RwLock<()>,

    registered: Mutex<Option<EventMask>>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl SimulatedRuntime {
    /// Type handle of simulated strings.
    pub const STRING_TYPE: TypeHandle = TypeHandle::new(0x5354_5200);
    /// Type handle of simulated records.
    pub const RECORD_TYPE: TypeHandle = TypeHandle::new(0x5245_4300);

    /// Create a runtime with the given capabilities.
    pub fn new(capabilities: HostCapabilities) -> Self {
        Self {
            capabilities,
            handshake_status: 0,
            heap: Mutex::new(SimHeap::default()),
            world: RwLock::new(()),
            registered: Mutex::new(None),
            sink: RwLock::new(None),
        }
    }

    /// A compacting runtime offering every primitive.
    pub fn compacting() -> Self {
        Self::new(HostCapabilities {
            collector: CollectorKind::Compacting,
            reports_moves: true,
            reports_reclaimed: true,
            can_redirect: true,
            can_fold_references: true,
            can_walk_heap: true,
            instrumentation_available: true,
        })
    }

    /// A non-moving runtime offering every primitive.
    pub fn non_moving() -> Self {
        Self::new(HostCapabilities {
            collector: CollectorKind::NonMoving,
            ..Self::compacting().capabilities
        })
    }

    /// Make the attach handshake fail with `status`.
    pub fn with_handshake_status(mut self, status: i32) -> Self {
        self.handshake_status = status;
        self
    }

    fn current_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().clone()
    }

    fn delivers(&self, event: EventMask) -> bool {
        self.registered
            .lock()
            .map_or(false, |mask| mask.contains(event))
    }

    /// Allocate a string and report it.
    pub fn alloc_string(&self, content: &str) -> ObjectAddress {
        let _world = self.world.read();
        let address = {
            let mut heap = self.heap.lock();
            let size = HEADER_SIZE + content.len();
            let address = heap.bump(size);
            heap.objects.insert(
                address,
                SimObject {
                    type_handle: Self::STRING_TYPE,
                    size,
                    generation: 0,
                    payload: Payload::String(Arc::from(content.as_bytes())),
                },
            );
            address
        };

        if self.delivers(EventMask::OBJECT_ALLOCATED) {
            if let Some(sink) = self.current_sink() {
                sink.object_allocated(Self::STRING_TYPE, address);
            }
        }
        address
    }

    /// Allocate a record with `fields` null reference fields.
    pub fn alloc_record(&self, fields: usize) -> ObjectAddress {
        let _world = self.world.read();
        let address = {
            let mut heap = self.heap.lock();
            let size = HEADER_SIZE + fields * std::mem::size_of::<usize>();
            let address = heap.bump(size);
            heap.objects.insert(
                address,
                SimObject {
                    type_handle: Self::RECORD_TYPE,
                    size,
                    generation: 0,
                    payload: Payload::Record(vec![ObjectAddress::NULL; fields]),
                },
            );
            address
        };

        if self.delivers(EventMask::OBJECT_ALLOCATED) {
            if let Some(sink) = self.current_sink() {
                sink.object_allocated(Self::RECORD_TYPE, address);
            }
        }
        address
    }

    /// Keep `object` alive across collections.
    pub fn add_root(&self, object: ObjectAddress) {
        self.heap.lock().roots.push(object);
    }

    /// Drop one root entry for `object`.
    pub fn remove_root(&self, object: ObjectAddress) {
        let mut heap = self.heap.lock();
        let target = heap.forward(object);
        if let Some(pos) = heap
            .roots
            .iter()
            .position(|r| *r == object || *r == target)
        {
            heap.roots.swap_remove(pos);
        }
    }

    /// Current root set.
    pub fn roots(&self) -> Vec<ObjectAddress> {
        self.heap.lock().roots.clone()
    }

    /// Store `target` in field `index` of `holder`. Returns false if
    /// `holder` is not a record or the index is out of range.
    pub fn set_field(&self, holder: ObjectAddress, index: usize, target: ObjectAddress) -> bool {
        let mut heap = self.heap.lock();
        match heap.objects.get_mut(&holder) {
            Some(SimObject {
                payload: Payload::Record(fields),
                ..
            }) if index < fields.len() => {
                fields[index] = target;
                true
            }
            _ => false,
        }
    }

    /// Raw value of field `index` of `holder`.
    pub fn field(&self, holder: ObjectAddress, index: usize) -> Option<ObjectAddress> {
        match self.heap.lock().objects.get(&holder) {
            Some(SimObject {
                payload: Payload::Record(fields),
                ..
            }) => fields.get(index).copied(),
            _ => None,
        }
    }

    /// Where a read through `object` lands after redirection.
    pub fn resolve(&self, object: ObjectAddress) -> ObjectAddress {
        self.heap.lock().forward(object)
    }

    /// Read a string the way application code would, following redirection.
    pub fn read_string(&self, object: ObjectAddress) -> Option<String> {
        let heap = self.heap.lock();
        match heap.objects.get(&heap.forward(object)) {
            Some(SimObject {
                payload: Payload::String(bytes),
                ..
            }) => String::from_utf8(bytes.to_vec()).ok(),
            _ => None,
        }
    }

    /// Whether an object lives at `object`.
    pub fn is_live(&self, object: ObjectAddress) -> bool {
        self.heap.lock().objects.contains_key(&object)
    }

    /// Generation of the object at `object`.
    pub fn generation(&self, object: ObjectAddress) -> Option<u8> {
        self.heap.lock().objects.get(&object).map(|o| o.generation)
    }

    /// Number of live string objects holding `content`.
    pub fn count_strings(&self, content: &str) -> usize {
        self.heap
            .lock()
            .objects
            .values()
            .filter(|o| matches!(&o.payload, Payload::String(bytes) if &bytes[..] == content.as_bytes()))
            .count()
    }

    /// Live object count.
    pub fn object_count(&self) -> usize {
        self.heap.lock().objects.len()
    }

    /// Run a full collection, compacting if the collector moves objects.
    pub fn collect(&self) -> CollectionSummary {
        let _world = self.world.write();
        let sink = self.current_sink();
        let mask = (*self.registered.lock()).unwrap_or_default();

        if mask.contains(EventMask::GC_STARTED) {
            if let Some(sink) = &sink {
                sink.collection_started();
            }
        }

        let (mut summary, moves) = {
            let mut heap = self.heap.lock();
            let folded = heap.pending_folds.len();
            heap.apply_folds();

            let marked = heap.mark();
            let reclaimed: Vec<ObjectAddress> = heap
                .objects
                .keys()
                .filter(|a| !marked.contains(*a))
                .copied()
                .collect();
            for address in &reclaimed {
                heap.objects.remove(address);
            }
            heap.forwarding.clear();

            for object in heap.objects.values_mut() {
                object.generation = (object.generation + 1).min(OLDEST_GENERATION);
            }

            let moves = match self.capabilities.collector {
                CollectorKind::Compacting => heap.compact(),
                CollectorKind::NonMoving => Vec::new(),
            };

            let summary = CollectionSummary {
                reclaimed,
                moved: moves.len(),
                folded,
                live: heap.objects.len(),
            };
            (summary, moves)
        };

        if let Some(sink) = &sink {
            if self.capabilities.reports_moves && mask.contains(EventMask::OBJECT_MOVED) {
                for event in coalesce_moves(&moves) {
                    match event {
                        MoveEvent::Object(old, new) => sink.object_moved(old, new),
                        MoveEvent::Range(old, new, len) => sink.objects_moved_range(old, new, len),
                    }
                }
            }
            if mask.contains(EventMask::GC_FINISHED) {
                let reported: &[ObjectAddress] = if self.capabilities.reports_reclaimed {
                    &summary.reclaimed
                } else {
                    &[]
                };
                sink.collection_finished(reported);
            }
        }

        summary.live = self.object_count();
        summary
    }
}

impl ContentSource for SimulatedRuntime {
    type Contents<'a> = Arc<[u8]>;

    fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>> {
        match self.heap.lock().objects.get(&object) {
            Some(SimObject {
                payload: Payload::String(bytes),
                ..
            }) => Some(Arc::clone(bytes)),
            _ => None,
        }
    }
}

impl HostRuntime for SimulatedRuntime {
    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn register_callbacks(&self, mask: EventMask) -> Result<(), AttachError> {
        if self.handshake_status != 0 {
            return Err(AttachError::HandshakeRejected {
                status: self.handshake_status,
            });
        }
        let mut registered = self.registered.lock();
        if registered.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        *registered = Some(mask);
        Ok(())
    }

    fn install_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    fn remove_sink(&self) {
        *self.sink.write() = None;
        *self.registered.lock() = None;
    }

    fn redirect(
        &self,
        duplicate: ObjectAddress,
        canonical: ObjectAddress,
    ) -> Result<(), RewriteUnsupported> {
        if !self.capabilities.can_redirect {
            return Err(RewriteUnsupported::new(RewritePrimitive::Redirect));
        }
        let mut heap = self.heap.lock();
        if duplicate != canonical
            && heap.objects.contains_key(&duplicate)
            && heap.objects.contains_key(&canonical)
        {
            heap.forwarding.insert(duplicate, canonical);
        }
        Ok(())
    }

    fn fold_references(&self, substitutions: &[Substitution]) -> Result<usize, RewriteUnsupported> {
        if !self.capabilities.can_fold_references {
            return Err(RewriteUnsupported::new(RewritePrimitive::FoldReferences));
        }
        self.heap.lock().pending_folds.extend_from_slice(substitutions);
        Ok(substitutions.len())
    }

    fn walk_reference_slots(
        &self,
        min_generation: u8,
        visit: &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress>,
    ) -> Result<WalkReport, RewriteUnsupported> {
        if !self.capabilities.can_walk_heap {
            return Err(RewriteUnsupported::new(RewritePrimitive::WalkHeap));
        }

        // The visitor reads string contents, so it must run unlocked.
        let slots: Vec<(ReferenceSlot, usize)> = {
            let guard = self.heap.lock();
            let heap: &SimHeap = &guard;
            heap.objects
                .iter()
                .filter(|(_, o)| o.generation >= min_generation)
                .filter_map(|(holder, o)| match &o.payload {
                    Payload::Record(fields) => Some((*holder, fields)),
                    Payload::String(_) => None,
                })
                .flat_map(|(holder, fields)| {
                    fields.iter().enumerate().filter_map(move |(index, target)| {
                        let target_type = heap.objects.get(target)?.type_handle;
                        Some((
                            ReferenceSlot {
                                holder,
                                target: *target,
                                target_type,
                            },
                            index,
                        ))
                    })
                })
                .collect::<Vec<_>>()
        };

        let rewrites: Vec<(ReferenceSlot, usize, ObjectAddress)> = slots
            .iter()
            .filter_map(|&(slot, index)| visit(slot).map(|new| (slot, index, new)))
            .collect();

        // Slots written while the visitor ran keep their new value.
        let mut rewritten = 0;
        let mut heap = self.heap.lock();
        for (slot, index, new) in rewrites {
            if !heap.objects.contains_key(&new) {
                continue;
            }
            if let Some(SimObject {
                payload: Payload::Record(fields),
                ..
            }) = heap.objects.get_mut(&slot.holder)
            {
                if fields.get(index) == Some(&slot.target) {
                    fields[index] = new;
                    rewritten += 1;
                }
            }
        }

        Ok(WalkReport {
            visited: slots.len(),
            rewritten,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrooted_objects_reclaimed() {
        let runtime = SimulatedRuntime::non_moving();
        let kept = runtime.alloc_string("kept");
        let dropped = runtime.alloc_string("dropped");
        runtime.add_root(kept);

        let summary = runtime.collect();
        assert_eq!(summary.reclaimed, vec![dropped]);
        assert!(runtime.is_live(kept));
        assert_eq!(runtime.generation(kept), Some(1));
    }

    #[test]
    fn test_compaction_moves_survivors_and_fixes_fields() {
        let runtime = SimulatedRuntime::compacting();
        let garbage = runtime.alloc_string("garbage");
        let record = runtime.alloc_record(1);
        let text = runtime.alloc_string("text");
        runtime.set_field(record, 0, text);
        runtime.add_root(record);

        let summary = runtime.collect();
        assert_eq!(summary.reclaimed, vec![garbage]);
        assert_eq!(summary.moved, 2);

        let record = runtime.roots()[0];
        assert_eq!(record, garbage);
        let field = runtime.field(record, 0).unwrap();
        assert_eq!(runtime.read_string(field).as_deref(), Some("text"));
    }

    #[test]
    fn test_redirect_reclaims_duplicate() {
        let runtime = SimulatedRuntime::non_moving();
        let canonical = runtime.alloc_string("same");
        let duplicate = runtime.alloc_string("same");
        runtime.add_root(canonical);
        runtime.add_root(duplicate);

        runtime.redirect(duplicate, canonical).unwrap();
        assert_eq!(runtime.read_string(duplicate).as_deref(), Some("same"));

        let summary = runtime.collect();
        assert_eq!(summary.reclaimed, vec![duplicate]);
        assert_eq!(runtime.count_strings("same"), 1);
    }

    #[test]
    fn test_walk_rewrites_slots() {
        let runtime = SimulatedRuntime::non_moving();
        let a = runtime.alloc_string("v");
        let b = runtime.alloc_string("v");
        let record = runtime.alloc_record(2);
        runtime.set_field(record, 0, a);
        runtime.set_field(record, 1, b);

        let report = runtime
            .walk_reference_slots(0, &mut |slot| (slot.target == b).then_some(a))
            .unwrap();
        assert_eq!(report, WalkReport { visited: 2, rewritten: 1 });
        assert_eq!(runtime.field(record, 1), Some(a));
    }

    #[test]
    fn test_walk_skips_slots_changed_during_visit() {
        let runtime = SimulatedRuntime::non_moving();
        let a = runtime.alloc_string("v");
        let b = runtime.alloc_string("v");
        let c = runtime.alloc_string("w");
        let record = runtime.alloc_record(1);
        runtime.set_field(record, 0, b);

        let report = runtime
            .walk_reference_slots(0, &mut |slot| {
                runtime.set_field(record, 0, c);
                (slot.target == b).then_some(a)
            })
            .unwrap();

        assert_eq!(report, WalkReport { visited: 1, rewritten: 0 });
        assert_eq!(runtime.field(record, 0), Some(c));
    }

    #[test]
    fn test_second_registration_rejected() {
        let runtime = SimulatedRuntime::compacting();
        runtime.register_callbacks(EventMask::OBJECT_ALLOCATED).unwrap();
        assert_eq!(
            runtime.register_callbacks(EventMask::OBJECT_ALLOCATED),
            Err(AttachError::AlreadyAttached)
        );
    }

    #[test]
    fn test_coalesce_adjacent_moves() {
        let a = |raw| ObjectAddress::new(raw);
        let moves = [
            (a(0x100), a(0x40), 16),
            (a(0x110), a(0x50), 16),
            (a(0x200), a(0x60), 32),
        ];
        assert_eq!(
            coalesce_moves(&moves),
            vec![
                MoveEvent::Range(a(0x100), a(0x40), 0x20),
                MoveEvent::Object(a(0x200), a(0x60)),
            ]
        );
    }
}
