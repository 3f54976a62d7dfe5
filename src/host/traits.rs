//! Host runtime capability interface.
//!
//! The dedup core never talks to a runtime directly. Everything it needs
//! (reading string payloads, registering for events, rewriting references)
//! goes through [`HostRuntime`], so the same table and rewrite logic runs
//! against the C ABI backend, the simulated heap, or any other binding.

use std::fmt;
use std::sync::Arc;

use crate::api::error::{AttachError, RewritePrimitive, RewriteUnsupported};

/// Address of a managed object, valid until the collector moves or frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ObjectAddress(usize);

impl ObjectAddress {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw address.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Check for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset of `self` inside a range starting at `start`, if it falls within `len` bytes.
    #[inline]
    pub fn offset_in(self, start: ObjectAddress, len: usize) -> Option<usize> {
        let offset = self.0.checked_sub(start.0)?;
        (offset < len).then_some(offset)
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque runtime-assigned type identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TypeHandle(usize);

impl TypeHandle {
    /// Wrap a raw handle.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// How the host collector treats live objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    /// Live objects never change address.
    NonMoving,
    /// Live objects may be relocated during a collection.
    Compacting,
}

/// What the host runtime can do for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Collector behavior.
    pub collector: CollectorKind,
    /// The runtime delivers "object moved" notifications.
    pub reports_moves: bool,
    /// The runtime lists reclaimed objects when a collection finishes.
    pub reports_reclaimed: bool,
    /// [`HostRuntime::redirect`] is implemented.
    pub can_redirect: bool,
    /// [`HostRuntime::fold_references`] is implemented.
    pub can_fold_references: bool,
    /// [`HostRuntime::walk_reference_slots`] is implemented.
    pub can_walk_heap: bool,
    /// The profiling interface exists on this platform at all.
    pub instrumentation_available: bool,
}

impl HostCapabilities {
    /// A runtime that only delivers allocation and collection events.
    pub const fn observe_only(collector: CollectorKind) -> Self {
        Self {
            collector,
            reports_moves: matches!(collector, CollectorKind::Compacting),
            reports_reclaimed: true,
            can_redirect: false,
            can_fold_references: false,
            can_walk_heap: false,
            instrumentation_available: true,
        }
    }

    /// Whether table addresses stay trustworthy across a collection.
    ///
    /// Without reclaim reports a freed address may be reused; a compacting
    /// collector without move reports leaves every stored address suspect.
    pub fn addresses_survive_collection(&self) -> bool {
        self.reports_reclaimed
            && (self.collector == CollectorKind::NonMoving || self.reports_moves)
    }
}

/// Events the agent asks the runtime to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// Object allocation callbacks.
    pub const OBJECT_ALLOCATED: Self = Self(1 << 0);
    /// Collection started callbacks.
    pub const GC_STARTED: Self = Self(1 << 1);
    /// Collection finished callbacks.
    pub const GC_FINISHED: Self = Self(1 << 2);
    /// Object moved callbacks.
    pub const OBJECT_MOVED: Self = Self(1 << 3);

    /// Raw bits, as passed over the C ABI.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every event in `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The set of events needed for the given runtime.
    pub fn for_capabilities(capabilities: &HostCapabilities) -> Self {
        let mut mask = Self::OBJECT_ALLOCATED | Self::GC_STARTED | Self::GC_FINISHED;
        if capabilities.collector == CollectorKind::Compacting {
            mask = mask | Self::OBJECT_MOVED;
        }
        mask
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of [`HostRuntime::walk_reference_slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkReport {
    /// Slots handed to the visitor.
    pub visited: usize,
    /// Slots the runtime actually rewrote.
    pub rewritten: usize,
}

/// A recorded "duplicate -> canonical" substitution awaiting a fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Substitution {
    /// The duplicate instance whose references should be retargeted.
    pub duplicate: ObjectAddress,
    /// The canonical instance they should point at instead.
    pub canonical: ObjectAddress,
}

/// One reference field discovered during a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSlot {
    /// Object that holds the field.
    pub holder: ObjectAddress,
    /// Object the field currently points at.
    pub target: ObjectAddress,
    /// Type of the target object.
    pub target_type: TypeHandle,
}

/// Read-only access to string payloads.
pub trait ContentSource {
    /// Borrowed or shared payload bytes.
    type Contents<'a>: AsRef<[u8]>
    where
        Self: 'a;

    /// Payload of the string at `object`, or `None` if it cannot be read.
    ///
    /// The result is only meaningful for the duration of the current
    /// runtime callback.
    fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>>;
}

/// Callbacks the runtime drives into the agent.
pub trait EventSink: Send + Sync {
    /// An object was allocated.
    fn object_allocated(&self, type_handle: TypeHandle, object: ObjectAddress);

    /// A collection is about to start; the world is stopped.
    fn collection_started(&self);

    /// A live object was relocated.
    fn object_moved(&self, old: ObjectAddress, new: ObjectAddress);

    /// A block of live objects was relocated together.
    fn objects_moved_range(&self, old_start: ObjectAddress, new_start: ObjectAddress, len: usize);

    /// A collection finished; `reclaimed` lists freed objects when known.
    fn collection_finished(&self, reclaimed: &[ObjectAddress]);
}

/// The narrow interface the agent uses to talk back to the host runtime.
pub trait HostRuntime: ContentSource + Send + Sync {
    /// What this runtime supports.
    fn capabilities(&self) -> HostCapabilities;

    /// Register for the given events. Fails if another agent is attached.
    fn register_callbacks(&self, mask: EventMask) -> Result<(), AttachError>;

    /// Start delivering events to `sink`.
    fn install_sink(&self, sink: Arc<dyn EventSink>);

    /// Stop delivering events.
    fn remove_sink(&self);

    /// Make `duplicate` resolve to `canonical` for every observer.
    fn redirect(
        &self,
        _duplicate: ObjectAddress,
        _canonical: ObjectAddress,
    ) -> Result<(), RewriteUnsupported> {
        Err(RewriteUnsupported::new(RewritePrimitive::Redirect))
    }

    /// Retarget references during the collector's trace. Returns the number
    /// of substitutions applied.
    fn fold_references(&self, _substitutions: &[Substitution]) -> Result<usize, RewriteUnsupported> {
        Err(RewriteUnsupported::new(RewritePrimitive::FoldReferences))
    }

    /// Visit reference fields of objects at or above `min_generation`.
    ///
    /// Returning `Some(address)` from the visitor asks for the slot to be
    /// rewritten. The runtime may decline, for example when the slot changed
    /// after it was visited; only applied rewrites count in the report.
    fn walk_reference_slots(
        &self,
        _min_generation: u8,
        _visit: &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress>,
    ) -> Result<WalkReport, RewriteUnsupported> {
        Err(RewriteUnsupported::new(RewritePrimitive::WalkHeap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_for_compacting_collector() {
        let caps = HostCapabilities::observe_only(CollectorKind::Compacting);
        let mask = EventMask::for_capabilities(&caps);
        assert!(mask.contains(EventMask::OBJECT_MOVED));
        assert!(mask.contains(EventMask::OBJECT_ALLOCATED | EventMask::GC_FINISHED));
    }

    #[test]
    fn test_mask_for_non_moving_collector() {
        let caps = HostCapabilities::observe_only(CollectorKind::NonMoving);
        let mask = EventMask::for_capabilities(&caps);
        assert!(!mask.contains(EventMask::OBJECT_MOVED));
        assert_eq!(mask.bits(), 0b0111);
    }

    #[test]
    fn test_address_survival() {
        let mut caps = HostCapabilities::observe_only(CollectorKind::Compacting);
        assert!(caps.addresses_survive_collection());
        caps.reports_moves = false;
        assert!(!caps.addresses_survive_collection());

        let mut caps = HostCapabilities::observe_only(CollectorKind::NonMoving);
        assert!(caps.addresses_survive_collection());
        caps.reports_reclaimed = false;
        assert!(!caps.addresses_survive_collection());
    }

    #[test]
    fn test_offset_in_range() {
        let start = ObjectAddress::new(0x1000);
        assert_eq!(ObjectAddress::new(0x1010).offset_in(start, 0x20), Some(0x10));
        assert_eq!(ObjectAddress::new(0x1020).offset_in(start, 0x20), None);
        assert_eq!(ObjectAddress::new(0x0ff0).offset_in(start, 0x20), None);
    }
}
