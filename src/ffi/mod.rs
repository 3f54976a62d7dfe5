//! C ABI for loading the agent as a native module.
//!
//! The runtime-side shim fills in a [`HostVTable`], calls
//! [`strdedup_initialize`] once, and forwards its profiling callbacks to the
//! `strdedup_*` event exports. No panic crosses this boundary.
//!
//! ```c
//! HostVTable vt = { ctx, CAPS, layout, register_cb, unregister_cb, redirect_cb, NULL, walk_cb };
//! if (strdedup_initialize(&vt, string_type_handle) != 0) {
//!     /* feature off; keep running */
//! }
//! ```

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::api::agent::DedupAgent;
use crate::api::config::DedupConfig;
use crate::api::error::{AgentError, AttachError, RewritePrimitive, RewriteUnsupported};
use crate::api::session::{attach, Session};
use crate::host::{
    CollectorKind, ContentSource, EventMask, EventSink, HostCapabilities, HostRuntime,
    ObjectAddress, ReferenceSlot, StringLayout, Substitution, TypeHandle, WalkReport,
};
use crate::sync::mutex::{Mutex, RwLock};

/// Capability bit: the collector relocates live objects.
pub const CAP_COMPACTING: u32 = 1 << 0;
/// Capability bit: "object moved" notifications are delivered.
pub const CAP_REPORTS_MOVES: u32 = 1 << 1;
/// Capability bit: reclaimed objects are listed at collection end.
pub const CAP_REPORTS_RECLAIMED: u32 = 1 << 2;
/// Capability bit: the profiling interface is present.
pub const CAP_INSTRUMENTATION: u32 = 1 << 3;

/// Status a host `register_callbacks` returns when its profiling slot is taken.
pub const HOST_ALREADY_ATTACHED: i32 = 1;

/// Status returned when the agent panicked during initialization.
pub const STATUS_INTERNAL_ERROR: i32 = -1;

/// Register for the events in `mask`. Zero on success.
pub type RegisterCallbacksFn = unsafe extern "C" fn(context: *mut c_void, mask: u32) -> i32;
/// Stop delivering events.
pub type UnregisterFn = unsafe extern "C" fn(context: *mut c_void);
/// Redirect `duplicate` to `canonical`. Zero on success.
pub type RedirectFn =
    unsafe extern "C" fn(context: *mut c_void, duplicate: usize, canonical: usize) -> i32;
/// Queue substitutions for the current trace. Returns the number accepted,
/// or a negative value if unsupported.
pub type FoldReferencesFn = unsafe extern "C" fn(
    context: *mut c_void,
    substitutions: *const Substitution,
    count: usize,
) -> isize;
/// Called per reference slot; returns the replacement target or 0.
pub type SlotVisitorFn = unsafe extern "C" fn(
    state: *mut c_void,
    holder: usize,
    target: usize,
    target_type: usize,
) -> usize;
/// Walk reference slots of objects at or above `min_generation`. Returns
/// the number of slots visited, or a negative value if unsupported, and
/// stores the number of replacements actually written in `rewritten`.
pub type WalkReferenceSlotsFn = unsafe extern "C" fn(
    context: *mut c_void,
    min_generation: u8,
    visit: SlotVisitorFn,
    state: *mut c_void,
    rewritten: *mut usize,
) -> isize;

/// Host primitives supplied by the runtime-side shim.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostVTable {
    /// Opaque host state passed back to every function.
    pub context: *mut c_void,
    /// `CAP_*` bits.
    pub capability_bits: u32,
    /// Layout of the runtime's string objects.
    pub string_layout: StringLayout,
    /// Required.
    pub register_callbacks: Option<RegisterCallbacksFn>,
    /// Optional.
    pub unregister: Option<UnregisterFn>,
    /// Optional rewrite primitive.
    pub redirect: Option<RedirectFn>,
    /// Optional rewrite primitive.
    pub fold_references: Option<FoldReferencesFn>,
    /// Optional heap walk.
    pub walk_reference_slots: Option<WalkReferenceSlotsFn>,
}

/// Agent event target for the exported callbacks.
static SINK: RwLock<Option<Arc<dyn EventSink>>> = RwLock::new(None);

/// The one session this process may hold.
static SESSION: Mutex<Option<Session<FfiRuntime>>> = Mutex::new(None);

/// [`HostRuntime`] backed by a [`HostVTable`].
pub struct FfiRuntime {
    vtable: HostVTable,
}

// SAFETY: the host contract requires `context` and every vtable function to
// be usable from any thread the runtime delivers callbacks on.
unsafe impl Send for FfiRuntime {}
// SAFETY: see above; the agent never mutates the vtable.
unsafe impl Sync for FfiRuntime {}

impl FfiRuntime {
    /// Wrap a vtable.
    pub fn new(vtable: HostVTable) -> Self {
        Self { vtable }
    }
}

impl ContentSource for FfiRuntime {
    type Contents<'a> = &'a [u8];

    fn string_contents(&self, object: ObjectAddress) -> Option<Self::Contents<'_>> {
        // SAFETY: the agent only asks for contents of the object an
        // allocation callback reported, or of canonical entries the table
        // keeps in step with moves and reclaims; both are live strings for
        // the duration of the current callback.
        unsafe { self.vtable.string_layout.contents(object) }
    }
}

impl HostRuntime for FfiRuntime {
    fn capabilities(&self) -> HostCapabilities {
        let bits = self.vtable.capability_bits;
        HostCapabilities {
            collector: if bits & CAP_COMPACTING != 0 {
                CollectorKind::Compacting
            } else {
                CollectorKind::NonMoving
            },
            reports_moves: bits & CAP_REPORTS_MOVES != 0,
            reports_reclaimed: bits & CAP_REPORTS_RECLAIMED != 0,
            can_redirect: self.vtable.redirect.is_some(),
            can_fold_references: self.vtable.fold_references.is_some(),
            can_walk_heap: self.vtable.walk_reference_slots.is_some(),
            instrumentation_available: bits & CAP_INSTRUMENTATION != 0
                && self.vtable.register_callbacks.is_some()
                && self.vtable.string_layout.is_valid(),
        }
    }

    fn register_callbacks(&self, mask: EventMask) -> Result<(), AttachError> {
        let Some(register) = self.vtable.register_callbacks else {
            return Err(AttachError::UnsupportedPlatform(
                "host vtable has no register_callbacks",
            ));
        };
        // SAFETY: host-supplied function called with its own context.
        match unsafe { register(self.vtable.context, mask.bits()) } {
            0 => Ok(()),
            HOST_ALREADY_ATTACHED => Err(AttachError::AlreadyAttached),
            status => Err(AttachError::HandshakeRejected { status }),
        }
    }

    fn install_sink(&self, sink: Arc<dyn EventSink>) {
        *SINK.write() = Some(sink);
    }

    fn remove_sink(&self) {
        *SINK.write() = None;
        if let Some(unregister) = self.vtable.unregister {
            // SAFETY: host-supplied function called with its own context.
            unsafe { unregister(self.vtable.context) };
        }
    }

    fn redirect(
        &self,
        duplicate: ObjectAddress,
        canonical: ObjectAddress,
    ) -> Result<(), RewriteUnsupported> {
        let unsupported = RewriteUnsupported::new(RewritePrimitive::Redirect);
        let redirect = self.vtable.redirect.ok_or(unsupported)?;
        // SAFETY: host-supplied function called with its own context.
        match unsafe { redirect(self.vtable.context, duplicate.get(), canonical.get()) } {
            0 => Ok(()),
            _ => Err(unsupported),
        }
    }

    fn fold_references(&self, substitutions: &[Substitution]) -> Result<usize, RewriteUnsupported> {
        let unsupported = RewriteUnsupported::new(RewritePrimitive::FoldReferences);
        let fold = self.vtable.fold_references.ok_or(unsupported)?;
        // SAFETY: the slice outlives the call; `Substitution` is repr(C).
        let accepted = unsafe {
            fold(
                self.vtable.context,
                substitutions.as_ptr(),
                substitutions.len(),
            )
        };
        usize::try_from(accepted).map_err(|_| unsupported)
    }

    fn walk_reference_slots(
        &self,
        min_generation: u8,
        visit: &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress>,
    ) -> Result<WalkReport, RewriteUnsupported> {
        let unsupported = RewriteUnsupported::new(RewritePrimitive::WalkHeap);
        let walk = self.vtable.walk_reference_slots.ok_or(unsupported)?;

        let mut visitor: &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress> = visit;
        let state = &mut visitor as *mut &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress>;

        let mut rewritten = 0usize;

        // SAFETY: `state` points at `visitor` and `rewritten` at a local,
        // both of which outlive the walk.
        let visited = unsafe {
            walk(
                self.vtable.context,
                min_generation,
                visit_slot,
                state as *mut c_void,
                &mut rewritten,
            )
        };
        let visited = usize::try_from(visited).map_err(|_| unsupported)?;
        Ok(WalkReport {
            visited,
            rewritten: rewritten.min(visited),
        })
    }
}

unsafe extern "C" fn visit_slot(
    state: *mut c_void,
    holder: usize,
    target: usize,
    target_type: usize,
) -> usize {
    let visitor = &mut *(state as *mut &mut dyn FnMut(ReferenceSlot) -> Option<ObjectAddress>);
    let slot = ReferenceSlot {
        holder: ObjectAddress::new(holder),
        target: ObjectAddress::new(target),
        target_type: TypeHandle::new(target_type),
    };
    catch_unwind(AssertUnwindSafe(|| visitor(slot)))
        .ok()
        .flatten()
        .map_or(0, ObjectAddress::get)
}

/// Forward one event to the installed agent, containing panics.
fn dispatch(callback: &'static str, f: impl FnOnce(&dyn EventSink)) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if let Some(sink) = SINK.read().as_ref() {
            f(sink.as_ref());
        }
    }));
    if outcome.is_err() {
        log::error!("panic contained at the {} entry point", callback);
        if let Some(session) = SESSION.lock().as_ref() {
            session.agent().disable(AgentError::CallbackPanicked(callback));
        }
    }
}

fn with_agent<T>(f: impl FnOnce(&DedupAgent<FfiRuntime>) -> T) -> Option<T> {
    SESSION.lock().as_ref().map(|session| f(session.agent()))
}

/// Attach the agent. Returns 0 on success, [`AttachError::status_code`]
/// otherwise, or [`STATUS_INTERNAL_ERROR`].
///
/// # Safety
///
/// `vtable` must be null or point to a valid [`HostVTable`] whose functions
/// stay callable until [`strdedup_detach`].
#[no_mangle]
pub unsafe extern "C" fn strdedup_initialize(vtable: *const HostVTable, string_type: usize) -> i32 {
    if vtable.is_null() {
        return AttachError::UnsupportedPlatform("null host vtable").status_code();
    }
    let vtable = *vtable;

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut slot = SESSION.lock();
        if slot.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        let runtime = Arc::new(FfiRuntime::new(vtable));
        let session = attach(runtime, TypeHandle::new(string_type), DedupConfig::from_env())?;
        *slot = Some(session);
        Ok(())
    }));

    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::warn!("string deduplication unavailable: {}", e);
            e.status_code()
        }
        Err(_) => STATUS_INTERNAL_ERROR,
    }
}

/// Allocation callback.
#[no_mangle]
pub extern "C" fn strdedup_object_allocated(type_handle: usize, object: usize) {
    dispatch("object_allocated", |sink| {
        sink.object_allocated(TypeHandle::new(type_handle), ObjectAddress::new(object))
    });
}

/// Collection start callback.
#[no_mangle]
pub extern "C" fn strdedup_collection_started() {
    dispatch("collection_started", |sink| sink.collection_started());
}

/// Single-object move callback.
#[no_mangle]
pub extern "C" fn strdedup_object_moved(old: usize, new: usize) {
    dispatch("object_moved", |sink| {
        sink.object_moved(ObjectAddress::new(old), ObjectAddress::new(new))
    });
}

/// Block move callback: `count` parallel arrays of old starts, new starts
/// and lengths.
///
/// # Safety
///
/// Each array must be valid for `count` reads.
#[no_mangle]
pub unsafe extern "C" fn strdedup_objects_moved_ranges(
    old_starts: *const usize,
    new_starts: *const usize,
    lengths: *const usize,
    count: usize,
) {
    if count == 0 || old_starts.is_null() || new_starts.is_null() || lengths.is_null() {
        return;
    }
    let old_starts = std::slice::from_raw_parts(old_starts, count);
    let new_starts = std::slice::from_raw_parts(new_starts, count);
    let lengths = std::slice::from_raw_parts(lengths, count);

    dispatch("objects_moved_ranges", |sink| {
        for ((&old, &new), &len) in old_starts.iter().zip(new_starts).zip(lengths) {
            sink.objects_moved_range(ObjectAddress::new(old), ObjectAddress::new(new), len);
        }
    });
}

/// Collection end callback with the reclaimed objects, if the runtime
/// reports them.
///
/// # Safety
///
/// `reclaimed` must be null or valid for `count` reads.
#[no_mangle]
pub unsafe extern "C" fn strdedup_collection_finished(reclaimed: *const usize, count: usize) {
    let reclaimed: &[ObjectAddress] = if reclaimed.is_null() || count == 0 {
        &[]
    } else {
        // SAFETY: ObjectAddress is repr(transparent) over usize.
        std::slice::from_raw_parts(reclaimed as *const ObjectAddress, count)
    };
    dispatch("collection_finished", |sink| sink.collection_finished(reclaimed));
}

/// Counters exported over the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrdedupStats {
    /// 1 if the agent disabled itself.
    pub disabled: u32,
    /// `RewriteStrategy` as its discriminant.
    pub strategy: u32,
    /// String allocations seen.
    pub strings_seen: u64,
    /// Duplicates found.
    pub hits: u64,
    /// New canonical entries.
    pub misses: u64,
    /// Lookups that failed closed.
    pub bypassed: u64,
    /// Payload bytes held by duplicates.
    pub duplicate_bytes: u64,
    /// Immediate redirects.
    pub redirected: u64,
    /// Substitutions folded by the collector.
    pub folded: u64,
    /// Slots retargeted by consolidation.
    pub consolidated_slots: u64,
    /// Canonical entries.
    pub entries: u64,
    /// Collections observed.
    pub collections: u64,
}

/// Copy a statistics snapshot into `out`. Returns 0, or 1 if no session.
///
/// # Safety
///
/// `out` must be valid for one write.
#[no_mangle]
pub unsafe extern "C" fn strdedup_stats(out: *mut StrdedupStats) -> i32 {
    if out.is_null() {
        return 1;
    }
    let snapshot = catch_unwind(|| {
        with_agent(|agent| {
            let stats = agent.stats();
            StrdedupStats {
                disabled: agent.is_disabled() as u32,
                strategy: stats.strategy as u32,
                strings_seen: stats.strings_seen,
                hits: stats.hits,
                misses: stats.misses,
                bypassed: stats.bypassed,
                duplicate_bytes: stats.duplicate_bytes,
                redirected: stats.redirected,
                folded: stats.folded,
                consolidated_slots: stats.consolidated_slots,
                entries: stats.entries as u64,
                collections: stats.collections,
            }
        })
    });
    match snapshot {
        Ok(Some(stats)) => {
            out.write(stats);
            0
        }
        _ => 1,
    }
}

/// Detach and release the table. Returns 0, or 1 if no session.
#[no_mangle]
pub extern "C" fn strdedup_detach() -> i32 {
    let detached = catch_unwind(|| match SESSION.lock().as_ref() {
        Some(session) => {
            session.detach();
            true
        }
        None => false,
    });
    match detached {
        Ok(true) => 0,
        _ => 1,
    }
}
