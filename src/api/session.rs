//! Session attach.
//!
//! One session per process: the runtime grants a single profiling slot,
//! and the table is built only after the handshake succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::agent::DedupAgent;
use crate::api::config::DedupConfig;
use crate::api::error::AttachError;
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::host::{EventMask, EventSink, HostRuntime, TypeHandle};
use crate::sd_emit;

/// An established instrumentation session.
pub struct Session<R: HostRuntime + 'static> {
    agent: Arc<DedupAgent<R>>,
    mask: EventMask,
    string_type: TypeHandle,
    detached: AtomicBool,
}

impl<R: HostRuntime + 'static> Session<R> {
    /// The agent receiving callbacks.
    pub fn agent(&self) -> &Arc<DedupAgent<R>> {
        &self.agent
    }

    /// Events registered with the runtime.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// The string type identity supplied at attach.
    pub fn string_type(&self) -> TypeHandle {
        self.string_type
    }

    /// Whether [`Session::detach`] has run.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Stop receiving events and release the table.
    ///
    /// Redirections already applied stay in place; the runtime owns them.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.agent.host().remove_sink();
        self.agent.stop();
        log::info!("string deduplication detached");
    }
}

impl<R: HostRuntime + 'static> std::fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mask", &self.mask)
            .field("string_type", &self.string_type)
            .field("status", &self.agent.status())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Attach a dedup agent to `host`, reporting diagnostics through the log facade.
pub fn attach<R: HostRuntime + 'static>(
    host: Arc<R>,
    string_type: TypeHandle,
    config: DedupConfig,
) -> Result<Session<R>, AttachError> {
    attach_with_sink(host, string_type, config, Arc::new(LogSink))
}

/// Attach a dedup agent to `host` with a custom diagnostic sink.
///
/// Failure leaves the runtime untouched: no sink is installed and no table
/// is allocated.
pub fn attach_with_sink<R: HostRuntime + 'static>(
    host: Arc<R>,
    string_type: TypeHandle,
    config: DedupConfig,
    diagnostics: Arc<dyn DiagnosticSink>,
) -> Result<Session<R>, AttachError> {
    let capabilities = host.capabilities();
    if !capabilities.instrumentation_available {
        let error = AttachError::UnsupportedPlatform("runtime exposes no instrumentation interface");
        sd_emit!(diagnostics, SD002, error);
        return Err(error);
    }

    let mask = EventMask::for_capabilities(&capabilities);
    if let Err(error) = host.register_callbacks(mask) {
        match error {
            AttachError::AlreadyAttached => sd_emit!(diagnostics, SD001),
            AttachError::UnsupportedPlatform(_) => sd_emit!(diagnostics, SD002, error),
            AttachError::HandshakeRejected { .. } => sd_emit!(diagnostics, SD003, error),
        }
        return Err(error);
    }

    let agent = Arc::new(DedupAgent::new(
        Arc::clone(&host),
        string_type,
        &config,
        diagnostics,
    ));
    host.install_sink(Arc::clone(&agent) as Arc<dyn EventSink>);

    log::info!(
        "string deduplication attached: {:?} collector, strategy {}, {} shards",
        capabilities.collector,
        agent.rewrite_strategy(),
        config.effective_shard_count()
    );

    Ok(Session {
        agent,
        mask,
        string_type,
        detached: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::host::{CollectorKind, HostCapabilities, SimulatedRuntime};

    #[test]
    fn test_mask_follows_collector() {
        let session = attach(
            Arc::new(SimulatedRuntime::non_moving()),
            SimulatedRuntime::STRING_TYPE,
            DedupConfig::minimal(),
        )
        .unwrap();
        assert!(!session.mask().contains(EventMask::OBJECT_MOVED));
        assert!(session.mask().contains(EventMask::OBJECT_ALLOCATED));
    }

    #[test]
    fn test_unsupported_platform() {
        let mut caps = HostCapabilities::observe_only(CollectorKind::Compacting);
        caps.instrumentation_available = false;
        let sink = Arc::new(CollectingSink::new());

        let err = attach_with_sink(
            Arc::new(SimulatedRuntime::new(caps)),
            SimulatedRuntime::STRING_TYPE,
            DedupConfig::minimal(),
            sink.clone(),
        )
        .unwrap_err();

        assert!(matches!(err, AttachError::UnsupportedPlatform(_)));
        assert_eq!(sink.codes(), vec!["SD002"]);
    }

    #[test]
    fn test_handshake_rejected() {
        let runtime = Arc::new(SimulatedRuntime::compacting().with_handshake_status(-5));
        let sink = Arc::new(CollectingSink::new());

        let err = attach_with_sink(
            runtime,
            SimulatedRuntime::STRING_TYPE,
            DedupConfig::minimal(),
            sink.clone(),
        )
        .unwrap_err();

        assert_eq!(err, AttachError::HandshakeRejected { status: -5 });
        assert_eq!(err.status_code(), 3);
        assert_eq!(sink.codes(), vec!["SD003"]);
    }

    #[test]
    fn test_detach_stops_processing() {
        let runtime = Arc::new(SimulatedRuntime::compacting());
        let session = attach(
            Arc::clone(&runtime),
            SimulatedRuntime::STRING_TYPE,
            DedupConfig::minimal(),
        )
        .unwrap();

        runtime.alloc_string("before");
        session.detach();
        runtime.alloc_string("after");

        assert!(session.is_detached());
        assert_eq!(session.agent().stats().strings_seen, 1);
        assert!(session.agent().table().is_empty());
    }
}
