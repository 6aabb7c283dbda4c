//! The resource manager: scope registry, factories, and reclamation.
//!
//! # Architecture
//!
//! ```text
//! ResourceManager
//!     │
//!     ├── system / transient ──────► singleton scopes
//!     ├── services / protocols / peers ──► registry maps (one mutex)
//!     ├── open_connection(dir, use_fd) ──► ConnectionScope [transient, system]
//!     ├── open_stream(peer, dir) ──► StreamScope [peer, transient, system]
//!     └── reclaimer thread ──► collects unused peer/protocol scopes
//! ```
//!
//! The registry hands out scopes with their reference count already
//! incremented; every `get` is balanced by a `dec_ref`, either by the view
//! wrapper or by the constraint edge that takes over the reference. The
//! background reclaimer wakes on a fixed cadence and retires any peer or
//! protocol scope that is unused, i.e. has no references and no charge.
//! Service scopes are deliberately long-lived and are not reclaimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResourceError;
use crate::limit::Limiter;
use crate::scope::{RefGuard, ResourceScope, Scope};
use crate::scopes::{
    ConnectionScope, PeerScope, ProtocolScope, ServiceScope, StreamScope, SystemScope,
    TransientScope,
};
use crate::types::{Direction, PeerId, ProtocolId, ScopeName, ServiceName};

const fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

/// Tuning knobs for the resource manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Cadence of the background reclaimer.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl ResourceManagerConfig {
    /// Sets the reclaimer cadence.
    #[must_use]
    pub const fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval: default_gc_interval(),
        }
    }
}

#[derive(Default)]
struct Registry {
    services: HashMap<ServiceName, ServiceScope>,
    protocols: HashMap<ProtocolId, ProtocolScope>,
    peers: HashMap<PeerId, PeerScope>,
}

/// State shared between the manager handle, the scopes it creates, and the
/// reclaimer thread.
pub(crate) struct ManagerShared {
    limiter: Box<dyn Limiter>,
    system: SystemScope,
    transient: TransientScope,
    registry: Mutex<Registry>,
    next_conn_ordinal: AtomicU64,
    next_stream_ordinal: AtomicU64,
}

impl ManagerShared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn system(&self) -> &SystemScope {
        &self.system
    }

    pub(crate) fn transient(&self) -> &TransientScope {
        &self.transient
    }

    /// Looks up or creates the service scope, returning it with an
    /// incremented reference count.
    pub(crate) fn get_or_create_service(&self, svc: &ServiceName) -> ServiceScope {
        let mut registry = self.registry();
        let scope = registry.services.entry(svc.clone()).or_insert_with(|| {
            ServiceScope::new(svc.clone(), self.limiter.service_limits(svc), &self.system)
        });
        scope.resource_scope().inc_ref();
        scope.clone()
    }

    /// Looks up or creates the protocol scope, returning it with an
    /// incremented reference count.
    pub(crate) fn get_or_create_protocol(&self, proto: &ProtocolId) -> ProtocolScope {
        let mut registry = self.registry();
        let scope = registry.protocols.entry(proto.clone()).or_insert_with(|| {
            ProtocolScope::new(
                proto.clone(),
                self.limiter.protocol_limits(proto),
                &self.system,
            )
        });
        scope.resource_scope().inc_ref();
        scope.clone()
    }

    /// Looks up or creates the peer scope, returning it with an incremented
    /// reference count.
    pub(crate) fn get_or_create_peer(&self, peer: &PeerId) -> PeerScope {
        let mut registry = self.registry();
        let scope = registry.peers.entry(peer.clone()).or_insert_with(|| {
            PeerScope::new(peer.clone(), self.limiter.peer_limits(peer), &self.system)
        });
        scope.resource_scope().inc_ref();
        scope.clone()
    }

    /// Retires and removes every unused peer and protocol scope. Service
    /// scopes are long-lived and left alone.
    pub(crate) fn collect_idle_scopes(&self) {
        let mut registry = self.registry();
        registry.protocols.retain(|proto, scope| {
            let rs = scope.resource_scope();
            if rs.is_unused() {
                debug!(protocol = %proto, "reclaimed idle protocol scope");
                rs.done();
                false
            } else {
                true
            }
        });
        registry.peers.retain(|peer, scope| {
            let rs = scope.resource_scope();
            if rs.is_unused() {
                debug!(peer = %peer, "reclaimed idle peer scope");
                rs.done();
                false
            } else {
                true
            }
        });
    }
}

struct ReclaimerHandle {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

fn reclaim_loop(shared: &ManagerShared, stop: &mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => shared.collect_idle_scopes(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Bounds system resource consumption across every accounting axis.
///
/// The manager owns the singleton system and transient scopes, the
/// registries of per-service, per-protocol, and per-peer scopes, and the
/// background reclaimer. Connections and streams are opened through it and
/// charged against every relevant axis at once.
///
/// # Example
///
/// ```rust
/// use tollgate::{
///     Direction, FixedLimiter, Limit, PeerId, ResourceManager, Scope,
/// };
///
/// let limiter = FixedLimiter::unlimited()
///     .with_transient_limit(Limit::unlimited().with_memory(16 << 20));
/// let mgr = ResourceManager::new(limiter);
///
/// let conn = mgr.open_connection(Direction::Inbound, true)?;
/// conn.reserve_memory(4096)?;
/// conn.set_peer(&PeerId::from("peer-1"))?;
/// conn.done();
///
/// mgr.close();
/// # Ok::<(), tollgate::ResourceError>(())
/// ```
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
    reclaimer: Mutex<Option<ReclaimerHandle>>,
}

impl ResourceManager {
    /// Creates a manager with the default configuration.
    pub fn new(limiter: impl Limiter + 'static) -> Self {
        Self::with_config(limiter, ResourceManagerConfig::default())
    }

    /// Creates a manager and starts its background reclaimer.
    pub fn with_config(limiter: impl Limiter + 'static, config: ResourceManagerConfig) -> Self {
        let system = SystemScope::new(limiter.system_limits());
        system.resource_scope().inc_ref();
        let transient = TransientScope::new(limiter.transient_limits(), &system);
        transient.resource_scope().inc_ref();

        let shared = Arc::new(ManagerShared {
            limiter: Box::new(limiter),
            system,
            transient,
            registry: Mutex::new(Registry::default()),
            next_conn_ordinal: AtomicU64::new(1),
            next_stream_ordinal: AtomicU64::new(1),
        });

        let (stop, stop_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let interval = config.gc_interval;
        let handle =
            std::thread::spawn(move || reclaim_loop(&worker_shared, &stop_rx, interval));
        debug!(gc_interval = ?interval, "resource manager started");

        Self {
            shared,
            reclaimer: Mutex::new(Some(ReclaimerHandle { stop, handle })),
        }
    }

    /// Calls `f` with the system scope.
    pub fn view_system<R>(&self, f: impl FnOnce(&SystemScope) -> R) -> R {
        f(&self.shared.system)
    }

    /// Calls `f` with the transient scope.
    pub fn view_transient<R>(&self, f: impl FnOnce(&TransientScope) -> R) -> R {
        f(&self.shared.transient)
    }

    /// Calls `f` with the scope of the named service, creating it if
    /// needed. The scope must not be retained beyond the callback.
    pub fn view_service<R>(&self, svc: &ServiceName, f: impl FnOnce(&ServiceScope) -> R) -> R {
        let scope = self.shared.get_or_create_service(svc);
        let _guard = RefGuard(scope.resource_scope());
        f(&scope)
    }

    /// Calls `f` with the scope of the given protocol, creating it if
    /// needed. The scope must not be retained beyond the callback.
    pub fn view_protocol<R>(&self, proto: &ProtocolId, f: impl FnOnce(&ProtocolScope) -> R) -> R {
        let scope = self.shared.get_or_create_protocol(proto);
        let _guard = RefGuard(scope.resource_scope());
        f(&scope)
    }

    /// Calls `f` with the scope of the given peer, creating it if needed.
    /// The scope must not be retained beyond the callback.
    pub fn view_peer<R>(&self, peer: &PeerId, f: impl FnOnce(&PeerScope) -> R) -> R {
        let scope = self.shared.get_or_create_peer(peer);
        let _guard = RefGuard(scope.resource_scope());
        f(&scope)
    }

    /// Opens a connection scope constrained by `[transient, system]` and
    /// charges the connection (and its file descriptor, if `use_fd`)
    /// against both.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] if any scope along the chain does
    /// not admit the connection; nothing is charged anywhere.
    pub fn open_connection(
        &self,
        dir: Direction,
        use_fd: bool,
    ) -> Result<ConnectionScope, ResourceError> {
        let shared = &self.shared;
        let ordinal = shared.next_conn_ordinal.fetch_add(1, Ordering::Relaxed);
        let scope = ResourceScope::new(
            ScopeName::Connection(ordinal),
            shared.limiter.conn_limits(),
            vec![
                Arc::clone(shared.transient.resource_scope()),
                Arc::clone(shared.system.resource_scope()),
            ],
        );

        let conn = ConnectionScope::new(scope, dir, use_fd, Arc::clone(shared));
        if let Err(err) = conn.resource_scope().add_conn(dir, use_fd) {
            conn.done();
            return Err(err);
        }
        Ok(conn)
    }

    /// Opens a stream scope to `peer` constrained by
    /// `[peer, transient, system]` and charges the stream against all
    /// three.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] if any scope along the chain does
    /// not admit the stream; nothing is charged anywhere.
    pub fn open_stream(&self, peer: &PeerId, dir: Direction) -> Result<StreamScope, ResourceError> {
        let shared = &self.shared;
        let peer_scope = shared.get_or_create_peer(peer);
        let ordinal = shared.next_stream_ordinal.fetch_add(1, Ordering::Relaxed);
        let scope = ResourceScope::new(
            ScopeName::Stream(ordinal),
            shared.limiter.stream_limits(peer),
            vec![
                Arc::clone(peer_scope.resource_scope()),
                Arc::clone(shared.transient.resource_scope()),
                Arc::clone(shared.system.resource_scope()),
            ],
        );
        // The constraint edge now holds its own reference on the peer scope.
        peer_scope.resource_scope().dec_ref();

        let stream = StreamScope::new(scope, dir, Arc::clone(shared), peer_scope);
        if let Err(err) = stream.resource_scope().add_stream(dir) {
            stream.done();
            return Err(err);
        }
        Ok(stream)
    }

    /// Stops the background reclaimer and waits for it to exit. Further
    /// calls are no-ops.
    pub fn close(&self) {
        let handle = self
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reclaimer) = handle {
            drop(reclaimer.stop);
            if reclaimer.handle.join().is_err() {
                tracing::error!("reclaimer thread panicked");
            }
            debug!("resource manager closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::ResourceStat;
    use crate::limit::{FixedLimiter, Limit};

    fn manager(limiter: FixedLimiter) -> ResourceManager {
        // A long interval keeps the background worker out of the way; the
        // tests below drive collection by hand.
        ResourceManager::with_config(
            limiter,
            ResourceManagerConfig::default().with_gc_interval(Duration::from_secs(3600)),
        )
    }

    fn system_stat(mgr: &ResourceManager) -> ResourceStat {
        mgr.view_system(|s| s.stat())
    }

    fn transient_stat(mgr: &ResourceManager) -> ResourceStat {
        mgr.view_transient(|t| t.stat())
    }

    #[test]
    fn open_connection_charges_transient_and_system() {
        let mgr = manager(FixedLimiter::unlimited());

        let conn = mgr.open_connection(Direction::Inbound, true).unwrap();
        assert_eq!(conn.stat().conns_inbound, 1);
        assert_eq!(conn.stat().fd, 1);
        assert_eq!(transient_stat(&mgr).conns_inbound, 1);
        assert_eq!(system_stat(&mgr).fd, 1);

        conn.done();
        assert!(transient_stat(&mgr).is_zero());
        assert!(system_stat(&mgr).is_zero());
    }

    #[test]
    fn open_connection_rejected_by_transient_limit() {
        let mgr = manager(
            FixedLimiter::unlimited().with_transient_limit(Limit::unlimited().with_conns(0, 0)),
        );

        let err = mgr.open_connection(Direction::Outbound, false).unwrap_err();
        assert!(matches!(err, ResourceError::LimitExceeded { scope, .. }
            if scope == ScopeName::Transient));
        assert!(transient_stat(&mgr).is_zero());
        assert!(system_stat(&mgr).is_zero());
    }

    #[test]
    fn set_peer_migrates_charge_off_transient() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");

        let conn = mgr.open_connection(Direction::Inbound, false).unwrap();
        conn.reserve_memory(150).unwrap();
        assert_eq!(transient_stat(&mgr).memory, 150);

        conn.set_peer(&peer).unwrap();
        assert!(transient_stat(&mgr).conns_inbound == 0 && transient_stat(&mgr).memory == 0);
        assert_eq!(system_stat(&mgr).memory, 150);
        mgr.view_peer(&peer, |scope| {
            assert_eq!(scope.stat().memory, 150);
            assert_eq!(scope.stat().conns_inbound, 1);
        });
        assert_eq!(conn.peer_scope().unwrap().peer(), &peer);

        // A second attach is rejected.
        let err = conn.set_peer(&peer).unwrap_err();
        assert!(matches!(err, ResourceError::AlreadyAttached { target: "peer", .. }));

        conn.done();
        mgr.view_peer(&peer, |scope| assert!(scope.stat().is_zero()));
        assert!(system_stat(&mgr).is_zero());
    }

    #[test]
    fn failed_set_peer_leaves_connection_on_transient() {
        let mgr = manager(
            FixedLimiter::unlimited()
                .with_default_peer_limit(Limit::unlimited().with_memory(100)),
        );
        let peer = PeerId::from("p1");

        let conn = mgr.open_connection(Direction::Inbound, false).unwrap();
        conn.reserve_memory(150).unwrap();

        let err = conn.set_peer(&peer).unwrap_err();
        assert!(matches!(err, ResourceError::LimitExceeded { scope, .. }
            if scope == ScopeName::Peer(peer.clone())));
        assert!(conn.peer_scope().is_none());
        assert_eq!(transient_stat(&mgr).memory, 150);
        assert_eq!(system_stat(&mgr).memory, 150);

        // No reference leaked: the peer scope is unused and collectable.
        mgr.shared().collect_idle_scopes();
        let fresh = mgr.view_peer(&peer, |scope| scope.stat());
        assert!(fresh.is_zero());

        conn.done();
        assert!(transient_stat(&mgr).is_zero());
    }

    #[test]
    fn stream_protocol_and_service_attachment() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");
        let proto = ProtocolId::from("/test/1.0.0");
        let svc = ServiceName::from("sync");

        let stream = mgr.open_stream(&peer, Direction::Outbound).unwrap();
        assert_eq!(transient_stat(&mgr).streams_outbound, 1);
        mgr.view_peer(&peer, |scope| assert_eq!(scope.stat().streams_outbound, 1));

        // Service before protocol is rejected.
        let err = stream.set_service(&svc).unwrap_err();
        assert!(matches!(err, ResourceError::NotAttachedToProtocol { .. }));

        stream.set_protocol(&proto).unwrap();
        assert!(transient_stat(&mgr).is_zero());
        mgr.view_protocol(&proto, |scope| {
            assert_eq!(scope.stat().streams_outbound, 1);
        });
        mgr.view_peer(&peer, |scope| assert_eq!(scope.stat().streams_outbound, 1));

        stream.set_service(&svc).unwrap();
        mgr.view_service(&svc, |scope| {
            assert_eq!(scope.stat().streams_outbound, 1);
        });

        let err = stream.set_protocol(&proto).unwrap_err();
        assert!(matches!(err, ResourceError::AlreadyAttached { target: "protocol", .. }));
        let err = stream.set_service(&svc).unwrap_err();
        assert!(matches!(err, ResourceError::AlreadyAttached { target: "service", .. }));

        stream.done();
        mgr.view_peer(&peer, |scope| assert!(scope.stat().is_zero()));
        mgr.view_protocol(&proto, |scope| assert!(scope.stat().is_zero()));
        mgr.view_service(&svc, |scope| assert!(scope.stat().is_zero()));
        assert!(system_stat(&mgr).is_zero());
    }

    #[test]
    fn collector_reclaims_idle_peer_and_protocol_scopes() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");
        let proto = ProtocolId::from("/test/1.0.0");

        let stream = mgr.open_stream(&peer, Direction::Inbound).unwrap();
        stream.set_protocol(&proto).unwrap();
        stream.done();

        {
            let registry = mgr.shared().registry();
            assert!(registry.peers.contains_key(&peer));
            assert!(registry.protocols.contains_key(&proto));
        }

        mgr.shared().collect_idle_scopes();
        let registry = mgr.shared().registry();
        assert!(!registry.peers.contains_key(&peer));
        assert!(!registry.protocols.contains_key(&proto));
    }

    #[test]
    fn collector_spares_scopes_still_in_use() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");

        let stream = mgr.open_stream(&peer, Direction::Inbound).unwrap();
        mgr.shared().collect_idle_scopes();
        assert!(mgr.shared().registry().peers.contains_key(&peer));

        stream.done();
        mgr.shared().collect_idle_scopes();
        assert!(!mgr.shared().registry().peers.contains_key(&peer));
    }

    #[test]
    fn collector_leaves_service_scopes_alone() {
        let mgr = manager(FixedLimiter::unlimited());
        let svc = ServiceName::from("sync");

        mgr.view_service(&svc, |_| ());
        mgr.shared().collect_idle_scopes();
        assert!(mgr.shared().registry().services.contains_key(&svc));
    }

    #[test]
    fn views_release_their_reference() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");

        mgr.view_peer(&peer, |scope| {
            assert_eq!(scope.resource_scope().ref_count(), 1);
        });
        let registry = mgr.shared().registry();
        let scope = registry.peers.get(&peer).unwrap();
        assert_eq!(scope.resource_scope().ref_count(), 0);
    }

    #[test]
    fn registry_reuses_live_scopes() {
        let mgr = manager(FixedLimiter::unlimited());
        let peer = PeerId::from("p1");

        let first = mgr.view_peer(&peer, |scope| Arc::clone(scope.resource_scope()));
        let second = mgr.view_peer(&peer, |scope| Arc::clone(scope.resource_scope()));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn close_is_idempotent() {
        let mgr = manager(FixedLimiter::unlimited());
        mgr.close();
        mgr.close();
    }

    #[test]
    fn dropping_a_connection_releases_its_charge() {
        let mgr = manager(FixedLimiter::unlimited());

        {
            let conn = mgr.open_connection(Direction::Outbound, true).unwrap();
            conn.reserve_memory(64).unwrap();
            assert_eq!(system_stat(&mgr).memory, 64);
        }
        assert!(system_stat(&mgr).is_zero());
        assert!(transient_stat(&mgr).is_zero());
    }
}
