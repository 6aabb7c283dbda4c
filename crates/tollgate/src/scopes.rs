//! Typed scopes: system, transient, service, protocol, peer, connection,
//! and stream.
//!
//! Each wraps a [`ResourceScope`] with identity metadata and the constraint
//! chain fixed at construction:
//!
//! ```text
//! system      ─ (no constraints)
//! transient   ─ [system]
//! service     ─ [system]
//! protocol    ─ [system]
//! peer        ─ [system]
//! connection  ─ [transient, system]
//! stream      ─ [peer, transient, system]
//! ```
//!
//! Connection and stream chains are reshaped by the edge-migration
//! operations ([`ConnectionScope::set_peer`], [`StreamScope::set_protocol`],
//! [`StreamScope::set_service`]) once the remote identity is learned; all
//! other chains are immutable.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ResourceError;
use crate::limit::Limit;
use crate::manager::ManagerShared;
use crate::scope::{ResourceScope, Scope};
use crate::types::{Direction, PeerId, ProtocolId, ScopeName, ServiceName};

/// The root of the hierarchy; every reservation ultimately fits within it.
#[derive(Debug, Clone)]
pub struct SystemScope {
    scope: Arc<ResourceScope>,
}

impl SystemScope {
    pub(crate) fn new(limit: Limit) -> Self {
        Self {
            scope: ResourceScope::new(ScopeName::System, limit, Vec::new()),
        }
    }
}

impl Scope for SystemScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

/// Holds activity not yet attributable to a peer or protocol; migrated away
/// from as soon as identity is known.
#[derive(Debug, Clone)]
pub struct TransientScope {
    scope: Arc<ResourceScope>,
}

impl TransientScope {
    pub(crate) fn new(limit: Limit, system: &SystemScope) -> Self {
        Self {
            scope: ResourceScope::new(
                ScopeName::Transient,
                limit,
                vec![Arc::clone(system.resource_scope())],
            ),
        }
    }
}

impl Scope for TransientScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

/// Accounts all streams attached to one logical service.
#[derive(Debug, Clone)]
pub struct ServiceScope {
    name: ServiceName,
    scope: Arc<ResourceScope>,
}

impl ServiceScope {
    pub(crate) fn new(name: ServiceName, limit: Limit, system: &SystemScope) -> Self {
        let scope = ResourceScope::new(
            ScopeName::Service(name.clone()),
            limit,
            vec![Arc::clone(system.resource_scope())],
        );
        Self { name, scope }
    }

    /// The service this scope accounts for.
    #[must_use]
    pub fn name(&self) -> &ServiceName {
        &self.name
    }
}

impl Scope for ServiceScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

/// Accounts all streams speaking one wire protocol.
#[derive(Debug, Clone)]
pub struct ProtocolScope {
    proto: ProtocolId,
    scope: Arc<ResourceScope>,
}

impl ProtocolScope {
    pub(crate) fn new(proto: ProtocolId, limit: Limit, system: &SystemScope) -> Self {
        let scope = ResourceScope::new(
            ScopeName::Protocol(proto.clone()),
            limit,
            vec![Arc::clone(system.resource_scope())],
        );
        Self { proto, scope }
    }

    /// The protocol this scope accounts for.
    #[must_use]
    pub fn protocol(&self) -> &ProtocolId {
        &self.proto
    }
}

impl Scope for ProtocolScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

/// Accounts all connections and streams of one remote peer.
#[derive(Debug, Clone)]
pub struct PeerScope {
    peer: PeerId,
    scope: Arc<ResourceScope>,
}

impl PeerScope {
    pub(crate) fn new(peer: PeerId, limit: Limit, system: &SystemScope) -> Self {
        let scope = ResourceScope::new(
            ScopeName::Peer(peer.clone()),
            limit,
            vec![Arc::clone(system.resource_scope())],
        );
        Self { peer, scope }
    }

    /// The peer this scope accounts for.
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl Scope for PeerScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

/// The scope of a single connection.
///
/// Born constrained by `[transient, system]`; [`ConnectionScope::set_peer`]
/// re-parents it onto the peer's scope once the remote identity is known.
/// Call [`ConnectionScope::done`] when the connection terminates; dropping
/// the scope has the same effect.
pub struct ConnectionScope {
    scope: Arc<ResourceScope>,
    dir: Direction,
    use_fd: bool,
    mgr: Arc<ManagerShared>,
    peer: Mutex<Option<PeerScope>>,
}

impl ConnectionScope {
    pub(crate) fn new(
        scope: Arc<ResourceScope>,
        dir: Direction,
        use_fd: bool,
        mgr: Arc<ManagerShared>,
    ) -> Self {
        Self {
            scope,
            dir,
            use_fd,
            mgr,
            peer: Mutex::new(None),
        }
    }

    fn peer_link(&self) -> MutexGuard<'_, Option<PeerScope>> {
        self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direction of the connection.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Whether the connection is charged a file descriptor.
    #[must_use]
    pub fn uses_fd(&self) -> bool {
        self.use_fd
    }

    /// The peer scope the connection is attached to, if any.
    #[must_use]
    pub fn peer_scope(&self) -> Option<PeerScope> {
        self.peer_link().clone()
    }

    /// Attaches the connection to `peer`, migrating its whole charge off
    /// the transient scope onto the peer scope. At every observable moment
    /// the charge is held by exactly one of the two, and by the system
    /// scope throughout.
    ///
    /// # Errors
    ///
    /// [`ResourceError::AlreadyAttached`] on a second call;
    /// [`ResourceError::LimitExceeded`] if the peer scope does not admit
    /// the connection's current usage, in which case nothing has changed;
    /// [`ResourceError::ScopeClosed`] after `done()`.
    pub fn set_peer(&self, peer: &PeerId) -> Result<(), ResourceError> {
        let peer_scope = self.mgr.get_or_create_peer(peer);
        let mut link = self.peer_link();
        if link.is_some() {
            peer_scope.resource_scope().dec_ref();
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().clone(),
                target: "peer",
            });
        }

        let constraints = vec![
            Arc::clone(peer_scope.resource_scope()),
            Arc::clone(self.mgr.system().resource_scope()),
        ];
        if let Err(err) = self.scope.migrate(
            peer_scope.resource_scope(),
            Some(self.mgr.transient().resource_scope()),
            constraints,
        ) {
            peer_scope.resource_scope().dec_ref();
            return Err(err);
        }

        *link = Some(peer_scope);
        Ok(())
    }

    /// Retires the connection, returning its usage to every constraint.
    pub fn done(&self) {
        self.scope.done();
    }
}

impl Scope for ConnectionScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.scope.done();
    }
}

impl fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("name", self.scope.name())
            .field("dir", &self.dir)
            .field("use_fd", &self.use_fd)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct StreamLinks {
    proto: Option<ProtocolScope>,
    svc: Option<ServiceScope>,
}

/// The scope of a single stream.
///
/// Born constrained by `[peer, transient, system]`;
/// [`StreamScope::set_protocol`] migrates the transient charge onto the
/// protocol scope, and [`StreamScope::set_service`] additionally charges a
/// service scope. Call [`StreamScope::done`] when the stream closes;
/// dropping the scope has the same effect.
pub struct StreamScope {
    scope: Arc<ResourceScope>,
    dir: Direction,
    mgr: Arc<ManagerShared>,
    peer: PeerScope,
    links: Mutex<StreamLinks>,
}

impl StreamScope {
    pub(crate) fn new(
        scope: Arc<ResourceScope>,
        dir: Direction,
        mgr: Arc<ManagerShared>,
        peer: PeerScope,
    ) -> Self {
        Self {
            scope,
            dir,
            mgr,
            peer,
            links: Mutex::new(StreamLinks::default()),
        }
    }

    fn links(&self) -> MutexGuard<'_, StreamLinks> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direction of the stream.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// The peer scope the stream belongs to.
    #[must_use]
    pub fn peer_scope(&self) -> &PeerScope {
        &self.peer
    }

    /// The protocol scope the stream is attached to, if any.
    #[must_use]
    pub fn protocol_scope(&self) -> Option<ProtocolScope> {
        self.links().proto.clone()
    }

    /// The service scope the stream is attached to, if any.
    #[must_use]
    pub fn service_scope(&self) -> Option<ServiceScope> {
        self.links().svc.clone()
    }

    /// Attaches the stream to `proto`, migrating its whole charge off the
    /// transient scope onto the protocol scope. The peer and system
    /// charges, made when the stream was opened, stay where they are.
    ///
    /// # Errors
    ///
    /// [`ResourceError::AlreadyAttached`] on a second call;
    /// [`ResourceError::LimitExceeded`] if the protocol scope does not
    /// admit the stream's current usage, in which case nothing has
    /// changed; [`ResourceError::ScopeClosed`] after `done()`.
    pub fn set_protocol(&self, proto: &ProtocolId) -> Result<(), ResourceError> {
        let proto_scope = self.mgr.get_or_create_protocol(proto);
        let mut link = self.links();
        if link.proto.is_some() {
            proto_scope.resource_scope().dec_ref();
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().clone(),
                target: "protocol",
            });
        }

        let constraints = vec![
            Arc::clone(self.peer.resource_scope()),
            Arc::clone(proto_scope.resource_scope()),
            Arc::clone(self.mgr.system().resource_scope()),
        ];
        if let Err(err) = self.scope.migrate(
            proto_scope.resource_scope(),
            Some(self.mgr.transient().resource_scope()),
            constraints,
        ) {
            proto_scope.resource_scope().dec_ref();
            return Err(err);
        }

        link.proto = Some(proto_scope);
        Ok(())
    }

    /// Attaches the stream to the named service. The service is an
    /// additional accounting axis: the stream's current usage is newly
    /// charged to the service scope and nothing is released elsewhere.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NotAttachedToProtocol`] before `set_protocol`;
    /// [`ResourceError::AlreadyAttached`] on a second call;
    /// [`ResourceError::LimitExceeded`] if the service scope does not
    /// admit the stream's current usage; [`ResourceError::ScopeClosed`]
    /// after `done()`.
    pub fn set_service(&self, svc: &ServiceName) -> Result<(), ResourceError> {
        self.check_service_preconditions()?;

        let svc_scope = self.mgr.get_or_create_service(svc);
        let mut link = self.links();
        // Re-check under the lock; a racing call may have attached first.
        let proto = match link.proto.as_ref() {
            Some(p) => Arc::clone(p.resource_scope()),
            None => {
                svc_scope.resource_scope().dec_ref();
                return Err(ResourceError::NotAttachedToProtocol {
                    scope: self.scope.name().clone(),
                });
            }
        };
        if link.svc.is_some() {
            svc_scope.resource_scope().dec_ref();
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().clone(),
                target: "service",
            });
        }

        let constraints = vec![
            Arc::clone(self.peer.resource_scope()),
            proto,
            Arc::clone(svc_scope.resource_scope()),
            Arc::clone(self.mgr.system().resource_scope()),
        ];
        if let Err(err) = self
            .scope
            .migrate(svc_scope.resource_scope(), None, constraints)
        {
            svc_scope.resource_scope().dec_ref();
            return Err(err);
        }

        link.svc = Some(svc_scope);
        Ok(())
    }

    fn check_service_preconditions(&self) -> Result<(), ResourceError> {
        let link = self.links();
        if link.proto.is_none() {
            return Err(ResourceError::NotAttachedToProtocol {
                scope: self.scope.name().clone(),
            });
        }
        if link.svc.is_some() {
            return Err(ResourceError::AlreadyAttached {
                scope: self.scope.name().clone(),
                target: "service",
            });
        }
        Ok(())
    }

    /// Retires the stream, returning its usage to every constraint.
    pub fn done(&self) {
        self.scope.done();
    }
}

impl Scope for StreamScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        self.scope.done();
    }
}

impl fmt::Debug for StreamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamScope")
            .field("name", self.scope.name())
            .field("dir", &self.dir)
            .field("peer", self.peer.peer())
            .finish_non_exhaustive()
    }
}
