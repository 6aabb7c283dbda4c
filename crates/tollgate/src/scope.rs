//! The resource scope primitive.
//!
//! A [`ResourceScope`] is one node in the accounting hierarchy: a counter
//! plus the ordered list of parent scopes every reservation made here must
//! also fit within. Reservation is all-or-nothing: parents are charged
//! left to right, and on any failure every previously charged parent is
//! credited back before the error is returned.
//!
//! Scopes are reference counted. Constructing a scope takes a reference on
//! each of its constraint parents; [`ResourceScope::done`] returns the
//! scope's usage to every parent, drops those references, and permanently
//! retires the scope. A scope with no references and no usage is *unused*
//! and may be reclaimed by the manager.
//!
//! # Locking
//!
//! Each scope owns one mutex over its whole state. A scope takes a parent's
//! lock only while holding its own, and parents never take a child's lock,
//! so lock acquisition follows the (acyclic) child-to-parent edges and
//! cannot deadlock. Constraint chains are at most four deep; no lock is
//! held across anything but counter arithmetic.
//!
//! # Spans
//!
//! [`Scope::begin_span`] opens a transaction scope whose charges propagate
//! through the owner's whole constraint chain. Aborting the span, either
//! explicitly or by dropping it, releases everything it accumulated as one
//! unit; committing makes the charges permanent on the owner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::counter::{ResourceCounter, ResourceStat};
use crate::error::ResourceError;
use crate::limit::Limit;
use crate::types::{Direction, ScopeName};

static NEXT_SPAN_ORDINAL: AtomicU64 = AtomicU64::new(1);

/// Parent linkage of a scope.
enum Parents {
    /// Constraint edges of a hierarchy scope. The full chain is flattened
    /// into this list, so each edge is charged on its own counter only.
    Edges(Vec<Arc<ResourceScope>>),
    /// Owner of a span scope; charges propagate through the owner's whole
    /// constraint chain.
    Owner(Arc<ResourceScope>),
}

struct ScopeState {
    rc: ResourceCounter,
    parents: Parents,
    refs: u64,
    done: bool,
}

/// One node in the resource accounting hierarchy.
pub struct ResourceScope {
    name: ScopeName,
    state: Mutex<ScopeState>,
}

impl ResourceScope {
    /// Creates a scope constrained by `constraints`, taking a reference on
    /// each of them.
    pub(crate) fn new(
        name: ScopeName,
        limit: Limit,
        constraints: Vec<Arc<ResourceScope>>,
    ) -> Arc<Self> {
        for constraint in &constraints {
            constraint.inc_ref();
        }
        Arc::new(Self {
            name,
            state: Mutex::new(ScopeState {
                rc: ResourceCounter::new(limit),
                parents: Parents::Edges(constraints),
                refs: 0,
                done: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The scope's identity, as carried in errors and log events.
    #[must_use]
    pub fn name(&self) -> &ScopeName {
        &self.name
    }

    /// Reserves `delta` against this scope and every constraint parent.
    ///
    /// The operation is all-or-nothing: if any counter along the way does
    /// not admit the delta, everything charged so far is credited back and
    /// the failure is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] naming the scope that rejected the
    /// delta, or [`ResourceError::ScopeClosed`] after `done()`.
    pub fn reserve(&self, delta: &ResourceStat) -> Result<(), ResourceError> {
        let mut st = self.lock();
        if st.done {
            return Err(ResourceError::ScopeClosed {
                scope: self.name.clone(),
            });
        }
        let ScopeState { rc, parents, .. } = &mut *st;
        match parents {
            Parents::Edges(edges) => {
                let mut charged = 0;
                let mut failure = None;
                for edge in edges.iter() {
                    match edge.reserve_for_child(delta) {
                        Ok(()) => charged += 1,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                if let Some(err) = failure {
                    for edge in edges[..charged].iter().rev() {
                        edge.release_for_child(delta);
                    }
                    return Err(err);
                }
                if let Err(exceeded) = rc.reserve(delta) {
                    for edge in edges.iter().rev() {
                        edge.release_for_child(delta);
                    }
                    return Err(exceeded.into_error(self.name.clone()));
                }
            }
            Parents::Owner(owner) => {
                owner.reserve(delta)?;
                if let Err(exceeded) = rc.reserve(delta) {
                    owner.release(delta);
                    return Err(exceeded.into_error(self.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Releases `delta` from this scope and every constraint parent.
    pub fn release(&self, delta: &ResourceStat) {
        let mut st = self.lock();
        if st.done {
            return;
        }
        let ScopeState { rc, parents, .. } = &mut *st;
        match parents {
            Parents::Edges(edges) => {
                for edge in edges.iter().rev() {
                    edge.release_for_child(delta);
                }
            }
            Parents::Owner(owner) => owner.release(delta),
        }
        if let Err(underflow) = rc.release(delta) {
            let err = underflow.into_error(self.name.clone());
            tracing::error!(error = %err, "accounting underflow");
        }
    }

    /// Charges `delta` on this scope's counter only, leaving the parent
    /// chain untouched. Used when a child has already charged the rest of
    /// the chain; this is the building block of edge migration.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] or [`ResourceError::ScopeClosed`].
    pub(crate) fn reserve_for_child(&self, delta: &ResourceStat) -> Result<(), ResourceError> {
        let mut st = self.lock();
        if st.done {
            return Err(ResourceError::ScopeClosed {
                scope: self.name.clone(),
            });
        }
        st.rc
            .reserve(delta)
            .map_err(|exceeded| exceeded.into_error(self.name.clone()))
    }

    /// Debits `delta` from this scope's counter only.
    pub(crate) fn release_for_child(&self, delta: &ResourceStat) {
        let mut st = self.lock();
        if st.done {
            return;
        }
        if let Err(underflow) = st.rc.release(delta) {
            let err = underflow.into_error(self.name.clone());
            tracing::error!(error = %err, "accounting underflow");
        }
    }

    /// Reserves one connection (and a file descriptor, if `use_fd`).
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] or [`ResourceError::ScopeClosed`].
    pub fn add_conn(&self, dir: Direction, use_fd: bool) -> Result<(), ResourceError> {
        self.reserve(&ResourceStat::conn(dir, use_fd))
    }

    /// Releases one connection previously added with [`Self::add_conn`].
    pub fn remove_conn(&self, dir: Direction, use_fd: bool) {
        self.release(&ResourceStat::conn(dir, use_fd));
    }

    /// Reserves one stream.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] or [`ResourceError::ScopeClosed`].
    pub fn add_stream(&self, dir: Direction) -> Result<(), ResourceError> {
        self.reserve(&ResourceStat::stream(dir))
    }

    /// Releases one stream previously added with [`Self::add_stream`].
    pub fn remove_stream(&self, dir: Direction) {
        self.release(&ResourceStat::stream(dir));
    }

    /// Reserves `n` bytes of memory.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] or [`ResourceError::ScopeClosed`].
    pub fn reserve_memory(&self, n: u64) -> Result<(), ResourceError> {
        self.reserve(&ResourceStat::memory(n))
    }

    /// Releases `n` bytes of memory.
    pub fn release_memory(&self, n: u64) {
        self.release(&ResourceStat::memory(n));
    }

    /// Snapshot of the scope's usage.
    #[must_use]
    pub fn stat(&self) -> ResourceStat {
        self.lock().rc.stat()
    }

    /// The scope's immutable limit.
    #[must_use]
    pub fn limit(&self) -> Limit {
        self.lock().rc.limit()
    }

    /// True once `done()` has retired the scope.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().done
    }

    pub(crate) fn inc_ref(&self) {
        self.lock().refs += 1;
    }

    pub(crate) fn dec_ref(&self) {
        let mut st = self.lock();
        if st.refs == 0 {
            tracing::error!(scope = %self.name, "reference count underflow");
            return;
        }
        st.refs -= 1;
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u64 {
        self.lock().refs
    }

    /// True when nothing references the scope and nothing is charged to it.
    /// Only unused scopes are reclaimable.
    pub(crate) fn is_unused(&self) -> bool {
        let st = self.lock();
        !st.done && st.refs == 0 && st.rc.stat().is_zero()
    }

    /// Retires the scope: returns its usage to every parent, drops the
    /// references its constraint edges held, and zeroes the counter. After
    /// the first call every further operation fails with `ScopeClosed`;
    /// further `done()` calls are no-ops.
    pub fn done(&self) {
        let mut st = self.lock();
        if st.done {
            return;
        }
        let stat = st.rc.stat();
        match &st.parents {
            Parents::Edges(edges) => {
                for edge in edges {
                    edge.release_for_child(&stat);
                    edge.dec_ref();
                }
            }
            Parents::Owner(owner) => {
                owner.release(&stat);
                owner.dec_ref();
            }
        }
        st.rc.clear();
        st.done = true;
    }

    /// Moves this scope onto a new parent: charges the scope's current
    /// usage on `adopt` (its counter only), credits it back on `evict` if
    /// one is given, and replaces the constraint list. On failure nothing
    /// has changed and the caller still owns the reference it took on
    /// `adopt`.
    pub(crate) fn migrate(
        &self,
        adopt: &Arc<ResourceScope>,
        evict: Option<&Arc<ResourceScope>>,
        constraints: Vec<Arc<ResourceScope>>,
    ) -> Result<(), ResourceError> {
        let mut st = self.lock();
        if st.done {
            return Err(ResourceError::ScopeClosed {
                scope: self.name.clone(),
            });
        }
        let stat = st.rc.stat();
        adopt.reserve_for_child(&stat)?;
        if let Some(old) = evict {
            old.release_for_child(&stat);
            old.dec_ref();
        }
        st.parents = Parents::Edges(constraints);
        Ok(())
    }

    fn commit_span(&self) {
        let mut st = self.lock();
        if st.done {
            return;
        }
        if let Parents::Owner(owner) = &st.parents {
            owner.dec_ref();
        }
        st.rc.clear();
        st.done = true;
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ResourceScope")
            .field("name", &self.name)
            .field("used", &st.rc.stat())
            .field("refs", &st.refs)
            .field("done", &st.done)
            .finish()
    }
}

/// Accounting surface shared by every scope type.
pub trait Scope {
    /// The underlying resource scope primitive.
    fn resource_scope(&self) -> &Arc<ResourceScope>;

    /// Reserves `n` bytes of memory against this scope and its constraints.
    ///
    /// # Errors
    ///
    /// [`ResourceError::LimitExceeded`] or [`ResourceError::ScopeClosed`].
    fn reserve_memory(&self, n: u64) -> Result<(), ResourceError> {
        self.resource_scope().reserve_memory(n)
    }

    /// Releases `n` bytes of memory.
    fn release_memory(&self, n: u64) {
        self.resource_scope().release_memory(n);
    }

    /// Snapshot of this scope's usage.
    fn stat(&self) -> ResourceStat {
        self.resource_scope().stat()
    }

    /// Opens a transaction span on this scope. Charges made on the span
    /// propagate through this scope's whole constraint chain and can be
    /// aborted as one unit.
    ///
    /// # Errors
    ///
    /// [`ResourceError::ScopeClosed`] if this scope is already retired.
    fn begin_span(&self) -> Result<SpanScope, ResourceError> {
        let owner = self.resource_scope();
        let limit;
        {
            let mut st = owner.lock();
            if st.done {
                return Err(ResourceError::ScopeClosed {
                    scope: owner.name.clone(),
                });
            }
            limit = st.rc.limit();
            st.refs += 1;
        }
        let ordinal = NEXT_SPAN_ORDINAL.fetch_add(1, Ordering::Relaxed);
        let scope = Arc::new(ResourceScope {
            name: ScopeName::Span(ordinal),
            state: Mutex::new(ScopeState {
                rc: ResourceCounter::new(limit),
                parents: Parents::Owner(Arc::clone(owner)),
                refs: 0,
                done: false,
            }),
        });
        Ok(SpanScope { scope })
    }
}

/// A transaction over a scope: reservations accumulate on the span and are
/// released as one unit on [`SpanScope::abort`] (or drop), or made
/// permanent on the owner chain by [`SpanScope::commit`].
#[derive(Debug)]
pub struct SpanScope {
    scope: Arc<ResourceScope>,
}

impl SpanScope {
    /// Makes the accumulated charges permanent on the owner chain and
    /// retires the span.
    pub fn commit(self) {
        self.scope.commit_span();
    }

    /// Releases everything the span accumulated and retires it. Dropping
    /// an uncommitted span has the same effect.
    pub fn abort(self) {
        self.scope.done();
    }
}

impl Scope for SpanScope {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }
}

impl Scope for Arc<ResourceScope> {
    fn resource_scope(&self) -> &Arc<ResourceScope> {
        self
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        self.scope.done();
    }
}

/// Releases an extra scope reference on drop, on every exit path.
pub(crate) struct RefGuard<'a>(pub(crate) &'a Arc<ResourceScope>);

impl Drop for RefGuard<'_> {
    fn drop(&mut self) {
        self.0.dec_ref();
    }
}
