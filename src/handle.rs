//! # Versioned Handles
//!
//! A [`VersionedHandle`] pairs an engine snapshot with its owning session and
//! the version it observes. Handles are immutable: a session "advances" by
//! publishing a new handle into its current-version slot, never by mutating
//! an existing one.
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!   clones ──────► │ HandleInner                  │
//!   (entities,     │   id: HandleId ──────────────┼──► HandleRegistry (alive ids)
//!    slot, cells)  │   snapshot: SnapshotPtr      │
//!                  │   pinned: Option<VersionId>  │        ▲
//!                  │   session: Weak<SessionCore> │        │ swept by
//!                  └──────────────────────────────┘   VersionTracker
//! ```
//!
//! ## Liveness Without Weak Pointers
//!
//! The tracker never holds a handle. Each handle gets a [`HandleId`] that is
//! registered in the session's [`HandleRegistry`] on creation and removed when
//! the last clone is dropped. The tracker reclaims a snapshot only once its id
//! is gone from the registry, so a snapshot is never closed while any clone of
//! its handle exists.
//!
//! ## Rust Pattern: Weak Back-Reference
//!
//! Handles hold `Weak<SessionCore>`. A handle never keeps a session alive, and
//! once the session is gone every call fails with [`Error::Closed`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::api::SessionCore;
use crate::engine::{NativeEngine, SnapshotPtr};
use crate::error::{Error, Result};
use crate::types::VersionId;

// =============================================================================
// Handle Identity and Liveness
// =============================================================================

/// Identity of one [`VersionedHandle`] (shared by its clones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Side table of handle ids that still have at least one clone alive.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    next_id: AtomicU64,
    alive: Mutex<HashSet<HandleId>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and marks it alive.
    pub fn register(&self) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.alive.lock().insert(id);
        id
    }

    pub fn release(&self, id: HandleId) {
        self.alive.lock().remove(&id);
    }

    pub fn is_alive(&self, id: HandleId) -> bool {
        self.alive.lock().contains(&id)
    }

    /// Number of ids currently alive.
    pub fn alive_count(&self) -> usize {
        self.alive.lock().len()
    }
}

// =============================================================================
// VersionedHandle
// =============================================================================

struct HandleInner {
    id: HandleId,
    snapshot: SnapshotPtr,
    /// Set for frozen handles; live handles ask the engine.
    pinned: Option<VersionId>,
    session: Weak<SessionCore>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.registry().release(self.id);
        }
    }
}

/// A snapshot of the database at one version, owned by a session.
///
/// Cloning is cheap and shares identity: every clone has the same
/// [`HandleId`] and keeps the snapshot from being reclaimed.
#[derive(Clone)]
pub struct VersionedHandle {
    inner: Arc<HandleInner>,
}

impl VersionedHandle {
    /// Wraps a live snapshot owned by the writer or notifier thread.
    pub(crate) fn live(session: &Arc<SessionCore>, snapshot: SnapshotPtr) -> Self {
        Self::create(session, snapshot, None)
    }

    /// Wraps a frozen snapshot pinned at `version`.
    pub(crate) fn frozen(session: &Arc<SessionCore>, snapshot: SnapshotPtr, version: VersionId) -> Self {
        Self::create(session, snapshot, Some(version))
    }

    fn create(session: &Arc<SessionCore>, snapshot: SnapshotPtr, pinned: Option<VersionId>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: session.registry().register(),
                snapshot,
                pinned,
                session: Arc::downgrade(session),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Version observed by this handle.
    ///
    /// Constant for frozen handles. For live handles it only ever increases.
    pub fn version(&self) -> Result<VersionId> {
        self.check_open()?;
        match self.inner.pinned {
            Some(version) => Ok(version),
            None => Ok(self.engine()?.version(self.inner.snapshot)?),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.pinned.is_some()
    }

    /// True once the owning session or the snapshot itself was released.
    pub fn is_closed(&self) -> bool {
        match self.inner.session.upgrade() {
            Some(session) => session.is_closed() || session.engine().is_closed(self.inner.snapshot),
            None => true,
        }
    }

    /// Fails with [`Error::Closed`] if the handle can no longer be used.
    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!(
                "{} (handle {}) has been released",
                self.inner.snapshot,
                self.inner.id.as_raw()
            )));
        }
        Ok(())
    }

    /// True if `self` observes a strictly newer version than `other`.
    pub fn is_newer_than(&self, other: &VersionedHandle) -> Result<bool> {
        Ok(self.version()? > other.version()?)
    }

    /// True if both handles are clones of one another.
    pub fn same_handle(&self, other: &VersionedHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn snapshot(&self) -> SnapshotPtr {
        self.inner.snapshot
    }

    pub(crate) fn session(&self) -> Result<Arc<SessionCore>> {
        self.inner
            .session
            .upgrade()
            .ok_or_else(|| Error::closed("session has been dropped"))
    }

    /// Engine of the owning session, failing if the session is gone.
    pub(crate) fn engine(&self) -> Result<Arc<dyn NativeEngine>> {
        Ok(Arc::clone(self.session()?.engine()))
    }

    /// Pins the current version of a live handle into a new frozen handle.
    pub(crate) fn freeze(&self) -> Result<VersionedHandle> {
        if self.is_frozen() {
            return Err(Error::invalid_state("handle is already frozen"));
        }
        self.check_open()?;
        let session = self.session()?;
        let engine = session.engine();
        let snapshot = engine.freeze(self.inner.snapshot)?;
        let version = engine.version(snapshot)?;
        Ok(VersionedHandle::frozen(&session, snapshot, version))
    }
}

impl fmt::Debug for VersionedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedHandle")
            .field("id", &self.inner.id.as_raw())
            .field("snapshot", &self.inner.snapshot.as_raw())
            .field("pinned", &self.inner.pinned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_liveness() {
        let registry = HandleRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.alive_count(), 2);

        registry.release(a);
        assert!(!registry.is_alive(a));
        assert!(registry.is_alive(b));
        // releasing twice is harmless
        registry.release(a);
        assert_eq!(registry.alive_count(), 1);
    }
}
