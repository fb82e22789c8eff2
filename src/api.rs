//! # Session API
//!
//! [`Session`] is the public entry point. It owns one engine connection and
//! two dedicated execution contexts, and publishes the latest frozen version
//! every reader sees.
//!
//! ```text
//!   async callers                                   ┌──────────────────┐
//!   ──────────────                                  │  writer thread   │
//!   session.write(|tx| ..) ──── mpsc ─────────────► │  live snapshot   │──┐
//!                                                   └──────────────────┘  │ publish
//!   session.subscribe(&e) ──── mpsc ─────────────►  ┌──────────────────┐  │ (frozen)
//!   session.version_changes()                       │ notifier thread  │──┤
//!                                                   │  live snapshot   │  │
//!                                                   └──────────────────┘  ▼
//!   session.current() ◄──────────────────────── ┌────────────────────────────┐
//!   session.results("Item")                     │ slot: Mutex<VersionSlot>   │
//!                                               │   current: frozen handle   │
//!                                               │   tracker: VersionTracker  │
//!                                               └────────────────────────────┘
//! ```
//!
//! ## Current-Version Slot
//!
//! Publication is a compare-and-replace under one lock: a handle replaces the
//! current one only if it observes a strictly newer version. The writer and
//! the notifier race to publish the same commit and whichever arrives second
//! is a no-op. Every published frozen handle is handed to the
//! [`VersionTracker`] in the same critical section, which also sweeps
//! snapshots nobody references any more.
//!
//! ## Lifecycle
//!
//! `open → (write | subscribe | read)* → close`. Closing rejects while a
//! write transaction is open, stops both threads, and releases every
//! tracked snapshot. After close every handle of the session fails with
//! [`Error::Closed`]. Close is idempotent.
//!
//! ## Rust Pattern: Shared Core, Weak Back-References
//!
//! `Session` is a cheap `Clone` around `Arc<SessionCore>`. The threads and
//! every [`VersionedHandle`] only hold `Weak<SessionCore>`, so dropping the
//! last `Session` tears everything down even without an explicit close.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::engine::memory::MemoryEngine;
use crate::engine::{NativeEngine, Target};
use crate::entity::{Managed, ObjectRef, ResultsRef};
use crate::error::{Error, Result};
use crate::handle::{HandleRegistry, VersionedHandle};
use crate::notifier::NotifierSession;
use crate::observable::Observable;
use crate::subscription::{Subscription, VersionChanges};
use crate::tracker::{close_snapshot, VersionTracker};
use crate::types::{ObjectKey, VersionId};
use crate::writer::{spawn_writer, writer_channel, WriteContext, WriteOutput, WriterSession};

// =============================================================================
// Session Core
// =============================================================================

struct VersionSlot {
    current: Option<VersionedHandle>,
    tracker: VersionTracker,
}

/// State shared by a session, its threads, and its handles.
pub(crate) struct SessionCore {
    config: SessionConfig,
    engine: Arc<dyn NativeEngine>,
    registry: HandleRegistry,
    closed: AtomicBool,
    slot: Mutex<VersionSlot>,
    writer: WriterSession,
    notifier: NotifierSession,
}

impl SessionCore {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub(crate) fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("session '{}' has been closed", self.config.name)));
        }
        Ok(())
    }

    /// Offers a frozen handle to the current-version slot.
    ///
    /// Replaces the current handle only if `handle` is strictly newer. The
    /// handle is tracked either way and unreachable snapshots are reclaimed.
    pub(crate) fn publish(&self, handle: VersionedHandle) -> Result<()> {
        let mut slot = self.slot.lock();
        if self.is_closed() {
            drop(slot);
            // the tracker has already been drained
            close_snapshot(self.engine.as_ref(), handle.snapshot());
            return Err(Error::closed("cannot publish into a closed session"));
        }

        let version = handle.version()?;
        let newer = match &slot.current {
            Some(current) => version > current.version()?,
            None => true,
        };
        if newer {
            debug!(version = %version, "published version");
            // dropping the old handle releases its id before the sweep
            slot.current = Some(handle.clone());
        }

        let VersionSlot { tracker, .. } = &mut *slot;
        tracker.track_and_reclaim(self.engine.as_ref(), &self.registry, &handle);
        Ok(())
    }

    fn current(&self) -> Result<VersionedHandle> {
        self.check_open()?;
        self.slot
            .lock()
            .current
            .clone()
            .ok_or_else(|| Error::invalid_state("session has no published version"))
    }

    /// Marks the session closed and releases every tracked snapshot.
    fn release_tracked(&self) -> usize {
        let mut slot = self.slot.lock();
        self.closed.store(true, Ordering::SeqCst);
        slot.current = None;
        let VersionSlot { tracker, .. } = &mut *slot;
        tracker.close(self.engine.as_ref())
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.closed.store(true, Ordering::SeqCst);
            let released = self.slot.get_mut().tracker.close(self.engine.as_ref());
            debug!(released, session = %self.config.name, "session dropped without close");
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A connection to a multi-version database.
///
/// `Session` is `Clone`, `Send`, and `Sync`; clones share one writer, one
/// notifier, and one current version.
///
/// # Example
///
/// ```ignore
/// let session = Session::open_in_memory().await?;
///
/// let item = session
///     .write(|tx| tx.create("Item", 1, Row::new()))
///     .await?;
///
/// let mut sub = session.results("Item")?.subscribe().await?;
/// while let Some(change) = sub.next().await {
///     println!("{change:?}");
/// }
/// ```
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Opens a session over `engine`.
    ///
    /// The writer thread starts immediately. The notifier starts on the first
    /// subscription unless `config.lazy_notifier` is false.
    pub async fn open(engine: Arc<dyn NativeEngine>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let live = engine.open()?;
        let (writer, rx, in_transaction) = writer_channel(config.write_queue_capacity);
        let lazy = config.lazy_notifier;

        let core = Arc::new(SessionCore {
            config,
            engine,
            registry: HandleRegistry::new(),
            closed: AtomicBool::new(false),
            slot: Mutex::new(VersionSlot {
                current: None,
                tracker: VersionTracker::new(),
            }),
            writer,
            notifier: NotifierSession::new(),
        });

        let initial = VersionedHandle::live(&core, live).freeze();
        let initial = match initial {
            Ok(initial) => initial,
            Err(err) => {
                close_snapshot(core.engine.as_ref(), live);
                return Err(err);
            }
        };
        core.publish(initial)?;

        spawn_writer(&core, live, rx, in_transaction)?;
        if !lazy {
            core.notifier.start(&core)?;
        }

        info!(session = %core.config.name, version = %core.current()?.version()?, "session opened");
        Ok(Self { core })
    }

    /// Opens a session over a fresh [`MemoryEngine`] with default config.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(MemoryEngine::shared(), SessionConfig::default()).await
    }

    pub(crate) fn from_core(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// The engine this session is connected to.
    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.core.engine
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The frozen handle of the latest version this session has published.
    pub fn current(&self) -> Result<VersionedHandle> {
        self.core.current()
    }

    pub fn version(&self) -> Result<VersionId> {
        self.current()?.version()
    }

    /// All objects of `class` at the current version.
    pub fn results(&self, class: &str) -> Result<ResultsRef> {
        let current = self.current()?;
        Ok(ResultsRef::from_managed(Managed::new(
            current,
            Target::Results {
                class: class.to_string(),
            },
        )))
    }

    /// The object with `key` at the current version, if it exists.
    pub fn object(&self, class: &str, key: impl Into<ObjectKey>) -> Result<Option<ObjectRef>> {
        let current = self.current()?;
        ObjectRef::managed_at(current.clone(), class, key.into()).freeze(&current)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Runs `block` in a write transaction on the writer thread.
    ///
    /// The transaction commits when the block returns `Ok` (unless the block
    /// already committed or cancelled) and rolls back when it returns `Err`.
    /// Entities in the result are frozen at the committed version; an entity
    /// deleted by the block comes back as `None`.
    pub async fn write<F, R>(&self, block: F) -> Result<R::Frozen>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<R> + Send + 'static,
        R: WriteOutput,
    {
        self.core.check_open()?;
        self.core.writer.execute(block).await
    }

    /// True while a write block is running inside a transaction.
    pub fn is_in_transaction(&self) -> bool {
        self.core.writer.is_in_transaction()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Subscribes to changes of a managed entity.
    ///
    /// The first event is always the initial state. Fails with
    /// [`Error::DeletedReference`] if the entity no longer exists at the
    /// notifier's version.
    pub async fn subscribe<T: Observable>(&self, entity: &T) -> Result<Subscription<T::Event>> {
        self.core.check_open()?;
        self.core.notifier.subscribe(&self.core, entity.clone()).await
    }

    /// A stream of frozen handles, one per version the notifier observes.
    ///
    /// Latest wins: a slow consumer skips intermediate versions.
    pub fn version_changes(&self) -> Result<VersionChanges> {
        self.core.check_open()?;
        self.core.notifier.version_changes(&self.core)
    }

    /// True once the notifier thread has been started.
    pub fn is_notifier_started(&self) -> bool {
        self.core.notifier.is_started()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Versions of the frozen snapshots still held open by this session.
    pub fn tracked_versions(&self) -> Vec<VersionId> {
        self.core.slot.lock().tracker.versions()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Stops both threads and releases every snapshot.
    ///
    /// Fails with [`Error::CloseDuringTransaction`] while a write block is
    /// inside a transaction. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        if self.core.writer.is_in_transaction() {
            return Err(Error::CloseDuringTransaction);
        }

        self.core.writer.shutdown().await?;
        self.core.notifier.shutdown().await;

        let released = self.core.release_tracked();
        info!(session = %self.core.config.name, released, "session closed");
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.core.config.name)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;

    #[tokio::test]
    async fn test_open_publishes_initial_version() {
        let session = Session::open_in_memory().await.unwrap();
        assert_eq!(session.version().unwrap(), VersionId::INITIAL);
        assert!(session.current().unwrap().is_frozen());
        assert!(!session.is_notifier_started());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_ignores_older_versions() {
        let session = Session::open_in_memory().await.unwrap();
        let before = session.current().unwrap();
        session
            .write(|tx| tx.create("Item", 1, Row::new()).map(|_| ()))
            .await
            .unwrap();
        let after = session.current().unwrap();
        assert!(after.is_newer_than(&before).unwrap());

        // republishing the stale handle leaves the slot alone
        session.core.publish(before.clone()).unwrap();
        assert!(session.current().unwrap().same_handle(&after));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_close_releases_the_snapshot() {
        let session = Session::open_in_memory().await.unwrap();
        let engine = Arc::clone(session.engine());
        let live = VersionedHandle::live(&session.core, engine.open().unwrap());
        let late = live.freeze().unwrap();
        session.close().await.unwrap();

        assert!(matches!(session.core.publish(late.clone()), Err(Error::Closed(_))));
        assert!(engine.is_closed(late.snapshot()));
        // already closed: logged, still rejected
        assert!(matches!(session.core.publish(late), Err(Error::Closed(_))));

        engine.close(live.snapshot()).unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = Session::open_in_memory().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(session.current(), Err(Error::Closed(_))));
    }
}
