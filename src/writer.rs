//! # Writer Session
//!
//! All write transactions of a session run on one dedicated thread that owns
//! the session's write-side live snapshot.
//!
//! ```text
//!  caller tasks                      writer thread (current-thread runtime)
//! ┌──────────────┐  mpsc (bounded)  ┌──────────────────────────────────────┐
//! │ write(|tx|…) ├─────────────────►│ begin ─► block(tx) ─► commit         │
//! │   .await     │◄─── oneshot ─────┤   │          │ Err        │ Err       │
//! └──────────────┘  R::Frozen       │   │          ▼            ▼           │
//!                                   │   │       rollback    rollback        │
//!                                   │   ▼                                   │
//!                                   │ freeze ─► publish to session slot     │
//!                                   │        ─► re-resolve result entities  │
//!                                   └──────────────────────────────────────┘
//! ```
//!
//! ## States
//!
//! `Idle → InTransaction → {Committed | RolledBack} → Idle`. Beginning while a
//! transaction is open fails with [`Error::TransactionInProgress`]; committing
//! or cancelling without one fails with [`Error::NoTransaction`].
//!
//! ## Ordering
//!
//! The committed version is published to the session before the caller's
//! future resolves, so a read right after `write(..).await` sees the write.
//!
//! ## Panics
//!
//! A block that panics is caught on the writer thread. The transaction is
//! rolled back (an explicit commit made before the panic is still published)
//! and the panic resumes in the task that called `write`. The writer thread
//! keeps serving later writes.
//!
//! ## Rust Pattern: Type-Erased Jobs
//!
//! Each request carries a boxed `FnOnce(&mut WriterState)` that owns the user
//! block and its response channel. The writer loop stays monomorphic while
//! every `write` call keeps its own result type.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, warn};

use crate::api::SessionCore;
use crate::engine::{NativeEngine, SnapshotPtr, Target};
use crate::entity::{Managed, ObjectRef, ResultsRef};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::observable::Observable;
use crate::tracker::close_snapshot;
use crate::types::{ObjectKey, Row, VersionId};

// =============================================================================
// Write Output
// =============================================================================

/// Values a write block may return.
///
/// Plain values pass through unchanged. Entities are re-resolved against the
/// frozen version the write produced and come back as `Option<Entity>`:
/// `None` if the entity no longer exists at that version.
pub trait WriteOutput: Send + 'static {
    /// What the caller receives.
    type Frozen: Send + 'static;

    fn into_frozen(self, frozen: &VersionedHandle) -> Result<Self::Frozen>;
}

macro_rules! pass_through {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WriteOutput for $ty {
                type Frozen = $ty;

                fn into_frozen(self, _frozen: &VersionedHandle) -> Result<$ty> {
                    Ok(self)
                }
            }
        )*
    };
}

pass_through!((), bool, i32, i64, u32, u64, usize, f64, String, Value, ObjectKey, VersionId, Row);

impl<T: WriteOutput> WriteOutput for Option<T> {
    type Frozen = Option<T::Frozen>;

    fn into_frozen(self, frozen: &VersionedHandle) -> Result<Self::Frozen> {
        self.map(|value| value.into_frozen(frozen)).transpose()
    }
}

impl<T: WriteOutput> WriteOutput for Vec<T> {
    type Frozen = Vec<T::Frozen>;

    fn into_frozen(self, frozen: &VersionedHandle) -> Result<Self::Frozen> {
        self.into_iter().map(|value| value.into_frozen(frozen)).collect()
    }
}

impl<A: WriteOutput, B: WriteOutput> WriteOutput for (A, B) {
    type Frozen = (A::Frozen, B::Frozen);

    fn into_frozen(self, frozen: &VersionedHandle) -> Result<Self::Frozen> {
        Ok((self.0.into_frozen(frozen)?, self.1.into_frozen(frozen)?))
    }
}

// =============================================================================
// Write Context
// =============================================================================

/// The transaction a write block runs in.
///
/// Entities obtained here are live and may be mutated until the block returns.
pub struct WriteContext<'a> {
    live: &'a VersionedHandle,
    engine: &'a Arc<dyn NativeEngine>,
}

impl<'a> WriteContext<'a> {
    fn snapshot(&self) -> SnapshotPtr {
        self.live.snapshot()
    }

    fn require_transaction(&self) -> Result<()> {
        if self.engine.is_in_transaction(self.snapshot()) {
            Ok(())
        } else {
            Err(Error::NoTransaction)
        }
    }

    /// Creates an object. Fails if the key already exists in `class`.
    pub fn create(&mut self, class: &str, key: impl Into<ObjectKey>, fields: Row) -> Result<ObjectRef> {
        self.require_transaction()?;
        let key = key.into();
        self.engine
            .create_object(self.snapshot(), class, key, fields)?;
        Ok(ObjectRef::managed_at(self.live.clone(), class, key))
    }

    /// The object with `key`, or `None` if it does not exist.
    pub fn object(&self, class: &str, key: impl Into<ObjectKey>) -> Result<Option<ObjectRef>> {
        ObjectRef::managed_at(self.live.clone(), class, key.into()).thaw(self.live)
    }

    pub fn results(&self, class: &str) -> Result<ResultsRef> {
        Ok(ResultsRef::from_managed(Managed::new(
            self.live.clone(),
            Target::Results {
                class: class.to_string(),
            },
        )))
    }

    /// Resolves a (typically frozen) entity onto this transaction's version.
    pub fn find_latest<T: Observable>(&self, entity: &T) -> Result<Option<T>> {
        entity.thaw(self.live)
    }

    /// Commits now. The block may keep reading but can no longer write.
    pub fn commit(&mut self) -> Result<VersionId> {
        self.require_transaction()?;
        let version = self.engine.commit(self.snapshot())?;
        debug!(version = %version, "transaction committed explicitly");
        Ok(version)
    }

    /// Rolls back now. Nothing written in the block is published.
    pub fn cancel(&mut self) -> Result<()> {
        self.require_transaction()?;
        self.engine.rollback(self.snapshot())?;
        debug!("transaction cancelled");
        Ok(())
    }

    pub fn is_in_transaction(&self) -> bool {
        self.engine.is_in_transaction(self.snapshot())
    }

    /// Version the transaction is based on.
    pub fn version(&self) -> Result<VersionId> {
        self.live.version()
    }
}

// =============================================================================
// Requests
// =============================================================================

pub(crate) type WriteJob = Box<dyn FnOnce(&mut WriterState) + Send>;

pub(crate) enum WriteRequest {
    /// Run one write block.
    Execute(WriteJob),
    /// Finish queued work, release the live snapshot, and stop.
    Shutdown { response: oneshot::Sender<()> },
}

// =============================================================================
// Writer State (owned by the writer thread)
// =============================================================================

pub(crate) struct WriterState {
    session: Weak<SessionCore>,
    /// Kept so the live snapshot can be closed after the session is gone.
    engine: Arc<dyn NativeEngine>,
    live: VersionedHandle,
    in_transaction: Arc<AtomicBool>,
}

impl WriterState {
    fn run<F, R>(&mut self, block: F) -> Result<R::Frozen>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<R>,
        R: WriteOutput,
    {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| Error::Shutdown("session dropped".into()))?;
        session.check_open()?;
        let engine = Arc::clone(session.engine());
        let live = self.live.snapshot();

        if engine.is_in_transaction(live) {
            return Err(Error::TransactionInProgress);
        }
        engine.begin_transaction(live)?;
        self.in_transaction.store(true, Ordering::SeqCst);
        let base = self.live.version()?;
        debug!(version = %base, "transaction started");

        let outcome = {
            let mut tx = WriteContext {
                live: &self.live,
                engine: &engine,
            };
            panic::catch_unwind(AssertUnwindSafe(|| block(&mut tx)))
        };

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.abort(&session, live, base)?;
                return Err(err);
            }
            Err(payload) => {
                warn!("write block panicked, rolling back");
                if let Err(err) = self.abort(&session, live, base) {
                    warn!(error = %err, "failed to publish after panic");
                }
                panic::resume_unwind(payload);
            }
        };

        if engine.is_in_transaction(live) {
            match engine.commit(live) {
                Ok(version) => debug!(version = %version, "transaction committed"),
                Err(err) => {
                    self.rollback_if_open(engine.as_ref(), live);
                    return Err(err.into());
                }
            }
        }
        self.in_transaction.store(false, Ordering::SeqCst);

        let frozen = self.live.freeze()?;
        session.publish(frozen.clone())?;
        value.into_frozen(&frozen)
    }

    /// Rolls back a failed block. An explicit commit inside the block still
    /// has to be visible.
    fn abort(&self, session: &SessionCore, live: SnapshotPtr, base: VersionId) -> Result<()> {
        self.rollback_if_open(session.engine().as_ref(), live);
        if self.live.version()? > base {
            let frozen = self.live.freeze()?;
            session.publish(frozen)?;
        }
        Ok(())
    }

    fn rollback_if_open(&self, engine: &dyn NativeEngine, live: SnapshotPtr) {
        if engine.is_in_transaction(live) {
            match engine.rollback(live) {
                Ok(()) => debug!("transaction rolled back"),
                Err(err) => warn!(error = %err, "rollback failed"),
            }
        }
        self.in_transaction.store(false, Ordering::SeqCst);
    }

    fn shutdown(&mut self) {
        let engine = Arc::clone(&self.engine);
        let live = self.live.snapshot();
        self.rollback_if_open(engine.as_ref(), live);
        if !engine.is_closed(live) {
            if let Err(err) = engine.close(live) {
                warn!(error = %err, "failed to close writer snapshot");
            }
        }
    }
}

// =============================================================================
// Writer Session (caller side)
// =============================================================================

/// Caller-side handle to the writer thread.
pub(crate) struct WriterSession {
    tx: mpsc::Sender<WriteRequest>,
    in_transaction: Arc<AtomicBool>,
}

impl WriterSession {
    /// Submits a write block and waits for its frozen result.
    pub(crate) async fn execute<F, R>(&self, block: F) -> Result<R::Frozen>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<R> + Send + 'static,
        R: WriteOutput,
    {
        let (response, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |state| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.run(block)));
            let _ = response.send(outcome);
        });
        self.tx
            .send(WriteRequest::Execute(job))
            .await
            .map_err(|_| Error::Shutdown("writer stopped".into()))?;
        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(Error::Shutdown("writer dropped the request".into())),
        }
    }

    /// True while a write block is between begin and commit/rollback.
    pub(crate) fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Drains queued writes, releases the live snapshot, and stops the thread.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (response, done) = oneshot::channel();
        if self.tx.send(WriteRequest::Shutdown { response }).await.is_err() {
            // already stopped
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

async fn run_writer(mut state: WriterState, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::Execute(job) => job(&mut state),
            WriteRequest::Shutdown { response } => {
                state.shutdown();
                let _ = response.send(());
                return;
            }
        }
    }
    // every session handle dropped
    state.shutdown();
}

/// Spawns the writer thread around an already opened live snapshot.
pub(crate) fn spawn_writer(
    session: &Arc<SessionCore>,
    live: SnapshotPtr,
    rx: mpsc::Receiver<WriteRequest>,
    in_transaction: Arc<AtomicBool>,
) -> Result<()> {
    let name = session.config().name.clone();
    let state = WriterState {
        session: Arc::downgrade(session),
        engine: Arc::clone(session.engine()),
        live: VersionedHandle::live(session, live),
        in_transaction,
    };

    let rt = match build_runtime("writer") {
        Ok(rt) => rt,
        Err(err) => {
            close_snapshot(session.engine().as_ref(), live);
            return Err(err);
        }
    };

    std::thread::Builder::new()
        .name(format!("frostline-{name}-writer"))
        .spawn(move || {
            let span = info_span!("writer", session = %name);
            let _guard = span.enter();
            rt.block_on(run_writer(state, rx));
        })
        .map_err(|e| {
            close_snapshot(session.engine().as_ref(), live);
            Error::Shutdown(format!("failed to spawn writer thread: {e}"))
        })?;

    Ok(())
}

/// Current-thread runtime for a dedicated execution context, built on the
/// caller's thread so a failure reaches `open`.
pub(crate) fn build_runtime(role: &str) -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Shutdown(format!("failed to create {role} runtime: {e}")))
}

/// Creates the request channel and the caller-side session.
pub(crate) fn writer_channel(
    capacity: usize,
) -> (WriterSession, mpsc::Receiver<WriteRequest>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::channel(capacity);
    let in_transaction = Arc::new(AtomicBool::new(false));
    (
        WriterSession {
            tx,
            in_transaction: Arc::clone(&in_transaction),
        },
        rx,
        in_transaction,
    )
}
