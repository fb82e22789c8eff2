//! # Notifier Session
//!
//! A second dedicated thread that owns its own live snapshot and exists only
//! to compute change notifications. It is started lazily on the first
//! subscription so that a session nobody observes never opens it.
//!
//! ```text
//!            ┌─────────────── notifier thread ────────────────────────┐
//!  commit    │  select! {                                             │
//!  signal ──►│    commit ─► advance()                                 │
//!  (watch)   │    request ─► subscribe job / shutdown                 │
//!            │  }                                                     │
//!            │                                                        │
//!            │  advance():                                            │
//!            │    1. batch = engine.refresh(live)                     │
//!            │    2. new version? freeze ─► snapshot cell             │
//!            │                           ─► session slot (publish)    │
//!            │                           ─► version stream (watch)    │
//!            │    3. batch.deliver()  ─► callbacks ─► emit_update     │
//!            └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! Step 2 always happens before step 3, so the version stream observes a
//! commit before any fine-grained event derived from it.
//!
//! ## Snapshot at Callback Time
//!
//! Callbacks freeze their entity against the snapshot cell, which holds the
//! frozen snapshot of the refresh that produced the callback. Change-set
//! indices therefore always describe the data the event carries.
//!
//! ## States
//!
//! `Uninitialized → Active → Closed`. Subscribing after close fails with
//! [`Error::Closed`].

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info_span, trace, warn};

use crate::api::SessionCore;
use crate::engine::{NativeEngine, RawCallback};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::observable::{delivery_channel, Observable};
use crate::subscription::{NotificationToken, Subscription, VersionChanges};
use crate::tracker::close_snapshot;
use crate::types::VersionId;
use crate::writer::build_runtime;

// =============================================================================
// Requests
// =============================================================================

type NotifierJob = Box<dyn FnOnce(&mut NotifierContext) + Send>;

enum NotifierRequest {
    /// Run a job (subscribe) on the notifier thread.
    Execute(NotifierJob),
    /// Release the live snapshot and stop.
    Shutdown { response: oneshot::Sender<()> },
}

// =============================================================================
// Notifier Context (owned by the notifier thread)
// =============================================================================

struct NotifierContext {
    session: Weak<SessionCore>,
    engine: Arc<dyn NativeEngine>,
    live: VersionedHandle,
    /// Frozen snapshot of the latest refresh.
    snapshot: Arc<Mutex<Option<VersionedHandle>>>,
    versions: watch::Sender<Option<VersionedHandle>>,
    last_version: Option<VersionId>,
}

impl NotifierContext {
    fn session(&self) -> Result<Arc<SessionCore>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::Shutdown("session dropped".into()))
    }

    fn advance(&mut self) {
        if let Err(err) = self.try_advance() {
            warn!(error = %err, "notifier failed to advance");
        }
    }

    fn try_advance(&mut self) -> Result<()> {
        let session = self.session()?;
        let batch = session.engine().refresh(self.live.snapshot())?;
        let version = self.live.version()?;

        if self.last_version.map_or(true, |last| version > last) {
            let frozen = self.live.freeze()?;
            *self.snapshot.lock() = Some(frozen.clone());
            session.publish(frozen.clone())?;
            self.versions.send_replace(Some(frozen));
            self.last_version = Some(version);
            debug!(version = %version, "notifier advanced");
        }
        drop(session);

        if !batch.is_empty() {
            trace!(callbacks = batch.len(), "delivering notifications");
            batch.deliver();
        }
        Ok(())
    }

    fn subscribe<T: Observable>(&mut self, entity: T, capacity: usize) -> Result<Subscription<T::Event>> {
        // catch up first so entities from a newer write resolve
        self.advance();
        let session = self.session()?;

        let observed = entity
            .thaw(&self.live)?
            .ok_or(Error::DeletedReference)?;

        let (sink, receiver) = delivery_channel::<T::Event>(capacity);
        let sink = Arc::new(sink);
        let callback_sink = Arc::clone(&sink);
        let snapshot = Arc::clone(&self.snapshot);
        let target = observed.clone();
        let callback: RawCallback = Box::new(move |change| {
            let frozen = snapshot.lock().clone();
            let Some(frozen) = frozen else {
                return;
            };
            match target.emit_update(&frozen, change, &callback_sink) {
                Ok(result) => trace!(?result, "change delivered"),
                Err(err) => {
                    warn!(error = %err, "failed to emit change");
                    callback_sink.fail(err);
                }
            }
        });

        let registration = observed.register_for_notification(callback)?;
        let token = NotificationToken::new(Arc::clone(session.engine()), registration);
        sink.attach(token.clone());
        debug!(registration = registration.as_raw(), "subscription registered");
        drop(session);

        // flush the initial event
        self.advance();
        Ok(Subscription::new(receiver, token))
    }

    fn shutdown(&mut self) {
        *self.snapshot.lock() = None;
        self.versions.send_replace(None);
        if !self.engine.is_closed(self.live.snapshot()) {
            if let Err(err) = self.engine.close(self.live.snapshot()) {
                warn!(error = %err, "failed to close notifier snapshot");
            }
        }
    }
}

async fn run_notifier(
    mut ctx: NotifierContext,
    mut rx: mpsc::Receiver<NotifierRequest>,
    mut commits: watch::Receiver<VersionId>,
) {
    ctx.advance();
    let mut signal_open = true;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(NotifierRequest::Execute(job)) => job(&mut ctx),
                Some(NotifierRequest::Shutdown { response }) => {
                    ctx.shutdown();
                    let _ = response.send(());
                    return;
                }
                None => {
                    ctx.shutdown();
                    return;
                }
            },
            changed = commits.changed(), if signal_open => match changed {
                Ok(()) => ctx.advance(),
                Err(_) => signal_open = false,
            },
        }
    }
}

// =============================================================================
// Notifier Session (caller side)
// =============================================================================

#[derive(Clone)]
struct NotifierHandle {
    tx: mpsc::Sender<NotifierRequest>,
    versions: watch::Receiver<Option<VersionedHandle>>,
}

enum NotifierState {
    Uninitialized,
    Active(NotifierHandle),
    Closed,
}

/// Caller-side handle to the (lazily started) notifier thread.
pub(crate) struct NotifierSession {
    state: Mutex<NotifierState>,
}

impl NotifierSession {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState::Uninitialized),
        }
    }

    /// Starts the thread if needed and returns its handle.
    fn ensure_started(&self, session: &Arc<SessionCore>) -> Result<NotifierHandle> {
        let mut state = self.state.lock();
        match &*state {
            NotifierState::Active(handle) => Ok(handle.clone()),
            NotifierState::Closed => Err(Error::closed("notifier has been closed")),
            NotifierState::Uninitialized => {
                let handle = spawn_notifier(session)?;
                *state = NotifierState::Active(handle.clone());
                Ok(handle)
            }
        }
    }

    pub(crate) fn start(&self, session: &Arc<SessionCore>) -> Result<()> {
        self.ensure_started(session).map(|_| ())
    }

    pub(crate) fn is_started(&self) -> bool {
        matches!(*self.state.lock(), NotifierState::Active(_))
    }

    pub(crate) async fn subscribe<T: Observable>(
        &self,
        session: &Arc<SessionCore>,
        entity: T,
    ) -> Result<Subscription<T::Event>> {
        if !entity.is_managed() {
            return Err(Error::invalid_state("cannot subscribe to an unmanaged entity"));
        }
        let handle = self.ensure_started(session)?;
        let capacity = session.config().delivery_buffer_capacity;

        let (response, rx) = oneshot::channel();
        let job: NotifierJob = Box::new(move |ctx| {
            let _ = response.send(ctx.subscribe(entity, capacity));
        });
        handle
            .tx
            .send(NotifierRequest::Execute(job))
            .await
            .map_err(|_| Error::Shutdown("notifier stopped".into()))?;
        rx.await
            .map_err(|_| Error::Shutdown("notifier dropped the request".into()))?
    }

    pub(crate) fn version_changes(&self, session: &Arc<SessionCore>) -> Result<VersionChanges> {
        let handle = self.ensure_started(session)?;
        Ok(VersionChanges::new(handle.versions))
    }

    /// Stops the thread. Pending deliveries may be dropped.
    pub(crate) async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), NotifierState::Closed);
        if let NotifierState::Active(handle) = previous {
            let (response, done) = oneshot::channel();
            if handle.tx.send(NotifierRequest::Shutdown { response }).await.is_ok() {
                let _ = done.await;
            }
        }
    }
}

fn spawn_notifier(session: &Arc<SessionCore>) -> Result<NotifierHandle> {
    let engine = Arc::clone(session.engine());
    let live = engine.open()?;
    let name = session.config().name.clone();
    let (tx, rx) = mpsc::channel(session.config().notifier_queue_capacity);
    let (versions_tx, versions_rx) = watch::channel(None);
    let commits = engine.commit_signal();

    let ctx = NotifierContext {
        session: Arc::downgrade(session),
        engine: Arc::clone(&engine),
        live: VersionedHandle::live(session, live),
        snapshot: Arc::new(Mutex::new(None)),
        versions: versions_tx,
        last_version: None,
    };

    let rt = match build_runtime("notifier") {
        Ok(rt) => rt,
        Err(err) => {
            close_snapshot(engine.as_ref(), live);
            return Err(err);
        }
    };

    std::thread::Builder::new()
        .name(format!("frostline-{name}-notifier"))
        .spawn(move || {
            let span = info_span!("notifier", session = %name);
            let _guard = span.enter();
            rt.block_on(run_notifier(ctx, rx, commits));
        })
        .map_err(|e| {
            close_snapshot(engine.as_ref(), live);
            Error::Shutdown(format!("failed to spawn notifier thread: {e}"))
        })?;

    debug!("notifier started");
    Ok(NotifierHandle {
        tx,
        versions: versions_rx,
    })
}
