//! # Subscriptions
//!
//! The subscriber-facing end of change notification.
//!
//! ```text
//!  notifier thread                          subscriber task
//! ┌────────────────────────┐              ┌──────────────────────────┐
//! │ native callback        │   bounded    │ Subscription<E>          │
//! │   └─ emit_update ──► DeliverySink ──► │   next().await           │
//! │                        │   mpsc (N)   │   Stream::poll_next      │
//! └───────────┬────────────┘              └────────────┬─────────────┘
//!             │                                        │ drop / cancel()
//!             └───────── NotificationToken ◄───────────┘
//!                        (releases the native registration once)
//! ```
//!
//! ## Termination
//!
//! A subscription ends in exactly one of three ways:
//!
//! - the observed entity is deleted: a final `Deleted` event, then `None`
//! - the subscriber fell behind: buffered events, one
//!   [`Error::InsufficientBuffer`], then `None`
//! - the subscriber cancelled (or dropped) it: `None`
//!
//! ## Version Changes
//!
//! [`VersionChanges`] follows the notifier's latest frozen snapshot. It
//! replays only the most recent version to a new subscriber and coalesces
//! intermediate versions when the subscriber is slow (latest wins).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::engine::{NativeEngine, RegistrationPtr};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;

// =============================================================================
// NotificationToken
// =============================================================================

struct TokenInner {
    engine: Arc<dyn NativeEngine>,
    registration: RegistrationPtr,
    cancelled: Mutex<bool>,
}

/// Cancellation handle for one native change registration.
///
/// Clones share state; cancelling any clone cancels all of them. There is no
/// release on drop of the token itself: [`Subscription`] cancels its token
/// when dropped, and [`NotificationToken::cancel`] is the only release path.
#[derive(Clone)]
pub struct NotificationToken {
    inner: Arc<TokenInner>,
}

impl NotificationToken {
    pub(crate) fn new(engine: Arc<dyn NativeEngine>, registration: RegistrationPtr) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                engine,
                registration,
                cancelled: Mutex::new(false),
            }),
        }
    }

    /// Releases the registration. Idempotent.
    ///
    /// Must not be called while holding the notifier thread; callbacks use it
    /// only through the delivery sink, which runs outside the engine lock.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if *cancelled {
            return;
        }
        *cancelled = true;
        match self.inner.engine.release_registration(self.inner.registration) {
            Ok(()) => debug!(registration = self.inner.registration.as_raw(), "subscription cancelled"),
            // The snapshot owning the registration was closed first
            Err(err) => debug!(
                registration = self.inner.registration.as_raw(),
                error = %err,
                "registration already released"
            ),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    pub fn registration(&self) -> RegistrationPtr {
        self.inner.registration
    }
}

impl std::fmt::Debug for NotificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationToken")
            .field("registration", &self.inner.registration.as_raw())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving half handed out by [`crate::observable::delivery_channel`].
pub(crate) struct DeliveryReceiver<E> {
    pub(crate) receiver: mpsc::Receiver<E>,
    pub(crate) reason: Arc<Mutex<Option<Error>>>,
}

/// A stream of typed change events for one observed entity.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = session.subscribe(&people).await?;
/// while let Some(event) = sub.next().await {
///     match event? {
///         CollectionChange::Initial(people) => println!("{} people", people.len()?),
///         CollectionChange::Updated { changes, .. } => println!("{:?}", changes.insertions()),
///         CollectionChange::Deleted => break,
///     }
/// }
/// ```
pub struct Subscription<E> {
    receiver: mpsc::Receiver<E>,
    reason: Arc<Mutex<Option<Error>>>,
    token: NotificationToken,
    finished: bool,
}

impl<E> Subscription<E> {
    pub(crate) fn new(parts: DeliveryReceiver<E>, token: NotificationToken) -> Self {
        Self {
            receiver: parts.receiver,
            reason: parts.reason,
            token,
            finished: false,
        }
    }

    /// Receives the next event.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(event))` - Next event
    /// - `Some(Err(e))` - The subscription was cancelled by the notifier
    /// - `None` - Subscription closed
    pub async fn next(&mut self) -> Option<Result<E>> {
        futures::future::poll_fn(|cx| self.poll_item(cx)).await
    }

    /// Returns the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<Result<E>> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.finish(),
        }
    }

    /// Cancels the subscription. Buffered events are discarded.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.receiver.close();
        self.finished = true;
    }

    pub fn token(&self) -> &NotificationToken {
        &self.token
    }

    /// Number of events waiting in the delivery buffer.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<E>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => Poll::Ready(self.finish()),
            Poll::Pending => Poll::Pending,
        }
    }

    fn finish(&mut self) -> Option<Result<E>> {
        self.finished = true;
        self.reason.lock().take().map(Err)
    }
}

impl<E> Stream for Subscription<E> {
    type Item = Result<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Version Changes
// =============================================================================

/// Stream of frozen snapshots published by the notifier.
pub struct VersionChanges {
    inner: BoxStream<'static, VersionedHandle>,
}

impl VersionChanges {
    pub(crate) fn new(receiver: watch::Receiver<Option<VersionedHandle>>) -> Self {
        let inner = futures::stream::unfold((receiver, true), |(mut rx, first)| async move {
            if first {
                let latest = rx.borrow_and_update().clone();
                if let Some(handle) = latest {
                    return Some((handle, (rx, false)));
                }
            }
            loop {
                rx.changed().await.ok()?;
                let latest = rx.borrow_and_update().clone();
                if let Some(handle) = latest {
                    return Some((handle, (rx, false)));
                }
            }
        });
        Self { inner: inner.boxed() }
    }

    /// Waits for the next version. `None` once the notifier has shut down.
    pub async fn next(&mut self) -> Option<VersionedHandle> {
        self.inner.next().await
    }
}

impl Stream for VersionChanges {
    type Item = VersionedHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
