//! # The Observable Capability Set
//!
//! Every notifiable entity kind (object, list, set, map, result set)
//! implements [`Observable`]:
//!
//! | Operation                    | Valid on          | Deleted target      |
//! |------------------------------|-------------------|---------------------|
//! | `register_for_notification`  | live, managed     | engine error        |
//! | `freeze(frozen_version)`     | managed           | `Ok(None)`          |
//! | `thaw(live_version)`         | managed           | `Ok(None)`          |
//! | `emit_update(frozen, raw)`   | live, managed     | terminal `Deleted`  |
//!
//! Freeze and thaw produce new entities and never touch the receiver.
//!
//! ## Delivery
//!
//! `emit_update` sends into a [`DeliverySink`], a bounded channel that fails
//! loudly. When the subscriber's buffer is full the sink records
//! [`Error::InsufficientBuffer`], closes, and cancels its registration:
//! change-set indices are relative to the previous event, so silently
//! dropping one would corrupt every event after it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::changeset::{ChangeKind, ChangeSet, ChangeSetBuilder, MapChangeSet};
use crate::engine::{RawCallback, RawChange, RegistrationPtr};
use crate::entity::{MapRef, ObjectRef};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::subscription::{DeliveryReceiver, NotificationToken};
use crate::types::ObjectKey;

// =============================================================================
// Typed Change Events
// =============================================================================

/// Event for a list, set, or result set.
#[derive(Debug, Clone)]
pub enum CollectionChange<C> {
    /// First event after subscribing: the collection as it is now.
    Initial(C),
    /// The collection changed since the previous event.
    Updated { collection: C, changes: ChangeSet },
    /// The object owning the collection was deleted. Always the last event.
    Deleted,
}

/// Event for a map.
#[derive(Debug, Clone)]
pub enum MapChange {
    Initial(MapRef),
    Updated { map: MapRef, changes: MapChangeSet },
    /// Always the last event.
    Deleted,
}

/// Event for a single object.
#[derive(Debug, Clone)]
pub enum ObjectChange {
    Initial(ObjectRef),
    Updated {
        object: ObjectRef,
        changed_fields: Vec<String>,
    },
    /// Always the last event.
    Deleted { key: ObjectKey },
}

// =============================================================================
// Delivery Sink
// =============================================================================

/// Outcome of one [`Observable::emit_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The event is in the subscriber's buffer.
    Delivered,
    /// A terminal event was sent and the sink closed.
    Terminated,
    /// The sink was already closed, or closed now because the buffer is full.
    Rejected,
}

/// Sending half of a subscription.
pub struct DeliverySink<E> {
    sender: Mutex<Option<mpsc::Sender<E>>>,
    reason: Arc<Mutex<Option<Error>>>,
    token: Mutex<Option<NotificationToken>>,
    capacity: usize,
}

/// Creates a bounded sink and the receiving half a [`crate::Subscription`]
/// is built from.
pub(crate) fn delivery_channel<E>(capacity: usize) -> (DeliverySink<E>, DeliveryReceiver<E>) {
    let (sender, receiver) = mpsc::channel(capacity);
    let reason = Arc::new(Mutex::new(None));
    let sink = DeliverySink {
        sender: Mutex::new(Some(sender)),
        reason: Arc::clone(&reason),
        token: Mutex::new(None),
        capacity,
    };
    (sink, DeliveryReceiver { receiver, reason })
}

impl<E> DeliverySink<E> {
    /// Binds the registration this sink cancels when it closes.
    pub(crate) fn attach(&self, token: NotificationToken) {
        *self.token.lock() = Some(token);
    }

    /// Sends a non-terminal event without waiting.
    pub fn send(&self, event: E) -> DeliveryResult {
        let mut sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return DeliveryResult::Rejected;
        };
        match tx.try_send(event) {
            Ok(()) => DeliveryResult::Delivered,
            Err(TrySendError::Full(_)) => {
                *sender = None;
                drop(sender);
                warn!(capacity = self.capacity, "subscriber fell behind; cancelling subscription");
                self.close_with(Some(Error::InsufficientBuffer {
                    capacity: self.capacity,
                }));
                DeliveryResult::Rejected
            }
            Err(TrySendError::Closed(_)) => {
                *sender = None;
                drop(sender);
                self.close_with(None);
                DeliveryResult::Rejected
            }
        }
    }

    /// Sends a terminal event, then closes the sink.
    pub fn finish(&self, event: E) -> DeliveryResult {
        match self.send(event) {
            DeliveryResult::Delivered => {
                self.sender.lock().take();
                self.close_with(None);
                DeliveryResult::Terminated
            }
            other => other,
        }
    }

    /// Closes the sink with an error the subscriber sees after its buffered
    /// events.
    pub fn fail(&self, err: Error) {
        self.sender.lock().take();
        self.close_with(Some(err));
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }

    fn close_with(&self, err: Option<Error>) {
        if let Some(err) = err {
            let mut reason = self.reason.lock();
            if reason.is_none() {
                *reason = Some(err);
            }
        }
        let token = self.token.lock().clone();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

// =============================================================================
// Observable
// =============================================================================

/// The capability set shared by every notifiable entity kind.
pub trait Observable: Clone + Send + Sync + Sized + 'static {
    /// Event type delivered to subscribers.
    type Event: Send + 'static;

    /// Handle the entity is bound to; `None` when unmanaged.
    fn handle(&self) -> Option<&VersionedHandle>;

    /// Registers a native callback. Fails with [`Error::InvalidState`] on
    /// frozen or unmanaged entities.
    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr>;

    /// Resolves this entity at a frozen version. `Ok(None)` if it was deleted.
    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>>;

    /// Resolves this entity at a live version. `Ok(None)` if it was deleted.
    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>>;

    /// Freezes at `frozen`, decodes `change`, and delivers the typed event.
    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<Self::Event>,
    ) -> Result<DeliveryResult>;

    fn is_managed(&self) -> bool {
        self.handle().is_some()
    }

    fn is_frozen(&self) -> bool {
        self.handle().is_some_and(VersionedHandle::is_frozen)
    }
}

/// Shared `emit_update` for lists, sets, and result sets.
pub(crate) fn emit_collection<C>(
    entity: &C,
    frozen: &VersionedHandle,
    change: &RawChange,
    sink: &DeliverySink<CollectionChange<C>>,
) -> Result<DeliveryResult>
where
    C: Observable<Event = CollectionChange<C>>,
{
    let builder = ChangeSetBuilder::new(change);
    if builder.kind() == ChangeKind::Deleted {
        return Ok(sink.finish(CollectionChange::Deleted));
    }
    let Some(collection) = entity.freeze(frozen)? else {
        return Ok(sink.finish(CollectionChange::Deleted));
    };
    let event = if builder.is_initial() {
        CollectionChange::Initial(collection)
    } else {
        CollectionChange::Updated {
            collection,
            changes: builder.collection(),
        }
    };
    Ok(sink.send(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_overflow_fails_loudly() {
        let (sink, parts) = delivery_channel::<u32>(2);
        let mut receiver = parts.receiver;

        assert_eq!(sink.send(1), DeliveryResult::Delivered);
        assert_eq!(sink.send(2), DeliveryResult::Delivered);
        assert_eq!(sink.send(3), DeliveryResult::Rejected);
        assert!(sink.is_closed());
        assert_eq!(sink.send(4), DeliveryResult::Rejected);

        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, Some(2));
        assert_eq!(receiver.recv().await, None);
        assert!(matches!(
            parts.reason.lock().take(),
            Some(Error::InsufficientBuffer { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn test_finish_closes_after_terminal_event() {
        let (sink, parts) = delivery_channel::<&'static str>(4);
        let mut receiver = parts.receiver;

        assert_eq!(sink.send("a"), DeliveryResult::Delivered);
        assert_eq!(sink.finish("deleted"), DeliveryResult::Terminated);
        assert_eq!(sink.send("late"), DeliveryResult::Rejected);

        assert_eq!(receiver.recv().await, Some("a"));
        assert_eq!(receiver.recv().await, Some("deleted"));
        assert_eq!(receiver.recv().await, None);
        assert!(parts.reason.lock().is_none());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sink, parts) = delivery_channel::<u8>(1);
        drop(parts);
        assert_eq!(sink.send(1), DeliveryResult::Rejected);
        assert!(sink.is_closed());
    }
}
