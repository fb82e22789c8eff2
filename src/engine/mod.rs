//! # Native Engine Boundary
//!
//! The storage engine is an external collaborator. This module defines the
//! contract the core needs from it and nothing more:
//!
//! ```text
//! open() -> live snapshot           freeze(live) -> frozen snapshot
//! close(snapshot)                   version(snapshot) -> VersionId
//! begin/commit/rollback(live)       is_in_transaction(live)
//! register_change_callback(ptr)     release_registration(reg)
//! resolve_at(ptr, snapshot) -> Option<ptr>     (freeze/thaw primitive)
//! ```
//!
//! ## Opaque Pointers
//!
//! [`SnapshotPtr`] and [`RegistrationPtr`] are opaque ids handed out by the
//! engine. A [`NativePtr`] names an object, collection, or result set inside
//! one snapshot. None of them own anything: lifetime is managed by
//! [`crate::handle::VersionedHandle`] and [`crate::tracker::VersionTracker`].
//!
//! ## Deletion Is a Value
//!
//! [`NativeEngine::resolve_at`] returns `Ok(None)` when the target no longer
//! exists at the requested snapshot. Engines must never signal deletion through
//! an error.
//!
//! ## Callbacks
//!
//! Change callbacks are not invoked from inside the engine. [`NativeEngine::refresh`]
//! advances a live snapshot and returns a [`NotificationBatch`]; the owner of
//! the live snapshot decides when to [`deliver`](NotificationBatch::deliver)
//! it. This lets the notifier publish the new version before any fine-grained
//! callback runs, and lets callbacks call back into the engine.

pub mod diff;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::types::{FieldValue, ObjectKey, Row, VersionId};

pub use memory::MemoryEngine;

// =============================================================================
// Engine Errors
// =============================================================================

/// Failure categories reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Bad argument (unknown field, index out of bounds, duplicate key).
    IllegalArgument,
    /// Internal logic error in the caller's use of the engine.
    Logic,
    /// Operation not legal in the snapshot's current state.
    State,
    /// The snapshot or registration was already released.
    Closed,
    /// The engine ran out of a resource. Unrecoverable.
    ResourceExhausted,
    /// Any other fatal engine condition. Unrecoverable.
    Fatal,
}

/// An error raised at the native boundary.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    /// Category of the failure
    pub kind: EngineErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl EngineError {
    /// Creates a new engine error.
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::State, message)
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::IllegalArgument, message)
    }

    pub(crate) fn closed(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Closed, message)
    }
}

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

// =============================================================================
// Opaque Pointers
// =============================================================================

/// Opaque id of a snapshot (live or frozen) inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotPtr(u64);

impl SnapshotPtr {
    /// Wraps a raw engine id.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw engine id.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot#{}", self.0)
    }
}

/// Opaque id of one change-callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationPtr(u64);

impl RegistrationPtr {
    /// Wraps a raw engine id.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw engine id.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// What a [`NativePtr`] points at inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A single object.
    Object { class: String, key: ObjectKey },
    /// A list field of an object.
    List { class: String, key: ObjectKey, field: String },
    /// A set field of an object.
    Set { class: String, key: ObjectKey, field: String },
    /// A map field of an object.
    Map { class: String, key: ObjectKey, field: String },
    /// All objects of a class, ordered by key.
    Results { class: String },
}

impl Target {
    /// The class this target belongs to.
    pub fn class(&self) -> &str {
        match self {
            Target::Object { class, .. }
            | Target::List { class, .. }
            | Target::Set { class, .. }
            | Target::Map { class, .. }
            | Target::Results { class } => class,
        }
    }
}

/// A pointer to an object, collection, or result set within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativePtr {
    snapshot: SnapshotPtr,
    target: Target,
}

impl NativePtr {
    /// Creates a pointer.
    pub fn new(snapshot: SnapshotPtr, target: Target) -> Self {
        Self { snapshot, target }
    }

    /// The snapshot this pointer is resolved against.
    pub fn snapshot(&self) -> SnapshotPtr {
        self.snapshot
    }

    /// What this pointer names.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

// =============================================================================
// Raw Change Payload
// =============================================================================

/// A contiguous half-open index range `[from, to)` as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    pub from: usize,
    pub to: usize,
}

/// The change payload the engine passes to a callback.
///
/// A payload with no indices, no keys, and no fields is the initial
/// notification that every registration receives first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChange {
    deletions: Vec<usize>,
    insertions: Vec<usize>,
    modifications: Vec<usize>,
    modifications_new: Vec<usize>,
    deleted_keys: Vec<String>,
    inserted_keys: Vec<String>,
    modified_keys: Vec<String>,
    changed_fields: Vec<String>,
    root_deleted: bool,
}

impl RawChange {
    /// The initial (empty) payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A positional collection change. Index arrays are sorted on construction.
    pub fn collection(
        mut deletions: Vec<usize>,
        mut insertions: Vec<usize>,
        mut modifications: Vec<usize>,
        mut modifications_new: Vec<usize>,
    ) -> Self {
        deletions.sort_unstable();
        insertions.sort_unstable();
        modifications.sort_unstable();
        modifications_new.sort_unstable();
        Self {
            deletions,
            insertions,
            modifications,
            modifications_new,
            ..Self::default()
        }
    }

    /// A keyed (map) change.
    pub fn keyed(deleted: Vec<String>, inserted: Vec<String>, modified: Vec<String>) -> Self {
        Self {
            deleted_keys: deleted,
            inserted_keys: inserted,
            modified_keys: modified,
            ..Self::default()
        }
    }

    /// An object change listing the fields that changed.
    pub fn object(changed_fields: Vec<String>) -> Self {
        Self {
            changed_fields,
            ..Self::default()
        }
    }

    /// The payload sent when the observed object (or collection owner) is gone.
    pub fn root_deleted() -> Self {
        Self {
            root_deleted: true,
            ..Self::default()
        }
    }

    pub fn deletions(&self) -> &[usize] {
        &self.deletions
    }

    pub fn insertions(&self) -> &[usize] {
        &self.insertions
    }

    /// Modified indices in pre-change coordinates.
    pub fn modifications(&self) -> &[usize] {
        &self.modifications
    }

    /// Modified indices in post-change coordinates.
    pub fn modifications_new(&self) -> &[usize] {
        &self.modifications_new
    }

    pub fn deletion_ranges(&self) -> Vec<RawRange> {
        ranges_of(&self.deletions)
    }

    pub fn insertion_ranges(&self) -> Vec<RawRange> {
        ranges_of(&self.insertions)
    }

    pub fn modification_ranges(&self) -> Vec<RawRange> {
        ranges_of(&self.modifications)
    }

    pub fn modification_ranges_new(&self) -> Vec<RawRange> {
        ranges_of(&self.modifications_new)
    }

    pub fn deleted_keys(&self) -> &[String] {
        &self.deleted_keys
    }

    pub fn inserted_keys(&self) -> &[String] {
        &self.inserted_keys
    }

    pub fn modified_keys(&self) -> &[String] {
        &self.modified_keys
    }

    pub fn changed_fields(&self) -> &[String] {
        &self.changed_fields
    }

    pub fn is_root_deleted(&self) -> bool {
        self.root_deleted
    }

    /// True for the initial payload (nothing changed, nothing deleted).
    pub fn is_empty(&self) -> bool {
        !self.root_deleted
            && self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.modifications_new.is_empty()
            && self.deleted_keys.is_empty()
            && self.inserted_keys.is_empty()
            && self.modified_keys.is_empty()
            && self.changed_fields.is_empty()
    }
}

/// Collapses sorted, distinct indices into maximal contiguous ranges.
pub(crate) fn ranges_of(indices: &[usize]) -> Vec<RawRange> {
    let mut ranges: Vec<RawRange> = Vec::new();
    for &index in indices {
        match ranges.last_mut() {
            Some(last) if last.to == index => last.to += 1,
            _ => ranges.push(RawRange {
                from: index,
                to: index + 1,
            }),
        }
    }
    ranges
}

// =============================================================================
// Callbacks and Notification Batches
// =============================================================================

/// A native change callback.
pub type RawCallback = Box<dyn FnMut(&RawChange) + Send>;

/// Shared slot holding a registered callback.
pub(crate) type CallbackSlot = Arc<Mutex<RawCallback>>;

/// Callbacks that became due during a [`NativeEngine::refresh`].
///
/// Delivery happens outside the engine lock, in registration order.
#[derive(Default)]
pub struct NotificationBatch {
    pending: Vec<PendingCallback>,
}

struct PendingCallback {
    registration: RegistrationPtr,
    callback: CallbackSlot,
    change: RawChange,
}

impl NotificationBatch {
    pub(crate) fn push(&mut self, registration: RegistrationPtr, callback: CallbackSlot, change: RawChange) {
        self.pending.push(PendingCallback {
            registration,
            callback,
            change,
        });
    }

    /// Number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if no callback is due.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registrations that will be called, in order.
    pub fn registrations(&self) -> Vec<RegistrationPtr> {
        self.pending.iter().map(|p| p.registration).collect()
    }

    /// Invokes every pending callback with its payload.
    pub fn deliver(self) {
        for pending in self.pending {
            tracing::trace!(registration = pending.registration.as_raw(), "delivering raw change");
            let mut callback = pending.callback.lock();
            (callback)(&pending.change);
        }
    }
}

impl fmt::Debug for NotificationBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBatch")
            .field("registrations", &self.registrations())
            .finish()
    }
}

// =============================================================================
// The Engine Contract
// =============================================================================

/// The native engine as seen by the core.
///
/// # Thread Safety
///
/// The engine itself is `Send + Sync`, but the core only ever mutates a live
/// snapshot from the single thread that owns it (writer or notifier). Engines
/// may rely on that contract.
pub trait NativeEngine: Send + Sync + 'static {
    // ---- snapshot lifecycle ----

    /// Opens a new live snapshot at the latest committed version.
    fn open(&self) -> EngineResult<SnapshotPtr>;

    /// Pins the current version of a live snapshot into a new frozen snapshot.
    fn freeze(&self, live: SnapshotPtr) -> EngineResult<SnapshotPtr>;

    /// Releases a snapshot. Releasing twice fails with `Closed`.
    fn close(&self, snapshot: SnapshotPtr) -> EngineResult<()>;

    /// True once `close` has been called for this snapshot.
    fn is_closed(&self, snapshot: SnapshotPtr) -> bool;

    /// Current version of a snapshot.
    fn version(&self, snapshot: SnapshotPtr) -> EngineResult<VersionId>;

    /// True if the snapshot is pinned.
    fn is_frozen(&self, snapshot: SnapshotPtr) -> EngineResult<bool>;

    /// Advances a live snapshot to the latest committed version and returns the
    /// callbacks that became due.
    fn refresh(&self, live: SnapshotPtr) -> EngineResult<NotificationBatch>;

    /// Latest committed version, updated on every commit by any writer.
    fn commit_signal(&self) -> watch::Receiver<VersionId>;

    // ---- transactions ----

    fn begin_transaction(&self, live: SnapshotPtr) -> EngineResult<()>;

    /// Commits and returns the new version.
    fn commit(&self, live: SnapshotPtr) -> EngineResult<VersionId>;

    fn rollback(&self, live: SnapshotPtr) -> EngineResult<()>;

    fn is_in_transaction(&self, live: SnapshotPtr) -> bool;

    // ---- notifications ----

    /// Registers a callback on a pointer resolved against a live snapshot.
    fn register_change_callback(
        &self,
        ptr: &NativePtr,
        callback: RawCallback,
    ) -> EngineResult<RegistrationPtr>;

    fn release_registration(&self, registration: RegistrationPtr) -> EngineResult<()>;

    // ---- resolution ----

    /// Re-resolves `ptr` against another snapshot; `None` if it no longer exists.
    fn resolve_at(&self, ptr: &NativePtr, snapshot: SnapshotPtr) -> EngineResult<Option<NativePtr>>;

    // ---- reads ----

    fn object_row(&self, ptr: &NativePtr) -> EngineResult<Row>;

    /// Items of a list or set.
    fn collection_items(&self, ptr: &NativePtr) -> EngineResult<Vec<Value>>;

    fn map_entries(&self, ptr: &NativePtr) -> EngineResult<BTreeMap<String, Value>>;

    fn results_keys(&self, ptr: &NativePtr) -> EngineResult<Vec<ObjectKey>>;

    // ---- writes (live snapshot inside a transaction) ----

    fn create_object(
        &self,
        live: SnapshotPtr,
        class: &str,
        key: ObjectKey,
        row: Row,
    ) -> EngineResult<NativePtr>;

    fn set_field(&self, ptr: &NativePtr, field: &str, value: FieldValue) -> EngineResult<()>;

    fn delete_object(&self, ptr: &NativePtr) -> EngineResult<()>;

    fn list_insert(&self, ptr: &NativePtr, index: usize, value: Value) -> EngineResult<()>;

    fn list_remove(&self, ptr: &NativePtr, index: usize) -> EngineResult<Value>;

    fn set_insert(&self, ptr: &NativePtr, value: Value) -> EngineResult<bool>;

    fn set_remove(&self, ptr: &NativePtr, value: &Value) -> EngineResult<bool>;

    fn map_insert(&self, ptr: &NativePtr, key: String, value: Value) -> EngineResult<Option<Value>>;

    fn map_remove(&self, ptr: &NativePtr, key: &str) -> EngineResult<Option<Value>>;
}

// =============================================================================
// Tests
// =============================================================================
