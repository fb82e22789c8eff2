//! # Frostline - Multi-Version Consistency and Change Notification
//!
//! Frostline is the client-side core of an embedded, single-writer,
//! multi-version database. It provides:
//!
//! - **Frozen snapshots**: immutable, thread-shareable views pinned at one version
//! - **Serialized writes**: one writer thread, one transaction at a time
//! - **Fine-grained notifications**: per-entity change sets with stable indices
//! - **Deterministic reclamation**: snapshots close once no handle references them
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session API                             │
//! │          (write, subscribe, current, results, close)            │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │        Writer Session         │ │       Notifier Session        │
//! │  (thread, live snapshot,      │ │  (lazy thread, live snapshot, │
//! │   begin/commit/rollback)      │ │   refresh + callbacks)        │
//! └───────────────┬───────────────┘ └───────────────┬───────────────┘
//!                 │ publish frozen                  │ publish frozen
//!                 ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │      Current-Version Slot  +  Version Tracker (reclamation)     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   NativeEngine (MemoryEngine)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Monotonic versions**: the published version of a session never decreases
//! 2. **One handle per entity**: handle and native pointer never change independently
//! 3. **No use after close**: a released snapshot is never read, only rejected
//! 4. **Initial first, deleted last**: every subscription starts with the
//!    initial state and ends after at most one deletion event
//! 5. **Single writer**: at most one write transaction is open per session
//!
//! ## Module Organization
//!
//! - [`error`]: error enum and engine error translation
//! - [`types`]: versions, object keys, field values
//! - [`config`]: session configuration
//! - [`engine`]: the native engine contract and the in-memory engine
//! - [`handle`]: versioned handles and liveness tracking
//! - [`tracker`]: reclamation of unreachable frozen snapshots
//! - [`changeset`]: translation of raw engine changes into change sets
//! - [`entity`]: objects, lists, sets, maps, and result sets
//! - [`observable`]: the capability set shared by every entity kind
//! - [`subscription`]: tokens and event streams
//! - [`writer`]: the writer execution context
//! - [`api`]: the session (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for Frostline operations.
pub mod error;

/// Versions, keys, and field values.
pub mod types;

/// Session configuration loaded from code or JSON.
pub mod config;

/// The native engine contract.
///
/// Everything below this boundary is opaque: snapshots and registrations are
/// plain pointers, and failures come back as coded [`engine::EngineError`]s.
/// [`engine::MemoryEngine`] is the in-process implementation.
pub mod engine;

/// Versioned handles and the handle liveness registry.
pub mod handle;

/// Reclamation of frozen snapshots.
pub mod tracker;

/// Change sets computed from raw engine changes.
pub mod changeset;

/// User-facing entities.
pub mod entity;

/// The observable capability set and event types.
pub mod observable;

/// Notification tokens, subscriptions, and version streams.
pub mod subscription;

/// The writer execution context.
///
/// Write blocks run one at a time on a dedicated thread. Results are frozen
/// at the committed version before they are handed back.
pub mod writer;

/// The notifier execution context.
mod notifier;

/// The session, main entry point.
///
/// See [`Session`](api::Session).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Session;
pub use changeset::{ChangeKind, ChangeSet, ChangeSetBuilder, IndexRange, MapChangeSet};
pub use config::SessionConfig;
pub use engine::{EngineError, EngineErrorKind, MemoryEngine, NativeEngine};
pub use entity::{
    ListChange, ListRef, MapRef, ObjectRef, ResultsChange, ResultsRef, SetChange, SetRef,
};
pub use error::{Error, ErrorCategory, Result};
pub use handle::{HandleId, VersionedHandle};
pub use observable::{CollectionChange, DeliveryResult, MapChange, ObjectChange, Observable};
pub use subscription::{NotificationToken, Subscription, VersionChanges};
pub use tracker::VersionTracker;
pub use types::{FieldValue, ObjectKey, Row, VersionId};
pub use writer::{WriteContext, WriteOutput};
