//! # Error Handling for Frostline
//!
//! A single error enum ([`Error`]) covers every failure a caller can observe.
//! Engine failures are translated at the native boundary (see
//! [`crate::engine::EngineError`]) into a handful of categories so that upper
//! layers can decide between retrying and aborting.
//!
//! ## Error Categories
//!
//! | Category      | Examples                                   | Typical Response        |
//! |---------------|--------------------------------------------|-------------------------|
//! | Closed        | Handle used after its session was closed   | Reopen, never retry     |
//! | State         | Commit twice, register on a frozen entity  | Fix the calling code    |
//! | Argument      | Duplicate primary key, bad index           | Fix the input           |
//! | Delivery      | Subscriber too slow for its buffer         | Resubscribe, buffer more|
//! | Unrecoverable | Engine out of resources, fatal engine error| Close the session       |
//!
//! ## What Is Not an Error
//!
//! Resolving an entity at a version where it no longer exists is a first-class
//! outcome, not a failure: freeze and thaw return `Ok(None)`. The only place a
//! deletion becomes an error is subscribing to something that is already gone
//! ([`Error::DeletedReference`]), because there is nothing to observe.

use thiserror::Error;

use crate::engine::{EngineError, EngineErrorKind};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in Frostline operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Closed Resources
    // =========================================================================

    /// A handle, entity, or session was used after it was released.
    ///
    /// Calls on a closed handle always fail loudly; they never return data
    /// from a snapshot that has been reclaimed.
    #[error("handle closed: {0}")]
    Closed(String),

    // =========================================================================
    // Invalid State (fatal to the call, not to the session)
    // =========================================================================

    /// The operation is not legal in the entity's or session's current state.
    ///
    /// # When This Happens
    ///
    /// - Registering for notifications on a frozen or unmanaged entity
    /// - Mutating an entity outside a write transaction
    /// - Freezing an unmanaged entity
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `begin` was called while a write transaction is already open.
    #[error("transaction in progress")]
    TransactionInProgress,

    /// `commit` or `rollback` was called with no open write transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// The session was asked to close while a write transaction is open.
    #[error("cannot close while a write transaction is in progress")]
    CloseDuringTransaction,

    /// Subscribing to an entity that does not exist at the notifier's version.
    #[error("cannot observe a deleted reference")]
    DeletedReference,

    // =========================================================================
    // Delivery
    // =========================================================================

    /// A subscriber did not drain its delivery buffer fast enough.
    ///
    /// Fine-grained change sets are only meaningful relative to their
    /// immediate predecessor, so dropping one would corrupt every later index.
    /// The subscription is cancelled instead.
    #[error(
        "insufficient buffer: subscriber fell behind its delivery buffer of {capacity} events; \
         drain the subscription faster or raise delivery_buffer_capacity"
    )]
    InsufficientBuffer {
        /// Capacity of the delivery buffer that overflowed
        capacity: usize,
    },

    // =========================================================================
    // Engine Errors
    // =========================================================================

    /// An error reported by the native engine.
    #[error("engine error ({category:?}): {message}")]
    Engine {
        /// Translated category of the engine failure
        category: ErrorCategory,
        /// Message from the engine
        message: String,
    },

    // =========================================================================
    // Lifecycle and Configuration
    // =========================================================================

    /// A writer or notifier context has shut down and cannot take requests.
    #[error("execution context shut down: {0}")]
    Shutdown(String),

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Coarse classification used to decide retry vs abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or a logic error in the caller.
    Argument,
    /// The call is not legal in the current state.
    State,
    /// The resource was already released.
    Closed,
    /// A subscriber could not keep up.
    Delivery,
    /// Resource exhaustion or a fatal engine condition.
    Unrecoverable,
}

impl Error {
    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Closed(_) | Error::Shutdown(_) => ErrorCategory::Closed,
            Error::InvalidState(_)
            | Error::TransactionInProgress
            | Error::NoTransaction
            | Error::CloseDuringTransaction
            | Error::DeletedReference => ErrorCategory::State,
            Error::InsufficientBuffer { .. } => ErrorCategory::Delivery,
            Error::Engine { category, .. } => *category,
            Error::Config(_) => ErrorCategory::Argument,
        }
    }

    /// Returns false for resource-exhaustion and fatal engine failures.
    pub fn is_recoverable(&self) -> bool {
        self.category() != ErrorCategory::Unrecoverable
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub(crate) fn closed(msg: impl Into<String>) -> Self {
        Error::Closed(msg.into())
    }
}

// =============================================================================
// Boundary Translation
// =============================================================================

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        let EngineError { kind, message } = err;
        match kind {
            EngineErrorKind::Closed => Error::Closed(message),
            EngineErrorKind::IllegalArgument | EngineErrorKind::Logic => Error::Engine {
                category: ErrorCategory::Argument,
                message,
            },
            EngineErrorKind::State => Error::Engine {
                category: ErrorCategory::State,
                message,
            },
            EngineErrorKind::ResourceExhausted | EngineErrorKind::Fatal => Error::Engine {
                category: ErrorCategory::Unrecoverable,
                message,
            },
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
