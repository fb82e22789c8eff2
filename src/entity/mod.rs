//! # Entities
//!
//! User-facing views over objects, collections, and result sets.
//!
//! An entity is either **unmanaged** (a plain in-memory value with no
//! handle) or **managed** (exactly one [`VersionedHandle`] plus a native
//! pointer resolved against that handle's snapshot). The handle and the
//! pointer are created together and never swapped independently; freeze and
//! thaw build a new entity.
//!
//! | Kind         | Unmanaged value             | Event                          |
//! |--------------|-----------------------------|--------------------------------|
//! | [`ObjectRef`]  | class, key, row           | [`ObjectChange`](crate::ObjectChange) |
//! | [`ListRef`]    | `Vec<Value>`              | [`ListChange`]                 |
//! | [`SetRef`]     | canonical `Vec<Value>`    | [`SetChange`]                  |
//! | [`MapRef`]     | `BTreeMap<String, Value>` | [`MapChange`](crate::MapChange) |
//! | [`ResultsRef`] | `Vec<ObjectRef>`          | [`ResultsChange`]              |

mod list;
mod map;
mod object;
mod results;
mod set;

use std::sync::Arc;

pub use list::ListRef;
pub use map::MapRef;
pub use object::ObjectRef;
pub use results::ResultsRef;
pub use set::SetRef;

use crate::api::Session;
use crate::engine::{NativeEngine, NativePtr, RawCallback, RegistrationPtr, Target};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::observable::{CollectionChange, Observable};
use crate::subscription::Subscription;
use crate::types::VersionId;

/// Event stream item for lists.
pub type ListChange = CollectionChange<ListRef>;
/// Event stream item for sets.
pub type SetChange = CollectionChange<SetRef>;
/// Event stream item for result sets.
pub type ResultsChange = CollectionChange<ResultsRef>;

// =============================================================================
// Managed State
// =============================================================================

/// A handle and a pointer resolved against that handle's snapshot.
#[derive(Debug, Clone)]
pub(crate) struct Managed {
    handle: VersionedHandle,
    ptr: NativePtr,
}

impl Managed {
    pub(crate) fn new(handle: VersionedHandle, target: Target) -> Self {
        let ptr = NativePtr::new(handle.snapshot(), target);
        Self { handle, ptr }
    }

    pub(crate) fn handle(&self) -> &VersionedHandle {
        &self.handle
    }

    pub(crate) fn ptr(&self) -> &NativePtr {
        &self.ptr
    }

    pub(crate) fn target(&self) -> &Target {
        self.ptr.target()
    }

    /// The same handle pointing at another target.
    pub(crate) fn sibling(&self, target: Target) -> Managed {
        Managed::new(self.handle.clone(), target)
    }

    /// Engine for a read; fails if the handle was released.
    pub(crate) fn engine(&self) -> Result<Arc<dyn NativeEngine>> {
        self.handle.check_open()?;
        self.handle.engine()
    }

    /// Engine for a mutation; requires a live handle inside a transaction.
    pub(crate) fn writable(&self) -> Result<Arc<dyn NativeEngine>> {
        let engine = self.engine()?;
        if self.handle.is_frozen() {
            return Err(Error::invalid_state(format!(
                "cannot modify {:?}: it is frozen",
                self.target()
            )));
        }
        if !engine.is_in_transaction(self.handle.snapshot()) {
            return Err(Error::invalid_state(
                "cannot modify outside a write transaction",
            ));
        }
        Ok(engine)
    }

    fn resolve(&self, target: &VersionedHandle) -> Result<Option<Managed>> {
        let engine = self.engine()?;
        target.check_open()?;
        Ok(engine
            .resolve_at(&self.ptr, target.snapshot())?
            .map(|ptr| Managed {
                handle: target.clone(),
                ptr,
            }))
    }

    pub(crate) fn freeze(&self, target: &VersionedHandle) -> Result<Option<Managed>> {
        if !target.is_frozen() {
            return Err(Error::invalid_state("freeze target must be a frozen version"));
        }
        self.resolve(target)
    }

    pub(crate) fn thaw(&self, target: &VersionedHandle) -> Result<Option<Managed>> {
        if target.is_frozen() {
            return Err(Error::invalid_state("thaw target must be a live version"));
        }
        self.resolve(target)
    }

    pub(crate) fn register(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        if self.handle.is_frozen() {
            return Err(Error::invalid_state(
                "notifications can only be registered on a live entity",
            ));
        }
        let engine = self.engine()?;
        Ok(engine.register_change_callback(&self.ptr, callback)?)
    }

    pub(crate) fn version(&self) -> Result<VersionId> {
        self.handle.version()
    }
}

pub(crate) fn unmanaged_error(what: &str, operation: &str) -> Error {
    Error::invalid_state(format!("cannot {operation} an unmanaged {what}"))
}

// =============================================================================
// Subscribe
// =============================================================================

/// Subscribes through the notifier of the session owning `entity`.
pub(crate) async fn subscribe<T: Observable>(entity: &T) -> Result<Subscription<T::Event>> {
    let handle = entity
        .handle()
        .ok_or_else(|| unmanaged_error("entity", "subscribe to"))?;
    let session = Session::from_core(handle.session()?);
    session.subscribe(entity).await
}

/// Implements the entity-level surface shared by every kind.
macro_rules! entity_common {
    ($ty:ident, $state:ident) => {
        impl $ty {
            /// True if this entity is backed by a database snapshot.
            pub fn is_managed(&self) -> bool {
                matches!(self.state, $state::Managed(_))
            }

            /// True if this entity is pinned to a frozen version.
            pub fn is_frozen(&self) -> bool {
                match &self.state {
                    $state::Managed(managed) => managed.handle().is_frozen(),
                    $state::Unmanaged(..) => false,
                }
            }

            /// Version this entity observes.
            pub fn version(&self) -> $crate::error::Result<$crate::types::VersionId> {
                match &self.state {
                    $state::Managed(managed) => managed.version(),
                    $state::Unmanaged(..) => Err($crate::entity::unmanaged_error(
                        stringify!($ty),
                        "read the version of",
                    )),
                }
            }

            /// Subscribes to changes of this entity.
            pub async fn subscribe(
                &self,
            ) -> $crate::error::Result<
                $crate::subscription::Subscription<<Self as $crate::observable::Observable>::Event>,
            > {
                $crate::entity::subscribe(self).await
            }

            fn managed(&self) -> Option<&$crate::entity::Managed> {
                match &self.state {
                    $state::Managed(managed) => Some(managed),
                    $state::Unmanaged(..) => None,
                }
            }
        }

        impl $crate::writer::WriteOutput for $ty {
            type Frozen = Option<$ty>;

            fn into_frozen(
                self,
                frozen: &$crate::handle::VersionedHandle,
            ) -> $crate::error::Result<Option<$ty>> {
                if self.is_managed() {
                    $crate::observable::Observable::freeze(&self, frozen)
                } else {
                    Ok(Some(self))
                }
            }
        }
    };
}

pub(crate) use entity_common;
