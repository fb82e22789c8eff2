use std::fmt;

use serde_json::Value;

use super::{entity_common, unmanaged_error, Managed, SetChange};
use crate::engine::{RawCallback, RawChange, RegistrationPtr};
use crate::error::Result;
use crate::handle::VersionedHandle;
use crate::observable::{emit_collection, DeliveryResult, DeliverySink, Observable};
use crate::types::{canonical_key, insert_canonical};

#[derive(Clone)]
enum SetState {
    Managed(Managed),
    Unmanaged(Vec<Value>),
}

/// A set field of an object.
///
/// Members are distinct and kept in canonical order, so set change sets use
/// positions in that order.
#[derive(Clone)]
pub struct SetRef {
    state: SetState,
}

entity_common!(SetRef, SetState);

impl SetRef {
    /// An in-memory set; duplicates in `items` are dropped.
    pub fn unmanaged(items: Vec<Value>) -> Self {
        let mut members = Vec::with_capacity(items.len());
        for item in items {
            insert_canonical(&mut members, item);
        }
        Self {
            state: SetState::Unmanaged(members),
        }
    }

    pub(crate) fn from_managed(managed: Managed) -> Self {
        Self {
            state: SetState::Managed(managed),
        }
    }

    /// Members in canonical order.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        match &self.state {
            SetState::Managed(managed) => Ok(managed.engine()?.collection_items(managed.ptr())?),
            SetState::Unmanaged(items) => Ok(items.clone()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        let key = canonical_key(value);
        Ok(self.to_vec()?.iter().any(|member| canonical_key(member) == key))
    }

    /// Adds a member. Returns false if it was already present.
    pub fn insert(&mut self, value: Value) -> Result<bool> {
        match &mut self.state {
            SetState::Managed(managed) => Ok(managed.writable()?.set_insert(managed.ptr(), value)?),
            SetState::Unmanaged(items) => Ok(insert_canonical(items, value)),
        }
    }

    /// Removes a member. Returns false if it was absent.
    pub fn remove(&mut self, value: &Value) -> Result<bool> {
        match &mut self.state {
            SetState::Managed(managed) => Ok(managed.writable()?.set_remove(managed.ptr(), value)?),
            SetState::Unmanaged(items) => match items.iter().position(|member| member == value) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

impl Observable for SetRef {
    type Event = SetChange;

    fn handle(&self) -> Option<&VersionedHandle> {
        self.managed().map(Managed::handle)
    }

    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        self.managed()
            .ok_or_else(|| unmanaged_error("set", "observe"))?
            .register(callback)
    }

    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("set", "freeze"))?;
        Ok(managed.freeze(target)?.map(Self::from_managed))
    }

    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("set", "thaw"))?;
        Ok(managed.thaw(target)?.map(Self::from_managed))
    }

    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<SetChange>,
    ) -> Result<DeliveryResult> {
        emit_collection(self, frozen, change, sink)
    }
}

impl fmt::Debug for SetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            SetState::Managed(managed) => f.debug_tuple("SetRef").field(managed).finish(),
            SetState::Unmanaged(items) => f.debug_tuple("SetRef").field(items).finish(),
        }
    }
}
