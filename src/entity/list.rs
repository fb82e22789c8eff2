use std::fmt;

use serde_json::Value;

use super::{entity_common, unmanaged_error, ListChange, Managed};
use crate::engine::{RawCallback, RawChange, RegistrationPtr};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::observable::{emit_collection, DeliveryResult, DeliverySink, Observable};

#[derive(Clone)]
enum ListState {
    Managed(Managed),
    Unmanaged(Vec<Value>),
}

/// An ordered list field of an object. Duplicates are allowed.
#[derive(Clone)]
pub struct ListRef {
    state: ListState,
}

entity_common!(ListRef, ListState);

impl ListRef {
    pub fn unmanaged(items: Vec<Value>) -> Self {
        Self {
            state: ListState::Unmanaged(items),
        }
    }

    pub(crate) fn from_managed(managed: Managed) -> Self {
        Self {
            state: ListState::Managed(managed),
        }
    }

    /// Snapshot of the items.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        match &self.state {
            ListState::Managed(managed) => Ok(managed.engine()?.collection_items(managed.ptr())?),
            ListState::Unmanaged(items) => Ok(items.clone()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        Ok(self.to_vec()?.into_iter().nth(index))
    }

    /// Appends to the end.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let index = self.len()?;
        self.insert(index, value)
    }

    pub fn insert(&mut self, index: usize, value: Value) -> Result<()> {
        match &mut self.state {
            ListState::Managed(managed) => {
                Ok(managed.writable()?.list_insert(managed.ptr(), index, value)?)
            }
            ListState::Unmanaged(items) => {
                if index > items.len() {
                    return Err(out_of_bounds(index, items.len()));
                }
                items.insert(index, value);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> Result<Value> {
        match &mut self.state {
            ListState::Managed(managed) => {
                Ok(managed.writable()?.list_remove(managed.ptr(), index)?)
            }
            ListState::Unmanaged(items) => {
                if index >= items.len() {
                    return Err(out_of_bounds(index, items.len()));
                }
                Ok(items.remove(index))
            }
        }
    }
}

fn out_of_bounds(index: usize, len: usize) -> Error {
    Error::invalid_state(format!("index {index} out of bounds for list of length {len}"))
}

impl Observable for ListRef {
    type Event = ListChange;

    fn handle(&self) -> Option<&VersionedHandle> {
        self.managed().map(Managed::handle)
    }

    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        self.managed()
            .ok_or_else(|| unmanaged_error("list", "observe"))?
            .register(callback)
    }

    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("list", "freeze"))?;
        Ok(managed.freeze(target)?.map(Self::from_managed))
    }

    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("list", "thaw"))?;
        Ok(managed.thaw(target)?.map(Self::from_managed))
    }

    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<ListChange>,
    ) -> Result<DeliveryResult> {
        emit_collection(self, frozen, change, sink)
    }
}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ListState::Managed(managed) => f.debug_tuple("ListRef").field(managed).finish(),
            ListState::Unmanaged(items) => f.debug_tuple("ListRef").field(items).finish(),
        }
    }
}
