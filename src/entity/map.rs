use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use super::{entity_common, unmanaged_error, Managed};
use crate::changeset::{ChangeKind, ChangeSetBuilder};
use crate::engine::{RawCallback, RawChange, RegistrationPtr};
use crate::error::Result;
use crate::handle::VersionedHandle;
use crate::observable::{DeliveryResult, DeliverySink, MapChange, Observable};

#[derive(Clone)]
enum MapState {
    Managed(Managed),
    Unmanaged(BTreeMap<String, Value>),
}

/// A string-keyed map field of an object.
#[derive(Clone)]
pub struct MapRef {
    state: MapState,
}

entity_common!(MapRef, MapState);

impl MapRef {
    pub fn unmanaged(entries: BTreeMap<String, Value>) -> Self {
        Self {
            state: MapState::Unmanaged(entries),
        }
    }

    pub(crate) fn from_managed(managed: Managed) -> Self {
        Self {
            state: MapState::Managed(managed),
        }
    }

    pub fn entries(&self) -> Result<BTreeMap<String, Value>> {
        match &self.state {
            MapState::Managed(managed) => Ok(managed.engine()?.map_entries(managed.ptr())?),
            MapState::Unmanaged(entries) => Ok(entries.clone()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries()?.remove(key))
    }

    /// Inserts or replaces an entry, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<Option<Value>> {
        let key = key.into();
        match &mut self.state {
            MapState::Managed(managed) => Ok(managed.writable()?.map_insert(managed.ptr(), key, value)?),
            MapState::Unmanaged(entries) => Ok(entries.insert(key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        match &mut self.state {
            MapState::Managed(managed) => Ok(managed.writable()?.map_remove(managed.ptr(), key)?),
            MapState::Unmanaged(entries) => Ok(entries.remove(key)),
        }
    }
}

impl Observable for MapRef {
    type Event = MapChange;

    fn handle(&self) -> Option<&VersionedHandle> {
        self.managed().map(Managed::handle)
    }

    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        self.managed()
            .ok_or_else(|| unmanaged_error("map", "observe"))?
            .register(callback)
    }

    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("map", "freeze"))?;
        Ok(managed.freeze(target)?.map(Self::from_managed))
    }

    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("map", "thaw"))?;
        Ok(managed.thaw(target)?.map(Self::from_managed))
    }

    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<MapChange>,
    ) -> Result<DeliveryResult> {
        let builder = ChangeSetBuilder::new(change);
        if builder.kind() == ChangeKind::Deleted {
            return Ok(sink.finish(MapChange::Deleted));
        }
        let Some(map) = self.freeze(frozen)? else {
            return Ok(sink.finish(MapChange::Deleted));
        };
        let event = if builder.is_initial() {
            MapChange::Initial(map)
        } else {
            MapChange::Updated {
                map,
                changes: builder.map(),
            }
        };
        Ok(sink.send(event))
    }
}

impl fmt::Debug for MapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            MapState::Managed(managed) => f.debug_tuple("MapRef").field(managed).finish(),
            MapState::Unmanaged(entries) => f.debug_tuple("MapRef").field(entries).finish(),
        }
    }
}
