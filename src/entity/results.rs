use std::fmt;

use super::{entity_common, unmanaged_error, Managed, ObjectRef, ResultsChange};
use crate::engine::{RawCallback, RawChange, RegistrationPtr};
use crate::error::Result;
use crate::handle::VersionedHandle;
use crate::observable::{emit_collection, DeliveryResult, DeliverySink, Observable};
use crate::types::ObjectKey;

#[derive(Clone)]
enum ResultsState {
    Managed(Managed),
    Unmanaged(Vec<ObjectRef>),
}

/// Every object of one class, ordered by key.
#[derive(Clone)]
pub struct ResultsRef {
    state: ResultsState,
}

entity_common!(ResultsRef, ResultsState);

impl ResultsRef {
    pub fn unmanaged(objects: Vec<ObjectRef>) -> Self {
        Self {
            state: ResultsState::Unmanaged(objects),
        }
    }

    pub(crate) fn from_managed(managed: Managed) -> Self {
        Self {
            state: ResultsState::Managed(managed),
        }
    }

    /// Keys of the objects, in result order.
    pub fn keys(&self) -> Result<Vec<ObjectKey>> {
        match &self.state {
            ResultsState::Managed(managed) => Ok(managed.engine()?.results_keys(managed.ptr())?),
            ResultsState::Unmanaged(objects) => Ok(objects.iter().map(ObjectRef::key).collect()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The object at `index`, bound to the same version as this result set.
    pub fn get(&self, index: usize) -> Result<Option<ObjectRef>> {
        match &self.state {
            ResultsState::Managed(managed) => Ok(self
                .keys()?
                .get(index)
                .map(|key| object_at(managed, *key))),
            ResultsState::Unmanaged(objects) => Ok(objects.get(index).cloned()),
        }
    }

    /// All objects, bound to the same version as this result set.
    pub fn objects(&self) -> Result<Vec<ObjectRef>> {
        match &self.state {
            ResultsState::Managed(managed) => Ok(self
                .keys()?
                .into_iter()
                .map(|key| object_at(managed, key))
                .collect()),
            ResultsState::Unmanaged(objects) => Ok(objects.clone()),
        }
    }
}

fn object_at(managed: &Managed, key: ObjectKey) -> ObjectRef {
    ObjectRef::managed_at(managed.handle().clone(), managed.target().class(), key)
}

impl Observable for ResultsRef {
    type Event = ResultsChange;

    fn handle(&self) -> Option<&VersionedHandle> {
        self.managed().map(Managed::handle)
    }

    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        self.managed()
            .ok_or_else(|| unmanaged_error("result set", "observe"))?
            .register(callback)
    }

    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self
            .managed()
            .ok_or_else(|| unmanaged_error("result set", "freeze"))?;
        Ok(managed.freeze(target)?.map(Self::from_managed))
    }

    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self
            .managed()
            .ok_or_else(|| unmanaged_error("result set", "thaw"))?;
        Ok(managed.thaw(target)?.map(Self::from_managed))
    }

    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<ResultsChange>,
    ) -> Result<DeliveryResult> {
        emit_collection(self, frozen, change, sink)
    }
}

impl fmt::Debug for ResultsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ResultsState::Managed(managed) => f.debug_tuple("ResultsRef").field(managed).finish(),
            ResultsState::Unmanaged(objects) => f.debug_tuple("ResultsRef").field(objects).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;

    #[test]
    fn test_unmanaged_results() {
        let results = ResultsRef::unmanaged(vec![
            ObjectRef::unmanaged("Item", 2, Row::new()),
            ObjectRef::unmanaged("Item", 5, Row::new()),
        ]);
        assert_eq!(results.keys().unwrap(), vec![ObjectKey::new(2), ObjectKey::new(5)]);
        assert_eq!(results.get(1).unwrap().unwrap().key(), ObjectKey::new(5));
        assert!(results.get(2).unwrap().is_none());
        assert!(!results.is_frozen());
    }
}
