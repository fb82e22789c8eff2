use std::fmt;

use serde_json::Value;

use super::{entity_common, unmanaged_error, ListRef, Managed, MapRef, SetRef};
use crate::changeset::{ChangeKind, ChangeSetBuilder};
use crate::engine::{RawCallback, RawChange, RegistrationPtr, Target};
use crate::error::{Error, Result};
use crate::handle::VersionedHandle;
use crate::observable::{DeliveryResult, DeliverySink, Observable, ObjectChange};
use crate::types::{FieldValue, ObjectKey, Row};

#[derive(Clone)]
enum ObjectState {
    Managed(Managed),
    Unmanaged(UnmanagedObject),
}

#[derive(Debug, Clone)]
struct UnmanagedObject {
    class: String,
    row: Row,
}

/// A single object of a class, identified by its key.
#[derive(Clone)]
pub struct ObjectRef {
    key: ObjectKey,
    state: ObjectState,
}

entity_common!(ObjectRef, ObjectState);

impl ObjectRef {
    /// An in-memory object not backed by any snapshot.
    pub fn unmanaged(class: impl Into<String>, key: impl Into<ObjectKey>, row: Row) -> Self {
        Self {
            key: key.into(),
            state: ObjectState::Unmanaged(UnmanagedObject {
                class: class.into(),
                row,
            }),
        }
    }

    /// The object `class#key` as seen through `handle`.
    pub(crate) fn managed_at(handle: VersionedHandle, class: &str, key: ObjectKey) -> Self {
        let target = Target::Object {
            class: class.to_string(),
            key,
        };
        Self {
            key,
            state: ObjectState::Managed(Managed::new(handle, target)),
        }
    }

    /// Same object, rebound to a resolved pointer.
    fn rebind(&self, managed: Managed) -> Self {
        Self {
            key: self.key,
            state: ObjectState::Managed(managed),
        }
    }

    pub fn class(&self) -> &str {
        match &self.state {
            ObjectState::Managed(managed) => managed.target().class(),
            ObjectState::Unmanaged(object) => &object.class,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// All fields of the object.
    pub fn fields(&self) -> Result<Row> {
        match &self.state {
            ObjectState::Managed(managed) => Ok(managed.engine()?.object_row(managed.ptr())?),
            ObjectState::Unmanaged(object) => Ok(object.row.clone()),
        }
    }

    pub fn get(&self, field: &str) -> Result<Option<FieldValue>> {
        Ok(self.fields()?.remove(field))
    }

    /// A scalar field; `None` if absent or not a scalar.
    pub fn value(&self, field: &str) -> Result<Option<Value>> {
        match self.get(field)? {
            Some(FieldValue::Value(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Sets a field. Managed objects must be live and inside a transaction.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        match &mut self.state {
            ObjectState::Managed(managed) => {
                Ok(managed.writable()?.set_field(managed.ptr(), field, value)?)
            }
            ObjectState::Unmanaged(object) => {
                object.row.insert(field.to_string(), value);
                Ok(())
            }
        }
    }

    /// Deletes the object. Only valid on a live object inside a transaction.
    pub fn delete(self) -> Result<()> {
        let managed = self
            .managed()
            .ok_or_else(|| unmanaged_error("object", "delete"))?;
        Ok(managed.writable()?.delete_object(managed.ptr())?)
    }

    pub fn list(&self, field: &str) -> Result<ListRef> {
        match &self.state {
            ObjectState::Managed(managed) => Ok(ListRef::from_managed(
                managed.sibling(self.collection_target(field, CollectionKind::List)),
            )),
            ObjectState::Unmanaged(object) => match object.row.get(field) {
                None => Ok(ListRef::unmanaged(Vec::new())),
                Some(FieldValue::List(items)) => Ok(ListRef::unmanaged(items.clone())),
                Some(other) => Err(kind_mismatch(field, "list", other)),
            },
        }
    }

    /// A set-valued field.
    pub fn value_set(&self, field: &str) -> Result<SetRef> {
        match &self.state {
            ObjectState::Managed(managed) => Ok(SetRef::from_managed(
                managed.sibling(self.collection_target(field, CollectionKind::Set)),
            )),
            ObjectState::Unmanaged(object) => match object.row.get(field) {
                None => Ok(SetRef::unmanaged(Vec::new())),
                Some(FieldValue::Set(items)) => Ok(SetRef::unmanaged(items.clone())),
                Some(other) => Err(kind_mismatch(field, "set", other)),
            },
        }
    }

    pub fn map(&self, field: &str) -> Result<MapRef> {
        match &self.state {
            ObjectState::Managed(managed) => Ok(MapRef::from_managed(
                managed.sibling(self.collection_target(field, CollectionKind::Map)),
            )),
            ObjectState::Unmanaged(object) => match object.row.get(field) {
                None => Ok(MapRef::unmanaged(Default::default())),
                Some(FieldValue::Map(entries)) => Ok(MapRef::unmanaged(entries.clone())),
                Some(other) => Err(kind_mismatch(field, "map", other)),
            },
        }
    }

    fn collection_target(&self, field: &str, kind: CollectionKind) -> Target {
        let class = self.class().to_string();
        let key = self.key;
        let field = field.to_string();
        match kind {
            CollectionKind::List => Target::List { class, key, field },
            CollectionKind::Set => Target::Set { class, key, field },
            CollectionKind::Map => Target::Map { class, key, field },
        }
    }
}

enum CollectionKind {
    List,
    Set,
    Map,
}

fn kind_mismatch(field: &str, wanted: &str, found: &FieldValue) -> Error {
    Error::invalid_state(format!(
        "field '{field}' is a {}, not a {wanted}",
        found.kind()
    ))
}

impl Observable for ObjectRef {
    type Event = ObjectChange;

    fn handle(&self) -> Option<&VersionedHandle> {
        self.managed().map(Managed::handle)
    }

    fn register_for_notification(&self, callback: RawCallback) -> Result<RegistrationPtr> {
        self.managed()
            .ok_or_else(|| unmanaged_error("object", "observe"))?
            .register(callback)
    }

    fn freeze(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self
            .managed()
            .ok_or_else(|| unmanaged_error("object", "freeze"))?;
        Ok(managed.freeze(target)?.map(|resolved| self.rebind(resolved)))
    }

    fn thaw(&self, target: &VersionedHandle) -> Result<Option<Self>> {
        let managed = self.managed().ok_or_else(|| unmanaged_error("object", "thaw"))?;
        Ok(managed.thaw(target)?.map(|resolved| self.rebind(resolved)))
    }

    fn emit_update(
        &self,
        frozen: &VersionedHandle,
        change: &RawChange,
        sink: &DeliverySink<ObjectChange>,
    ) -> Result<DeliveryResult> {
        let builder = ChangeSetBuilder::new(change);
        let deleted = ObjectChange::Deleted { key: self.key() };
        if builder.kind() == ChangeKind::Deleted {
            return Ok(sink.finish(deleted));
        }
        let Some(object) = self.freeze(frozen)? else {
            return Ok(sink.finish(deleted));
        };
        let event = if builder.is_initial() {
            ObjectChange::Initial(object)
        } else {
            ObjectChange::Updated {
                object,
                changed_fields: builder.changed_fields(),
            }
        };
        Ok(sink.send(event))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ObjectRef");
        s.field("class", &self.class()).field("key", &self.key());
        match &self.state {
            ObjectState::Managed(managed) => s.field("handle", managed.handle()),
            ObjectState::Unmanaged(object) => s.field("row", &object.row),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> ObjectRef {
        let mut row = Row::new();
        row.insert("name".into(), FieldValue::Value(json!("Ada")));
        row.insert("tags".into(), FieldValue::list(vec![json!("x")]));
        ObjectRef::unmanaged("Person", 1, row)
    }

    #[test]
    fn test_unmanaged_object_reads_and_writes() {
        let mut object = person();
        assert!(!object.is_managed());
        assert!(!object.is_frozen());
        assert_eq!(object.value("name").unwrap(), Some(json!("Ada")));

        object.set("name", json!("Grace")).unwrap();
        assert_eq!(object.value("name").unwrap(), Some(json!("Grace")));
        assert_eq!(object.list("tags").unwrap().to_vec().unwrap(), vec![json!("x")]);
        assert!(object.map("tags").is_err());
    }

    #[test]
    fn test_unmanaged_object_rejects_versioned_operations() {
        let object = person();
        assert!(matches!(object.version(), Err(Error::InvalidState(_))));
        assert!(matches!(
            object.register_for_notification(Box::new(|_: &RawChange| {})),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(object.clone().delete(), Err(Error::InvalidState(_))));
    }
}
