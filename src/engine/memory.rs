//! # In-Memory Reference Engine
//!
//! [`MemoryEngine`] implements the [`NativeEngine`] contract entirely in
//! process. It backs the test suite and the stress binary, and is a complete
//! engine for embedders that only need an in-memory database.
//!
//! ## Model
//!
//! ```text
//! history:   v1 ──► v2 ──► v3 ──► v4          (immutable Arc<DbState>)
//!                          ▲      ▲
//! snapshots: frozen#7 ─────┘      │
//!            live#1 (writer) ─────┤  staged copy while in a transaction
//!            live#2 (notifier) ───┘
//! ```
//!
//! - Every commit appends one immutable state; versions increase by one.
//! - A frozen snapshot pins a version. A live snapshot moves forward on
//!   `refresh` (and on `begin_transaction`).
//! - A transaction works on a private copy of the state and publishes it on
//!   commit. Only one live snapshot may hold the write lock; others block in
//!   `begin_transaction` until it is released.
//! - Versions no longer referenced by an open snapshot are pruned on close.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tokio::sync::watch;

use crate::engine::diff;
use crate::engine::{
    CallbackSlot, EngineError, EngineErrorKind, EngineResult, NativeEngine, NativePtr,
    NotificationBatch, RawCallback, RawChange, RegistrationPtr, SnapshotPtr, Target,
};
use crate::types::{insert_canonical, FieldValue, ObjectKey, Row, VersionId};

// =============================================================================
// Database State
// =============================================================================

/// One immutable committed state (or a transaction's private working copy).
#[derive(Debug, Clone, Default)]
struct DbState {
    objects: BTreeMap<(String, ObjectKey), Row>,
}

impl DbState {
    fn row(&self, class: &str, key: ObjectKey) -> Option<&Row> {
        self.objects.get(&(class.to_string(), key))
    }

    fn row_mut(&mut self, class: &str, key: ObjectKey) -> Option<&mut Row> {
        self.objects.get_mut(&(class.to_string(), key))
    }

    fn class_keys(&self, class: &str) -> Vec<ObjectKey> {
        let lo = (class.to_string(), ObjectKey::new(i64::MIN));
        let hi = (class.to_string(), ObjectKey::new(i64::MAX));
        self.objects.range(lo..=hi).map(|((_, key), _)| *key).collect()
    }

    /// Items of a list or set target. `Ok(None)` if the owner is gone.
    fn items(&self, target: &Target) -> EngineResult<Option<Vec<Value>>> {
        let (class, key, field, want_set) = match target {
            Target::List { class, key, field } => (class, key, field, false),
            Target::Set { class, key, field } => (class, key, field, true),
            other => return Err(EngineError::argument(format!("{other:?} is not a list or set"))),
        };
        let Some(row) = self.row(class, *key) else {
            return Ok(None);
        };
        match (row.get(field), want_set) {
            (None, _) => Ok(Some(Vec::new())),
            (Some(FieldValue::List(items)), false) | (Some(FieldValue::Set(items)), true) => {
                Ok(Some(items.clone()))
            }
            (Some(other), _) => Err(EngineError::argument(format!(
                "field '{field}' of {class}#{key} is a {}",
                other.kind()
            ))),
        }
    }

    /// Entries of a map target. `Ok(None)` if the owner is gone.
    fn entries(&self, target: &Target) -> EngineResult<Option<BTreeMap<String, Value>>> {
        let Target::Map { class, key, field } = target else {
            return Err(EngineError::argument(format!("{target:?} is not a map")));
        };
        let Some(row) = self.row(class, *key) else {
            return Ok(None);
        };
        match row.get(field) {
            None => Ok(Some(BTreeMap::new())),
            Some(FieldValue::Map(entries)) => Ok(Some(entries.clone())),
            Some(other) => Err(EngineError::argument(format!(
                "field '{field}' of {class}#{key} is a {}",
                other.kind()
            ))),
        }
    }

    fn exists(&self, target: &Target) -> EngineResult<bool> {
        match target {
            Target::Object { class, key } => Ok(self.row(class, *key).is_some()),
            Target::List { .. } | Target::Set { .. } => Ok(self.items(target)?.is_some()),
            Target::Map { .. } => Ok(self.entries(target)?.is_some()),
            Target::Results { .. } => Ok(true),
        }
    }

    fn list_mut(&mut self, target: &Target) -> EngineResult<&mut Vec<Value>> {
        let Target::List { class, key, field } = target else {
            return Err(EngineError::argument(format!("{target:?} is not a list")));
        };
        let row = self
            .row_mut(class, *key)
            .ok_or_else(|| EngineError::state(format!("{class}#{key} has been deleted")))?;
        match row.entry(field.clone()).or_insert_with(|| FieldValue::List(Vec::new())) {
            FieldValue::List(items) => Ok(items),
            other => Err(EngineError::argument(format!("field '{field}' is a {}", other.kind()))),
        }
    }

    fn set_mut(&mut self, target: &Target) -> EngineResult<&mut Vec<Value>> {
        let Target::Set { class, key, field } = target else {
            return Err(EngineError::argument(format!("{target:?} is not a set")));
        };
        let row = self
            .row_mut(class, *key)
            .ok_or_else(|| EngineError::state(format!("{class}#{key} has been deleted")))?;
        match row.entry(field.clone()).or_insert_with(|| FieldValue::Set(Vec::new())) {
            FieldValue::Set(items) => Ok(items),
            other => Err(EngineError::argument(format!("field '{field}' is a {}", other.kind()))),
        }
    }

    fn map_mut(&mut self, target: &Target) -> EngineResult<&mut BTreeMap<String, Value>> {
        let Target::Map { class, key, field } = target else {
            return Err(EngineError::argument(format!("{target:?} is not a map")));
        };
        let row = self
            .row_mut(class, *key)
            .ok_or_else(|| EngineError::state(format!("{class}#{key} has been deleted")))?;
        match row.entry(field.clone()).or_insert_with(|| FieldValue::Map(BTreeMap::new())) {
            FieldValue::Map(entries) => Ok(entries),
            other => Err(EngineError::argument(format!("field '{field}' is a {}", other.kind()))),
        }
    }
}

/// Computes the payload for `target` between two states, or `None` if the
/// target is unchanged.
fn diff_target(target: &Target, old: &DbState, new: &DbState) -> Option<RawChange> {
    match target {
        Target::Object { class, key } => match (old.row(class, *key), new.row(class, *key)) {
            (Some(_), None) => Some(RawChange::root_deleted()),
            (None, None) => None,
            (None, Some(row)) => Some(RawChange::object(row.keys().cloned().collect())),
            (Some(before), Some(after)) => {
                let fields = diff::changed_fields(before, after);
                (!fields.is_empty()).then(|| RawChange::object(fields))
            }
        },
        Target::List { .. } | Target::Set { .. } => {
            let before = old.items(target).unwrap_or(None);
            let after = new.items(target).unwrap_or(None);
            match (before, after) {
                (Some(_), None) => Some(RawChange::root_deleted()),
                (None, None) => None,
                (before, Some(after)) => {
                    let change = diff::diff_values(&before.unwrap_or_default(), &after);
                    (!change.is_empty()).then_some(change)
                }
            }
        }
        Target::Map { .. } => {
            let before = old.entries(target).unwrap_or(None);
            let after = new.entries(target).unwrap_or(None);
            match (before, after) {
                (Some(_), None) => Some(RawChange::root_deleted()),
                (None, None) => None,
                (before, Some(after)) => {
                    let change = diff::diff_map(&before.unwrap_or_default(), &after);
                    (!change.is_empty()).then_some(change)
                }
            }
        }
        Target::Results { class } => {
            let change = diff::diff_keys(&old.class_keys(class), &new.class_keys(class), |key| {
                old.row(class, key) != new.row(class, key)
            });
            (!change.is_empty()).then_some(change)
        }
    }
}

// =============================================================================
// Snapshots and Registrations
// =============================================================================

#[derive(Debug)]
struct SnapshotEntry {
    version: VersionId,
    live: bool,
    closed: bool,
    /// Private working copy while a write transaction is open.
    staged: Option<DbState>,
}

struct Registration {
    snapshot: SnapshotPtr,
    target: Target,
    callback: CallbackSlot,
    delivered_initial: bool,
    /// State the last delivered payload was computed against.
    observed: Arc<DbState>,
}

struct Inner {
    history: BTreeMap<VersionId, Arc<DbState>>,
    latest: VersionId,
    snapshots: HashMap<SnapshotPtr, SnapshotEntry>,
    next_snapshot: u64,
    registrations: BTreeMap<RegistrationPtr, Registration>,
    next_registration: u64,
    /// Live snapshot currently holding the write lock.
    write_owner: Option<SnapshotPtr>,
    injected_commit_failure: Option<EngineErrorKind>,
}

impl Inner {
    fn entry(&self, snapshot: SnapshotPtr) -> EngineResult<&SnapshotEntry> {
        match self.snapshots.get(&snapshot) {
            Some(entry) if !entry.closed => Ok(entry),
            Some(_) => Err(EngineError::closed(format!("{snapshot} has been closed"))),
            None => Err(EngineError::argument(format!("unknown {snapshot}"))),
        }
    }

    fn live_entry_mut(&mut self, snapshot: SnapshotPtr) -> EngineResult<&mut SnapshotEntry> {
        match self.snapshots.get_mut(&snapshot) {
            Some(entry) if entry.closed => {
                Err(EngineError::closed(format!("{snapshot} has been closed")))
            }
            Some(entry) if !entry.live => {
                Err(EngineError::state(format!("{snapshot} is frozen")))
            }
            Some(entry) => Ok(entry),
            None => Err(EngineError::argument(format!("unknown {snapshot}"))),
        }
    }

    fn committed(&self, version: VersionId) -> EngineResult<&Arc<DbState>> {
        self.history.get(&version).ok_or_else(|| {
            EngineError::new(EngineErrorKind::Fatal, format!("version {version} missing from history"))
        })
    }

    fn read_state(&self, snapshot: SnapshotPtr) -> EngineResult<&DbState> {
        let entry = self.entry(snapshot)?;
        match &entry.staged {
            Some(staged) => Ok(staged),
            None => Ok(self.committed(entry.version)?.as_ref()),
        }
    }

    fn write_state(&mut self, snapshot: SnapshotPtr) -> EngineResult<&mut DbState> {
        let entry = self.live_entry_mut(snapshot)?;
        entry
            .staged
            .as_mut()
            .ok_or_else(|| EngineError::state("cannot modify outside a write transaction"))
    }

    fn allocate_snapshot(&mut self, version: VersionId, live: bool) -> SnapshotPtr {
        self.next_snapshot += 1;
        let ptr = SnapshotPtr::from_raw(self.next_snapshot);
        self.snapshots.insert(
            ptr,
            SnapshotEntry {
                version,
                live,
                closed: false,
                staged: None,
            },
        );
        ptr
    }

    /// Drops committed versions no open snapshot can reach.
    fn prune_history(&mut self) {
        let latest = self.latest;
        let pinned: Vec<VersionId> = self
            .snapshots
            .values()
            .filter(|e| !e.closed)
            .map(|e| e.version)
            .collect();
        self.history
            .retain(|version, _| *version == latest || pinned.contains(version));
    }
}

// =============================================================================
// MemoryEngine
// =============================================================================

/// An in-process multi-version engine.
pub struct MemoryEngine {
    inner: Mutex<Inner>,
    write_released: Condvar,
    commits: watch::Sender<VersionId>,
}

impl MemoryEngine {
    /// Creates an empty database at [`VersionId::INITIAL`].
    pub fn new() -> Self {
        let mut history = BTreeMap::new();
        history.insert(VersionId::INITIAL, Arc::new(DbState::default()));
        let (commits, _) = watch::channel(VersionId::INITIAL);
        Self {
            inner: Mutex::new(Inner {
                history,
                latest: VersionId::INITIAL,
                snapshots: HashMap::new(),
                next_snapshot: 0,
                registrations: BTreeMap::new(),
                next_registration: 0,
                write_owner: None,
                injected_commit_failure: None,
            }),
            write_released: Condvar::new(),
            commits,
        }
    }

    /// Creates an engine ready to be shared between sessions.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Latest committed version.
    pub fn latest_version(&self) -> VersionId {
        self.inner.lock().latest
    }

    /// Number of snapshots that are open (not yet closed).
    pub fn open_snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.values().filter(|e| !e.closed).count()
    }

    /// Number of active change registrations.
    pub fn registration_count(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    /// Number of committed versions still held in memory.
    pub fn retained_versions(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Makes the next commit fail with `kind` (fault injection for tests and
    /// the stress binary).
    pub fn inject_commit_failure(&self, kind: EngineErrorKind) {
        self.inner.lock().injected_commit_failure = Some(kind);
    }

    fn release_write_lock(&self, inner: &mut Inner, snapshot: SnapshotPtr) {
        if inner.write_owner == Some(snapshot) {
            inner.write_owner = None;
            self.write_released.notify_one();
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryEngine")
            .field("latest", &inner.latest)
            .field("snapshots", &inner.snapshots.len())
            .field("registrations", &inner.registrations.len())
            .finish()
    }
}

impl NativeEngine for MemoryEngine {
    fn open(&self) -> EngineResult<SnapshotPtr> {
        let mut inner = self.inner.lock();
        let latest = inner.latest;
        Ok(inner.allocate_snapshot(latest, true))
    }

    fn freeze(&self, live: SnapshotPtr) -> EngineResult<SnapshotPtr> {
        let mut inner = self.inner.lock();
        let entry = inner.live_entry_mut(live)?;
        if entry.staged.is_some() {
            return Err(EngineError::state("cannot freeze inside a write transaction"));
        }
        let version = entry.version;
        Ok(inner.allocate_snapshot(version, false))
    }

    fn close(&self, snapshot: SnapshotPtr) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let entry = match inner.snapshots.get_mut(&snapshot) {
            Some(entry) if entry.closed => {
                return Err(EngineError::closed(format!("{snapshot} already closed")));
            }
            Some(entry) => entry,
            None => return Err(EngineError::argument(format!("unknown {snapshot}"))),
        };
        entry.closed = true;
        entry.staged = None;
        self.release_write_lock(&mut inner, snapshot);
        inner.registrations.retain(|_, reg| reg.snapshot != snapshot);
        inner.prune_history();
        Ok(())
    }

    fn is_closed(&self, snapshot: SnapshotPtr) -> bool {
        self.inner
            .lock()
            .snapshots
            .get(&snapshot)
            .map_or(true, |entry| entry.closed)
    }

    fn version(&self, snapshot: SnapshotPtr) -> EngineResult<VersionId> {
        Ok(self.inner.lock().entry(snapshot)?.version)
    }

    fn is_frozen(&self, snapshot: SnapshotPtr) -> EngineResult<bool> {
        Ok(!self.inner.lock().entry(snapshot)?.live)
    }

    fn refresh(&self, live: SnapshotPtr) -> EngineResult<NotificationBatch> {
        let mut inner = self.inner.lock();
        let latest = inner.latest;
        let entry = inner.live_entry_mut(live)?;
        if entry.staged.is_some() {
            return Err(EngineError::state("cannot refresh inside a write transaction"));
        }
        entry.version = latest;
        let current = Arc::clone(inner.committed(latest)?);

        let mut batch = NotificationBatch::default();
        for (ptr, reg) in inner.registrations.iter_mut() {
            if reg.snapshot != live {
                continue;
            }
            if !reg.delivered_initial {
                reg.delivered_initial = true;
                reg.observed = Arc::clone(&current);
                batch.push(*ptr, Arc::clone(&reg.callback), RawChange::empty());
                continue;
            }
            if Arc::ptr_eq(&reg.observed, &current) {
                continue;
            }
            if let Some(change) = diff_target(&reg.target, &reg.observed, &current) {
                batch.push(*ptr, Arc::clone(&reg.callback), change);
            }
            reg.observed = Arc::clone(&current);
        }
        inner.prune_history();
        Ok(batch)
    }

    fn commit_signal(&self) -> watch::Receiver<VersionId> {
        self.commits.subscribe()
    }

    fn begin_transaction(&self, live: SnapshotPtr) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if inner.live_entry_mut(live)?.staged.is_some() {
            return Err(EngineError::state("transaction in progress"));
        }
        // single writer: wait for any other live snapshot to finish its write
        while matches!(inner.write_owner, Some(owner) if owner != live) {
            self.write_released.wait(&mut inner);
        }
        let latest = inner.latest;
        let base = (**inner.committed(latest)?).clone();
        let entry = inner.live_entry_mut(live)?;
        entry.version = latest;
        entry.staged = Some(base);
        inner.write_owner = Some(live);
        Ok(())
    }

    fn commit(&self, live: SnapshotPtr) -> EngineResult<VersionId> {
        let mut inner = self.inner.lock();
        if let Some(kind) = inner.injected_commit_failure.take() {
            return Err(EngineError::new(kind, "injected commit failure"));
        }
        let entry = inner.live_entry_mut(live)?;
        let staged = entry
            .staged
            .take()
            .ok_or_else(|| EngineError::state("no transaction in progress"))?;
        let version = inner.latest.next();
        inner.history.insert(version, Arc::new(staged));
        inner.latest = version;
        inner.live_entry_mut(live)?.version = version;
        self.release_write_lock(&mut inner, live);
        drop(inner);

        self.commits.send_replace(version);
        Ok(version)
    }

    fn rollback(&self, live: SnapshotPtr) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.live_entry_mut(live)?;
        if entry.staged.take().is_none() {
            return Err(EngineError::state("no transaction in progress"));
        }
        self.release_write_lock(&mut inner, live);
        Ok(())
    }

    fn is_in_transaction(&self, live: SnapshotPtr) -> bool {
        self.inner
            .lock()
            .snapshots
            .get(&live)
            .is_some_and(|entry| !entry.closed && entry.staged.is_some())
    }

    fn register_change_callback(
        &self,
        ptr: &NativePtr,
        callback: RawCallback,
    ) -> EngineResult<RegistrationPtr> {
        let mut inner = self.inner.lock();
        let entry = inner.entry(ptr.snapshot())?;
        if !entry.live {
            return Err(EngineError::state(
                "change callbacks can only be registered on a live snapshot",
            ));
        }
        let version = entry.version;
        let observed = Arc::clone(inner.committed(version)?);
        if !observed.exists(ptr.target())? {
            return Err(EngineError::state(format!("{:?} does not exist", ptr.target())));
        }

        inner.next_registration += 1;
        let registration = RegistrationPtr::from_raw(inner.next_registration);
        inner.registrations.insert(
            registration,
            Registration {
                snapshot: ptr.snapshot(),
                target: ptr.target().clone(),
                callback: Arc::new(Mutex::new(callback)),
                delivered_initial: false,
                observed,
            },
        );
        Ok(registration)
    }

    fn release_registration(&self, registration: RegistrationPtr) -> EngineResult<()> {
        match self.inner.lock().registrations.remove(&registration) {
            Some(_) => Ok(()),
            None => Err(EngineError::closed(format!(
                "registration {} already released",
                registration.as_raw()
            ))),
        }
    }

    fn resolve_at(&self, ptr: &NativePtr, snapshot: SnapshotPtr) -> EngineResult<Option<NativePtr>> {
        let inner = self.inner.lock();
        inner.entry(ptr.snapshot())?;
        let state = inner.read_state(snapshot)?;
        if state.exists(ptr.target())? {
            Ok(Some(NativePtr::new(snapshot, ptr.target().clone())))
        } else {
            Ok(None)
        }
    }

    fn object_row(&self, ptr: &NativePtr) -> EngineResult<Row> {
        let inner = self.inner.lock();
        let Target::Object { class, key } = ptr.target() else {
            return Err(EngineError::argument(format!("{:?} is not an object", ptr.target())));
        };
        inner
            .read_state(ptr.snapshot())?
            .row(class, *key)
            .cloned()
            .ok_or_else(|| EngineError::state(format!("{class}#{key} has been deleted")))
    }

    fn collection_items(&self, ptr: &NativePtr) -> EngineResult<Vec<Value>> {
        let inner = self.inner.lock();
        inner
            .read_state(ptr.snapshot())?
            .items(ptr.target())?
            .ok_or_else(|| EngineError::state("owning object has been deleted"))
    }

    fn map_entries(&self, ptr: &NativePtr) -> EngineResult<BTreeMap<String, Value>> {
        let inner = self.inner.lock();
        inner
            .read_state(ptr.snapshot())?
            .entries(ptr.target())?
            .ok_or_else(|| EngineError::state("owning object has been deleted"))
    }

    fn results_keys(&self, ptr: &NativePtr) -> EngineResult<Vec<ObjectKey>> {
        let inner = self.inner.lock();
        let Target::Results { class } = ptr.target() else {
            return Err(EngineError::argument(format!("{:?} is not a result set", ptr.target())));
        };
        Ok(inner.read_state(ptr.snapshot())?.class_keys(class))
    }

    fn create_object(
        &self,
        live: SnapshotPtr,
        class: &str,
        key: ObjectKey,
        row: Row,
    ) -> EngineResult<NativePtr> {
        let mut inner = self.inner.lock();
        let state = inner.write_state(live)?;
        let slot = (class.to_string(), key);
        if state.objects.contains_key(&slot) {
            return Err(EngineError::argument(format!(
                "object {class}#{key} already exists"
            )));
        }
        state.objects.insert(slot, row);
        Ok(NativePtr::new(
            live,
            Target::Object {
                class: class.to_string(),
                key,
            },
        ))
    }

    fn set_field(&self, ptr: &NativePtr, field: &str, value: FieldValue) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let Target::Object { class, key } = ptr.target() else {
            return Err(EngineError::argument(format!("{:?} is not an object", ptr.target())));
        };
        let row = inner
            .write_state(ptr.snapshot())?
            .row_mut(class, *key)
            .ok_or_else(|| EngineError::state(format!("{class}#{key} has been deleted")))?;
        row.insert(field.to_string(), value);
        Ok(())
    }

    fn delete_object(&self, ptr: &NativePtr) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let Target::Object { class, key } = ptr.target() else {
            return Err(EngineError::argument(format!("{:?} is not an object", ptr.target())));
        };
        let state = inner.write_state(ptr.snapshot())?;
        match state.objects.remove(&(class.clone(), *key)) {
            Some(_) => Ok(()),
            None => Err(EngineError::state(format!("{class}#{key} has been deleted"))),
        }
    }

    fn list_insert(&self, ptr: &NativePtr, index: usize, value: Value) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let items = inner.write_state(ptr.snapshot())?.list_mut(ptr.target())?;
        if index > items.len() {
            return Err(EngineError::argument(format!(
                "index {index} out of bounds for list of length {}",
                items.len()
            )));
        }
        items.insert(index, value);
        Ok(())
    }

    fn list_remove(&self, ptr: &NativePtr, index: usize) -> EngineResult<Value> {
        let mut inner = self.inner.lock();
        let items = inner.write_state(ptr.snapshot())?.list_mut(ptr.target())?;
        if index >= items.len() {
            return Err(EngineError::argument(format!(
                "index {index} out of bounds for list of length {}",
                items.len()
            )));
        }
        Ok(items.remove(index))
    }

    fn set_insert(&self, ptr: &NativePtr, value: Value) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        let items = inner.write_state(ptr.snapshot())?.set_mut(ptr.target())?;
        Ok(insert_canonical(items, value))
    }

    fn set_remove(&self, ptr: &NativePtr, value: &Value) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        let items = inner.write_state(ptr.snapshot())?.set_mut(ptr.target())?;
        match items.iter().position(|item| item == value) {
            Some(pos) => {
                items.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn map_insert(&self, ptr: &NativePtr, key: String, value: Value) -> EngineResult<Option<Value>> {
        let mut inner = self.inner.lock();
        let entries = inner.write_state(ptr.snapshot())?.map_mut(ptr.target())?;
        Ok(entries.insert(key, value))
    }

    fn map_remove(&self, ptr: &NativePtr, key: &str) -> EngineResult<Option<Value>> {
        let mut inner = self.inner.lock();
        let entries = inner.write_state(ptr.snapshot())?.map_mut(ptr.target())?;
        Ok(entries.remove(key))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), FieldValue::Value(json!(name)));
        row
    }

    fn results(snapshot: SnapshotPtr, class: &str) -> NativePtr {
        NativePtr::new(snapshot, Target::Results { class: class.into() })
    }

    fn commit_person(engine: &MemoryEngine, live: SnapshotPtr, key: i64) -> VersionId {
        engine.begin_transaction(live).unwrap();
        engine
            .create_object(live, "Person", ObjectKey::new(key), person("p"))
            .unwrap();
        engine.commit(live).unwrap()
    }

    #[test]
    fn test_commit_advances_version() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        assert_eq!(engine.version(live).unwrap(), VersionId::INITIAL);

        let v2 = commit_person(&engine, live, 1);
        assert_eq!(v2, VersionId::INITIAL.next());
        assert_eq!(engine.version(live).unwrap(), v2);
        assert_eq!(engine.latest_version(), v2);
        assert_eq!(*engine.commit_signal().borrow(), v2);
    }

    #[test]
    fn test_frozen_snapshot_is_pinned() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        commit_person(&engine, live, 1);
        let frozen = engine.freeze(live).unwrap();
        commit_person(&engine, live, 2);

        assert!(engine.is_frozen(frozen).unwrap());
        assert_eq!(engine.results_keys(&results(frozen, "Person")).unwrap().len(), 1);
        assert_eq!(engine.results_keys(&results(live, "Person")).unwrap().len(), 2);
    }

    #[test]
    fn test_transaction_state_errors() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();

        let err = engine.commit(live).unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::State);

        engine.begin_transaction(live).unwrap();
        let err = engine.begin_transaction(live).unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::State);
        assert!(engine.is_in_transaction(live));

        engine.rollback(live).unwrap();
        assert!(!engine.is_in_transaction(live));
        assert_eq!(engine.rollback(live).unwrap_err().kind, EngineErrorKind::State);
    }

    #[test]
    fn test_writes_require_transaction_and_live_snapshot() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        let err = engine
            .create_object(live, "Person", ObjectKey::new(1), person("a"))
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::State);

        let frozen = engine.freeze(live).unwrap();
        assert_eq!(engine.begin_transaction(frozen).unwrap_err().kind, EngineErrorKind::State);
    }

    #[test]
    fn test_duplicate_key_is_argument_error() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        commit_person(&engine, live, 1);
        engine.begin_transaction(live).unwrap();
        let err = engine
            .create_object(live, "Person", ObjectKey::new(1), person("b"))
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::IllegalArgument);
        engine.rollback(live).unwrap();
    }

    #[test]
    fn test_resolve_at_returns_none_when_deleted() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        commit_person(&engine, live, 1);
        let before = engine.freeze(live).unwrap();

        let obj = NativePtr::new(
            before,
            Target::Object {
                class: "Person".into(),
                key: ObjectKey::new(1),
            },
        );
        engine.begin_transaction(live).unwrap();
        let in_txn = engine.resolve_at(&obj, live).unwrap().unwrap();
        engine.delete_object(&in_txn).unwrap();
        engine.commit(live).unwrap();

        let after = engine.freeze(live).unwrap();
        assert!(engine.resolve_at(&obj, after).unwrap().is_none());
        assert!(engine.resolve_at(&obj, before).unwrap().is_some());
    }

    #[test]
    fn test_close_twice_and_use_after_close() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        let frozen = engine.freeze(live).unwrap();
        engine.close(frozen).unwrap();

        assert!(engine.is_closed(frozen));
        assert_eq!(engine.close(frozen).unwrap_err().kind, EngineErrorKind::Closed);
        assert_eq!(
            engine.results_keys(&results(frozen, "Person")).unwrap_err().kind,
            EngineErrorKind::Closed
        );
        assert_eq!(engine.open_snapshot_count(), 1);
    }

    #[test]
    fn test_history_is_pruned() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        let pinned = engine.freeze(live).unwrap();
        for key in 0..5 {
            commit_person(&engine, live, key);
        }
        engine.refresh(live).unwrap();
        // initial (pinned) + latest
        assert_eq!(engine.retained_versions(), 2);
        engine.close(pinned).unwrap();
        assert_eq!(engine.retained_versions(), 1);
    }

    #[test]
    fn test_refresh_delivers_initial_then_changes() {
        let engine = MemoryEngine::new();
        let writer = engine.open().unwrap();
        let observer = engine.open().unwrap();

        let seen: Arc<Mutex<Vec<RawChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .register_change_callback(
                &results(observer, "Person"),
                Box::new(move |change| sink.lock().push(change.clone())),
            )
            .unwrap();

        engine.refresh(observer).unwrap().deliver();
        commit_person(&engine, writer, 7);
        // nothing is delivered until the observer refreshes
        assert_eq!(seen.lock().len(), 1);

        let batch = engine.refresh(observer).unwrap();
        assert_eq!(batch.len(), 1);
        batch.deliver();

        let seen = seen.lock();
        assert!(seen[0].is_empty());
        assert_eq!(seen[1].insertions(), &[0]);
    }

    #[test]
    fn test_register_on_frozen_snapshot_fails() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        let frozen = engine.freeze(live).unwrap();
        let err = engine
            .register_change_callback(&results(frozen, "Person"), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::State);
    }

    #[test]
    fn test_release_registration_twice() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        let reg = engine
            .register_change_callback(&results(live, "Person"), Box::new(|_| {}))
            .unwrap();
        engine.release_registration(reg).unwrap();
        assert_eq!(
            engine.release_registration(reg).unwrap_err().kind,
            EngineErrorKind::Closed
        );
    }

    #[test]
    fn test_object_deletion_fires_root_deleted() {
        let engine = MemoryEngine::new();
        let writer = engine.open().unwrap();
        commit_person(&engine, writer, 1);

        let observer = engine.open().unwrap();
        let list = NativePtr::new(
            observer,
            Target::List {
                class: "Person".into(),
                key: ObjectKey::new(1),
                field: "tags".into(),
            },
        );
        let seen: Arc<Mutex<Vec<RawChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .register_change_callback(&list, Box::new(move |c| sink.lock().push(c.clone())))
            .unwrap();
        engine.refresh(observer).unwrap().deliver();

        engine.begin_transaction(writer).unwrap();
        let obj = NativePtr::new(
            writer,
            Target::Object {
                class: "Person".into(),
                key: ObjectKey::new(1),
            },
        );
        engine.delete_object(&obj).unwrap();
        engine.commit(writer).unwrap();
        engine.refresh(observer).unwrap().deliver();

        assert!(seen.lock()[1].is_root_deleted());
    }

    #[test]
    fn test_injected_commit_failure() {
        let engine = MemoryEngine::new();
        let live = engine.open().unwrap();
        engine.inject_commit_failure(EngineErrorKind::ResourceExhausted);
        engine.begin_transaction(live).unwrap();
        let err = engine.commit(live).unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::ResourceExhausted);
        // the transaction is still open and can be rolled back
        engine.rollback(live).unwrap();
    }
}
