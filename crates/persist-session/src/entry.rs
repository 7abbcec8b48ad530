//! Per-instance bookkeeping held by the identity map.

use crate::identity_map::EntityKey;
use persist_core::{LockMode, Value};
use std::collections::BTreeMap;

/// Lifecycle status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Tracked and dirty-checked.
    Managed,
    /// Tracked but never written.
    ReadOnly,
    /// Scheduled for deletion at the next flush.
    Deleted,
    /// The row no longer exists in the database.
    Gone,
    /// No longer tracked by the unit of work.
    Detached,
}

impl EntityStatus {
    /// Whether the instance counts as absent for loads that check deletions.
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

/// Ordered attribute snapshot as last written to or read from the database.
///
/// To-one attributes are recorded as the foreign-key value, so snapshots never
/// hold instance handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    values: Vec<(String, Value)>,
}

impl LoadedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(values: Vec<(String, Value)>) -> Self {
        Self { values }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, value)| value)
    }

    /// Set an attribute, keeping its position if already present.
    pub fn set(&mut self, attribute: &str, value: Value) {
        match self.values.iter_mut().find(|(name, _)| name == attribute) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((attribute.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Bookkeeping for one managed instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    key: EntityKey,
    status: EntityStatus,
    loaded_state: Option<LoadedState>,
    version: Option<Value>,
    lock_mode: LockMode,
    exists_in_database: bool,
    collection_snapshots: BTreeMap<String, Vec<Value>>,
    seq: u64,
}

impl EntityEntry {
    /// Entry for an instance hydrated from a row.
    pub fn loaded(
        key: EntityKey,
        loaded_state: LoadedState,
        version: Option<Value>,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            key,
            status: EntityStatus::Managed,
            loaded_state: Some(loaded_state),
            version,
            lock_mode,
            exists_in_database: true,
            collection_snapshots: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Entry for a newly persisted instance awaiting its insert.
    pub fn pending_insert(key: EntityKey, version: Option<Value>) -> Self {
        Self {
            key,
            status: EntityStatus::Managed,
            loaded_state: None,
            version,
            lock_mode: LockMode::None,
            exists_in_database: false,
            collection_snapshots: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity_name(&self) -> &str {
        self.key.entity()
    }

    pub fn id(&self) -> &Value {
        self.key.id()
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Snapshot of the persistent state; `None` until the row exists.
    pub fn loaded_state(&self) -> Option<&LoadedState> {
        self.loaded_state.as_ref()
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Element identifiers of a join-table collection as last synchronized.
    pub fn collection_snapshot(&self, attribute: &str) -> Option<&[Value]> {
        self.collection_snapshots.get(attribute).map(Vec::as_slice)
    }

    /// Registration order within the unit of work.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_read_only(&self) -> bool {
        self.status == EntityStatus::ReadOnly
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    pub(crate) fn set_lock_mode(&mut self, lock_mode: LockMode) {
        self.lock_mode = lock_mode;
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Record the state now held by the database row.
    pub(crate) fn synchronize(&mut self, loaded_state: LoadedState, version: Option<Value>) {
        self.loaded_state = Some(loaded_state);
        self.version = version;
        self.exists_in_database = true;
    }

    pub(crate) fn set_collection_snapshot(&mut self, attribute: &str, element_ids: Vec<Value>) {
        self.collection_snapshots
            .insert(attribute.to_string(), element_ids);
    }

    pub(crate) fn clear_collection_snapshots(&mut self) {
        self.collection_snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_state_keeps_order() {
        let mut state = LoadedState::new();
        state.set("name", Value::from("Ann"));
        state.set("age", Value::Int(30));
        state.set("name", Value::from("Bea"));
        let names: Vec<_> = state.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["name", "age"]);
        assert_eq!(state.get("name"), Some(&Value::from("Bea")));
    }

    #[test]
    fn test_pending_insert_has_no_snapshot() {
        let entry = EntityEntry::pending_insert(EntityKey::new("Person", Value::BigInt(1)), None);
        assert!(!entry.exists_in_database());
        assert!(entry.loaded_state().is_none());
        assert_eq!(entry.status(), EntityStatus::Managed);
    }

    #[test]
    fn test_synchronize_marks_existing() {
        let mut entry =
            EntityEntry::pending_insert(EntityKey::new("Person", Value::BigInt(1)), None);
        entry.synchronize(LoadedState::new(), Some(Value::BigInt(0)));
        assert!(entry.exists_in_database());
        assert_eq!(entry.version(), Some(&Value::BigInt(0)));
    }

    #[test]
    fn test_deleted_or_gone() {
        assert!(EntityStatus::Deleted.is_deleted_or_gone());
        assert!(EntityStatus::Gone.is_deleted_or_gone());
        assert!(!EntityStatus::ReadOnly.is_deleted_or_gone());
    }
}
