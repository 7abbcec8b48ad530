//! Identity Map pattern for tracking unique object instances per identifier.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! object instance within a unit of work:
//!
//! - **Uniqueness**: the same (entity, id) always resolves to the same instance
//! - **Cache**: avoids redundant queries for the same row
//! - **Consistency**: changes to an instance are visible everywhere it's used
//!
//! Managed instances are always initialized. Placeholders handed out for rows
//! that have not been read yet live in a separate proxy table until they are
//! initialized, at which point the same handle is registered as managed.

use crate::entry::{EntityEntry, EntityStatus};
use crate::proxy::EntityRef;
use persist_core::value::normalize_decimal;
use persist_core::{Error, NavigableRole, Result, Value};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hash a single identifier value.
///
/// Integer widths hash identically so `Int(7)` and `BigInt(7)` share a key.
fn hash_single_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            2u8.hash(hasher);
            v.as_i64().hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            4u8.hash(hasher);
            normalize_decimal(s).hash(hasher);
        }
        Value::Text(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            6u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            7u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Timestamp(ts) => {
            8u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            9u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            10u8.hash(hasher);
            j.to_string().hash(hasher);
        }
    }
}

/// Identifier equality consistent with [`hash_single_value`].
fn ids_equal(a: &Value, b: &Value) -> bool {
    match (a.normalized(), b.normalized()) {
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        (Value::Decimal(x), Value::Decimal(y)) => normalize_decimal(&x) == normalize_decimal(&y),
        (x, y) => x == y,
    }
}

/// Key of one row: entity name plus identifier.
#[derive(Clone)]
pub struct EntityKey {
    entity: String,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && ids_equal(&self.id, &other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        hash_single_value(&self.id, state);
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({}#{})", self.entity, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

struct ManagedEntity {
    instance: EntityRef,
    entry: EntityEntry,
}

/// Identity Map for tracking unique instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, ManagedEntity>,
    proxies: HashMap<EntityKey, EntityRef>,
    /// Association through which each placeholder was first reached.
    proxy_roles: HashMap<EntityKey, NavigableRole>,
    next_seq: u64,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The managed instance for `key`.
    pub fn find(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.entries.get(key).map(|m| &m.instance)
    }

    /// The managed instance and its entry for `key`.
    pub fn get(&self, key: &EntityKey) -> Option<(&EntityRef, &EntityEntry)> {
        self.entries.get(key).map(|m| (&m.instance, &m.entry))
    }

    pub fn find_entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key).map(|m| &m.entry)
    }

    pub(crate) fn find_entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key).map(|m| &mut m.entry)
    }

    /// The uninitialized placeholder handed out for `key`, if any.
    pub fn find_proxy(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.proxies.get(key)
    }

    /// Register `instance` as the managed instance for its entry's key.
    ///
    /// Registering the instance already bound to the key returns the existing
    /// entry unchanged. A key bound to a different instance (managed or proxy)
    /// fails with `DuplicateIdentity`.
    pub fn register(&mut self, instance: &EntityRef, entry: EntityEntry) -> Result<&mut EntityEntry> {
        if !instance.is_initialized() {
            return Err(Error::InvalidState(format!(
                "cannot manage uninitialized instance {}",
                entry.key()
            )));
        }
        let key = entry.key().clone();
        let duplicate = || Error::DuplicateIdentity {
            entity: key.entity().to_string(),
            id: key.id().clone(),
        };

        if let Some(proxy) = self.proxies.get(&key) {
            if proxy != instance {
                return Err(duplicate());
            }
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().instance == *instance {
                    Ok(&mut occupied.into_mut().entry)
                } else {
                    Err(duplicate())
                }
            }
            Entry::Vacant(vacant) => {
                self.proxies.remove(&key);
                self.proxy_roles.remove(&key);
                let mut entry = entry;
                entry.set_seq(self.next_seq);
                self.next_seq += 1;
                tracing::trace!(key = %key, seq = entry.seq(), "Registered managed instance");
                Ok(&mut vacant
                    .insert(ManagedEntity {
                        instance: instance.clone(),
                        entry,
                    })
                    .entry)
            }
        }
    }

    /// Record a placeholder so later lookups of its key return it.
    pub(crate) fn register_proxy(&mut self, proxy: &EntityRef) {
        if let Some(key) = proxy.key() {
            if !self.entries.contains_key(&key) {
                self.proxies.entry(key).or_insert_with(|| proxy.clone());
            }
        }
    }

    /// The entry of `instance`, if it is the instance registered under its key.
    pub fn entry_for(&self, instance: &EntityRef) -> Option<&EntityEntry> {
        let key = instance.key()?;
        self.entries
            .get(&key)
            .filter(|m| m.instance == *instance)
            .map(|m| &m.entry)
    }

    pub(crate) fn entry_for_mut(&mut self, instance: &EntityRef) -> Option<&mut EntityEntry> {
        let key = instance.key()?;
        self.entries
            .get_mut(&key)
            .filter(|m| m.instance == *instance)
            .map(|m| &mut m.entry)
    }

    /// Remember the association `role` that first reached the placeholder
    /// for `key`.
    pub(crate) fn note_proxy_role(&mut self, key: &EntityKey, role: NavigableRole) {
        if self.proxies.contains_key(key) && !self.proxy_roles.contains_key(key) {
            self.proxy_roles.insert(key.clone(), role);
        }
    }

    /// The association through which the placeholder for `key` was reached.
    pub fn proxy_role(&self, key: &EntityKey) -> Option<&NavigableRole> {
        self.proxy_roles.get(key)
    }

    /// Whether `instance` is managed here.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.entry_for(instance).is_some()
    }

    /// Whether `instance` is a placeholder handed out by this map.
    pub fn owns_proxy(&self, instance: &EntityRef) -> bool {
        instance
            .key()
            .and_then(|key| self.proxies.get(&key))
            .is_some_and(|proxy| proxy == instance)
    }

    /// Stop tracking `instance`, returning its entry marked detached.
    pub fn remove(&mut self, instance: &EntityRef) -> Option<EntityEntry> {
        let key = instance.key()?;
        if self.owns_proxy(instance) {
            self.proxies.remove(&key);
            self.proxy_roles.remove(&key);
            return None;
        }
        if self.entries.get(&key).is_some_and(|m| m.instance == *instance) {
            let mut removed = self.entries.remove(&key)?.entry;
            removed.set_status(EntityStatus::Detached);
            tracing::trace!(key = %key, "Removed managed instance");
            return Some(removed);
        }
        None
    }

    /// Managed instances with their entries, in registration order.
    pub fn iter_ordered(&self) -> Vec<(&EntityRef, &EntityEntry)> {
        let mut items: Vec<_> = self
            .entries
            .values()
            .map(|m| (&m.instance, &m.entry))
            .collect();
        items.sort_by_key(|(_, entry)| entry.seq());
        items
    }

    /// Managed instances in registration order.
    pub fn instances(&self) -> Vec<EntityRef> {
        self.iter_ordered()
            .into_iter()
            .map(|(instance, _)| instance.clone())
            .collect()
    }

    /// Drop every instance and placeholder.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.proxies.clear();
        self.proxy_roles.clear();
    }

    /// Number of managed instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of placeholders not yet initialized.
    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("managed", &self.entries.len())
            .field("proxies", &self.proxies.len())
            .finish()
    }
}
