//! Second-level cache contract and an in-process implementation.
//!
//! The cache is shared across units of work, so it never hands out
//! references into its own storage: [`InMemoryCache`] keeps each entry as a
//! serialized JSON document and deserializes a fresh [`CachedState`] on every
//! read.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Dehydrated state of one entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    /// Column values, identifier first.
    pub columns: Vec<(String, Value)>,
    pub version: Option<Value>,
}

impl CachedState {
    /// Capture a row.
    pub fn from_row(row: &Row, version: Option<Value>) -> Self {
        Self {
            columns: row
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            version,
        }
    }

    /// Rebuild a row for hydration.
    pub fn to_row(&self) -> Row {
        Row::from_pairs(self.columns.iter().cloned())
    }
}

/// Read-through / write-through cache shared between units of work.
pub trait SecondLevelCache: Send + Sync {
    fn get(&self, entity: &str, id: &Value) -> Result<Option<CachedState>>;

    fn put(&self, entity: &str, id: &Value, state: &CachedState) -> Result<()>;

    fn invalidate(&self, entity: &str, id: &Value) -> Result<()>;
}

/// Hit/miss counters for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub invalidations: u64,
}

/// Thread-safe in-process cache storing serialized entries.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<(String, String), String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    invalidations: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(entity: &str, id: &Value) -> (String, String) {
        (entity.to_string(), id.key_string())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry exists, without counting a hit or miss.
    pub fn contains(&self, entity: &str, id: &Value) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&Self::key(entity, id))
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl SecondLevelCache for InMemoryCache {
    fn get(&self, entity: &str, id: &Value) -> Result<Option<CachedState>> {
        let document = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(entity, id))
            .cloned();
        match document {
            Some(json) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let state = serde_json::from_str(&json)
                    .map_err(|e| Error::Cache(format!("corrupt entry for {entity}#{id}: {e}")))?;
                Ok(Some(state))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn put(&self, entity: &str, id: &Value, state: &CachedState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(entity, id), json);
        self.puts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(entity = entity, id = %id, "Cached entity state");
        Ok(())
    }

    fn invalidate(&self, entity: &str, id: &Value) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(entity, id));
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(entity = entity, id = %id, "Invalidated cached entity state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> CachedState {
        CachedState {
            columns: vec![
                ("id".into(), Value::BigInt(1)),
                ("name".into(), Value::from(name)),
            ],
            version: Some(Value::BigInt(0)),
        }
    }

    #[test]
    fn test_get_returns_independent_copies() {
        let cache = InMemoryCache::new();
        cache.put("Person", &Value::BigInt(1), &state("Ann")).unwrap();

        let mut first = cache.get("Person", &Value::BigInt(1)).unwrap().unwrap();
        first.columns[1].1 = Value::from("Mallory");

        let second = cache.get("Person", &Value::BigInt(1)).unwrap().unwrap();
        assert_eq!(second, state("Ann"));
    }

    #[test]
    fn test_key_ignores_integer_width() {
        let cache = InMemoryCache::new();
        cache.put("Person", &Value::Int(1), &state("Ann")).unwrap();
        assert!(cache.get("Person", &Value::BigInt(1)).unwrap().is_some());
        assert!(cache.get("Robot", &Value::BigInt(1)).unwrap().is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                puts: 1,
                invalidations: 0
            }
        );
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = InMemoryCache::new();
        cache.put("Person", &Value::BigInt(1), &state("Ann")).unwrap();
        cache.invalidate("Person", &Value::BigInt(1)).unwrap();
        assert!(!cache.contains("Person", &Value::BigInt(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_row_round_trip() {
        let row = Row::from_pairs([("id", Value::BigInt(4)), ("name", Value::from("Bo"))]);
        let cached = CachedState::from_row(&row, None);
        assert_eq!(cached.to_row(), row);
    }
}
