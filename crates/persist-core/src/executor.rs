//! The SQL execution collaborator contract.
//!
//! The engine never renders or runs SQL itself. It describes loads as
//! [`LoadQuery`] values and writes as [`WriteStatement`] values and hands
//! them to a [`SqlExecutor`]. Errors the executor reports (connectivity,
//! constraint violations, timeouts) are surfaced to the caller unchanged.

use crate::error::Result;
use crate::metadata::{EntityDescriptor, JoinTable};
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column through which join-table loads report the owning key of each row.
pub const OWNER_KEY_COLUMN: &str = "__owner_key";

/// Lock modes an entity can be read or held under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock; reads may be served from the cache.
    #[default]
    None,
    /// Read was verified against the database.
    Read,
    /// Version is checked at flush.
    Optimistic,
    /// Version is checked and incremented at flush even without changes.
    OptimisticForceIncrement,
    /// Shared row lock.
    PessimisticRead,
    /// Exclusive row lock.
    PessimisticWrite,
}

impl LockMode {
    const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Optimistic => 2,
            LockMode::OptimisticForceIncrement => 3,
            LockMode::PessimisticRead => 4,
            LockMode::PessimisticWrite => 5,
        }
    }

    /// Whether this mode is stronger than `other`.
    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    /// Whether the row must be locked in the database.
    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }

    /// Whether a flush must bump the version even when nothing changed.
    pub const fn forces_version_increment(self) -> bool {
        matches!(self, LockMode::OptimisticForceIncrement)
    }

    /// Whether the request must bypass the second-level cache.
    pub const fn bypasses_cache(self) -> bool {
        !matches!(self, LockMode::None)
    }
}

/// Which rows a load selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRestriction {
    /// Rows whose column value is one of the keys.
    Column(String),
    /// Rows linked to one of the keys through a join table.
    ///
    /// Each returned row carries the linking owner key in [`OWNER_KEY_COLUMN`].
    JoinTable(JoinTable),
}

/// A request for rows of one entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadQuery {
    pub entity: String,
    pub table: String,
    /// Identifier column of the loaded entity.
    pub id_column: String,
    /// Columns to select, identifier first.
    pub columns: Vec<String>,
    pub restriction: LoadRestriction,
    pub keys: Vec<Value>,
    pub lock_mode: LockMode,
    /// Associations the fetch plan loads eagerly, as paths relative to the
    /// loaded entity. An executor may turn these into joins.
    pub eager_paths: Vec<String>,
}

impl LoadQuery {
    /// Load rows by identifier.
    pub fn by_ids(descriptor: &EntityDescriptor, ids: Vec<Value>) -> Self {
        Self::by_column(descriptor, descriptor.id_column().to_string(), ids)
    }

    /// Load rows whose `column` matches one of `keys`.
    pub fn by_column(descriptor: &EntityDescriptor, column: String, keys: Vec<Value>) -> Self {
        Self {
            entity: descriptor.name().to_string(),
            table: descriptor.table().to_string(),
            id_column: descriptor.id_column().to_string(),
            columns: descriptor.columns(),
            restriction: LoadRestriction::Column(column),
            keys,
            lock_mode: LockMode::None,
            eager_paths: Vec::new(),
        }
    }

    /// Load rows linked to `owner_keys` through `join`.
    pub fn through_join_table(
        descriptor: &EntityDescriptor,
        join: JoinTable,
        owner_keys: Vec<Value>,
    ) -> Self {
        Self {
            restriction: LoadRestriction::JoinTable(join),
            ..Self::by_ids(descriptor, owner_keys)
        }
    }

    pub fn with_lock(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_eager_paths(mut self, paths: Vec<String>) -> Self {
        self.eager_paths = paths;
        self
    }
}

/// Kind of row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
        })
    }
}

/// One row-level write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStatement {
    pub kind: WriteKind,
    /// Entity written, or `None` for link-table rows.
    pub entity: Option<String>,
    pub table: String,
    /// Inserted columns, or the SET list of an update.
    pub assignments: Vec<(String, Value)>,
    /// Equality restriction of an update or delete.
    pub key: Vec<(String, Value)>,
    /// Expected version for optimistic checks.
    pub version_check: Option<(String, Value)>,
}

impl WriteStatement {
    pub fn insert(
        entity: Option<&str>,
        table: impl Into<String>,
        assignments: Vec<(String, Value)>,
    ) -> Self {
        Self {
            kind: WriteKind::Insert,
            entity: entity.map(str::to_string),
            table: table.into(),
            assignments,
            key: Vec::new(),
            version_check: None,
        }
    }

    pub fn update(
        entity: Option<&str>,
        table: impl Into<String>,
        assignments: Vec<(String, Value)>,
        key: Vec<(String, Value)>,
    ) -> Self {
        Self {
            kind: WriteKind::Update,
            entity: entity.map(str::to_string),
            table: table.into(),
            assignments,
            key,
            version_check: None,
        }
    }

    pub fn delete(
        entity: Option<&str>,
        table: impl Into<String>,
        key: Vec<(String, Value)>,
    ) -> Self {
        Self {
            kind: WriteKind::Delete,
            entity: entity.map(str::to_string),
            table: table.into(),
            assignments: Vec::new(),
            key,
            version_check: None,
        }
    }

    pub fn with_version_check(mut self, column: impl Into<String>, expected: Value) -> Self {
        self.version_check = Some((column.into(), expected));
        self
    }

    /// Whether two statements can go out in the same batch: same kind,
    /// table, column layout, and version checking.
    pub fn is_batchable_with(&self, other: &WriteStatement) -> bool {
        self.kind == other.kind
            && self.table == other.table
            && self.version_check.is_some() == other.version_check.is_some()
            && same_columns(&self.assignments, &other.assignments)
            && same_columns(&self.key, &other.key)
    }
}

fn same_columns(a: &[(String, Value)], b: &[(String, Value)]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|((x, _), (y, _))| x == y)
}

/// Executes loads and writes on behalf of the unit-of-work engine.
///
/// Implementations own the connection and its transaction, and apply
/// dialect rendering and naming rules as they see fit.
pub trait SqlExecutor {
    /// Fetch the rows selected by `query`.
    fn execute_load(&mut self, query: &LoadQuery) -> Result<Vec<Row>>;

    /// Execute one write, returning the number of rows affected.
    fn execute_write(&mut self, statement: &WriteStatement) -> Result<u64>;

    /// Execute a batch of compatible writes in one round trip.
    ///
    /// Returns rows affected per statement. The default runs them one by one
    /// and stops at the first failure.
    fn execute_batch(&mut self, statements: &[WriteStatement]) -> Result<Vec<u64>> {
        statements
            .iter()
            .map(|statement| self.execute_write(statement))
            .collect()
    }

    /// Hand out a fresh identifier for a generated-id entity.
    fn generate_identifier(&mut self, descriptor: &EntityDescriptor) -> Result<Value>;
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for &mut T {
    fn execute_load(&mut self, query: &LoadQuery) -> Result<Vec<Row>> {
        (**self).execute_load(query)
    }

    fn execute_write(&mut self, statement: &WriteStatement) -> Result<u64> {
        (**self).execute_write(statement)
    }

    fn execute_batch(&mut self, statements: &[WriteStatement]) -> Result<Vec<u64>> {
        (**self).execute_batch(statements)
    }

    fn generate_identifier(&mut self, descriptor: &EntityDescriptor) -> Result<Value> {
        (**self).generate_identifier(descriptor)
    }
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for Box<T> {
    fn execute_load(&mut self, query: &LoadQuery) -> Result<Vec<Row>> {
        (**self).execute_load(query)
    }

    fn execute_write(&mut self, statement: &WriteStatement) -> Result<u64> {
        (**self).execute_write(statement)
    }

    fn execute_batch(&mut self, statements: &[WriteStatement]) -> Result<Vec<u64>> {
        (**self).execute_batch(statements)
    }

    fn generate_identifier(&mut self, descriptor: &EntityDescriptor) -> Result<Value> {
        (**self).generate_identifier(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::AttributeDescriptor;
    use crate::types::SqlType;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Book", "book", AttributeDescriptor::basic("id", SqlType::BigInt))
            .attribute(AttributeDescriptor::basic("title", SqlType::Text))
    }

    #[test]
    fn test_lock_mode_ordering() {
        assert!(LockMode::PessimisticWrite.greater_than(LockMode::Read));
        assert!(!LockMode::None.greater_than(LockMode::None));
        assert!(LockMode::OptimisticForceIncrement.forces_version_increment());
        assert!(LockMode::PessimisticRead.is_pessimistic());
        assert!(!LockMode::None.bypasses_cache());
    }

    #[test]
    fn test_load_query_by_ids() {
        let query = LoadQuery::by_ids(&descriptor(), vec![Value::BigInt(1)]);
        assert_eq!(query.columns, vec!["id", "title"]);
        assert_eq!(query.restriction, LoadRestriction::Column("id".into()));
    }

    #[test]
    fn test_join_table_query_keeps_columns() {
        let join = JoinTable::new("book_author", "fk_author", "fk_book");
        let query = LoadQuery::through_join_table(&descriptor(), join.clone(), vec![Value::BigInt(7)]);
        assert_eq!(query.restriction, LoadRestriction::JoinTable(join));
        assert_eq!(query.keys, vec![Value::BigInt(7)]);
        assert_eq!(query.id_column, "id");
    }

    #[test]
    fn test_batchable_requires_same_layout() {
        let a = WriteStatement::insert(Some("Book"), "book", vec![("id".into(), Value::BigInt(1))]);
        let b = WriteStatement::insert(Some("Book"), "book", vec![("id".into(), Value::BigInt(2))]);
        let c = WriteStatement::insert(
            Some("Book"),
            "book",
            vec![("id".into(), Value::BigInt(3)), ("title".into(), Value::Null)],
        );
        assert!(a.is_batchable_with(&b));
        assert!(!a.is_batchable_with(&c));

        let d = WriteStatement::delete(Some("Book"), "book", vec![("id".into(), Value::BigInt(1))]);
        let e = d.clone().with_version_check("version", Value::BigInt(0));
        assert!(!d.is_batchable_with(&e));
    }
}
