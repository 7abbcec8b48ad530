//! In-memory SQL executor for the persist engine.
//!
//! `MemoryDatabase` keeps one table per mapped entity and per owning join
//! table, derived from the metamodel. It enforces what a real database would
//! reject during a flush:
//!
//! - primary-key uniqueness
//! - NOT NULL on identifiers, versions, and non-nullable columns
//! - foreign keys on insert and update (a row may reference itself)
//! - restricted deletes of rows that are still referenced
//!
//! Every statement is rendered through [`persist_core::render_load`] or
//! [`persist_core::render_write`] and appended to a log, so tests can assert
//! on exactly what the engine sent.
//!
//! # Example
//!
//! ```rust,ignore
//! let db = MemoryDatabase::new(&metamodel)?;
//! db.seed("author", [Row::from_pairs([("id", Value::BigInt(1))])])?;
//!
//! let mut session = Session::new(metamodel, db.clone());
//! let author = session.find("Author", 1_i64)?;
//! assert_eq!(db.load_count(), 1);
//! ```
//!
//! Clones share the same storage.

pub mod schema;

pub use schema::{ForeignKey, TableSchema, derive_schema};

use persist_core::{
    Dialect, EntityDescriptor, Error, LoadQuery, LoadRestriction, MetadataProvider, NamingContext,
    OWNER_KEY_COLUMN, Result, Row, SqlExecutor, SqlType, Value, WriteKind, WriteStatement,
    render_load, render_write,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type StoredRow = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: BTreeMap<String, Table>,
    sequences: BTreeMap<String, i64>,
    statements: Vec<String>,
    loads: usize,
    writes: usize,
    injected_failure: Option<Error>,
    snapshot: Option<BTreeMap<String, Table>>,
}

/// Shared in-memory storage implementing [`SqlExecutor`].
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
    dialect: Dialect,
    naming: NamingContext,
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryDatabase")
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("statements", &state.statements.len())
            .field("dialect", &self.dialect)
            .finish()
    }
}

/// Non-null values that identify the same key.
fn same_key(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.key_string() == b.key_string()
}

fn cell<'r>(row: &'r StoredRow, column: &str) -> &'r Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn project(row: &StoredRow, columns: &[String]) -> Vec<(String, Value)> {
    columns
        .iter()
        .map(|column| (column.clone(), cell(row, column).clone()))
        .collect()
}

fn matches_all(row: &StoredRow, restriction: &[(String, Value)]) -> bool {
    restriction
        .iter()
        .all(|(column, value)| same_key(cell(row, column), value))
}

impl MemoryDatabase {
    /// Create empty tables for every entity and join table in `metadata`.
    pub fn new(metadata: &dyn MetadataProvider) -> Result<Self> {
        let tables = derive_schema(metadata)?
            .into_iter()
            .map(|(name, schema)| {
                (
                    name,
                    Table {
                        schema,
                        rows: Vec::new(),
                    },
                )
            })
            .collect();
        Ok(Self {
            state: Arc::new(Mutex::new(DatabaseState {
                tables,
                ..DatabaseState::default()
            })),
            dialect: Dialect::Sqlite,
            naming: NamingContext::default(),
        })
    }

    /// Render the statement log in another dialect.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Qualify logged table names with a default catalog and schema.
    pub fn with_naming(mut self, naming: NamingContext) -> Self {
        self.naming = naming;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert rows directly, checking keys but not foreign keys. Not logged.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        let mut state = self.lock();
        let target = state.table_mut(table)?;
        for row in rows {
            let stored: StoredRow = row
                .iter()
                .map(|(column, value)| (column.to_string(), value.clone()))
                .collect();
            target.check_primary_key(&stored, None)?;
            target.rows.push(stored);
        }
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// All rows of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| Row::from_pairs(r.clone())).collect())
            .unwrap_or_default()
    }

    /// First row of `table` whose `column` equals `value`.
    pub fn find_row(&self, table: &str, column: &str, value: &Value) -> Option<Row> {
        let state = self.lock();
        let table = state.tables.get(table)?;
        table
            .rows
            .iter()
            .find(|row| same_key(cell(row, column), value))
            .map(|row| Row::from_pairs(row.clone()))
    }

    /// Rendered SQL of every load and write, oldest first.
    pub fn statement_log(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.statements.clear();
        state.loads = 0;
        state.writes = 0;
    }

    /// Number of loads executed.
    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    /// Number of writes executed, including failed ones.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Make the next write fail with `error` without touching any table.
    pub fn fail_next_write(&self, error: Error) {
        self.lock().injected_failure = Some(error);
    }

    /// Start a transaction that [`rollback`](Self::rollback) can undo.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.lock();
        if state.snapshot.is_some() {
            return Err(Error::InvalidState("transaction already active".to_string()));
        }
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.snapshot.take().is_none() {
            return Err(Error::InvalidState("no active transaction".to_string()));
        }
        tracing::debug!("Committed transaction");
        Ok(())
    }

    /// Restore every table to its state at [`begin`](Self::begin).
    /// Identifier sequences are not rolled back.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(snapshot) = state.snapshot.take() else {
            return Err(Error::InvalidState("no active transaction".to_string()));
        };
        state.tables = snapshot;
        tracing::debug!("Rolled back transaction");
        Ok(())
    }
}

impl Table {
    fn check_not_null(&self, row: &StoredRow) -> Result<()> {
        for column in &self.schema.not_null {
            if cell(row, column).is_null() {
                return Err(Error::ConstraintViolation {
                    table: self.schema.name.clone(),
                    constraint: None,
                    message: format!("NOT NULL constraint failed: {}.{column}", self.schema.name),
                });
            }
        }
        Ok(())
    }

    /// Reject `row` if another row (other than `skip`) has the same key.
    fn check_primary_key(&self, row: &StoredRow, skip: Option<usize>) -> Result<()> {
        let key: Vec<(String, Value)> = project(row, &self.schema.primary_key);
        let duplicate = self
            .rows
            .iter()
            .enumerate()
            .any(|(i, existing)| Some(i) != skip && matches_all(existing, &key));
        if duplicate {
            return Err(Error::ConstraintViolation {
                table: self.schema.name.clone(),
                constraint: Some(self.schema.primary_key_name()),
                message: format!("UNIQUE constraint failed: duplicate key {key:?}"),
            });
        }
        Ok(())
    }
}

impl DatabaseState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Mapping(format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::Mapping(format!("no such table: {name}")))
    }

    /// Every foreign key of `row` in `table` must point at an existing row.
    fn check_foreign_keys(&self, table: &Table, row: &StoredRow) -> Result<()> {
        for fk in &table.schema.foreign_keys {
            let value = cell(row, &fk.column);
            if value.is_null() {
                continue;
            }
            if fk.references == table.schema.name && same_key(cell(row, &fk.referenced_column), value) {
                continue;
            }
            let referenced = self.table(&fk.references)?;
            let found = referenced
                .rows
                .iter()
                .any(|r| same_key(cell(r, &fk.referenced_column), value));
            if !found {
                return Err(Error::ConstraintViolation {
                    table: table.schema.name.clone(),
                    constraint: Some(fk.name.clone()),
                    message: format!(
                        "FOREIGN KEY constraint failed: {}.{} = {value} has no row in {}",
                        table.schema.name, fk.column, fk.references
                    ),
                });
            }
        }
        Ok(())
    }

    /// Fail if any row outside `doomed` still references one of them.
    fn check_restricted_delete(&self, table: &str, doomed: &[usize]) -> Result<()> {
        let deleted = &self.table(table)?.rows;
        for other in self.tables.values() {
            for fk in other.schema.foreign_keys.iter().filter(|fk| fk.references == table) {
                for &index in doomed {
                    let key = cell(&deleted[index], &fk.referenced_column);
                    let referenced = other.rows.iter().enumerate().any(|(i, r)| {
                        let same_row = other.schema.name == table && doomed.contains(&i);
                        !same_row && same_key(cell(r, &fk.column), key)
                    });
                    if referenced {
                        return Err(Error::ConstraintViolation {
                            table: other.schema.name.clone(),
                            constraint: Some(fk.name.clone()),
                            message: format!(
                                "FOREIGN KEY constraint failed: {table} row {key} is still referenced by {}.{}",
                                other.schema.name, fk.column
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn matching_rows(&self, statement: &WriteStatement) -> Result<Vec<usize>> {
        let table = self.table(&statement.table)?;
        Ok(table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                matches_all(row, &statement.key)
                    && statement
                        .version_check
                        .as_ref()
                        .is_none_or(|(column, expected)| same_key(cell(row, column), expected))
            })
            .map(|(i, _)| i)
            .collect())
    }

    fn insert(&mut self, statement: &WriteStatement) -> Result<u64> {
        let row: StoredRow = statement.assignments.iter().cloned().collect();
        let table = self.table(&statement.table)?;
        table.check_not_null(&row)?;
        table.check_primary_key(&row, None)?;
        self.check_foreign_keys(table, &row)?;
        self.table_mut(&statement.table)?.rows.push(row);
        Ok(1)
    }

    fn update(&mut self, statement: &WriteStatement) -> Result<u64> {
        let indexes = self.matching_rows(statement)?;
        let mut updated = Vec::with_capacity(indexes.len());
        {
            let table = self.table(&statement.table)?;
            for &index in &indexes {
                let mut row = table.rows[index].clone();
                for (column, value) in &statement.assignments {
                    row.insert(column.clone(), value.clone());
                }
                table.check_not_null(&row)?;
                table.check_primary_key(&row, Some(index))?;
                self.check_foreign_keys(table, &row)?;
                updated.push((index, row));
            }
        }
        let table = self.table_mut(&statement.table)?;
        for (index, row) in updated {
            table.rows[index] = row;
        }
        Ok(indexes.len() as u64)
    }

    fn delete(&mut self, statement: &WriteStatement) -> Result<u64> {
        let indexes = self.matching_rows(statement)?;
        self.check_restricted_delete(&statement.table, &indexes)?;
        let table = self.table_mut(&statement.table)?;
        let mut position = 0;
        table.rows.retain(|_| {
            let keep = !indexes.contains(&position);
            position += 1;
            keep
        });
        Ok(indexes.len() as u64)
    }

    fn load(&self, query: &LoadQuery) -> Result<Vec<Row>> {
        let table = self.table(&query.table)?;
        let selected = |row: &StoredRow| query.keys.iter().any(|key| same_key(cell(row, row_key_column(query)), key));

        match &query.restriction {
            LoadRestriction::Column(_) => Ok(table
                .rows
                .iter()
                .filter(|row| selected(row))
                .map(|row| Row::from_pairs(project(row, &query.columns)))
                .collect()),
            LoadRestriction::JoinTable(join) => {
                let link = self.table(&join.table)?;
                let mut rows = Vec::new();
                for link_row in &link.rows {
                    let owner = cell(link_row, &join.owner_column);
                    if !query.keys.iter().any(|key| same_key(owner, key)) {
                        continue;
                    }
                    let element = cell(link_row, &join.element_column);
                    if let Some(target) = table
                        .rows
                        .iter()
                        .find(|row| same_key(cell(row, &query.id_column), element))
                    {
                        let mut pairs = project(target, &query.columns);
                        pairs.push((OWNER_KEY_COLUMN.to_string(), owner.clone()));
                        rows.push(Row::from_pairs(pairs));
                    }
                }
                Ok(rows)
            }
        }
    }

    fn next_identifier(&mut self, descriptor: &EntityDescriptor) -> Result<Value> {
        let table = self.table(descriptor.table())?;
        let highest = table
            .rows
            .iter()
            .filter_map(|row| cell(row, descriptor.id_column()).as_i64())
            .max()
            .unwrap_or(0);
        let sequence = self.sequences.entry(descriptor.table().to_string()).or_insert(0);
        *sequence = (*sequence).max(highest) + 1;
        let next = *sequence;

        match descriptor.identifier().sql_type() {
            sql_type if sql_type.is_integral() => Ok(Value::BigInt(next)),
            SqlType::Text | SqlType::VarChar(_) => Ok(Value::Text(format!("{}-{next}", descriptor.table()))),
            SqlType::Uuid => {
                let mut bytes = [0_u8; 16];
                bytes[8..].copy_from_slice(&next.to_be_bytes());
                Ok(Value::Uuid(bytes))
            }
            other => Err(Error::Mapping(format!(
                "cannot generate {other:?} identifiers for {}",
                descriptor.name()
            ))),
        }
    }
}

fn row_key_column(query: &LoadQuery) -> &str {
    match &query.restriction {
        LoadRestriction::Column(column) => column,
        LoadRestriction::JoinTable(_) => &query.id_column,
    }
}

impl SqlExecutor for MemoryDatabase {
    fn execute_load(&mut self, query: &LoadQuery) -> Result<Vec<Row>> {
        let rendered = render_load(query, self.dialect, &self.naming);
        let mut state = self.lock();
        tracing::debug!(sql = %rendered.sql, params = rendered.params.len(), "Executing load");
        state.statements.push(rendered.sql);
        state.loads += 1;
        state.load(query)
    }

    fn execute_write(&mut self, statement: &WriteStatement) -> Result<u64> {
        let rendered = render_write(statement, self.dialect, &self.naming);
        let mut state = self.lock();
        state.writes += 1;
        if let Some(error) = state.injected_failure.take() {
            tracing::debug!(sql = %rendered.sql, error = %error, "Injected write failure");
            return Err(error);
        }
        tracing::debug!(sql = %rendered.sql, params = rendered.params.len(), "Executing write");
        state.statements.push(rendered.sql);
        match statement.kind {
            WriteKind::Insert => state.insert(statement),
            WriteKind::Update => state.update(statement),
            WriteKind::Delete => state.delete(statement),
        }
    }

    fn generate_identifier(&mut self, descriptor: &EntityDescriptor) -> Result<Value> {
        self.lock().next_identifier(descriptor)
    }
}
