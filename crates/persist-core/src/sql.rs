//! SQL rendering for load requests and write statements.
//!
//! Executors that talk to a real database render [`LoadQuery`] and
//! [`WriteStatement`] through a [`Dialect`]. Values are never inlined; they
//! are returned as bind parameters in placeholder order.

use crate::executor::{LoadQuery, LoadRestriction, LockMode, OWNER_KEY_COLUMN, WriteKind, WriteStatement};
use crate::naming::NamingContext;
use crate::value::Value;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Row-locking clause appended to a SELECT, if the dialect has one.
    pub const fn lock_clause(self, mode: LockMode) -> Option<&'static str> {
        match (self, mode) {
            (Dialect::Sqlite, _) => None,
            (_, LockMode::PessimisticWrite) => Some("FOR UPDATE"),
            (Dialect::Postgres, LockMode::PessimisticRead) => Some("FOR SHARE"),
            (Dialect::Mysql, LockMode::PessimisticRead) => Some("LOCK IN SHARE MODE"),
            _ => None,
        }
    }
}

/// A rendered statement and its bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Binder {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        self.dialect.placeholder(self.params.len())
    }

    fn in_list(&mut self, values: &[Value]) -> String {
        values
            .iter()
            .map(|value| self.bind(value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn table_name(dialect: Dialect, naming: &NamingContext, table: &str) -> String {
    let physical = naming.to_physical(&crate::naming::QualifiedTableName::parse(table));
    [physical.catalog.as_deref(), physical.schema.as_deref(), Some(physical.table.as_str())]
        .into_iter()
        .flatten()
        .map(|part| dialect.quote_identifier(part))
        .collect::<Vec<_>>()
        .join(".")
}

/// Render a load request as a SELECT.
pub fn render_load(query: &LoadQuery, dialect: Dialect, naming: &NamingContext) -> RenderedSql {
    let q = |name: &str| dialect.quote_identifier(name);
    let mut binder = Binder::new(dialect);
    let target = table_name(dialect, naming, &query.table);

    let mut sql = match &query.restriction {
        LoadRestriction::Column(column) => {
            let columns = query.columns.iter().map(|c| q(c)).collect::<Vec<_>>().join(", ");
            let keys = binder.in_list(&query.keys);
            format!("SELECT {columns} FROM {target} WHERE {} IN ({keys})", q(column))
        }
        LoadRestriction::JoinTable(join) => {
            let link = table_name(dialect, naming, &join.table);
            let mut columns: Vec<String> = query
                .columns
                .iter()
                .map(|c| format!("t.{}", q(c)))
                .collect();
            columns.push(format!("j.{} AS {}", q(&join.owner_column), q(OWNER_KEY_COLUMN)));
            let keys = binder.in_list(&query.keys);
            format!(
                "SELECT {} FROM {link} j INNER JOIN {target} t ON t.{} = j.{} WHERE j.{} IN ({keys})",
                columns.join(", "),
                q(&query.id_column),
                q(&join.element_column),
                q(&join.owner_column),
            )
        }
    };

    if let Some(clause) = dialect.lock_clause(query.lock_mode) {
        sql.push(' ');
        sql.push_str(clause);
    }

    RenderedSql {
        sql,
        params: binder.params,
    }
}

/// Render a write statement.
pub fn render_write(
    statement: &WriteStatement,
    dialect: Dialect,
    naming: &NamingContext,
) -> RenderedSql {
    let q = |name: &str| dialect.quote_identifier(name);
    let mut binder = Binder::new(dialect);
    let target = table_name(dialect, naming, &statement.table);

    let mut sql = match statement.kind {
        WriteKind::Insert => {
            let columns = statement
                .assignments
                .iter()
                .map(|(c, _)| q(c))
                .collect::<Vec<_>>()
                .join(", ");
            let values = statement
                .assignments
                .iter()
                .map(|(_, v)| binder.bind(v))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {target} ({columns}) VALUES ({values})")
        }
        WriteKind::Update => {
            let set = statement
                .assignments
                .iter()
                .map(|(c, v)| format!("{} = {}", q(c), binder.bind(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("UPDATE {target} SET {set}")
        }
        WriteKind::Delete => format!("DELETE FROM {target}"),
    };

    let mut conditions: Vec<String> = statement
        .key
        .iter()
        .map(|(c, v)| format!("{} = {}", q(c), binder.bind(v)))
        .collect();
    if let Some((column, expected)) = &statement.version_check {
        conditions.push(format!("{} = {}", q(column), binder.bind(expected)));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    RenderedSql {
        sql,
        params: binder.params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttributeDescriptor, EntityDescriptor, JoinTable};
    use crate::types::SqlType;

    fn book() -> EntityDescriptor {
        EntityDescriptor::new("Book", "book", AttributeDescriptor::basic("id", SqlType::BigInt))
            .attribute(AttributeDescriptor::basic("title", SqlType::Text))
    }

    #[test]
    fn test_placeholders_per_dialect() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
    }

    #[test]
    fn test_render_load_by_ids() {
        let query = LoadQuery::by_ids(&book(), vec![Value::BigInt(1), Value::BigInt(2)]);
        let rendered = render_load(&query, Dialect::Postgres, &NamingContext::default());
        assert_eq!(
            rendered.sql,
            "SELECT \"id\", \"title\" FROM \"book\" WHERE \"id\" IN ($1, $2)"
        );
        assert_eq!(rendered.params, vec![Value::BigInt(1), Value::BigInt(2)]);
    }

    #[test]
    fn test_render_load_with_lock_and_schema() {
        let naming = NamingContext::new(None, Some("shop")).unwrap();
        let query = LoadQuery::by_ids(&book(), vec![Value::BigInt(1)])
            .with_lock(LockMode::PessimisticWrite);
        let rendered = render_load(&query, Dialect::Mysql, &naming);
        assert_eq!(
            rendered.sql,
            "SELECT `id`, `title` FROM `shop`.`book` WHERE `id` IN (?) FOR UPDATE"
        );
        let shared = render_load(
            &query.clone().with_lock(LockMode::PessimisticRead),
            Dialect::Sqlite,
            &naming,
        );
        assert!(!shared.sql.contains("FOR"));
    }

    #[test]
    fn test_render_join_table_load() {
        let join = JoinTable::new("book_author", "author_id", "book_id");
        let query = LoadQuery::through_join_table(&book(), join, vec![Value::BigInt(9)]);
        let rendered = render_load(&query, Dialect::Sqlite, &NamingContext::default());
        assert_eq!(
            rendered.sql,
            "SELECT t.\"id\", t.\"title\", j.\"author_id\" AS \"__owner_key\" FROM \"book_author\" j \
             INNER JOIN \"book\" t ON t.\"id\" = j.\"book_id\" WHERE j.\"author_id\" IN (?1)"
        );
    }

    #[test]
    fn test_render_versioned_update() {
        let statement = WriteStatement::update(
            Some("Book"),
            "book",
            vec![
                ("title".into(), Value::from("Dune")),
                ("version".into(), Value::BigInt(2)),
            ],
            vec![("id".into(), Value::BigInt(5))],
        )
        .with_version_check("version", Value::BigInt(1));
        let rendered = render_write(&statement, Dialect::Postgres, &NamingContext::default());
        assert_eq!(
            rendered.sql,
            "UPDATE \"book\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(rendered.params.len(), 4);
    }

    #[test]
    fn test_render_insert_and_delete() {
        let insert = WriteStatement::insert(
            None,
            "book_author",
            vec![
                ("author_id".into(), Value::BigInt(1)),
                ("book_id".into(), Value::BigInt(2)),
            ],
        );
        let rendered = render_write(&insert, Dialect::Sqlite, &NamingContext::default());
        assert_eq!(
            rendered.sql,
            "INSERT INTO \"book_author\" (\"author_id\", \"book_id\") VALUES (?1, ?2)"
        );

        let delete = WriteStatement::delete(Some("Book"), "book", vec![("id".into(), Value::BigInt(2))]);
        let rendered = render_write(&delete, Dialect::Postgres, &NamingContext::default());
        assert_eq!(rendered.sql, "DELETE FROM \"book\" WHERE \"id\" = $1");
    }
}
