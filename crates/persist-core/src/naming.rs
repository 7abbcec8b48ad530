//! Table-name qualification for generated SQL.
//!
//! A [`NamingContext`] carries the default catalog and schema configured for
//! a session factory. Unqualified table names pick those defaults up when
//! SQL is rendered.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

fn plain_identifier() -> Option<&'static Regex> {
    static PLAIN: OnceLock<Option<Regex>> = OnceLock::new();
    PLAIN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").ok())
        .as_ref()
}

/// Whether `name` can be written without quotes.
pub fn is_plain_identifier(name: &str) -> bool {
    plain_identifier().is_some_and(|re| re.is_match(name))
}

/// Validate an identifier taken from configuration.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if is_plain_identifier(name) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid {kind} name '{name}'")))
    }
}

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double quotes are doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote only when the identifier is not plain.
pub fn quote_if_needed(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

/// A possibly qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTableName {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl QualifiedTableName {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            table: table.into(),
        }
    }

    /// Parse `table`, `schema.table`, or `catalog.schema.table`.
    pub fn parse(name: &str) -> Self {
        let parts: Vec<&str> = name.split('.').collect();
        match parts.as_slice() {
            [catalog, schema, table] => Self {
                catalog: Some((*catalog).to_string()),
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            },
            [schema, table] => Self {
                catalog: None,
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            },
            _ => Self::new(name),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }
}

impl fmt::Display for QualifiedTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(catalog) = &self.catalog {
            write!(f, "{catalog}.")?;
        }
        if let Some(schema) = &self.schema {
            write!(f, "{schema}.")?;
        }
        f.write_str(&self.table)
    }
}

/// Default catalog/schema applied to unqualified names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingContext {
    default_catalog: Option<String>,
    default_schema: Option<String>,
}

impl NamingContext {
    /// Create a context, validating the default names.
    pub fn new(default_catalog: Option<&str>, default_schema: Option<&str>) -> Result<Self> {
        if let Some(catalog) = default_catalog {
            validate_identifier("catalog", catalog)?;
        }
        if let Some(schema) = default_schema {
            validate_identifier("schema", schema)?;
        }
        Ok(Self {
            default_catalog: default_catalog.map(str::to_string),
            default_schema: default_schema.map(str::to_string),
        })
    }

    pub fn default_catalog(&self) -> Option<&str> {
        self.default_catalog.as_deref()
    }

    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    /// Fill in missing catalog/schema from the defaults.
    pub fn to_physical(&self, name: &QualifiedTableName) -> QualifiedTableName {
        QualifiedTableName {
            catalog: name.catalog.clone().or_else(|| self.default_catalog.clone()),
            schema: name.schema.clone().or_else(|| self.default_schema.clone()),
            table: name.table.clone(),
        }
    }

    /// Render a table name for SQL, with defaults applied and each part
    /// quoted when necessary.
    pub fn format(&self, table: &str) -> String {
        Self::render(&self.to_physical(&QualifiedTableName::parse(table)))
    }

    /// Render a table name for SQL without applying defaults.
    pub fn format_without_defaults(&self, table: &str) -> String {
        Self::render(&QualifiedTableName::parse(table))
    }

    fn render(name: &QualifiedTableName) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(catalog) = &name.catalog {
            parts.push(quote_if_needed(catalog));
        }
        if let Some(schema) = &name.schema {
            parts.push(quote_if_needed(schema));
        }
        parts.push(quote_if_needed(&name.table));
        parts.join(".")
    }
}
