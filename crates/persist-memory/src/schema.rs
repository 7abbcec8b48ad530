//! Table layouts derived from mapping metadata.

use persist_core::{CollectionMapping, MetadataProvider, Result};
use std::collections::BTreeMap;

/// A foreign key from `column` to the identifier column of `references`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub column: String,
    pub references: String,
    pub referenced_column: String,
}

/// Constraints enforced on one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    /// Columns whose combined value must be unique.
    pub primary_key: Vec<String>,
    pub not_null: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn primary_key_name(&self) -> String {
        format!("{}_pkey", self.name)
    }
}

fn foreign_key(table: &str, column: &str, references: &str, referenced_column: &str) -> ForeignKey {
    ForeignKey {
        name: format!("{table}_{column}_fkey"),
        column: column.to_string(),
        references: references.to_string(),
        referenced_column: referenced_column.to_string(),
    }
}

/// Build one schema per entity table and per owning join table.
pub fn derive_schema(metadata: &dyn MetadataProvider) -> Result<BTreeMap<String, TableSchema>> {
    let mut tables = BTreeMap::new();

    for entity in metadata.entity_names() {
        let descriptor = metadata.descriptor(entity)?;
        let mut table = TableSchema::new(descriptor.table());
        table.primary_key.push(descriptor.id_column().to_string());
        table.not_null.push(descriptor.id_column().to_string());

        for attribute in descriptor.column_attributes() {
            let Some(column) = attribute.column_name() else {
                continue;
            };
            if !attribute.is_nullable() {
                table.not_null.push(column.to_string());
            }
            if let Some(target) = attribute.target() {
                let target = metadata.descriptor(target)?;
                table.foreign_keys.push(foreign_key(
                    descriptor.table(),
                    column,
                    target.table(),
                    target.id_column(),
                ));
            }
        }

        for attribute in descriptor.attributes() {
            let (Some(CollectionMapping::JoinTable(join)), Some(target)) =
                (attribute.collection_mapping(), attribute.target())
            else {
                continue;
            };
            let target = metadata.descriptor(target)?;
            let mut link = TableSchema::new(&join.table);
            link.primary_key = vec![join.owner_column.clone(), join.element_column.clone()];
            link.not_null = link.primary_key.clone();
            link.foreign_keys.push(foreign_key(
                &join.table,
                &join.owner_column,
                descriptor.table(),
                descriptor.id_column(),
            ));
            link.foreign_keys.push(foreign_key(
                &join.table,
                &join.element_column,
                target.table(),
                target.id_column(),
            ));
            tables.insert(join.table.clone(), link);
        }

        tables.insert(descriptor.table().to_string(), table);
    }

    Ok(tables)
}
