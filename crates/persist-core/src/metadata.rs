//! Mapping metadata: entity and attribute descriptors and the provider contract.
//!
//! Metadata is normally produced by an annotation or XML parser that lives
//! outside this workspace. The engine only consumes it through
//! [`MetadataProvider`]; [`Metamodel`] is the in-memory implementation built
//! with descriptor builders.

use crate::error::{Error, Result};
use crate::graph::RootGraph;
use crate::types::SqlType;
use std::collections::BTreeMap;
use std::fmt;

/// Static fetch default declared on an attribute mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchType {
    /// Load together with the owning entity.
    Eager,
    /// Defer loading until first access.
    Lazy,
}

/// Operations that can propagate along associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
    Lock,
}

impl CascadeOp {
    /// All cascadable operations.
    pub const ALL: [CascadeOp; 6] = [
        CascadeOp::Persist,
        CascadeOp::Merge,
        CascadeOp::Remove,
        CascadeOp::Refresh,
        CascadeOp::Detach,
        CascadeOp::Lock,
    ];

    const fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Merge => 1 << 1,
            CascadeOp::Remove => 1 << 2,
            CascadeOp::Refresh => 1 << 3,
            CascadeOp::Detach => 1 << 4,
            CascadeOp::Lock => 1 << 5,
        }
    }

    /// Lowercase name as used in cascade specifications.
    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Merge => "merge",
            CascadeOp::Remove => "remove",
            CascadeOp::Refresh => "refresh",
            CascadeOp::Detach => "detach",
            CascadeOp::Lock => "lock",
        }
    }
}

impl fmt::Display for CascadeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of operations an association cascades.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CascadeStyle {
    bits: u8,
}

impl CascadeStyle {
    /// Cascade nothing.
    pub const NONE: CascadeStyle = CascadeStyle { bits: 0 };
    /// Cascade every operation.
    pub const ALL: CascadeStyle = CascadeStyle { bits: 0b11_1111 };

    /// Style containing exactly one operation.
    pub const fn of(op: CascadeOp) -> Self {
        Self { bits: op.bit() }
    }

    /// Add an operation.
    pub const fn with(self, op: CascadeOp) -> Self {
        Self {
            bits: self.bits | op.bit(),
        }
    }

    /// Whether `op` cascades under this style.
    pub const fn includes(self, op: CascadeOp) -> bool {
        self.bits & op.bit() != 0
    }

    /// Whether nothing cascades.
    pub const fn is_none(self) -> bool {
        self.bits == 0
    }

    /// Included operations, in declaration order.
    pub fn operations(self) -> Vec<CascadeOp> {
        CascadeOp::ALL
            .into_iter()
            .filter(|op| self.includes(*op))
            .collect()
    }

    /// Parse a comma-separated cascade specification such as `"persist, merge"`.
    ///
    /// Accepts `all`, `none`, the operation names, and the aliases `delete`
    /// (remove), `evict` (detach), and `save-update` (persist + merge).
    pub fn parse(spec: &str) -> Result<Self> {
        let mut style = CascadeStyle::NONE;
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            style = match token.to_ascii_lowercase().as_str() {
                "all" => CascadeStyle::ALL,
                "none" => style,
                "persist" => style.with(CascadeOp::Persist),
                "merge" => style.with(CascadeOp::Merge),
                "remove" | "delete" => style.with(CascadeOp::Remove),
                "refresh" => style.with(CascadeOp::Refresh),
                "detach" | "evict" => style.with(CascadeOp::Detach),
                "lock" => style.with(CascadeOp::Lock),
                "save-update" => style.with(CascadeOp::Persist).with(CascadeOp::Merge),
                other => {
                    return Err(Error::Mapping(format!("unknown cascade style '{other}'")));
                }
            };
        }
        Ok(style)
    }
}

impl fmt::Debug for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.operations()).finish()
    }
}

/// How identifiers are assigned to new instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// The application sets the identifier before persisting.
    #[default]
    Assigned,
    /// The SQL collaborator hands out an identifier at persist time.
    Generated,
}

/// Link table backing the owning side of a many-to-many collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column referencing the owner's identifier.
    pub owner_column: String,
    /// Column referencing the element's identifier.
    pub element_column: String,
}

impl JoinTable {
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        element_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            element_column: element_column.into(),
        }
    }

    /// The same link table seen from the element side.
    pub fn inverted(&self) -> JoinTable {
        JoinTable {
            table: self.table.clone(),
            owner_column: self.element_column.clone(),
            element_column: self.owner_column.clone(),
        }
    }
}

/// How a collection is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionMapping {
    /// One-to-many; the named to-one attribute on the element holds the key.
    MappedBy(String),
    /// Owning side of a many-to-many.
    JoinTable(JoinTable),
    /// Inverse side of a many-to-many owned by the named collection on the element.
    InverseOf(String),
}

/// Structural kind of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    /// Single column value.
    Basic,
    /// Foreign key to another entity.
    ToOne { target: String },
    /// Collection of other entities.
    Collection {
        target: String,
        mapping: CollectionMapping,
    },
}

/// Describes one mapped attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    name: String,
    column: Option<String>,
    sql_type: SqlType,
    kind: AttributeKind,
    fetch: FetchType,
    cascade: CascadeStyle,
    nullable: bool,
}

impl AttributeDescriptor {
    /// A basic column attribute; the column defaults to the attribute name.
    pub fn basic(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column: Some(name.clone()),
            name,
            sql_type,
            kind: AttributeKind::Basic,
            fetch: FetchType::Eager,
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    /// A to-one association stored in `column`. Eager by default.
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: Some(column.into()),
            // Replaced by the target identifier's type when the metamodel is built.
            sql_type: SqlType::BigInt,
            kind: AttributeKind::ToOne {
                target: target.into(),
            },
            fetch: FetchType::Eager,
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    /// A one-to-many collection keyed by `mapped_by` on the element. Lazy by default.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self::collection(
            name,
            target,
            CollectionMapping::MappedBy(mapped_by.into()),
        )
    }

    /// The owning side of a many-to-many. Lazy by default.
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        join: JoinTable,
    ) -> Self {
        Self::collection(name, target, CollectionMapping::JoinTable(join))
    }

    /// The inverse side of a many-to-many. Lazy by default.
    pub fn many_to_many_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self::collection(
            name,
            target,
            CollectionMapping::InverseOf(mapped_by.into()),
        )
    }

    fn collection(
        name: impl Into<String>,
        target: impl Into<String>,
        mapping: CollectionMapping,
    ) -> Self {
        Self {
            name: name.into(),
            column: None,
            sql_type: SqlType::BigInt,
            kind: AttributeKind::Collection {
                target: target.into(),
                mapping,
            },
            fetch: FetchType::Lazy,
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    /// Override the column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Set nullability.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set the static fetch default.
    pub fn fetch(mut self, fetch: FetchType) -> Self {
        self.fetch = fetch;
        self
    }

    /// Shorthand for `fetch(FetchType::Lazy)`.
    pub fn lazy(self) -> Self {
        self.fetch(FetchType::Lazy)
    }

    /// Shorthand for `fetch(FetchType::Eager)`.
    pub fn eager(self) -> Self {
        self.fetch(FetchType::Eager)
    }

    /// Set the cascade style.
    pub fn cascade(mut self, cascade: CascadeStyle) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column for basic and to-one attributes; `None` for collections.
    pub fn column_name(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn sql_type(&self) -> &SqlType {
        &self.sql_type
    }

    pub fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    pub fn fetch_type(&self) -> FetchType {
        self.fetch
    }

    pub fn cascade_style(&self) -> CascadeStyle {
        self.cascade
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_basic(&self) -> bool {
        matches!(self.kind, AttributeKind::Basic)
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, AttributeKind::ToOne { .. })
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AttributeKind::Collection { .. })
    }

    /// Whether the attribute points at another entity.
    pub fn is_association(&self) -> bool {
        !self.is_basic()
    }

    /// Target entity of an association.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::Basic => None,
            AttributeKind::ToOne { target } | AttributeKind::Collection { target, .. } => {
                Some(target)
            }
        }
    }

    /// Collection mapping, if this is a collection.
    pub fn collection_mapping(&self) -> Option<&CollectionMapping> {
        match &self.kind {
            AttributeKind::Collection { mapping, .. } => Some(mapping),
            _ => None,
        }
    }

    /// Whether the attribute occupies a column of the entity's own table.
    pub fn has_column(&self) -> bool {
        self.column.is_some() && !self.is_collection()
    }
}

/// Describes one mapped entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    identifier: AttributeDescriptor,
    id_generation: IdGeneration,
    version: Option<String>,
    attributes: Vec<AttributeDescriptor>,
    cacheable: bool,
}

impl EntityDescriptor {
    /// Create a descriptor with the given identifier attribute.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        identifier: AttributeDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identifier: identifier.nullable(false),
            id_generation: IdGeneration::Assigned,
            version: None,
            attributes: Vec::new(),
            cacheable: false,
        }
    }

    /// Add an attribute.
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add the optimistic-locking version attribute.
    pub fn version(mut self, attribute: AttributeDescriptor) -> Self {
        self.version = Some(attribute.name().to_string());
        self.attributes.push(attribute.nullable(false));
        self
    }

    /// Let the SQL collaborator generate identifiers.
    pub fn generated_id(mut self) -> Self {
        self.id_generation = IdGeneration::Generated;
        self
    }

    /// Allow instances to be stored in the second-level cache.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identifier(&self) -> &AttributeDescriptor {
        &self.identifier
    }

    /// Identifier column name.
    pub fn id_column(&self) -> &str {
        self.identifier.column_name().unwrap_or(self.identifier.name())
    }

    pub fn id_generation(&self) -> IdGeneration {
        self.id_generation
    }

    /// Non-identifier attributes in declaration order.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Look up a non-identifier attribute by name.
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Look up a non-identifier attribute, failing with `UnknownAttribute`.
    pub fn require_attribute(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.find_attribute(name)
            .ok_or_else(|| Error::unknown_attribute(&self.name, name))
    }

    /// The version attribute, if the entity is versioned.
    pub fn version_attribute(&self) -> Option<&AttributeDescriptor> {
        self.version
            .as_deref()
            .and_then(|name| self.find_attribute(name))
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Attributes stored in this entity's own table (basic and to-one).
    pub fn column_attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.iter().filter(|a| a.has_column())
    }

    /// Every column selected when loading a row: identifier first.
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(self.id_column().to_string())
            .chain(
                self.column_attributes()
                    .filter_map(|a| a.column_name().map(str::to_string)),
            )
            .collect()
    }
}

/// Read access to mapping metadata.
///
/// This is the narrow contract the unit-of-work engine consumes.
pub trait MetadataProvider: Send + Sync {
    /// Look up an entity descriptor by name.
    fn entity(&self, name: &str) -> Option<&EntityDescriptor>;

    /// Names of all mapped entities.
    fn entity_names(&self) -> Vec<&str>;

    /// Look up a registered named graph.
    fn named_graph(&self, name: &str) -> Option<&RootGraph>;

    /// Look up an entity descriptor, failing with `UnknownEntity`.
    fn descriptor(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Ordered non-identifier attributes of an entity.
    fn attributes_of(&self, entity: &str) -> Result<&[AttributeDescriptor]> {
        Ok(self.descriptor(entity)?.attributes())
    }

    /// Identifier attribute of an entity.
    fn identifier_of(&self, entity: &str) -> Result<&AttributeDescriptor> {
        Ok(self.descriptor(entity)?.identifier())
    }

    /// Cascade operations configured on an attribute.
    fn cascade_style_of(&self, entity: &str, attribute: &str) -> Result<CascadeStyle> {
        Ok(self
            .descriptor(entity)?
            .require_attribute(attribute)?
            .cascade_style())
    }
}

/// In-memory metadata registry.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: BTreeMap<String, EntityDescriptor>,
    graphs: BTreeMap<String, RootGraph>,
}

impl Metamodel {
    /// Start building a metamodel.
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Register a named graph.
    ///
    /// The stored copy is always immutable; the graph must be named and must
    /// apply to a mapped entity.
    pub fn register_graph(&mut self, graph: &RootGraph) -> Result<()> {
        let name = graph
            .name()
            .ok_or_else(|| Error::Mapping("only named graphs can be registered".to_string()))?
            .to_string();
        self.descriptor(graph.entity())?;
        if self.graphs.contains_key(&name) {
            return Err(Error::Mapping(format!("graph '{name}' is already registered")));
        }
        let stored = graph.make_immutable_copy(Some(&name));
        self.graphs.insert(name, stored);
        Ok(())
    }

    /// Registered graphs applying to `entity`.
    pub fn graphs_for(&self, entity: &str) -> Vec<&RootGraph> {
        self.graphs
            .values()
            .filter(|g| g.applies_to(entity))
            .collect()
    }
}

impl MetadataProvider for Metamodel {
    fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }

    fn named_graph(&self, name: &str) -> Option<&RootGraph> {
        self.graphs.get(name)
    }
}

/// Builder that validates cross-entity references.
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityDescriptor>,
}

impl MetamodelBuilder {
    /// Add an entity descriptor.
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Validate and build.
    ///
    /// Checks that names are unique, that association targets are mapped,
    /// that `mapped_by` names a to-one back-reference (or an owning join-table
    /// collection for inverse many-to-many), and that version attributes are
    /// integral. To-one attributes take on the target identifier's SQL type.
    pub fn build(self) -> Result<Metamodel> {
        let mut entities: BTreeMap<String, EntityDescriptor> = BTreeMap::new();
        for descriptor in self.entities {
            if entities.contains_key(descriptor.name()) {
                return Err(Error::Mapping(format!(
                    "entity '{}' is mapped twice",
                    descriptor.name()
                )));
            }
            entities.insert(descriptor.name().to_string(), descriptor);
        }

        let id_types: BTreeMap<String, SqlType> = entities
            .iter()
            .map(|(name, d)| (name.clone(), d.identifier().sql_type().clone()))
            .collect();

        for descriptor in entities.values() {
            validate_entity(descriptor, &entities)?;
        }

        for descriptor in entities.values_mut() {
            for attribute in &mut descriptor.attributes {
                if let AttributeKind::ToOne { target } = &attribute.kind {
                    if let Some(id_type) = id_types.get(target) {
                        attribute.sql_type = id_type.clone();
                    }
                }
            }
        }

        tracing::debug!(entities = entities.len(), "Metamodel built");
        Ok(Metamodel {
            entities,
            graphs: BTreeMap::new(),
        })
    }
}

fn validate_entity(
    descriptor: &EntityDescriptor,
    entities: &BTreeMap<String, EntityDescriptor>,
) -> Result<()> {
    let owner = descriptor.name();
    let mut seen = std::collections::HashSet::new();
    seen.insert(descriptor.identifier().name());

    for attribute in descriptor.attributes() {
        if !seen.insert(attribute.name()) {
            return Err(Error::Mapping(format!(
                "attribute '{}' is mapped twice on '{owner}'",
                attribute.name()
            )));
        }
        let Some(target) = attribute.target() else {
            continue;
        };
        let target_descriptor = entities.get(target).ok_or_else(|| {
            Error::Mapping(format!(
                "{owner}.{} targets unmapped entity '{target}'",
                attribute.name()
            ))
        })?;

        match attribute.collection_mapping() {
            Some(CollectionMapping::MappedBy(back)) => {
                let back_ref = target_descriptor.require_attribute(back)?;
                let points_back = matches!(
                    back_ref.kind(),
                    AttributeKind::ToOne { target } if target == owner
                );
                if !points_back {
                    return Err(Error::Mapping(format!(
                        "{owner}.{} is mapped by {target}.{back}, which is not a to-one reference to {owner}",
                        attribute.name()
                    )));
                }
            }
            Some(CollectionMapping::InverseOf(owning)) => {
                let owning_attr = target_descriptor.require_attribute(owning)?;
                let is_owning = matches!(
                    owning_attr.collection_mapping(),
                    Some(CollectionMapping::JoinTable(_))
                ) && owning_attr.target() == Some(owner);
                if !is_owning {
                    return Err(Error::Mapping(format!(
                        "{owner}.{} is the inverse of {target}.{owning}, which does not own a join table to {owner}",
                        attribute.name()
                    )));
                }
            }
            Some(CollectionMapping::JoinTable(_)) | None => {}
        }
    }

    if let Some(version) = descriptor.version_attribute() {
        if !version.is_basic() || !version.sql_type().is_integral() {
            return Err(Error::Mapping(format!(
                "version attribute {owner}.{} must be an integral basic attribute",
                version.name()
            )));
        }
    }
    Ok(())
}
