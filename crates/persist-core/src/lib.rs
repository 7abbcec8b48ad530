//! Core types and contracts for the persist unit-of-work engine.
//!
//! `persist-core` is the **vocabulary layer**. It defines what the session
//! engine talks about and who it talks to, without any session state:
//!
//! - `Value` and `SqlType` for column data and type-aware equality
//! - `Metamodel` and `MetadataProvider` for entity and attribute mappings
//! - `RootGraph` / `GraphNode` for entity graphs used as fetch and load plans
//! - `NavigableRole` for stable attribute paths
//! - `SqlExecutor` for the collaborator that runs loads and writes
//! - `SecondLevelCache` for the shared cache collaborator
//! - `Dialect` rendering for executors backed by a real database

pub mod cache;
pub mod error;
pub mod executor;
pub mod graph;
pub mod metadata;
pub mod naming;
pub mod navigable;
pub mod row;
pub mod sql;
pub mod types;
pub mod value;

pub use cache::{CacheStats, CachedState, InMemoryCache, SecondLevelCache};
pub use error::{Error, Result};
pub use executor::{
    LoadQuery, LoadRestriction, LockMode, OWNER_KEY_COLUMN, SqlExecutor, WriteKind, WriteStatement,
};
pub use graph::{AttributeNode, GraphNode, GraphSemantic, RootGraph};
pub use metadata::{
    AttributeDescriptor, AttributeKind, CascadeOp, CascadeStyle, CollectionMapping,
    EntityDescriptor, FetchType, IdGeneration, JoinTable, MetadataProvider, Metamodel,
    MetamodelBuilder,
};
pub use naming::{NamingContext, QualifiedTableName};
pub use navigable::{IDENTIFIER_MAPPER_PROPERTY, NavigableRole};
pub use row::{ColumnInfo, Row};
pub use sql::{Dialect, RenderedSql, render_load, render_write};
pub use types::SqlType;
pub use value::Value;
