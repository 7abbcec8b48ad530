//! Persist - a unit-of-work persistence engine.
//!
//! Persist tracks entity instances in a session and writes their changes in
//! one ordered flush:
//!
//! - One managed instance per `(entity type, id)` in each session
//! - Lazy placeholders and collections, initialized in place on first access
//! - Entity graphs as fetch or load plans
//! - Dirty checking against load-time snapshots, with optimistic versioning
//! - Inserts, updates, link writes, and deletes ordered by foreign keys
//! - Cascading persist, merge, remove, refresh, detach, and lock
//!
//! SQL is not rendered or run by the engine. A [`SqlExecutor`] receives
//! [`LoadQuery`] and [`WriteStatement`] values; [`memory::MemoryDatabase`]
//! is an in-memory implementation with key and foreign-key enforcement.
//!
//! # Quick Start
//!
//! ```ignore
//! use persist::prelude::*;
//! use std::sync::Arc;
//!
//! let metamodel = Arc::new(
//!     Metamodel::builder()
//!         .entity(
//!             EntityDescriptor::new("Team", "team", AttributeDescriptor::basic("id", SqlType::BigInt))
//!                 .attribute(AttributeDescriptor::basic("name", SqlType::Text))
//!                 .attribute(
//!                     AttributeDescriptor::one_to_many("players", "Player", "team")
//!                         .cascade(CascadeStyle::ALL),
//!                 ),
//!         )
//!         .entity(
//!             EntityDescriptor::new("Player", "player", AttributeDescriptor::basic("id", SqlType::BigInt))
//!                 .generated_id()
//!                 .attribute(AttributeDescriptor::to_one("team", "Team", "team_id")),
//!         )
//!         .build()?,
//! );
//!
//! let db = MemoryDatabase::new(metamodel.as_ref())?;
//! let factory = SessionFactory::builder(metamodel).build()?;
//! let mut session = factory.open(db.clone())?;
//!
//! let team = EntityRef::new("Team").with_id(1).with_value("name", "Rovers");
//! let player = EntityRef::new("Player").with_reference("team", Some(&team));
//! team.add_element("players", &player)?;
//!
//! session.persist(&team)?; // cascades to the player
//! session.flush()?;        // team row first, then the player
//! ```

pub mod factory;

pub use factory::{SessionFactory, SessionFactoryBuilder};

pub use persist_core::{
    AttributeDescriptor, AttributeKind, AttributeNode, CacheStats, CachedState, CascadeOp,
    CascadeStyle, CollectionMapping, Dialect, EntityDescriptor, Error, FetchType, GraphNode,
    GraphSemantic, IdGeneration, InMemoryCache, JoinTable, LoadQuery, LoadRestriction, LockMode,
    MetadataProvider, Metamodel, MetamodelBuilder, NamingContext, NavigableRole, OWNER_KEY_COLUMN,
    QualifiedTableName, RenderedSql, Result, RootGraph, Row, SecondLevelCache, SqlExecutor,
    SqlType, Value, WriteKind, WriteStatement, render_load, render_write,
};
pub use persist_session::{
    CascadeTarget, CollectionState, EntityEntry, EntityKey, EntityListener, EntityRef,
    EntityStatus, FetchDecision, FetchPlan, FlushPlan, FlushResult, IdentityMap, LazyInitializer,
    LazyLoadStats, LifecycleEvent, ListenerLifecycle, LoadOptions, LoadSource, LoadState,
    LoadTrace, LoadType, OutcomeKind, Session, SessionConfig, SessionEvent, SessionStatistics,
    cascade,
};

/// The in-memory executor.
pub mod memory {
    pub use persist_memory::{ForeignKey, MemoryDatabase, TableSchema, derive_schema};
}

/// Session internals: fetch plans, flush planning, and the action queue.
pub mod session {
    pub use persist_session::*;
}

/// Commonly used types.
pub mod prelude {
    pub use crate::memory::MemoryDatabase;
    pub use crate::{
        // Mapping
        AttributeDescriptor,
        CascadeOp,
        CascadeStyle,
        EntityDescriptor,
        // Instances
        EntityRef,
        // Errors
        Error,
        FetchType,
        // Graphs
        GraphSemantic,
        JoinTable,
        LifecycleEvent,
        // Loading
        LoadOptions,
        LoadType,
        LockMode,
        Metamodel,
        Result,
        RootGraph,
        // Sessions
        Session,
        SessionConfig,
        SessionFactory,
        SqlType,
        Value,
    };
}
