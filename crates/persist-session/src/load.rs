//! The load pipeline.
//!
//! Every load request is served in this order:
//!
//! 1. the identity map (a managed instance, or a placeholder already handed
//!    out for the key);
//! 2. a new placeholder, when the [`LoadType`] allows one and no lock is
//!    requested;
//! 3. the second-level cache, for cacheable entities read without a lock;
//! 4. the executor.
//!
//! Rows are hydrated into instances registered with the identity map, then
//! the eager associations of the resolved [`FetchPlan`] are loaded in
//! batches.

use crate::entry::{EntityEntry, EntityStatus, LoadedState};
use crate::fetch::{self, FetchKind, FetchNode, FetchPlan};
use crate::flush::column_of;
use crate::identity_map::EntityKey;
use crate::proxy::{AttributeValue, CollectionState, EntityData, EntityRef};
use crate::{Session, cached_state, not_managed};
use persist_core::{
    AttributeDescriptor, AttributeKind, CachedState, CollectionMapping, EntityDescriptor, Error,
    GraphSemantic, LoadQuery, LockMode, NavigableRole, OWNER_KEY_COLUMN, Result, RootGraph, Row,
    SqlExecutor, Value,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Load Types
// ============================================================================

/// Policy flags of one kind of load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadType {
    pub name: &'static str,
    /// A missing row yields `None` instead of `EntityNotFound`.
    pub allow_nulls: bool,
    /// A fetch graph may leave mapped-eager attributes unloaded.
    pub allow_partial: bool,
    /// An uninitialized placeholder may be returned.
    pub allow_proxy: bool,
    /// An instance marked deleted or gone counts as missing.
    pub check_deleted: bool,
    /// The result is always an initialized instance.
    pub bare: bool,
}

impl LoadType {
    /// Re-read state from the database, bypassing the cache.
    pub const RELOAD: LoadType = LoadType {
        name: "RELOAD",
        allow_nulls: false,
        allow_partial: true,
        allow_proxy: false,
        check_deleted: true,
        bare: false,
    };

    /// `find` semantics: an initialized instance or `None`.
    pub const GET: LoadType = LoadType {
        name: "GET",
        allow_nulls: true,
        allow_partial: true,
        allow_proxy: false,
        check_deleted: true,
        bare: false,
    };

    /// `get_reference` semantics: a placeholder is fine.
    pub const LOAD: LoadType = LoadType {
        name: "LOAD",
        allow_nulls: false,
        allow_partial: true,
        allow_proxy: true,
        check_deleted: true,
        bare: false,
    };

    /// Initialization of a placeholder.
    pub const IMMEDIATE_LOAD: LoadType = LoadType {
        name: "IMMEDIATE_LOAD",
        allow_nulls: true,
        allow_partial: false,
        allow_proxy: false,
        check_deleted: false,
        bare: true,
    };

    /// Engine-internal load of an eager association.
    pub const INTERNAL_LOAD_EAGER: LoadType = LoadType {
        name: "INTERNAL_LOAD_EAGER",
        allow_nulls: false,
        allow_partial: false,
        allow_proxy: false,
        check_deleted: false,
        bare: false,
    };

    /// Engine-internal load of a lazy association.
    pub const INTERNAL_LOAD_LAZY: LoadType = LoadType {
        name: "INTERNAL_LOAD_LAZY",
        allow_nulls: false,
        allow_partial: false,
        allow_proxy: true,
        check_deleted: false,
        bare: false,
    };

    /// Engine-internal load of an optional association.
    pub const INTERNAL_LOAD_NULLABLE: LoadType = LoadType {
        name: "INTERNAL_LOAD_NULLABLE",
        allow_nulls: true,
        allow_partial: false,
        allow_proxy: false,
        check_deleted: false,
        bare: false,
    };

    /// Every standard load type.
    pub const ALL: [&'static LoadType; 7] = [
        &LoadType::RELOAD,
        &LoadType::GET,
        &LoadType::LOAD,
        &LoadType::IMMEDIATE_LOAD,
        &LoadType::INTERNAL_LOAD_EAGER,
        &LoadType::INTERNAL_LOAD_LAZY,
        &LoadType::INTERNAL_LOAD_NULLABLE,
    ];

    fn is_reload(&self) -> bool {
        self.name == LoadType::RELOAD.name
    }

    /// Whether the request may be answered with a placeholder.
    fn may_return_proxy(&self, lock_mode: LockMode) -> bool {
        self.allow_proxy && !self.bare && lock_mode == LockMode::None
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Options of one load request.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    load_type: &'static LoadType,
    lock_mode: LockMode,
    graph: Option<RootGraph>,
    semantic: GraphSemantic,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new(&LoadType::GET)
    }
}

impl LoadOptions {
    pub fn new(load_type: &'static LoadType) -> Self {
        Self {
            load_type,
            lock_mode: LockMode::None,
            graph: None,
            semantic: GraphSemantic::Load,
        }
    }

    #[must_use]
    pub fn with_lock(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Apply `graph` as a fetch graph: attributes it does not name are lazy.
    #[must_use]
    pub fn fetch_graph(mut self, graph: RootGraph) -> Self {
        self.graph = Some(graph);
        self.semantic = GraphSemantic::Fetch;
        self
    }

    /// Apply `graph` as a load graph: attributes it does not name keep their
    /// mapping defaults.
    #[must_use]
    pub fn load_graph(mut self, graph: RootGraph) -> Self {
        self.graph = Some(graph);
        self.semantic = GraphSemantic::Load;
        self
    }

    /// Apply `graph` under the semantic named by a standard hint such as
    /// `jakarta.persistence.fetchgraph`.
    pub fn with_hint(mut self, hint: &str, graph: RootGraph) -> Result<Self> {
        let semantic = GraphSemantic::from_hint_name(hint)
            .ok_or_else(|| Error::Config(format!("unknown graph hint '{hint}'")))?;
        self.graph = Some(graph);
        self.semantic = semantic;
        Ok(self)
    }

    pub fn load_type(&self) -> &'static LoadType {
        self.load_type
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn graph(&self) -> Option<&RootGraph> {
        self.graph.as_ref()
    }

    /// The semantic applied. Load types that forbid partial loading always
    /// resolve under `Load`.
    pub fn semantic(&self) -> GraphSemantic {
        if self.load_type.allow_partial {
            self.semantic
        } else {
            GraphSemantic::Load
        }
    }
}

// ============================================================================
// Load Trace
// ============================================================================

/// Steps of one single-entity load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Requested,
    CacheChecked,
    Querying,
    Hydrating,
    EntryRegistered,
    Complete,
    Failed,
}

/// Where a load found its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    IdentityMap,
    Proxy,
    SecondLevelCache,
    Database,
    NotFound,
}

/// The steps a single-entity load went through.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTrace {
    key: EntityKey,
    load_type: &'static str,
    states: Vec<LoadState>,
    source: Option<LoadSource>,
}

impl LoadTrace {
    fn new(key: EntityKey, load_type: &LoadType) -> Self {
        Self {
            key,
            load_type: load_type.name,
            states: vec![LoadState::Requested],
            source: None,
        }
    }

    fn push(&mut self, state: LoadState) {
        self.states.push(state);
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn load_type(&self) -> &str {
        self.load_type
    }

    pub fn states(&self) -> &[LoadState] {
        &self.states
    }

    pub fn source(&self) -> Option<LoadSource> {
        self.source
    }

    /// The final state reached.
    pub fn outcome(&self) -> LoadState {
        self.states.last().copied().unwrap_or(LoadState::Requested)
    }
}

fn not_found(entity: &str, id: &Value) -> Error {
    Error::EntityNotFound {
        entity: entity.to_string(),
        id: id.clone(),
    }
}

/// Hydrated attribute values of one row, before registration.
struct Hydrated {
    key: EntityKey,
    data: EntityData,
    state: LoadedState,
    version: Option<Value>,
}

// ============================================================================
// Session Load Operations
// ============================================================================

impl<E: SqlExecutor> Session<E> {
    /// Load an initialized instance, or `None` if no row exists.
    pub fn find(&mut self, entity: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.load_with(entity, id, &LoadOptions::new(&LoadType::GET))
    }

    /// A reference to the instance with `id`, possibly an uninitialized
    /// placeholder. Existence is only checked when the placeholder is first
    /// used.
    pub fn get_reference(&mut self, entity: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let id = id.into();
        self.load_with(entity, id.clone(), &LoadOptions::new(&LoadType::LOAD))?
            .ok_or_else(|| not_found(entity, &id))
    }

    /// Load one instance under explicit options.
    #[tracing::instrument(level = "debug", skip(self, id, options), fields(load_type = options.load_type().name))]
    pub fn load_with(
        &mut self,
        entity: &str,
        id: impl Into<Value>,
        options: &LoadOptions,
    ) -> Result<Option<EntityRef>> {
        self.ensure_usable()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::InvalidState(format!("cannot load {entity} with a NULL identifier")));
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(entity)?;
        let key = EntityKey::new(entity, id);

        let mut trace = LoadTrace::new(key.clone(), options.load_type());
        let result = self.load_single(descriptor, &key, options, &mut trace);
        match &result {
            Ok(found) => {
                if found.is_none() {
                    trace.source = Some(LoadSource::NotFound);
                }
                trace.push(LoadState::Complete);
            }
            Err(error) => {
                tracing::debug!(key = %key, error = %error, "Load failed");
                trace.push(LoadState::Failed);
            }
        }
        self.last_trace = Some(trace);
        let found = result?;
        self.fire_post_load()?;
        Ok(found)
    }

    fn load_single(
        &mut self,
        descriptor: &EntityDescriptor,
        key: &EntityKey,
        options: &LoadOptions,
        trace: &mut LoadTrace,
    ) -> Result<Option<EntityRef>> {
        let load_type = options.load_type();
        let lock_mode = options.lock_mode();

        if let Some((instance, entry)) = self.identity_map.get(key) {
            let instance = instance.clone();
            let (status, held) = (entry.status(), entry.lock_mode());
            if load_type.check_deleted && status.is_deleted_or_gone() {
                tracing::debug!(key = %key, status = ?status, "Managed instance is removed");
                return self.missing(load_type, key);
            }
            trace.source = Some(LoadSource::IdentityMap);
            if load_type.is_reload() {
                trace.push(LoadState::Querying);
                self.reload(&instance, descriptor, lock_mode)?;
            } else if lock_mode.greater_than(held) {
                self.upgrade_lock(&instance, descriptor, lock_mode)?;
            }
            let plan = self.fetch_plan(descriptor.name(), options)?;
            self.fetch_eager(std::slice::from_ref(&instance), plan.root())?;
            return Ok(Some(instance));
        }

        let existing_proxy = self.identity_map.find_proxy(key).cloned();
        if load_type.may_return_proxy(lock_mode) {
            trace.source = Some(LoadSource::Proxy);
            if let Some(proxy) = existing_proxy {
                return Ok(Some(proxy));
            }
            let proxy = EntityRef::proxy(key.entity(), key.id().clone());
            self.identity_map.register_proxy(&proxy);
            self.stats.proxies_created += 1;
            tracing::trace!(key = %key, "Handed out placeholder");
            return Ok(Some(proxy));
        }

        let plan = self.fetch_plan(descriptor.name(), options)?;
        let Some(row) = self.fetch_row(descriptor, key, load_type, lock_mode, &plan, trace)? else {
            return self.missing(load_type, key);
        };
        let instance = self.hydrate_row(descriptor, &row, lock_mode, Some(trace))?;
        if existing_proxy.is_some() {
            self.stats.proxy_initializations += 1;
        }
        self.fetch_eager(std::slice::from_ref(&instance), plan.root())?;
        Ok(Some(instance))
    }

    fn missing(&self, load_type: &LoadType, key: &EntityKey) -> Result<Option<EntityRef>> {
        if load_type.allow_nulls {
            Ok(None)
        } else {
            Err(not_found(key.entity(), key.id()))
        }
    }

    /// Load several instances of one type, preserving request order.
    ///
    /// Identifiers without a row are omitted. Instances already managed and
    /// cached rows are used first; the remaining identifiers are read in
    /// batches of `batch_fetch_size`. One fetch plan applies to every
    /// returned instance.
    #[tracing::instrument(level = "debug", skip(self, ids, options))]
    pub fn multi_load<I>(&mut self, entity: &str, ids: I, options: &LoadOptions) -> Result<Vec<EntityRef>>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.ensure_usable()?;
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(entity)?;
        let load_type = options.load_type();
        let lock_mode = options.lock_mode();
        let plan = self.fetch_plan(entity, options)?;
        let cache = if load_type.is_reload() || lock_mode.bypasses_cache() {
            None
        } else {
            self.cache_for(descriptor)
        };

        let keys: Vec<EntityKey> = ids
            .into_iter()
            .map(|id| EntityKey::new(entity, id.into()))
            .collect();
        let mut resolved: Vec<Option<EntityRef>> = vec![None; keys.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (position, key) in keys.iter().enumerate() {
            if let Some((instance, entry)) = self.identity_map.get(key) {
                if !(load_type.check_deleted && entry.status().is_deleted_or_gone()) {
                    resolved[position] = Some(instance.clone());
                }
                continue;
            }
            if let Some(cache) = &cache {
                if let Some(cached) = cache.get(entity, key.id())? {
                    self.stats.cache_hits += 1;
                    let instance = self.hydrate_row(descriptor, &cached.to_row(), lock_mode, None)?;
                    resolved[position] = Some(instance);
                    continue;
                }
                self.stats.cache_misses += 1;
            }
            misses.push(position);
        }

        for chunk in misses.chunks(self.config.batch_fetch_size) {
            let mut positions: HashMap<&EntityKey, Vec<usize>> = HashMap::new();
            let mut ids = Vec::with_capacity(chunk.len());
            for &position in chunk {
                let key = &keys[position];
                let slots = positions.entry(key).or_default();
                if slots.is_empty() {
                    ids.push(key.id().clone());
                }
                slots.push(position);
            }
            let query = LoadQuery::by_ids(descriptor, ids)
                .with_lock(lock_mode)
                .with_eager_paths(plan.eager_paths());
            let rows = self.run_load(&query)?;
            tracing::debug!(entity, requested = positions.len(), found = rows.len(), "Batch load");

            let mut seen = HashSet::new();
            for row in &rows {
                let instance = self.hydrate_row(descriptor, row, lock_mode, None)?;
                let Some(key) = instance.key() else { continue };
                if !seen.insert(key.clone()) {
                    return Err(Error::hydration(entity, format!("more than one row for id {}", key.id())));
                }
                self.cache_row(descriptor, row);
                for &position in positions.get(&key).into_iter().flatten() {
                    resolved[position] = Some(instance.clone());
                }
            }
        }

        let instances: Vec<EntityRef> = resolved.into_iter().flatten().collect();
        self.fetch_eager(&instances, plan.root())?;
        self.fire_post_load()?;
        Ok(instances)
    }

    /// Initialize a placeholder handed out by this session.
    ///
    /// Placeholders of other sessions (or of a cleared one) fail with
    /// `LazyInitialization`. A placeholder whose row is gone fails with
    /// `EntityNotFound`.
    pub fn initialize(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        if instance.is_initialized() {
            return Ok(());
        }
        let Some(key) = instance.key() else {
            return Err(not_managed("initialize", instance));
        };
        if !self.identity_map.owns_proxy(instance) {
            return Err(Error::LazyInitialization {
                entity: key.entity().to_string(),
                id: key.id().clone(),
            });
        }
        // Placeholders from `get_reference` have no owning association.
        let role = self
            .identity_map
            .proxy_role(&key)
            .cloned()
            .unwrap_or_else(|| NavigableRole::new(key.entity()));
        let loaded = self.load_with(
            key.entity(),
            key.id().clone(),
            &LoadOptions::new(&LoadType::IMMEDIATE_LOAD),
        )?;
        if loaded.is_none() {
            return Err(not_found(key.entity(), key.id()));
        }
        self.lazy_tracker.record(&role);
        Ok(())
    }

    /// Initialize a lazy collection of a managed instance.
    pub fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()> {
        self.ensure_usable()?;
        if self.identity_map.owns_proxy(owner) {
            self.initialize(owner)?;
        }
        if !self.identity_map.contains(owner) {
            let id = owner.id().unwrap_or(Value::Null);
            return Err(Error::LazyInitialization {
                entity: owner.entity_name().to_string(),
                id,
            });
        }
        if owner.is_attribute_initialized(attribute) {
            return Ok(());
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(owner.entity_name())?;
        let mapping = descriptor.require_attribute(attribute)?;
        if !mapping.is_collection() {
            return Err(Error::Mapping(format!(
                "{}.{attribute} is not a collection",
                descriptor.name()
            )));
        }
        self.load_collections(descriptor, mapping, std::slice::from_ref(owner))?;
        self.lazy_tracker
            .record(&NavigableRole::new(descriptor.name()).append(attribute));
        self.fire_post_load()
    }

    // ========================================================================
    // Pipeline Steps
    // ========================================================================

    pub(crate) fn fetch_plan(&self, entity: &str, options: &LoadOptions) -> Result<FetchPlan> {
        fetch::resolve(self.metadata.as_ref(), entity, options.graph(), options.semantic())
    }

    fn run_load(&mut self, query: &LoadQuery) -> Result<Vec<Row>> {
        self.stats.queries_executed += 1;
        tracing::trace!(entity = %query.entity, keys = query.keys.len(), "Executing load");
        self.executor.execute_load(query)
    }

    /// Read the row for `key` from the cache or the executor.
    fn fetch_row(
        &mut self,
        descriptor: &EntityDescriptor,
        key: &EntityKey,
        load_type: &LoadType,
        lock_mode: LockMode,
        plan: &FetchPlan,
        trace: &mut LoadTrace,
    ) -> Result<Option<Row>> {
        trace.push(LoadState::CacheChecked);
        if !load_type.is_reload() && !lock_mode.bypasses_cache() {
            if let Some(cache) = self.cache_for(descriptor) {
                if let Some(cached) = cache.get(descriptor.name(), key.id())? {
                    self.stats.cache_hits += 1;
                    trace.source = Some(LoadSource::SecondLevelCache);
                    return Ok(Some(cached.to_row()));
                }
                self.stats.cache_misses += 1;
            }
        }

        trace.push(LoadState::Querying);
        let query = LoadQuery::by_ids(descriptor, vec![key.id().clone()])
            .with_lock(lock_mode)
            .with_eager_paths(plan.eager_paths());
        let mut rows = self.run_load(&query)?;
        if rows.len() > 1 {
            return Err(Error::hydration(
                descriptor.name(),
                format!("{} rows returned for id {}", rows.len(), key.id()),
            ));
        }
        let row = rows.pop();
        if let Some(row) = &row {
            trace.source = Some(LoadSource::Database);
            self.cache_row(descriptor, row);
        }
        Ok(row)
    }

    fn cache_row(&self, descriptor: &EntityDescriptor, row: &Row) {
        if self.cache_for(descriptor).is_none() {
            return;
        }
        let Some(id) = row.get_by_name(descriptor.id_column()) else {
            return;
        };
        let version = descriptor
            .version_attribute()
            .and_then(|attribute| row.get_by_name(column_of(attribute)))
            .cloned();
        self.cache_put(descriptor, id, &CachedState::from_row(row, version));
    }

    /// Convert a row into attribute values and a loaded-state snapshot.
    fn read_row(&mut self, descriptor: &EntityDescriptor, row: &Row) -> Result<Hydrated> {
        let entity = descriptor.name();
        let column = |name: &str| {
            row.get_by_name(name)
                .ok_or_else(|| Error::hydration(entity, format!("column '{name}' missing from row")))
        };
        let checked = |attribute: &AttributeDescriptor, value: &Value| {
            if attribute.sql_type().accepts(value) {
                Ok(())
            } else {
                Err(Error::hydration(
                    entity,
                    format!(
                        "column '{}' holds {value:?}, expected {:?}",
                        column_of(attribute),
                        attribute.sql_type()
                    ),
                ))
            }
        };

        let id = column(descriptor.id_column())?;
        checked(descriptor.identifier(), id)?;
        if id.is_null() {
            return Err(Error::hydration(entity, "identifier column is NULL"));
        }
        let key = EntityKey::new(entity, id.clone());
        let mut data = EntityData::new(Some(id.clone()));
        let mut state = LoadedState::new();

        for attribute in descriptor.attributes() {
            match attribute.kind() {
                AttributeKind::Basic => {
                    let value = column(column_of(attribute))?;
                    checked(attribute, value)?;
                    data.insert(attribute.name(), AttributeValue::Basic(value.clone()));
                    state.set(attribute.name(), value.clone());
                }
                AttributeKind::ToOne { target } => {
                    let value = column(column_of(attribute))?;
                    checked(attribute, value)?;
                    let reference = if value.is_null() {
                        None
                    } else {
                        let role = NavigableRole::new(entity).append(attribute.name());
                        Some(self.reference_to(target, value.clone(), role))
                    };
                    data.insert(attribute.name(), AttributeValue::Reference(reference));
                    state.set(attribute.name(), value.clone());
                }
                AttributeKind::Collection { .. } => {
                    data.insert(
                        attribute.name(),
                        AttributeValue::Collection(CollectionState::Uninitialized),
                    );
                }
            }
        }
        let version = descriptor
            .version_attribute()
            .and_then(|attribute| state.get(attribute.name()))
            .cloned();
        Ok(Hydrated {
            key,
            data,
            state,
            version,
        })
    }

    /// The instance a foreign key points at: the managed instance, the
    /// placeholder already handed out, or a new placeholder reached through
    /// `role`.
    fn reference_to(&mut self, target: &str, id: Value, role: NavigableRole) -> EntityRef {
        let key = EntityKey::new(target, id);
        if let Some(instance) = self.identity_map.find(&key) {
            return instance.clone();
        }
        let proxy = match self.identity_map.find_proxy(&key) {
            Some(proxy) => proxy.clone(),
            None => {
                let proxy = EntityRef::proxy(target, key.id().clone());
                self.identity_map.register_proxy(&proxy);
                self.stats.proxies_created += 1;
                proxy
            }
        };
        self.identity_map.note_proxy_role(&key, role);
        proxy
    }

    /// Hydrate `row` into the managed instance for its key.
    ///
    /// An instance already managed keeps its in-memory state. A placeholder
    /// handed out for the key is initialized in place.
    fn hydrate_row(
        &mut self,
        descriptor: &EntityDescriptor,
        row: &Row,
        lock_mode: LockMode,
        trace: Option<&mut LoadTrace>,
    ) -> Result<EntityRef> {
        let mut trace = trace;
        if let Some(trace) = trace.as_deref_mut() {
            trace.push(LoadState::Hydrating);
        }
        let id = row
            .get_by_name(descriptor.id_column())
            .ok_or_else(|| Error::hydration(descriptor.name(), "identifier column missing from row"))?;
        let key = EntityKey::new(descriptor.name(), id.clone());
        if let Some(existing) = self.identity_map.find(&key) {
            return Ok(existing.clone());
        }

        let hydrated = self.read_row(descriptor, row)?;
        let instance = match self.identity_map.find_proxy(&hydrated.key) {
            Some(proxy) => proxy.clone(),
            None => EntityRef::new(descriptor.name()),
        };
        instance.hydrate(hydrated.data);

        let mut entry = EntityEntry::loaded(hydrated.key, hydrated.state, hydrated.version, lock_mode);
        if self.config.default_read_only {
            entry.set_status(EntityStatus::ReadOnly);
        }
        self.identity_map.register(&instance, entry)?;
        if let Some(trace) = trace {
            trace.push(LoadState::EntryRegistered);
        }
        self.stats.entity_loads += 1;
        self.pending_post_load.push(instance.clone());
        Ok(instance)
    }

    /// Load the eager associations of `node` for every instance, then
    /// descend into the expanded targets.
    fn fetch_eager(&mut self, instances: &[EntityRef], node: &FetchNode) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(node.entity())?;

        for fetch in node.eager_associations() {
            let mapping = descriptor.require_attribute(fetch.name())?;
            let targets = match fetch.kind() {
                FetchKind::ToOne { target } => {
                    let mut targets: Vec<EntityRef> = Vec::new();
                    for instance in instances {
                        if let Ok(Some(reference)) = instance.reference(fetch.name()) {
                            if !targets.contains(&reference) {
                                targets.push(reference);
                            }
                        }
                    }
                    let pending: Vec<EntityRef> = targets
                        .iter()
                        .filter(|t| !t.is_initialized())
                        .cloned()
                        .collect();
                    self.initialize_batch(target, &pending)?;
                    targets
                }
                FetchKind::Collection { .. } => {
                    let owners: Vec<EntityRef> = instances
                        .iter()
                        .filter(|i| i.is_initialized() && !i.is_attribute_initialized(fetch.name()))
                        .cloned()
                        .collect();
                    self.load_collections(descriptor, mapping, &owners)?;
                    let mut targets: Vec<EntityRef> = Vec::new();
                    for instance in instances {
                        for element in instance.elements(fetch.name()).unwrap_or_default() {
                            if !targets.contains(&element) {
                                targets.push(element);
                            }
                        }
                    }
                    targets
                }
                FetchKind::Identifier | FetchKind::Basic => continue,
            };
            if let Some(child) = fetch.child() {
                let initialized: Vec<EntityRef> =
                    targets.into_iter().filter(EntityRef::is_initialized).collect();
                self.fetch_eager(&initialized, child)?;
            }
        }
        Ok(())
    }

    /// Initialize placeholders of one type in batches.
    fn initialize_batch(&mut self, entity: &str, proxies: &[EntityRef]) -> Result<()> {
        if proxies.is_empty() {
            return Ok(());
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(entity)?;
        let cache = self.cache_for(descriptor);

        let mut pending = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            let Some(id) = proxy.id() else { continue };
            if let Some(cache) = &cache {
                if let Some(cached) = cache.get(entity, &id)? {
                    self.stats.cache_hits += 1;
                    self.hydrate_row(descriptor, &cached.to_row(), LockMode::None, None)?;
                    self.stats.proxy_initializations += 1;
                    continue;
                }
                self.stats.cache_misses += 1;
            }
            pending.push(id);
        }

        let mut found = HashSet::new();
        for ids in pending.chunks(self.config.batch_fetch_size) {
            let rows = self.run_load(&LoadQuery::by_ids(descriptor, ids.to_vec()))?;
            for row in &rows {
                let instance = self.hydrate_row(descriptor, row, LockMode::None, None)?;
                found.extend(instance.key());
                self.cache_row(descriptor, row);
                self.stats.proxy_initializations += 1;
            }
        }

        // Eager targets are required: a foreign key without its row is an error.
        if let Some(id) = pending
            .into_iter()
            .find(|id| !found.contains(&EntityKey::new(entity, id.clone())))
        {
            tracing::debug!(entity, id = %id, "Eager association points at a missing row");
            return Err(not_found(entity, &id));
        }
        Ok(())
    }

    /// Initialize one collection attribute on each owner, in batches.
    pub(crate) fn load_collections(
        &mut self,
        owner_descriptor: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        owners: &[EntityRef],
    ) -> Result<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let (Some(target), Some(mapping)) = (attribute.target(), attribute.collection_mapping())
        else {
            return Err(Error::Mapping(format!(
                "{}.{} is not a collection",
                owner_descriptor.name(),
                attribute.name()
            )));
        };
        let metadata = Arc::clone(&self.metadata);
        let target_descriptor = metadata.descriptor(target)?;
        let owning_join = matches!(mapping, CollectionMapping::JoinTable(_));

        for chunk in owners.chunks(self.config.batch_fetch_size) {
            let keys: Vec<Value> = chunk.iter().filter_map(EntityRef::id).collect();
            let (query, owner_column) = match mapping {
                CollectionMapping::MappedBy(back) => {
                    let back = target_descriptor.require_attribute(back)?;
                    let column = column_of(back).to_string();
                    (
                        LoadQuery::by_column(target_descriptor, column.clone(), keys),
                        column,
                    )
                }
                CollectionMapping::JoinTable(join) => (
                    LoadQuery::through_join_table(target_descriptor, join.clone(), keys),
                    OWNER_KEY_COLUMN.to_string(),
                ),
                CollectionMapping::InverseOf(owning) => {
                    let owning = target_descriptor.require_attribute(owning)?;
                    let Some(CollectionMapping::JoinTable(join)) = owning.collection_mapping() else {
                        return Err(Error::Mapping(format!(
                            "{target}.{} does not own a join table",
                            owning.name()
                        )));
                    };
                    (
                        LoadQuery::through_join_table(target_descriptor, join.inverted(), keys),
                        OWNER_KEY_COLUMN.to_string(),
                    )
                }
            };
            let rows = self.run_load(&query)?;

            let mut grouped: HashMap<EntityKey, Vec<EntityRef>> = HashMap::new();
            for row in &rows {
                let owner_id = row.get_by_name(&owner_column).ok_or_else(|| {
                    Error::hydration(target, format!("column '{owner_column}' missing from row"))
                })?;
                let element = self.hydrate_row(target_descriptor, row, LockMode::None, None)?;
                let elements = grouped
                    .entry(EntityKey::new(owner_descriptor.name(), owner_id.clone()))
                    .or_default();
                if !elements.contains(&element) {
                    elements.push(element);
                }
            }

            for owner in chunk {
                let Some(key) = owner.key() else { continue };
                let elements = grouped.remove(&key).unwrap_or_default();
                let snapshot: Vec<Value> = elements.iter().filter_map(EntityRef::id).collect();
                owner.set_collection_state(attribute.name(), CollectionState::Initialized(elements));
                if owning_join {
                    if let Some(entry) = self.identity_map.entry_for_mut(owner) {
                        entry.set_collection_snapshot(attribute.name(), snapshot);
                    }
                }
                self.stats.collection_loads += 1;
            }
            tracing::debug!(
                role = %NavigableRole::new(owner_descriptor.name()).append(attribute.name()),
                owners = chunk.len(),
                rows = rows.len(),
                "Loaded collections"
            );
        }
        Ok(())
    }

    /// Re-read a managed instance's row, discarding in-memory changes.
    ///
    /// A missing row marks the entry gone.
    pub(crate) fn reload(
        &mut self,
        instance: &EntityRef,
        descriptor: &EntityDescriptor,
        lock_mode: LockMode,
    ) -> Result<()> {
        let Some(key) = instance.key() else {
            return Err(not_managed("refresh", instance));
        };
        let query = LoadQuery::by_ids(descriptor, vec![key.id().clone()]).with_lock(lock_mode);
        let mut rows = self.run_load(&query)?;
        if rows.len() > 1 {
            return Err(Error::hydration(
                descriptor.name(),
                format!("{} rows returned for id {}", rows.len(), key.id()),
            ));
        }
        let Some(row) = rows.pop() else {
            if let Some(entry) = self.identity_map.entry_for_mut(instance) {
                entry.set_status(EntityStatus::Gone);
            }
            self.cache_invalidate(descriptor, key.id());
            tracing::debug!(key = %key, "Row is gone");
            return Err(not_found(key.entity(), key.id()));
        };

        let hydrated = self.read_row(descriptor, &row)?;
        instance.hydrate(hydrated.data);
        let entry = self
            .identity_map
            .entry_for_mut(instance)
            .ok_or_else(|| not_managed("refresh", instance))?;
        entry.synchronize(hydrated.state, hydrated.version);
        entry.clear_collection_snapshots();
        if lock_mode.greater_than(entry.lock_mode()) {
            entry.set_lock_mode(lock_mode);
        }
        let cached = entry
            .loaded_state()
            .map(|state| cached_state(descriptor, key.id(), state, entry.version()));
        if let Some(cached) = cached {
            self.cache_invalidate(descriptor, key.id());
            self.cache_put(descriptor, key.id(), &cached);
        }
        self.pending_post_load.push(instance.clone());
        tracing::debug!(key = %key, "Reloaded instance");
        Ok(())
    }

    /// Raise the lock held on a managed instance.
    ///
    /// `Read` and pessimistic modes re-read the row and verify the version;
    /// optimistic modes are checked at flush.
    pub(crate) fn upgrade_lock(
        &mut self,
        instance: &EntityRef,
        descriptor: &EntityDescriptor,
        lock_mode: LockMode,
    ) -> Result<()> {
        let Some(entry) = self.identity_map.entry_for(instance) else {
            return Err(not_managed("lock", instance));
        };
        if !lock_mode.greater_than(entry.lock_mode()) {
            return Ok(());
        }
        let key = entry.key().clone();
        let expected = entry.version().cloned();
        let exists = entry.exists_in_database();

        if exists && (lock_mode == LockMode::Read || lock_mode.is_pessimistic()) {
            let query = LoadQuery::by_ids(descriptor, vec![key.id().clone()]).with_lock(lock_mode);
            let rows = self.run_load(&query)?;
            let Some(row) = rows.first() else {
                if let Some(entry) = self.identity_map.entry_for_mut(instance) {
                    entry.set_status(EntityStatus::Gone);
                }
                return Err(not_found(key.entity(), key.id()));
            };
            if let Some(attribute) = descriptor.version_attribute() {
                let current = row.get_by_name(column_of(attribute));
                let matches = match (current, &expected) {
                    (Some(current), Some(expected)) => attribute.sql_type().is_equal(current, expected),
                    _ => true,
                };
                if !matches {
                    return Err(Error::StaleState {
                        entity: key.entity().to_string(),
                        id: key.id().clone(),
                        expected_version: expected,
                    });
                }
            }
        }
        if let Some(entry) = self.identity_map.entry_for_mut(instance) {
            entry.set_lock_mode(lock_mode);
        }
        tracing::debug!(key = %key, lock_mode = ?lock_mode, "Lock upgraded");
        Ok(())
    }
}
