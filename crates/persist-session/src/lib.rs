//! Persistence context for the persist unit-of-work engine.
//!
//! `persist-session` is the **unit-of-work layer**. A [`Session`] owns one
//! persistence context: the identity map of managed instances, their entity
//! entries, the placeholders it handed out, and the queue of writes a flush
//! sends to the [`SqlExecutor`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per `(entity type, id)`.
//! - **Load pipeline**: identity map, then second-level cache, then executor,
//!   with fetch graphs deciding what is loaded eagerly.
//! - **Proxies**: uninitialized placeholders initialized in place on first use.
//! - **Flush planning**: dirty checking against loaded state, then ordered
//!   inserts, updates, collection writes, and deletes.
//! - **Cascades**: persist, merge, remove, refresh, detach, and lock along
//!   associations, terminating on cyclic graphs.
//!
//! # Design Philosophy
//!
//! - **Explicit flush**: nothing is written until [`Session::flush`].
//! - **Single-threaded**: a session is used by one caller at a time; share
//!   the metadata and the second-level cache, not the session.
//! - **Fail closed**: once a flush fails the session refuses further work.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::new(metamodel), executor);
//!
//! let parent = session.find("Parent", 1)?.expect("row exists");
//! parent.set_value("name", "renamed")?;
//!
//! let child = EntityRef::new("Child").with_id(10).with_reference("parent", Some(&parent));
//! session.persist(&child)?;
//!
//! session.flush()?;
//! ```

pub mod action_queue;
pub mod cascade;
pub mod config;
pub mod entry;
pub mod fetch;
pub mod flush;
pub mod identity_map;
pub mod lazy_tracker;
pub mod listeners;
pub mod load;
pub mod proxy;

pub use action_queue::{
    Action, ActionKind, ActionQueue, ActionTarget, ColumnChange, FlushResult,
};
pub use cascade::{CascadeTarget, cascade};
pub use config::SessionConfig;
pub use entry::{EntityEntry, EntityStatus, LoadedState};
pub use fetch::{AttributeFetch, FetchDecision, FetchKind, FetchNode, FetchPlan};
pub use flush::{EntityOutcome, FlushPlan, OutcomeKind};
pub use identity_map::{EntityKey, IdentityMap};
pub use lazy_tracker::{LazyLoadStats, LazyLoadTracker};
pub use listeners::{
    EntityListener, FlushCallbacks, LifecycleEvent, ListenerLifecycle, ListenerRegistry,
    SessionEvent,
};
pub use load::{LoadOptions, LoadSource, LoadState, LoadTrace, LoadType};
pub use proxy::{AttributeValue, CollectionState, EntityData, EntityRef, LazyInitializer};

use persist_core::{
    CachedState, EntityDescriptor, Error, LockMode, MetadataProvider, NamingContext, NavigableRole,
    Result, Row, SecondLevelCache, SqlExecutor, Value,
};
use std::fmt;
use std::sync::Arc;

/// Counters kept by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Entity rows hydrated into new managed instances.
    pub entity_loads: u64,
    /// Rows served by the second-level cache.
    pub cache_hits: u64,
    /// Cache lookups that fell through to the executor.
    pub cache_misses: u64,
    /// Placeholders handed out.
    pub proxies_created: u64,
    /// Placeholders initialized on access.
    pub proxy_initializations: u64,
    /// Collections initialized.
    pub collection_loads: u64,
    /// Load round trips sent to the executor.
    pub queries_executed: u64,
    /// Successful flushes.
    pub flushes: u64,
    /// Writes executed by flushes.
    pub statements_executed: u64,
}

/// A unit of work over one [`SqlExecutor`].
pub struct Session<E: SqlExecutor> {
    metadata: Arc<dyn MetadataProvider>,
    executor: E,
    cache: Option<Arc<dyn SecondLevelCache>>,
    config: SessionConfig,
    identity_map: IdentityMap,
    listeners: ListenerRegistry,
    callbacks: FlushCallbacks,
    lazy_tracker: LazyLoadTracker,
    stats: SessionStatistics,
    /// Set when a flush failed; every later operation is refused.
    failed: bool,
    last_trace: Option<LoadTrace>,
    /// Instances hydrated by the current operation, awaiting `PostLoad`.
    pending_post_load: Vec<EntityRef>,
}

impl<E: SqlExecutor> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("managed", &self.identity_map.len())
            .field("proxies", &self.identity_map.proxy_count())
            .field("cache", &self.cache.is_some())
            .field("failed", &self.failed)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<E: SqlExecutor> Session<E> {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Open a session with the default configuration.
    pub fn new(metadata: Arc<dyn MetadataProvider>, executor: E) -> Self {
        Self::build(metadata, executor, SessionConfig::default())
    }

    /// Open a session with a validated configuration.
    pub fn with_config(
        metadata: Arc<dyn MetadataProvider>,
        executor: E,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(metadata, executor, config))
    }

    fn build(metadata: Arc<dyn MetadataProvider>, executor: E, config: SessionConfig) -> Self {
        tracing::debug!(
            batch_fetch_size = config.batch_fetch_size,
            write_batch_size = config.write_batch_size,
            "Opening session"
        );
        Self {
            metadata,
            executor,
            cache: None,
            lazy_tracker: LazyLoadTracker::new(config.lazy_load_warn_threshold),
            config,
            identity_map: IdentityMap::new(),
            listeners: ListenerRegistry::new(),
            callbacks: FlushCallbacks::default(),
            stats: SessionStatistics::default(),
            failed: false,
            last_trace: None,
            pending_post_load: Vec::new(),
        }
    }

    /// Attach a second-level cache shared with other sessions.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn SecondLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    /// Naming rules derived from the configured default catalog and schema.
    pub fn naming_context(&self) -> Result<NamingContext> {
        self.config.naming_context()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    /// Close the session, handing back the executor.
    pub fn into_executor(self) -> E {
        self.executor
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.stats
    }

    pub fn lazy_load_stats(&self) -> LazyLoadStats {
        self.lazy_tracker.stats()
    }

    /// Lazy initializations recorded for one association role, such as
    /// `Employee.manager`.
    pub fn lazy_loads_of(&self, role: &NavigableRole) -> usize {
        self.lazy_tracker.count_for(role)
    }

    /// Trace of the most recent single-entity load.
    pub fn last_load_trace(&self) -> Option<&LoadTrace> {
        self.last_trace.as_ref()
    }

    /// Whether a failed flush has made this session unusable.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether `instance` is managed by this session.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.identity_map.contains(instance)
    }

    /// The entry of a managed instance.
    pub fn entry(&self, instance: &EntityRef) -> Option<&EntityEntry> {
        self.identity_map.entry_for(instance)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a lifecycle listener for one entity type.
    pub fn register_listener<F, L>(&mut self, entity: &str, lifecycle: ListenerLifecycle, factory: F)
    where
        F: Fn() -> L + Send + 'static,
        L: EntityListener + 'static,
    {
        self.listeners.register(entity, lifecycle, factory);
    }

    /// Register a callback fired before each flush plans its work.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.register(SessionEvent::BeforeFlush, f);
    }

    /// Register a callback fired after each successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.register(SessionEvent::AfterFlush, f);
    }

    // ========================================================================
    // State Management
    // ========================================================================

    /// Mark a managed instance read-only (skipped by dirty checking) or
    /// modifiable again.
    ///
    /// Making an instance modifiable takes its current state as the new
    /// snapshot, so edits made while read-only are not written.
    pub fn set_read_only(&mut self, instance: &EntityRef, read_only: bool) -> Result<()> {
        self.ensure_usable()?;
        if self.identity_map.owns_proxy(instance) {
            self.initialize(instance)?;
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(instance.entity_name())?;
        let snapshot = if read_only {
            None
        } else {
            Some(current_snapshot(descriptor, instance))
        };
        let entry = self
            .identity_map
            .entry_for_mut(instance)
            .ok_or_else(|| not_managed("set_read_only", instance))?;
        match (entry.status(), read_only) {
            (EntityStatus::Deleted | EntityStatus::Gone | EntityStatus::Detached, _) => {
                Err(Error::InvalidState(format!(
                    "cannot change read-only mode of {} in state {:?}",
                    entry.key(),
                    entry.status()
                )))
            }
            (_, true) => {
                entry.set_status(EntityStatus::ReadOnly);
                Ok(())
            }
            (EntityStatus::ReadOnly, false) => {
                entry.set_status(EntityStatus::Managed);
                if entry.exists_in_database() {
                    if let Some(snapshot) = snapshot {
                        let version = entry.version().cloned();
                        entry.synchronize(snapshot, version);
                    }
                }
                Ok(())
            }
            (_, false) => Ok(()),
        }
    }

    /// Detach every instance and placeholder.
    ///
    /// Delayed listeners built during this unit of work are released and the
    /// lazy-load counters reset. A failed session stays failed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clear(&mut self) {
        let managed = self.identity_map.len();
        self.identity_map.clear();
        self.pending_post_load.clear();
        self.last_trace = None;
        self.lazy_tracker.reset();
        let released = self.listeners.release();
        tracing::debug!(managed, released, "Cleared persistence context");
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Plan the next flush without executing it.
    pub fn plan_flush(&self) -> Result<FlushPlan> {
        self.ensure_usable()?;
        flush::plan(&self.identity_map, self.metadata.as_ref())
    }

    /// Write every pending change to the executor.
    ///
    /// A failure while executing the writes (constraint violation, stale
    /// state, connectivity) or after them (a post-flush listener or callback)
    /// leaves the session unusable. Planning errors such as a transient
    /// reference leave it usable so the caller can fix the graph and retry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        self.ensure_usable()?;
        self.callbacks.fire(SessionEvent::BeforeFlush)?;

        let metadata = Arc::clone(&self.metadata);
        let mut plan = flush::plan(&self.identity_map, metadata.as_ref())?;

        // PreUpdate listeners may edit the instances they receive.
        let updated: Vec<EntityRef> = plan
            .outcomes_of(OutcomeKind::Updated)
            .map(|outcome| outcome.instance.clone())
            .filter(|instance| self.listeners.has_listeners(instance.entity_name()))
            .collect();
        if !updated.is_empty() {
            for instance in &updated {
                self.listeners.fire(LifecycleEvent::PreUpdate, instance)?;
            }
            plan = flush::plan(&self.identity_map, metadata.as_ref())?;
        }

        let (queue, outcomes) = plan.into_parts();
        let result = match queue.execute(&mut self.executor, self.config.write_batch_size) {
            Ok(result) => result,
            Err(error) => {
                self.failed = true;
                tracing::warn!(error = %error, "Flush failed; session is no longer usable");
                return Err(error);
            }
        };

        // The writes went out; from here on a failure leaves the instances
        // out of step with the database.
        self.stats.flushes += 1;
        self.stats.statements_executed += result.total() as u64;
        if let Err(error) = self
            .apply_outcomes(metadata.as_ref(), outcomes)
            .and_then(|()| self.callbacks.fire(SessionEvent::AfterFlush))
        {
            self.failed = true;
            tracing::warn!(error = %error, "Flush follow-up failed; session is no longer usable");
            return Err(error);
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            collection_actions = result.collection_actions,
            batches = result.batches,
            "Flush complete"
        );
        Ok(result)
    }

    fn apply_outcomes(
        &mut self,
        metadata: &dyn MetadataProvider,
        outcomes: Vec<EntityOutcome>,
    ) -> Result<()> {
        let mut events = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let instance = outcome.instance;
            let descriptor = metadata.descriptor(instance.entity_name())?;
            match outcome.kind {
                OutcomeKind::Deleted => {
                    instance.set_has_row(false);
                    if let Some(entry) = self.identity_map.remove(&instance) {
                        self.cache_invalidate(descriptor, entry.id());
                    }
                    events.push((LifecycleEvent::PostRemove, instance));
                }
                kind => {
                    let Some(entry) = self.identity_map.entry_for_mut(&instance) else {
                        continue;
                    };
                    if kind == OutcomeKind::Inserted {
                        instance.set_has_row(true);
                    }
                    if let Some(state) = outcome.loaded_state {
                        entry.synchronize(state, outcome.version.clone());
                    }
                    if entry.lock_mode().forces_version_increment() {
                        entry.set_lock_mode(LockMode::Optimistic);
                    }
                    for (attribute, ids) in outcome.collection_snapshots {
                        entry.set_collection_snapshot(&attribute, ids);
                    }
                    let id = entry.id().clone();
                    let cached = entry
                        .loaded_state()
                        .map(|state| cached_state(descriptor, &id, state, entry.version()));

                    if let (Some(attribute), Some(version)) =
                        (descriptor.version_attribute(), outcome.version)
                    {
                        instance.with_data_mut(|data| {
                            data.insert(attribute.name(), AttributeValue::Basic(version));
                        });
                    }
                    if kind != OutcomeKind::CollectionsChanged {
                        self.cache_invalidate(descriptor, &id);
                        if let Some(cached) = cached {
                            self.cache_put(descriptor, &id, &cached);
                        }
                    }
                    match kind {
                        OutcomeKind::Inserted => events.push((LifecycleEvent::PostPersist, instance)),
                        OutcomeKind::Updated => events.push((LifecycleEvent::PostUpdate, instance)),
                        _ => {}
                    }
                }
            }
        }
        for (event, instance) in events {
            self.listeners.fire(event, &instance)?;
        }
        Ok(())
    }

    // ========================================================================
    // Internal helpers shared by the load pipeline and cascades
    // ========================================================================

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.failed {
            Err(Error::UnitOfWorkFailed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn cache_for(&self, descriptor: &EntityDescriptor) -> Option<Arc<dyn SecondLevelCache>> {
        if !self.config.use_second_level_cache || !descriptor.is_cacheable() {
            return None;
        }
        self.cache.clone()
    }

    /// Cache failures never fail the unit of work; the row is simply not cached.
    pub(crate) fn cache_put(&self, descriptor: &EntityDescriptor, id: &Value, state: &CachedState) {
        if let Some(cache) = self.cache_for(descriptor) {
            if let Err(error) = cache.put(descriptor.name(), id, state) {
                tracing::warn!(entity = descriptor.name(), error = %error, "Cache put failed");
            }
        }
    }

    pub(crate) fn cache_invalidate(&self, descriptor: &EntityDescriptor, id: &Value) {
        if let Some(cache) = self.cache_for(descriptor) {
            if let Err(error) = cache.invalidate(descriptor.name(), id) {
                tracing::warn!(entity = descriptor.name(), error = %error, "Cache invalidation failed");
            }
        }
    }

    /// Deliver `PostLoad` to every instance hydrated by the current operation.
    pub(crate) fn fire_post_load(&mut self) -> Result<()> {
        let loaded = std::mem::take(&mut self.pending_post_load);
        for instance in &loaded {
            self.listeners.fire(LifecycleEvent::PostLoad, instance)?;
        }
        Ok(())
    }
}

impl<E: SqlExecutor> LazyInitializer for Session<E> {
    fn initialize_entity(&mut self, entity: &EntityRef) -> Result<()> {
        self.initialize(entity)
    }

    fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()> {
        Session::initialize_collection(self, owner, attribute)
    }
}

pub(crate) fn not_managed(operation: &str, instance: &EntityRef) -> Error {
    Error::InvalidState(format!(
        "{operation}: {} instance{} is not managed by this session",
        instance.entity_name(),
        instance.id().map(|id| format!(" #{id}")).unwrap_or_default()
    ))
}

/// The persistent state an instance holds right now, in loaded-state form.
fn current_snapshot(descriptor: &EntityDescriptor, instance: &EntityRef) -> LoadedState {
    let mut state = LoadedState::new();
    instance.with_data(|data| {
        for attribute in descriptor.column_attributes() {
            let value = match data.attribute(attribute.name()) {
                Some(AttributeValue::Basic(value)) => value.clone(),
                Some(AttributeValue::Reference(Some(target))) => target.id().unwrap_or(Value::Null),
                _ => Value::Null,
            };
            state.set(attribute.name(), value);
        }
    });
    state
}

/// Dehydrate a loaded state into the cache format.
pub(crate) fn cached_state(
    descriptor: &EntityDescriptor,
    id: &Value,
    state: &LoadedState,
    version: Option<&Value>,
) -> CachedState {
    let mut columns = vec![(descriptor.id_column().to_string(), id.clone())];
    for attribute in descriptor.column_attributes() {
        let value = state.get(attribute.name()).cloned().unwrap_or(Value::Null);
        columns.push((flush::column_of(attribute).to_string(), value));
    }
    CachedState::from_row(&Row::from_pairs(columns), version.cloned())
}
