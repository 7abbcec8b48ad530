//! Dirty checking and flush planning.
//!
//! [`plan`] inspects every entry of an identity map and produces an
//! [`ActionQueue`] in dependency order, plus the [`EntityOutcome`]s the
//! session applies to its entries once the queue has executed:
//!
//! 1. inserts, FK targets before referencing rows (ties keep registration
//!    order), followed by fix-up updates for foreign keys nulled to break a
//!    cycle;
//! 2. updates of existing rows, in registration order, touching only the
//!    changed columns;
//! 3. join-table link deletes, then link inserts;
//! 4. foreign keys nulled to break a delete cycle, then deletes, referencing
//!    rows before the rows they reference.
//!
//! Planning never touches the executor, so a plan can be inspected as a dry
//! run.

use crate::action_queue::{Action, ActionKind, ActionQueue, ActionTarget, ColumnChange};
use crate::entry::{EntityEntry, EntityStatus, LoadedState};
use crate::identity_map::{EntityKey, IdentityMap};
use crate::proxy::EntityRef;
use persist_core::{
    AttributeDescriptor, CollectionMapping, EntityDescriptor, Error, MetadataProvider,
    NavigableRole, Result, SqlType, Value, WriteStatement,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// What a flush does to one managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Inserted,
    Updated,
    /// Only join-table links of the instance changed.
    CollectionsChanged,
    Deleted,
}

/// State to record for one instance after the queue executes.
#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub instance: EntityRef,
    pub kind: OutcomeKind,
    /// New snapshot for inserted and updated rows.
    pub loaded_state: Option<LoadedState>,
    pub version: Option<Value>,
    /// New element-id snapshots of owning join-table collections.
    pub collection_snapshots: Vec<(String, Vec<Value>)>,
}

/// Ordered actions plus post-flush bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    queue: ActionQueue,
    outcomes: Vec<EntityOutcome>,
}

impl FlushPlan {
    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn outcomes(&self) -> &[EntityOutcome] {
        &self.outcomes
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Outcomes of `kind`.
    pub fn outcomes_of(&self, kind: OutcomeKind) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(move |o| o.kind == kind)
    }

    pub fn into_parts(self) -> (ActionQueue, Vec<EntityOutcome>) {
        (self.queue, self.outcomes)
    }
}

/// Version written by the first insert of a versioned entity.
pub(crate) fn initial_version(sql_type: &SqlType) -> Value {
    match sql_type {
        SqlType::SmallInt => Value::SmallInt(0),
        SqlType::Integer => Value::Int(0),
        _ => Value::BigInt(0),
    }
}

/// The version following `current`, keeping its integer width.
pub(crate) fn next_version(current: Option<&Value>) -> Value {
    match current {
        Some(Value::SmallInt(v)) => Value::SmallInt(v.wrapping_add(1)),
        Some(Value::Int(v)) => Value::Int(v.wrapping_add(1)),
        Some(other) => other
            .as_i64()
            .map_or(Value::BigInt(0), |v| Value::BigInt(v.wrapping_add(1))),
        None => Value::BigInt(0),
    }
}

pub(crate) fn column_of(attribute: &AttributeDescriptor) -> &str {
    attribute.column_name().unwrap_or(attribute.name())
}

/// Current value of one column-backed attribute.
struct ColumnValue<'a> {
    attribute: &'a AttributeDescriptor,
    value: Value,
    /// Key of the referenced instance for to-one attributes.
    target: Option<EntityKey>,
}

/// A managed instance headed for an insert or an update.
struct Candidate<'a> {
    instance: &'a EntityRef,
    entry: &'a EntityEntry,
    descriptor: &'a EntityDescriptor,
    columns: Vec<ColumnValue<'a>>,
}

/// A managed instance headed for a delete.
struct Doomed<'a> {
    instance: &'a EntityRef,
    entry: &'a EntityEntry,
    descriptor: &'a EntityDescriptor,
    /// Foreign keys as last synchronized: attribute and referenced key.
    references: Vec<(&'a AttributeDescriptor, EntityKey)>,
}

/// Key written for an association target.
///
/// Targets managed here, placeholders, and detached instances that still
/// stand for a row all resolve to their key. Anything else was never saved.
fn known_target(
    map: &IdentityMap,
    owner: &EntityDescriptor,
    attribute: &AttributeDescriptor,
    target: &EntityRef,
) -> Result<EntityKey> {
    let transient = || Error::TransientReference {
        entity: owner.name().to_string(),
        attribute: attribute.name().to_string(),
        target: target.entity_name().to_string(),
    };
    if !map.contains(target) && !map.owns_proxy(target) && !target.has_row() {
        return Err(transient());
    }
    target.key().ok_or_else(transient)
}

fn current_columns<'a>(
    map: &IdentityMap,
    descriptor: &'a EntityDescriptor,
    instance: &EntityRef,
) -> Result<Vec<ColumnValue<'a>>> {
    let mut columns = Vec::new();
    for attribute in descriptor.column_attributes() {
        // Attributes never assigned are written as NULL.
        let assigned = instance
            .with_data(|d| d.attribute(attribute.name()).is_some())
            .unwrap_or(true);
        let (value, target) = if !assigned {
            (Value::Null, None)
        } else if attribute.is_to_one() {
            match instance.reference(attribute.name())? {
                None => (Value::Null, None),
                Some(target) => {
                    let key = known_target(map, descriptor, attribute, &target)?;
                    (key.id().clone(), Some(key))
                }
            }
        } else {
            (instance.value(attribute.name())?, None)
        };
        columns.push(ColumnValue {
            attribute,
            value,
            target,
        });
    }
    Ok(columns)
}

fn snapshot_references<'a>(
    descriptor: &'a EntityDescriptor,
    entry: &EntityEntry,
) -> Vec<(&'a AttributeDescriptor, EntityKey)> {
    let Some(state) = entry.loaded_state() else {
        return Vec::new();
    };
    descriptor
        .column_attributes()
        .filter_map(|attribute| {
            let target = attribute.target()?;
            let value = state.get(attribute.name())?;
            if value.is_null() {
                return None;
            }
            Some((attribute, EntityKey::new(target, value.clone())))
        })
        .collect()
}

/// Build the flush plan for every entry of `map`.
#[tracing::instrument(level = "debug", skip(map, metadata))]
pub fn plan(map: &IdentityMap, metadata: &dyn MetadataProvider) -> Result<FlushPlan> {
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();

    for (instance, entry) in map.iter_ordered() {
        let descriptor = metadata.descriptor(instance.entity_name())?;
        match entry.status() {
            EntityStatus::Managed => {
                let candidate = Candidate {
                    instance,
                    entry,
                    descriptor,
                    columns: current_columns(map, descriptor, instance)?,
                };
                if entry.exists_in_database() {
                    updates.push(candidate);
                } else {
                    inserts.push(candidate);
                }
            }
            EntityStatus::Deleted if entry.exists_in_database() => deletes.push(Doomed {
                instance,
                entry,
                descriptor,
                references: snapshot_references(descriptor, entry),
            }),
            _ => {}
        }
    }

    let mut builder = PlanBuilder::default();
    builder.plan_inserts(&inserts)?;
    builder.plan_updates(&updates);
    builder.plan_collections(map, &inserts, &updates, &deletes)?;
    builder.plan_deletes(&deletes)?;

    tracing::debug!(
        inserts = builder.queue.count(ActionKind::Insert),
        updates = builder.queue.count(ActionKind::Update),
        deletes = builder.queue.count(ActionKind::Delete),
        collection_actions = builder.queue.count(ActionKind::Collection),
        "Planned flush"
    );
    Ok(FlushPlan {
        queue: builder.queue,
        outcomes: builder.outcomes,
    })
}

#[derive(Default)]
struct PlanBuilder {
    queue: ActionQueue,
    outcomes: Vec<EntityOutcome>,
    insert_ids: HashMap<EntityKey, usize>,
    delete_ids: HashMap<EntityKey, usize>,
    outcome_index: HashMap<EntityRef, usize>,
}

impl PlanBuilder {
    fn add_outcome(&mut self, outcome: EntityOutcome) {
        self.outcome_index
            .insert(outcome.instance.clone(), self.outcomes.len());
        self.outcomes.push(outcome);
    }

    fn plan_inserts(&mut self, inserts: &[Candidate<'_>]) -> Result<()> {
        let positions: HashMap<&EntityKey, usize> = inserts
            .iter()
            .enumerate()
            .map(|(i, c)| (c.entry.key(), i))
            .collect();

        let mut edges = Vec::new();
        for (i, candidate) in inserts.iter().enumerate() {
            for (column, cv) in candidate.columns.iter().enumerate() {
                let Some(&j) = cv.target.as_ref().and_then(|k| positions.get(k)) else {
                    continue;
                };
                if j != i {
                    edges.push(OrderEdge {
                        before: j,
                        after: i,
                        holder: i,
                        column,
                        nullable: cv.attribute.is_nullable(),
                    });
                }
            }
        }

        let seqs: Vec<u64> = inserts.iter().map(|c| c.entry.seq()).collect();
        let names: Vec<&str> = inserts.iter().map(|c| c.descriptor.name()).collect();
        let (order, deferred) = order_nodes(&seqs, &names, &edges)?;
        let nulled: HashSet<(usize, usize)> = deferred
            .iter()
            .map(|&e| (edges[e].holder, edges[e].column))
            .collect();

        for i in order {
            let candidate = &inserts[i];
            let descriptor = candidate.descriptor;
            let key = candidate.entry.key().clone();
            let version_attr = descriptor.version_attribute();
            let version = version_attr.map(|attr| {
                candidate
                    .entry
                    .version()
                    .cloned()
                    .unwrap_or_else(|| initial_version(attr.sql_type()))
            });

            let mut assignments = vec![(descriptor.id_column().to_string(), key.id().clone())];
            let mut state = LoadedState::new();
            let mut depends_on = Vec::new();
            for (column, cv) in candidate.columns.iter().enumerate() {
                let value = match (&version, version_attr) {
                    (Some(version), Some(attr)) if attr.name() == cv.attribute.name() => {
                        version.clone()
                    }
                    _ => cv.value.clone(),
                };
                state.set(cv.attribute.name(), value.clone());
                let written = if nulled.contains(&(i, column)) {
                    Value::Null
                } else {
                    if let Some(&dep) = cv.target.as_ref().and_then(|k| self.insert_ids.get(k)) {
                        depends_on.push(dep);
                    }
                    value
                };
                assignments.push((column_of(cv.attribute).to_string(), written));
            }

            let mut action = Action::new(
                ActionKind::Insert,
                ActionTarget::Entity(key.clone()),
                WriteStatement::insert(Some(descriptor.name()), descriptor.table(), assignments),
            );
            for dep in depends_on {
                action = action.after(dep);
            }
            let id = self.queue.push(action);
            self.insert_ids.insert(key, id);
            self.add_outcome(EntityOutcome {
                instance: candidate.instance.clone(),
                kind: OutcomeKind::Inserted,
                loaded_state: Some(state),
                version,
                collection_snapshots: Vec::new(),
            });
        }

        let mut fixups: Vec<(usize, usize)> = nulled.into_iter().collect();
        fixups.sort_by_key(|&(i, column)| (inserts[i].entry.seq(), column));
        for (i, column) in fixups {
            let candidate = &inserts[i];
            let cv = &candidate.columns[column];
            let key = candidate.entry.key().clone();
            tracing::debug!(
                key = %key,
                attribute = cv.attribute.name(),
                "Deferred foreign key to break an insert cycle"
            );
            let statement = WriteStatement::update(
                Some(candidate.descriptor.name()),
                candidate.descriptor.table(),
                vec![(column_of(cv.attribute).to_string(), cv.value.clone())],
                vec![(candidate.descriptor.id_column().to_string(), key.id().clone())],
            );
            let mut action = Action::new(ActionKind::Update, ActionTarget::Entity(key.clone()), statement)
                .with_changes(vec![ColumnChange {
                    attribute: cv.attribute.name().to_string(),
                    column: column_of(cv.attribute).to_string(),
                    old: Value::Null,
                    new: cv.value.clone(),
                }]);
            for dep in [Some(&key), cv.target.as_ref()]
                .into_iter()
                .flatten()
                .filter_map(|k| self.insert_ids.get(k))
            {
                action = action.after(*dep);
            }
            self.queue.push(action);
        }
        Ok(())
    }

    fn plan_updates(&mut self, updates: &[Candidate<'_>]) {
        for candidate in updates {
            let descriptor = candidate.descriptor;
            let entry = candidate.entry;
            let version_attr = descriptor.version_attribute();
            let is_version = |attribute: &AttributeDescriptor| {
                version_attr.is_some_and(|v| v.name() == attribute.name())
            };

            let snapshot = entry.loaded_state();
            let mut state = LoadedState::new();
            let mut changes = Vec::new();
            for cv in &candidate.columns {
                if is_version(cv.attribute) {
                    state.set(
                        cv.attribute.name(),
                        entry.version().cloned().unwrap_or(Value::Null),
                    );
                    continue;
                }
                state.set(cv.attribute.name(), cv.value.clone());
                let old = snapshot
                    .and_then(|s| s.get(cv.attribute.name()))
                    .cloned()
                    .unwrap_or(Value::Null);
                if !cv.attribute.sql_type().is_equal(&old, &cv.value) {
                    changes.push(ColumnChange {
                        attribute: cv.attribute.name().to_string(),
                        column: column_of(cv.attribute).to_string(),
                        old,
                        new: cv.value.clone(),
                    });
                }
            }

            let force = entry.lock_mode().forces_version_increment() && version_attr.is_some();
            if changes.is_empty() && !force {
                continue;
            }

            let key = entry.key().clone();
            let mut assignments: Vec<(String, Value)> = changes
                .iter()
                .map(|c| (c.column.clone(), c.new.clone()))
                .collect();
            let mut version = entry.version().cloned();
            let mut expected = None;
            if let Some(attr) = version_attr {
                let next = next_version(entry.version());
                assignments.push((column_of(attr).to_string(), next.clone()));
                state.set(attr.name(), next.clone());
                expected = entry.version().cloned();
                version = Some(next);
            }

            let mut statement = WriteStatement::update(
                Some(descriptor.name()),
                descriptor.table(),
                assignments,
                vec![(descriptor.id_column().to_string(), key.id().clone())],
            );
            if let (Some(attr), Some(expected)) = (version_attr, expected) {
                statement = statement.with_version_check(column_of(attr), expected);
            }
            tracing::trace!(key = %key, changed = changes.len(), "Dirty entity");
            self.queue.push(
                Action::new(ActionKind::Update, ActionTarget::Entity(key), statement)
                    .with_changes(changes),
            );
            self.add_outcome(EntityOutcome {
                instance: candidate.instance.clone(),
                kind: OutcomeKind::Updated,
                loaded_state: Some(state),
                version,
                collection_snapshots: Vec::new(),
            });
        }
    }

    fn plan_collections(
        &mut self,
        map: &IdentityMap,
        inserts: &[Candidate<'_>],
        updates: &[Candidate<'_>],
        deletes: &[Doomed<'_>],
    ) -> Result<()> {
        let mut owners: Vec<&Candidate<'_>> = inserts.iter().chain(updates).collect();
        owners.sort_by_key(|c| c.entry.seq());

        let mut unlinks = Vec::new();
        let mut links = Vec::new();
        let mut snapshots: Vec<(EntityRef, String, Vec<Value>)> = Vec::new();

        for owner in owners {
            let descriptor = owner.descriptor;
            let owner_key = owner.entry.key();
            let inserted = !owner.entry.exists_in_database();
            for attribute in descriptor.attributes() {
                let Some(CollectionMapping::JoinTable(join)) = attribute.collection_mapping() else {
                    continue;
                };
                let Some(elements) = owner
                    .instance
                    .with_data(|d| d.collection(attribute.name()).map(<[EntityRef]>::to_vec))
                    .flatten()
                else {
                    continue;
                };
                let mut current = Vec::with_capacity(elements.len());
                for element in &elements {
                    current.push(known_target(map, descriptor, attribute, element)?);
                }
                let target = attribute.target().unwrap_or_default();
                let previous: Vec<EntityKey> = owner
                    .entry
                    .collection_snapshot(attribute.name())
                    .unwrap_or_default()
                    .iter()
                    .map(|id| EntityKey::new(target, id.clone()))
                    .collect();
                let current_set: HashSet<&EntityKey> = current.iter().collect();
                let previous_set: HashSet<&EntityKey> = previous.iter().collect();
                let role = NavigableRole::new(descriptor.name()).append(attribute.name());
                let collection_target = || ActionTarget::Collection {
                    role: role.clone(),
                    owner: owner_key.clone(),
                };

                let mut changed = false;
                for removed in previous.iter().filter(|k| !current_set.contains(k)) {
                    changed = true;
                    unlinks.push(Action::new(
                        ActionKind::Collection,
                        collection_target(),
                        WriteStatement::delete(
                            None,
                            join.table.clone(),
                            vec![
                                (join.owner_column.clone(), owner_key.id().clone()),
                                (join.element_column.clone(), removed.id().clone()),
                            ],
                        ),
                    ));
                }
                for added in current.iter().filter(|k| !previous_set.contains(k)) {
                    changed = true;
                    let mut action = Action::new(
                        ActionKind::Collection,
                        collection_target(),
                        WriteStatement::insert(
                            None,
                            join.table.clone(),
                            vec![
                                (join.owner_column.clone(), owner_key.id().clone()),
                                (join.element_column.clone(), added.id().clone()),
                            ],
                        ),
                    );
                    for dep in [owner_key, added].into_iter().filter_map(|k| self.insert_ids.get(k)) {
                        action = action.after(*dep);
                    }
                    links.push(action);
                }

                if changed || inserted {
                    snapshots.push((
                        owner.instance.clone(),
                        attribute.name().to_string(),
                        current.iter().map(|k| k.id().clone()).collect(),
                    ));
                }
            }
        }

        for doomed in deletes {
            let descriptor = doomed.descriptor;
            for attribute in descriptor.attributes() {
                if let Some(CollectionMapping::JoinTable(join)) = attribute.collection_mapping() {
                    unlinks.push(Action::new(
                        ActionKind::Collection,
                        ActionTarget::Collection {
                            role: NavigableRole::new(descriptor.name()).append(attribute.name()),
                            owner: doomed.entry.key().clone(),
                        },
                        WriteStatement::delete(
                            None,
                            join.table.clone(),
                            vec![(join.owner_column.clone(), doomed.entry.id().clone())],
                        ),
                    ));
                }
            }
        }

        for action in unlinks.into_iter().chain(links) {
            self.queue.push(action);
        }

        for (instance, attribute, ids) in snapshots {
            match self.outcome_index.get(&instance) {
                Some(&index) => self.outcomes[index]
                    .collection_snapshots
                    .push((attribute, ids)),
                None => self.add_outcome(EntityOutcome {
                    instance,
                    kind: OutcomeKind::CollectionsChanged,
                    loaded_state: None,
                    version: None,
                    collection_snapshots: vec![(attribute, ids)],
                }),
            }
        }
        Ok(())
    }

    fn plan_deletes(&mut self, deletes: &[Doomed<'_>]) -> Result<()> {
        let positions: HashMap<&EntityKey, usize> = deletes
            .iter()
            .enumerate()
            .map(|(i, d)| (d.entry.key(), i))
            .collect();

        let mut edges = Vec::new();
        for (i, doomed) in deletes.iter().enumerate() {
            for (column, (attribute, target)) in doomed.references.iter().enumerate() {
                let Some(&j) = positions.get(target) else {
                    continue;
                };
                if j != i {
                    edges.push(OrderEdge {
                        before: i,
                        after: j,
                        holder: i,
                        column,
                        nullable: attribute.is_nullable(),
                    });
                }
            }
        }

        let seqs: Vec<u64> = deletes.iter().map(|d| d.entry.seq()).collect();
        let names: Vec<&str> = deletes.iter().map(|d| d.descriptor.name()).collect();
        let (order, deferred) = order_nodes(&seqs, &names, &edges)?;
        let mut waits_on: Vec<Vec<usize>> = vec![Vec::new(); deletes.len()];
        for (e, edge) in edges.iter().enumerate() {
            waits_on[edge.after].push(e);
        }

        let mut null_outs: HashMap<usize, Vec<usize>> = HashMap::new();
        for e in deferred {
            let edge = &edges[e];
            let doomed = &deletes[edge.holder];
            let (attribute, target) = &doomed.references[edge.column];
            let key = doomed.entry.key().clone();
            tracing::debug!(
                key = %key,
                attribute = attribute.name(),
                "Nulling foreign key to break a delete cycle"
            );
            let statement = WriteStatement::update(
                Some(doomed.descriptor.name()),
                doomed.descriptor.table(),
                vec![(column_of(attribute).to_string(), Value::Null)],
                vec![(doomed.descriptor.id_column().to_string(), key.id().clone())],
            );
            let id = self.queue.push(
                Action::new(ActionKind::Update, ActionTarget::Entity(key), statement).with_changes(
                    vec![ColumnChange {
                        attribute: attribute.name().to_string(),
                        column: column_of(attribute).to_string(),
                        old: target.id().clone(),
                        new: Value::Null,
                    }],
                ),
            );
            null_outs.entry(edge.after).or_default().push(id);
        }

        for i in order {
            let doomed = &deletes[i];
            let descriptor = doomed.descriptor;
            let key = doomed.entry.key().clone();
            let mut statement = WriteStatement::delete(
                Some(descriptor.name()),
                descriptor.table(),
                vec![(descriptor.id_column().to_string(), key.id().clone())],
            );
            if let (Some(attr), Some(version)) =
                (descriptor.version_attribute(), doomed.entry.version())
            {
                statement = statement.with_version_check(column_of(attr), version.clone());
            }
            let mut action = Action::new(ActionKind::Delete, ActionTarget::Entity(key.clone()), statement);
            for &e in &waits_on[i] {
                if let Some(&dep) = self.delete_ids.get(deletes[edges[e].before].entry.key()) {
                    action = action.after(dep);
                }
            }
            for &dep in null_outs.get(&i).into_iter().flatten() {
                action = action.after(dep);
            }
            let id = self.queue.push(action);
            self.delete_ids.insert(key, id);
            self.add_outcome(EntityOutcome {
                instance: doomed.instance.clone(),
                kind: OutcomeKind::Deleted,
                loaded_state: None,
                version: None,
                collection_snapshots: Vec::new(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// `before` must be written before `after`, because of the foreign key held
/// in column `column` of node `holder`.
struct OrderEdge {
    before: usize,
    after: usize,
    holder: usize,
    column: usize,
    nullable: bool,
}

/// Edge indices grouped by the node that waits (`after`) and by the node
/// waited on (`before`).
struct Adjacency {
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
}

impl Adjacency {
    fn new(n: usize, edges: &[OrderEdge]) -> Self {
        let mut incoming = vec![Vec::new(); n];
        let mut outgoing = vec![Vec::new(); n];
        for (e, edge) in edges.iter().enumerate() {
            incoming[edge.after].push(e);
            outgoing[edge.before].push(e);
        }
        Self { incoming, outgoing }
    }
}

/// Topologically order nodes, lowest sequence first among ready nodes.
///
/// When every remaining node waits on another, one nullable edge lying on a
/// cycle is deferred (its foreign key is written separately) and ordering
/// resumes. Returns the node order and the deferred edges.
fn order_nodes(
    seqs: &[u64],
    names: &[&str],
    edges: &[OrderEdge],
) -> Result<(Vec<usize>, Vec<usize>)> {
    let n = seqs.len();
    let adjacency = Adjacency::new(n, edges);
    let mut waiting: Vec<usize> = adjacency.incoming.iter().map(Vec::len).collect();
    let mut emitted = vec![false; n];
    let mut deferred = vec![false; edges.len()];
    let mut order = Vec::with_capacity(n);

    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = (0..n)
        .filter(|&i| waiting[i] == 0)
        .map(|i| Reverse((seqs[i], i)))
        .collect();

    while order.len() < n {
        if let Some(Reverse((_, i))) = ready.pop() {
            emitted[i] = true;
            order.push(i);
            for &e in &adjacency.outgoing[i] {
                if deferred[e] {
                    continue;
                }
                let after = edges[e].after;
                waiting[after] -= 1;
                if waiting[after] == 0 {
                    ready.push(Reverse((seqs[after], after)));
                }
            }
            continue;
        }

        let mut candidates: Vec<usize> = (0..edges.len())
            .filter(|&e| {
                let edge = &edges[e];
                edge.nullable && !deferred[e] && !emitted[edge.before] && !emitted[edge.after]
            })
            .collect();
        candidates.sort_by_key(|&e| (seqs[edges[e].holder], edges[e].column));
        let breakable = candidates.into_iter().find(|&e| {
            reaches(edges, &adjacency, &deferred, &emitted, edges[e].after, edges[e].before)
        });
        let Some(e) = breakable else {
            return Err(Error::CycleDetected {
                entities: describe_cycle(seqs, names, edges, &adjacency, &deferred, &emitted),
            });
        };
        deferred[e] = true;
        let after = edges[e].after;
        waiting[after] -= 1;
        if waiting[after] == 0 {
            ready.push(Reverse((seqs[after], after)));
        }
    }

    let deferred_edges = (0..edges.len()).filter(|&e| deferred[e]).collect();
    Ok((order, deferred_edges))
}

fn reaches(
    edges: &[OrderEdge],
    adjacency: &Adjacency,
    deferred: &[bool],
    emitted: &[bool],
    from: usize,
    to: usize,
) -> bool {
    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(node) = queue.pop_front() {
        if node == to {
            return true;
        }
        for &e in &adjacency.outgoing[node] {
            let next = edges[e].after;
            if !deferred[e] && !emitted[next] && seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    false
}

/// Entity names along one cycle among the remaining nodes, first name repeated
/// at the end.
fn describe_cycle(
    seqs: &[u64],
    names: &[&str],
    edges: &[OrderEdge],
    adjacency: &Adjacency,
    deferred: &[bool],
    emitted: &[bool],
) -> Vec<String> {
    let Some(start) = (0..seqs.len())
        .filter(|&i| !emitted[i])
        .min_by_key(|&i| seqs[i])
    else {
        return Vec::new();
    };
    let mut path = Vec::new();
    let mut on_path = HashSet::new();
    let mut current = start;
    while on_path.insert(current) {
        path.push(current);
        let Some(next) = adjacency.incoming[current]
            .iter()
            .find(|&&e| !deferred[e] && !emitted[edges[e].before])
            .map(|&e| edges[e].before)
        else {
            break;
        };
        current = next;
    }
    let from = path.iter().position(|&i| i == current).unwrap_or(0);
    let mut cycle: Vec<String> = path[from..].iter().rev().map(|&i| names[i].to_string()).collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::{JoinTable, LockMode, Metamodel, WriteKind};

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityDescriptor::new("Team", "team", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::basic("name", SqlType::Text))
                    .version(AttributeDescriptor::basic("version", SqlType::Integer)),
            )
            .entity(
                EntityDescriptor::new("Hero", "hero", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::basic("name", SqlType::Text))
                    .attribute(AttributeDescriptor::basic("age", SqlType::Integer))
                    .attribute(
                        AttributeDescriptor::to_one("team", "Team", "team_id").nullable(false),
                    )
                    .attribute(AttributeDescriptor::many_to_many(
                        "powers",
                        "Power",
                        JoinTable::new("hero_power", "hero_id", "power_id"),
                    )),
            )
            .entity(
                EntityDescriptor::new("Power", "power", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::basic("name", SqlType::Text)),
            )
            .entity(
                EntityDescriptor::new("A", "a", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::to_one("b", "B", "b_id")),
            )
            .entity(
                EntityDescriptor::new("B", "b", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::to_one("a", "A", "a_id").nullable(false)),
            )
            .entity(
                EntityDescriptor::new("X", "x", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::to_one("y", "Y", "y_id").nullable(false)),
            )
            .entity(
                EntityDescriptor::new("Y", "y", AttributeDescriptor::basic("id", SqlType::BigInt))
                    .attribute(AttributeDescriptor::to_one("x", "X", "x_id").nullable(false)),
            )
            .build()
            .unwrap()
    }

    fn persist_new(map: &mut IdentityMap, instance: &EntityRef, version: Option<Value>) {
        let key = instance.key().unwrap();
        map.register(instance, EntityEntry::pending_insert(key, version))
            .unwrap();
    }

    fn register_loaded(map: &mut IdentityMap, instance: &EntityRef, state: Vec<(&str, Value)>, version: Option<Value>) {
        let key = instance.key().unwrap();
        let state = LoadedState::from_pairs(
            state
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        map.register(instance, EntityEntry::loaded(key, state, version, LockMode::None))
            .unwrap();
    }

    fn tables(plan: &FlushPlan, kind: WriteKind) -> Vec<String> {
        plan.queue()
            .iter()
            .filter(|a| a.statement().kind == kind)
            .map(|a| a.statement().table.clone())
            .collect()
    }

    #[test]
    fn test_single_attribute_update() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team")
            .with_id(1i64)
            .with_value("name", "Avengers")
            .with_value("version", 4i32);
        register_loaded(
            &mut map,
            &team,
            vec![("name", Value::from("Avengers")), ("version", Value::Int(4))],
            Some(Value::Int(4)),
        );
        team.set_value("name", "Defenders").unwrap();

        let plan = plan(&map, &model).unwrap();
        assert_eq!(plan.len(), 1);
        let action = plan.queue().get(0).unwrap();
        assert_eq!(action.kind(), ActionKind::Update);
        assert_eq!(action.changes().len(), 1);
        assert_eq!(action.changes()[0].column, "name");
        assert_eq!(action.changes()[0].old, Value::from("Avengers"));
        let statement = action.statement();
        assert_eq!(
            statement.assignments,
            vec![
                ("name".to_string(), Value::from("Defenders")),
                ("version".to_string(), Value::Int(5)),
            ]
        );
        assert_eq!(
            statement.version_check,
            Some(("version".to_string(), Value::Int(4)))
        );
        assert_eq!(plan.outcomes()[0].version, Some(Value::Int(5)));
    }

    #[test]
    fn test_unchanged_entity_produces_nothing() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team")
            .with_id(1i64)
            .with_value("name", "Avengers")
            .with_value("version", 0i32);
        register_loaded(
            &mut map,
            &team,
            vec![("name", Value::from("Avengers")), ("version", Value::Int(0))],
            Some(Value::Int(0)),
        );
        assert!(plan(&map, &model).unwrap().is_empty());
    }

    #[test]
    fn test_force_increment_without_changes() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team")
            .with_id(1i64)
            .with_value("name", "Avengers")
            .with_value("version", 2i32);
        register_loaded(
            &mut map,
            &team,
            vec![("name", Value::from("Avengers")), ("version", Value::Int(2))],
            Some(Value::Int(2)),
        );
        map.entry_for_mut(&team)
            .unwrap()
            .set_lock_mode(LockMode::OptimisticForceIncrement);

        let plan = plan(&map, &model).unwrap();
        let statement = plan.queue().get(0).unwrap().statement();
        assert_eq!(
            statement.assignments,
            vec![("version".to_string(), Value::Int(3))]
        );
        assert!(plan.queue().get(0).unwrap().changes().is_empty());
    }

    #[test]
    fn test_insert_targets_first() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team").with_id(1i64).with_value("name", "Avengers");
        let hero = EntityRef::new("Hero")
            .with_id(10i64)
            .with_value("name", "Thor")
            .with_reference("team", Some(&team));
        // Registered before the team it references.
        persist_new(&mut map, &hero, None);
        persist_new(&mut map, &team, Some(Value::Int(0)));

        let plan = plan(&map, &model).unwrap();
        assert_eq!(tables(&plan, WriteKind::Insert), vec!["team", "hero"]);
        let hero_insert = plan.queue().get(1).unwrap();
        assert_eq!(hero_insert.depends_on(), &[0]);
        assert!(
            hero_insert
                .statement()
                .assignments
                .contains(&("team_id".to_string(), Value::BigInt(1)))
        );
        plan.queue().validate_order().unwrap();
    }

    #[test]
    fn test_insert_version_defaults_to_zero() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team").with_id(1i64).with_value("name", "Avengers");
        persist_new(&mut map, &team, None);
        let plan = plan(&map, &model).unwrap();
        let statement = plan.queue().get(0).unwrap().statement();
        assert!(
            statement
                .assignments
                .contains(&("version".to_string(), Value::Int(0)))
        );
    }

    #[test]
    fn test_nullable_cycle_broken_with_fixup() {
        let model = model();
        let mut map = IdentityMap::new();
        let a = EntityRef::new("A").with_id(1i64);
        let b = EntityRef::new("B").with_id(2i64).with_reference("a", Some(&a));
        a.set_reference("b", Some(&b)).unwrap();
        persist_new(&mut map, &a, None);
        persist_new(&mut map, &b, None);

        let plan = plan(&map, &model).unwrap();
        assert_eq!(tables(&plan, WriteKind::Insert), vec!["a", "b"]);
        let first = plan.queue().get(0).unwrap().statement();
        assert!(first.assignments.contains(&("b_id".to_string(), Value::Null)));
        let fixup = plan.queue().get(2).unwrap();
        assert_eq!(fixup.kind(), ActionKind::Update);
        assert_eq!(
            fixup.statement().assignments,
            vec![("b_id".to_string(), Value::BigInt(2))]
        );
        assert_eq!(fixup.statement().version_check, None);
        plan.queue().validate_order().unwrap();

        // The snapshot records the real key, not the NULL written first.
        let outcome = &plan.outcomes()[0];
        assert_eq!(
            outcome.loaded_state.as_ref().unwrap().get("b"),
            Some(&Value::BigInt(2))
        );
    }

    #[test]
    fn test_required_cycle_is_error() {
        let model = model();
        let mut map = IdentityMap::new();
        let x = EntityRef::new("X").with_id(1i64);
        let y = EntityRef::new("Y").with_id(2i64).with_reference("x", Some(&x));
        x.set_reference("y", Some(&y)).unwrap();
        persist_new(&mut map, &x, None);
        persist_new(&mut map, &y, None);

        match plan(&map, &model) {
            Err(Error::CycleDetected { entities }) => {
                assert_eq!(entities.first(), entities.last());
                assert!(entities.contains(&"X".to_string()));
                assert!(entities.contains(&"Y".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_reference_rejected() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team").with_id(1i64);
        let hero = EntityRef::new("Hero")
            .with_id(10i64)
            .with_reference("team", Some(&team));
        persist_new(&mut map, &hero, None);

        let err = plan(&map, &model).unwrap_err();
        assert!(matches!(
            err,
            Error::TransientReference { ref attribute, .. } if attribute == "team"
        ));
    }

    #[test]
    fn test_deletes_referencing_rows_first() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team")
            .with_id(1i64)
            .with_value("name", "Avengers")
            .with_value("version", 7i32);
        let hero = EntityRef::new("Hero")
            .with_id(10i64)
            .with_reference("team", Some(&team));
        register_loaded(
            &mut map,
            &team,
            vec![("name", Value::from("Avengers")), ("version", Value::Int(7))],
            Some(Value::Int(7)),
        );
        register_loaded(
            &mut map,
            &hero,
            vec![
                ("name", Value::Null),
                ("age", Value::Null),
                ("team", Value::BigInt(1)),
            ],
            None,
        );
        map.entry_for_mut(&team).unwrap().set_status(EntityStatus::Deleted);
        map.entry_for_mut(&hero).unwrap().set_status(EntityStatus::Deleted);

        let plan = plan(&map, &model).unwrap();
        assert_eq!(
            tables(&plan, WriteKind::Delete),
            vec!["hero_power", "hero", "team"]
        );
        let team_delete = plan.queue().iter().last().unwrap();
        assert_eq!(
            team_delete.statement().version_check,
            Some(("version".to_string(), Value::Int(7)))
        );
        plan.queue().validate_order().unwrap();
    }

    #[test]
    fn test_read_only_entries_skipped() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team")
            .with_id(1i64)
            .with_value("name", "Avengers");
        register_loaded(&mut map, &team, vec![("name", Value::from("Avengers"))], Some(Value::Int(0)));
        map.entry_for_mut(&team).unwrap().set_status(EntityStatus::ReadOnly);
        team.set_value("name", "Changed").unwrap();
        assert!(plan(&map, &model).unwrap().is_empty());
    }

    #[test]
    fn test_join_table_diff() {
        let model = model();
        let mut map = IdentityMap::new();
        let team = EntityRef::new("Team").with_id(1i64).with_value("version", 0i32);
        let fly = EntityRef::new("Power").with_id(1i64).with_value("name", "fly");
        let swim = EntityRef::new("Power").with_id(2i64).with_value("name", "swim");
        let hero = EntityRef::new("Hero")
            .with_id(10i64)
            .with_reference("team", Some(&team))
            .with_elements("powers", vec![fly.clone()]);
        register_loaded(&mut map, &team, vec![("name", Value::Null), ("version", Value::Int(0))], Some(Value::Int(0)));
        register_loaded(&mut map, &fly, vec![("name", Value::from("fly"))], None);
        register_loaded(&mut map, &swim, vec![("name", Value::from("swim"))], None);
        register_loaded(
            &mut map,
            &hero,
            vec![("name", Value::Null), ("age", Value::Null), ("team", Value::BigInt(1))],
            None,
        );
        map.entry_for_mut(&hero)
            .unwrap()
            .set_collection_snapshot("powers", vec![Value::BigInt(1)]);

        hero.remove_element("powers", &fly).unwrap();
        hero.add_element("powers", &swim).unwrap();

        let plan = plan(&map, &model).unwrap();
        let kinds: Vec<_> = plan
            .queue()
            .iter()
            .map(|a| (a.kind(), a.statement().kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ActionKind::Collection, WriteKind::Delete),
                (ActionKind::Collection, WriteKind::Insert),
            ]
        );
        let link = plan.queue().get(1).unwrap().statement();
        assert_eq!(
            link.assignments,
            vec![
                ("hero_id".to_string(), Value::BigInt(10)),
                ("power_id".to_string(), Value::BigInt(2)),
            ]
        );
        let outcome = &plan.outcomes()[0];
        assert_eq!(outcome.kind, OutcomeKind::CollectionsChanged);
        assert_eq!(
            outcome.collection_snapshots,
            vec![("powers".to_string(), vec![Value::BigInt(2)])]
        );
    }

    #[test]
    fn test_next_version_keeps_width() {
        assert_eq!(next_version(Some(&Value::SmallInt(1))), Value::SmallInt(2));
        assert_eq!(next_version(Some(&Value::Int(1))), Value::Int(2));
        assert_eq!(next_version(Some(&Value::BigInt(1))), Value::BigInt(2));
        assert_eq!(next_version(None), Value::BigInt(0));
        assert_eq!(initial_version(&SqlType::Integer), Value::Int(0));
    }
}
