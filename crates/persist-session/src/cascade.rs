//! Cascading operations along associations.
//!
//! [`cascade`] walks the object graph reachable from a root through the
//! associations whose cascade style includes the operation, applying the
//! operation to each instance exactly once. A visited set keyed by instance
//! identity makes the walk terminate on cyclic graphs.
//!
//! Only initialized state is followed: placeholders and uninitialized
//! collections are not loaded just to cascade, except for `Remove`, which
//! must reach every dependent row.

use crate::entry::{EntityEntry, EntityStatus};
use crate::flush::initial_version;
use crate::identity_map::EntityKey;
use crate::listeners::LifecycleEvent;
use crate::proxy::{AttributeValue, CollectionState, EntityRef};
use crate::{Session, not_managed};
use persist_core::{
    AttributeKind, CascadeOp, Error, IdGeneration, LockMode, MetadataProvider, Result, SqlExecutor,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Receives the instances a cascade reaches.
pub trait CascadeTarget {
    /// Apply `op` to one instance.
    fn apply(&mut self, op: CascadeOp, instance: &EntityRef) -> Result<()>;

    /// Initialize a lazy collection so a `Remove` can reach its elements.
    fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()>;
}

/// Apply `op` to `root` and everything reachable from it through cascading
/// associations, in depth-first pre-order.
///
/// Instances already in `visited` are skipped, so callers can share one set
/// across several roots. Returns the number of instances the call applied
/// `op` to.
///
/// `Remove` is applied before the instance's associations are read, so a
/// placeholder is initialized and its dependents found. Every other
/// operation reads the associations first; `Refresh` replaces them.
pub fn cascade(
    metadata: &dyn MetadataProvider,
    op: CascadeOp,
    root: &EntityRef,
    visited: &mut HashSet<EntityRef>,
    target: &mut dyn CascadeTarget,
) -> Result<usize> {
    let apply_first = op == CascadeOp::Remove;
    let mut stack = vec![root.clone()];
    let mut applied = 0;

    while let Some(instance) = stack.pop() {
        if !visited.insert(instance.clone()) {
            continue;
        }
        if apply_first {
            target.apply(op, &instance)?;
        }
        let children = if instance.is_initialized() {
            cascade_children(metadata, op, &instance, target)?
        } else {
            Vec::new()
        };
        if !apply_first {
            target.apply(op, &instance)?;
        }
        applied += 1;
        stack.extend(children.into_iter().rev());
    }
    tracing::trace!(op = %op, applied, "Cascade walk finished");
    Ok(applied)
}

fn cascade_children(
    metadata: &dyn MetadataProvider,
    op: CascadeOp,
    instance: &EntityRef,
    target: &mut dyn CascadeTarget,
) -> Result<Vec<EntityRef>> {
    let descriptor = metadata.descriptor(instance.entity_name())?;
    let mut children = Vec::new();
    for attribute in descriptor.attributes() {
        if !attribute.is_association() || !attribute.cascade_style().includes(op) {
            continue;
        }
        let name = attribute.name();
        let value = instance.with_data(|d| d.attribute(name).cloned()).flatten();
        match value {
            Some(AttributeValue::Collection(CollectionState::Initialized(elements))) => {
                children.extend(elements);
            }
            Some(AttributeValue::Collection(CollectionState::Uninitialized))
                if op == CascadeOp::Remove =>
            {
                target.initialize_collection(instance, name)?;
                children.extend(instance.elements(name)?);
            }
            Some(AttributeValue::Reference(Some(referenced)))
                if referenced.is_initialized() || op == CascadeOp::Remove =>
            {
                children.push(referenced);
            }
            _ => {}
        }
    }
    Ok(children)
}

/// Applies cascaded operations to a session.
struct SessionCascade<'s, E: SqlExecutor> {
    session: &'s mut Session<E>,
    lock_mode: LockMode,
}

impl<E: SqlExecutor> CascadeTarget for SessionCascade<'_, E> {
    fn apply(&mut self, op: CascadeOp, instance: &EntityRef) -> Result<()> {
        match op {
            CascadeOp::Persist => self.session.persist_one(instance),
            CascadeOp::Remove => self.session.remove_one(instance),
            CascadeOp::Refresh => self.session.refresh_one(instance),
            CascadeOp::Detach => {
                self.session.detach_one(instance);
                Ok(())
            }
            CascadeOp::Lock => self.session.lock_one(instance, self.lock_mode),
            CascadeOp::Merge => Err(Error::InvalidState(
                "merge copies state through Session::merge".to_string(),
            )),
        }
    }

    fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()> {
        self.session.initialize_collection(owner, attribute)
    }
}

/// Pairs each instance of a detached graph with its managed copy.
struct MergeCopier<'s, E: SqlExecutor> {
    session: &'s mut Session<E>,
    copies: HashMap<EntityRef, EntityRef>,
    /// Sources in visit order.
    order: Vec<EntityRef>,
    /// Copies that are new to the database.
    created: HashSet<EntityRef>,
}

impl<E: SqlExecutor> CascadeTarget for MergeCopier<'_, E> {
    fn apply(&mut self, _op: CascadeOp, source: &EntityRef) -> Result<()> {
        let copy = self.copy_for(source)?;
        self.order.push(source.clone());
        self.copies.insert(source.clone(), copy);
        Ok(())
    }

    fn initialize_collection(&mut self, _owner: &EntityRef, _attribute: &str) -> Result<()> {
        Ok(())
    }
}

impl<E: SqlExecutor> MergeCopier<'_, E> {
    /// The managed instance `source` merges into.
    fn copy_for(&mut self, source: &EntityRef) -> Result<EntityRef> {
        let map = &self.session.identity_map;
        if map.contains(source) || map.owns_proxy(source) {
            return Ok(source.clone());
        }
        let entity = source.entity_name().to_string();
        let Some(key) = source.key().filter(|key| !key.id().is_null()) else {
            let copy = EntityRef::new(&entity);
            self.created.insert(copy.clone());
            return Ok(copy);
        };
        if !source.is_initialized() {
            return self.session.get_reference(&entity, key.id().clone());
        }
        if let Some(entry) = self.session.identity_map.find_entry(&key) {
            if entry.status().is_deleted_or_gone() {
                return Err(Error::InvalidState(format!("cannot merge into removed instance {key}")));
            }
        }

        match self.session.find(&entity, key.id().clone())? {
            Some(managed) => {
                self.check_version(source, &managed, &key)?;
                Ok(managed)
            }
            None => {
                let copy = EntityRef::new(&entity).with_id(key.id().clone());
                self.created.insert(copy.clone());
                Ok(copy)
            }
        }
    }

    fn check_version(&self, source: &EntityRef, managed: &EntityRef, key: &EntityKey) -> Result<()> {
        let descriptor = self.session.metadata.descriptor(key.entity())?;
        let Some(attribute) = descriptor.version_attribute() else {
            return Ok(());
        };
        let Some(detached) = source
            .with_data(|d| d.basic(attribute.name()))
            .flatten()
            .filter(|v| !v.is_null())
        else {
            return Ok(());
        };
        let current = self
            .session
            .identity_map
            .entry_for(managed)
            .and_then(EntityEntry::version)
            .cloned();
        match current {
            Some(current) if !attribute.sql_type().is_equal(&current, &detached) => {
                Err(Error::StaleState {
                    entity: key.entity().to_string(),
                    id: key.id().clone(),
                    expected_version: Some(detached),
                })
            }
            _ => Ok(()),
        }
    }

    /// The instance a reference inside the merged graph should point at.
    fn resolve(&mut self, target: &EntityRef) -> Result<EntityRef> {
        if let Some(copy) = self.copies.get(target) {
            return Ok(copy.clone());
        }
        let map = &self.session.identity_map;
        if map.contains(target) || map.owns_proxy(target) {
            return Ok(target.clone());
        }
        match target.key().filter(|key| !key.id().is_null()) {
            Some(key) => {
                if let Some(managed) = map.find(&key).cloned() {
                    return Ok(managed);
                }
                self.session.get_reference(key.entity(), key.id().clone())
            }
            // Left transient; the next flush reports it.
            None => Ok(target.clone()),
        }
    }

    /// Copy the state of every merged source onto its copy.
    fn copy_state(&mut self, metadata: &dyn MetadataProvider) -> Result<()> {
        for source in self.order.clone() {
            let Some(copy) = self.copies.get(&source).cloned() else {
                continue;
            };
            if EntityRef::ptr_eq(&source, &copy) || !source.is_initialized() {
                continue;
            }
            let descriptor = metadata.descriptor(source.entity_name())?;
            let version = descriptor.version_attribute().map(|a| a.name().to_string());

            for attribute in descriptor.attributes() {
                let name = attribute.name();
                if version.as_deref() == Some(name) {
                    continue;
                }
                let Some(value) = source.with_data(|d| d.attribute(name).cloned()).flatten() else {
                    continue;
                };
                match (attribute.kind(), value) {
                    (AttributeKind::Basic, AttributeValue::Basic(value)) => {
                        copy.set_value(name, value)?;
                    }
                    (AttributeKind::ToOne { .. }, AttributeValue::Reference(target)) => {
                        let mapped = target.map(|t| self.resolve(&t)).transpose()?;
                        copy.set_reference(name, mapped.as_ref())?;
                    }
                    (
                        AttributeKind::Collection { .. },
                        AttributeValue::Collection(CollectionState::Initialized(elements)),
                    ) => {
                        if !copy.is_attribute_initialized(name) {
                            self.session.initialize_collection(&copy, name)?;
                        }
                        let mut mapped = Vec::with_capacity(elements.len());
                        for element in &elements {
                            let element = self.resolve(element)?;
                            if !mapped.contains(&element) {
                                mapped.push(element);
                            }
                        }
                        copy.set_collection_state(name, CollectionState::Initialized(mapped));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Session Operations
// ============================================================================

impl<E: SqlExecutor> Session<E> {
    /// Make a transient instance managed, cascading along `persist`
    /// associations. The row is inserted at the next flush.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn persist(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        if self.is_detached(instance) {
            return Err(Error::InvalidState(format!(
                "detached {} instance passed to persist; use merge",
                instance.entity_name()
            )));
        }
        self.run_cascade(CascadeOp::Persist, instance, LockMode::None)
    }

    /// Schedule a managed instance for deletion, cascading along `remove`
    /// associations. Transient instances are ignored.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn remove(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        if self.is_detached(instance) {
            return Err(Error::InvalidState(format!(
                "cannot remove a detached {} instance",
                instance.entity_name()
            )));
        }
        self.run_cascade(CascadeOp::Remove, instance, LockMode::None)
    }

    /// Re-read a managed instance and its `refresh` associations, discarding
    /// unflushed changes.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn refresh(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        self.require_managed("refresh", instance)?;
        self.run_cascade(CascadeOp::Refresh, instance, LockMode::None)
    }

    /// Stop managing an instance and its `detach` associations. Unflushed
    /// changes to them are not written.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn detach(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_usable()?;
        self.run_cascade(CascadeOp::Detach, instance, LockMode::None)
    }

    /// Alias of [`Session::detach`].
    pub fn evict(&mut self, instance: &EntityRef) -> Result<()> {
        self.detach(instance)
    }

    /// Acquire `lock_mode` on a managed instance and its `lock` associations.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn lock(&mut self, instance: &EntityRef, lock_mode: LockMode) -> Result<()> {
        self.ensure_usable()?;
        self.require_managed("lock", instance)?;
        self.run_cascade(CascadeOp::Lock, instance, lock_mode)
    }

    /// Copy the state of a detached graph onto managed instances.
    ///
    /// Each instance reached through `merge` associations is paired with the
    /// managed instance for its key, loaded if needed, or with a new instance
    /// that is persisted. Returns the managed counterpart of `instance`; the
    /// argument itself never becomes managed.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(entity = instance.entity_name()))]
    pub fn merge(&mut self, instance: &EntityRef) -> Result<EntityRef> {
        self.ensure_usable()?;
        let metadata = Arc::clone(&self.metadata);
        let mut copier = MergeCopier {
            session: self,
            copies: HashMap::new(),
            order: Vec::new(),
            created: HashSet::new(),
        };
        let mut visited = HashSet::new();
        cascade(metadata.as_ref(), CascadeOp::Merge, instance, &mut visited, &mut copier)?;
        copier.copy_state(metadata.as_ref())?;

        let MergeCopier {
            session,
            copies,
            order,
            created,
        } = copier;
        for source in &order {
            if let Some(copy) = copies.get(source) {
                if created.contains(copy) {
                    session.persist_one(copy)?;
                }
            }
        }
        tracing::debug!(merged = order.len(), created = created.len(), "Merge complete");
        copies
            .get(instance)
            .cloned()
            .ok_or_else(|| Error::InvalidState("merge produced no managed copy".to_string()))
    }

    fn run_cascade(&mut self, op: CascadeOp, root: &EntityRef, lock_mode: LockMode) -> Result<()> {
        let metadata = Arc::clone(&self.metadata);
        let mut visited = HashSet::new();
        let mut adapter = SessionCascade {
            session: self,
            lock_mode,
        };
        let applied = cascade(metadata.as_ref(), op, root, &mut visited, &mut adapter)?;
        tracing::debug!(op = %op, applied, "Cascade complete");
        Ok(())
    }

    /// Whether a different instance (or placeholder) holds this instance's key.
    fn is_detached(&self, instance: &EntityRef) -> bool {
        if self.identity_map.contains(instance) || self.identity_map.owns_proxy(instance) {
            return false;
        }
        if !instance.is_initialized() {
            return true;
        }
        instance.key().is_some_and(|key| {
            self.identity_map.find(&key).is_some() || self.identity_map.find_proxy(&key).is_some()
        })
    }

    fn require_managed(&self, operation: &str, instance: &EntityRef) -> Result<()> {
        if self.identity_map.contains(instance) || self.identity_map.owns_proxy(instance) {
            Ok(())
        } else {
            Err(not_managed(operation, instance))
        }
    }

    pub(crate) fn persist_one(&mut self, instance: &EntityRef) -> Result<()> {
        if self.identity_map.owns_proxy(instance) {
            return Ok(());
        }
        if let Some(entry) = self.identity_map.entry_for_mut(instance) {
            if entry.status() == EntityStatus::Deleted {
                entry.set_status(EntityStatus::Managed);
                tracing::debug!(key = %entry.key(), "Persist cancelled a pending delete");
            }
            return Ok(());
        }
        if !instance.is_initialized() {
            return Err(Error::InvalidState(format!(
                "placeholder of another session passed to persist: {}",
                instance.entity_name()
            )));
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(instance.entity_name())?;

        self.listeners.fire(LifecycleEvent::PrePersist, instance)?;

        let id = match instance.id().filter(|id| !id.is_null()) {
            Some(id) => id,
            None => match descriptor.id_generation() {
                IdGeneration::Generated => {
                    let id = self.executor.generate_identifier(descriptor)?;
                    instance.assign_id(id.clone());
                    id
                }
                IdGeneration::Assigned => {
                    return Err(Error::InvalidState(format!(
                        "{} needs an assigned identifier before persist",
                        descriptor.name()
                    )));
                }
            },
        };
        if !descriptor.identifier().sql_type().accepts(&id) {
            return Err(Error::Mapping(format!(
                "identifier {id:?} does not fit {}.{}",
                descriptor.name(),
                descriptor.identifier().name()
            )));
        }

        let version = descriptor.version_attribute().map(|attribute| {
            let current = instance
                .with_data(|d| d.basic(attribute.name()))
                .flatten()
                .filter(|v| !v.is_null());
            current.unwrap_or_else(|| {
                let initial = initial_version(attribute.sql_type());
                instance.with_data_mut(|d| {
                    d.insert(attribute.name(), AttributeValue::Basic(initial.clone()));
                });
                initial
            })
        });

        let key = EntityKey::new(descriptor.name(), id);
        if let Err(error) = self
            .identity_map
            .register(instance, EntityEntry::pending_insert(key.clone(), version))
        {
            if error.is_fatal() {
                self.failed = true;
            }
            return Err(error);
        }
        tracing::debug!(key = %key, "Persisted instance");
        Ok(())
    }

    pub(crate) fn remove_one(&mut self, instance: &EntityRef) -> Result<()> {
        if self.identity_map.owns_proxy(instance) {
            self.initialize(instance)?;
        }
        let Some(entry) = self.identity_map.entry_for(instance) else {
            tracing::trace!(entity = instance.entity_name(), "Remove skipped unmanaged instance");
            return Ok(());
        };
        if matches!(
            entry.status(),
            EntityStatus::Deleted | EntityStatus::Gone | EntityStatus::Detached
        ) {
            return Ok(());
        }

        self.listeners.fire(LifecycleEvent::PreRemove, instance)?;

        let exists = self
            .identity_map
            .entry_for(instance)
            .is_some_and(EntityEntry::exists_in_database);
        if exists {
            if let Some(entry) = self.identity_map.entry_for_mut(instance) {
                entry.set_status(EntityStatus::Deleted);
                tracing::debug!(key = %entry.key(), "Scheduled delete");
            }
        } else {
            // Never inserted: forget it instead of deleting.
            self.identity_map.remove(instance);
            tracing::debug!(entity = instance.entity_name(), "Removed unflushed instance");
        }
        Ok(())
    }

    pub(crate) fn refresh_one(&mut self, instance: &EntityRef) -> Result<()> {
        if self.identity_map.owns_proxy(instance) {
            return self.initialize(instance);
        }
        let Some(entry) = self.identity_map.entry_for(instance) else {
            return Ok(());
        };
        if !entry.exists_in_database() || entry.is_deleted() {
            return Err(Error::InvalidState(format!(
                "cannot refresh {}: no persistent row to read",
                entry.key()
            )));
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(instance.entity_name())?;
        self.reload(instance, descriptor, LockMode::None)?;
        self.fire_post_load()
    }

    pub(crate) fn detach_one(&mut self, instance: &EntityRef) {
        if self.identity_map.remove(instance).is_some() {
            tracing::trace!(entity = instance.entity_name(), "Detached instance");
        }
    }

    pub(crate) fn lock_one(&mut self, instance: &EntityRef, lock_mode: LockMode) -> Result<()> {
        if self.identity_map.owns_proxy(instance) {
            self.initialize(instance)?;
        }
        let Some(entry) = self.identity_map.entry_for(instance) else {
            return Ok(());
        };
        if entry.status().is_deleted_or_gone() {
            return Err(Error::InvalidState(format!("cannot lock removed instance {}", entry.key())));
        }
        let metadata = Arc::clone(&self.metadata);
        let descriptor = metadata.descriptor(instance.entity_name())?;
        self.upgrade_lock(instance, descriptor, lock_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persist_core::{AttributeDescriptor, CascadeStyle, EntityDescriptor, Metamodel, SqlType};

    /// Records what the walk reached.
    #[derive(Default)]
    struct Recorder {
        applied: Vec<String>,
        initialized: Vec<String>,
    }

    fn label(instance: &EntityRef) -> String {
        format!(
            "{}#{}",
            instance.entity_name(),
            instance.id().map(|id| id.to_string()).unwrap_or_default()
        )
    }

    impl CascadeTarget for Recorder {
        fn apply(&mut self, _op: CascadeOp, instance: &EntityRef) -> Result<()> {
            self.applied.push(label(instance));
            Ok(())
        }

        fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()> {
            self.initialized.push(format!("{}.{attribute}", label(owner)));
            owner.set_collection_state(attribute, CollectionState::Initialized(Vec::new()));
            Ok(())
        }
    }

    fn model() -> Metamodel {
        let author = EntityDescriptor::new(
            "Author",
            "author",
            AttributeDescriptor::basic("id", SqlType::BigInt),
        )
        .attribute(
            AttributeDescriptor::one_to_many("books", "Book", "author").cascade(CascadeStyle::ALL),
        )
        .attribute(
            AttributeDescriptor::to_one("mentor", "Author", "mentor_id")
                .nullable(true)
                .cascade(CascadeStyle::of(CascadeOp::Persist)),
        );
        let book = EntityDescriptor::new("Book", "book", AttributeDescriptor::basic("id", SqlType::BigInt))
            .attribute(
                AttributeDescriptor::to_one("author", "Author", "author_id")
                    .cascade(CascadeStyle::ALL),
            );
        Metamodel::builder().entity(author).entity(book).build().unwrap()
    }

    #[test]
    fn test_cycle_visits_each_instance_once() {
        let metamodel = model();
        let author = EntityRef::new("Author").with_id(1_i64);
        let first = EntityRef::new("Book")
            .with_id(10_i64)
            .with_reference("author", Some(&author));
        let second = EntityRef::new("Book")
            .with_id(11_i64)
            .with_reference("author", Some(&author));
        let author = author.with_elements("books", vec![first, second]);

        let mut recorder = Recorder::default();
        let mut visited = HashSet::new();
        let applied = cascade(&metamodel, CascadeOp::Persist, &author, &mut visited, &mut recorder).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(recorder.applied, vec!["Author#1", "Book#10", "Book#11"]);
    }

    #[test]
    fn test_self_reference_terminates() {
        let metamodel = model();
        let author = EntityRef::new("Author").with_id(1_i64);
        author.set_reference("mentor", Some(&author)).unwrap();

        let mut recorder = Recorder::default();
        let mut visited = HashSet::new();
        cascade(&metamodel, CascadeOp::Persist, &author, &mut visited, &mut recorder).unwrap();
        assert_eq!(recorder.applied, vec!["Author#1"]);
    }

    #[test]
    fn test_style_limits_propagation() {
        let metamodel = model();
        let mentor = EntityRef::new("Author").with_id(2_i64);
        let author = EntityRef::new("Author")
            .with_id(1_i64)
            .with_reference("mentor", Some(&mentor));

        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Remove, &author, &mut HashSet::new(), &mut recorder).unwrap();
        assert_eq!(recorder.applied, vec!["Author#1"]);

        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Persist, &author, &mut HashSet::new(), &mut recorder).unwrap();
        assert_eq!(recorder.applied, vec!["Author#1", "Author#2"]);
    }

    #[test]
    fn test_shared_visited_set_skips_seen_roots() {
        let metamodel = model();
        let author = EntityRef::new("Author").with_id(1_i64);
        let book = EntityRef::new("Book")
            .with_id(10_i64)
            .with_reference("author", Some(&author));

        let mut recorder = Recorder::default();
        let mut visited = HashSet::new();
        cascade(&metamodel, CascadeOp::Detach, &book, &mut visited, &mut recorder).unwrap();
        let again = cascade(&metamodel, CascadeOp::Detach, &author, &mut visited, &mut recorder).unwrap();
        assert_eq!(again, 0);
        assert_eq!(recorder.applied, vec!["Book#10", "Author#1"]);
    }

    #[test]
    fn test_remove_initializes_lazy_collections() {
        let metamodel = model();
        let author = EntityRef::new("Author").with_id(1_i64);
        author.set_collection_state("books", CollectionState::Uninitialized);

        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Remove, &author, &mut HashSet::new(), &mut recorder).unwrap();
        assert_eq!(recorder.initialized, vec!["Author#1.books"]);

        author.set_collection_state("books", CollectionState::Uninitialized);
        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Refresh, &author, &mut HashSet::new(), &mut recorder).unwrap();
        assert!(recorder.initialized.is_empty());
    }

    #[test]
    fn test_remove_reaches_placeholders() {
        let metamodel = model();
        let author = EntityRef::proxy("Author", 1_i64.into());
        let book = EntityRef::new("Book")
            .with_id(10_i64)
            .with_reference("author", Some(&author));

        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Remove, &book, &mut HashSet::new(), &mut recorder).unwrap();
        assert_eq!(recorder.applied, vec!["Book#10", "Author#1"]);

        let mut recorder = Recorder::default();
        cascade(&metamodel, CascadeOp::Refresh, &book, &mut HashSet::new(), &mut recorder).unwrap();
        assert_eq!(recorder.applied, vec!["Book#10"]);
    }
}
