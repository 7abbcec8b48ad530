//! Entity instances and lazy placeholders.
//!
//! Every entity instance the engine hands out is an [`EntityRef`]: a shared
//! handle whose state is either `Uninitialized` (a proxy that only knows its
//! type and identifier) or `Initialized` (attribute values). A proxy is
//! initialized in place, so the handle the application holds becomes the
//! canonical managed instance without being replaced.
//!
//! Accessors come in two flavours:
//!
//! - **Detached accessors** (`value`, `reference`, `elements`, `set_value`, ...)
//!   never load anything. On an uninitialized proxy or collection they fail
//!   with [`Error::LazyInitialization`].
//! - **Loading accessors** (`get`, `get_reference`, `get_collection`, `set`)
//!   take a [`LazyInitializer`] (normally the owning `Session`) and initialize
//!   on first use.
//!
//! Identity equality, [`EntityRef::entity_name`], [`EntityRef::id`],
//! [`EntityRef::is_initialized`], and [`EntityRef::is_attribute_initialized`]
//! never trigger a load.

use crate::identity_map::EntityKey;
use persist_core::{Error, Result, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Loads the state behind placeholders on demand.
pub trait LazyInitializer {
    /// Initialize an entity proxy in place.
    fn initialize_entity(&mut self, entity: &EntityRef) -> Result<()>;

    /// Initialize a lazy collection attribute of `owner` in place.
    fn initialize_collection(&mut self, owner: &EntityRef, attribute: &str) -> Result<()>;
}

/// State of a collection attribute.
#[derive(Debug, Clone)]
pub enum CollectionState {
    Uninitialized,
    Initialized(Vec<EntityRef>),
}

/// Value held by one attribute of an initialized instance.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Basic(Value),
    Reference(Option<EntityRef>),
    Collection(CollectionState),
}

/// Attribute values of an initialized instance.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    id: Option<Value>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl EntityData {
    pub fn new(id: Option<Value>) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(name.into(), value);
    }

    pub(crate) fn attribute_mut(&mut self, name: &str) -> Option<&mut AttributeValue> {
        self.attributes.get_mut(name)
    }

    /// Current value of a basic attribute; unset attributes read as NULL.
    pub fn basic(&self, name: &str) -> Option<Value> {
        match self.attributes.get(name) {
            None => Some(Value::Null),
            Some(AttributeValue::Basic(v)) => Some(v.clone()),
            Some(_) => None,
        }
    }

    /// Current target of a to-one attribute; unset attributes read as `None`.
    pub fn reference(&self, name: &str) -> Option<Option<EntityRef>> {
        match self.attributes.get(name) {
            None => Some(None),
            Some(AttributeValue::Reference(r)) => Some(r.clone()),
            Some(_) => None,
        }
    }

    /// Elements of a collection attribute, or `None` if it is uninitialized.
    /// Unset collections read as empty.
    pub fn collection(&self, name: &str) -> Option<&[EntityRef]> {
        match self.attributes.get(name) {
            None => Some(&[]),
            Some(AttributeValue::Collection(CollectionState::Initialized(items))) => Some(items),
            Some(_) => None,
        }
    }
}

/// Either a proxy or a full instance.
#[derive(Debug, Clone)]
pub enum InstanceState {
    Uninitialized { id: Value },
    Initialized(EntityData),
}

struct EntityCell {
    entity: Arc<str>,
    state: RwLock<InstanceState>,
    /// Set while the instance mirrors a database row: hydrated from one or
    /// inserted by a flush. Survives detachment.
    has_row: AtomicBool,
}

/// Shared handle to an entity instance.
///
/// Clones refer to the same instance. Equality and hashing are by identity,
/// never by value.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    /// A new transient instance with no identifier.
    pub fn new(entity: &str) -> Self {
        Self::from_state(entity, InstanceState::Initialized(EntityData::default()))
    }

    /// An uninitialized placeholder.
    pub(crate) fn proxy(entity: &str, id: Value) -> Self {
        Self::from_state(entity, InstanceState::Uninitialized { id })
    }

    fn from_state(entity: &str, state: InstanceState) -> Self {
        Self(Arc::new(EntityCell {
            entity: Arc::from(entity),
            state: RwLock::new(state),
            has_row: AtomicBool::new(false),
        }))
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lazy_error(&self, id: &Value) -> Error {
        Error::LazyInitialization {
            entity: self.entity_name().to_string(),
            id: id.clone(),
        }
    }

    fn kind_error(&self, attribute: &str, expected: &str) -> Error {
        Error::Mapping(format!(
            "{}.{attribute} is not a {expected} attribute",
            self.entity_name()
        ))
    }

    // ------------------------------------------------------------------
    // Builders for transient instances. They are no-ops on proxies.
    // ------------------------------------------------------------------

    /// Assign an identifier to an instance that has none.
    ///
    /// An identifier, once assigned, is part of the instance's identity-map
    /// key and is never replaced; calling this on such an instance leaves it
    /// unchanged.
    #[must_use]
    pub fn with_id(self, id: impl Into<Value>) -> Self {
        if let InstanceState::Initialized(data) = &mut *self.write() {
            match &data.id {
                None => data.id = Some(id.into()),
                Some(current) => tracing::warn!(
                    entity = %self.0.entity,
                    id = %current,
                    "Ignoring attempt to replace an assigned identifier"
                ),
            }
        }
        self
    }

    #[must_use]
    pub fn with_value(self, attribute: &str, value: impl Into<Value>) -> Self {
        if let InstanceState::Initialized(data) = &mut *self.write() {
            data.insert(attribute, AttributeValue::Basic(value.into()));
        }
        self
    }

    #[must_use]
    pub fn with_reference(self, attribute: &str, target: Option<&EntityRef>) -> Self {
        if let InstanceState::Initialized(data) = &mut *self.write() {
            data.insert(attribute, AttributeValue::Reference(target.cloned()));
        }
        self
    }

    #[must_use]
    pub fn with_elements(self, attribute: &str, elements: Vec<EntityRef>) -> Self {
        if let InstanceState::Initialized(data) = &mut *self.write() {
            data.insert(
                attribute,
                AttributeValue::Collection(CollectionState::Initialized(elements)),
            );
        }
        self
    }

    // ------------------------------------------------------------------
    // Accessors that never load.
    // ------------------------------------------------------------------

    pub fn entity_name(&self) -> &str {
        &self.0.entity
    }

    /// Identifier, if assigned.
    pub fn id(&self) -> Option<Value> {
        match &*self.read() {
            InstanceState::Uninitialized { id } => Some(id.clone()),
            InstanceState::Initialized(data) => data.id.clone(),
        }
    }

    /// Identity-map key, if an identifier is assigned.
    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(|id| EntityKey::new(self.entity_name(), id))
    }

    pub fn is_initialized(&self) -> bool {
        matches!(&*self.read(), InstanceState::Initialized(_))
    }

    /// Whether the instance stands for an existing database row: a
    /// placeholder, an instance read from a row, or one whose insert was
    /// flushed. Stays true after the instance is detached.
    pub fn has_row(&self) -> bool {
        !self.is_initialized() || self.0.has_row.load(Ordering::Relaxed)
    }

    /// Whether reading `attribute` would not need a load.
    pub fn is_attribute_initialized(&self, attribute: &str) -> bool {
        match &*self.read() {
            InstanceState::Uninitialized { .. } => false,
            InstanceState::Initialized(data) => !matches!(
                data.attribute(attribute),
                Some(AttributeValue::Collection(CollectionState::Uninitialized))
            ),
        }
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(a: &EntityRef, b: &EntityRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Value of a basic attribute.
    pub fn value(&self, attribute: &str) -> Result<Value> {
        match &*self.read() {
            InstanceState::Uninitialized { id } => Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => data
                .basic(attribute)
                .ok_or_else(|| self.kind_error(attribute, "basic")),
        }
    }

    /// Target of a to-one attribute. The target may itself be a proxy.
    pub fn reference(&self, attribute: &str) -> Result<Option<EntityRef>> {
        match &*self.read() {
            InstanceState::Uninitialized { id } => Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => data
                .reference(attribute)
                .ok_or_else(|| self.kind_error(attribute, "to-one")),
        }
    }

    /// Elements of a collection attribute.
    pub fn elements(&self, attribute: &str) -> Result<Vec<EntityRef>> {
        match &*self.read() {
            InstanceState::Uninitialized { id } => Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => match data.attribute(attribute) {
                Some(AttributeValue::Collection(CollectionState::Uninitialized)) => {
                    Err(self.lazy_error(data.id.as_ref().unwrap_or(&Value::Null)))
                }
                _ => data
                    .collection(attribute)
                    .map(<[EntityRef]>::to_vec)
                    .ok_or_else(|| self.kind_error(attribute, "collection")),
            },
        }
    }

    pub fn set_value(&self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.write();
        match &mut *state {
            InstanceState::Uninitialized { id } => Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => match data.attribute(attribute) {
                None | Some(AttributeValue::Basic(_)) => {
                    data.insert(attribute, AttributeValue::Basic(value.into()));
                    Ok(())
                }
                Some(_) => Err(self.kind_error(attribute, "basic")),
            },
        }
    }

    pub fn set_reference(&self, attribute: &str, target: Option<&EntityRef>) -> Result<()> {
        let mut state = self.write();
        match &mut *state {
            InstanceState::Uninitialized { id } => Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => match data.attribute(attribute) {
                None | Some(AttributeValue::Reference(_)) => {
                    data.insert(attribute, AttributeValue::Reference(target.cloned()));
                    Ok(())
                }
                Some(_) => Err(self.kind_error(attribute, "to-one")),
            },
        }
    }

    /// Add an element to a collection. Collections hold each instance at most
    /// once; adding a present element is a no-op.
    pub fn add_element(&self, attribute: &str, element: &EntityRef) -> Result<()> {
        let mut state = self.write();
        let data = match &mut *state {
            InstanceState::Uninitialized { id } => return Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => data,
        };
        let owner_id = data.id.clone().unwrap_or(Value::Null);
        match data.attribute_mut(attribute) {
            None => {
                data.insert(
                    attribute,
                    AttributeValue::Collection(CollectionState::Initialized(vec![element.clone()])),
                );
                Ok(())
            }
            Some(AttributeValue::Collection(CollectionState::Initialized(items))) => {
                if !items.iter().any(|e| e == element) {
                    items.push(element.clone());
                }
                Ok(())
            }
            Some(AttributeValue::Collection(CollectionState::Uninitialized)) => {
                Err(self.lazy_error(&owner_id))
            }
            Some(_) => Err(self.kind_error(attribute, "collection")),
        }
    }

    /// Remove an element from a collection, returning whether it was present.
    pub fn remove_element(&self, attribute: &str, element: &EntityRef) -> Result<bool> {
        let mut state = self.write();
        let data = match &mut *state {
            InstanceState::Uninitialized { id } => return Err(self.lazy_error(id)),
            InstanceState::Initialized(data) => data,
        };
        let owner_id = data.id.clone().unwrap_or(Value::Null);
        match data.attribute_mut(attribute) {
            None => Ok(false),
            Some(AttributeValue::Collection(CollectionState::Initialized(items))) => {
                let before = items.len();
                items.retain(|e| e != element);
                Ok(items.len() != before)
            }
            Some(AttributeValue::Collection(CollectionState::Uninitialized)) => {
                Err(self.lazy_error(&owner_id))
            }
            Some(_) => Err(self.kind_error(attribute, "collection")),
        }
    }

    // ------------------------------------------------------------------
    // Accessors that initialize on demand.
    // ------------------------------------------------------------------

    /// Read a basic attribute, initializing the instance first if needed.
    pub fn get(&self, loader: &mut dyn LazyInitializer, attribute: &str) -> Result<Value> {
        self.ensure_initialized(loader)?;
        self.value(attribute)
    }

    /// Read a to-one attribute, initializing the instance first if needed.
    pub fn get_reference(
        &self,
        loader: &mut dyn LazyInitializer,
        attribute: &str,
    ) -> Result<Option<EntityRef>> {
        self.ensure_initialized(loader)?;
        self.reference(attribute)
    }

    /// Read a collection, initializing the instance and the collection if needed.
    pub fn get_collection(
        &self,
        loader: &mut dyn LazyInitializer,
        attribute: &str,
    ) -> Result<Vec<EntityRef>> {
        self.ensure_initialized(loader)?;
        if !self.is_attribute_initialized(attribute) {
            loader.initialize_collection(self, attribute)?;
        }
        self.elements(attribute)
    }

    /// Write a basic attribute, initializing the instance first if needed.
    pub fn set(
        &self,
        loader: &mut dyn LazyInitializer,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.ensure_initialized(loader)?;
        self.set_value(attribute, value)
    }

    fn ensure_initialized(&self, loader: &mut dyn LazyInitializer) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        loader.initialize_entity(self)
    }

    // ------------------------------------------------------------------
    // Engine-side state access.
    // ------------------------------------------------------------------

    /// Run `f` over the attribute values, or return `None` for a proxy.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&EntityData) -> R) -> Option<R> {
        match &*self.read() {
            InstanceState::Uninitialized { .. } => None,
            InstanceState::Initialized(data) => Some(f(data)),
        }
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut EntityData) -> R) -> Option<R> {
        match &mut *self.write() {
            InstanceState::Uninitialized { .. } => None,
            InstanceState::Initialized(data) => Some(f(data)),
        }
    }

    /// Replace the whole state with data read from a row.
    pub(crate) fn hydrate(&self, data: EntityData) {
        *self.write() = InstanceState::Initialized(data);
        self.set_has_row(true);
    }

    pub(crate) fn set_has_row(&self, has_row: bool) {
        self.0.has_row.store(has_row, Ordering::Relaxed);
    }

    /// Assign a generated identifier to a transient instance.
    pub(crate) fn assign_id(&self, id: Value) {
        if let InstanceState::Initialized(data) = &mut *self.write() {
            data.id = Some(id);
        }
    }

    pub(crate) fn set_collection_state(&self, attribute: &str, state: CollectionState) {
        self.with_data_mut(|data| data.insert(attribute, AttributeValue::Collection(state)));
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (id, initialized) = match &*self.read() {
            InstanceState::Uninitialized { id } => (Some(id.clone()), false),
            InstanceState::Initialized(data) => (data.id.clone(), true),
        };
        match id {
            Some(id) if initialized => write!(f, "{}#{id}", self.entity_name()),
            Some(id) => write!(f, "{}#{id}(proxy)", self.entity_name()),
            None => write!(f, "{}#<transient>", self.entity_name()),
        }
    }
}
