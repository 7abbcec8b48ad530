//! Entity lifecycle listeners and session flush callbacks.
//!
//! Listeners are registered per entity type with a [`ListenerLifecycle`]
//! strategy chosen once at registration: `Immediate` builds the listener
//! right away, `Delayed` builds it on the first event it receives. On
//! `Session::clear` delayed listeners that were built are dropped, and rebuilt
//! if another event arrives later.

use crate::proxy::EntityRef;
use persist_core::Result;
use std::fmt;

/// Entity lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PostLoad,
}

/// Receives lifecycle events for one entity type.
///
/// Returning `Err` from a `Pre*` event aborts the operation that fired it.
pub trait EntityListener: Send {
    fn on_event(&mut self, event: LifecycleEvent, entity: &EntityRef) -> Result<()>;
}

impl<F> EntityListener for F
where
    F: FnMut(LifecycleEvent, &EntityRef) -> Result<()> + Send,
{
    fn on_event(&mut self, event: LifecycleEvent, entity: &EntityRef) -> Result<()> {
        self(event, entity)
    }
}

/// When a listener instance is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerLifecycle {
    #[default]
    Immediate,
    Delayed,
}

type ListenerFactory = Box<dyn Fn() -> Box<dyn EntityListener> + Send>;

enum ListenerSlot {
    Immediate(Box<dyn EntityListener>),
    Delayed {
        factory: ListenerFactory,
        instance: Option<Box<dyn EntityListener>>,
    },
}

impl ListenerSlot {
    fn instance(&mut self) -> &mut Box<dyn EntityListener> {
        match self {
            ListenerSlot::Immediate(listener) => listener,
            ListenerSlot::Delayed { factory, instance } => instance.get_or_insert_with(|| factory()),
        }
    }

    fn is_created(&self) -> bool {
        match self {
            ListenerSlot::Immediate(_) => true,
            ListenerSlot::Delayed { instance, .. } => instance.is_some(),
        }
    }
}

struct Registration {
    entity: String,
    slot: ListenerSlot,
}

/// Lifecycle listeners keyed by entity type.
#[derive(Default)]
pub struct ListenerRegistry {
    registrations: Vec<Registration>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("registered", &self.registrations.len())
            .field("created", &self.created_count())
            .finish()
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `entity` built by `factory`.
    pub fn register<F, L>(&mut self, entity: &str, lifecycle: ListenerLifecycle, factory: F)
    where
        F: Fn() -> L + Send + 'static,
        L: EntityListener + 'static,
    {
        let slot = match lifecycle {
            ListenerLifecycle::Immediate => ListenerSlot::Immediate(Box::new(factory())),
            ListenerLifecycle::Delayed => ListenerSlot::Delayed {
                factory: Box::new(move || Box::new(factory()) as Box<dyn EntityListener>),
                instance: None,
            },
        };
        tracing::debug!(entity = entity, lifecycle = ?lifecycle, "Registered entity listener");
        self.registrations.push(Registration {
            entity: entity.to_string(),
            slot,
        });
    }

    /// Deliver `event` to every listener of the instance's entity type, in
    /// registration order. Stops at the first error.
    pub fn fire(&mut self, event: LifecycleEvent, entity: &EntityRef) -> Result<()> {
        for registration in &mut self.registrations {
            if registration.entity == entity.entity_name() {
                registration.slot.instance().on_event(event, entity)?;
            }
        }
        Ok(())
    }

    pub fn has_listeners(&self, entity: &str) -> bool {
        self.registrations.iter().any(|r| r.entity == entity)
    }

    /// Number of listener instances currently built.
    pub fn created_count(&self) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.slot.is_created())
            .count()
    }

    /// Drop every delayed listener that was built, returning how many.
    pub fn release(&mut self) -> usize {
        let mut released = 0;
        for registration in &mut self.registrations {
            if let ListenerSlot::Delayed { instance, .. } = &mut registration.slot {
                if instance.take().is_some() {
                    released += 1;
                }
            }
        }
        released
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` aborts the flush.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Session-level flush events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before the flush plans any work.
    BeforeFlush,
    /// Fired after a flush completes successfully.
    AfterFlush,
}

/// Holds registered session-level callbacks.
#[derive(Default)]
pub struct FlushCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
}

impl fmt::Debug for FlushCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .finish()
    }
}

impl FlushCallbacks {
    pub fn register(&mut self, event: SessionEvent, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks_mut(event).push(Box::new(f));
    }

    pub fn fire(&mut self, event: SessionEvent) -> Result<()> {
        for cb in self.callbacks_mut(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }

    fn callbacks_mut(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
        }
    }
}
