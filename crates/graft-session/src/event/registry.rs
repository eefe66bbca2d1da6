//! Per-factory listener registry.
//!
//! # Design
//!
//! The registry owns one [`EventListenerGroup`] per [`EventKind`], stored in
//! an explicit kind-to-slot table that is populated when the registry is
//! built. Each slot is type-erased and recovered with the listener trait
//! carried by the [`EventType`] handle, so a lookup either yields the right
//! group or fails with `UnregisteredEventType`.
//!
//! Listeners registered by type are instantiated once and cached by
//! [`TypeId`]; a type implementing several listener traits is shared by all
//! groups it joins.

use super::event_type::{EventKind, EventType};
use super::listener::{InstantiableListener, IntoListener, Listener, ListenerClass};
use graft_core::{Error, RegistrationError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::listener::{
    ClearEventListener, DeleteEventListener, EvictEventListener, FlushEventListener,
    LoadEventListener, LockEventListener, MergeEventListener, PersistEventListener,
    PostDeleteEventListener, PostInsertEventListener, PostLoadEventListener,
    PostUpdateEventListener, PreDeleteEventListener, PreInsertEventListener,
    PreUpdateEventListener, RefreshEventListener,
};

// ============================================================================
// Duplication strategies
// ============================================================================

/// Identity of a registered (or candidate) listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerIdentity {
    pub class: ListenerClass,
    /// Address of the shared instance.
    pub address: usize,
}

impl ListenerIdentity {
    fn of<L: ?Sized + Listener>(listener: &Arc<L>) -> Self {
        let target: &L = listener;
        Self {
            class: target.listener_class(),
            address: Arc::as_ptr(listener).cast::<()>() as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicationAction {
    /// Reject the new listener with a registration error.
    Error,
    /// Keep the registered listener and drop the new one.
    KeepOriginal,
    /// Put the new listener in the registered one's position.
    ReplaceOriginal,
}

/// Decides whether a listener being added duplicates a registered one.
pub trait DuplicationStrategy: Send + Sync + fmt::Debug {
    fn are_match(&self, added: &ListenerIdentity, existing: &ListenerIdentity) -> bool;

    fn action(&self) -> DuplicationAction;
}

/// Listeners of the same runtime class are duplicates.
#[derive(Debug, Clone, Copy)]
pub struct SameClassStrategy {
    pub action: DuplicationAction,
}

impl SameClassStrategy {
    pub fn new(action: DuplicationAction) -> Self {
        Self { action }
    }
}

impl DuplicationStrategy for SameClassStrategy {
    fn are_match(&self, added: &ListenerIdentity, existing: &ListenerIdentity) -> bool {
        added.class == existing.class
    }

    fn action(&self) -> DuplicationAction {
        self.action
    }
}

/// Re-registering the very same instance is a no-op.
#[derive(Debug)]
struct SameInstanceStrategy;

impl DuplicationStrategy for SameInstanceStrategy {
    fn are_match(&self, added: &ListenerIdentity, existing: &ListenerIdentity) -> bool {
        added.address == existing.address
    }

    fn action(&self) -> DuplicationAction {
        DuplicationAction::KeepOriginal
    }
}

// ============================================================================
// EventListenerGroup
// ============================================================================

/// Ordered listeners of one event kind.
pub struct EventListenerGroup<L: ?Sized> {
    kind: EventKind,
    listeners: Vec<Arc<L>>,
    strategies: Vec<Arc<dyn DuplicationStrategy>>,
}

enum Placement {
    Add,
    Skip,
}

impl<L: ?Sized + Listener> EventListenerGroup<L> {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            listeners: Vec::new(),
            strategies: vec![Arc::new(SameInstanceStrategy)],
        }
    }

    pub fn event_kind(&self) -> EventKind {
        self.kind
    }

    pub fn listeners(&self) -> &[Arc<L>] {
        &self.listeners
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<L>> {
        self.listeners.iter()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn add_duplication_strategy(&mut self, strategy: Arc<dyn DuplicationStrategy>) {
        self.strategies.push(strategy);
    }

    /// Consult strategies in registration order; the first match decides.
    fn placement(&mut self, listener: &Arc<L>) -> Result<Placement> {
        let added = ListenerIdentity::of(listener);
        for strategy in &self.strategies {
            let matched = self
                .listeners
                .iter()
                .position(|existing| strategy.are_match(&added, &ListenerIdentity::of(existing)));
            let Some(position) = matched else { continue };
            return match strategy.action() {
                DuplicationAction::Error => Err(Error::Registration(RegistrationError {
                    listener: added.class.name.to_string(),
                    message: format!("duplicate event listener found for {}", self.kind),
                    source: None,
                })),
                DuplicationAction::KeepOriginal => {
                    tracing::trace!(event = %self.kind, listener = added.class.name, "Keeping original listener");
                    Ok(Placement::Skip)
                }
                DuplicationAction::ReplaceOriginal => {
                    tracing::trace!(event = %self.kind, listener = added.class.name, "Replacing original listener");
                    self.listeners[position] = Arc::clone(listener);
                    Ok(Placement::Skip)
                }
            };
        }
        Ok(Placement::Add)
    }

    pub fn append_listener(&mut self, listener: Arc<L>) -> Result<()> {
        if let Placement::Add = self.placement(&listener)? {
            self.listeners.push(listener);
        }
        Ok(())
    }

    pub fn prepend_listener(&mut self, listener: Arc<L>) -> Result<()> {
        if let Placement::Add = self.placement(&listener)? {
            self.listeners.insert(0, listener);
        }
        Ok(())
    }

    pub fn append_listeners(&mut self, listeners: impl IntoIterator<Item = Arc<L>>) -> Result<()> {
        listeners
            .into_iter()
            .try_for_each(|l| self.append_listener(l))
    }

    /// Prepend keeping the given relative order.
    pub fn prepend_listeners(&mut self, listeners: Vec<Arc<L>>) -> Result<()> {
        listeners
            .into_iter()
            .rev()
            .try_for_each(|l| self.prepend_listener(l))
    }
}

impl<L: ?Sized + Listener> fmt::Debug for EventListenerGroup<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .listeners
            .iter()
            .map(|l| ListenerIdentity::of(l).class.name)
            .collect();
        f.debug_struct("EventListenerGroup")
            .field("kind", &self.kind)
            .field("listeners", &names)
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

// ============================================================================
// EventListenerRegistry
// ============================================================================

type Slot = Box<dyn Any + Send + Sync>;

fn empty_slot(kind: EventKind) -> Slot {
    match kind {
        EventKind::Load => Box::new(EventListenerGroup::<dyn LoadEventListener>::new(kind)),
        EventKind::PostLoad => Box::new(EventListenerGroup::<dyn PostLoadEventListener>::new(kind)),
        EventKind::Persist => Box::new(EventListenerGroup::<dyn PersistEventListener>::new(kind)),
        EventKind::Merge => Box::new(EventListenerGroup::<dyn MergeEventListener>::new(kind)),
        EventKind::Delete => Box::new(EventListenerGroup::<dyn DeleteEventListener>::new(kind)),
        EventKind::Evict => Box::new(EventListenerGroup::<dyn EvictEventListener>::new(kind)),
        EventKind::Refresh => Box::new(EventListenerGroup::<dyn RefreshEventListener>::new(kind)),
        EventKind::Lock => Box::new(EventListenerGroup::<dyn LockEventListener>::new(kind)),
        EventKind::Flush => Box::new(EventListenerGroup::<dyn FlushEventListener>::new(kind)),
        EventKind::Clear => Box::new(EventListenerGroup::<dyn ClearEventListener>::new(kind)),
        EventKind::PreInsert => {
            Box::new(EventListenerGroup::<dyn PreInsertEventListener>::new(kind))
        }
        EventKind::PreUpdate => {
            Box::new(EventListenerGroup::<dyn PreUpdateEventListener>::new(kind))
        }
        EventKind::PreDelete => {
            Box::new(EventListenerGroup::<dyn PreDeleteEventListener>::new(kind))
        }
        EventKind::PostInsert | EventKind::PostCommitInsert => {
            Box::new(EventListenerGroup::<dyn PostInsertEventListener>::new(kind))
        }
        EventKind::PostUpdate | EventKind::PostCommitUpdate => {
            Box::new(EventListenerGroup::<dyn PostUpdateEventListener>::new(kind))
        }
        EventKind::PostDelete | EventKind::PostCommitDelete => {
            Box::new(EventListenerGroup::<dyn PostDeleteEventListener>::new(kind))
        }
    }
}

/// Listener groups of one session factory.
pub struct EventListenerRegistry {
    slots: HashMap<EventKind, Slot>,
    instances: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Default for EventListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListenerRegistry {
    /// Registry with an empty group for every event kind.
    pub fn new() -> Self {
        Self::with_kinds(&EventKind::ALL)
    }

    /// Registry that only knows the given kinds.
    pub fn with_kinds(kinds: &[EventKind]) -> Self {
        Self {
            slots: kinds.iter().map(|k| (*k, empty_slot(*k))).collect(),
            instances: HashMap::new(),
        }
    }

    pub fn group<L: ?Sized + Listener>(&self, ty: &EventType<L>) -> Result<&EventListenerGroup<L>> {
        self.slots
            .get(&ty.kind())
            .and_then(|slot| slot.downcast_ref::<EventListenerGroup<L>>())
            .ok_or_else(|| Error::UnregisteredEventType(ty.name().to_string()))
    }

    pub fn group_mut<L: ?Sized + Listener>(
        &mut self,
        ty: &EventType<L>,
    ) -> Result<&mut EventListenerGroup<L>> {
        self.slots
            .get_mut(&ty.kind())
            .and_then(|slot| slot.downcast_mut::<EventListenerGroup<L>>())
            .ok_or_else(|| Error::UnregisteredEventType(ty.name().to_string()))
    }

    /// Replace the group's listeners.
    pub fn set_listeners<L: ?Sized + Listener>(
        &mut self,
        ty: &EventType<L>,
        listeners: Vec<Arc<L>>,
    ) -> Result<()> {
        let group = self.group_mut(ty)?;
        group.clear();
        group.append_listeners(listeners)
    }

    pub fn append_listeners<L: ?Sized + Listener>(
        &mut self,
        ty: &EventType<L>,
        listeners: Vec<Arc<L>>,
    ) -> Result<()> {
        self.group_mut(ty)?.append_listeners(listeners)
    }

    pub fn prepend_listeners<L: ?Sized + Listener>(
        &mut self,
        ty: &EventType<L>,
        listeners: Vec<Arc<L>>,
    ) -> Result<()> {
        self.group_mut(ty)?.prepend_listeners(listeners)
    }

    pub fn set_listener_class<L, T>(&mut self, ty: &EventType<L>) -> Result<()>
    where
        L: ?Sized + Listener,
        T: InstantiableListener + IntoListener<L>,
    {
        let listener = self.resolve_listener_instance::<T>()?;
        self.set_listeners(ty, vec![<T as IntoListener<L>>::into_listener(listener)])
    }

    pub fn append_listener_class<L, T>(&mut self, ty: &EventType<L>) -> Result<()>
    where
        L: ?Sized + Listener,
        T: InstantiableListener + IntoListener<L>,
    {
        let listener = self.resolve_listener_instance::<T>()?;
        self.group_mut(ty)?
            .append_listener(<T as IntoListener<L>>::into_listener(listener))
    }

    pub fn prepend_listener_class<L, T>(&mut self, ty: &EventType<L>) -> Result<()>
    where
        L: ?Sized + Listener,
        T: InstantiableListener + IntoListener<L>,
    {
        let listener = self.resolve_listener_instance::<T>()?;
        self.group_mut(ty)?
            .prepend_listener(<T as IntoListener<L>>::into_listener(listener))
    }

    /// Add `strategy` to every group.
    pub fn add_duplication_strategy(&mut self, strategy: Arc<dyn DuplicationStrategy>) {
        macro_rules! add_to {
            ($slot:expr, $($listener:ident),*) => {
                $(
                    if let Some(group) = $slot.downcast_mut::<EventListenerGroup<dyn $listener>>() {
                        group.add_duplication_strategy(Arc::clone(&strategy));
                        continue;
                    }
                )*
            };
        }
        for slot in self.slots.values_mut() {
            add_to!(
                slot,
                LoadEventListener,
                PostLoadEventListener,
                PersistEventListener,
                MergeEventListener,
                DeleteEventListener,
                EvictEventListener,
                RefreshEventListener,
                LockEventListener,
                FlushEventListener,
                ClearEventListener,
                PreInsertEventListener,
                PreUpdateEventListener,
                PreDeleteEventListener,
                PostInsertEventListener,
                PostUpdateEventListener,
                PostDeleteEventListener
            );
        }
    }

    /// Cached instance of `T`, created on first request.
    fn resolve_listener_instance<T: InstantiableListener>(&mut self) -> Result<Arc<T>> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.instances.get(&type_id) {
            if let Ok(instance) = Arc::clone(existing).downcast::<T>() {
                return Ok(instance);
            }
        }
        let name = std::any::type_name::<T>();
        let instance = T::instantiate().map_err(|source| {
            Error::Registration(RegistrationError {
                listener: name.to_string(),
                message: format!("unable to instantiate event listener {name}"),
                source: Some(source),
            })
        })?;
        tracing::debug!(listener = name, "Instantiated event listener");
        let instance = Arc::new(instance);
        self.instances
            .insert(type_id, Arc::clone(&instance) as Arc<dyn Any + Send + Sync>);
        Ok(instance)
    }
}

impl fmt::Debug for EventListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<EventKind> = self.slots.keys().copied().collect();
        kinds.sort();
        f.debug_struct("EventListenerRegistry")
            .field("kinds", &kinds)
            .field("instances", &self.instances.len())
            .finish()
    }
}
