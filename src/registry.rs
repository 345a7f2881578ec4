//! Shared named-instance registry
//!
//! Every guard kind is cached by name in a [`Registry`]. Lookup is
//! compute-if-absent over a sharded concurrent map: racing callers asking for
//! the same name always receive the same instance and the constructor runs at
//! most once per name. Entry additions and removals are published on the
//! registry's own event bus.

use crate::events::{BusEvent, EventBus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Constructor contract a guard implements to be registry-managed.
pub trait NamedGuard: Send + Sync + 'static {
    /// Immutable configuration bound to an instance at creation.
    type Config: Clone + Send + Sync + 'static;

    /// Build a fresh instance for `name`.
    fn with_config(name: &str, config: Self::Config) -> Self;
}

/// Kind tag for registry lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    /// A new instance was created and cached.
    EntryAdded,
    /// An instance was removed from the cache.
    EntryRemoved,
}

/// Lifecycle event emitted by a registry.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    /// Name of the added or removed entry.
    pub entry_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub kind: RegistryEventKind,
}

impl RegistryEvent {
    fn new(entry_name: &str, kind: RegistryEventKind) -> Self {
        Self {
            entry_name: entry_name.to_string(),
            created_at: SystemTime::now(),
            kind,
        }
    }
}

impl BusEvent for RegistryEvent {
    type Kind = RegistryEventKind;

    fn entity_name(&self) -> &str {
        &self.entry_name
    }

    fn kind(&self) -> RegistryEventKind {
        self.kind
    }
}

/// Named-instance cache for one guard kind.
pub struct Registry<T: NamedGuard> {
    default_config: T::Config,
    entries: DashMap<String, Arc<T>>,
    events: EventBus<RegistryEvent>,
}

impl<T: NamedGuard> Registry<T> {
    /// Create a registry whose `get_or_create` uses `default_config`.
    pub fn new(default_config: T::Config) -> Self {
        Self {
            default_config,
            entries: DashMap::new(),
            events: EventBus::new(),
        }
    }

    /// Get the instance registered under `name`, creating it with the
    /// registry's default config when absent.
    pub fn get_or_create(&self, name: &str) -> Arc<T> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the instance registered under `name`, creating it with `config`
    /// when absent. An existing instance keeps its original config.
    pub fn get_or_create_with(&self, name: &str, config: T::Config) -> Arc<T> {
        let mut created = false;
        let instance = match self.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let instance = Arc::new(T::with_config(name, config));
                vacant.insert(Arc::clone(&instance));
                created = true;
                instance
            }
        };
        if created {
            self.events
                .publish(RegistryEvent::new(name, RegistryEventKind::EntryAdded));
        }
        instance
    }

    /// Look up an instance without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove and return the instance registered under `name`, publishing an
    /// `EntryRemoved` event when one existed.
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        let removed = self.entries.remove(name).map(|(_, instance)| instance);
        if removed.is_some() {
            self.events
                .publish(RegistryEvent::new(name, RegistryEventKind::EntryRemoved));
        }
        removed
    }

    /// Visit every registered instance.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &Arc<T>)) {
        for entry in self.entries.iter() {
            visit(entry.key(), entry.value());
        }
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lifecycle event bus.
    pub fn events(&self) -> &EventBus<RegistryEvent> {
        &self.events
    }
}

impl<T: NamedGuard> Default for Registry<T>
where
    T::Config: Default,
{
    fn default() -> Self {
        Self::new(T::Config::default())
    }
}

impl<T: NamedGuard> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
