//! Relay registry.
//!
//! Guarantees at most one relay per (owner, event) pair. The registry indexes
//! relays by owner without owning the owner: entries for owners that are gone
//! are swept lazily as registrations come in.
//!
//! The registry lock is released before any relay is touched, including the
//! first-attach callback, so registry and relay locks are never nested.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::debug;

use crate::catalog::{EventCatalog, EventSource};
use crate::config::RegistryConfig;
use crate::descriptor::{DynOwner, EventDescriptor};
use crate::error::{lock_err, RelayResult, ValidationError};
use crate::relay::table::{owner_key, OwnerKey};
use crate::relay::Relay;

struct OwnerRelays {
    owner: Weak<DynOwner>,
    relays: Vec<Relay>,
}

impl OwnerRelays {
    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

#[derive(Default)]
struct RegistryState {
    owners: HashMap<OwnerKey, OwnerRelays>,
    registrations: usize,
}

/// Index of relays, one per (owner, event).
pub struct RelayRegistry {
    config: RegistryConfig,
    catalog: Arc<EventCatalog>,
    state: Mutex<RegistryState>,
}

static GLOBAL_REGISTRY: OnceLock<RelayRegistry> = OnceLock::new();

impl RelayRegistry {
    /// A registry with its own catalog.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_catalog(config, Arc::new(EventCatalog::new()))
    }

    /// A registry resolving event names through `catalog`.
    #[must_use]
    pub fn with_catalog(config: RegistryConfig, catalog: Arc<EventCatalog>) -> Self {
        Self {
            config,
            catalog,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The process-wide registry, created with default config on first use
    /// and never torn down.
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL_REGISTRY.get_or_init(|| Self::with_catalog(RegistryConfig::default(), EventCatalog::global()))
    }

    /// Catalog used for name lookups.
    #[must_use]
    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn state(&self) -> RelayResult<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| lock_err("relay registry"))
    }

    /// The relay for event `event` of `owner`, created on first request.
    pub fn register_weak_event<S: EventSource>(&self, owner: &Arc<S>, event: &str) -> RelayResult<Relay> {
        let descriptor = self.catalog.resolve::<S>(event)?;
        self.register_descriptor(owner, &descriptor)
    }

    /// Like [`Self::register_weak_event`]; `on_first_attach` runs once, when
    /// the relay is created, to wire the real event to the relay.
    pub fn register_weak_event_with<S, F>(&self, owner: &Arc<S>, event: &str, on_first_attach: F) -> RelayResult<Relay>
    where
        S: EventSource,
        F: FnOnce(&Arc<S>, &Relay),
    {
        let descriptor = self.catalog.resolve::<S>(event)?;
        self.register_descriptor_with(owner, &descriptor, on_first_attach)
    }

    /// The relay for `descriptor` on `owner`, created on first request.
    pub fn register_descriptor<S>(&self, owner: &Arc<S>, descriptor: &EventDescriptor) -> RelayResult<Relay>
    where
        S: Any + Send + Sync,
    {
        self.register_descriptor_with(owner, descriptor, |_, _| {})
    }

    /// Like [`Self::register_descriptor`] with a first-attach callback.
    ///
    /// Fails with `UnknownEvent` when `descriptor` is not declared on `S` and
    /// with `StaticEventUnsupported` for static events.
    pub fn register_descriptor_with<S, F>(
        &self,
        owner: &Arc<S>,
        descriptor: &EventDescriptor,
        on_first_attach: F,
    ) -> RelayResult<Relay>
    where
        S: Any + Send + Sync,
        F: FnOnce(&Arc<S>, &Relay),
    {
        if !descriptor.belongs_to::<S>() {
            return Err(ValidationError::UnknownEvent {
                owner_type: type_name::<S>(),
                event: descriptor.name().to_string(),
            }
            .into());
        }
        if descriptor.is_static() {
            return Err(ValidationError::StaticEventUnsupported {
                event: descriptor.name().to_string(),
            }
            .into());
        }

        let weak = Arc::downgrade(owner);
        let weak: Weak<DynOwner> = weak;
        let (relay, created) = {
            let mut state = self.state()?;
            state.registrations += 1;
            if state.registrations % self.config.effective_sweep_threshold() == 0 {
                Self::sweep_locked(&mut state);
            }

            let key = owner_key(&weak);
            let entry = state.owners.entry(key).or_insert_with(|| OwnerRelays {
                owner: weak.clone(),
                relays: Vec::new(),
            });
            if !entry.is_alive() {
                // Address reused by a new owner.
                entry.owner = weak.clone();
                entry.relays.clear();
            }

            match entry.relays.iter().find(|r| r.descriptor() == descriptor) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let relay = Relay::new(weak, descriptor.clone(), self.config.relay.clone());
                    entry.relays.push(relay.clone());
                    (relay, true)
                }
            }
        };

        if created {
            on_first_attach(owner, &relay);
        }
        Ok(relay)
    }

    /// The relay for `descriptor` on `owner`, if one was registered.
    pub fn relay_for<S>(&self, owner: &Arc<S>, descriptor: &EventDescriptor) -> RelayResult<Option<Relay>>
    where
        S: Any + Send + Sync,
    {
        let weak = Arc::downgrade(owner);
        let weak: Weak<DynOwner> = weak;
        let state = self.state()?;
        Ok(state
            .owners
            .get(&owner_key(&weak))
            .filter(|e| e.is_alive())
            .and_then(|e| e.relays.iter().find(|r| r.descriptor() == descriptor).cloned()))
    }

    /// Every relay registered for `owner`, in creation order.
    pub fn relays_of<S>(&self, owner: &Arc<S>) -> RelayResult<Vec<Relay>>
    where
        S: Any + Send + Sync,
    {
        let weak = Arc::downgrade(owner);
        let weak: Weak<DynOwner> = weak;
        let state = self.state()?;
        Ok(state
            .owners
            .get(&owner_key(&weak))
            .filter(|e| e.is_alive())
            .map(|e| e.relays.clone())
            .unwrap_or_default())
    }

    /// Number of owner entries, including dead ones not yet swept.
    pub fn owner_count(&self) -> RelayResult<usize> {
        Ok(self.state()?.owners.len())
    }

    /// Drop entries of owners that are gone. Returns the number dropped.
    pub fn sweep(&self) -> RelayResult<usize> {
        let mut state = self.state()?;
        Ok(Self::sweep_locked(&mut state))
    }

    fn sweep_locked(state: &mut RegistryState) -> usize {
        let before = state.owners.len();
        state.owners.retain(|_, entry| entry.is_alive());
        let swept = before - state.owners.len();
        if swept > 0 {
            debug!(swept, "swept relays of dropped owners");
        }
        swept
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for RelayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRegistry")
            .field("config", &self.config)
            .field("owners", &self.owner_count().unwrap_or(0))
            .finish_non_exhaustive()
    }
}

/// Registration through the process-wide registry.
pub trait WeakEventExt {
    /// The relay for event `event` of this owner.
    fn register_weak_event(&self, event: &str) -> RelayResult<Relay>;

    /// Like [`WeakEventExt::register_weak_event`] with a first-attach callback.
    fn register_weak_event_with<F>(&self, event: &str, on_first_attach: F) -> RelayResult<Relay>
    where
        F: FnOnce(&Self, &Relay);
}

impl<S: EventSource> WeakEventExt for Arc<S> {
    fn register_weak_event(&self, event: &str) -> RelayResult<Relay> {
        RelayRegistry::global().register_weak_event(self, event)
    }

    fn register_weak_event_with<F>(&self, event: &str, on_first_attach: F) -> RelayResult<Relay>
    where
        F: FnOnce(&Self, &Relay),
    {
        RelayRegistry::global().register_weak_event_with(self, event, on_first_attach)
    }
}
