//! Event catalog.
//!
//! Owner types list their events once, at compile time, by implementing
//! [`EventSource`]. The catalog asks each type for its events the first time
//! they are needed and caches the resulting descriptors.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::warn;

use crate::descriptor::{EventAccessor, EventDescriptor};
use crate::error::{lock_err, RelayResult, ValidationError};
use crate::multicast::{FieldAccessor, Multicast};

/// A type whose instances publish events.
///
/// ```
/// use weakrelay::{EventSet, EventSource, Multicast};
///
/// struct Button {
///     clicked: Multicast<u32>,
/// }
///
/// impl EventSource for Button {
///     fn describe_events(events: &mut EventSet<Self>) {
///         events.field("clicked", |b| &b.clicked);
///     }
/// }
/// ```
pub trait EventSource: Any + Send + Sync + Sized {
    /// Declare this type's events.
    fn describe_events(events: &mut EventSet<Self>);
}

/// Collects the event declarations of owner type `S`.
pub struct EventSet<S> {
    descriptors: Vec<EventDescriptor>,
    _owner: PhantomData<fn(&S)>,
}

impl<S: Any + Send + Sync> EventSet<S> {
    fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            _owner: PhantomData,
        }
    }

    fn push(&mut self, descriptor: EventDescriptor) -> &mut Self {
        if self.descriptors.iter().any(|d| d.name() == descriptor.name()) {
            warn!(owner = type_name::<S>(), event = descriptor.name(), "duplicate event declaration ignored");
            return self;
        }
        self.descriptors.push(descriptor);
        self
    }

    /// An event backed by a [`Multicast`] field; relays can attach to it.
    pub fn field<A: Any>(&mut self, name: &str, field: fn(&S) -> &Multicast<A>) -> &mut Self {
        let accessor = Arc::new(FieldAccessor::<S, A>::new(field));
        self.push(EventDescriptor::builder::<S, A>(name).accessor(accessor).build())
    }

    /// An event the owner raises through its relay directly.
    pub fn declare<A: Any>(&mut self, name: &str) -> &mut Self {
        self.push(EventDescriptor::builder::<S, A>(name).build())
    }

    /// An event published through some other mechanism, reached by `accessor`.
    pub fn custom<A: Any>(&mut self, name: &str, accessor: Arc<dyn EventAccessor>) -> &mut Self {
        self.push(EventDescriptor::builder::<S, A>(name).accessor(accessor).build())
    }

    /// A static event. Listed for completeness; relays refuse it.
    pub fn static_event<A: Any>(&mut self, name: &str) -> &mut Self {
        self.push(EventDescriptor::builder::<S, A>(name).static_event().build())
    }
}

/// Cache of event descriptors per owner type.
#[derive(Debug, Default)]
pub struct EventCatalog {
    types: RwLock<HashMap<TypeId, Arc<[EventDescriptor]>>>,
}

static GLOBAL_CATALOG: OnceLock<Arc<EventCatalog>> = OnceLock::new();

impl EventCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide catalog.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_CATALOG.get_or_init(|| Arc::new(Self::new())))
    }

    /// All events of `S`, described on first use and cached afterwards.
    pub fn events_of<S: EventSource>(&self) -> RelayResult<Arc<[EventDescriptor]>> {
        let key = TypeId::of::<S>();
        {
            let types = self.types.read().map_err(|_| lock_err("event catalog"))?;
            if let Some(found) = types.get(&key) {
                return Ok(Arc::clone(found));
            }
        }

        let mut set = EventSet::<S>::new();
        S::describe_events(&mut set);
        let described: Arc<[EventDescriptor]> = set.descriptors.into();

        let mut types = self.types.write().map_err(|_| lock_err("event catalog"))?;
        Ok(Arc::clone(types.entry(key).or_insert(described)))
    }

    /// Look up event `name` on `S`.
    pub fn resolve<S: EventSource>(&self, name: &str) -> RelayResult<EventDescriptor> {
        if name.is_empty() {
            return Err(ValidationError::MissingArgument { name: "event name" }.into());
        }
        self.events_of::<S>()?
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| {
                ValidationError::UnknownEvent {
                    owner_type: type_name::<S>(),
                    event: name.to_string(),
                }
                .into()
            })
    }

    /// Number of owner types described so far.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.read().map_or(0, |t| t.len())
    }
}
