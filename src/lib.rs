//! # weakrelay - weak event subscriptions
//!
//! weakrelay lets an object subscribe to another object's events without the
//! subscription keeping the subscriber alive, and without anyone having to
//! remember to unsubscribe.
//!
//! ## Core Concepts
//!
//! - **Relay**: one per (owner, event); holds the owner and every handler
//!   receiver weakly and dispatches raises to the handlers still alive
//! - **Handler**: a method bound to a weakly held receiver, or a free function
//! - **Trampoline**: the single physical handler a relay attaches to the real
//!   event, detached again when no live handler remains
//! - **Registry**: guarantees one relay per (owner, event)
//! - **Catalog**: compile-time description of the events an owner type publishes
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use weakrelay::{EventSet, EventSource, Handler, Multicast, RelayRegistry, RegistryConfig};
//!
//! struct Thermometer {
//!     changed: Multicast<f64>,
//! }
//!
//! impl EventSource for Thermometer {
//!     fn describe_events(events: &mut EventSet<Self>) {
//!         events.field("changed", |t| &t.changed);
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Display {
//!     redraws: AtomicUsize,
//! }
//!
//! impl Display {
//!     fn on_changed(&self, _celsius: &f64) {
//!         self.redraws.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let registry = RelayRegistry::new(RegistryConfig::default());
//! let thermometer = Arc::new(Thermometer { changed: Multicast::new() });
//! let relay = registry.register_weak_event(&thermometer, "changed")?;
//! relay.use_trampoline()?;
//!
//! let display = Arc::new(Display::default());
//! relay.add(&Handler::method(&display, Display::on_changed))?;
//! thermometer.changed.emit(&21.5)?;
//! assert_eq!(display.redraws.load(Ordering::SeqCst), 1);
//!
//! // Dropping the subscriber is enough; the relay forgets it on the next raise.
//! drop(display);
//! thermometer.changed.emit(&22.0)?;
//! assert!(thermometer.changed.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod multicast;
pub mod registry;
pub mod relay;

// Re-export primary types at crate root for convenience
pub use catalog::{EventCatalog, EventSet, EventSource};
pub use config::{FaultPolicy, RegistryConfig, RelayConfig};
pub use descriptor::{
    DynOwner, EventAccessor, EventDescriptor, EventDescriptorBuilder, HandlerSignature, SubscriptionId,
};
pub use error::{
    BoxError, DispatchError, HandlerFault, HandlerResult, RelayError, RelayResult, ValidationError,
};
pub use handler::{Handler, HandlerKind, MethodId};
pub use multicast::{FieldAccessor, Multicast};
pub use registry::{RelayRegistry, WeakEventExt};
pub use relay::{RaiseReport, Relay, RelayId, RelayStats, Trampoline, WeakRelay};
