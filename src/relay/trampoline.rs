//! The single physical handler a relay attaches to the real event.
//!
//! However many logical subscribers a relay has, the event source only ever
//! sees one [`Trampoline`]. Firing it forwards to the relay's `raise`. The
//! trampoline holds its relay weakly, so an event source never keeps a relay
//! (or anything the relay refers to) alive.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::descriptor::{DynOwner, EventAccessor, SubscriptionId};
use crate::error::{HandlerFault, HandlerResult, RelayResult};

use super::{Relay, RelayId, RelayInner};

/// Forwarder from an event source to a relay.
#[derive(Clone)]
pub struct Trampoline {
    relay: Weak<RelayInner>,
    relay_id: RelayId,
}

impl Trampoline {
    pub(crate) fn new(relay: Weak<RelayInner>, relay_id: RelayId) -> Self {
        Self { relay, relay_id }
    }

    /// Id of the relay this trampoline forwards to.
    #[must_use]
    pub const fn relay_id(&self) -> RelayId {
        self.relay_id
    }

    /// True while the target relay still exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.relay.strong_count() > 0
    }

    /// Raise the relay with `args`. A trampoline whose relay is gone does nothing.
    pub fn fire(&self, args: &dyn Any) -> HandlerResult {
        let Some(inner) = self.relay.upgrade() else {
            return Ok(());
        };
        Relay::from_inner(inner)
            .raise_dyn(args)
            .map(|_| ())
            .map_err(HandlerFault::new)
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("relay", &self.relay_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Registrar and attach flag of one relay. Guarded by the relay's lock.
#[derive(Default)]
pub(crate) struct AttachState {
    registrar: Option<Arc<dyn EventAccessor>>,
    attached: Option<SubscriptionId>,
}

impl AttachState {
    /// Install the registrar. Only the first call has an effect.
    pub fn set_registrar(&mut self, registrar: Arc<dyn EventAccessor>) -> bool {
        if self.registrar.is_some() {
            return false;
        }
        self.registrar = Some(registrar);
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Attach unless already attached or no registrar is installed.
    pub fn attach(&mut self, owner: &DynOwner, trampoline: Trampoline) -> RelayResult<bool> {
        if self.attached.is_some() {
            return Ok(false);
        }
        let Some(registrar) = &self.registrar else {
            return Ok(false);
        };
        let relay_id = trampoline.relay_id();
        let subscription = registrar.attach(owner, trampoline)?;
        debug!(relay = %relay_id, %subscription, "attached weak event trampoline");
        self.attached = Some(subscription);
        Ok(true)
    }

    /// Detach if attached. With no live owner there is nothing to detach
    /// from, so only the flag is reset. A failed detach leaves the
    /// trampoline marked attached, so no second one is ever attached.
    pub fn detach(&mut self, owner: Option<&DynOwner>, relay_id: RelayId) -> RelayResult<bool> {
        let Some(subscription) = self.attached else {
            return Ok(false);
        };
        if let (Some(owner), Some(registrar)) = (owner, &self.registrar) {
            registrar.detach(owner, subscription)?;
        }
        self.attached = None;
        debug!(relay = %relay_id, %subscription, "detached weak event trampoline");
        Ok(true)
    }
}
