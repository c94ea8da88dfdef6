//! Strong multicast events.
//!
//! [`Multicast`] is the plain event an owner type exposes: every subscribed
//! closure is owned by the event and stays alive until it is unsubscribed.
//! Weak relays attach to it through [`FieldAccessor`] with a single trampoline,
//! so the subscribers behind the relay are never owned by the event.

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::descriptor::{DynOwner, EventAccessor, SubscriptionId};
use crate::error::{HandlerResult, RelayError, RelayResult};
use crate::relay::Trampoline;

type MulticastFn<A> = dyn Fn(&A) -> HandlerResult + Send + Sync;

/// An owning, multicast event with snapshot-on-emit semantics.
///
/// A subscriber removed during emission is still called in that round; one
/// added during emission is first called on the next emit. The lock is never
/// held while subscribers run.
pub struct Multicast<A> {
    handlers: Mutex<Vec<(SubscriptionId, Arc<MulticastFn<A>>)>>,
}

impl<A> Multicast<A> {
    /// Create an event with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe `handler` and return the id that unsubscribes it.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&A) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    /// Call every subscriber in subscription order. The first fault stops the
    /// emit and is returned.
    pub fn emit(&self, args: &A) -> HandlerResult {
        let snapshot: Vec<Arc<MulticastFn<A>>> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in snapshot {
            handler(args)?;
        }
        Ok(())
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A> Default for Multicast<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Multicast<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multicast")
            .field("args", &type_name::<A>())
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Accessor for a [`Multicast`] field of owner type `S`.
pub struct FieldAccessor<S, A> {
    field: fn(&S) -> &Multicast<A>,
    _owner: PhantomData<fn(&S)>,
}

impl<S, A> FieldAccessor<S, A> {
    /// Wrap a field projection.
    #[must_use]
    pub fn new(field: fn(&S) -> &Multicast<A>) -> Self {
        Self {
            field,
            _owner: PhantomData,
        }
    }
}

impl<S, A> FieldAccessor<S, A>
where
    S: Any,
{
    fn owner<'a>(&self, owner: &'a DynOwner) -> RelayResult<&'a S> {
        owner.downcast_ref::<S>().ok_or_else(|| {
            RelayError::internal(format!("event owner is not a {}", type_name::<S>()))
        })
    }
}

impl<S, A> EventAccessor for FieldAccessor<S, A>
where
    S: Any + Send + Sync,
    A: Any,
{
    fn attach(&self, owner: &DynOwner, trampoline: Trampoline) -> RelayResult<SubscriptionId> {
        let owner = self.owner(owner)?;
        Ok((self.field)(owner).subscribe(move |args: &A| trampoline.fire(args)))
    }

    fn detach(&self, owner: &DynOwner, subscription: SubscriptionId) -> RelayResult<()> {
        let owner = self.owner(owner)?;
        (self.field)(owner).unsubscribe(subscription);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::HandlerFault;

    #[test]
    fn emit_calls_subscribers_in_order() {
        let event = Multicast::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            event.subscribe(move |v: &u32| {
                seen.lock().unwrap().push(format!("{tag}{v}"));
                Ok(())
            });
        }
        event.emit(&7).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let event = Multicast::<()>::new();
        let id = event.subscribe(|_: &()| Ok(()));
        assert_eq!(event.len(), 1);
        assert!(event.unsubscribe(id));
        assert!(!event.unsubscribe(id));
        assert!(event.is_empty());
    }

    #[test]
    fn first_fault_stops_emit() {
        let event = Multicast::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        event.subscribe(|_: &()| Err(HandlerFault::msg("nope")));
        let c = Arc::clone(&calls);
        event.subscribe(move |_: &()| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = event.emit(&()).unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscriber_added_during_emit_waits_for_next_round() {
        let event = Arc::new(Multicast::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let ev = Arc::clone(&event);
        let c = Arc::clone(&calls);
        event.subscribe(move |_: &()| {
            let c = Arc::clone(&c);
            ev.subscribe(move |_: &()| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });
        event.emit(&()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        event.emit(&()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn field_accessor_rejects_foreign_owner() {
        struct Panel {
            resized: Multicast<u32>,
        }
        let accessor = FieldAccessor::<Panel, u32>::new(|p| &p.resized);
        let err = accessor.detach(&42_u8, SubscriptionId::new()).unwrap_err();
        assert!(err.is_internal());

        let panel = Panel {
            resized: Multicast::new(),
        };
        let id = panel.resized.subscribe(|_: &u32| Ok(()));
        accessor.detach(&panel, id).unwrap();
        assert!(panel.resized.is_empty());
    }
}
