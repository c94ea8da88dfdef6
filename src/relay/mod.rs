//! Weak subscription relays.
//!
//! A [`Relay`] sits between one event of one owner and any number of handlers.
//! It holds the owner and every handler receiver weakly, multiplexes all
//! handlers onto a single [`Trampoline`] attached to the real event, and
//! detaches that trampoline once no live handler remains.
//!
//! Once the owner is gone the relay is permanently disabled: `add`, `remove`,
//! `clear` and `raise` all become no-ops. Nothing about a disabled relay is an
//! error.

/// Handler owner table.
pub(crate) mod table;
/// Trampoline and attach state.
pub mod trampoline;

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{FaultPolicy, RelayConfig};
use crate::descriptor::{DynOwner, EventAccessor, EventDescriptor};
use crate::error::{lock_err, DispatchError, HandlerFault, RelayError, RelayResult, ValidationError};
use crate::handler::{Handler, MethodId};

use self::table::HandlerOwnerTable;
use self::trampoline::AttachState;
pub use self::trampoline::Trampoline;

/// Unique identifier for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(Uuid);

impl RelayId {
    /// Create a new random relay id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RelayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one `raise`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RaiseReport {
    /// Handler invocations performed, including one that faulted.
    pub invocations: usize,
    /// Handler owner entries removed from the table by this raise.
    pub pruned_owners: usize,
}

/// Point-in-time diagnostics for a relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    /// Relay id.
    pub id: RelayId,
    /// Name of the event the relay serves.
    pub event: String,
    /// Whether the owner is still alive.
    pub enabled: bool,
    /// Whether the trampoline is attached.
    pub attached: bool,
    /// Handler owner entries, swept or not.
    pub handler_owners: usize,
    /// Completed raises.
    pub raises: u64,
    /// Handler invocations across all raises.
    pub invocations: u64,
    /// When the relay was last raised.
    pub last_raised_at: Option<DateTime<Utc>>,
}

struct RelayState {
    table: HandlerOwnerTable,
    attach: AttachState,
    raises: u64,
    invocations: u64,
    last_raised_at: Option<DateTime<Utc>>,
}

pub(crate) struct RelayInner {
    id: RelayId,
    owner: Weak<DynOwner>,
    descriptor: EventDescriptor,
    config: RelayConfig,
    state: Mutex<RelayState>,
}

/// Handle to the relay of one (owner, event) pair. Clones share the relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub(crate) fn new(owner: Weak<DynOwner>, descriptor: EventDescriptor, config: RelayConfig) -> Self {
        let id = RelayId::new();
        debug!(relay = %id, event = %descriptor, "created weak event relay");
        Self {
            inner: Arc::new(RelayInner {
                id,
                owner,
                descriptor,
                config,
                state: Mutex::new(RelayState {
                    table: HandlerOwnerTable::new(),
                    attach: AttachState::default(),
                    raises: 0,
                    invocations: 0,
                    last_raised_at: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RelayInner>) -> Self {
        Self { inner }
    }

    /// Relay id.
    #[must_use]
    pub fn id(&self) -> RelayId {
        self.inner.id
    }

    /// The event this relay serves.
    #[must_use]
    pub fn descriptor(&self) -> &EventDescriptor {
        &self.inner.descriptor
    }

    /// True while the owner is alive. Once false, it stays false.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.owner.strong_count() > 0
    }

    /// The owner, if it is still alive and is an `S`.
    #[must_use]
    pub fn owner<S: Any + Send + Sync>(&self) -> Option<Arc<S>> {
        self.inner.owner.upgrade()?.downcast::<S>().ok()
    }

    /// True when both handles refer to the same relay.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// A handle that does not keep the relay alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakRelay {
        WeakRelay {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn state(&self) -> RelayResult<MutexGuard<'_, RelayState>> {
        self.inner.state.lock().map_err(|_| lock_err("relay state"))
    }

    fn peek(&self) -> MutexGuard<'_, RelayState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler_owner(&self, handler: &Handler) -> Weak<DynOwner> {
        handler
            .receiver()
            .cloned()
            .unwrap_or_else(|| self.inner.owner.clone())
    }

    fn trampoline(&self) -> Trampoline {
        Trampoline::new(Arc::downgrade(&self.inner), self.inner.id)
    }

    /// Register `handler`. Adding the same method on the same receiver again
    /// makes it run once more per raise.
    ///
    /// Fails with `InvalidHandlerKind` when the handler's argument type differs
    /// from the event's, and with `MissingArgument` when a bound handler's
    /// receiver is already gone. Attaches the trampoline if a registrar is
    /// installed and it is not attached yet.
    pub fn add(&self, handler: &Handler) -> RelayResult<()> {
        self.inner.descriptor.check_handler(handler.signature())?;
        if !self.is_enabled() {
            return Ok(());
        }
        let owner = self.handler_owner(handler);
        if owner.strong_count() == 0 {
            return Err(ValidationError::MissingArgument { name: "handler receiver" }.into());
        }

        let mut state = self.state()?;
        if let Some(source) = self.inner.owner.upgrade() {
            state
                .attach
                .attach(&*source, self.trampoline())
                .map_err(|e| self.accessor_failed(&e))?;
        }
        state.table.increment(&owner, handler);
        self.maybe_sweep(&mut state);
        Ok(())
    }

    /// Unregister one registration of `handler`. Removing something that was
    /// never added is a no-op.
    pub fn remove(&self, handler: &Handler) -> RelayResult<()> {
        self.inner.descriptor.check_handler(handler.signature())?;
        if !self.is_enabled() {
            return Ok(());
        }
        let owner = self.handler_owner(handler);
        let method = handler.method_id();

        let mut state = self.state()?;
        if state.table.decrement(&owner, method) {
            debug!(relay = %self.inner.id, method = method.name(), "removed weak event handler");
        }
        self.maybe_sweep(&mut state);
        Ok(())
    }

    /// Drop every registration. The trampoline stays attached unless
    /// `detach_on_clear` is configured.
    pub fn clear(&self) -> RelayResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut state = self.state()?;
        state.table.clear();
        if self.inner.config.detach_on_clear {
            self.detach(&mut state)?;
        }
        Ok(())
    }

    /// Invoke every live registration with `args`.
    ///
    /// Owners are visited in registration order, methods in registration
    /// order, and a method registered n times runs n times in a row. The set
    /// of registrations is captured before the first handler runs, so changes
    /// made by handlers apply from the next raise on. Dead owners and spent
    /// registrations are dropped afterwards, and the trampoline is detached if
    /// nothing is left.
    pub fn raise<A: Any>(&self, args: &A) -> RelayResult<RaiseReport> {
        self.raise_checked(args, type_name::<A>())
    }

    /// Type-erased [`Self::raise`].
    pub fn raise_dyn(&self, args: &dyn Any) -> RelayResult<RaiseReport> {
        self.raise_checked(args, "a value of another type")
    }

    fn raise_checked(&self, args: &dyn Any, args_name: &'static str) -> RelayResult<RaiseReport> {
        if !self.is_enabled() {
            return Ok(RaiseReport::default());
        }
        let signature = self.inner.descriptor.signature();
        if Any::type_id(args) != signature.args_type() {
            return Err(ValidationError::InvalidArguments {
                event: self.inner.descriptor.name().to_string(),
                expected: signature.args_name(),
                actual: args_name,
            }
            .into());
        }

        let (plan, pruned_early) = {
            let mut state = self.state()?;
            let pruned = state.table.prune_dead();
            (state.table.snapshot(), pruned)
        };
        trace!(relay = %self.inner.id, event = %self.inner.descriptor, owners = plan.len(), "raising weak event");

        let mut invocations = 0;
        let mut faults: Vec<(MethodId, HandlerFault)> = Vec::new();
        'pass: for entry in &plan {
            let Some(receiver) = entry.upgrade() else {
                continue;
            };
            for method in &entry.methods {
                for _ in 0..method.count {
                    invocations += 1;
                    if let Err(fault) = method.callback.invoke(&*receiver, args) {
                        warn!(
                            relay = %self.inner.id,
                            method = method.method.name(),
                            error = %fault,
                            "weak event handler faulted"
                        );
                        faults.push((method.method, fault));
                        match self.inner.config.fault_policy {
                            FaultPolicy::Abort => break 'pass,
                            FaultPolicy::Continue => break,
                        }
                    }
                }
            }
        }

        let finished = self.finish_raise(invocations);
        if faults.is_empty() {
            let pruned_late = finished?;
            return Ok(RaiseReport {
                invocations,
                pruned_owners: pruned_early + pruned_late,
            });
        }
        if let Err(err) = finished {
            warn!(relay = %self.inner.id, error = %err, "weak event relay cleanup failed after handler fault");
        }

        let event = self.inner.descriptor.name().to_string();
        let err = match self.inner.config.fault_policy {
            FaultPolicy::Abort => {
                let (method, fault) = faults.remove(0);
                DispatchError::HandlerFault {
                    event,
                    method: method.name(),
                    fault,
                }
            }
            FaultPolicy::Continue => DispatchError::HandlerFaults {
                event,
                faults: faults.into_iter().map(|(_, f)| f).collect(),
            },
        };
        Err(err.into())
    }

    fn finish_raise(&self, invocations: usize) -> RelayResult<usize> {
        let mut state = self.state()?;
        state.raises += 1;
        state.invocations += invocations as u64;
        state.last_raised_at = Some(Utc::now());

        let pruned = state.table.sweep();
        if pruned > 0 {
            debug!(relay = %self.inner.id, pruned, "pruned weak event handler owners");
        }
        if state.table.is_empty() {
            self.detach(&mut state)?;
        }
        Ok(pruned)
    }

    fn maybe_sweep(&self, state: &mut RelayState) {
        if state.table.mutations() < self.inner.config.effective_sweep_threshold() {
            return;
        }
        let pruned = state.table.sweep();
        if pruned > 0 {
            debug!(relay = %self.inner.id, pruned, "pruned weak event handler owners");
        }
    }

    fn detach(&self, state: &mut RelayState) -> RelayResult<bool> {
        let owner = self.inner.owner.upgrade();
        state
            .attach
            .detach(owner.as_deref(), self.inner.id)
            .map_err(|e| self.accessor_failed(&e))
    }

    fn accessor_failed(&self, err: &RelayError) -> RelayError {
        DispatchError::AccessorFailed {
            event: self.inner.descriptor.name().to_string(),
            reason: err.to_string(),
        }
        .into()
    }

    /// Install the registrar used to attach the trampoline. Only the first
    /// registrar is kept; returns whether this call installed it. Attaching
    /// happens on the next `add`.
    pub fn register_raise(&self, registrar: Arc<dyn EventAccessor>) -> RelayResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let mut state = self.state()?;
        Ok(state.attach.set_registrar(registrar))
    }

    /// Use the event descriptor's own accessor as the registrar.
    ///
    /// Fails with `NoAccessor` when the descriptor cannot attach by itself.
    pub fn use_trampoline(&self) -> RelayResult<bool> {
        let accessor = self.inner.descriptor.accessor()?;
        self.register_raise(accessor)
    }

    /// True while the trampoline is attached to the event.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.peek().attach.is_attached()
    }

    /// Handler owner entries in the table, including dead or spent entries
    /// that have not been swept yet.
    #[must_use]
    pub fn handler_owner_count(&self) -> usize {
        self.peek().table.len()
    }

    /// Handler owners that are alive and still have a registration.
    #[must_use]
    pub fn live_handler_owner_count(&self) -> usize {
        self.peek().table.live_len()
    }

    /// How many times `handler` is currently registered.
    #[must_use]
    pub fn registration_count(&self, handler: &Handler) -> usize {
        let owner = self.handler_owner(handler);
        self.peek().table.count(&owner, handler.method_id())
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let state = self.peek();
        RelayStats {
            id: self.inner.id,
            event: self.inner.descriptor.name().to_string(),
            enabled: self.is_enabled(),
            attached: state.attach.is_attached(),
            handler_owners: state.table.len(),
            raises: state.raises,
            invocations: state.invocations,
            last_raised_at: state.last_raised_at,
        }
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl Eq for Relay {}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("id", &self.inner.id)
            .field("event", &self.inner.descriptor)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a relay.
#[derive(Clone)]
pub struct WeakRelay {
    inner: Weak<RelayInner>,
}

impl WeakRelay {
    /// The relay, if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Relay> {
        self.inner.upgrade().map(Relay::from_inner)
    }

    /// Raise the relay if it still exists.
    pub fn raise<A: Any>(&self, args: &A) -> RelayResult<RaiseReport> {
        match self.upgrade() {
            Some(relay) => relay.raise(args),
            None => Ok(RaiseReport::default()),
        }
    }
}

impl fmt::Debug for WeakRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRelay")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use super::*;
    use crate::descriptor::SubscriptionId;
    use crate::multicast::{FieldAccessor, Multicast};

    #[derive(Default)]
    struct Source {
        ticked: Multicast<u32>,
    }

    #[derive(Default)]
    struct Sink {
        hits: AtomicUsize,
    }

    impl Sink {
        fn on_tick(&self, _: &u32) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    fn descriptor() -> EventDescriptor {
        EventDescriptor::builder::<Source, u32>("ticked")
            .accessor(Arc::new(FieldAccessor::<Source, u32>::new(|s| &s.ticked)))
            .build()
    }

    fn relay_for(source: &Arc<Source>, config: RelayConfig) -> Relay {
        let owner = Arc::downgrade(source);
        let owner: Weak<DynOwner> = owner;
        Relay::new(owner, descriptor(), config)
    }

    #[test]
    fn raise_invokes_once_per_registration() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let sink = Arc::new(Sink::default());
        let h = Handler::method(&sink, Sink::on_tick);

        relay.add(&h).unwrap();
        relay.add(&h).unwrap();
        assert_eq!(relay.registration_count(&h), 2);
        assert_eq!(relay.raise(&1_u32).unwrap().invocations, 2);

        relay.remove(&h).unwrap();
        relay.raise(&1_u32).unwrap();
        assert_eq!(sink.hits(), 3);
    }

    #[test]
    fn mismatched_handler_is_rejected_without_side_effects() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let sink = Arc::new(Sink::default());
        let wrong = Handler::method(&sink, |_: &Sink, _: &String| {});

        let err = relay.add(&wrong).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RelayError::Validation(ValidationError::InvalidHandlerKind { .. })
        ));
        assert_eq!(relay.handler_owner_count(), 0);
        assert!(relay.remove(&wrong).is_err());
    }

    #[test]
    fn raise_with_wrong_arguments_is_rejected() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let err = relay.raise(&"tick").unwrap_err();
        assert!(err.to_string().contains("u32"));
        assert!(relay.raise_dyn(&5_u64).is_err());
    }

    #[test]
    fn disabled_relay_ignores_everything() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let sink = Arc::new(Sink::default());
        let h = Handler::method(&sink, Sink::on_tick);
        relay.add(&h).unwrap();

        drop(source);
        assert!(!relay.is_enabled());
        relay.add(&h).unwrap();
        relay.remove(&h).unwrap();
        relay.clear().unwrap();
        assert_eq!(relay.raise(&1_u32).unwrap(), RaiseReport::default());
        assert_eq!(sink.hits(), 0);
        assert!(!relay.register_raise(Arc::new(FieldAccessor::<Source, u32>::new(|s| &s.ticked))).unwrap());
    }

    #[test]
    fn trampoline_attaches_once_and_detaches_when_empty() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        assert!(relay.use_trampoline().unwrap());
        assert!(!relay.use_trampoline().unwrap());

        let a = Arc::new(Sink::default());
        let b = Arc::new(Sink::default());
        relay.add(&Handler::method(&a, Sink::on_tick)).unwrap();
        relay.add(&Handler::method(&b, Sink::on_tick)).unwrap();
        assert!(relay.is_attached());
        assert_eq!(source.ticked.len(), 1);

        source.ticked.emit(&9).unwrap();
        assert_eq!(a.hits() + b.hits(), 2);

        drop(a);
        drop(b);
        source.ticked.emit(&9).unwrap();
        assert!(!relay.is_attached());
        assert!(source.ticked.is_empty());
        assert_eq!(relay.handler_owner_count(), 0);
    }

    #[test]
    fn clear_keeps_trampoline_unless_configured() {
        let source = Arc::new(Source::default());
        let sink = Arc::new(Sink::default());

        let keep = relay_for(&source, RelayConfig::default());
        keep.use_trampoline().unwrap();
        keep.add(&Handler::method(&sink, Sink::on_tick)).unwrap();
        keep.clear().unwrap();
        assert!(keep.is_attached());
        assert_eq!(keep.raise(&1_u32).unwrap().invocations, 0);

        let config = RelayConfig {
            detach_on_clear: true,
            ..RelayConfig::default()
        };
        let drop_it = relay_for(&source, config);
        drop_it.use_trampoline().unwrap();
        drop_it.add(&Handler::method(&sink, Sink::on_tick)).unwrap();
        drop_it.clear().unwrap();
        assert!(!drop_it.is_attached());
    }

    #[test]
    fn continue_policy_collects_faults() {
        let source = Arc::new(Source::default());
        let config = RelayConfig {
            fault_policy: FaultPolicy::Continue,
            ..RelayConfig::default()
        };
        let relay = relay_for(&source, config);
        let bad = Arc::new(Sink::default());
        let good = Arc::new(Sink::default());
        relay
            .add(&Handler::try_method(&bad, |_: &Sink, _: &u32| Err("broken")))
            .unwrap();
        relay.add(&Handler::method(&good, Sink::on_tick)).unwrap();

        let err = relay.raise(&1_u32).unwrap_err();
        assert_eq!(err.handler_faults().len(), 1);
        assert_eq!(good.hits(), 1);
    }

    #[test]
    fn stats_track_raises() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let sink = Arc::new(Sink::default());
        relay.add(&Handler::method(&sink, Sink::on_tick)).unwrap();
        relay.raise(&1_u32).unwrap();
        relay.raise(&2_u32).unwrap();

        let stats = relay.stats();
        assert_eq!(stats.raises, 2);
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.handler_owners, 1);
        assert!(stats.last_raised_at.is_some());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["event"], "ticked");
    }

    #[test]
    fn weak_relay_does_not_keep_relay_alive() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        let weak = relay.downgrade();
        assert!(weak.upgrade().is_some_and(|r| r == relay));
        drop(relay);
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.raise(&1_u32).unwrap(), RaiseReport::default());
    }

    #[test]
    fn detached_trampoline_token_is_forgotten() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        relay.use_trampoline().unwrap();
        let sink = Arc::new(Sink::default());
        let h = Handler::method(&sink, Sink::on_tick);
        relay.add(&h).unwrap();
        relay.remove(&h).unwrap();
        relay.raise(&0_u32).unwrap();
        assert!(!relay.is_attached());

        // Unknown tokens are tolerated by the accessor.
        descriptor().detach(&*source, SubscriptionId::new()).unwrap();

        relay.add(&h).unwrap();
        assert!(relay.is_attached());
        assert_eq!(source.ticked.len(), 1);
    }

    /// Attaches to nothing and refuses every detach.
    struct Stubborn;

    impl EventAccessor for Stubborn {
        fn attach(&self, _: &DynOwner, _: Trampoline) -> RelayResult<SubscriptionId> {
            Ok(SubscriptionId::new())
        }

        fn detach(&self, _: &DynOwner, _: SubscriptionId) -> RelayResult<()> {
            Err(RelayError::internal("source busy"))
        }
    }

    #[derive(Default)]
    struct Resetter {
        relay: OnceLock<WeakRelay>,
    }

    #[test]
    fn handler_fault_wins_over_failed_detach() {
        let source = Arc::new(Source::default());
        let relay = relay_for(&source, RelayConfig::default());
        relay.register_raise(Arc::new(Stubborn)).unwrap();
        let resetter = Arc::new(Resetter::default());
        resetter.relay.set(relay.downgrade()).unwrap();
        relay
            .add(&Handler::try_method(&resetter, |r: &Resetter, _: &u32| {
                if let Some(relay) = r.relay.get().and_then(WeakRelay::upgrade) {
                    relay.clear().unwrap();
                }
                Err("reset")
            }))
            .unwrap();

        let err = relay.raise(&1_u32).unwrap_err();
        assert!(matches!(err, RelayError::Dispatch(DispatchError::HandlerFault { .. })));
        assert!(relay.is_attached());
        assert_eq!(relay.stats().raises, 1);
        assert_eq!(relay.stats().invocations, 1);

        // With no fault to report, the detach failure surfaces itself.
        let err = relay.raise(&2_u32).unwrap_err();
        assert!(matches!(err, RelayError::Dispatch(DispatchError::AccessorFailed { .. })));
        assert!(relay.is_attached());
        assert_eq!(relay.stats().raises, 2);
    }
}
