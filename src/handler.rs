//! Typed handler values.
//!
//! A [`Handler`] pairs a method with the receiver it is bound to. The receiver
//! is held weakly, so building a handler never keeps its receiver alive.
//! A stateless callable (a function item or a closure that captures nothing)
//! is identified by its type, so registering `Subscriber::on_tick` twice is
//! recognised as the same method, just like a multicast delegate recognises
//! the same method added twice. A closure that captures state is a distinct
//! method per [`Handler`] value: clones of that handler share its identity,
//! but building it again yields a new one, so removal needs the original.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::descriptor::{DynOwner, HandlerSignature};
use crate::error::{BoxError, HandlerFault, HandlerResult, RelayResult, ValidationError};

type BoundFn = dyn Fn(&DynOwner, &dyn Any) -> HandlerResult + Send + Sync;
type StaticFn = dyn Fn(&dyn Any) -> HandlerResult + Send + Sync;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Identity of a handler method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    type_id: TypeId,
    /// Zero for stateless callables.
    instance: u64,
    name: &'static str,
}

impl MethodId {
    /// Identity of the stateless callable type `F`.
    #[must_use]
    pub fn of<F: Any>() -> Self {
        Self {
            type_id: TypeId::of::<F>(),
            instance: 0,
            name: type_name::<F>(),
        }
    }

    /// Identity of `callable`: its type when it captures nothing, otherwise a
    /// fresh identity unique to this call.
    fn for_callable<F: Any>(_callable: &F) -> Self {
        let mut id = Self::of::<F>();
        if size_of::<F>() != 0 {
            id.instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    /// True when the method is identified by its type alone.
    #[must_use]
    pub const fn is_stateless(&self) -> bool {
        self.instance == 0
    }

    /// Readable name of the method.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Whether a handler is bound to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Invoked against its receiver.
    Bound,
    /// Invoked without a receiver; its lifetime follows the event owner.
    Static,
}

#[derive(Clone)]
pub(crate) enum Callback {
    Bound(Arc<BoundFn>),
    Static(Arc<StaticFn>),
}

impl Callback {
    pub(crate) fn invoke(&self, receiver: &DynOwner, args: &dyn Any) -> HandlerResult {
        match self {
            Self::Bound(f) => f(receiver, args),
            Self::Static(f) => f(args),
        }
    }
}

fn mismatch<T>() -> HandlerFault {
    HandlerFault::msg(format!("handler invoked with a value that is not a {}", type_name::<T>()))
}

/// A method plus the (weakly held) receiver it is bound to.
#[derive(Clone)]
pub struct Handler {
    receiver: Option<Weak<DynOwner>>,
    method: MethodId,
    signature: HandlerSignature,
    callback: Callback,
}

impl Handler {
    /// Bind `method` to `receiver`.
    pub fn method<R, A, F>(receiver: &Arc<R>, method: F) -> Self
    where
        R: Any + Send + Sync,
        A: Any,
        F: Fn(&R, &A) + Send + Sync + 'static,
    {
        Self::bound(Arc::downgrade(receiver), MethodId::for_callable(&method), move |r: &R, a: &A| {
            method(r, a);
            Ok(())
        })
    }

    /// Bind a fallible `method` to `receiver`.
    pub fn try_method<R, A, F, E>(receiver: &Arc<R>, method: F) -> Self
    where
        R: Any + Send + Sync,
        A: Any,
        F: Fn(&R, &A) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::bound(Arc::downgrade(receiver), MethodId::for_callable(&method), move |r: &R, a: &A| {
            method(r, a).map_err(HandlerFault::new)
        })
    }

    /// Bind `method` to a receiver known only by a weak reference.
    ///
    /// Fails with `MissingArgument` when the receiver is already gone.
    pub fn from_weak<R, A, F>(receiver: &Weak<R>, method: F) -> RelayResult<Self>
    where
        R: Any + Send + Sync,
        A: Any,
        F: Fn(&R, &A) + Send + Sync + 'static,
    {
        if receiver.strong_count() == 0 {
            return Err(ValidationError::MissingArgument { name: "handler receiver" }.into());
        }
        Ok(Self::bound(receiver.clone(), MethodId::for_callable(&method), move |r: &R, a: &A| {
            method(r, a);
            Ok(())
        }))
    }

    /// A handler with no receiver.
    pub fn function<A, F>(function: F) -> Self
    where
        A: Any,
        F: Fn(&A) + Send + Sync + 'static,
    {
        Self::unbound(MethodId::for_callable(&function), move |a: &A| {
            function(a);
            Ok(())
        })
    }

    /// A fallible handler with no receiver.
    pub fn try_function<A, F, E>(function: F) -> Self
    where
        A: Any,
        F: Fn(&A) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::unbound(MethodId::for_callable(&function), move |a: &A| function(a).map_err(HandlerFault::new))
    }

    fn bound<R, A>(
        receiver: Weak<R>,
        method: MethodId,
        call: impl Fn(&R, &A) -> HandlerResult + Send + Sync + 'static,
    ) -> Self
    where
        R: Any + Send + Sync,
        A: Any,
    {
        let receiver: Weak<DynOwner> = receiver;
        let callback: Arc<BoundFn> = Arc::new(move |r: &DynOwner, a: &dyn Any| {
            let r = r.downcast_ref::<R>().ok_or_else(mismatch::<R>)?;
            let a = a.downcast_ref::<A>().ok_or_else(mismatch::<A>)?;
            call(r, a)
        });
        Self {
            receiver: Some(receiver),
            method,
            signature: HandlerSignature::of::<A>(),
            callback: Callback::Bound(callback),
        }
    }

    fn unbound<A>(method: MethodId, call: impl Fn(&A) -> HandlerResult + Send + Sync + 'static) -> Self
    where
        A: Any,
    {
        let callback: Arc<StaticFn> = Arc::new(move |a: &dyn Any| {
            let a = a.downcast_ref::<A>().ok_or_else(mismatch::<A>)?;
            call(a)
        });
        Self {
            receiver: None,
            method,
            signature: HandlerSignature::of::<A>(),
            callback: Callback::Static(callback),
        }
    }

    /// Method identity.
    #[must_use]
    pub const fn method_id(&self) -> MethodId {
        self.method
    }

    /// Argument signature.
    #[must_use]
    pub const fn signature(&self) -> HandlerSignature {
        self.signature
    }

    /// Bound or static.
    #[must_use]
    pub const fn kind(&self) -> HandlerKind {
        match self.callback {
            Callback::Bound(_) => HandlerKind::Bound,
            Callback::Static(_) => HandlerKind::Static,
        }
    }

    /// True while the receiver of a bound handler is alive. Static handlers
    /// are always alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.receiver.as_ref().map_or(true, |r| r.strong_count() > 0)
    }

    pub(crate) fn receiver(&self) -> Option<&Weak<DynOwner>> {
        self.receiver.as_ref()
    }

    pub(crate) fn callback(&self) -> &Callback {
        &self.callback
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("method", &self.method.name())
            .field("args", &self.signature.args_name())
            .field("kind", &self.kind())
            .field("alive", &self.is_alive())
            .finish()
    }
}
