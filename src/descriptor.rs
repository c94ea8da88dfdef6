//! Event descriptors.
//!
//! An [`EventDescriptor`] identifies one publishable member of an owner type:
//! its declaring type, its name and the argument type its handlers take. It may
//! also carry an [`EventAccessor`], the capability to attach and detach a
//! trampoline on a live owner. Descriptors are immutable and cheap to clone.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayResult, ValidationError};
use crate::relay::Trampoline;

/// Type-erased event owner or handler receiver.
pub type DynOwner = dyn Any + Send + Sync;

/// Identity of a handler signature: the argument type the handler receives.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSignature {
    args: TypeId,
    args_name: &'static str,
}

impl HandlerSignature {
    /// Signature of handlers receiving `&A`.
    #[must_use]
    pub fn of<A: Any>() -> Self {
        Self {
            args: TypeId::of::<A>(),
            args_name: type_name::<A>(),
        }
    }

    /// Type id of the argument type.
    #[must_use]
    pub const fn args_type(&self) -> TypeId {
        self.args
    }

    /// Readable name of the argument type.
    #[must_use]
    pub const fn args_name(&self) -> &'static str {
        self.args_name
    }
}

impl PartialEq for HandlerSignature {
    fn eq(&self, other: &Self) -> bool {
        self.args == other.args
    }
}

impl Eq for HandlerSignature {}

impl Hash for HandlerSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.args.hash(state);
    }
}

/// Identifier of one subscription on an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
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

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability to attach a trampoline to a live event owner and detach it again.
///
/// Implementations wrap whatever publish mechanism the owner already has. The
/// owner is passed type-erased; implementations downcast it to their concrete
/// type and return an error if it does not match.
pub trait EventAccessor: Send + Sync {
    /// Attach `trampoline` to the owner's event and return a token for detaching it.
    fn attach(&self, owner: &DynOwner, trampoline: Trampoline) -> RelayResult<SubscriptionId>;

    /// Detach a previously attached trampoline. Unknown tokens are ignored.
    fn detach(&self, owner: &DynOwner, subscription: SubscriptionId) -> RelayResult<()>;
}

struct DescriptorInner {
    declaring_type: TypeId,
    declaring_type_name: &'static str,
    name: String,
    signature: HandlerSignature,
    is_static: bool,
    accessor: Option<Arc<dyn EventAccessor>>,
}

/// Opaque handle identifying one publishable event on a type.
///
/// Two descriptors are equal when declaring type, name and signature match.
#[derive(Clone)]
pub struct EventDescriptor {
    inner: Arc<DescriptorInner>,
}

impl EventDescriptor {
    /// Start building a descriptor for event `name` on owner type `S` whose
    /// handlers receive `&A`.
    #[must_use]
    pub fn builder<S: Any, A: Any>(name: impl Into<String>) -> EventDescriptorBuilder {
        EventDescriptorBuilder {
            declaring_type: TypeId::of::<S>(),
            declaring_type_name: type_name::<S>(),
            name: name.into(),
            signature: HandlerSignature::of::<A>(),
            is_static: false,
            accessor: None,
        }
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Type id of the declaring owner type.
    #[must_use]
    pub fn declaring_type(&self) -> TypeId {
        self.inner.declaring_type
    }

    /// Readable name of the declaring owner type.
    #[must_use]
    pub fn declaring_type_name(&self) -> &'static str {
        self.inner.declaring_type_name
    }

    /// Signature every handler of this event must have.
    #[must_use]
    pub fn signature(&self) -> HandlerSignature {
        self.inner.signature
    }

    /// True when the event is static rather than bound to an owner instance.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    /// True when the descriptor can attach a trampoline itself.
    #[must_use]
    pub fn has_accessor(&self) -> bool {
        self.inner.accessor.is_some()
    }

    /// True when this descriptor was declared on `S`.
    #[must_use]
    pub fn belongs_to<S: Any>(&self) -> bool {
        self.inner.declaring_type == TypeId::of::<S>()
    }

    pub(crate) fn accessor(&self) -> RelayResult<Arc<dyn EventAccessor>> {
        self.inner.accessor.clone().ok_or_else(|| {
            ValidationError::NoAccessor {
                event: self.inner.name.clone(),
            }
            .into()
        })
    }

    /// Attach a trampoline to `owner` through this descriptor's accessor.
    pub fn attach(&self, owner: &DynOwner, trampoline: Trampoline) -> RelayResult<SubscriptionId> {
        self.accessor()?.attach(owner, trampoline)
    }

    /// Detach a trampoline previously attached through [`Self::attach`].
    pub fn detach(&self, owner: &DynOwner, subscription: SubscriptionId) -> RelayResult<()> {
        self.accessor()?.detach(owner, subscription)
    }

    pub(crate) fn check_handler(&self, signature: HandlerSignature) -> RelayResult<()> {
        if signature == self.inner.signature {
            return Ok(());
        }
        Err(ValidationError::InvalidHandlerKind {
            event: self.inner.name.clone(),
            expected: self.inner.signature.args_name(),
            actual: signature.args_name(),
        }
        .into())
    }
}

impl PartialEq for EventDescriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.declaring_type == other.inner.declaring_type
                && self.inner.name == other.inner.name
                && self.inner.signature == other.inner.signature)
    }
}

impl Eq for EventDescriptor {}

impl Hash for EventDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.declaring_type.hash(state);
        self.inner.name.hash(state);
        self.inner.signature.hash(state);
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("owner", &self.inner.declaring_type_name)
            .field("name", &self.inner.name)
            .field("args", &self.inner.signature.args_name())
            .field("is_static", &self.inner.is_static)
            .field("has_accessor", &self.inner.accessor.is_some())
            .finish()
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.inner.declaring_type_name, self.inner.name)
    }
}

/// Builder for [`EventDescriptor`].
pub struct EventDescriptorBuilder {
    declaring_type: TypeId,
    declaring_type_name: &'static str,
    name: String,
    signature: HandlerSignature,
    is_static: bool,
    accessor: Option<Arc<dyn EventAccessor>>,
}

impl EventDescriptorBuilder {
    /// Mark the event as static.
    #[must_use]
    pub fn static_event(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Give the descriptor an attach/detach capability.
    #[must_use]
    pub fn accessor(mut self, accessor: Arc<dyn EventAccessor>) -> Self {
        self.accessor = Some(accessor);
        self
    }

    /// Finish the descriptor.
    #[must_use]
    pub fn build(self) -> EventDescriptor {
        EventDescriptor {
            inner: Arc::new(DescriptorInner {
                declaring_type: self.declaring_type,
                declaring_type_name: self.declaring_type_name,
                name: self.name,
                signature: self.signature,
                is_static: self.is_static,
                accessor: self.accessor,
            }),
        }
    }
}
