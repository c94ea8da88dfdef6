//! Error types for weakrelay.
//!
//! All errors are strongly typed using thiserror. Argument and shape problems
//! surface as [`ValidationError`] synchronously from registration and from
//! `add`/`remove`; faults raised by handlers surface as [`DispatchError`] from
//! `raise`. Operations on a relay whose owner is gone are never errors.

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed error type a fallible handler may return.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A fault returned by a handler while it was being invoked.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct HandlerFault {
    source: BoxError,
}

impl HandlerFault {
    /// Wraps any error as a handler fault.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self {
            source: error.into(),
        }
    }

    /// Creates a fault carrying only a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }

    /// Returns the wrapped error.
    #[must_use]
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// Result type returned by handlers and by event emission.
pub type HandlerResult = Result<(), HandlerFault>;

/// Validation errors reported synchronously to the caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required argument '{name}' is missing")]
    MissingArgument {
        name: &'static str,
    },

    #[error("Event '{event}' is not declared on {owner_type}")]
    UnknownEvent {
        owner_type: &'static str,
        event: String,
    },

    #[error("Event '{event}' is static; weak relays need an instance owner")]
    StaticEventUnsupported {
        event: String,
    },

    #[error("Handler for '{event}' takes {actual}, expected {expected}")]
    InvalidHandlerKind {
        event: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Event '{event}' raised with {actual}, expected {expected}")]
    InvalidArguments {
        event: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Event '{event}' has no attach capability")]
    NoAccessor {
        event: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised while dispatching an event to its handlers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Handler {method} faulted while handling '{event}': {fault}")]
    HandlerFault {
        event: String,
        method: &'static str,
        #[source]
        fault: HandlerFault,
    },

    #[error("{} handler(s) faulted while handling '{event}'", faults.len())]
    HandlerFaults {
        event: String,
        faults: Vec<HandlerFault>,
    },

    #[error("Attaching to '{event}' failed: {reason}")]
    AccessorFailed {
        event: String,
        reason: String,
    },
}

/// Top-level error type for weakrelay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns the handler faults carried by a dispatch error, if any.
    #[must_use]
    pub fn handler_faults(&self) -> Vec<&HandlerFault> {
        match self {
            Self::Dispatch(DispatchError::HandlerFault { fault, .. }) => vec![fault],
            Self::Dispatch(DispatchError::HandlerFaults { faults, .. }) => faults.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

pub(crate) fn lock_err(context: &'static str) -> RelayError {
    RelayError::internal(format!("poisoned lock: {context}"))
}
