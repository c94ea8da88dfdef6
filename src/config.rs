//! Relay and registry configuration.
//!
//! Both structs have sensible defaults and can be deserialized from JSON so an
//! embedding application can carry them in its own config files.

use serde::{Deserialize, Serialize};

use crate::error::{RelayResult, ValidationError};

/// What `raise` does when a handler returns a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Stop the pass at the first fault and return it.
    #[default]
    Abort,
    /// Abandon the faulting method's remaining repeats, keep dispatching to
    /// everything else, and return all faults together.
    Continue,
}

/// Per-relay behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Fault handling during `raise`.
    pub fault_policy: FaultPolicy,
    /// Detach the trampoline when `clear` empties the table.
    pub detach_on_clear: bool,
    /// Add/remove calls between full dead-owner sweeps of the table.
    pub sweep_threshold: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fault_policy: FaultPolicy::Abort,
            detach_on_clear: false,
            sweep_threshold: 64,
        }
    }
}

impl RelayConfig {
    pub(crate) fn effective_sweep_threshold(&self) -> usize {
        self.sweep_threshold.max(1)
    }
}

/// Registry behaviour, including the config handed to every relay it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Config applied to relays created by the registry.
    pub relay: RelayConfig,
    /// Registrations between sweeps of dead owners out of the registry.
    pub sweep_threshold: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            sweep_threshold: 32,
        }
    }
}

impl RegistryConfig {
    /// Parse a registry config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> RelayResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn effective_sweep_threshold(&self) -> usize {
        self.sweep_threshold.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_abort_and_keep_trampoline_on_clear() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.relay.fault_policy, FaultPolicy::Abort);
        assert!(!cfg.relay.detach_on_clear);
        assert_eq!(cfg.relay.sweep_threshold, 64);
        assert_eq!(cfg.sweep_threshold, 32);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = RegistryConfig::from_json(r#"{"relay":{"fault_policy":"continue"}}"#).unwrap();
        assert_eq!(cfg.relay.fault_policy, FaultPolicy::Continue);
        assert_eq!(cfg.relay.sweep_threshold, 64);
        assert_eq!(cfg.sweep_threshold, 32);
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = RegistryConfig::from_json("{\"sweep_threshold\": \"lots\"}").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let cfg = RelayConfig {
            sweep_threshold: 0,
            ..RelayConfig::default()
        };
        assert_eq!(cfg.effective_sweep_threshold(), 1);
    }
}
