//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::contrastive::DEFAULT_TEMPERATURE;
use crate::error::{TrainerError, TrainerResult};

/// Knobs for one training epoch.
///
/// Defaults disable every auxiliary term, leaving the plain
/// distillation-loss step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gradient clipping threshold handed to the loss scaler.
    /// Zero or negative disables clipping.
    pub max_grad_norm: f64,

    /// Weight applied to each gating layer's contrastive loss.
    /// Zero disables the gate-contrastive term entirely.
    pub gate_contrastive_weight: f64,

    /// Use the label-masked supervised contrastive variant instead of
    /// plain InfoNCE.
    pub gate_contrastive_supervised: bool,

    /// Softmax temperature for the gate-contrastive losses.
    pub gate_contrastive_temperature: f64,

    /// Weight for the noisy-gating load-balance regularizer.
    /// Zero disables the term.
    pub load_balance_weight: f64,

    /// Emit a progress line every this many iterations.
    pub print_freq: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_grad_norm: 0.0,
            gate_contrastive_weight: 0.0,
            gate_contrastive_supervised: false,
            gate_contrastive_temperature: DEFAULT_TEMPERATURE,
            load_balance_weight: 0.0,
            print_freq: 10,
        }
    }
}

impl EngineConfig {
    /// Check value ranges before training starts.
    pub fn validate(&self) -> TrainerResult<()> {
        if self.gate_contrastive_weight < 0.0 {
            return Err(TrainerError::invalid_config(
                "gate_contrastive_weight must be non-negative",
            ));
        }
        if self.gate_contrastive_temperature <= 0.0 {
            return Err(TrainerError::invalid_config(
                "gate_contrastive_temperature must be positive",
            ));
        }
        if self.load_balance_weight < 0.0 {
            return Err(TrainerError::invalid_config(
                "load_balance_weight must be non-negative",
            ));
        }
        if self.print_freq == 0 {
            return Err(TrainerError::invalid_config(
                "print_freq must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.gate_contrastive_weight = -1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.gate_contrastive_temperature = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.print_freq = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = EngineConfig {
            max_grad_norm: 1.0,
            gate_contrastive_weight: 0.1,
            gate_contrastive_supervised: true,
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_grad_norm, 1.0);
        assert!(back.gate_contrastive_supervised);
    }
}
