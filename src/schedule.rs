//! Closed-form learning-rate schedule evaluated per iteration.

use serde::{Deserialize, Serialize};

use crate::error::{TrainerError, TrainerResult};

/// Linear warmup followed by half-cosine decay.
///
/// The schedule is a pure function of the fractional epoch, so it can be
/// evaluated at every iteration (`epoch + i / iters_per_epoch`) without any
/// stepping state to checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosineSchedule {
    /// Peak learning rate reached at the end of warmup.
    pub base_lr: f64,
    /// Floor the decay approaches at the final epoch.
    pub min_lr: f64,
    /// Length of the linear warmup in epochs. May be fractional or zero.
    pub warmup_epochs: f64,
    /// Total schedule length in epochs.
    pub total_epochs: f64,
}

impl CosineSchedule {
    /// Build a schedule, validating the shape parameters.
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        warmup_epochs: f64,
        total_epochs: f64,
    ) -> TrainerResult<Self> {
        let schedule = Self {
            base_lr,
            min_lr,
            warmup_epochs,
            total_epochs,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Check parameter consistency.
    pub fn validate(&self) -> TrainerResult<()> {
        if self.base_lr <= 0.0 {
            return Err(TrainerError::invalid_config("base_lr must be positive"));
        }
        if self.min_lr < 0.0 || self.min_lr > self.base_lr {
            return Err(TrainerError::invalid_config(
                "min_lr must be in [0, base_lr]",
            ));
        }
        if self.warmup_epochs < 0.0 {
            return Err(TrainerError::invalid_config(
                "warmup_epochs must be non-negative",
            ));
        }
        if self.total_epochs <= self.warmup_epochs {
            return Err(TrainerError::invalid_config(
                "total_epochs must exceed warmup_epochs",
            ));
        }
        Ok(())
    }

    /// Learning rate at fractional epoch `epoch`.
    pub fn lr_at(&self, epoch: f64) -> f64 {
        if epoch < self.warmup_epochs {
            return self.base_lr * epoch / self.warmup_epochs;
        }
        let progress =
            (epoch - self.warmup_epochs) / (self.total_epochs - self.warmup_epochs);
        let progress = progress.clamp(0.0, 1.0);
        self.min_lr
            + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_linear() {
        let sched = CosineSchedule::new(1.0, 0.0, 5.0, 100.0).unwrap();
        assert_eq!(sched.lr_at(0.0), 0.0);
        assert!((sched.lr_at(2.5) - 0.5).abs() < 1e-12);
        assert!((sched.lr_at(5.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_endpoints_and_midpoint() {
        let sched = CosineSchedule::new(0.8, 0.2, 0.0, 10.0).unwrap();
        assert!((sched.lr_at(0.0) - 0.8).abs() < 1e-12);
        // midpoint of the decay halves the span above the floor
        assert!((sched.lr_at(5.0) - 0.5).abs() < 1e-12);
        assert!((sched.lr_at(10.0) - 0.2).abs() < 1e-12);
        // past the end, pinned to the floor
        assert!((sched.lr_at(12.0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_fractional_epochs_are_monotone_during_decay() {
        let sched = CosineSchedule::new(0.1, 0.0, 1.0, 4.0).unwrap();
        let a = sched.lr_at(1.0);
        let b = sched.lr_at(1.5);
        let c = sched.lr_at(2.0);
        assert!(a > b && b > c);
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(CosineSchedule::new(0.0, 0.0, 1.0, 10.0).is_err());
        assert!(CosineSchedule::new(0.1, 0.2, 1.0, 10.0).is_err());
        assert!(CosineSchedule::new(0.1, 0.0, 10.0, 10.0).is_err());
    }
}
