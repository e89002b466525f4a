//! Exponential moving average of model parameters.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{TrainerError, TrainerResult};
use crate::GatedModel;

/// Consumer of post-step parameter snapshots.
///
/// Called once per iteration after the optimizer step and device sync, so
/// the parameters it reads are the ones the step produced.
pub trait WeightEma<M>: Send {
    /// Fold the model's current parameters into the shadow copy.
    fn update(&mut self, model: &M) -> TrainerResult<()>;
}

/// Decay-weighted shadow copy of every named parameter.
///
/// `shadow = decay * shadow + (1 - decay) * parameter`, keyed by parameter
/// name. The first update seeds each shadow with the parameter itself.
#[derive(Debug)]
pub struct ParameterEma {
    decay: f64,
    shadow: HashMap<String, Tensor>,
}

impl ParameterEma {
    /// Create an averager with the given decay in `(0, 1)`.
    pub fn new(decay: f64) -> TrainerResult<Self> {
        if !(0.0..1.0).contains(&decay) || decay == 0.0 {
            return Err(TrainerError::invalid_config(
                "EMA decay must be in the open interval (0, 1)",
            ));
        }
        Ok(Self {
            decay,
            shadow: HashMap::new(),
        })
    }

    /// The configured decay factor.
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Read the shadow value for a parameter, if one has been seeded.
    pub fn shadow(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }

    /// All shadow parameters, keyed by name.
    pub fn parameters(&self) -> &HashMap<String, Tensor> {
        &self.shadow
    }
}

impl<M: GatedModel> WeightEma<M> for ParameterEma {
    fn update(&mut self, model: &M) -> TrainerResult<()> {
        for (name, value) in model.trainable_parameters()? {
            let value = value.detach();
            let next = match self.shadow.get(&name) {
                Some(prev) => ((prev * self.decay)? + (&value * (1.0 - self.decay))?)?,
                None => value,
            };
            self.shadow.insert(name, next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FixedModel {
        params: Arc<Mutex<Vec<(String, Tensor)>>>,
    }

    impl GatedModel for FixedModel {
        fn forward(&mut self, images: &Tensor) -> TrainerResult<Tensor> {
            Ok(images.clone())
        }

        fn trainable_parameters(&self) -> TrainerResult<Vec<(String, Tensor)>> {
            Ok(self.params.lock().clone())
        }
    }

    fn model_with(value: f32) -> FixedModel {
        let t = Tensor::from_vec(vec![value; 2], 2, &Device::Cpu).unwrap();
        FixedModel {
            params: Arc::new(Mutex::new(vec![("w".to_string(), t)])),
        }
    }

    #[test]
    fn test_first_update_seeds_shadow() {
        let mut ema = ParameterEma::new(0.9).unwrap();
        let model = model_with(4.0);
        ema.update(&model).unwrap();
        let shadow = ema.shadow("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(shadow, vec![4.0, 4.0]);
    }

    #[test]
    fn test_update_blends_by_decay() {
        let mut ema = ParameterEma::new(0.5).unwrap();
        let model = model_with(4.0);
        ema.update(&model).unwrap();

        let t = Tensor::from_vec(vec![8.0_f32; 2], 2, &Device::Cpu).unwrap();
        model.params.lock()[0].1 = t;
        ema.update(&model).unwrap();

        let shadow = ema.shadow("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(shadow, vec![6.0, 6.0]);
    }

    #[test]
    fn test_rejects_degenerate_decay() {
        assert!(ParameterEma::new(0.0).is_err());
        assert!(ParameterEma::new(1.0).is_err());
        assert!(ParameterEma::new(-0.1).is_err());
    }
}
