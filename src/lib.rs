//! Distributed training and evaluation engine for mixture-of-experts vision
//! transformers trained with knowledge distillation.
//!
//! The crate owns the epoch loop and everything around it: streaming metric
//! meters with exact cross-process averages, periodic progress reporting,
//! gate-contrastive and load-balance auxiliary losses, a closed-form cosine
//! learning-rate schedule and parameter EMA. The model, distillation
//! criterion, optimizer and loss scaler stay behind trait seams so any
//! candle model and optimizer stack can plug in.
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use moe_vit_trainer_rs::prelude::*;
//!
//! # fn run<M, C, O, S, I>(
//! #     model: &mut M,
//! #     criterion: &C,
//! #     data: I,
//! #     optimizer: &mut O,
//! #     scaler: &mut S,
//! # ) -> TrainerResult<()>
//! # where
//! #     M: GatedModel,
//! #     C: DistillationCriterion,
//! #     O: StepOptimizer,
//! #     S: LossScaler<M, O>,
//! #     I: ExactSizeIterator<Item = TrainBatch>,
//! # {
//! let config = EngineConfig::default();
//! let sink = TracingSink;
//! let stats = train_one_epoch(
//!     model, criterion, data, optimizer, scaler,
//!     &Device::Cpu, 0, &config,
//!     None, None, None, None,
//!     &SingleProcess, &sink,
//! )?;
//! println!("epoch loss {}", stats["loss"]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod contrastive;
pub mod distributed;
pub mod ema;
pub mod engine;
pub mod error;
pub mod memory;
pub mod meters;
pub mod progress;
pub mod schedule;

pub use config::EngineConfig;
pub use contrastive::{contrastive_loss, supervised_contrastive_loss, DEFAULT_TEMPERATURE};
pub use distributed::{CallbackGroup, ProcessGroup, SingleProcess};
pub use ema::{ParameterEma, WeightEma};
pub use engine::{accuracy, evaluate, train_one_epoch};
pub use error::{TrainerError, TrainerResult};
pub use memory::MemoryTracker;
pub use meters::{MeterFormat, MetricLogger, SmoothedValue};
pub use progress::{ProgressIter, ProgressSink, TracingSink};
pub use schedule::CosineSchedule;

use candle_core::{Device, Tensor};

/// A model whose expert-gating activations the engine can read back.
///
/// `forward` consumes a batch of images and produces classification logits.
/// Implementations with noisy gating additionally expose the per-layer
/// gating activations of the most recent forward pass and a load-balance
/// regularizer; dense models can leave the defaults in place.
pub trait GatedModel: Send {
    /// Forward pass: `[N, ...]` images to `[N, classes]` logits.
    fn forward(&mut self, images: &Tensor) -> TrainerResult<Tensor>;

    /// Switch between training and inference behavior (dropout, gate noise).
    fn set_train(&mut self, _train: bool) {}

    /// Per-layer gating activations (`[N, C]` each) from the most recent
    /// `forward`. Empty when the model has no gated layers.
    fn gating_activations(&self) -> TrainerResult<Vec<Tensor>> {
        Ok(Vec::new())
    }

    /// Weighted load-balance regularizer for noisy gating, if the model
    /// defines one.
    fn load_balance_loss(&self, _weight: f64) -> TrainerResult<Option<Tensor>> {
        Ok(None)
    }

    /// Named trainable parameters, for EMA shadowing.
    fn trainable_parameters(&self) -> TrainerResult<Vec<(String, Tensor)>> {
        Ok(Vec::new())
    }
}

/// Distillation-aware training criterion.
pub trait DistillationCriterion {
    /// Compute the scalar training loss.
    ///
    /// `inputs` are the (possibly mixed) images, so the criterion can run
    /// them through its frozen instructor; `outputs` are the student logits
    /// and `targets` whatever the mixup stage produced.
    fn forward(&self, inputs: &Tensor, outputs: &Tensor, targets: &Tensor)
        -> TrainerResult<Tensor>;
}

/// Optimizer surface the engine needs; stepping happens inside the scaler.
pub trait StepOptimizer: Send {
    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Overwrite the learning rate, used by the closed-form schedule.
    fn set_learning_rate(&mut self, lr: f64);

    /// Clear accumulated gradients.
    fn zero_grad(&mut self);

    /// Whether the optimizer consumes second-order gradients, forwarded to
    /// the scaler as its `create_graph` flag.
    fn is_second_order(&self) -> bool {
        false
    }
}

/// Backward pass, gradient clipping and optimizer step as one unit.
///
/// Keeping the three together lets mixed-precision implementations unscale
/// and skip steps without the engine knowing.
pub trait LossScaler<M: GatedModel, O: StepOptimizer> {
    /// Backpropagate `loss`, optionally clip the global gradient norm, and
    /// apply the optimizer step.
    fn backward_and_step(
        &mut self,
        loss: &Tensor,
        model: &mut M,
        optimizer: &mut O,
        clip_grad: Option<f64>,
        create_graph: bool,
    ) -> TrainerResult<()>;
}

/// Batch-level input augmentation such as mixup or cutmix.
pub trait Mixup {
    /// Blend images and convert hard labels into whatever target form the
    /// criterion expects.
    fn mix(&self, images: &Tensor, targets: &Tensor) -> TrainerResult<(Tensor, Tensor)>;
}

/// One training or evaluation batch.
///
/// `targets` holds discrete class ids (`[N]`, integer dtype). The optional
/// second view carries an independent augmentation of the same samples for
/// the gate-contrastive loss.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// Input images, `[N, ...]`.
    pub images: Tensor,
    /// Second augmented view of the same samples, when contrastive training
    /// is on.
    pub second_view: Option<Tensor>,
    /// Discrete class ids, `[N]`.
    pub targets: Tensor,
}

impl TrainBatch {
    /// Batch without a second view.
    pub fn new(images: Tensor, targets: Tensor) -> Self {
        Self {
            images,
            second_view: None,
            targets,
        }
    }

    /// Attach a second augmented view.
    #[must_use]
    pub fn with_second_view(mut self, view: Tensor) -> Self {
        self.second_view = Some(view);
        self
    }

    /// Number of samples in the batch.
    pub fn batch_size(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    /// Copy every tensor to `device`.
    pub fn to_device(&self, device: &Device) -> TrainerResult<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            second_view: self
                .second_view
                .as_ref()
                .map(|view| view.to_device(device))
                .transpose()?,
            targets: self.targets.to_device(device)?,
        })
    }
}

/// Convenience re-exports for embedding applications.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::distributed::{CallbackGroup, ProcessGroup, SingleProcess};
    pub use crate::ema::{ParameterEma, WeightEma};
    pub use crate::engine::{accuracy, evaluate, train_one_epoch};
    pub use crate::error::{TrainerError, TrainerResult};
    pub use crate::memory::MemoryTracker;
    pub use crate::meters::{MeterFormat, MetricLogger, SmoothedValue};
    pub use crate::progress::{ProgressSink, TracingSink};
    pub use crate::schedule::CosineSchedule;
    pub use crate::{
        DistillationCriterion, GatedModel, LossScaler, Mixup, StepOptimizer, TrainBatch,
    };
}
