//! Epoch orchestration: the training step state machine and evaluation.
//!
//! `train_one_epoch` drives one pass over the batch stream with a fixed
//! per-iteration order: schedule, device move, mixup, forward, primary
//! distillation loss, auxiliary gate-contrastive and load-balance terms,
//! finiteness check, zero_grad, scaler-mediated backward and step, device
//! sync, EMA, metric recording. `evaluate` runs the no-grad counterpart
//! with top-1/top-5 accuracy. Both synchronize the metric registry across
//! the process group before returning global averages.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::loss::cross_entropy;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::contrastive::{contrastive_loss, supervised_contrastive_loss};
use crate::distributed::ProcessGroup;
use crate::ema::WeightEma;
use crate::error::{TrainerError, TrainerResult};
use crate::memory::MemoryTracker;
use crate::meters::{MeterFormat, MetricLogger, SmoothedValue};
use crate::progress::{ProgressIter, ProgressSink};
use crate::schedule::CosineSchedule;
use crate::{DistillationCriterion, GatedModel, LossScaler, Mixup, StepOptimizer, TrainBatch};

/// Top-k classification accuracy in percent, one value per requested `k`.
///
/// `output` is `[N, classes]` logits, `target` is `[N]` class ids. A `k`
/// larger than the class count is clamped to it.
pub fn accuracy(output: &Tensor, target: &Tensor, topk: &[usize]) -> TrainerResult<Vec<f64>> {
    let (n, classes) = output.dims2()?;
    if n == 0 {
        return Err(TrainerError::training("empty batch in accuracy"));
    }
    let maxk = topk.iter().copied().max().unwrap_or(1).min(classes);
    let ranked = output.arg_sort_last_dim(false)?.narrow(1, 0, maxk)?;
    let target = target
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .broadcast_as((n, maxk))?;
    let correct = ranked.eq(&target)?.to_dtype(DType::F32)?;

    let mut out = Vec::with_capacity(topk.len());
    for &k in topk {
        let k = k.min(classes);
        let hits = correct.narrow(1, 0, k)?.sum_all()?.to_scalar::<f32>()?;
        out.push(f64::from(hits) * 100.0 / n as f64);
    }
    Ok(out)
}

fn scalar(t: &Tensor) -> TrainerResult<f64> {
    Ok(f64::from(t.detach().to_dtype(DType::F32)?.to_scalar::<f32>()?))
}

/// Run one training epoch and return each meter's synchronized global
/// average, keyed by metric name.
///
/// The batch stream must have a known length; the closed-form `schedule`,
/// when present, is evaluated at the fractional epoch of every iteration.
/// A non-finite primary loss aborts the epoch before any optimizer state
/// is touched.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch<M, C, O, S, I>(
    model: &mut M,
    criterion: &C,
    data: I,
    optimizer: &mut O,
    scaler: &mut S,
    device: &Device,
    epoch: usize,
    config: &EngineConfig,
    schedule: Option<&CosineSchedule>,
    mut ema: Option<&mut dyn WeightEma<M>>,
    mixup: Option<&dyn Mixup>,
    memory: Option<&MemoryTracker>,
    group: &dyn ProcessGroup,
    sink: &dyn ProgressSink,
) -> TrainerResult<HashMap<String, f64>>
where
    M: GatedModel,
    C: DistillationCriterion,
    O: StepOptimizer,
    S: LossScaler<M, O>,
    I: ExactSizeIterator<Item = TrainBatch>,
{
    config.validate()?;
    model.set_train(true);

    let num_iters = data.len();
    let meters = Arc::new(Mutex::new(MetricLogger::default()));
    meters
        .lock()
        .add_meter("lr", SmoothedValue::new(1, MeterFormat::Value));

    let header = format!("Epoch: [{epoch}]");
    let mut progress = ProgressIter::new(data, config.print_freq, header, Arc::clone(&meters), sink);
    if let Some(tracker) = memory {
        progress = progress.with_memory(tracker);
    }

    let mut i = 0usize;
    for batch in progress {
        if let Some(schedule) = schedule {
            let fractional = epoch as f64 + i as f64 / num_iters.max(1) as f64;
            optimizer.set_learning_rate(schedule.lr_at(fractional));
        }

        let batch = batch.to_device(device)?;
        let discrete_targets = batch.targets.clone();
        let (samples, targets) = match mixup {
            Some(mixup) => mixup.mix(&batch.images, &batch.targets)?,
            None => (batch.images.clone(), batch.targets.clone()),
        };

        let outputs = model.forward(&samples)?;
        let mut loss = criterion.forward(&samples, &outputs, &targets)?;
        let loss_value = scalar(&loss)?;

        if config.gate_contrastive_weight > 0.0 {
            let second_view = batch.second_view.as_ref().ok_or_else(|| {
                TrainerError::training("gate-contrastive training requires a second view per batch")
            })?;
            let query_gates = model.gating_activations()?;
            let _ = model.forward(second_view)?;
            let key_gates: Vec<Tensor> = model
                .gating_activations()?
                .iter()
                .map(Tensor::detach)
                .collect();

            let mut gate_loss: Option<Tensor> = None;
            for (queries, keys) in query_gates.iter().zip(key_gates.iter()) {
                let layer_loss = if config.gate_contrastive_supervised {
                    supervised_contrastive_loss(
                        queries,
                        keys,
                        &discrete_targets,
                        config.gate_contrastive_temperature,
                        group,
                    )?
                } else {
                    contrastive_loss(queries, keys, config.gate_contrastive_temperature, group)?
                };
                let weighted = (layer_loss * config.gate_contrastive_weight)?;
                gate_loss = Some(match gate_loss {
                    Some(acc) => (acc + weighted)?,
                    None => weighted,
                });
            }

            if let Some(gate_loss) = gate_loss {
                meters.lock().update("loss_gate", scalar(&gate_loss)?, 1.0);
                loss = (loss + gate_loss)?;
            }
        }

        if config.load_balance_weight > 0.0 {
            if let Some(balance) = model.load_balance_loss(config.load_balance_weight)? {
                loss = (loss + balance)?;
            }
        }

        if !loss_value.is_finite() {
            tracing::error!("Loss is {}, stopping training", loss_value);
            return Err(TrainerError::NonFiniteLoss {
                value: loss_value,
                iteration: i,
            });
        }

        optimizer.zero_grad();
        let clip = (config.max_grad_norm > 0.0).then_some(config.max_grad_norm);
        let create_graph = optimizer.is_second_order();
        scaler.backward_and_step(&loss, model, optimizer, clip, create_graph)?;

        device.synchronize()?;
        if let Some(ema) = ema.as_mut() {
            ema.update(model)?;
        }

        {
            let mut meters = meters.lock();
            meters.update("loss", loss_value, 1.0);
            meters.update("lr", optimizer.learning_rate(), 1.0);
        }
        i += 1;
    }

    let mut meters = meters.lock();
    meters.synchronize(group)?;
    sink.info(&format!("Averaged stats: {}", meters.render()));
    meters.global_averages()
}

/// Evaluate the model over a labeled stream and return synchronized global
/// averages for `loss`, `acc1` and `acc5`.
///
/// Runs in inference mode with plain cross-entropy; accuracy meters are
/// weighted by batch size so ragged final batches average correctly.
pub fn evaluate<M, I>(
    model: &mut M,
    data: I,
    device: &Device,
    memory: Option<&MemoryTracker>,
    group: &dyn ProcessGroup,
    sink: &dyn ProgressSink,
) -> TrainerResult<HashMap<String, f64>>
where
    M: GatedModel,
    I: ExactSizeIterator<Item = TrainBatch>,
{
    model.set_train(false);

    let meters = Arc::new(Mutex::new(MetricLogger::default()));
    let mut progress = ProgressIter::new(data, 10, "Test:", Arc::clone(&meters), sink);
    if let Some(tracker) = memory {
        progress = progress.with_memory(tracker);
    }

    for batch in progress {
        let batch = batch.to_device(device)?;
        let outputs = model.forward(&batch.images)?.detach();
        let targets = batch.targets.to_dtype(DType::U32)?;

        let loss = cross_entropy(&outputs, &targets)?;
        let accs = accuracy(&outputs, &targets, &[1, 5])?;
        let batch_size = batch.batch_size() as f64;

        let mut meters = meters.lock();
        meters.update("loss", scalar(&loss)?, 1.0);
        meters.update("acc1", accs[0], batch_size);
        meters.update("acc5", accs[1], batch_size);
    }

    let mut meters = meters.lock();
    meters.synchronize(group)?;
    let averages = meters.global_averages()?;
    sink.info(&format!(
        "* Acc@1 {:.3} Acc@5 {:.3} loss {:.3}",
        averages.get("acc1").copied().unwrap_or(0.0),
        averages.get("acc5").copied().unwrap_or(0.0),
        averages.get("loss").copied().unwrap_or(0.0),
    ));
    Ok(averages)
}
