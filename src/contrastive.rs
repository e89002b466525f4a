//! Cross-process contrastive losses over gating activations.
//!
//! Both losses treat the first view's activations as queries and the second
//! view's as keys, gather keys from every rank, and score each query against
//! the full key set with a temperature-scaled dot product. A query's positive
//! is its own sample's key, which lands at column `n + rank * N` after the
//! rank-ordered gather. The supervised variant additionally removes
//! same-label pairs from the denominator so they are not treated as
//! negatives.

use candle_core::{Tensor, D};
use candle_nn::loss::cross_entropy;

use crate::distributed::ProcessGroup;
use crate::error::{TrainerError, TrainerResult};

/// Default softmax temperature for gate-contrastive losses.
pub const DEFAULT_TEMPERATURE: f64 = 0.2;

/// Normalize each row of a 2-D tensor to unit L2 norm.
fn l2_normalize(t: &Tensor) -> TrainerResult<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(t.broadcast_div(&norm)?)
}

/// Column indices of the positive keys for this rank's queries.
fn positive_targets(n: usize, rank: usize, t: &Tensor) -> TrainerResult<Tensor> {
    let offset = (rank * n) as u32;
    let targets: Vec<u32> = (0..n as u32).map(|i| i + offset).collect();
    Ok(Tensor::from_vec(targets, n, t.device())?)
}

fn scaled_logits(
    queries: &Tensor,
    keys: &Tensor,
    temperature: f64,
    group: &dyn ProcessGroup,
) -> TrainerResult<(Tensor, Tensor)> {
    if temperature <= 0.0 {
        return Err(TrainerError::invalid_config(
            "contrastive temperature must be positive",
        ));
    }
    let queries = l2_normalize(queries)?;
    let keys = l2_normalize(keys)?;
    let all_keys = group.all_gather(&keys)?;
    let logits = (queries.matmul(&all_keys.t()?)? / temperature)?;
    Ok((logits, all_keys))
}

/// InfoNCE loss between per-sample query and key activations.
///
/// `queries` and `keys` are `[N, C]` activations for the same `N` samples
/// under two views. Keys from all ranks form the candidate set; every
/// non-positive candidate counts as a negative. The mean cross-entropy is
/// scaled by `2 * temperature` so its magnitude stays comparable across
/// temperature settings.
pub fn contrastive_loss(
    queries: &Tensor,
    keys: &Tensor,
    temperature: f64,
    group: &dyn ProcessGroup,
) -> TrainerResult<Tensor> {
    let (logits, _) = scaled_logits(queries, keys, temperature, group)?;
    let n = logits.dim(0)?;
    let targets = positive_targets(n, group.rank(), &logits)?;
    let loss = cross_entropy(&logits, &targets)?;
    Ok((loss * (2.0 * temperature))?)
}

/// Supervised variant that excludes same-label pairs from the negatives.
///
/// `labels` are the discrete class ids (`[N]`, u32) of this rank's samples,
/// taken before any label smoothing or mixing. A candidate key with the same
/// label as the query is masked to `-inf` before the softmax, except the
/// query's own positive which always stays in. A batch drawn from a single
/// class therefore reduces every row to its positive alone and yields a
/// zero loss instead of a degenerate one.
pub fn supervised_contrastive_loss(
    queries: &Tensor,
    keys: &Tensor,
    labels: &Tensor,
    temperature: f64,
    group: &dyn ProcessGroup,
) -> TrainerResult<Tensor> {
    let (logits, all_keys) = scaled_logits(queries, keys, temperature, group)?;
    let n = logits.dim(0)?;
    let total = all_keys.dim(0)?;
    let rank = group.rank();

    let labels_f = labels.to_dtype(candle_core::DType::F32)?;
    let all_labels = group.all_gather(&labels_f)?;
    // keep[n][m]: labels differ, so the pair is a genuine negative
    let diff = labels_f
        .unsqueeze(1)?
        .broadcast_sub(&all_labels.unsqueeze(0)?)?
        .abs()?;
    let keep = diff.gt(0.0)?;

    // the positive column survives even though its labels match
    let mut positives = vec![0u8; n * total];
    for i in 0..n {
        positives[i * total + rank * n + i] = 1;
    }
    let positives = Tensor::from_vec(positives, (n, total), logits.device())?;
    let keep = keep.maximum(&positives)?;

    let neg_inf = Tensor::full(f32::NEG_INFINITY, (n, total), logits.device())?;
    let masked = keep.where_cond(&logits, &neg_inf)?;

    let targets = positive_targets(n, rank, &logits)?;
    let loss = cross_entropy(&masked, &targets)?;
    Ok((loss * (2.0 * temperature))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{CallbackGroup, SingleProcess};
    use candle_core::{DType, Device};

    fn identity_features(n: usize) -> Tensor {
        let mut data = vec![0.0_f32; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Tensor::from_vec(data, (n, n), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_contrastive_loss_identity_views() {
        // Orthonormal features, key equals query. Each row's logits are
        // 1/tau on the diagonal and 0 elsewhere, so the loss is
        // 2*tau * (ln(e^{1/tau} + (n-1)) - 1/tau).
        let q = identity_features(4);
        let loss = contrastive_loss(&q, &q, 0.2, &SingleProcess).unwrap();
        let got = loss.to_scalar::<f32>().unwrap() as f64;
        let expected = 2.0 * 0.2 * (((5.0_f64).exp() + 3.0).ln() - 5.0);
        assert!((got - expected).abs() < 1e-4, "got {got}, expected {expected}");
    }

    #[test]
    fn test_supervised_matches_unsupervised_with_distinct_labels() {
        let q = identity_features(4);
        let labels = Tensor::from_vec(vec![0u32, 1, 2, 3], 4, &Device::Cpu).unwrap();
        let plain = contrastive_loss(&q, &q, 0.2, &SingleProcess).unwrap();
        let supervised =
            supervised_contrastive_loss(&q, &q, &labels, 0.2, &SingleProcess).unwrap();
        let a = plain.to_scalar::<f32>().unwrap();
        let b = supervised.to_scalar::<f32>().unwrap();
        assert!((a - b).abs() < 1e-5);
    }

    #[test]
    fn test_supervised_mixed_labels_masks_only_same_label_negatives() {
        // Labels [0, 0, 1, 2] with orthonormal identity features. Rows 0
        // and 1 each lose their one same-label negative, leaving the
        // positive (logit 1/tau) plus two zero-logit negatives; rows 2 and
        // 3 keep all three negatives.
        let q = identity_features(4);
        let labels = Tensor::from_vec(vec![0u32, 0, 1, 2], 4, &Device::Cpu).unwrap();
        let loss = supervised_contrastive_loss(&q, &q, &labels, 0.2, &SingleProcess).unwrap();
        let got = loss.to_scalar::<f32>().unwrap() as f64;

        let inv_tau = 5.0_f64;
        let ce_masked_row = (inv_tau.exp() + 2.0).ln() - inv_tau;
        let ce_full_row = (inv_tau.exp() + 3.0).ln() - inv_tau;
        let expected = 2.0 * 0.2 * (2.0 * ce_masked_row + 2.0 * ce_full_row) / 4.0;
        assert!((got - expected).abs() < 1e-4, "got {got}, expected {expected}");

        // fewer surviving negatives shrink the denominator
        let unsupervised = contrastive_loss(&q, &q, 0.2, &SingleProcess).unwrap();
        assert!(got < f64::from(unsupervised.to_scalar::<f32>().unwrap()));
    }

    #[test]
    fn test_supervised_single_class_batch_is_zero_and_finite() {
        // Every pair shares the label, so only the positives survive the
        // mask and each row's softmax is a certainty.
        let q = identity_features(4);
        let labels = Tensor::from_vec(vec![7u32, 7, 7, 7], 4, &Device::Cpu).unwrap();
        let loss = supervised_contrastive_loss(&q, &q, &labels, 0.2, &SingleProcess).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite());
        assert!(value.abs() < 1e-5);
    }

    #[test]
    fn test_positive_index_offsets_by_rank() {
        // Pretend to be rank 1 of 2. The gather callback prepends a block of
        // zero keys standing in for rank 0, so this rank's positives sit at
        // columns n + i.
        let n = 3;
        let group = CallbackGroup::new(
            1,
            2,
            Box::new(|| Ok(())),
            Box::new(|_: &mut [f64]| Ok(())),
            Box::new(move |t: &Tensor| {
                let zeros = t.zeros_like()?;
                Ok(Tensor::cat(&[&zeros, t], 0)?)
            }),
        );
        let q = identity_features(n);
        let loss = contrastive_loss(&q, &q, 0.2, &group).unwrap();
        let got = loss.to_scalar::<f32>().unwrap() as f64;
        // logits: 3 zero columns from the fake rank 0, then the identity
        // block. Positive logit 1/tau, 2n-1 zero-logit negatives.
        let expected = 2.0 * 0.2 * (((5.0_f64).exp() + 5.0).ln() - 5.0);
        assert!((got - expected).abs() < 1e-4, "got {got}, expected {expected}");
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        let q = identity_features(2);
        assert!(matches!(
            contrastive_loss(&q, &q, 0.0, &SingleProcess),
            Err(TrainerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_normalization_makes_scale_irrelevant() {
        let q = identity_features(4);
        let scaled = (&q * 10.0).unwrap();
        let a = contrastive_loss(&q, &q, 0.2, &SingleProcess).unwrap();
        let b = contrastive_loss(&scaled, &scaled, 0.2, &SingleProcess).unwrap();
        let a = a.to_scalar::<f32>().unwrap();
        let b = b.to_scalar::<f32>().unwrap();
        assert!((a - b).abs() < 1e-5);
        // keep dtype assertions honest
        assert_eq!(q.dtype(), DType::F32);
    }
}
