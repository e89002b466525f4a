//! Streaming metric meters with bounded smoothing windows.
//!
//! [`SmoothedValue`] tracks a series of scalar observations two ways at once:
//! a bounded window of recent values for smoothed views (median, average,
//! max, last), and an all-time weighted total/count pair for the exact
//! global average. [`MetricLogger`] groups named meters in insertion order,
//! renders them on one line, and merges the global accumulators across
//! processes at epoch boundaries. Windows stay process-local; only the
//! `(count, total)` pair takes part in the reduction.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;

use crate::distributed::ProcessGroup;
use crate::error::{TrainerError, TrainerResult};

/// Default number of recent observations retained for smoothed views.
pub const DEFAULT_WINDOW: usize = 20;

/// Display template for a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    /// `median (global_avg)`, four decimal places. The default.
    MedianGlobalAvg,
    /// Windowed average only, four decimal places. Used for timing meters.
    Avg,
    /// Most recent value only, six decimal places. Used for learning rates.
    Value,
}

/// A scalar statistic smoothed over a bounded window.
///
/// `update` appends to the window and accumulates into the exact totals.
/// The windowed views (`median`, `avg`, `max`, `value`) reflect at most the
/// last `window` observations; `global_avg` reflects every observation ever
/// recorded, weighted.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    capacity: usize,
    total: f64,
    count: f64,
    format: MeterFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, MeterFormat::MedianGlobalAvg)
    }
}

impl SmoothedValue {
    /// Create a meter with the given window capacity and display template.
    ///
    /// A zero capacity is clamped to one so `value` always has a backing slot.
    pub fn new(capacity: usize, format: MeterFormat) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            total: 0.0,
            count: 0.0,
            format,
        }
    }

    /// Record `value` with multiplicity `weight`.
    ///
    /// The window holds the raw value once regardless of weight; the exact
    /// accumulators add `weight` to the count and `value * weight` to the
    /// total, so batch-weighted averages come out right.
    pub fn update(&mut self, value: f64, weight: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += weight;
        self.total += value * weight;
    }

    /// Number of observations currently in the window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// All-time weighted observation count.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// All-time weighted sum.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Median of the window. For an even window this is the lower middle
    /// element. Returns 0.0 for an empty window.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        sorted[(sorted.len() - 1) / 2]
    }

    /// Unweighted mean of the window. Returns 0.0 for an empty window.
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Largest value in the window. Returns 0.0 for an empty window.
    pub fn max(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Most recent value. Returns 0.0 for an empty window.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    /// Exact all-time weighted average, `total / count`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::EmptyMeter`] when nothing has been recorded,
    /// rather than dividing by zero.
    pub fn global_avg(&self) -> TrainerResult<f64> {
        if self.count == 0.0 {
            return Err(TrainerError::EmptyMeter("meter".to_string()));
        }
        Ok(self.total / self.count)
    }

    /// Merge the exact accumulators across all processes in `group`.
    ///
    /// Barriers first, then sum-reduces `(count, total)` in one collective.
    /// The window is deliberately left process-local: smoothed views keep
    /// describing this rank's recent behavior after the merge.
    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> TrainerResult<()> {
        if group.world_size() <= 1 {
            return Ok(());
        }
        group.barrier()?;
        let mut pair = [self.count, self.total];
        group.all_reduce_sum(&mut pair)?;
        self.count = pair[0];
        self.total = pair[1];
        Ok(())
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianGlobalAvg => {
                let global = if self.count == 0.0 { 0.0 } else { self.total / self.count };
                write!(f, "{:.4} ({:.4})", self.median(), global)
            }
            MeterFormat::Avg => write!(f, "{:.4}", self.avg()),
            MeterFormat::Value => write!(f, "{:.6}", self.value()),
        }
    }
}

/// Ordered registry of named [`SmoothedValue`] meters.
///
/// Meters are created implicitly on first `update` with default settings,
/// or explicitly via `add_meter` when a custom window or format is needed.
/// Rendering joins `name: meter` pairs with the configured delimiter in the
/// order meters were first seen.
#[derive(Debug)]
pub struct MetricLogger {
    meters: HashMap<String, SmoothedValue>,
    order: Vec<String>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    /// Create a registry that joins rendered meters with `delimiter`.
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: HashMap::new(),
            order: Vec::new(),
            delimiter: delimiter.into(),
        }
    }

    /// Register `meter` under `name`, replacing any existing meter.
    ///
    /// Keeps the original position when the name is already known.
    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        let name = name.into();
        if !self.meters.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.meters.insert(name, meter);
    }

    /// Record `value` with multiplicity `weight` under `name`, creating a
    /// default meter if the name is new.
    pub fn update(&mut self, name: &str, value: f64, weight: f64) {
        if !self.meters.contains_key(name) {
            self.order.push(name.to_string());
            self.meters.insert(name.to_string(), SmoothedValue::default());
        }
        if let Some(meter) = self.meters.get_mut(name) {
            meter.update(value, weight);
        }
    }

    /// Look up a meter by name.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::UnknownMetric`] for names never recorded.
    pub fn meter(&self, name: &str) -> TrainerResult<&SmoothedValue> {
        self.meters
            .get(name)
            .ok_or_else(|| TrainerError::UnknownMetric(name.to_string()))
    }

    /// Render all meters as `name: value` pairs joined by the delimiter,
    /// in insertion order.
    pub fn render(&self) -> String {
        self.order
            .iter()
            .filter_map(|name| self.meters.get(name).map(|m| format!("{name}: {m}")))
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Merge every meter's exact accumulators across `group`.
    ///
    /// All processes must hold the same meter names in the same insertion
    /// order so the per-meter collectives line up.
    pub fn synchronize(&mut self, group: &dyn ProcessGroup) -> TrainerResult<()> {
        for name in &self.order {
            if let Some(meter) = self.meters.get_mut(name) {
                meter.synchronize(group)?;
            }
        }
        Ok(())
    }

    /// Snapshot every meter's global average, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::EmptyMeter`] naming the first meter that has
    /// no samples.
    pub fn global_averages(&self) -> TrainerResult<HashMap<String, f64>> {
        let mut out = HashMap::with_capacity(self.meters.len());
        for name in &self.order {
            if let Some(meter) = self.meters.get(name) {
                let avg = meter
                    .global_avg()
                    .map_err(|_| TrainerError::EmptyMeter(name.clone()))?;
                out.insert(name.clone(), avg);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CallbackGroup;

    #[test]
    fn test_global_avg_is_weighted() {
        let mut meter = SmoothedValue::default();
        meter.update(2.0, 3.0);
        meter.update(5.0, 1.0);
        // (2*3 + 5*1) / (3 + 1)
        assert!((meter.global_avg().unwrap() - 2.75).abs() < 1e-12);
        assert_eq!(meter.count(), 4.0);
        assert_eq!(meter.total(), 11.0);
    }

    #[test]
    fn test_window_is_bounded_but_totals_are_not() {
        let mut meter = SmoothedValue::new(3, MeterFormat::MedianGlobalAvg);
        for i in 1..=10 {
            meter.update(f64::from(i), 1.0);
        }
        assert_eq!(meter.window_len(), 3);
        // window is [8, 9, 10]
        assert!((meter.avg() - 9.0).abs() < 1e-12);
        assert_eq!(meter.median(), 9.0);
        assert_eq!(meter.max(), 10.0);
        assert_eq!(meter.value(), 10.0);
        // totals cover all ten updates
        assert!((meter.global_avg().unwrap() - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_median_even_window_takes_lower_middle() {
        let mut meter = SmoothedValue::new(4, MeterFormat::MedianGlobalAvg);
        for v in [4.0, 1.0, 3.0, 2.0] {
            meter.update(v, 1.0);
        }
        assert_eq!(meter.median(), 2.0);
    }

    #[test]
    fn test_empty_meter_global_avg_errors() {
        let meter = SmoothedValue::default();
        assert!(matches!(
            meter.global_avg(),
            Err(TrainerError::EmptyMeter(_))
        ));
    }

    #[test]
    fn test_display_formats() {
        let mut lr = SmoothedValue::new(1, MeterFormat::Value);
        lr.update(0.000_5, 1.0);
        assert_eq!(lr.to_string(), "0.000500");

        let mut time = SmoothedValue::new(4, MeterFormat::Avg);
        time.update(0.25, 1.0);
        time.update(0.75, 1.0);
        assert_eq!(time.to_string(), "0.5000");

        let mut loss = SmoothedValue::default();
        loss.update(1.0, 1.0);
        loss.update(3.0, 1.0);
        assert_eq!(loss.to_string(), "1.0000 (2.0000)");
    }

    #[test]
    fn test_logger_renders_in_insertion_order() {
        let mut logger = MetricLogger::new("  ");
        logger.update("loss", 1.0, 1.0);
        logger.update("lr", 0.1, 1.0);
        logger.update("loss", 3.0, 1.0);
        let rendered = logger.render();
        let loss_pos = rendered.find("loss:").unwrap();
        let lr_pos = rendered.find("lr:").unwrap();
        assert!(loss_pos < lr_pos);
    }

    #[test]
    fn test_logger_unknown_metric() {
        let logger = MetricLogger::default();
        assert!(matches!(
            logger.meter("nope"),
            Err(TrainerError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_logger_custom_meter_keeps_format() {
        let mut logger = MetricLogger::default();
        logger.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value));
        logger.update("lr", 0.001, 1.0);
        logger.update("lr", 0.002, 1.0);
        // window of one: only the latest survives
        assert_eq!(logger.meter("lr").unwrap().value(), 0.002);
        assert_eq!(logger.meter("lr").unwrap().window_len(), 1);
    }

    #[test]
    fn test_synchronize_merges_totals_not_windows() {
        // Rank 0 saw 3 samples totalling 9.0, rank 1 saw 5 totalling 10.0.
        // The merge must produce count 8, total 19, global_avg 2.375 on both.
        let peer = [5.0, 10.0];
        let group = CallbackGroup::new(
            0,
            2,
            Box::new(|| Ok(())),
            Box::new(move |values: &mut [f64]| {
                values[0] += peer[0];
                values[1] += peer[1];
                Ok(())
            }),
            Box::new(|t: &candle_core::Tensor| Ok(t.clone())),
        );

        let mut meter = SmoothedValue::default();
        meter.update(3.0, 1.0);
        meter.update(3.0, 1.0);
        meter.update(3.0, 1.0);
        assert_eq!(meter.count(), 3.0);
        assert_eq!(meter.total(), 9.0);

        meter.synchronize(&group).unwrap();
        assert_eq!(meter.count(), 8.0);
        assert_eq!(meter.total(), 19.0);
        assert!((meter.global_avg().unwrap() - 2.375).abs() < 1e-12);
        // local window untouched
        assert_eq!(meter.window_len(), 3);
        assert_eq!(meter.avg(), 3.0);
    }

    #[test]
    fn test_synchronize_surfaces_backend_failure() {
        let group = CallbackGroup::new(
            0,
            2,
            Box::new(|| Ok(())),
            Box::new(|_: &mut [f64]| Err(TrainerError::distributed("reduce backend down"))),
            Box::new(|t: &candle_core::Tensor| Ok(t.clone())),
        );

        let mut logger = MetricLogger::default();
        logger.update("loss", 1.0, 1.0);
        assert!(matches!(
            logger.synchronize(&group),
            Err(TrainerError::Distributed(_))
        ));
        // the failed merge must not corrupt the local accumulators
        assert_eq!(logger.meter("loss").unwrap().count(), 1.0);
        assert_eq!(logger.meter("loss").unwrap().total(), 1.0);
    }
}
