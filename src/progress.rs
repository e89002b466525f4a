//! Periodic progress reporting around a batch iterator.
//!
//! [`ProgressIter`] wraps the epoch's batch stream and times two things per
//! iteration: how long the next batch took to arrive (`data`) and how long
//! the whole iteration took including the caller's step (`time`). Every
//! `print_freq`-th iteration, and always on the last one, it emits a line
//! with the iteration index, an ETA extrapolated from the all-time mean
//! iteration time, the caller's rendered meters, both timing meters and
//! optionally the peak device memory. Exhaustion emits a total-time summary.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::memory::MemoryTracker;
use crate::meters::{MeterFormat, MetricLogger, SmoothedValue};

/// Destination for human-readable progress lines.
///
/// The engine never prints; it hands complete lines to the sink so embedders
/// decide where they go.
pub trait ProgressSink: Send + Sync {
    /// Emit one progress line.
    fn info(&self, message: &str);
}

/// [`ProgressSink`] that forwards to `tracing::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

/// Render whole seconds as `H:MM:SS`.
pub fn format_hms(seconds: f64) -> String {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Iterator adapter that times iterations and logs progress.
///
/// The meter registry is shared: the loop body updates it through the same
/// `Arc` while the adapter reads it for rendering.
pub struct ProgressIter<'a, I> {
    inner: I,
    total: usize,
    print_freq: usize,
    header: String,
    meters: Arc<Mutex<MetricLogger>>,
    sink: &'a dyn ProgressSink,
    memory: Option<&'a MemoryTracker>,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
    yielded: usize,
    started: Instant,
    end: Instant,
}

impl<'a, I> ProgressIter<'a, I>
where
    I: ExactSizeIterator,
{
    /// Wrap `inner`, logging every `print_freq` iterations to `sink`.
    pub fn new(
        inner: I,
        print_freq: usize,
        header: impl Into<String>,
        meters: Arc<Mutex<MetricLogger>>,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        let now = Instant::now();
        Self {
            total: inner.len(),
            inner,
            print_freq: print_freq.max(1),
            header: header.into(),
            meters,
            sink,
            memory: None,
            iter_time: SmoothedValue::new(crate::meters::DEFAULT_WINDOW, MeterFormat::Avg),
            data_time: SmoothedValue::new(crate::meters::DEFAULT_WINDOW, MeterFormat::Avg),
            yielded: 0,
            started: now,
            end: now,
        }
    }

    /// Append a peak-memory column to every progress line.
    pub fn with_memory(mut self, tracker: &'a MemoryTracker) -> Self {
        self.memory = Some(tracker);
        self
    }

    fn log_progress(&self, i: usize) {
        let remaining = self.total.saturating_sub(i) as f64;
        let eta = self.iter_time.global_avg().unwrap_or(0.0) * remaining;
        let width = self.total.to_string().len();

        let mut parts = Vec::with_capacity(7);
        if !self.header.is_empty() {
            parts.push(self.header.clone());
        }
        parts.push(format!("[{i:>width$}/{}]", self.total));
        parts.push(format!("eta: {}", format_hms(eta)));
        let rendered = self.meters.lock().render();
        if !rendered.is_empty() {
            parts.push(rendered);
        }
        parts.push(format!("time: {}", self.iter_time));
        parts.push(format!("data: {}", self.data_time));
        if let Some(tracker) = self.memory {
            parts.push(format!("max mem: {:.0}", tracker.peak_megabytes()));
        }
        self.sink.info(&parts.join("  "));
    }

    fn log_summary(&self) {
        let total_time = self.started.elapsed().as_secs_f64();
        let per_iter = total_time / self.total.max(1) as f64;
        let prefix = if self.header.is_empty() {
            String::new()
        } else {
            format!("{} ", self.header)
        };
        self.sink.info(&format!(
            "{prefix}Total time: {} ({per_iter:.4} s / it)",
            format_hms(total_time)
        ));
    }
}

impl<I> Iterator for ProgressIter<'_, I>
where
    I: ExactSizeIterator,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded > 0 {
            // The caller's step for item `yielded - 1` just finished.
            self.iter_time.update(self.end.elapsed().as_secs_f64(), 1.0);
            let i = self.yielded - 1;
            if i % self.print_freq == 0 || i + 1 == self.total {
                self.log_progress(i);
            }
            self.end = Instant::now();
        }
        let fetch_start = self.end;
        match self.inner.next() {
            Some(item) => {
                self.data_time
                    .update(fetch_start.elapsed().as_secs_f64(), 1.0);
                self.yielded += 1;
                Some(item)
            }
            None => {
                self.log_summary();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
