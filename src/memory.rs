//! Accelerator memory bookkeeping for progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks current and peak device memory usage in bytes.
///
/// Candle does not expose allocator statistics, so the embedding application
/// records allocations and releases here and the progress reporter reads the
/// peak. All counters are atomic so recording works through a shared
/// reference from any thread.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryTracker {
    /// Create a tracker with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation of `bytes`.
    pub fn record_allocation(&self, bytes: u64) {
        let now = self.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Record a release of `bytes`. Saturates at zero.
    pub fn record_release(&self, bytes: u64) {
        let mut now = self.current.load(Ordering::Relaxed);
        loop {
            let next = now.saturating_sub(bytes);
            match self.current.compare_exchange_weak(
                now,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => now = observed,
            }
        }
    }

    /// Bytes currently in use.
    pub fn current_bytes(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// High-water mark in bytes since construction or the last `reset`.
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Peak usage in mebibytes, the unit used in progress lines.
    pub fn peak_megabytes(&self) -> f64 {
        self.peak_bytes() as f64 / (1024.0 * 1024.0)
    }

    /// Reset the peak to the current usage.
    pub fn reset_peak(&self) {
        self.peak
            .store(self.current.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}
