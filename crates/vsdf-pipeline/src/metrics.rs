//! Atomic run counters and the per-run report.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use vsdf_core::error::{EngineError, Result};

/// Atomic per-stage frame counters and latency tracking.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Frames handed to the renderer.
    pub frames_submitted: AtomicU64,
    /// Frames accepted by the encoder.
    pub frames_encoded: AtomicU64,
    /// Frames queued but dropped after a fault.
    pub frames_discarded: AtomicU64,
    /// Slots currently between `push` and `Free`.
    pub in_flight: AtomicU64,
    /// Highest value `in_flight` reached during the run.
    pub peak_in_flight: AtomicU64,
    /// Cumulative `submit_render` wall-clock time in microseconds.
    pub submit_total_us: AtomicU64,
    /// Cumulative producer time spent waiting for a free slot.
    pub slot_wait_us: AtomicU64,
    /// Cumulative worker time spent waiting on completion signals.
    pub gpu_wait_us: AtomicU64,
    /// Cumulative readback normalization time.
    pub readback_total_us: AtomicU64,
    /// Cumulative `submit_frame` time.
    pub encode_total_us: AtomicU64,
}

pub(crate) fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros().min(u128::from(u64::MAX)) as u64
}

impl PipelineMetrics {
    /// Allocate a fresh [`PipelineMetrics`] with all counters zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn slot_queued(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn slot_freed(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Counter invariant, expected to hold after shutdown.
    pub fn validate(&self) -> bool {
        let submitted = self.frames_submitted.load(Ordering::Acquire);
        let encoded = self.frames_encoded.load(Ordering::Acquire);
        let discarded = self.frames_discarded.load(Ordering::Acquire);
        submitted >= encoded + discarded
    }

    pub(crate) fn enforce(&self) -> Result<()> {
        if self.validate() {
            return Ok(());
        }
        Err(EngineError::InvariantViolation(format!(
            "Pipeline counter violation: submitted={} encoded={} discarded={}",
            self.frames_submitted.load(Ordering::Acquire),
            self.frames_encoded.load(Ordering::Acquire),
            self.frames_discarded.load(Ordering::Acquire),
        )))
    }

    /// Log per-stage averages.
    pub fn report(&self) {
        let submitted = self.frames_submitted.load(Ordering::Relaxed);
        let encoded = self.frames_encoded.load(Ordering::Relaxed);

        let avg = |total: &AtomicU64, count: u64| -> u64 {
            if count > 0 {
                total.load(Ordering::Relaxed) / count
            } else {
                0
            }
        };

        info!(
            submit_avg_us = avg(&self.submit_total_us, submitted),
            slot_wait_avg_us = avg(&self.slot_wait_us, submitted),
            gpu_wait_avg_us = avg(&self.gpu_wait_us, encoded),
            readback_avg_us = avg(&self.readback_total_us, encoded),
            encode_avg_us = avg(&self.encode_total_us, encoded),
            peak_in_flight = self.peak_in_flight.load(Ordering::Relaxed),
            "Stage latencies"
        );
    }

    /// Snapshot for a finished run.
    pub fn snapshot(&self, ring_size: usize, elapsed: Duration) -> RunReport {
        let load = |counter: &AtomicU64| counter.load(Ordering::Acquire);
        RunReport {
            ring_size,
            frames_submitted: load(&self.frames_submitted),
            frames_encoded: load(&self.frames_encoded),
            frames_discarded: load(&self.frames_discarded),
            peak_in_flight: load(&self.peak_in_flight),
            elapsed_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
            submit_total_us: load(&self.submit_total_us),
            slot_wait_us: load(&self.slot_wait_us),
            gpu_wait_us: load(&self.gpu_wait_us),
            readback_total_us: load(&self.readback_total_us),
            encode_total_us: load(&self.encode_total_us),
        }
    }
}

/// Summary of a successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub ring_size: usize,
    pub frames_submitted: u64,
    pub frames_encoded: u64,
    pub frames_discarded: u64,
    pub peak_in_flight: u64,
    pub elapsed_ms: u64,
    pub submit_total_us: u64,
    pub slot_wait_us: u64,
    pub gpu_wait_us: u64,
    pub readback_total_us: u64,
    pub encode_total_us: u64,
}

impl RunReport {
    /// Encoded frames per second of wall time.
    pub fn throughput_fps(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.frames_encoded as f64 * 1000.0 / self.elapsed_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineMetrics;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let metrics = PipelineMetrics::new();
        metrics.slot_queued();
        metrics.slot_queued();
        metrics.slot_freed();
        metrics.slot_queued();
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.peak_in_flight.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn counters_must_account_for_every_submission() {
        let metrics = PipelineMetrics::new();
        metrics.frames_submitted.store(3, Ordering::Relaxed);
        metrics.frames_encoded.store(2, Ordering::Relaxed);
        metrics.frames_discarded.store(1, Ordering::Relaxed);
        assert!(metrics.enforce().is_ok());

        metrics.frames_encoded.store(3, Ordering::Relaxed);
        let err = metrics.enforce().expect_err("over-counted");
        assert_eq!(err.error_code(), 700);
    }

    #[test]
    fn report_serializes_to_json() {
        let metrics = PipelineMetrics::new();
        metrics.frames_submitted.store(4, Ordering::Relaxed);
        metrics.frames_encoded.store(4, Ordering::Relaxed);
        let report = metrics.snapshot(2, Duration::from_millis(200));
        assert!((report.throughput_fps() - 20.0).abs() < f64::EPSILON);

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["frames_encoded"], 4);
        assert_eq!(json["ring_size"], 2);
    }
}
