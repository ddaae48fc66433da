//! Run configuration for the ring pipeline.

use std::path::PathBuf;

use vsdf_core::error::{EngineError, Result};

/// Upper bound on the number of frame slots.
pub const MAX_RING_SLOTS: usize = 8;

/// Slots used when the caller does not choose a ring size.
pub const DEFAULT_RING_SIZE: usize = 2;

/// Configuration for one offline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of reusable frame slots, and the capacity of the work queue.
    ///
    /// `1` serializes render and encode; `2` or more lets them overlap.
    pub ring_size: usize,
    /// Frames to render, indices `0..total_frames`.
    pub total_frames: u64,
    /// When set, every frame is also written as `frame_NNNN.ppm` into this
    /// directory before it is encoded. The write happens synchronously on the
    /// encode worker and stalls the pipeline for its duration.
    pub debug_dump_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(total_frames: u64) -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            total_frames,
            debug_dump_dir: None,
        }
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn with_debug_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dump_dir = Some(dir.into());
        self
    }

    /// Check the ring size alone. Sessions started without a frame budget use this.
    pub fn validate_ring_size(&self) -> Result<()> {
        if self.ring_size == 0 || self.ring_size > MAX_RING_SLOTS {
            return Err(EngineError::Configuration(format!(
                "ring size must be in 1..={MAX_RING_SLOTS}, got {}",
                self.ring_size
            )));
        }
        Ok(())
    }

    /// Reject invalid values before any resource is allocated.
    pub fn validate(&self) -> Result<()> {
        self.validate_ring_size()?;
        if self.total_frames == 0 {
            return Err(EngineError::Configuration(
                "total frame count must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_RING_SIZE, MAX_RING_SLOTS, PipelineConfig};

    #[test]
    fn defaults_to_double_buffering() {
        let config = PipelineConfig::new(10);
        assert_eq!(config.ring_size, DEFAULT_RING_SIZE);
        assert!(config.debug_dump_dir.is_none());
        config.validate().expect("default config is valid");
    }

    #[test]
    fn ring_size_bounds() {
        assert!(PipelineConfig::new(1).with_ring_size(0).validate().is_err());
        assert!(PipelineConfig::new(1).with_ring_size(1).validate().is_ok());
        assert!(
            PipelineConfig::new(1)
                .with_ring_size(MAX_RING_SLOTS)
                .validate()
                .is_ok()
        );
        let err = PipelineConfig::new(1)
            .with_ring_size(MAX_RING_SLOTS + 1)
            .validate()
            .expect_err("too many slots");
        assert_eq!(err.error_code(), 100);
    }

    #[test]
    fn zero_frames_is_a_configuration_error() {
        let err = PipelineConfig::new(0).validate().expect_err("no frames");
        assert!(err.to_string().contains("frame count"));
    }
}
