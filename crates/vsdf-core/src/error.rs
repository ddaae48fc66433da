//! Typed error hierarchy for the offline pipeline.
//!
//! Uses `thiserror` for library-grade errors.  Every payload is owned data
//! (strings and small copies) so that the fault latch can hand the same cause
//! to both the producer and the encode worker.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`].
//! The CLI exits with the code's hundreds digit, the error category.

use crate::types::PixelLayout;

/// All errors originating from the vsdf engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    // ── Setup ────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Encoder failed to open: {0}")]
    EncoderOpen(String),

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Pipeline faulted: {0}")]
    Faulted(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ── Teardown ─────────────────────────────────────────────────────
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    // ── Type contracts ───────────────────────────────────────────────
    #[error("Pixel format mismatch: expected {expected:?}, got {actual:?}")]
    FormatMismatch {
        expected: PixelLayout,
        actual: PixelLayout,
    },

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Panic recovered in {stage}: {message}")]
    PanicRecovered {
        stage: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration
    /// - 2xx: encoder setup
    /// - 3xx: encoder runtime / fault latch
    /// - 4xx: teardown
    /// - 5xx: renderer and filesystem
    /// - 6xx: type contracts
    /// - 7xx: invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Configuration(_) => 100,
            Self::EncoderOpen(_) => 200,
            Self::Encode(_) => 300,
            Self::Faulted(_) => 301,
            Self::Shutdown(_) => 400,
            Self::Render(_) => 500,
            Self::Io(_) => 501,
            Self::FormatMismatch { .. } => 600,
            Self::BufferTooSmall { .. } => 601,
            Self::InvariantViolation(_) => 700,
            Self::PanicRecovered { .. } => 701,
        }
    }

    /// Wrap an [`std::io::Error`] with a short description of the operation.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
