#![doc = include_str!("../README.md")]

pub mod config;
pub mod latch;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod readback;
pub mod session;
pub mod slot;
mod worker;

pub use config::{DEFAULT_RING_SIZE, MAX_RING_SLOTS, PipelineConfig};
pub use latch::{FaultLatch, PipelineStatus};
pub use metrics::{PipelineMetrics, RunReport};
pub use pipeline::{ProducerPhase, RingPipeline};
pub use queue::EncodeRequest;
pub use session::EncodeSession;
pub use slot::{FrameSlot, SlotPool};
pub use worker::WorkerPhase;
