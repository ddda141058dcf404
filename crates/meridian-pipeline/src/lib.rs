//! # meridian-pipeline
//!
//! Packet-processing graph and runtime for the meridian transport.
//!
//! ## Crate structure
//!
//! - [`stage`]: stage kinds (observer, filter, transformer, modifier, sink,
//!   demultiplexer) and closure helpers
//! - [`graph`]: graph builder, validation, per-stage statistics
//! - [`runner`]: one worker thread per pipeline behind a bounded queue
//! - [`scheduler`]: periodic and one-shot task scheduling
//! - [`events`]: control event bus
//! - [`config`]: TOML configuration with defaults and validation
//! - [`stages`]: stages wrapping `meridian-transport` components
//! - [`transceiver`]: send and receive pipelines assembled into one unit

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod runner;
pub mod scheduler;
pub mod stage;
pub mod stages;
pub mod transceiver;

pub use config::{Features, TransportConfig};
pub use error::{PacketSendError, PipelineError};
pub use events::EventBus;
pub use graph::{GraphStats, PipelineBuilder, PipelineGraph};
pub use runner::{PipelineHandle, PipelineRunner, RunnerConfig};
pub use scheduler::TaskScheduler;
pub use transceiver::{Transceiver, TransceiverIo, TransceiverStats};
