//! # meridian-transport
//!
//! Real-time RTP/RTCP transport core.
//!
//! Everything in this crate is thread-agnostic logic: components take an
//! explicit `now: quanta::Instant` instead of reading a clock, so they can be
//! driven from a worker thread in production or from a mock clock in tests.
//! The processing graph, worker threads and scheduling live in
//! `meridian-pipeline`.
//!
//! ## Crate structure
//!
//! - [`seq`]: 16-bit modular sequence arithmetic and index extension
//! - [`packet`]: `PacketInfo` buffers, buffer pool, processing timeline
//! - [`rtp`]: RTP header view, in-place rewriting, header extensions
//! - [`rtcp`]: RTCP feedback codecs (NACK, PLI, FIR, REMB, transport-cc)
//! - [`cache`]: Fixed-capacity wraparound-aware packet cache
//! - [`rewriter`]: Gap-hiding sequence number rewriter
//! - [`streams`]: Payload type, extension and SSRC association tables
//! - [`events`]: Control events that update the stream tables
//! - [`nack`]: Receive-side retransmission requester
//! - [`rtx`]: RTX encode/decode (RFC 4588)
//! - [`keyframe`]: Rate-limited PLI/FIR keyframe requests
//! - [`probing`]: Bandwidth probing via RTX replay and padding
//! - [`tcc`]: Transport-wide feedback generator and consumer
//! - [`bwe`]: Bandwidth estimator contract and default implementation
//! - [`remb`]: Abs-send-time driven remote estimate (REMB path)
//! - [`stats`]: Stat blocks, windowed rates, EWMA

pub mod bwe;
pub mod cache;
pub mod error;
pub mod events;
pub mod keyframe;
pub mod nack;
pub mod packet;
pub mod probing;
pub mod remb;
pub mod rewriter;
pub mod rtcp;
pub mod rtp;
pub mod rtx;
pub mod seq;
pub mod stats;
pub mod streams;
pub mod tcc;

pub use error::{Error, Result};
