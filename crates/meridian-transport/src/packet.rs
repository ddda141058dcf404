//! # Packet Buffers
//!
//! [`PacketInfo`] is the unit that flows through a pipeline: a mutable byte
//! buffer plus the metadata stages attach along the way. It is exclusively
//! owned from ingress until it reaches a terminal sink or is discarded, at
//! which point its buffer goes back to the [`BufferPool`] it came from.
//!
//! ## Key design decisions
//!
//! - `Clone` copies the bytes into a fresh buffer and drops the discard
//!   callback, so fan-out (cache insertion, retransmission) never aliases a
//!   mutable buffer and only the original owner observes the discard.
//! - The pool is a plain mutex-protected free list. Critical sections are a
//!   single `push`/`pop`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use quanta::Instant;
use serde::Serialize;

/// Default buffer size: one MTU plus room for SRTP auth tags and RTX prefix.
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

// ─── Buffer Pool ────────────────────────────────────────────────────────────

/// Buffer pool counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferPoolStats {
    /// Buffers handed out.
    pub requests: u64,
    /// Requests served by a fresh allocation.
    pub allocations: u64,
    /// Buffers returned to the pool.
    pub returns: u64,
    /// Buffers currently idle in the pool.
    pub idle: usize,
}

/// Recycling pool of `BytesMut` buffers.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
    requests: AtomicU64,
    allocations: AtomicU64,
    returns: AtomicU64,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_size,
            max_idle,
            requests: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            returns: AtomicU64::new(0),
        })
    }

    /// Take an empty buffer with at least `buffer_size` capacity.
    pub fn get(&self) -> BytesMut {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_size)
            }
        }
    }

    /// Return a buffer. Buffers beyond `max_idle` are simply dropped.
    pub fn put(&self, buf: BytesMut) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            requests: self.requests.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            idle: self.free.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

// ─── Timeline ───────────────────────────────────────────────────────────────

/// Ordered record of which stages a packet passed and when.
#[derive(Debug, Clone, Default)]
pub struct PacketTimeline {
    events: Vec<(String, Instant)>,
}

impl PacketTimeline {
    pub fn add(&mut self, stage: &str, at: Instant) {
        self.events.push((stage.to_string(), at));
    }

    pub fn events(&self) -> &[(String, Instant)] {
        &self.events
    }

    /// Time between the first and last recorded event.
    pub fn total(&self) -> Option<std::time::Duration> {
        let (_, first) = self.events.first()?;
        let (_, last) = self.events.last()?;
        Some(last.saturating_duration_since(*first))
    }
}

// ─── Codec Metadata ─────────────────────────────────────────────────────────

/// Annotations attached by codec parsers upstream of the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecMeta {
    pub keyframe: bool,
    /// Spatial/temporal quality index of the encoding, when layered.
    pub quality_index: Option<u8>,
}

// ─── PacketInfo ─────────────────────────────────────────────────────────────

type DiscardHook = Box<dyn FnOnce(&PacketInfo) + Send>;

/// A packet buffer plus processing metadata.
pub struct PacketInfo {
    /// Raw packet bytes (RTP or RTCP, encrypted or not depending on position).
    pub buffer: BytesMut,
    /// When the packet arrived from the network.
    pub received_time: Option<Instant>,
    /// When the packet left for the network.
    pub sent_time: Option<Instant>,
    /// Codec annotations.
    pub codec: CodecMeta,
    /// Set on packets produced by retransmission (RTX or plain resend).
    pub retransmission: bool,
    /// Set on packets produced purely for bandwidth probing.
    pub probing: bool,
    timeline: Option<PacketTimeline>,
    pool: Option<Arc<BufferPool>>,
    on_discard: Option<DiscardHook>,
}

impl PacketInfo {
    pub fn new(buffer: BytesMut) -> Self {
        PacketInfo {
            buffer,
            received_time: None,
            sent_time: None,
            codec: CodecMeta::default(),
            retransmission: false,
            probing: false,
            timeline: None,
            pool: None,
            on_discard: None,
        }
    }

    /// Wrap bytes copied into a buffer taken from `pool`.
    pub fn from_pool(pool: &Arc<BufferPool>, data: &[u8]) -> Self {
        let mut buffer = pool.get();
        buffer.extend_from_slice(data);
        let mut packet = PacketInfo::new(buffer);
        packet.pool = Some(Arc::clone(pool));
        packet
    }

    pub fn with_received_time(mut self, at: Instant) -> Self {
        self.received_time = Some(at);
        self
    }

    /// Register a callback run when the packet is discarded (not delivered).
    pub fn set_discard_hook(&mut self, hook: impl FnOnce(&PacketInfo) + Send + 'static) {
        self.on_discard = Some(Box::new(hook));
    }

    pub fn enable_timeline(&mut self) {
        if self.timeline.is_none() {
            self.timeline = Some(PacketTimeline::default());
        }
    }

    /// Record a timeline event if timelines are enabled for this packet.
    pub fn add_event(&mut self, stage: &str, at: Instant) {
        if let Some(timeline) = self.timeline.as_mut() {
            timeline.add(stage, at);
        }
    }

    pub fn timeline(&self) -> Option<&PacketTimeline> {
        self.timeline.as_ref()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop the packet without delivering it: run the discard hook and
    /// return the buffer to its pool.
    pub fn discard(mut self) {
        if let Some(hook) = self.on_discard.take() {
            hook(&self);
        }
        if let Some(pool) = self.pool.take() {
            let buf = std::mem::take(&mut self.buffer);
            pool.put(buf);
        }
    }

    /// Hand the bytes to a terminal consumer. The buffer leaves the pool.
    pub fn into_buffer(mut self) -> BytesMut {
        std::mem::take(&mut self.buffer)
    }

    /// Clone metadata around a different buffer, drawn from the same pool.
    pub fn with_buffer(&self, data: &[u8]) -> PacketInfo {
        let mut buffer = match &self.pool {
            Some(pool) => pool.get(),
            None => BytesMut::with_capacity(data.len()),
        };
        buffer.extend_from_slice(data);
        PacketInfo {
            buffer,
            received_time: self.received_time,
            sent_time: self.sent_time,
            codec: self.codec,
            retransmission: self.retransmission,
            probing: self.probing,
            timeline: self.timeline.clone(),
            pool: self.pool.clone(),
            on_discard: None,
        }
    }
}

impl Clone for PacketInfo {
    fn clone(&self) -> Self {
        self.with_buffer(&self.buffer)
    }
}

impl fmt::Debug for PacketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketInfo")
            .field("len", &self.buffer.len())
            .field("received_time", &self.received_time)
            .field("sent_time", &self.sent_time)
            .field("codec", &self.codec)
            .field("retransmission", &self.retransmission)
            .field("probing", &self.probing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn discard_returns_buffer_to_pool() {
        let pool = BufferPool::new(64, 4);
        let packet = PacketInfo::from_pool(&pool, &[1, 2, 3]);
        packet.discard();

        let stats = pool.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.idle, 1);

        let reused = pool.get();
        assert!(reused.is_empty(), "recycled buffers are cleared");
        assert_eq!(pool.stats().allocations, 1, "second request reuses");
    }

    #[test]
    fn discard_runs_hook_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut packet = PacketInfo::new(BytesMut::from(&b"abc"[..]));
        let flag = Arc::clone(&fired);
        packet.set_discard_hook(move |p| {
            assert_eq!(p.len(), 3);
            flag.store(true, Ordering::SeqCst);
        });
        packet.discard();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn clone_does_not_alias_or_inherit_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut original = PacketInfo::new(BytesMut::from(&b"abc"[..]));
        let flag = Arc::clone(&fired);
        original.set_discard_hook(move |_| flag.store(true, Ordering::SeqCst));

        let mut copy = original.clone();
        copy.buffer[0] = b'z';
        assert_eq!(&original.buffer[..], b"abc");

        copy.discard();
        assert!(!fired.load(Ordering::SeqCst), "clone must not fire the hook");
        original.discard();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn timeline_only_when_enabled() {
        let (clock, mock) = quanta::Clock::mock();
        let mut packet = PacketInfo::new(BytesMut::new());
        packet.add_event("ignored", clock.now());
        assert!(packet.timeline().is_none());

        packet.enable_timeline();
        packet.add_event("ingress", clock.now());
        mock.increment(std::time::Duration::from_micros(250));
        packet.add_event("egress", clock.now());
        let timeline = packet.timeline().unwrap();
        assert_eq!(timeline.events().len(), 2);
        assert_eq!(timeline.total(), Some(std::time::Duration::from_micros(250)));
    }
}
