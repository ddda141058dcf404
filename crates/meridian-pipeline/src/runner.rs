//! # Pipeline Runner
//!
//! One worker thread per direction. Producers enqueue packets and control
//! events into a bounded crossbeam channel; the worker runs each packet
//! through its [`PipelineGraph`] to completion, in queue order.
//!
//! ## Key design decisions
//!
//! - Events share the packet queue, so an event takes effect exactly between
//!   the packets enqueued before and after it.
//! - `try_send` never blocks. A full or closed queue rejects the packet,
//!   releases its buffer, and reports [`PacketSendError`].
//! - Stopping marks the runner closed first: the worker discards (rather
//!   than processes) everything still queued, then publishes final stats and
//!   tears the graph down on its own thread.
//! - Producers check the closed flag and enqueue under a shared gate that
//!   `stop` takes exclusively to set the flag. Every accepted packet is
//!   therefore queued ahead of the shutdown marker and released by the
//!   worker. The worker itself never takes the gate.
//! - Stage stats are published every `stats_interval`, whether or not
//!   traffic is flowing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};

use meridian_transport::events::TransportEvent;
use meridian_transport::packet::PacketInfo;

use crate::error::PacketSendError;
use crate::graph::{GraphStats, PipelineGraph};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub queue_capacity: usize,
    pub stats_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            queue_capacity: 1024,
            stats_interval: Duration::from_millis(500),
        }
    }
}

enum WorkItem {
    Packet(PacketInfo),
    Event(TransportEvent),
    Shutdown,
}

#[derive(Debug, Default)]
struct RunnerCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    rejected_full: AtomicU64,
    rejected_closed: AtomicU64,
    drained: AtomicU64,
    events: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub enqueued: u64,
    pub processed: u64,
    pub rejected_full: u64,
    pub rejected_closed: u64,
    /// Packets discarded unprocessed during shutdown.
    pub drained: u64,
    pub events: u64,
    pub queued: usize,
}

/// Cloneable producer side of a runner.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: Sender<WorkItem>,
    closed: Arc<AtomicBool>,
    /// Held shared while enqueueing, exclusively while closing.
    gate: Arc<RwLock<()>>,
    counters: Arc<RunnerCounters>,
}

impl PipelineHandle {
    /// Enqueue a packet without blocking.
    pub fn try_send(&self, packet: PacketInfo) -> Result<(), PacketSendError> {
        let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::Acquire) {
            self.counters.rejected_closed.fetch_add(1, Ordering::Relaxed);
            packet.discard();
            return Err(PacketSendError::Disconnected);
        }
        match self.tx.try_send(WorkItem::Packet(packet)) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(item)) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                discard_item(item);
                Err(PacketSendError::Full)
            }
            Err(TrySendError::Disconnected(item)) => {
                self.counters.rejected_closed.fetch_add(1, Ordering::Relaxed);
                discard_item(item);
                Err(PacketSendError::Disconnected)
            }
        }
    }

    /// Enqueue a control event. Blocks while the queue is full; events are
    /// never dropped while the runner is open.
    pub fn send_event(&self, event: TransportEvent) -> Result<(), PacketSendError> {
        let _gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(PacketSendError::Disconnected);
        }
        self.tx
            .send(WorkItem::Event(event))
            .map_err(|_| PacketSendError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

fn discard_item(item: WorkItem) {
    if let WorkItem::Packet(packet) = item {
        packet.discard();
    }
}

/// Owns the worker thread of one pipeline direction.
pub struct PipelineRunner {
    name: String,
    handle: PipelineHandle,
    stats: GraphStats,
    worker: Option<thread::JoinHandle<()>>,
}

impl PipelineRunner {
    pub fn spawn(graph: PipelineGraph, config: RunnerConfig) -> anyhow::Result<Self> {
        let name = graph.name().to_string();
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(RunnerCounters::default());
        let stats = graph.stats_handle();

        let worker_closed = Arc::clone(&closed);
        let worker_counters = Arc::clone(&counters);
        let interval = config.stats_interval;
        let worker = thread::Builder::new()
            .name(format!("meridian-{name}"))
            .spawn(move || run_worker(graph, rx, worker_closed, worker_counters, interval))
            .map_err(|e| anyhow::anyhow!("Failed to spawn {} worker: {}", name, e))?;
        info!(pipeline = %name, "pipeline worker started");

        Ok(PipelineRunner {
            name,
            handle: PipelineHandle {
                tx,
                closed,
                gate: Arc::default(),
                counters,
            },
            stats,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn try_send(&self, packet: PacketInfo) -> Result<(), PacketSendError> {
        self.handle.try_send(packet)
    }

    pub fn send_event(&self, event: TransportEvent) -> Result<(), PacketSendError> {
        self.handle.send_event(event)
    }

    pub fn graph_stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn stats(&self) -> RunnerStats {
        let c = &self.handle.counters;
        RunnerStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            rejected_full: c.rejected_full.load(Ordering::Relaxed),
            rejected_closed: c.rejected_closed.load(Ordering::Relaxed),
            drained: c.drained.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
            queued: self.handle.queued(),
        }
    }

    /// Close the queue, drain it, tear down the graph and join. Idempotent.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            // Waits out producers that are mid-enqueue.
            let _gate = self.handle.gate.write().unwrap_or_else(|e| e.into_inner());
            self.handle.closed.store(true, Ordering::Release);
        }
        // The worker drains on Shutdown; a disconnected channel means it
        // already exited.
        let _ = self.handle.tx.send(WorkItem::Shutdown);
        if worker.join().is_err() {
            warn!(pipeline = %self.name, "pipeline worker panicked");
        }
        info!(pipeline = %self.name, "pipeline worker stopped");
    }
}

impl Drop for PipelineRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut graph: PipelineGraph,
    rx: Receiver<WorkItem>,
    closed: Arc<AtomicBool>,
    counters: Arc<RunnerCounters>,
    stats_interval: Duration,
) {
    let clock = graph.clock().clone();
    let mut last_publish = clock.now();

    loop {
        let since_publish = clock.now().saturating_duration_since(last_publish);
        match rx.recv_timeout(stats_interval.saturating_sub(since_publish)) {
            Ok(WorkItem::Packet(packet)) => {
                if closed.load(Ordering::Acquire) {
                    counters.drained.fetch_add(1, Ordering::Relaxed);
                    packet.discard();
                } else {
                    graph.process(packet);
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(WorkItem::Event(event)) => {
                counters.events.fetch_add(1, Ordering::Relaxed);
                graph.handle_event(&event);
            }
            Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if clock.now().saturating_duration_since(last_publish) >= stats_interval {
            graph.publish_stats();
            last_publish = clock.now();
        }
    }

    // Anything still queued is released, not processed.
    let mut drained = 0u64;
    while let Ok(item) = rx.try_recv() {
        if matches!(item, WorkItem::Packet(_)) {
            drained += 1;
        }
        discard_item(item);
    }
    if drained > 0 {
        debug!(pipeline = %graph.name(), drained, "discarded queued packets on shutdown");
    }
    counters.drained.fetch_add(drained, Ordering::Relaxed);
    graph.teardown();
}
