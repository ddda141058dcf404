//! # Pipeline Graph
//!
//! Stages live in an arena and refer to each other by [`NodeId`]. Every node
//! has at most one parent; plain stages have at most one successor, a
//! demultiplexer one successor per path. This gives a tree rooted at the
//! ingress node, walkable forward (event delivery) and backward from any
//! node (statistics, teardown) without back-pointers.
//!
//! ## Key design decisions
//!
//! - **Processing** runs a packet to completion on the calling thread using
//!   an explicit work stack, so fan-out never recurses.
//! - **Counters** (in/out/discarded/processing time) are atomics in a
//!   [`NodeStats`] shared with [`GraphStats`]. Stage-specific blocks are
//!   *published* into a per-node mutex by the owning thread. A statistics
//!   visitor only ever reads these, so it can run concurrently with packet
//!   processing and never touches stage state.
//! - **Teardown** visits stages in reverse graph order, exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quanta::Clock;
use serde::Serialize;
use tracing::{debug, trace};

use meridian_transport::events::{Feature, TransportEvent};
use meridian_transport::packet::PacketInfo;
use meridian_transport::stats::StatBlock;

use crate::error::PipelineError;
use crate::stage::{Stage, StageOutput};

/// Index of a node in a pipeline arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// First and last node of a linear run of stages.
#[derive(Debug, Clone, Copy)]
pub struct Chain {
    pub first: NodeId,
    pub last: NodeId,
}

// ─── Node Stats ─────────────────────────────────────────────────────────────

/// Per-node counters shared between the processing thread and readers.
#[derive(Debug)]
pub struct NodeStats {
    name: String,
    kind: &'static str,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    discarded: AtomicU64,
    processing_ns: AtomicU64,
    published: Mutex<StatBlock>,
}

impl NodeStats {
    fn new(name: &str, kind: &'static str) -> Self {
        NodeStats {
            name: name.to_string(),
            kind,
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            processing_ns: AtomicU64::new(0),
            published: Mutex::new(StatBlock::new()),
        }
    }

    fn snapshot(&self) -> StageSnapshot {
        let packets_in = self.packets_in.load(Ordering::Relaxed);
        let processing_ns = self.processing_ns.load(Ordering::Relaxed);
        StageSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            packets_in,
            packets_out: self.packets_out.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            avg_processing_ns: if packets_in == 0 {
                0
            } else {
                processing_ns / packets_in
            },
            block: self
                .published
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Point-in-time view of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub kind: &'static str,
    pub packets_in: u64,
    pub packets_out: u64,
    pub discarded: u64,
    pub avg_processing_ns: u64,
    pub block: StatBlock,
}

#[derive(Debug)]
struct TopologyNode {
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Read-only statistics handle, cloneable across threads.
#[derive(Debug, Clone)]
pub struct GraphStats {
    name: Arc<str>,
    root: usize,
    topology: Arc<Vec<TopologyNode>>,
    nodes: Arc<Vec<Arc<NodeStats>>>,
}

impl GraphStats {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Visit every stage in graph order (depth first, paths in order).
    pub fn visit_forward(&self, mut f: impl FnMut(&StageSnapshot)) {
        let mut stack = vec![self.root];
        while let Some(i) = stack.pop() {
            f(&self.nodes[i].snapshot());
            stack.extend(self.topology[i].children.iter().rev());
        }
    }

    /// Visit from the stage named `from` back to the root.
    /// Returns false if no stage has that name.
    pub fn visit_reverse(&self, from: &str, mut f: impl FnMut(&StageSnapshot)) -> bool {
        let Some(mut i) = self.nodes.iter().position(|n| n.name == from) else {
            return false;
        };
        loop {
            f(&self.nodes[i].snapshot());
            match self.topology[i].parent {
                Some(parent) => i = parent,
                None => return true,
            }
        }
    }

    /// Snapshots of all stages in graph order.
    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.visit_forward(|s| out.push(s.clone()));
        out
    }

    pub fn stage(&self, name: &str) -> Option<StageSnapshot> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.snapshot())
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

struct Node {
    stage: Stage,
    next: Option<usize>,
    parent: Option<usize>,
    stats: Arc<NodeStats>,
}

pub struct PipelineBuilder {
    name: String,
    nodes: Vec<Node>,
    timeline: bool,
}

impl PipelineBuilder {
    pub fn new(name: &str) -> Self {
        PipelineBuilder {
            name: name.to_string(),
            nodes: Vec::new(),
            timeline: false,
        }
    }

    /// Record a per-packet timeline entry at every stage.
    pub fn with_timeline(mut self, enabled: bool) -> Self {
        self.timeline = enabled;
        self
    }

    /// Add an unconnected stage.
    pub fn add(&mut self, stage: Stage) -> NodeId {
        let stats = Arc::new(NodeStats::new(stage.name(), stage.kind()));
        self.nodes.push(Node {
            stage,
            next: None,
            parent: None,
            stats,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Make `to` the successor of `from`.
    pub fn connect(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.0].next = Some(to.0);
    }

    /// Add `stages` connected in order.
    pub fn chain(&mut self, stages: impl IntoIterator<Item = Stage>) -> Chain {
        let mut first = None;
        let mut last: Option<NodeId> = None;
        for stage in stages {
            let id = self.add(stage);
            if let Some(prev) = last {
                self.connect(prev, id);
            }
            first.get_or_insert(id);
            last = Some(id);
        }
        match (first, last) {
            (Some(first), Some(last)) => Chain { first, last },
            _ => {
                let id = self.add(Stage::observer(crate::stage::IngressStats::new("empty")));
                Chain { first: id, last: id }
            }
        }
    }

    /// Validate and freeze the graph with `root` as ingress.
    pub fn build(mut self, root: NodeId, clock: Clock) -> Result<PipelineGraph, PipelineError> {
        let count = self.nodes.len();
        if root.0 >= count {
            return Err(PipelineError::InvalidGraph("root out of range".into()));
        }
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, node) in self.nodes.iter().enumerate() {
            let targets: Vec<usize> = match &node.stage {
                Stage::Demux(d) => {
                    if node.next.is_some() {
                        return Err(PipelineError::InvalidGraph(format!(
                            "demux '{}' cannot have a plain successor",
                            d.name
                        )));
                    }
                    d.paths.iter().map(|p| p.target).collect()
                }
                Stage::Sink(s) if node.next.is_some() => {
                    return Err(PipelineError::InvalidGraph(format!(
                        "sink '{}' cannot have a successor",
                        s.name()
                    )));
                }
                _ => node.next.into_iter().collect(),
            };
            for t in targets {
                if t >= count {
                    return Err(PipelineError::InvalidGraph(format!("node {t} out of range")));
                }
                children[i].push(t);
            }
        }
        for (parent, kids) in children.iter().enumerate() {
            for &child in kids {
                if child == root.0 || self.nodes[child].parent.is_some() {
                    return Err(PipelineError::InvalidGraph(format!(
                        "stage '{}' has more than one parent",
                        self.nodes[child].stage.name()
                    )));
                }
                self.nodes[child].parent = Some(parent);
            }
        }

        // Graph order; also proves every node is reachable.
        let mut order = Vec::with_capacity(count);
        let mut stack = vec![root.0];
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(children[i].iter().rev());
        }
        if order.len() != count {
            return Err(PipelineError::InvalidGraph(
                "graph has stages unreachable from the root".into(),
            ));
        }

        let topology = self
            .nodes
            .iter()
            .zip(children)
            .map(|(n, children)| TopologyNode {
                parent: n.parent,
                children,
            })
            .collect();
        let stats = GraphStats {
            name: Arc::from(self.name.as_str()),
            root: root.0,
            topology: Arc::new(topology),
            nodes: Arc::new(self.nodes.iter().map(|n| Arc::clone(&n.stats)).collect()),
        };
        debug!(pipeline = %self.name, stages = count, "pipeline built");
        Ok(PipelineGraph {
            name: self.name,
            nodes: self.nodes,
            root: root.0,
            order,
            stats,
            clock,
            timeline: self.timeline,
            torn_down: false,
        })
    }
}

// ─── Graph ──────────────────────────────────────────────────────────────────

pub struct PipelineGraph {
    name: String,
    nodes: Vec<Node>,
    root: usize,
    order: Vec<usize>,
    stats: GraphStats,
    clock: Clock,
    timeline: bool,
    torn_down: bool,
}

impl PipelineGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats_handle(&self) -> GraphStats {
        self.stats.clone()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Run `packet` through the graph to completion.
    pub fn process(&mut self, mut packet: PacketInfo) {
        if self.torn_down {
            packet.discard();
            return;
        }
        if self.timeline {
            packet.enable_timeline();
        }
        let mut work = vec![(self.root, packet)];
        while let Some((i, packet)) = work.pop() {
            self.run_node(i, packet, &mut work);
        }
    }

    fn run_node(&mut self, i: usize, mut packet: PacketInfo, work: &mut Vec<(usize, PacketInfo)>) {
        let now = self.clock.now();
        let node = &mut self.nodes[i];
        let stats = Arc::clone(&node.stats);
        stats.packets_in.fetch_add(1, Ordering::Relaxed);
        if self.timeline {
            packet.add_event(node.stage.name(), now);
        }
        let next = node.next;

        let mut forwarded: u64 = 0;
        let mut discarded: u64 = 0;
        let mut forward =
            |p: PacketInfo, to: Option<usize>, work: &mut Vec<(usize, PacketInfo)>| match to {
                Some(to) => {
                    forwarded += 1;
                    work.push((to, p));
                }
                None => {
                    discarded += 1;
                    p.discard();
                }
            };

        match &mut node.stage {
            Stage::Observer(s) => {
                s.observe(&packet, now);
                forward(packet, next, work);
            }
            Stage::Filter(s) => {
                if s.accept(&packet, now) {
                    forward(packet, next, work);
                } else {
                    forward(packet, None, work);
                }
            }
            Stage::Transformer(s) => match s.transform(packet, now) {
                StageOutput::Forward(p) => forward(p, next, work),
                StageOutput::Discard(p) => forward(p, None, work),
            },
            Stage::MultiTransformer(s) => {
                let outputs = s.transform_many(packet, now);
                // Reverse so the first output is processed first.
                let start = work.len();
                for p in outputs {
                    forward(p, next, work);
                }
                work[start..].reverse();
            }
            Stage::Modifier(s) => {
                s.modify(&mut packet, now);
                forward(packet, next, work);
            }
            Stage::Demux(d) => {
                let matched = d.route(&packet);
                match matched.split_last() {
                    None => {
                        d.unmatched += 1;
                        trace!(demux = %d.name, "no path matched");
                        forward(packet, None, work);
                    }
                    Some((&last, rest)) => {
                        let start = work.len();
                        for &path in rest {
                            forward(packet.clone(), Some(d.paths[path].target), work);
                        }
                        forward(packet, Some(d.paths[last].target), work);
                        work[start..].reverse();
                    }
                }
            }
            Stage::Sink(s) => {
                s.consume(packet, now);
                forwarded += 1;
            }
        }

        stats.packets_out.fetch_add(forwarded, Ordering::Relaxed);
        stats.discarded.fetch_add(discarded, Ordering::Relaxed);
        let elapsed = self.clock.now().saturating_duration_since(now);
        stats
            .processing_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Deliver a control event to every stage in graph order. A
    /// [`Feature::PacketTimeline`] toggle also applies to packets processed
    /// from now on.
    pub fn handle_event(&mut self, event: &TransportEvent) {
        if let TransportEvent::FeatureToggled {
            feature: Feature::PacketTimeline,
            enabled,
        } = event
        {
            if self.timeline != *enabled {
                debug!(pipeline = %self.name, enabled, "packet timeline toggled");
            }
            self.timeline = *enabled;
        }
        for &i in &self.order {
            self.nodes[i].stage.handle_event(event);
        }
    }

    /// Copy every stage's stat block into its shared slot.
    pub fn publish_stats(&self) {
        for node in &self.nodes {
            let block = node.stage.stats();
            *node.stats.published.lock().unwrap_or_else(|e| e.into_inner()) = block;
        }
    }

    /// Release stage resources in reverse graph order. Idempotent; packets
    /// processed afterwards are discarded.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.publish_stats();
        for &i in self.order.iter().rev() {
            self.nodes[i].stage.teardown();
        }
        self.torn_down = true;
        debug!(pipeline = %self.name, "pipeline torn down");
    }
}
