//! # Stages
//!
//! A stage is one step of a pipeline. Stages are polymorphic over *what they
//! may do to a packet*, not over a class hierarchy: each capability is a
//! trait with one required method, and [`Stage`] is the tagged union the
//! graph dispatches on.
//!
//! | Capability         | May mutate | May drop | Fan-out |
//! |--------------------|------------|----------|---------|
//! | [`Observer`]       | no         | no       | 1       |
//! | [`Filter`]         | no         | yes      | 1       |
//! | [`Transformer`]    | yes        | yes      | 1       |
//! | [`MultiTransformer`] | yes      | yes      | N       |
//! | [`Modifier`]       | in place   | no       | 1       |
//! | [`PacketSink`]     | consumes   | n/a      | 0       |
//!
//! Branching only happens through a [`Demultiplexer`].

use quanta::Instant;

use meridian_transport::events::TransportEvent;
use meridian_transport::packet::PacketInfo;
use meridian_transport::stats::StatBlock;

/// Behavior shared by every stage.
pub trait StageBehavior: Send {
    fn name(&self) -> &str;

    /// Control events, delivered in graph order.
    fn handle_event(&mut self, _event: &TransportEvent) {}

    /// Stage-specific counters. Called by the worker thread only.
    fn stats(&self) -> StatBlock {
        StatBlock::new()
    }

    /// Release held resources. Called once, in reverse graph order.
    fn teardown(&mut self) {}
}

/// Side effects only; the packet passes through untouched.
pub trait Observer: StageBehavior {
    fn observe(&mut self, packet: &PacketInfo, now: Instant);
}

/// Accepts or rejects; rejected packets are discarded by the graph.
pub trait Filter: StageBehavior {
    fn accept(&mut self, packet: &PacketInfo, now: Instant) -> bool;
}

/// Result of a [`Transformer`].
#[derive(Debug)]
pub enum StageOutput {
    Forward(PacketInfo),
    Discard(PacketInfo),
}

/// 1:1, may replace the packet or drop it.
pub trait Transformer: StageBehavior {
    fn transform(&mut self, packet: PacketInfo, now: Instant) -> StageOutput;
}

/// 1:N. An empty result drops the packet; the transformer owns the discard.
pub trait MultiTransformer: StageBehavior {
    fn transform_many(&mut self, packet: PacketInfo, now: Instant) -> Vec<PacketInfo>;
}

/// 1:1 in-place modification.
pub trait Modifier: StageBehavior {
    fn modify(&mut self, packet: &mut PacketInfo, now: Instant);
}

/// Terminal handoff.
pub trait PacketSink: StageBehavior {
    fn consume(&mut self, packet: PacketInfo, now: Instant);
}

// ─── Demultiplexer ──────────────────────────────────────────────────────────

pub type Predicate = Box<dyn Fn(&PacketInfo) -> bool + Send>;

pub(crate) struct DemuxPath {
    pub(crate) name: String,
    pub(crate) predicate: Predicate,
    pub(crate) target: usize,
}

/// Routes packets to named paths by predicate.
///
/// Exclusive demultiplexers deliver each packet to the first matching path
/// only. Non-exclusive ones deliver a copy to every matching path. Packets
/// matching no path are discarded.
pub struct Demultiplexer {
    pub(crate) name: String,
    pub(crate) exclusive: bool,
    pub(crate) paths: Vec<DemuxPath>,
    pub(crate) unmatched: u64,
}

impl Demultiplexer {
    pub fn exclusive(name: &str) -> Self {
        Demultiplexer {
            name: name.to_string(),
            exclusive: true,
            paths: Vec::new(),
            unmatched: 0,
        }
    }

    pub fn broadcast(name: &str) -> Self {
        Demultiplexer {
            exclusive: false,
            ..Demultiplexer::exclusive(name)
        }
    }

    /// Add a path. `target` is the node the path leads to.
    pub fn path(
        mut self,
        name: &str,
        predicate: impl Fn(&PacketInfo) -> bool + Send + 'static,
        target: crate::graph::NodeId,
    ) -> Self {
        self.paths.push(DemuxPath {
            name: name.to_string(),
            predicate: Box::new(predicate),
            target: target.index(),
        });
        self
    }

    /// Indexes (into `paths`) of the paths `packet` goes to.
    pub(crate) fn route(&self, packet: &PacketInfo) -> Vec<usize> {
        let mut matched = Vec::with_capacity(1);
        for (i, path) in self.paths.iter().enumerate() {
            if (path.predicate)(packet) {
                matched.push(i);
                if self.exclusive {
                    break;
                }
            }
        }
        matched
    }

    pub fn path_names(&self) -> Vec<&str> {
        self.paths.iter().map(|p| p.name.as_str()).collect()
    }
}

// ─── Stage ──────────────────────────────────────────────────────────────────

pub enum Stage {
    Observer(Box<dyn Observer>),
    Filter(Box<dyn Filter>),
    Transformer(Box<dyn Transformer>),
    MultiTransformer(Box<dyn MultiTransformer>),
    Modifier(Box<dyn Modifier>),
    Demux(Demultiplexer),
    Sink(Box<dyn PacketSink>),
}

impl Stage {
    pub fn observer(s: impl Observer + 'static) -> Self {
        Stage::Observer(Box::new(s))
    }

    pub fn filter(s: impl Filter + 'static) -> Self {
        Stage::Filter(Box::new(s))
    }

    pub fn transformer(s: impl Transformer + 'static) -> Self {
        Stage::Transformer(Box::new(s))
    }

    pub fn multi_transformer(s: impl MultiTransformer + 'static) -> Self {
        Stage::MultiTransformer(Box::new(s))
    }

    pub fn modifier(s: impl Modifier + 'static) -> Self {
        Stage::Modifier(Box::new(s))
    }

    pub fn sink(s: impl PacketSink + 'static) -> Self {
        Stage::Sink(Box::new(s))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Observer(_) => "observer",
            Stage::Filter(_) => "filter",
            Stage::Transformer(_) => "transformer",
            Stage::MultiTransformer(_) => "multi-transformer",
            Stage::Modifier(_) => "modifier",
            Stage::Demux(_) => "demux",
            Stage::Sink(_) => "sink",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Stage::Observer(s) => s.name(),
            Stage::Filter(s) => s.name(),
            Stage::Transformer(s) => s.name(),
            Stage::MultiTransformer(s) => s.name(),
            Stage::Modifier(s) => s.name(),
            Stage::Demux(d) => &d.name,
            Stage::Sink(s) => s.name(),
        }
    }

    pub(crate) fn handle_event(&mut self, event: &TransportEvent) {
        match self {
            Stage::Observer(s) => s.handle_event(event),
            Stage::Filter(s) => s.handle_event(event),
            Stage::Transformer(s) => s.handle_event(event),
            Stage::MultiTransformer(s) => s.handle_event(event),
            Stage::Modifier(s) => s.handle_event(event),
            Stage::Demux(_) => {}
            Stage::Sink(s) => s.handle_event(event),
        }
    }

    pub(crate) fn stats(&self) -> StatBlock {
        match self {
            Stage::Observer(s) => s.stats(),
            Stage::Filter(s) => s.stats(),
            Stage::Transformer(s) => s.stats(),
            Stage::MultiTransformer(s) => s.stats(),
            Stage::Modifier(s) => s.stats(),
            Stage::Demux(d) => StatBlock::new()
                .with("paths", d.paths.len())
                .with("unmatched", d.unmatched),
            Stage::Sink(s) => s.stats(),
        }
    }

    pub(crate) fn teardown(&mut self) {
        match self {
            Stage::Observer(s) => s.teardown(),
            Stage::Filter(s) => s.teardown(),
            Stage::Transformer(s) => s.teardown(),
            Stage::MultiTransformer(s) => s.teardown(),
            Stage::Modifier(s) => s.teardown(),
            Stage::Demux(_) => {}
            Stage::Sink(s) => s.teardown(),
        }
    }
}

// ─── Closure Stages ─────────────────────────────────────────────────────────

/// A sink that hands packets to a closure.
pub struct FnSink<F> {
    name: String,
    consumed: u64,
    f: F,
}

impl<F: FnMut(PacketInfo) + Send> FnSink<F> {
    pub fn new(name: &str, f: F) -> Self {
        FnSink {
            name: name.to_string(),
            consumed: 0,
            f,
        }
    }
}

impl<F: FnMut(PacketInfo) + Send> StageBehavior for FnSink<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new().with("consumed", self.consumed)
    }
}

impl<F: FnMut(PacketInfo) + Send> PacketSink for FnSink<F> {
    fn consume(&mut self, packet: PacketInfo, _now: Instant) {
        self.consumed += 1;
        (self.f)(packet);
    }
}

/// Counts packets and bytes entering a pipeline.
#[derive(Debug, Default)]
pub struct IngressStats {
    name: String,
    packets: u64,
    bytes: u64,
}

impl IngressStats {
    pub fn new(name: &str) -> Self {
        IngressStats {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl StageBehavior for IngressStats {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> StatBlock {
        StatBlock::new()
            .with("packets", self.packets)
            .with("bytes", self.bytes)
    }
}

impl Observer for IngressStats {
    fn observe(&mut self, packet: &PacketInfo, _now: Instant) {
        self.packets += 1;
        self.bytes += packet.len() as u64;
    }
}
