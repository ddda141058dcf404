use std::sync::Arc;

use quanta::Instant;

use meridian_transport::cache::RtpPacketCache;
use meridian_transport::packet::PacketInfo;
use meridian_transport::stats::StatBlock;

use crate::stage::{Observer, StageBehavior};

/// Stores a private copy of every outgoing RTP packet for retransmission
/// and probing.
pub struct CacheStage {
    cache: Arc<RtpPacketCache>,
}

impl CacheStage {
    pub fn new(cache: Arc<RtpPacketCache>) -> Self {
        CacheStage { cache }
    }
}

impl StageBehavior for CacheStage {
    fn name(&self) -> &str {
        "packet-cache"
    }

    fn stats(&self) -> StatBlock {
        let s = self.cache.stats();
        StatBlock::new()
            .with("inserts", s.inserts)
            .with("old_inserts", s.old_inserts)
            .with("hits", s.hits)
            .with("misses", s.misses)
            .with("evictions", s.evictions)
            .with("hit_rate", s.hit_rate())
    }
}

impl Observer for CacheStage {
    fn observe(&mut self, packet: &PacketInfo, now: Instant) {
        self.cache.insert(packet, now);
    }
}
