//! # Retransmission Requester
//!
//! Receive-side NACK generation. Tracks the highest sequence number seen per
//! SSRC, records gaps as missing, and produces NACKs for them on each poll.
//!
//! ## Key design decisions
//!
//! - **Debounce**: a gap is first requested only after `debounce`, giving
//!   reordered packets a chance to arrive.
//! - **Retry budget**: each missing packet is re-requested every
//!   `retry_interval`, at most `max_retries` times, then given up.
//! - **Cancellation**: observing a missing packet removes it immediately.
//! - **Bounded tracking**: a gap larger than `max_missing` keeps only the
//!   newest `max_missing` entries (older ones would be too late anyway).
//! - Sequence numbers are extended to 64-bit indexes per stream, so the
//!   missing set is naturally ordered across wraparound.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace};

use crate::rtcp::NackPacket;
use crate::seq::SequenceIndexTracker;

#[derive(Debug, Clone)]
pub struct NackConfig {
    /// Wait before the first request for a newly detected gap.
    pub debounce: Duration,
    /// Minimum time between two requests for the same packet.
    pub retry_interval: Duration,
    /// Requests per packet before giving up.
    pub max_retries: u8,
    /// Maximum missing packets tracked per stream.
    pub max_missing: usize,
}

impl Default for NackConfig {
    fn default() -> Self {
        NackConfig {
            debounce: Duration::from_millis(10),
            retry_interval: Duration::from_millis(100),
            max_retries: 10,
            max_missing: 500,
        }
    }
}

/// Per-packet request state.
#[derive(Debug, Clone)]
struct NackState {
    detected_at: Instant,
    last_request_time: Option<Instant>,
    retry_count: u8,
}

#[derive(Debug, Default)]
struct StreamPacketRequester {
    tracker: SequenceIndexTracker,
    missing: BTreeMap<u64, NackState>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NackStats {
    pub nacks_sent: u64,
    pub packets_requested: u64,
    /// Missing packets that arrived after being detected.
    pub packets_recovered: u64,
    /// Missing packets dropped after exhausting retries.
    pub packets_given_up: u64,
    /// Missing packets dropped because the gap exceeded `max_missing`.
    pub packets_overflowed: u64,
    pub currently_missing: usize,
}

pub struct RetransmissionRequester {
    config: NackConfig,
    sender_ssrc: u32,
    streams: HashMap<u32, StreamPacketRequester>,
    stats: NackStats,
}

impl RetransmissionRequester {
    pub fn new(config: NackConfig, sender_ssrc: u32) -> Self {
        RetransmissionRequester {
            config,
            sender_ssrc,
            streams: HashMap::new(),
            stats: NackStats::default(),
        }
    }

    pub fn set_sender_ssrc(&mut self, ssrc: u32) {
        self.sender_ssrc = ssrc;
    }

    /// Record an RTP packet (after RTX decoding) of `ssrc`.
    pub fn packet_received(&mut self, ssrc: u32, seq: u16, now: Instant) {
        let max_missing = self.config.max_missing;
        let stream = self.streams.entry(ssrc).or_default();
        let previous_highest = stream.tracker.highest_index();
        let index = stream.tracker.update(seq);

        let Some(highest) = previous_highest else {
            return;
        };

        if index <= highest {
            if stream.missing.remove(&index).is_some() {
                self.stats.packets_recovered += 1;
                trace!(ssrc, seq, "missing packet arrived");
            }
            return;
        }

        let gap_start = highest + 1;
        if index == gap_start {
            return;
        }
        let mut first = gap_start;
        let gap = index - gap_start;
        if gap as usize > max_missing {
            self.stats.packets_overflowed += gap - max_missing as u64;
            first = index - max_missing as u64;
        }
        for missing in first..index {
            stream.missing.insert(
                missing,
                NackState {
                    detected_at: now,
                    last_request_time: None,
                    retry_count: 0,
                },
            );
        }
        while stream.missing.len() > max_missing {
            stream.missing.pop_first();
            self.stats.packets_overflowed += 1;
        }
        debug!(ssrc, seq, gap, "sequence gap detected");
    }

    /// Build NACKs for every packet due for a (re)request.
    pub fn poll(&mut self, now: Instant) -> Vec<NackPacket> {
        let mut out = Vec::new();
        for (&ssrc, stream) in self.streams.iter_mut() {
            let mut lost = Vec::new();
            let mut exhausted = Vec::new();
            for (&index, state) in stream.missing.iter_mut() {
                let due = match state.last_request_time {
                    None => {
                        now.saturating_duration_since(state.detected_at) >= self.config.debounce
                    }
                    Some(at) => now.saturating_duration_since(at) >= self.config.retry_interval,
                };
                if !due {
                    continue;
                }
                state.last_request_time = Some(now);
                state.retry_count += 1;
                lost.push(index as u16);
                if state.retry_count >= self.config.max_retries {
                    exhausted.push(index);
                }
            }
            for index in exhausted {
                stream.missing.remove(&index);
                self.stats.packets_given_up += 1;
            }
            if !lost.is_empty() {
                self.stats.nacks_sent += 1;
                self.stats.packets_requested += lost.len() as u64;
                out.push(NackPacket::new(self.sender_ssrc, ssrc, lost));
            }
        }
        out
    }

    /// Forget a stream entirely.
    pub fn remove_stream(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    pub fn missing_count(&self, ssrc: u32) -> usize {
        self.streams.get(&ssrc).map_or(0, |s| s.missing.len())
    }

    pub fn stats(&self) -> NackStats {
        NackStats {
            currently_missing: self.streams.values().map(|s| s.missing.len()).sum(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    fn requester() -> RetransmissionRequester {
        RetransmissionRequester::new(NackConfig::default(), 1)
    }

    #[test]
    fn gap_is_requested_after_debounce() {
        let (clock, mock) = Clock::mock();
        let mut r = requester();
        r.packet_received(10, 100, clock.now());
        r.packet_received(10, 103, clock.now());
        assert_eq!(r.missing_count(10), 2);
        assert!(r.poll(clock.now()).is_empty(), "still debouncing");

        mock.increment(Duration::from_millis(10));
        let nacks = r.poll(clock.now());
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].media_ssrc, 10);
        assert_eq!(nacks[0].sender_ssrc, 1);
        assert_eq!(nacks[0].lost, vec![101, 102]);
    }

    #[test]
    fn arrival_cancels_request() {
        let (clock, mock) = Clock::mock();
        let mut r = requester();
        r.packet_received(10, 1, clock.now());
        r.packet_received(10, 4, clock.now());
        r.packet_received(10, 2, clock.now());
        mock.increment(Duration::from_millis(20));
        let nacks = r.poll(clock.now());
        assert_eq!(nacks[0].lost, vec![3]);
        r.packet_received(10, 3, clock.now());
        assert_eq!(r.missing_count(10), 0);
        assert_eq!(r.stats().packets_recovered, 2);
    }

    #[test]
    fn retries_are_paced_and_bounded() {
        let (clock, mock) = Clock::mock();
        let mut r = RetransmissionRequester::new(
            NackConfig {
                max_retries: 3,
                ..Default::default()
            },
            1,
        );
        r.packet_received(5, 0, clock.now());
        r.packet_received(5, 2, clock.now());
        mock.increment(Duration::from_millis(10));
        assert_eq!(r.poll(clock.now()).len(), 1);

        mock.increment(Duration::from_millis(50));
        assert!(r.poll(clock.now()).is_empty(), "within retry interval");

        for _ in 0..2 {
            mock.increment(Duration::from_millis(100));
            assert_eq!(r.poll(clock.now()).len(), 1);
        }
        mock.increment(Duration::from_millis(100));
        assert!(r.poll(clock.now()).is_empty(), "retry budget exhausted");
        let stats = r.stats();
        assert_eq!(stats.packets_requested, 3);
        assert_eq!(stats.packets_given_up, 1);
    }

    #[test]
    fn gap_across_wraparound() {
        let (clock, mock) = Clock::mock();
        let mut r = requester();
        r.packet_received(7, 65534, clock.now());
        r.packet_received(7, 1, clock.now());
        mock.increment(Duration::from_millis(10));
        let nacks = r.poll(clock.now());
        assert_eq!(nacks[0].lost, vec![65535, 0]);
    }

    #[test]
    fn huge_gap_is_bounded() {
        let (clock, _mock) = Clock::mock();
        let mut r = RetransmissionRequester::new(
            NackConfig {
                max_missing: 8,
                ..Default::default()
            },
            1,
        );
        r.packet_received(1, 0, clock.now());
        r.packet_received(1, 1000, clock.now());
        assert_eq!(r.missing_count(1), 8);
        assert_eq!(r.stats().packets_overflowed, 999 - 8);
    }

    #[test]
    fn streams_are_independent() {
        let (clock, mock) = Clock::mock();
        let mut r = requester();
        r.packet_received(1, 10, clock.now());
        r.packet_received(2, 500, clock.now());
        r.packet_received(1, 12, clock.now());
        r.packet_received(2, 501, clock.now());
        mock.increment(Duration::from_millis(10));
        let nacks = r.poll(clock.now());
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].media_ssrc, 1);
    }
}
