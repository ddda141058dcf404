//! # Bandwidth Estimation
//!
//! [`BandwidthEstimator`] is the contract between congestion signaling and
//! whatever algorithm computes the available bandwidth. The transport-cc
//! consumer and the REMB path both feed it; neither depends on its math.
//!
//! [`DelayBasedEstimator`] is the default implementation:
//!
//! - **Acknowledged rate**: bytes received over a sliding window.
//! - **Delay trend**: packets are grouped into 5 ms send bursts; the change
//!   in one-way delay between groups is accumulated and smoothed. A smoothed
//!   queueing delay above the threshold is overuse, below its negative is
//!   underuse.
//! - **Control**: multiplicative increase while normal, capped at a headroom
//!   factor above the acknowledged rate; multiplicative decrease relative to
//!   the acknowledged rate on overuse; hold on underuse; loss above 10%
//!   backs off proportionally.
//!
//! Duplicate, late and incomplete reports are counted and otherwise ignored.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;
use tracing::debug;

use crate::stats::{Ewma, RateWindow};

// ─── Bandwidth ──────────────────────────────────────────────────────────────

/// A bitrate in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Bandwidth(u64);

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth(0);

    pub const fn from_bps(bps: u64) -> Self {
        Bandwidth(bps)
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Bandwidth(kbps * 1_000)
    }

    pub const fn bps(&self) -> u64 {
        self.0
    }

    pub fn kbps(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Bytes that can be sent in `interval` at this rate.
    pub fn bytes_in(&self, interval: Duration) -> u64 {
        (self.0 as f64 * interval.as_secs_f64() / 8.0) as u64
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            write!(f, "{:.2} Mbps", self.0 as f64 / 1e6)
        } else {
            write!(f, "{:.1} kbps", self.kbps())
        }
    }
}

/// ECN marking reported for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecn {
    NotEct,
    Ect0,
    Ect1,
    Ce,
}

// ─── Contract ───────────────────────────────────────────────────────────────

/// Pluggable bandwidth estimator.
///
/// Implementations must tolerate missing, out-of-order and duplicate
/// observations without corrupting their state.
pub trait BandwidthEstimator: Send {
    fn process_packet_arrival(
        &mut self,
        now: Instant,
        send_time: Option<Instant>,
        recv_time: Option<Instant>,
        seq: u16,
        size: usize,
        ecn: Option<Ecn>,
    );

    fn process_packet_loss(&mut self, now: Instant, send_time: Option<Instant>, seq: u16);

    /// Called after all packets of one feedback report were processed.
    fn feedback_complete(&mut self, _now: Instant) {}

    fn on_rtt_update(&mut self, now: Instant, rtt: Duration);

    /// Current estimate, clamped to the configured `[min, max]`.
    fn current_estimate(&mut self, now: Instant) -> Bandwidth;

    fn reset(&mut self);

    fn stats(&self) -> EstimatorStats;
}

// ─── Default Implementation ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub min: Bandwidth,
    pub max: Bandwidth,
    pub start: Bandwidth,
    /// Window for the acknowledged rate and loss fraction.
    pub rate_window: Duration,
    /// Estimate may grow to at most `headroom × acknowledged rate`.
    pub headroom: f64,
    /// Multiplicative increase per second while normal.
    pub increase_per_second: f64,
    /// Estimate after overuse, relative to the acknowledged rate. A
    /// decrease never raises the estimate.
    pub decrease_factor: f64,
    /// Smoothed queueing delay that counts as overuse.
    pub overuse_threshold: Duration,
    /// Minimum time between two decreases.
    pub decrease_hold: Duration,
    /// Packets sent within this interval form one delay group.
    pub burst_interval: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            min: Bandwidth::from_kbps(30),
            max: Bandwidth::from_kbps(20_000),
            start: Bandwidth::from_kbps(300),
            rate_window: Duration::from_secs(1),
            headroom: 1.05,
            increase_per_second: 0.08,
            decrease_factor: 0.95,
            overuse_threshold: Duration::from_millis(10),
            decrease_hold: Duration::from_millis(300),
            burst_interval: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Normal,
    Overusing,
    Underusing,
}

impl Usage {
    fn as_str(&self) -> &'static str {
        match self {
            Usage::Normal => "normal",
            Usage::Overusing => "overusing",
            Usage::Underusing => "underusing",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EstimatorStats {
    pub estimate_bps: u64,
    pub acked_bps: Option<u64>,
    pub usage: String,
    pub smoothed_delay_ms: f64,
    pub arrivals: u64,
    pub losses: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    /// Arrivals lacking a send or receive time.
    pub incomplete: u64,
    pub decreases: u64,
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct DelayGroup {
    first_send: Instant,
    last_send: Instant,
    last_recv: Instant,
}

const RECENT_SEQ_CAPACITY: usize = 1024;
const MIN_LOSS_SAMPLE: u64 = 20;
const HIGH_LOSS: f64 = 0.10;

pub struct DelayBasedEstimator {
    config: EstimatorConfig,
    estimate_bps: f64,
    usage: Usage,
    acked: RateWindow,
    current_group: Option<DelayGroup>,
    previous_group: Option<DelayGroup>,
    accumulated_delay_ms: f64,
    smoothed_delay: Ewma,
    last_update: Option<Instant>,
    last_decrease: Option<Instant>,
    loss_window_start: Option<Instant>,
    window_received: u64,
    window_lost: u64,
    recent_order: VecDeque<u16>,
    recent: HashSet<u16>,
    rtt: Option<Duration>,
    stats: EstimatorStats,
}

/// `a - b` in milliseconds, signed.
fn signed_ms(a: Instant, b: Instant) -> f64 {
    if a >= b {
        a.saturating_duration_since(b).as_secs_f64() * 1e3
    } else {
        -(b.saturating_duration_since(a).as_secs_f64() * 1e3)
    }
}

impl DelayBasedEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let estimate_bps = config.start.bps() as f64;
        let acked = RateWindow::new(config.rate_window);
        DelayBasedEstimator {
            config,
            estimate_bps,
            usage: Usage::Normal,
            acked,
            current_group: None,
            previous_group: None,
            accumulated_delay_ms: 0.0,
            smoothed_delay: Ewma::new(0.1),
            last_update: None,
            last_decrease: None,
            loss_window_start: None,
            window_received: 0,
            window_lost: 0,
            recent_order: VecDeque::with_capacity(RECENT_SEQ_CAPACITY),
            recent: HashSet::with_capacity(RECENT_SEQ_CAPACITY),
            rtt: None,
            stats: EstimatorStats::default(),
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn acked_bps(&self) -> Option<f64> {
        self.acked.rate_bps()
    }

    /// Returns false if `seq` was already seen.
    fn remember(&mut self, seq: u16) -> bool {
        if !self.recent.insert(seq) {
            return false;
        }
        self.recent_order.push_back(seq);
        if self.recent_order.len() > RECENT_SEQ_CAPACITY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent.remove(&old);
            }
        }
        true
    }

    fn roll_loss_window(&mut self, now: Instant) {
        match self.loss_window_start {
            Some(start) if now.saturating_duration_since(start) < self.config.rate_window => {}
            _ => {
                self.loss_window_start = Some(now);
                self.window_received = 0;
                self.window_lost = 0;
            }
        }
    }

    fn update_delay(&mut self, send: Instant, recv: Instant) {
        let Some(group) = self.current_group.as_mut() else {
            self.current_group = Some(DelayGroup {
                first_send: send,
                last_send: send,
                last_recv: recv,
            });
            return;
        };
        if send < group.first_send {
            self.stats.out_of_order += 1;
            return;
        }
        if send.saturating_duration_since(group.first_send) <= self.config.burst_interval {
            group.last_send = group.last_send.max(send);
            group.last_recv = group.last_recv.max(recv);
            return;
        }

        let finished = *group;
        if let Some(prev) = self.previous_group {
            let recv_delta = signed_ms(finished.last_recv, prev.last_recv);
            let send_delta = signed_ms(finished.last_send, prev.last_send);
            self.accumulated_delay_ms += recv_delta - send_delta;
            let smoothed = self.smoothed_delay.update(self.accumulated_delay_ms);
            let threshold = self.config.overuse_threshold.as_secs_f64() * 1e3;
            self.usage = if smoothed > threshold {
                Usage::Overusing
            } else if smoothed < -threshold {
                // Queue drained below the baseline; re-anchor.
                self.accumulated_delay_ms = 0.0;
                self.smoothed_delay.reset();
                Usage::Underusing
            } else {
                Usage::Normal
            };
        }
        self.previous_group = Some(finished);
        self.current_group = Some(DelayGroup {
            first_send: send,
            last_send: send,
            last_recv: recv,
        });
    }

    fn can_decrease(&self, now: Instant) -> bool {
        let hold = self.rtt.unwrap_or_default().max(self.config.decrease_hold);
        match self.last_decrease {
            Some(at) => now.saturating_duration_since(at) >= hold,
            None => true,
        }
    }

    fn update(&mut self, now: Instant) {
        let dt = match self.last_update {
            Some(at) => now.saturating_duration_since(at).min(Duration::from_secs(1)),
            None => Duration::ZERO,
        };
        self.last_update = Some(now);
        let acked = self.acked.rate_bps();

        match self.usage {
            Usage::Overusing => {
                if self.can_decrease(now) {
                    let target = acked.unwrap_or(self.estimate_bps) * self.config.decrease_factor;
                    self.estimate_bps = target.min(self.estimate_bps);
                    self.last_decrease = Some(now);
                    self.stats.decreases += 1;
                    debug!(estimate_bps = self.estimate_bps as u64, "delay overuse, decreasing");
                }
            }
            Usage::Underusing => {}
            Usage::Normal => {
                let grown = self.estimate_bps
                    * (1.0 + self.config.increase_per_second).powf(dt.as_secs_f64());
                match acked {
                    Some(acked) => {
                        let cap = acked * self.config.headroom;
                        if self.estimate_bps < cap {
                            self.estimate_bps = grown.min(cap);
                        }
                    }
                    None => self.estimate_bps = grown,
                }
            }
        }

        let sampled = self.window_received + self.window_lost;
        if sampled >= MIN_LOSS_SAMPLE {
            let loss = self.window_lost as f64 / sampled as f64;
            if loss > HIGH_LOSS && self.can_decrease(now) {
                self.estimate_bps *= 1.0 - 0.5 * loss;
                self.last_decrease = Some(now);
                self.stats.decreases += 1;
                debug!(loss, estimate_bps = self.estimate_bps as u64, "loss backoff");
            }
        }

        self.estimate_bps = self
            .estimate_bps
            .clamp(self.config.min.bps() as f64, self.config.max.bps() as f64);
    }
}

impl BandwidthEstimator for DelayBasedEstimator {
    fn process_packet_arrival(
        &mut self,
        now: Instant,
        send_time: Option<Instant>,
        recv_time: Option<Instant>,
        seq: u16,
        size: usize,
        _ecn: Option<Ecn>,
    ) {
        if !self.remember(seq) {
            self.stats.duplicates += 1;
            return;
        }
        self.roll_loss_window(now);
        self.window_received += 1;
        self.stats.arrivals += 1;

        let (Some(send), Some(recv)) = (send_time, recv_time) else {
            self.stats.incomplete += 1;
            return;
        };
        self.acked.record(recv, size as u64);
        self.update_delay(send, recv);
    }

    fn process_packet_loss(&mut self, now: Instant, _send_time: Option<Instant>, _seq: u16) {
        self.roll_loss_window(now);
        self.window_lost += 1;
        self.stats.losses += 1;
    }

    fn feedback_complete(&mut self, now: Instant) {
        self.update(now);
    }

    fn on_rtt_update(&mut self, _now: Instant, rtt: Duration) {
        self.rtt = Some(rtt);
    }

    fn current_estimate(&mut self, now: Instant) -> Bandwidth {
        self.update(now);
        Bandwidth::from_bps(self.estimate_bps as u64)
    }

    fn reset(&mut self) {
        let config = self.config.clone();
        *self = DelayBasedEstimator::new(config);
    }

    fn stats(&self) -> EstimatorStats {
        EstimatorStats {
            estimate_bps: self.estimate_bps as u64,
            acked_bps: self.acked.rate_bps().map(|b| b as u64),
            usage: self.usage.as_str().to_string(),
            smoothed_delay_ms: self.smoothed_delay.value(),
            rtt_ms: self.rtt.map(|r| r.as_secs_f64() * 1e3),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::{Clock, Mock};
    use std::sync::Arc;

    fn setup() -> (Clock, Arc<Mock>, DelayBasedEstimator) {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        (clock, mock, DelayBasedEstimator::new(EstimatorConfig::default()))
    }

    /// Feed `count` packets of `size` bytes sent every `send_gap` and
    /// arriving with an extra `queue_growth` of delay each.
    fn feed(
        clock: &Clock,
        mock: &Mock,
        bwe: &mut DelayBasedEstimator,
        first_seq: u16,
        count: u16,
        size: usize,
        send_gap: Duration,
        queue_growth: Duration,
    ) {
        let mut queue = Duration::ZERO;
        for i in 0..count {
            let send = clock.now();
            let recv = send + Duration::from_millis(20) + queue;
            let seq = first_seq.wrapping_add(i);
            bwe.process_packet_arrival(recv, Some(send), Some(recv), seq, size, None);
            mock.increment(send_gap);
            queue += queue_growth;
            if i % 5 == 4 {
                bwe.feedback_complete(clock.now());
            }
        }
    }

    /// A link that serialises packets at a fixed rate behind a FIFO queue
    /// and adds 20 ms of propagation delay.
    struct Link {
        bps: u64,
        free_at: Option<Instant>,
    }

    impl Link {
        fn new(bps: u64) -> Self {
            Link { bps, free_at: None }
        }

        fn arrival(&mut self, send: Instant, size: usize) -> Instant {
            let serialise = Duration::from_micros(size as u64 * 8 * 1_000_000 / self.bps);
            let start = self.free_at.map_or(send, |free| free.max(send));
            let done = start + serialise;
            self.free_at = Some(done);
            done + Duration::from_millis(20)
        }

        /// Offer `count` packets of `size` bytes every `send_gap`.
        fn feed(
            &mut self,
            clock: &Clock,
            mock: &Mock,
            bwe: &mut DelayBasedEstimator,
            first_seq: u16,
            count: u16,
            size: usize,
            send_gap: Duration,
        ) {
            for i in 0..count {
                let send = clock.now();
                let recv = self.arrival(send, size);
                let seq = first_seq.wrapping_add(i);
                bwe.process_packet_arrival(send, Some(send), Some(recv), seq, size, None);
                mock.increment(send_gap);
                if i % 5 == 4 {
                    bwe.feedback_complete(clock.now());
                }
            }
        }
    }

    #[test]
    fn bandwidth_display_and_bytes() {
        assert_eq!(Bandwidth::from_kbps(300).to_string(), "300.0 kbps");
        assert_eq!(Bandwidth::from_bps(2_500_000).to_string(), "2.50 Mbps");
        assert_eq!(Bandwidth::from_kbps(800).bytes_in(Duration::from_millis(10)), 1000);
    }

    #[test]
    fn steady_stream_converges_near_acked_rate() {
        let (clock, mock, mut bwe) = setup();
        // 1200 B every 30 ms = 320 kbps.
        feed(&clock, &mock, &mut bwe, 0, 400, 1200, Duration::from_millis(30), Duration::ZERO);
        let estimate = bwe.current_estimate(clock.now()).bps() as f64;
        assert!(estimate >= 320_000.0 * 0.95, "estimate {estimate}");
        assert!(estimate <= 320_000.0 * 1.06, "estimate {estimate}");
        assert_eq!(bwe.usage(), Usage::Normal);
    }

    #[test]
    fn growing_queue_triggers_decrease() {
        let (clock, mock, mut bwe) = setup();
        let mut link = Link::new(320_000);
        // At capacity first, then offer twice the link rate.
        link.feed(&clock, &mock, &mut bwe, 0, 300, 1200, Duration::from_millis(30));
        let before = bwe.current_estimate(clock.now());
        link.feed(&clock, &mock, &mut bwe, 300, 100, 1200, Duration::from_millis(15));
        assert_eq!(bwe.usage(), Usage::Overusing);
        let after = bwe.current_estimate(clock.now());
        assert!(after < before, "{after} !< {before}");
        assert!(bwe.stats().decreases >= 1);
    }

    #[test]
    fn sustained_overuse_tracks_the_acked_rate() {
        let (clock, mock, mut bwe) = setup();
        let mut link = Link::new(320_000);
        // 30 s of 640 kbps into a 320 kbps link.
        link.feed(&clock, &mock, &mut bwe, 0, 2000, 1200, Duration::from_millis(15));
        let estimate = bwe.current_estimate(clock.now()).bps() as f64;
        let stats = bwe.stats();
        assert_eq!(bwe.usage(), Usage::Overusing);
        assert!(stats.decreases > 10, "decreases {}", stats.decreases);
        let acked = stats.acked_bps.unwrap() as f64;
        assert!((acked - 320_000.0).abs() < 320_000.0 * 0.02, "acked {acked}");
        assert!(estimate >= 320_000.0 * 0.9, "estimate {estimate}");
        assert!(estimate <= 320_000.0 * 1.1, "estimate {estimate}");
    }

    #[test]
    fn decrease_never_raises_the_estimate() {
        let (clock, mock, mut bwe) = setup();
        let mut link = Link::new(2_000_000);
        // Acked rate far above the estimate; overuse must not lift it.
        link.feed(&clock, &mock, &mut bwe, 0, 200, 1200, Duration::from_micros(2500));
        let before = bwe.current_estimate(clock.now());
        link.feed(&clock, &mock, &mut bwe, 200, 100, 1200, Duration::from_micros(2500));
        assert!(bwe.current_estimate(clock.now()) <= before);
    }

    #[test]
    fn estimate_is_clamped() {
        let (clock, mock) = Clock::mock();
        let mut bwe = DelayBasedEstimator::new(EstimatorConfig {
            max: Bandwidth::from_kbps(400),
            ..Default::default()
        });
        for _ in 0..100 {
            mock.increment(Duration::from_secs(1));
            bwe.current_estimate(clock.now());
        }
        assert_eq!(bwe.current_estimate(clock.now()), Bandwidth::from_kbps(400));
    }

    #[test]
    fn heavy_loss_backs_off() {
        let (clock, mock, mut bwe) = setup();
        let start = bwe.current_estimate(clock.now());
        for seq in 0..30u16 {
            let now = clock.now();
            if seq % 2 == 0 {
                bwe.process_packet_loss(now, None, seq);
            } else {
                bwe.process_packet_arrival(now, None, None, seq, 1200, None);
            }
            mock.increment(Duration::from_millis(10));
        }
        let after = bwe.current_estimate(clock.now());
        assert!(after < start);
        assert_eq!(bwe.stats().incomplete, 15);
    }

    #[test]
    fn duplicates_are_counted_not_applied() {
        let (clock, _mock, mut bwe) = setup();
        let now = clock.now();
        bwe.process_packet_arrival(now, Some(now), Some(now), 7, 1000, None);
        bwe.process_packet_arrival(now, Some(now), Some(now), 7, 1000, None);
        let stats = bwe.stats();
        assert_eq!(stats.arrivals, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn reset_restores_start() {
        let (clock, mock, mut bwe) = setup();
        feed(&clock, &mock, &mut bwe, 0, 50, 1200, Duration::from_millis(10), Duration::ZERO);
        bwe.reset();
        assert_eq!(bwe.stats().arrivals, 0);
        assert_eq!(bwe.current_estimate(clock.now()), Bandwidth::from_kbps(300));
    }
}
