//! # Transport-wide Congestion Control
//!
//! Both halves of transport-cc signaling.
//!
//! **Receive side** ([`TccGenerator`]): every RTP packet carries a
//! transport-wide sequence number in a header extension. Arrival times are
//! recorded per extended index and periodically reported back as
//! [`TccFeedback`].
//!
//! **Send side** ([`TransportCcEngine`]): outgoing packets are tagged with a
//! locally assigned sequence number and remembered in a bounded history.
//! Feedback reports are matched against that history and fed to a
//! [`BandwidthEstimator`].
//!
//! ## Key design decisions
//!
//! - Two report modes, never both: *immediate* (a report goes out from the
//!   arrival path once the feedback interval elapsed, or early at a frame
//!   end) and *periodic* (only [`TccGenerator::tick`] emits).
//! - The feedback interval targets ~5% of the measured receive bitrate,
//!   clamped to `[min_interval, max_interval]`.
//! - After a report, the window start moves one past the last reported
//!   index. A late packet older than the window start pulls it back so the
//!   next report re-covers it.
//! - The send history and the estimator sit behind separate mutexes. A
//!   feedback report is first resolved against the history, the lock is
//!   dropped, then the estimator is updated. No lock is held while taking
//!   another.
//! - Unknown, duplicate and late entries are counted, never fatal.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::bwe::{Bandwidth, BandwidthEstimator, EstimatorStats};
use crate::rtcp::{TccFeedback, TccFeedbackBuilder};
use crate::seq::SequenceIndexTracker;
use crate::stats::RateWindow;

/// Rough size of one feedback packet on the wire, IP/UDP/SRTCP included.
const FEEDBACK_PACKET_BITS: f64 = 80.0 * 8.0;
/// Entries that trigger an early report at a frame end.
const FRAME_END_PENDING: usize = 100;
/// Jump in the transport sequence treated as a sender restart.
const MAX_WINDOW_SPAN: u64 = 0x7FFF;

// ─── Receive Side ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TccGeneratorConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Used until a receive rate is measurable.
    pub default_interval: Duration,
    /// `Some` switches to periodic mode with this cadence.
    pub periodic: Option<Duration>,
    /// Share of the receive bitrate spent on feedback.
    pub bandwidth_fraction: f64,
    /// How long reported arrivals are kept to re-cover late packets.
    pub history: Duration,
}

impl Default for TccGeneratorConfig {
    fn default() -> Self {
        TccGeneratorConfig {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(250),
            default_interval: Duration::from_millis(100),
            periodic: None,
            bandwidth_fraction: 0.05,
            history: Duration::from_millis(500),
        }
    }
}

/// One RTP arrival as seen by the feedback generator.
#[derive(Debug, Clone, Copy)]
pub struct TccArrival {
    pub seq: u16,
    pub media_ssrc: u32,
    pub size: usize,
    /// RTP marker bit (last packet of a frame).
    pub marker: bool,
    pub at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TccReceiveStats {
    pub packets: u64,
    pub duplicates: u64,
    /// Arrivals older than the current window start.
    pub late: u64,
    pub reports: u64,
    pub entries_reported: u64,
    /// Windows discarded after a large sequence jump.
    pub resets: u64,
}

pub struct TccGenerator {
    config: TccGeneratorConfig,
    sender_ssrc: u32,
    media_ssrc: u32,
    tracker: SequenceIndexTracker,
    arrivals: BTreeMap<u64, Instant>,
    window_start: Option<u64>,
    epoch: Option<Instant>,
    last_report: Option<Instant>,
    feedback_count: u8,
    receive_rate: RateWindow,
    stats: TccReceiveStats,
}

impl TccGenerator {
    pub fn new(config: TccGeneratorConfig, sender_ssrc: u32) -> Self {
        TccGenerator {
            config,
            sender_ssrc,
            media_ssrc: 0,
            tracker: SequenceIndexTracker::new(),
            arrivals: BTreeMap::new(),
            window_start: None,
            epoch: None,
            last_report: None,
            feedback_count: 0,
            receive_rate: RateWindow::new(Duration::from_secs(1)),
            stats: TccReceiveStats::default(),
        }
    }

    pub fn set_sender_ssrc(&mut self, ssrc: u32) {
        self.sender_ssrc = ssrc;
    }

    pub fn is_periodic(&self) -> bool {
        self.config.periodic.is_some()
    }

    /// Record an arrival. In immediate mode, returns a report when one is due.
    pub fn packet_received(&mut self, arrival: TccArrival) -> Option<TccFeedback> {
        self.stats.packets += 1;
        self.media_ssrc = arrival.media_ssrc;
        self.receive_rate.record(arrival.at, arrival.size as u64);
        self.epoch.get_or_insert(arrival.at);
        self.last_report.get_or_insert(arrival.at);

        let index = self.tracker.update(arrival.seq);
        if self.arrivals.contains_key(&index) {
            self.stats.duplicates += 1;
            return None;
        }
        match self.window_start {
            None => self.window_start = Some(index),
            Some(start) if index < start => {
                self.stats.late += 1;
                trace!(seq = arrival.seq, "late transport-cc arrival, rewinding window");
                self.window_start = Some(index);
            }
            Some(start) if index - start > MAX_WINDOW_SPAN => {
                self.stats.resets += 1;
                debug!(seq = arrival.seq, "transport-cc sequence jump, clearing window");
                self.arrivals.clear();
                self.window_start = Some(index);
            }
            Some(_) => {}
        }
        self.arrivals.insert(index, arrival.at);
        self.prune(arrival.at);

        if self.is_periodic() {
            return None;
        }
        let elapsed = self
            .last_report
            .map_or(Duration::ZERO, |at| arrival.at.saturating_duration_since(at));
        let due = elapsed >= self.feedback_interval()
            || (arrival.marker
                && (elapsed >= self.config.min_interval || self.pending() >= FRAME_END_PENDING));
        if due {
            self.build_report(arrival.at)
        } else {
            None
        }
    }

    /// Periodic mode entry point. Returns `None` in immediate mode.
    pub fn tick(&mut self, now: Instant) -> Option<TccFeedback> {
        if !self.is_periodic() {
            return None;
        }
        self.build_report(now)
    }

    /// Current target interval between reports.
    pub fn feedback_interval(&self) -> Duration {
        let Some(bps) = self.receive_rate.rate_bps() else {
            return self.config.default_interval;
        };
        let budget = bps * self.config.bandwidth_fraction;
        if budget <= 0.0 {
            return self.config.max_interval;
        }
        Duration::from_secs_f64(FEEDBACK_PACKET_BITS / budget)
            .clamp(self.config.min_interval, self.config.max_interval)
    }

    /// Entries not yet reported.
    pub fn pending(&self) -> usize {
        self.window_start
            .map_or(0, |start| self.arrivals.range(start..).count())
    }

    /// Drop reported arrivals older than the history window.
    fn prune(&mut self, now: Instant) {
        let start = self.window_start.unwrap_or(u64::MAX);
        while let Some((&index, &at)) = self.arrivals.first_key_value() {
            if index >= start || now.saturating_duration_since(at) <= self.config.history {
                break;
            }
            self.arrivals.pop_first();
        }
    }

    fn build_report(&mut self, now: Instant) -> Option<TccFeedback> {
        let start = self.window_start?;
        let epoch = self.epoch?;
        let micros = |at: &Instant| at.saturating_duration_since(epoch).as_micros() as i64;

        let mut entries = self.arrivals.range(start..);
        let (&first_index, first_at) = entries.next()?;
        let mut builder = TccFeedbackBuilder::new(
            self.sender_ssrc,
            self.media_ssrc,
            self.feedback_count,
            micros(first_at),
        );
        builder.add_received(first_index as u16, micros(first_at));
        let mut last_index = first_index;
        for (&index, at) in entries {
            if !builder.add_received(index as u16, micros(at)) {
                break;
            }
            last_index = index;
        }

        let feedback = builder.build();
        self.window_start = Some(last_index + 1);
        self.feedback_count = self.feedback_count.wrapping_add(1);
        self.last_report = Some(now);
        self.stats.reports += 1;
        self.stats.entries_reported += feedback.packets.len() as u64;
        trace!(
            base_seq = feedback.base_seq,
            entries = feedback.packets.len(),
            "transport-cc feedback built"
        );
        Some(feedback)
    }

    pub fn stats(&self) -> TccReceiveStats {
        self.stats.clone()
    }
}

// ─── Send Side ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TccSenderConfig {
    /// Sent packets remembered for feedback matching.
    pub history_capacity: usize,
}

impl Default for TccSenderConfig {
    fn default() -> Self {
        TccSenderConfig {
            history_capacity: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportState {
    Unreported,
    Lost,
    Acked,
}

/// Send record of one transport-cc tagged packet.
#[derive(Debug, Clone, Copy)]
pub struct SentPacketRecord {
    pub seq: u16,
    pub size: usize,
    pub send_time: Instant,
    state: ReportState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TccSendStats {
    pub packets_sent: u64,
    pub feedback_reports: u64,
    pub packets_acked: u64,
    /// Entries reported as not received.
    pub missing_reports: u64,
    /// Received entries with no send record.
    pub unknown_packets: u64,
    /// Received entries already acknowledged by an earlier report.
    pub duplicate_reports: u64,
    /// Received entries previously reported missing.
    pub received_after_loss: u64,
    /// Records evicted from history without ever being reported.
    pub unreported: u64,
    /// Reports whose feedback count was not newer than the last one.
    pub out_of_order_reports: u64,
}

struct SentPacketHistory {
    records: HashMap<u16, SentPacketRecord>,
    order: VecDeque<u16>,
    capacity: usize,
    last_feedback_count: Option<u8>,
    stats: TccSendStats,
}

impl SentPacketHistory {
    fn insert(&mut self, record: SentPacketRecord) {
        if self.records.insert(record.seq, record).is_none() {
            self.order.push_back(record.seq);
        }
        while self.order.len() > self.capacity {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.records.remove(&old) {
                if evicted.state == ReportState::Unreported {
                    self.stats.unreported += 1;
                }
            }
        }
    }
}

/// Local-to-remote clock mapping fixed by the first report.
#[derive(Debug, Clone, Copy)]
struct TimeBase {
    local: Instant,
    remote_us: i64,
}

impl TimeBase {
    fn to_local(&self, remote_us: i64) -> Option<Instant> {
        let offset = remote_us - self.remote_us;
        if offset >= 0 {
            Some(self.local + Duration::from_micros(offset as u64))
        } else {
            self.local.checked_sub(Duration::from_micros(offset.unsigned_abs()))
        }
    }
}

enum Observation {
    Arrival {
        seq: u16,
        size: usize,
        send_time: Instant,
        recv_time: Option<Instant>,
    },
    Loss {
        seq: u16,
        send_time: Instant,
    },
}

/// Send-side transport-cc: sequence allocation, history, feedback handling.
pub struct TransportCcEngine {
    next_seq: AtomicU16,
    history: Mutex<SentPacketHistory>,
    time_base: Mutex<Option<TimeBase>>,
    estimator: Mutex<Box<dyn BandwidthEstimator>>,
}

impl TransportCcEngine {
    pub fn new(config: TccSenderConfig, estimator: Box<dyn BandwidthEstimator>) -> Self {
        TransportCcEngine {
            next_seq: AtomicU16::new(1),
            history: Mutex::new(SentPacketHistory {
                records: HashMap::with_capacity(config.history_capacity),
                order: VecDeque::with_capacity(config.history_capacity),
                capacity: config.history_capacity.max(1),
                last_feedback_count: None,
                stats: TccSendStats::default(),
            }),
            time_base: Mutex::new(None),
            estimator: Mutex::new(estimator),
        }
    }

    /// Next transport-wide sequence number (wraps at 65536).
    pub fn allocate_sequence(&self) -> u16 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn packet_sent(&self, seq: u16, size: usize, now: Instant) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.stats.packets_sent += 1;
        history.insert(SentPacketRecord {
            seq,
            size,
            send_time: now,
            state: ReportState::Unreported,
        });
    }

    /// Process one feedback report; returns the updated estimate.
    pub fn on_feedback(&self, feedback: &TccFeedback, now: Instant) -> Bandwidth {
        let time_base = {
            let mut base = self.time_base.lock().unwrap_or_else(|e| e.into_inner());
            *base.get_or_insert_with(|| {
                debug!(
                    reference_us = feedback.reference_time_us(),
                    "transport-cc time base established"
                );
                TimeBase {
                    local: now,
                    remote_us: feedback.reference_time_us(),
                }
            })
        };

        let observations = self.resolve(feedback, &time_base);

        let mut estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        for observation in observations {
            match observation {
                Observation::Arrival {
                    seq,
                    size,
                    send_time,
                    recv_time,
                } => estimator.process_packet_arrival(
                    now,
                    Some(send_time),
                    recv_time,
                    seq,
                    size,
                    None,
                ),
                Observation::Loss { seq, send_time } => {
                    estimator.process_packet_loss(now, Some(send_time), seq)
                }
            }
        }
        estimator.feedback_complete(now);
        estimator.current_estimate(now)
    }

    fn resolve(&self, feedback: &TccFeedback, time_base: &TimeBase) -> Vec<Observation> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.stats.feedback_reports += 1;
        if let Some(last) = history.last_feedback_count {
            let d = feedback.feedback_count.wrapping_sub(last) as i8;
            if d <= 0 {
                history.stats.out_of_order_reports += 1;
            }
        }
        history.last_feedback_count = Some(feedback.feedback_count);

        let mut observations = Vec::with_capacity(feedback.packets.len());
        let mut unknown = 0u64;
        for status in &feedback.packets {
            let Some(arrival_us) = status.arrival_us else {
                history.stats.missing_reports += 1;
                if let Some(record) = history.records.get_mut(&status.seq) {
                    if record.state == ReportState::Unreported {
                        record.state = ReportState::Lost;
                        observations.push(Observation::Loss {
                            seq: record.seq,
                            send_time: record.send_time,
                        });
                    }
                }
                continue;
            };
            let Some(record) = history.records.get_mut(&status.seq) else {
                unknown += 1;
                continue;
            };
            let previous = record.state;
            record.state = ReportState::Acked;
            let observation = Observation::Arrival {
                seq: record.seq,
                size: record.size,
                send_time: record.send_time,
                recv_time: time_base.to_local(arrival_us),
            };
            match previous {
                ReportState::Acked => {
                    history.stats.duplicate_reports += 1;
                    continue;
                }
                ReportState::Lost => history.stats.received_after_loss += 1,
                ReportState::Unreported => {}
            }
            history.stats.packets_acked += 1;
            observations.push(observation);
        }
        if unknown > 0 {
            history.stats.unknown_packets += unknown;
            warn!(
                base_seq = feedback.base_seq,
                unknown, "transport-cc feedback for packets not in send history"
            );
        }
        observations
    }

    pub fn on_rtt_update(&self, rtt: Duration, now: Instant) {
        let mut estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        estimator.on_rtt_update(now, rtt);
    }

    pub fn estimate(&self, now: Instant) -> Bandwidth {
        let mut estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        estimator.current_estimate(now)
    }

    /// Forget the time base and reset the estimator.
    pub fn reset(&self) {
        *self.time_base.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let mut estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        estimator.reset();
    }

    pub fn history_len(&self) -> usize {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.records.len()
    }

    pub fn stats(&self) -> TccSendStats {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.stats.clone()
    }

    pub fn estimator_stats(&self) -> EstimatorStats {
        let estimator = self.estimator.lock().unwrap_or_else(|e| e.into_inner());
        estimator.stats()
    }
}
