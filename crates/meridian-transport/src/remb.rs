//! # REMB Remote Estimator
//!
//! Receive-side bandwidth estimation for peers that did not negotiate
//! transport-cc. Send times come from the absolute-send-time header
//! extension (6.18 fixed-point seconds, wrapping every 64 s); the estimate is
//! reported back in REMB messages.
//!
//! The estimator is inactive whenever the transport-cc extension is mapped,
//! so a stream never runs both paths.

use std::collections::BTreeSet;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace};

use crate::bwe::{
    Bandwidth, BandwidthEstimator, DelayBasedEstimator, EstimatorConfig, EstimatorStats,
};
use crate::events::{Feature, TransportEvent};
use crate::rtcp::RembPacket;
use crate::streams::{ExtensionTable, MediaType, RtpExtensionKind};

const ABS_SEND_TIME_FRACTION_BITS: u32 = 18;
const ABS_SEND_TIME_WRAP: i64 = 1 << 24;

/// Parse a 3-byte abs-send-time extension value.
pub fn parse_abs_send_time(value: &[u8]) -> Option<u32> {
    match value {
        [a, b, c] => Some(u32::from_be_bytes([0, *a, *b, *c])),
        _ => None,
    }
}

/// Encode `elapsed` as a 3-byte abs-send-time value.
pub fn encode_abs_send_time(elapsed: Duration) -> [u8; 3] {
    let units = (elapsed.as_micros() << ABS_SEND_TIME_FRACTION_BITS) / 1_000_000;
    let v = (units as u32) & 0x00FF_FFFF;
    let [_, a, b, c] = v.to_be_bytes();
    [a, b, c]
}

fn units_to_duration(units: i64) -> Duration {
    let micros = (units.unsigned_abs() as u128 * 1_000_000) >> ABS_SEND_TIME_FRACTION_BITS;
    Duration::from_micros(micros as u64)
}

#[derive(Debug, Clone)]
pub struct RembConfig {
    /// Regular REMB cadence.
    pub report_interval: Duration,
    /// A drop of at least this fraction triggers an early report.
    pub decrease_trigger: f64,
    pub estimator: EstimatorConfig,
}

impl Default for RembConfig {
    fn default() -> Self {
        RembConfig {
            report_interval: Duration::from_secs(1),
            decrease_trigger: 0.03,
            estimator: EstimatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RembStats {
    pub packets: u64,
    /// Packets without a usable abs-send-time value.
    pub missing_send_time: u64,
    pub reports: u64,
    pub last_reported_bps: Option<u64>,
}

/// Maps 24-bit abs-send-time values onto the local clock.
#[derive(Debug, Clone, Copy)]
struct SendTimeUnwrapper {
    base_local: Instant,
    base_units: i64,
    last_raw: u32,
    unwrapped: i64,
}

impl SendTimeUnwrapper {
    fn new(raw: u32, at: Instant) -> Self {
        SendTimeUnwrapper {
            base_local: at,
            base_units: raw as i64,
            last_raw: raw,
            unwrapped: raw as i64,
        }
    }

    fn unwrap(&mut self, raw: u32) -> Option<Instant> {
        let mut d = raw as i64 - self.last_raw as i64;
        if d > ABS_SEND_TIME_WRAP / 2 {
            d -= ABS_SEND_TIME_WRAP;
        } else if d < -ABS_SEND_TIME_WRAP / 2 {
            d += ABS_SEND_TIME_WRAP;
        }
        let value = self.unwrapped + d;
        if d > 0 {
            self.last_raw = raw;
            self.unwrapped = value;
        }
        let offset = value - self.base_units;
        if offset >= 0 {
            Some(self.base_local + units_to_duration(offset))
        } else {
            self.base_local.checked_sub(units_to_duration(offset))
        }
    }
}

pub struct RembEstimator {
    config: RembConfig,
    sender_ssrc: u32,
    extensions: ExtensionTable,
    feature_enabled: bool,
    estimator: DelayBasedEstimator,
    unwrapper: Option<SendTimeUnwrapper>,
    arrival_seq: u16,
    ssrcs: BTreeSet<u32>,
    last_report: Option<(Instant, Bandwidth)>,
    stats: RembStats,
}

impl RembEstimator {
    pub fn new(config: RembConfig, sender_ssrc: u32) -> Self {
        let estimator = DelayBasedEstimator::new(config.estimator.clone());
        RembEstimator {
            config,
            sender_ssrc,
            extensions: ExtensionTable::default(),
            feature_enabled: true,
            estimator,
            unwrapper: None,
            arrival_seq: 0,
            ssrcs: BTreeSet::new(),
            last_report: None,
            stats: RembStats::default(),
        }
    }

    pub fn handle_event(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::ExtensionAdded { id, kind } => {
                self.extensions.insert(*id, kind.clone())
            }
            TransportEvent::ExtensionsCleared => self.extensions.clear(),
            TransportEvent::FeatureToggled {
                feature: Feature::Remb,
                enabled,
            } => self.feature_enabled = *enabled,
            TransportEvent::LocalSsrc {
                media: MediaType::Video,
                ssrc,
            } => self.sender_ssrc = *ssrc,
            _ => {}
        }
    }

    /// Extension id carrying abs-send-time, if mapped.
    pub fn abs_send_time_id(&self) -> Option<u8> {
        self.extensions.id_of(&RtpExtensionKind::AbsSendTime)
    }

    /// True when abs-send-time is mapped and transport-cc is not.
    pub fn is_active(&self) -> bool {
        self.feature_enabled
            && self.abs_send_time_id().is_some()
            && self.extensions.id_of(&RtpExtensionKind::TransportCc).is_none()
    }

    /// Feed one arrival. `abs_send_time` is the raw 24-bit extension value.
    pub fn packet_received(
        &mut self,
        ssrc: u32,
        abs_send_time: Option<u32>,
        size: usize,
        at: Instant,
    ) {
        if !self.is_active() {
            return;
        }
        self.stats.packets += 1;
        self.ssrcs.insert(ssrc);
        let Some(raw) = abs_send_time else {
            self.stats.missing_send_time += 1;
            return;
        };
        let unwrapper = self
            .unwrapper
            .get_or_insert_with(|| SendTimeUnwrapper::new(raw, at));
        let send_time = unwrapper.unwrap(raw);
        self.arrival_seq = self.arrival_seq.wrapping_add(1);
        self.estimator
            .process_packet_arrival(at, send_time, Some(at), self.arrival_seq, size, None);
    }

    /// REMB to send now, if one is due.
    pub fn poll(&mut self, now: Instant) -> Option<RembPacket> {
        if !self.is_active() || self.ssrcs.is_empty() {
            return None;
        }
        self.estimator.feedback_complete(now);
        let estimate = self.estimator.current_estimate(now);
        let due = match self.last_report {
            None => true,
            Some((at, reported)) => {
                let dropped = (reported.bps() as f64 - estimate.bps() as f64)
                    >= reported.bps() as f64 * self.config.decrease_trigger;
                now.saturating_duration_since(at) >= self.config.report_interval || dropped
            }
        };
        if !due {
            return None;
        }
        if let Some((_, reported)) = self.last_report {
            if estimate < reported {
                debug!(%estimate, %reported, "remote estimate decreased");
            }
        }
        self.last_report = Some((now, estimate));
        self.stats.reports += 1;
        self.stats.last_reported_bps = Some(estimate.bps());
        trace!(%estimate, "REMB built");
        Some(RembPacket {
            sender_ssrc: self.sender_ssrc,
            bitrate_bps: estimate.bps(),
            ssrcs: self.ssrcs.iter().copied().collect(),
        })
    }

    pub fn estimator_stats(&self) -> EstimatorStats {
        self.estimator.stats()
    }

    pub fn stats(&self) -> RembStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    fn active() -> RembEstimator {
        let mut remb = RembEstimator::new(RembConfig::default(), 5);
        remb.handle_event(&TransportEvent::ExtensionAdded {
            id: 3,
            kind: RtpExtensionKind::AbsSendTime,
        });
        remb
    }

    #[test]
    fn abs_send_time_codec() {
        let bytes = encode_abs_send_time(Duration::from_millis(1500));
        let raw = parse_abs_send_time(&bytes).unwrap();
        assert_eq!(raw, 3 << 17);
        assert_eq!(parse_abs_send_time(&[1, 2]), None);
    }

    #[test]
    fn unwrapper_crosses_64_second_wrap() {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(100));
        let near_wrap = (1 << 24) - (1 << 16);
        let mut unwrapper = SendTimeUnwrapper::new(near_wrap, clock.now());
        let after = unwrapper.unwrap(1 << 16).unwrap();
        // 2^17 units = 0.5 s.
        assert_eq!(after.saturating_duration_since(clock.now()), Duration::from_millis(500));
    }

    #[test]
    fn disabled_when_transport_cc_mapped() {
        let mut remb = active();
        assert!(remb.is_active());
        remb.handle_event(&TransportEvent::ExtensionAdded {
            id: 5,
            kind: RtpExtensionKind::TransportCc,
        });
        assert!(!remb.is_active());
        let (clock, _) = Clock::mock();
        remb.packet_received(1, Some(0), 1000, clock.now());
        assert_eq!(remb.stats().packets, 0);
        assert!(remb.poll(clock.now()).is_none());
    }

    #[test]
    fn reports_on_interval() {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let start = clock.now();
        let mut remb = active();
        let mut reports = Vec::new();
        for i in 0..200u32 {
            let sent = Duration::from_millis(i as u64 * 20);
            let raw = parse_abs_send_time(&encode_abs_send_time(sent)).unwrap();
            remb.packet_received(0xA, Some(raw), 1000, clock.now());
            if let Some(report) = remb.poll(clock.now()) {
                reports.push((clock.now().saturating_duration_since(start), report));
            }
            mock.increment(Duration::from_millis(20));
        }
        assert!(reports.len() >= 4, "got {} reports", reports.len());
        let (_, last) = reports.last().unwrap();
        assert_eq!(last.ssrcs, vec![0xA]);
        assert_eq!(last.sender_ssrc, 5);
        assert!(last.bitrate_bps > 0);
    }

    #[test]
    fn feature_toggle_disables() {
        let mut remb = active();
        remb.handle_event(&TransportEvent::FeatureToggled {
            feature: Feature::Remb,
            enabled: false,
        });
        assert!(!remb.is_active());
    }
}
