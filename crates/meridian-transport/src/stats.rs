//! # Statistics Helpers
//!
//! Building blocks shared by the components' stats snapshots: a generic
//! [`StatBlock`] that pipeline stages publish, a windowed rate counter and
//! an EWMA.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

// ─── Stat Block ─────────────────────────────────────────────────────────────

/// A single stat value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Count(u64),
    Ratio(f64),
    Text(String),
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Count(v)
    }
}

impl From<usize> for StatValue {
    fn from(v: usize) -> Self {
        StatValue::Count(v as u64)
    }
}

impl From<bool> for StatValue {
    fn from(v: bool) -> Self {
        StatValue::Count(v as u64)
    }
}

impl From<f64> for StatValue {
    fn from(v: f64) -> Self {
        StatValue::Ratio(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Count(v) => write!(f, "{v}"),
            StatValue::Ratio(v) => write!(f, "{v:.4}"),
            StatValue::Text(v) => f.write_str(v),
        }
    }
}

/// Ordered name → value list, as published by one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatBlock {
    entries: Vec<(String, StatValue)>,
}

impl StatBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<StatValue>) -> Self {
        self.add(name, value);
        self
    }

    pub fn add(&mut self, name: &str, value: impl Into<StatValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StatValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Count value by name, zero if missing or not a count.
    pub fn count(&self, name: &str) -> u64 {
        match self.get(name) {
            Some(StatValue::Count(v)) => *v,
            _ => 0,
        }
    }

    pub fn entries(&self) -> &[(String, StatValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Rate Window ────────────────────────────────────────────────────────────

/// Sliding-window byte counter yielding a bits-per-second rate.
///
/// The rate is computed over the span actually covered by samples, so a
/// steady stream yields its true rate as soon as two samples exist.
#[derive(Debug, Clone)]
pub struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        RateWindow {
            samples: VecDeque::with_capacity(128),
            window,
        }
    }

    /// Record `bytes` observed at `at`. Samples must be roughly in time order.
    pub fn record(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.expire(at);
    }

    fn expire(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.saturating_duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rate in bits per second, or `None` with fewer than two samples or a
    /// zero span. The first sample's bytes are excluded: they arrived at the
    /// start of the measured span.
    pub fn rate_bps(&self) -> Option<f64> {
        let (first, _) = self.samples.front()?;
        let (last, _) = self.samples.back()?;
        let span = last.saturating_duration_since(*first);
        if self.samples.len() < 2 || span.is_zero() {
            return None;
        }
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        Some(bytes as f64 * 8.0 / span.as_secs_f64())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if self.initialized {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
