use std::time::Duration;

use serde::Deserialize;

use meridian_transport::bwe::{Bandwidth, EstimatorConfig};
use meridian_transport::cache::DEFAULT_CACHE_CAPACITY;
use meridian_transport::keyframe::KeyframeConfig;
use meridian_transport::nack::NackConfig;
use meridian_transport::probing::ProbingConfig;
use meridian_transport::remb::RembConfig;
use meridian_transport::tcc::{TccGeneratorConfig, TccSenderConfig};

use crate::runner::RunnerConfig;

pub const CONFIG_VERSION: u32 = 1;

// ─── Input (as parsed) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub version: u32,
    pub queue: QueueConfigInput,
    pub cache: CacheConfigInput,
    pub nack: NackConfigInput,
    pub keyframe: KeyframeConfigInput,
    pub tcc: TccConfigInput,
    pub bwe: BweConfigInput,
    pub remb: RembConfigInput,
    pub probing: ProbingConfigInput,
    pub features: FeaturesInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfigInput {
    pub capacity: Option<usize>,
    pub stats_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfigInput {
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NackConfigInput {
    pub debounce_ms: Option<u64>,
    pub retry_interval_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub max_missing: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyframeConfigInput {
    pub wait_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TccConfigInput {
    pub min_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub periodic_interval_ms: Option<u64>,
    pub bandwidth_fraction: Option<f64>,
    pub history_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BweConfigInput {
    pub min_kbps: Option<u64>,
    pub start_kbps: Option<u64>,
    pub max_kbps: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RembConfigInput {
    pub report_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbingConfigInput {
    pub passes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeaturesInput {
    pub rtx: Option<bool>,
    pub nack: Option<bool>,
    pub transport_cc: Option<bool>,
    pub remb: Option<bool>,
    pub padding_termination: Option<bool>,
    pub packet_timeline: Option<bool>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Runtime-switchable features, initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub rtx: bool,
    pub nack: bool,
    pub transport_cc: bool,
    pub remb: bool,
    pub padding_termination: bool,
    pub packet_timeline: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            rtx: true,
            nack: true,
            transport_cc: true,
            remb: true,
            padding_termination: true,
            packet_timeline: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub version: u32,
    pub runner: RunnerConfig,
    pub cache_capacity: usize,
    pub nack: NackConfig,
    pub nack_poll_interval: Duration,
    pub keyframe: KeyframeConfig,
    pub tcc_generator: TccGeneratorConfig,
    pub tcc_sender: TccSenderConfig,
    pub estimator: EstimatorConfig,
    pub remb: RembConfig,
    pub probing: ProbingConfig,
    pub features: Features,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            version: CONFIG_VERSION,
            runner: RunnerConfig::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            nack: NackConfig::default(),
            nack_poll_interval: Duration::from_millis(10),
            keyframe: KeyframeConfig::default(),
            tcc_generator: TccGeneratorConfig::default(),
            tcc_sender: TccSenderConfig::default(),
            estimator: EstimatorConfig::default(),
            remb: RembConfig::default(),
            probing: ProbingConfig::default(),
            features: Features::default(),
        }
    }
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }
        let defaults = TransportConfig::default();

        let runner = RunnerConfig {
            queue_capacity: self.queue.capacity.unwrap_or(defaults.runner.queue_capacity),
            stats_interval: ms_or(self.queue.stats_interval_ms, defaults.runner.stats_interval),
        };
        if runner.queue_capacity == 0 {
            return Err("queue.capacity must be at least 1".to_string());
        }
        if runner.stats_interval.is_zero() {
            return Err("queue.stats_interval_ms must be positive".to_string());
        }

        let cache_capacity = self.cache.capacity.unwrap_or(defaults.cache_capacity);
        if !(1..=u16::MAX as usize / 2).contains(&cache_capacity) {
            return Err(format!(
                "cache.capacity must be between 1 and {}, got {}",
                u16::MAX / 2,
                cache_capacity
            ));
        }

        let nack = NackConfig {
            debounce: ms_or(self.nack.debounce_ms, defaults.nack.debounce),
            retry_interval: ms_or(self.nack.retry_interval_ms, defaults.nack.retry_interval),
            max_retries: self.nack.max_retries.unwrap_or(defaults.nack.max_retries),
            max_missing: self.nack.max_missing.unwrap_or(defaults.nack.max_missing).max(1),
        };
        let nack_poll_interval = ms_or(self.nack.poll_interval_ms, defaults.nack_poll_interval);
        if nack_poll_interval.is_zero() {
            return Err("nack.poll_interval_ms must be positive".to_string());
        }

        let keyframe = KeyframeConfig {
            wait_interval: ms_or(self.keyframe.wait_interval_ms, defaults.keyframe.wait_interval),
        };

        let tcc_generator = TccGeneratorConfig {
            min_interval: ms_or(self.tcc.min_interval_ms, defaults.tcc_generator.min_interval),
            max_interval: ms_or(self.tcc.max_interval_ms, defaults.tcc_generator.max_interval),
            periodic: self.tcc.periodic_interval_ms.map(Duration::from_millis),
            bandwidth_fraction: self
                .tcc
                .bandwidth_fraction
                .unwrap_or(defaults.tcc_generator.bandwidth_fraction),
            ..defaults.tcc_generator
        };
        if tcc_generator.min_interval.is_zero()
            || tcc_generator.min_interval > tcc_generator.max_interval
        {
            return Err(format!(
                "tcc report interval bounds invalid: min {:?}, max {:?}",
                tcc_generator.min_interval, tcc_generator.max_interval
            ));
        }
        if tcc_generator.periodic.is_some_and(|p| p.is_zero()) {
            return Err("tcc.periodic_interval_ms must be positive".to_string());
        }
        if !(tcc_generator.bandwidth_fraction > 0.0 && tcc_generator.bandwidth_fraction <= 1.0) {
            return Err(format!(
                "tcc.bandwidth_fraction must be in (0, 1], got {}",
                tcc_generator.bandwidth_fraction
            ));
        }
        let tcc_sender = TccSenderConfig {
            history_capacity: self
                .tcc
                .history_capacity
                .unwrap_or(defaults.tcc_sender.history_capacity)
                .max(1),
        };

        let estimator = EstimatorConfig {
            min: self.bwe.min_kbps.map_or(defaults.estimator.min, Bandwidth::from_kbps),
            start: self.bwe.start_kbps.map_or(defaults.estimator.start, Bandwidth::from_kbps),
            max: self.bwe.max_kbps.map_or(defaults.estimator.max, Bandwidth::from_kbps),
            ..defaults.estimator
        };
        if estimator.min > estimator.max {
            return Err(format!(
                "bwe.min_kbps ({}) exceeds bwe.max_kbps ({})",
                estimator.min.kbps(),
                estimator.max.kbps()
            ));
        }
        if estimator.start < estimator.min || estimator.start > estimator.max {
            return Err(format!(
                "bwe.start_kbps ({}) outside [{}, {}]",
                estimator.start.kbps(),
                estimator.min.kbps(),
                estimator.max.kbps()
            ));
        }

        let remb = RembConfig {
            report_interval: ms_or(self.remb.report_interval_ms, defaults.remb.report_interval),
            estimator: estimator.clone(),
            ..defaults.remb
        };

        let probing = ProbingConfig {
            passes: self.probing.passes.unwrap_or(defaults.probing.passes),
            ..defaults.probing
        };

        let f = self.features;
        let features = Features {
            rtx: f.rtx.unwrap_or(defaults.features.rtx),
            nack: f.nack.unwrap_or(defaults.features.nack),
            transport_cc: f.transport_cc.unwrap_or(defaults.features.transport_cc),
            remb: f.remb.unwrap_or(defaults.features.remb),
            padding_termination: f
                .padding_termination
                .unwrap_or(defaults.features.padding_termination),
            packet_timeline: f.packet_timeline.unwrap_or(defaults.features.packet_timeline),
        };

        Ok(TransportConfig {
            version,
            runner,
            cache_capacity,
            nack,
            nack_poll_interval,
            keyframe,
            tcc_generator,
            tcc_sender,
            estimator,
            remb,
            probing,
            features,
        })
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput =
            toml::from_str(input).map_err(|e| anyhow::anyhow!("Invalid config TOML: {}", e))?;
        parsed.resolve().map_err(|e| anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(cfg.probing.passes, 2);
        assert_eq!(cfg.features, Features::default());
        assert!(cfg.tcc_generator.periodic.is_none());
    }

    #[test]
    fn parse_toml_config_full() {
        let toml = r#"
            version = 1

            [queue]
            capacity = 256
            stats_interval_ms = 250

            [cache]
            capacity = 512

            [nack]
            debounce_ms = 20
            retry_interval_ms = 80
            max_retries = 5
            max_missing = 100
            poll_interval_ms = 5

            [keyframe]
            wait_interval_ms = 300

            [tcc]
            min_interval_ms = 40
            max_interval_ms = 200
            periodic_interval_ms = 100
            bandwidth_fraction = 0.1
            history_capacity = 4096

            [bwe]
            min_kbps = 50
            start_kbps = 500
            max_kbps = 5000

            [remb]
            report_interval_ms = 500

            [probing]
            passes = 3

            [features]
            rtx = false
            remb = false
            packet_timeline = true
        "#;

        let cfg = TransportConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.runner.queue_capacity, 256);
        assert_eq!(cfg.runner.stats_interval, Duration::from_millis(250));
        assert_eq!(cfg.cache_capacity, 512);
        assert_eq!(cfg.nack.debounce, Duration::from_millis(20));
        assert_eq!(cfg.nack.retry_interval, Duration::from_millis(80));
        assert_eq!(cfg.nack.max_retries, 5);
        assert_eq!(cfg.nack.max_missing, 100);
        assert_eq!(cfg.nack_poll_interval, Duration::from_millis(5));
        assert_eq!(cfg.keyframe.wait_interval, Duration::from_millis(300));
        assert_eq!(cfg.tcc_generator.min_interval, Duration::from_millis(40));
        assert_eq!(cfg.tcc_generator.max_interval, Duration::from_millis(200));
        assert_eq!(cfg.tcc_generator.periodic, Some(Duration::from_millis(100)));
        assert_eq!(cfg.tcc_generator.bandwidth_fraction, 0.1);
        assert_eq!(cfg.tcc_sender.history_capacity, 4096);
        assert_eq!(cfg.estimator.min, Bandwidth::from_kbps(50));
        assert_eq!(cfg.estimator.start, Bandwidth::from_kbps(500));
        assert_eq!(cfg.estimator.max, Bandwidth::from_kbps(5000));
        assert_eq!(cfg.remb.report_interval, Duration::from_millis(500));
        assert_eq!(cfg.remb.estimator.max, Bandwidth::from_kbps(5000));
        assert_eq!(cfg.probing.passes, 3);
        assert!(!cfg.features.rtx);
        assert!(cfg.features.nack);
        assert!(!cfg.features.remb);
        assert!(cfg.features.packet_timeline);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = TransportConfig::from_toml_str("version = 2").unwrap_err();
        assert!(err.to_string().contains("Unsupported config version 2"));
    }

    #[test]
    fn rejects_inverted_bitrate_bounds() {
        let toml = r#"
            [bwe]
            min_kbps = 1000
            max_kbps = 500
            start_kbps = 700
        "#;
        assert!(TransportConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_start_outside_bounds() {
        let toml = r#"
            [bwe]
            start_kbps = 10
        "#;
        let err = TransportConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("start_kbps"));
    }

    #[test]
    fn rejects_bad_tcc_intervals() {
        let toml = r#"
            [tcc]
            min_interval_ms = 300
            max_interval_ms = 100
        "#;
        assert!(TransportConfig::from_toml_str(toml).is_err());

        let toml = r#"
            [tcc]
            bandwidth_fraction = 0.0
        "#;
        assert!(TransportConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_oversized_cache() {
        let toml = r#"
            [cache]
            capacity = 40000
        "#;
        assert!(TransportConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = TransportConfig::from_toml_str("[queue\ncapacity = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid config TOML"));
    }
}
