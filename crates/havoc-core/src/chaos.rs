//! Kind-specific chaos parameters.
//!
//! `ChaosSpec` is a closed set of variants; adding a kind means adding a
//! variant, and every `match` on it stops compiling until the new kind is
//! handled.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::duration::{parse_duration, DurationParseError};
use crate::selector::SelectorSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid rate '{rate}': {reason}")]
    InvalidRate { rate: String, reason: String },
    #[error("invalid {field} '{value}': not a number")]
    InvalidNumber { field: &'static str, value: String },
    #[error(transparent)]
    Duration(#[from] DurationParseError),
    #[error("action {action} requires the '{field}' section")]
    MissingSection { action: String, field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChaosKind {
    NetworkChaos,
    HttpChaos,
    StressChaos,
}

impl ChaosKind {
    pub const ALL: [ChaosKind; 3] = [
        ChaosKind::NetworkChaos,
        ChaosKind::HttpChaos,
        ChaosKind::StressChaos,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChaosKind::NetworkChaos => "NetworkChaos",
            ChaosKind::HttpChaos => "HTTPChaos",
            ChaosKind::StressChaos => "StressChaos",
        }
    }
}

impl std::fmt::Display for ChaosKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChaosSpec {
    NetworkChaos(NetworkChaosSpec),
    HttpChaos(HttpChaosSpec),
    StressChaos(StressChaosSpec),
}

impl ChaosSpec {
    pub fn kind(&self) -> ChaosKind {
        match self {
            ChaosSpec::NetworkChaos(_) => ChaosKind::NetworkChaos,
            ChaosSpec::HttpChaos(_) => ChaosKind::HttpChaos,
            ChaosSpec::StressChaos(_) => ChaosKind::StressChaos,
        }
    }

    /// Short action label used in events and listings.
    pub fn describe_action(&self) -> String {
        match self {
            ChaosSpec::NetworkChaos(spec) => spec.action.as_str().to_string(),
            ChaosSpec::HttpChaos(spec) => spec.action.as_str().to_string(),
            ChaosSpec::StressChaos(_) => "stress".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAction {
    /// Delay, loss, duplicate and corrupt merged into a single netem call.
    Netem,
    #[default]
    Delay,
    Loss,
    Duplicate,
    Corrupt,
    Partition,
    Bandwidth,
}

impl NetworkAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkAction::Netem => "netem",
            NetworkAction::Delay => "delay",
            NetworkAction::Loss => "loss",
            NetworkAction::Duplicate => "duplicate",
            NetworkAction::Corrupt => "corrupt",
            NetworkAction::Partition => "partition",
            NetworkAction::Bandwidth => "bandwidth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionDirection {
    /// Block packets from the source towards the target.
    #[default]
    To,
    /// Block packets from the target towards the source.
    From,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkChaosSpec {
    #[serde(default)]
    pub action: NetworkAction,
    #[serde(default)]
    pub delay: Option<DelaySpec>,
    #[serde(default)]
    pub loss: Option<LossSpec>,
    #[serde(default)]
    pub duplicate: Option<DuplicateSpec>,
    #[serde(default)]
    pub corrupt: Option<CorruptSpec>,
    #[serde(default)]
    pub bandwidth: Option<BandwidthSpec>,
    #[serde(default)]
    pub direction: PartitionDirection,
    /// Peers on the other side of a partition.
    #[serde(default)]
    pub target: Option<SelectorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySpec {
    pub latency: String,
    #[serde(default)]
    pub correlation: Option<String>,
    #[serde(default)]
    pub jitter: Option<String>,
    #[serde(default)]
    pub reorder: Option<ReorderSpec>,
}

impl DelaySpec {
    pub fn latency(&self) -> Result<Duration, SpecError> {
        Ok(parse_duration(&self.latency)?)
    }

    pub fn jitter(&self) -> Result<Duration, SpecError> {
        match &self.jitter {
            Some(value) => Ok(parse_duration(value)?),
            None => Ok(Duration::ZERO),
        }
    }

    pub fn correlation(&self) -> Result<f32, SpecError> {
        parse_optional_float("correlation", self.correlation.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderSpec {
    pub reorder: String,
    #[serde(default)]
    pub correlation: Option<String>,
    #[serde(default)]
    pub gap: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSpec {
    pub loss: String,
    #[serde(default)]
    pub correlation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateSpec {
    pub duplicate: String,
    #[serde(default)]
    pub correlation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptSpec {
    pub corrupt: String,
    #[serde(default)]
    pub correlation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSpec {
    /// `<number><unit>`, unit one of bps, kbps, mbps, gbps, tbps.
    /// `bps` means bytes per second.
    pub rate: String,
    /// Bytes that may queue waiting for tokens.
    pub limit: u32,
    /// Maximum bytes available instantaneously.
    pub buffer: u32,
    #[serde(default)]
    pub peakrate: Option<u64>,
    #[serde(default)]
    pub minburst: Option<u32>,
}

impl BandwidthSpec {
    pub fn rate_bytes_per_sec(&self) -> Result<u64, SpecError> {
        parse_rate(&self.rate)
    }
}

/// Parse a bandwidth rate into bytes per second.
pub fn parse_rate(rate: &str) -> Result<u64, SpecError> {
    let normalized = rate.trim().to_lowercase();
    // Longest suffix first: every unit ends in "bps".
    const UNITS: [(&str, u32); 5] = [
        ("tbps", 4),
        ("gbps", 3),
        ("mbps", 2),
        ("kbps", 1),
        ("bps", 0),
    ];

    for (unit, power) in UNITS {
        let Some(number) = normalized.strip_suffix(unit) else {
            continue;
        };
        let number = number.trim();
        // A prefix like "x" in "1xbps" means the unit itself is unknown.
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(SpecError::InvalidRate {
                rate: rate.to_string(),
                reason: "invalid rate unit".to_string(),
            });
        }
        let value: u64 = number.parse().map_err(|_| SpecError::InvalidRate {
            rate: rate.to_string(),
            reason: "rate out of range".to_string(),
        })?;
        return value
            .checked_mul(1024u64.pow(power))
            .ok_or_else(|| SpecError::InvalidRate {
                rate: rate.to_string(),
                reason: "rate out of range".to_string(),
            });
    }

    Err(SpecError::InvalidRate {
        rate: rate.to_string(),
        reason: "invalid rate unit".to_string(),
    })
}

pub fn parse_percentage(field: &'static str, value: &str) -> Result<f32, SpecError> {
    value
        .trim()
        .parse::<f32>()
        .map_err(|_| SpecError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

pub fn parse_optional_float(field: &'static str, value: Option<&str>) -> Result<f32, SpecError> {
    match value {
        Some(value) if !value.trim().is_empty() => parse_percentage(field, value),
        _ => Ok(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HttpAction {
    #[default]
    Abort,
    Delay,
    Mixed,
}

impl HttpAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpAction::Abort => "abort",
            HttpAction::Delay => "delay",
            HttpAction::Mixed => "mixed",
        }
    }

    pub fn drops_packets(self) -> bool {
        matches!(self, HttpAction::Abort | HttpAction::Mixed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HttpChaosSpec {
    #[serde(default)]
    pub action: HttpAction,
    /// Probability (0-100) of affecting a packet.
    #[serde(default)]
    pub percent: String,
    #[serde(default)]
    pub delay: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StressChaosSpec {
    /// Stressor command line handed to the executor, e.g. `--cpu 2 --vm 1`.
    pub stressors: String,
}
