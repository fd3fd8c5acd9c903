use havoc_core::types::Target;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainCommand {
    New,
    Add,
}

/// One packet-filter chain operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub command: ChainCommand,
    pub chain_name: String,
    /// Comma-joined destination ports.
    #[serde(default)]
    pub dport: String,
    /// Comma-joined source ports.
    #[serde(default)]
    pub sport: String,
    /// Jump target: another chain or `DROP`.
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub probability: String,
    /// Peer addresses the rule applies to, for partitions.
    #[serde(default)]
    pub ipset: Vec<String>,
}

impl Chain {
    pub fn new_chain(name: impl Into<String>) -> Self {
        Self {
            command: ChainCommand::New,
            chain_name: name.into(),
            dport: String::new(),
            sport: String::new(),
            action: String::new(),
            probability: String::new(),
            ipset: Vec::new(),
        }
    }

    pub fn add(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            command: ChainCommand::Add,
            action: action.into(),
            ..Self::new_chain(name)
        }
    }

    pub fn with_dport(mut self, ports: &str) -> Self {
        self.dport = ports.to_string();
        self
    }

    pub fn with_sport(mut self, ports: &str) -> Self {
        self.sport = ports.to_string();
        self
    }

    pub fn with_probability(mut self, probability: impl Into<String>) -> Self {
        self.probability = probability.into();
        self
    }

    pub fn with_ipset(mut self, ips: Vec<String>) -> Self {
        self.ipset = ips;
        self
    }
}

/// Queueing-discipline parameters for delay/loss/duplicate/corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Netem {
    /// Microseconds.
    pub time: u32,
    /// Microseconds.
    pub jitter: u32,
    pub delay_corr: f32,
    pub limit: u32,
    pub loss: f32,
    pub loss_corr: f32,
    pub gap: u32,
    pub duplicate: f32,
    pub duplicate_corr: f32,
    pub reorder: f32,
    pub reorder_corr: f32,
    pub corrupt: f32,
    pub corrupt_corr: f32,
}

impl Netem {
    /// Field-wise merge, keeping the larger value of each parameter.
    pub fn merge(self, other: Netem) -> Netem {
        Netem {
            time: self.time.max(other.time),
            jitter: self.jitter.max(other.jitter),
            delay_corr: self.delay_corr.max(other.delay_corr),
            limit: self.limit.max(other.limit),
            loss: self.loss.max(other.loss),
            loss_corr: self.loss_corr.max(other.loss_corr),
            gap: self.gap.max(other.gap),
            duplicate: self.duplicate.max(other.duplicate),
            duplicate_corr: self.duplicate_corr.max(other.duplicate_corr),
            reorder: self.reorder.max(other.reorder),
            reorder_corr: self.reorder_corr.max(other.reorder_corr),
            corrupt: self.corrupt.max(other.corrupt),
            corrupt_corr: self.corrupt_corr.max(other.corrupt_corr),
        }
    }
}

/// Token-bucket filter. Rates are bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tbf {
    pub rate: u64,
    pub limit: u32,
    pub buffer: u32,
    #[serde(default)]
    pub peak_rate: u64,
    #[serde(default)]
    pub min_burst: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressRequest {
    pub stressors: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    Chains { chains: Vec<Chain> },
    Netem { netem: Netem },
    Tbf { tbf: Tbf },
    Stress { request: StressRequest },
}

impl Fault {
    pub fn tag(&self) -> FaultTag {
        match self {
            Fault::Chains { .. } => FaultTag::Chains,
            Fault::Netem { .. } => FaultTag::Netem,
            Fault::Tbf { .. } => FaultTag::Tbf,
            Fault::Stress { .. } => FaultTag::Stress,
        }
    }
}

/// Which family of fault to clear on recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultTag {
    Chains,
    Netem,
    Tbf,
    Stress,
}

impl FaultTag {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultTag::Chains => "chains",
            FaultTag::Netem => "netem",
            FaultTag::Tbf => "tbf",
            FaultTag::Stress => "stress",
        }
    }
}

/// Wire form of a single executor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExecutorRequest {
    Apply { target: Target, fault: Fault },
    Recover { target: Target, tag: FaultTag },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverOutcome {
    Recovered,
    NothingToRecover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub ok: bool,
    #[serde(default)]
    pub already: bool,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_core::types::ObjectKey;

    #[test]
    fn netem_merge_keeps_the_larger_parameter() {
        let delay = Netem {
            time: 100_000,
            delay_corr: 25.0,
            ..Netem::default()
        };
        let loss = Netem {
            loss: 10.0,
            ..Netem::default()
        };
        let merged = delay.merge(loss);
        assert_eq!(merged.time, 100_000);
        assert_eq!(merged.delay_corr, 25.0);
        assert_eq!(merged.loss, 10.0);
    }

    #[test]
    fn request_wire_format_is_tagged() {
        let request = ExecutorRequest::Recover {
            target: Target::Pod(ObjectKey::new("default", "web-0")),
            tag: FaultTag::Tbf,
        };
        let encoded = serde_json::to_string(&request).expect("encode");
        assert!(encoded.contains("\"op\":\"recover\""));
        assert!(encoded.contains("\"tag\":\"tbf\""));
        let decoded: ExecutorRequest = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn fault_tag_matches_variant() {
        let fault = Fault::Stress {
            request: StressRequest {
                stressors: "--cpu 1".to_string(),
            },
        };
        assert_eq!(fault.tag(), FaultTag::Stress);
        assert_eq!(FaultTag::Stress.as_str(), "stress");
    }
}
