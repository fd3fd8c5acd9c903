//! Conversions from experiment parameters to executor descriptors.

use std::time::Duration;

use havoc_core::chaos::{
    parse_optional_float, parse_percentage, BandwidthSpec, CorruptSpec, DelaySpec, DuplicateSpec,
    LossSpec, NetworkAction, NetworkChaosSpec, SpecError,
};

use crate::types::{Netem, Tbf};

fn micros(duration: Duration) -> u32 {
    u32::try_from(duration.as_micros()).unwrap_or(u32::MAX)
}

impl TryFrom<&DelaySpec> for Netem {
    type Error = SpecError;

    fn try_from(delay: &DelaySpec) -> Result<Self, Self::Error> {
        let mut netem = Netem {
            time: micros(delay.latency()?),
            jitter: micros(delay.jitter()?),
            delay_corr: delay.correlation()?,
            ..Netem::default()
        };
        if let Some(reorder) = &delay.reorder {
            netem.reorder = parse_percentage("reorder", &reorder.reorder)?;
            netem.reorder_corr =
                parse_optional_float("reorder correlation", reorder.correlation.as_deref())?;
            netem.gap = reorder.gap;
        }
        Ok(netem)
    }
}

impl TryFrom<&LossSpec> for Netem {
    type Error = SpecError;

    fn try_from(loss: &LossSpec) -> Result<Self, Self::Error> {
        Ok(Netem {
            loss: parse_percentage("loss", &loss.loss)?,
            loss_corr: parse_optional_float("loss correlation", loss.correlation.as_deref())?,
            ..Netem::default()
        })
    }
}

impl TryFrom<&DuplicateSpec> for Netem {
    type Error = SpecError;

    fn try_from(duplicate: &DuplicateSpec) -> Result<Self, Self::Error> {
        Ok(Netem {
            duplicate: parse_percentage("duplicate", &duplicate.duplicate)?,
            duplicate_corr: parse_optional_float(
                "duplicate correlation",
                duplicate.correlation.as_deref(),
            )?,
            ..Netem::default()
        })
    }
}

impl TryFrom<&CorruptSpec> for Netem {
    type Error = SpecError;

    fn try_from(corrupt: &CorruptSpec) -> Result<Self, Self::Error> {
        Ok(Netem {
            corrupt: parse_percentage("corrupt", &corrupt.corrupt)?,
            corrupt_corr: parse_optional_float(
                "corrupt correlation",
                corrupt.correlation.as_deref(),
            )?,
            ..Netem::default()
        })
    }
}

impl TryFrom<&BandwidthSpec> for Tbf {
    type Error = SpecError;

    fn try_from(spec: &BandwidthSpec) -> Result<Self, Self::Error> {
        let mut tbf = Tbf {
            rate: spec.rate_bytes_per_sec()?,
            limit: spec.limit,
            buffer: spec.buffer,
            peak_rate: 0,
            min_burst: 0,
        };
        // Peak rate only means something together with its bucket size.
        if let (Some(peak_rate), Some(min_burst)) = (spec.peakrate, spec.minburst) {
            tbf.peak_rate = peak_rate;
            tbf.min_burst = min_burst;
        }
        Ok(tbf)
    }
}

fn section<'a, T>(
    value: &'a Option<T>,
    action: NetworkAction,
    field: &'static str,
) -> Result<&'a T, SpecError> {
    value.as_ref().ok_or_else(|| SpecError::MissingSection {
        action: action.as_str().to_string(),
        field,
    })
}

/// Build the netem descriptor for a netem-family network action.
pub fn netem_for(spec: &NetworkChaosSpec) -> Result<Netem, SpecError> {
    match spec.action {
        NetworkAction::Delay => Netem::try_from(section(&spec.delay, spec.action, "delay")?),
        NetworkAction::Loss => Netem::try_from(section(&spec.loss, spec.action, "loss")?),
        NetworkAction::Duplicate => {
            Netem::try_from(section(&spec.duplicate, spec.action, "duplicate")?)
        }
        NetworkAction::Corrupt => Netem::try_from(section(&spec.corrupt, spec.action, "corrupt")?),
        NetworkAction::Netem => {
            let mut netem = Netem::default();
            let mut any = false;
            if let Some(delay) = &spec.delay {
                netem = netem.merge(Netem::try_from(delay)?);
                any = true;
            }
            if let Some(loss) = &spec.loss {
                netem = netem.merge(Netem::try_from(loss)?);
                any = true;
            }
            if let Some(duplicate) = &spec.duplicate {
                netem = netem.merge(Netem::try_from(duplicate)?);
                any = true;
            }
            if let Some(corrupt) = &spec.corrupt {
                netem = netem.merge(Netem::try_from(corrupt)?);
                any = true;
            }
            if !any {
                return Err(SpecError::MissingSection {
                    action: spec.action.as_str().to_string(),
                    field: "delay/loss/duplicate/corrupt",
                });
            }
            Ok(netem)
        }
        NetworkAction::Partition | NetworkAction::Bandwidth => Err(SpecError::MissingSection {
            action: spec.action.as_str().to_string(),
            field: "netem parameters",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_core::chaos::ReorderSpec;

    fn bandwidth(rate: &str) -> BandwidthSpec {
        BandwidthSpec {
            rate: rate.to_string(),
            limit: 20_971_520,
            buffer: 10_000,
            peakrate: None,
            minburst: None,
        }
    }

    #[test]
    fn tbf_uses_parsed_rate() {
        let tbf = Tbf::try_from(&bandwidth("1mbps")).expect("valid rate");
        assert_eq!(tbf.rate, 1024 * 1024);
        assert_eq!(tbf.limit, 20_971_520);
        assert_eq!(tbf.buffer, 10_000);
        assert_eq!(tbf.peak_rate, 0);
    }

    #[test]
    fn tbf_peak_rate_needs_min_burst() {
        let mut spec = bandwidth("2gbps");
        spec.peakrate = Some(4096);
        let tbf = Tbf::try_from(&spec).expect("valid rate");
        assert_eq!(tbf.rate, 2 * 1024 * 1024 * 1024);
        assert_eq!(tbf.peak_rate, 0);

        spec.minburst = Some(1500);
        let tbf = Tbf::try_from(&spec).expect("valid rate");
        assert_eq!(tbf.peak_rate, 4096);
        assert_eq!(tbf.min_burst, 1500);
    }

    #[test]
    fn tbf_rejects_unknown_rate_unit() {
        let err = Tbf::try_from(&bandwidth("1xbps")).unwrap_err();
        assert!(err.to_string().contains("invalid rate unit"));
    }

    #[test]
    fn delay_converts_to_microseconds() {
        let delay = DelaySpec {
            latency: "90ms".to_string(),
            correlation: Some("25".to_string()),
            jitter: Some("10ms".to_string()),
            reorder: Some(ReorderSpec {
                reorder: "50".to_string(),
                correlation: None,
                gap: 5,
            }),
        };
        let netem = Netem::try_from(&delay).expect("valid delay");
        assert_eq!(netem.time, 90_000);
        assert_eq!(netem.jitter, 10_000);
        assert_eq!(netem.delay_corr, 25.0);
        assert_eq!(netem.reorder, 50.0);
        assert_eq!(netem.gap, 5);
    }

    #[test]
    fn netem_action_merges_every_section() {
        let spec = NetworkChaosSpec {
            action: NetworkAction::Netem,
            loss: Some(LossSpec {
                loss: "10".to_string(),
                correlation: None,
            }),
            corrupt: Some(CorruptSpec {
                corrupt: "5".to_string(),
                correlation: Some("1".to_string()),
            }),
            ..NetworkChaosSpec::default()
        };
        let netem = netem_for(&spec).expect("netem");
        assert_eq!(netem.loss, 10.0);
        assert_eq!(netem.corrupt, 5.0);
        assert_eq!(netem.corrupt_corr, 1.0);
    }

    #[test]
    fn missing_section_is_reported() {
        let spec = NetworkChaosSpec {
            action: NetworkAction::Loss,
            ..NetworkChaosSpec::default()
        };
        let err = netem_for(&spec).unwrap_err();
        assert_eq!(err.to_string(), "action loss requires the 'loss' section");
    }
}
