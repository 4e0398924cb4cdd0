//! Infrastructure cost estimation.

use std::collections::BTreeMap;
use std::time::Duration;

/// Cost of one cluster group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cost {
    /// Non-negative estimate.
    Known(f64),
    /// The estimator had no pricing for the resources used.
    Unknown,
}

impl Cost {
    /// A known cost, or `Unknown` if `value` is negative or not a number.
    #[must_use]
    pub fn known(value: f64) -> Self {
        if value >= 0.0 && value.is_finite() {
            Self::Known(value)
        } else {
            Self::Unknown
        }
    }

    /// The value, if known.
    #[must_use]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }
}

/// Resources a group consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUsage {
    /// VM flavor.
    pub flavor: String,
    /// Number of VMs.
    pub nodes: u32,
    /// Time the VMs were up.
    pub billable: Duration,
}

/// Turns resource usage into a cost.
pub trait CostEstimator: Send + Sync {
    /// Estimate the cost of `usage`.
    fn estimate(&self, usage: &ResourceUsage) -> Cost;
}

/// Per-VM hourly pricing keyed by flavor.
#[derive(Debug, Clone, Default)]
pub struct HourlyRateEstimator {
    rates: BTreeMap<String, f64>,
}

impl HourlyRateEstimator {
    #[must_use]
    pub fn new(rates: BTreeMap<String, f64>) -> Self {
        Self { rates }
    }
}

impl CostEstimator for HourlyRateEstimator {
    fn estimate(&self, usage: &ResourceUsage) -> Cost {
        if usage.billable.is_zero() {
            return Cost::Known(0.0);
        }
        match self.rates.get(&usage.flavor) {
            Some(rate) => {
                let hours = usage.billable.as_secs_f64() / 3600.0;
                Cost::known(rate * f64::from(usage.nodes) * hours)
            }
            None => Cost::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> HourlyRateEstimator {
        HourlyRateEstimator::new([("m1.large".to_string(), 0.5)].into_iter().collect())
    }

    #[test]
    fn test_hourly_estimate() {
        let cost = estimator().estimate(&ResourceUsage {
            flavor: "m1.large".into(),
            nodes: 3,
            billable: Duration::from_secs(2 * 3600),
        });
        assert_eq!(cost, Cost::Known(3.0));
    }

    #[test]
    fn test_unknown_flavor() {
        let cost = estimator().estimate(&ResourceUsage {
            flavor: "gpu.large".into(),
            nodes: 1,
            billable: Duration::from_secs(60),
        });
        assert_eq!(cost, Cost::Unknown);
        assert_eq!(cost.value(), None);
    }

    #[test]
    fn test_nothing_billed_is_free() {
        let cost = estimator().estimate(&ResourceUsage {
            flavor: "gpu.large".into(),
            nodes: 4,
            billable: Duration::ZERO,
        });
        assert_eq!(cost, Cost::Known(0.0));
    }

    #[test]
    fn test_known_rejects_invalid_values() {
        assert_eq!(Cost::known(-1.0), Cost::Unknown);
        assert_eq!(Cost::known(f64::NAN), Cost::Unknown);
        assert_eq!(Cost::known(1.5).value(), Some(1.5));
    }
}
