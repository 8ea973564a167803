use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RateSource {
    Default,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CommissionDetails {
    pub commission_rate: f64,
    pub rate_source: RateSource,
}

impl CommissionDetails {
    pub fn default_rate(commission_rate: f64) -> Self {
        Self {
            commission_rate,
            rate_source: RateSource::Default,
        }
    }

    pub fn custom(commission_rate: f64) -> Self {
        Self {
            commission_rate,
            rate_source: RateSource::Custom,
        }
    }

    pub fn driver_earnings(&self, total_price: f64) -> f64 {
        let share = total_price * (1.0 - self.commission_rate.clamp(0.0, 1.0));
        (share * 100.0).round() / 100.0
    }
}

pub fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && (0.0..1.0).contains(&rate)
}
