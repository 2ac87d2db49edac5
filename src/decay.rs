use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Average month length used to turn day offsets into month offsets.
pub const DAYS_PER_MONTH: f64 = 30.44;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decay_type", rename_all = "snake_case")]
pub enum DecayKind {
    Exponential { half_life_months: f64 },
    Linear { decay_rate_per_month: f64 },
    Step,
}

impl DecayKind {
    pub fn weight(self, age_months: f64) -> f64 {
        let age = age_months.max(0.0);
        match self {
            DecayKind::Exponential { half_life_months } => {
                if half_life_months <= 0.0 {
                    return if age == 0.0 { 1.0 } else { 0.0 };
                }
                0.5_f64.powf(age / half_life_months)
            }
            DecayKind::Linear {
                decay_rate_per_month,
            } => (1.0 - decay_rate_per_month.max(0.0) * age).clamp(0.0, 1.0),
            DecayKind::Step => 1.0,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            DecayKind::Exponential { .. } => "exponential",
            DecayKind::Linear { .. } => "linear",
            DecayKind::Step => "step",
        }
    }
}

/// The fixed preset catalog. Parameters live in [`DecayPreset::kind`] and never change at runtime.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DecayPreset {
    Aggressive,
    Moderate,
    Conservative,
    Linear,
    #[default]
    None,
}

impl DecayPreset {
    pub const ALL: [DecayPreset; 5] = [
        DecayPreset::Aggressive,
        DecayPreset::Moderate,
        DecayPreset::Conservative,
        DecayPreset::Linear,
        DecayPreset::None,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DecayPreset::Aggressive => "aggressive",
            DecayPreset::Moderate => "moderate",
            DecayPreset::Conservative => "conservative",
            DecayPreset::Linear => "linear",
            DecayPreset::None => "none",
        }
    }

    pub fn kind(self) -> DecayKind {
        match self {
            DecayPreset::Aggressive => DecayKind::Exponential {
                half_life_months: 2.0,
            },
            DecayPreset::Moderate => DecayKind::Exponential {
                half_life_months: 4.0,
            },
            DecayPreset::Conservative => DecayKind::Exponential {
                half_life_months: 8.0,
            },
            DecayPreset::Linear => DecayKind::Linear {
                decay_rate_per_month: 0.1,
            },
            DecayPreset::None => DecayKind::Step,
        }
    }

    pub fn weight(self, age_months: f64) -> f64 {
        self.kind().weight(age_months)
    }

    pub fn info(self) -> DecayPresetInfo {
        let kind = self.kind();
        let (half_life_months, decay_rate_per_month) = match kind {
            DecayKind::Exponential { half_life_months } => (Some(half_life_months), None),
            DecayKind::Linear {
                decay_rate_per_month,
            } => (None, Some(decay_rate_per_month)),
            DecayKind::Step => (None, None),
        };
        let description = match self {
            DecayPreset::Aggressive => {
                "Recent form dominates; a match loses half its weight every 2 months"
            }
            DecayPreset::Moderate => "Balanced recency; half-life of 4 months",
            DecayPreset::Conservative => "Long memory; half-life of 8 months",
            DecayPreset::Linear => "Weight drops by 0.1 per month and reaches zero after 10 months",
            DecayPreset::None => "Every historical match counts equally",
        };
        DecayPresetInfo {
            name: self.name().to_string(),
            decay_type: kind.type_name().to_string(),
            half_life_months,
            decay_rate_per_month,
            description: description.to_string(),
        }
    }
}

impl fmt::Display for DecayPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecayPreset {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_ascii_lowercase();
        DecayPreset::ALL
            .into_iter()
            .find(|p| p.name() == key)
            .ok_or_else(|| {
                EngineError::InvalidConfiguration(format!("unknown decay preset '{raw}'"))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayPresetInfo {
    pub name: String,
    pub decay_type: String,
    pub half_life_months: Option<f64>,
    pub decay_rate_per_month: Option<f64>,
    pub description: String,
}

pub fn catalog() -> Vec<DecayPresetInfo> {
    DecayPreset::ALL.iter().map(|p| p.info()).collect()
}

pub fn weight(age_months: f64, preset: DecayPreset) -> f64 {
    preset.weight(age_months)
}

/// Month offset of `match_date` relative to `reference`. Negative when the match lies after the
/// reference date; callers exclude those observations.
pub fn age_months(reference: NaiveDate, match_date: NaiveDate) -> f64 {
    (reference - match_date).num_days() as f64 / DAYS_PER_MONTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_halves_at_half_life() {
        for preset in [
            DecayPreset::Aggressive,
            DecayPreset::Moderate,
            DecayPreset::Conservative,
        ] {
            let DecayKind::Exponential { half_life_months } = preset.kind() else {
                panic!("{preset} should be exponential");
            };
            assert!((preset.weight(half_life_months) - 0.5).abs() < 1e-9);
            assert!((preset.weight(2.0 * half_life_months) - 0.25).abs() < 1e-9);
        }
    }

    #[test]
    fn linear_floors_at_zero() {
        assert_eq!(DecayPreset::Linear.weight(10.0), 0.0);
        assert_eq!(DecayPreset::Linear.weight(37.5), 0.0);
        assert!((DecayPreset::Linear.weight(4.0) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn negative_age_is_treated_as_zero() {
        assert_eq!(DecayPreset::Aggressive.weight(-3.0), 1.0);
    }

    #[test]
    fn parses_preset_names() {
        assert_eq!("Moderate".parse::<DecayPreset>().unwrap(), DecayPreset::Moderate);
        assert!("fast".parse::<DecayPreset>().is_err());
    }

    #[test]
    fn age_uses_average_month_length() {
        let reference = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let played = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let age = age_months(reference, played);
        assert!((age - 92.0 / DAYS_PER_MONTH).abs() < 1e-12);
    }
}
