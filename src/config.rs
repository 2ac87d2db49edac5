use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::decay::DecayPreset;
use crate::error::{EngineError, EngineResult};
use crate::observations::StatKey;

pub const DEFAULT_CONFIG_NAME: &str = "default";

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// What to do when the three expected-goals blend weights do not sum to 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    #[default]
    Normalize,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub shot_based: f64,
    pub historical: f64,
    pub opponent_defense: f64,
}

impl BlendWeights {
    pub fn sum(&self) -> f64 {
        self.shot_based + self.historical + self.opponent_defense
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PredictionConfig {
    pub shot_based_weight: f64,
    pub historical_weight: f64,
    pub opponent_defense_weight: f64,
    pub weight_policy: WeightPolicy,
    /// Multiplier on the home side's base rate.
    pub home_advantage: f64,
    pub rbs_scaling_factor: f64,
    pub min_rbs_multiplier: f64,
    pub max_rbs_multiplier: f64,
    pub min_xg_per_match: f64,
    pub min_conversion_rate: f64,
    pub max_conversion_rate: f64,
    pub max_goals: u32,
    /// Confidence points per unit of effective sample weight.
    pub confidence_multiplier: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub ensemble_blend_weight: f64,
    pub ensemble_features: Vec<StatKey>,
    pub ensemble_test_size: f64,
    pub ensemble_random_state: u64,
    /// Named RBS config used for the bias step; the store default when absent.
    pub rbs_config: Option<String>,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            shot_based_weight: 0.40,
            historical_weight: 0.35,
            opponent_defense_weight: 0.25,
            weight_policy: WeightPolicy::Normalize,
            home_advantage: 1.0,
            rbs_scaling_factor: 0.10,
            min_rbs_multiplier: 0.75,
            max_rbs_multiplier: 1.25,
            min_xg_per_match: 0.10,
            min_conversion_rate: 0.50,
            max_conversion_rate: 1.50,
            max_goals: 10,
            confidence_multiplier: 5.0,
            min_confidence: 10.0,
            max_confidence: 95.0,
            ensemble_blend_weight: 0.30,
            ensemble_features: vec![
                StatKey::Shots,
                StatKey::ShotsOnTarget,
                StatKey::Xg,
                StatKey::PossessionPercentage,
            ],
            ensemble_test_size: 0.25,
            ensemble_random_state: 42,
            rbs_config: None,
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let weights = self.raw_weights();
        if [weights.shot_based, weights.historical, weights.opponent_defense]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(invalid("blend weights must be finite and non-negative"));
        }
        if weights.sum() <= 0.0 {
            return Err(invalid("at least one blend weight must be positive"));
        }
        if self.weight_policy == WeightPolicy::Reject
            && (weights.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(invalid(&format!(
                "blend weights sum to {:.6}, expected 1",
                weights.sum()
            )));
        }
        if !self.home_advantage.is_finite() || self.home_advantage <= 0.0 {
            return Err(invalid("home_advantage must be positive"));
        }
        if !self.rbs_scaling_factor.is_finite() || self.rbs_scaling_factor < 0.0 {
            return Err(invalid("rbs_scaling_factor must be non-negative"));
        }
        check_bounds(
            "rbs multiplier",
            self.min_rbs_multiplier,
            self.max_rbs_multiplier,
        )?;
        if self.min_rbs_multiplier <= 0.0 {
            return Err(invalid("min_rbs_multiplier must be positive"));
        }
        if !self.min_xg_per_match.is_finite() || self.min_xg_per_match < 0.0 {
            return Err(invalid("min_xg_per_match must be non-negative"));
        }
        check_bounds(
            "conversion rate",
            self.min_conversion_rate,
            self.max_conversion_rate,
        )?;
        if self.max_goals == 0 {
            return Err(invalid("max_goals must be at least 1"));
        }
        check_bounds("confidence", self.min_confidence, self.max_confidence)?;
        if !(0.0..=1.0).contains(&self.ensemble_blend_weight) {
            return Err(invalid("ensemble_blend_weight must lie in [0, 1]"));
        }
        if self.ensemble_features.is_empty() {
            return Err(invalid("ensemble_features must not be empty"));
        }
        if !(self.ensemble_test_size > 0.0 && self.ensemble_test_size < 1.0) {
            return Err(invalid("ensemble_test_size must lie in (0, 1)"));
        }
        Ok(())
    }

    pub fn raw_weights(&self) -> BlendWeights {
        BlendWeights {
            shot_based: self.shot_based_weight,
            historical: self.historical_weight,
            opponent_defense: self.opponent_defense_weight,
        }
    }

    /// Blend weights after applying the configured policy; the flag reports a rescale.
    pub fn blend_weights(&self) -> EngineResult<(BlendWeights, bool)> {
        let raw = self.raw_weights();
        let sum = raw.sum();
        if sum <= 0.0 {
            return Err(invalid("at least one blend weight must be positive"));
        }
        if (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE {
            return Ok((raw, false));
        }
        match self.weight_policy {
            WeightPolicy::Reject => Err(invalid(&format!(
                "blend weights sum to {sum:.6}, expected 1"
            ))),
            WeightPolicy::Normalize => {
                tracing::warn!(sum, "normalizing expected-goals blend weights");
                Ok((
                    BlendWeights {
                        shot_based: raw.shot_based / sum,
                        historical: raw.historical / sum,
                        opponent_defense: raw.opponent_defense / sum,
                    },
                    true,
                ))
            }
        }
    }
}

/// Direction in which a stat moving under a referee helps the team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Favorable {
    Higher,
    Lower,
}

impl Favorable {
    pub fn sign(self) -> f64 {
        match self {
            Favorable::Higher => 1.0,
            Favorable::Lower => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RbsStatWeight {
    pub stat: StatKey,
    pub weight: f64,
    /// Differential size that counts as one unit of bias.
    pub scale: f64,
    pub favorable: Favorable,
}

impl RbsStatWeight {
    fn new(stat: StatKey, weight: f64, scale: f64, favorable: Favorable) -> Self {
        Self {
            stat,
            weight,
            scale,
            favorable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RbsConfig {
    pub stats: Vec<RbsStatWeight>,
    /// Fixtures under the referee below which no score is reported.
    pub min_matches_with_ref: usize,
    pub min_baseline_matches: usize,
    pub min_confidence: f64,
    pub max_confidence: f64,
    /// Effective referee matches at which confidence covers ~63% of its range.
    pub confidence_scale: f64,
}

impl Default for RbsConfig {
    fn default() -> Self {
        use Favorable::{Higher, Lower};
        Self {
            stats: vec![
                RbsStatWeight::new(StatKey::YellowCards, 0.15, 1.0, Lower),
                RbsStatWeight::new(StatKey::RedCards, 0.10, 0.2, Lower),
                RbsStatWeight::new(StatKey::FoulsCommitted, 0.15, 3.0, Lower),
                RbsStatWeight::new(StatKey::FoulsDrawn, 0.15, 3.0, Higher),
                RbsStatWeight::new(StatKey::PenaltiesAwarded, 0.15, 0.25, Higher),
                RbsStatWeight::new(StatKey::XgDifference, 0.20, 0.5, Higher),
                RbsStatWeight::new(StatKey::PossessionPercentage, 0.10, 5.0, Higher),
            ],
            min_matches_with_ref: 3,
            min_baseline_matches: 3,
            min_confidence: 10.0,
            max_confidence: 100.0,
            confidence_scale: 6.0,
        }
    }
}

impl RbsConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.stats.is_empty() {
            return Err(invalid("rbs stats must not be empty"));
        }
        let mut seen = HashSet::new();
        for s in &self.stats {
            if !seen.insert(s.stat) {
                return Err(invalid(&format!("rbs stat {} listed twice", s.stat)));
            }
            if !s.weight.is_finite() || s.weight < 0.0 {
                return Err(invalid(&format!("rbs weight for {} must be >= 0", s.stat)));
            }
            if !s.scale.is_finite() || s.scale <= 0.0 {
                return Err(invalid(&format!("rbs scale for {} must be > 0", s.stat)));
            }
        }
        if self.min_matches_with_ref == 0 || self.min_baseline_matches == 0 {
            return Err(invalid("rbs minimum match counts must be at least 1"));
        }
        check_bounds("rbs confidence", self.min_confidence, self.max_confidence)?;
        if self.min_confidence < 0.0 || self.max_confidence > 100.0 {
            return Err(invalid("rbs confidence bounds must lie in [0, 100]"));
        }
        if !self.confidence_scale.is_finite() || self.confidence_scale <= 0.0 {
            return Err(invalid("confidence_scale must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowGranularity {
    Team,
    #[default]
    TeamSeason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegressionConfig {
    pub min_rows: usize,
    pub min_matches_per_row: usize,
    pub granularity: RowGranularity,
    pub preset: DecayPreset,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            min_rows: 8,
            min_matches_per_row: 3,
            granularity: RowGranularity::TeamSeason,
            preset: DecayPreset::None,
        }
    }
}

impl RegressionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_rows < 3 {
            return Err(invalid("min_rows must be at least 3"));
        }
        if self.min_matches_per_row == 0 {
            return Err(invalid("min_matches_per_row must be at least 1"));
        }
        Ok(())
    }
}

fn check_bounds(label: &str, lo: f64, hi: f64) -> EngineResult<()> {
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Err(invalid(&format!("{label} bounds are inverted ({lo} > {hi})")));
    }
    Ok(())
}

fn invalid(msg: &str) -> EngineError {
    EngineError::InvalidConfiguration(msg.to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    prediction: BTreeMap<String, PredictionConfig>,
    #[serde(default)]
    rbs: BTreeMap<String, RbsConfig>,
    #[serde(default)]
    regression: BTreeMap<String, RegressionConfig>,
}

/// Named entries of one config kind. `default` is always present.
#[derive(Debug, Clone)]
struct Named<T> {
    default: T,
    named: BTreeMap<String, T>,
}

impl<T: Default> Default for Named<T> {
    fn default() -> Self {
        Self {
            default: T::default(),
            named: BTreeMap::new(),
        }
    }
}

impl<T> Named<T> {
    fn insert(&mut self, name: &str, cfg: T) -> EngineResult<()> {
        let name = clean_name(name)?;
        if name == DEFAULT_CONFIG_NAME {
            self.default = cfg;
        } else {
            self.named.insert(name, cfg);
        }
        Ok(())
    }

    fn resolve(&self, name: Option<&str>, kind: &'static str) -> (&str, &T) {
        if let Some(requested) = name.map(str::trim).filter(|n| !n.is_empty())
            && requested != DEFAULT_CONFIG_NAME
        {
            if let Some((key, cfg)) = self.named.get_key_value(requested) {
                return (key.as_str(), cfg);
            }
            tracing::info!(kind, requested, "unknown config name, using default");
        }
        (DEFAULT_CONFIG_NAME, &self.default)
    }

    fn names(&self) -> Vec<&str> {
        std::iter::once(DEFAULT_CONFIG_NAME)
            .chain(self.named.keys().map(String::as_str))
            .collect()
    }
}

/// Read side of the named-config collaborator.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    prediction: Named<PredictionConfig>,
    rbs: Named<RbsConfig>,
    regression: Named<RegressionConfig>,
}

impl ConfigStore {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let doc: ConfigDocument = serde_json::from_str(raw).context("parse config document")?;
        let mut store = Self::default();
        for (name, cfg) in doc.prediction {
            store
                .insert_prediction(&name, cfg)
                .map_err(|e| anyhow!("prediction config '{name}': {e}"))?;
        }
        for (name, cfg) in doc.rbs {
            store
                .insert_rbs(&name, cfg)
                .map_err(|e| anyhow!("rbs config '{name}': {e}"))?;
        }
        for (name, cfg) in doc.regression {
            store
                .insert_regression(&name, cfg)
                .map_err(|e| anyhow!("regression config '{name}': {e}"))?;
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("load config file {}", path.display()))
    }

    pub fn insert_prediction(&mut self, name: &str, cfg: PredictionConfig) -> EngineResult<()> {
        cfg.validate()?;
        self.prediction.insert(name, cfg)
    }

    pub fn insert_rbs(&mut self, name: &str, cfg: RbsConfig) -> EngineResult<()> {
        cfg.validate()?;
        self.rbs.insert(name, cfg)
    }

    pub fn insert_regression(&mut self, name: &str, cfg: RegressionConfig) -> EngineResult<()> {
        cfg.validate()?;
        self.regression.insert(name, cfg)
    }

    /// Resolves a prediction config, falling back to `default` for absent or unknown names.
    /// Returns the name actually used.
    pub fn prediction(&self, name: Option<&str>) -> (&str, &PredictionConfig) {
        self.prediction.resolve(name, "prediction")
    }

    pub fn rbs(&self, name: Option<&str>) -> (&str, &RbsConfig) {
        self.rbs.resolve(name, "rbs")
    }

    pub fn regression(&self, name: Option<&str>) -> (&str, &RegressionConfig) {
        self.regression.resolve(name, "regression")
    }

    pub fn prediction_names(&self) -> Vec<&str> {
        self.prediction.names()
    }

    pub fn rbs_names(&self) -> Vec<&str> {
        self.rbs.names()
    }
}

fn clean_name(name: &str) -> EngineResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(invalid("config name must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PredictionConfig::default().validate().unwrap();
        RbsConfig::default().validate().unwrap();
        RegressionConfig::default().validate().unwrap();
        let (w, normalized) = PredictionConfig::default().blend_weights().unwrap();
        assert!(!normalized);
        assert!((w.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_policy_rescales_weights() {
        let cfg = PredictionConfig {
            shot_based_weight: 2.0,
            historical_weight: 1.0,
            opponent_defense_weight: 1.0,
            ..Default::default()
        };
        let (w, normalized) = cfg.blend_weights().unwrap();
        assert!(normalized);
        assert!((w.shot_based - 0.5).abs() < 1e-12);
        assert!((w.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reject_policy_refuses_bad_weights() {
        let cfg = PredictionConfig {
            shot_based_weight: 0.5,
            historical_weight: 0.5,
            opponent_defense_weight: 0.5,
            weight_policy: WeightPolicy::Reject,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(cfg.blend_weights().is_err());
    }

    #[test]
    fn non_finite_scalars_are_invalid() {
        let nan_cases = [
            PredictionConfig {
                home_advantage: f64::NAN,
                ..Default::default()
            },
            PredictionConfig {
                rbs_scaling_factor: f64::NAN,
                ..Default::default()
            },
            PredictionConfig {
                min_xg_per_match: f64::NAN,
                ..Default::default()
            },
            PredictionConfig {
                home_advantage: f64::INFINITY,
                ..Default::default()
            },
        ];
        for cfg in nan_cases {
            assert!(matches!(
                cfg.validate(),
                Err(EngineError::InvalidConfiguration(_))
            ));
        }
        let rbs = RbsConfig {
            confidence_scale: f64::NAN,
            ..Default::default()
        };
        assert!(rbs.validate().is_err());
    }

    #[test]
    fn unknown_config_field_is_rejected() {
        let raw = r#"{"prediction":{"sharp":{"rbs_scalling_factor":0.2}}}"#;
        let err = ConfigStore::from_json_str(raw).unwrap_err();
        assert!(format!("{err:#}").contains("rbs_scalling_factor"));
    }

    #[test]
    fn partial_config_uses_field_defaults() {
        let raw = r#"{
            "prediction": {"sharp": {"rbs_scaling_factor": 0.2}},
            "rbs": {"cards": {"min_matches_with_ref": 5}}
        }"#;
        let store = ConfigStore::from_json_str(raw).unwrap();
        assert_eq!(store.prediction_names(), ["default", "sharp"]);
        assert_eq!(store.rbs_names(), ["default", "cards"]);
        let (name, cfg) = store.prediction(Some("sharp"));
        assert_eq!(name, "sharp");
        assert_eq!(cfg.rbs_scaling_factor, 0.2);
        assert_eq!(cfg.max_goals, 10);
        let (_, rbs) = store.rbs(Some("cards"));
        assert_eq!(rbs.min_matches_with_ref, 5);
        assert_eq!(rbs.stats.len(), 7);
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        let store = ConfigStore::default();
        let (name, _) = store.prediction(Some("nope"));
        assert_eq!(name, DEFAULT_CONFIG_NAME);
        let (name, _) = store.rbs(None);
        assert_eq!(name, DEFAULT_CONFIG_NAME);
    }

    #[test]
    fn invalid_entry_fails_the_whole_document() {
        let raw = r#"{"rbs":{"broken":{"confidence_scale":0.0}}}"#;
        assert!(ConfigStore::from_json_str(raw).is_err());
    }

    #[test]
    fn rbs_stat_aliases_parse() {
        let raw = r#"{"stats":[{"stat":"fouls","weight":1.0,"scale":2.0,"favorable":"lower"}]}"#;
        let cfg: RbsConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.stats[0].stat, StatKey::FoulsCommitted);
    }
}
