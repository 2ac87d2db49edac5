use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::aggregate::{self, ProfileScope, WeightedTeamProfile};
use crate::config::{BlendWeights, ConfigStore, PredictionConfig};
use crate::decay::DecayPreset;
use crate::error::{EngineError, EngineResult};
use crate::observations::{ObservationSnapshot, StatKey};
use crate::rbs::{self, RbsResult, RbsRun};
use crate::regression::{self, RegressionRequest};
use crate::win_prob::{self, OutcomeProbs};

pub const METHOD_WEIGHTED_POISSON: &str = "weighted_poisson";
pub const METHOD_RBS: &str = "rbs_adjustment";
pub const METHOD_ENSEMBLE: &str = "regression_ensemble";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionRequest {
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub referee: Option<String>,
    /// Named prediction config; `default` when absent or unknown.
    #[serde(default)]
    pub config: Option<String>,
    /// Decay preset; `none` when absent.
    #[serde(default)]
    pub preset: Option<DecayPreset>,
    #[serde(default)]
    pub ensemble: bool,
}

impl PredictionRequest {
    pub fn new(home_team: &str, away_team: &str) -> Self {
        Self {
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            ..Self::default()
        }
    }

    pub fn with_referee(mut self, referee: &str) -> Self {
        self.referee = Some(referee.to_string());
        self
    }

    pub fn with_preset(mut self, preset: DecayPreset) -> Self {
        self.preset = Some(preset);
        self
    }

    pub fn with_config(mut self, config: &str) -> Self {
        self.config = Some(config.to_string());
        self
    }

    pub fn with_ensemble(mut self) -> Self {
        self.ensemble = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedWeights {
    pub shot_based: f64,
    pub historical: f64,
    pub opponent_defense: f64,
    /// Configured weights did not sum to 1 and were rescaled.
    pub normalized: bool,
}

/// How one side's expected goals were built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideBreakdown {
    pub team: String,
    /// shots × xg_per_shot × conversion multiplier.
    pub shot_based: Option<f64>,
    pub conversion_multiplier: Option<f64>,
    pub historical: Option<f64>,
    pub opponent_defense: Option<f64>,
    /// Components left undefined by the profile; remaining weights were rescaled.
    pub dropped_components: Vec<String>,
    pub home_advantage: f64,
    pub base_rate: f64,
    pub rbs_multiplier: f64,
    pub expected_goals: f64,
    /// Raised to `min_xg_per_match`.
    pub floored: bool,
    pub sample_size: usize,
    pub effective_sample_weight: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRbs {
    pub team: String,
    pub scored: bool,
    pub rbs_score: Option<f64>,
    pub confidence_level: Option<f64>,
    pub matches_with_ref: usize,
    pub multiplier: f64,
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbsAdjustment {
    pub applied: bool,
    pub referee: Option<String>,
    pub config_used: Option<String>,
    pub scaling_factor: f64,
    /// Set when the whole step was skipped.
    pub reason: Option<String>,
    pub home: Option<SideRbs>,
    pub away: Option<SideRbs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleInfo {
    pub used: bool,
    pub blend_weight: f64,
    pub features: Vec<StatKey>,
    pub home_goals: Option<f64>,
    pub away_goals: Option<f64>,
    pub probabilities: Option<OutcomeProbs>,
    pub r2_score: Option<f64>,
    pub training_rows: Option<usize>,
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDecayInfo {
    pub preset: DecayPreset,
    pub decay_type: String,
    pub half_life_months: Option<f64>,
    pub decay_rate_per_month: Option<f64>,
    pub as_of: NaiveDate,
    pub home_effective_sample: f64,
    pub away_effective_sample: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionBreakdown {
    pub config_used: String,
    pub methods: Vec<String>,
    pub weights: AppliedWeights,
    pub home: SideBreakdown,
    pub away: SideBreakdown,
    pub rbs: RbsAdjustment,
    pub poisson_probabilities: OutcomeProbs,
    pub max_goals: u32,
    pub ensemble: Option<EnsembleInfo>,
    pub time_decay_info: TimeDecayInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub home_team: String,
    pub away_team: String,
    pub referee: Option<String>,
    pub predicted_home_goals: f64,
    pub predicted_away_goals: f64,
    pub home_win_probability: f64,
    pub draw_probability: f64,
    pub away_win_probability: f64,
    pub confidence: f64,
    pub most_likely_score: (u32, u32),
    pub over_2_5_probability: f64,
    pub both_teams_score_probability: f64,
    pub prediction_breakdown: PredictionBreakdown,
}

impl PredictionResult {
    pub fn probabilities(&self) -> OutcomeProbs {
        OutcomeProbs {
            home: self.home_win_probability,
            draw: self.draw_probability,
            away: self.away_win_probability,
        }
    }
}

/// Request-scoped predictor over a shared, read-only snapshot and config store.
#[derive(Debug, Clone, Copy)]
pub struct PredictionEngine<'a> {
    snapshot: &'a ObservationSnapshot,
    configs: &'a ConfigStore,
    as_of: NaiveDate,
}

impl<'a> PredictionEngine<'a> {
    pub fn new(
        snapshot: &'a ObservationSnapshot,
        configs: &'a ConfigStore,
        as_of: NaiveDate,
    ) -> Self {
        Self {
            snapshot,
            configs,
            as_of,
        }
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn predict(&self, request: &PredictionRequest) -> EngineResult<PredictionResult> {
        let (config_used, cfg) = self.configs.prediction(request.config.as_deref());
        cfg.validate()?;
        let (weights, normalized) = cfg.blend_weights()?;
        let preset = request.preset.unwrap_or_default();

        let home = self.resolve_team(&request.home_team)?;
        let away = self.resolve_team(&request.away_team)?;
        if home == away {
            return Err(EngineError::InvalidConfiguration(format!(
                "{home} cannot play itself"
            )));
        }
        let referee = match request.referee.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => Some(
                self.snapshot
                    .resolve_referee(r)
                    .ok_or_else(|| EngineError::referee_not_found(r))?,
            ),
            _ => None,
        };

        let home_profile = self.profile(home, preset)?;
        let away_profile = self.profile(away, preset)?;

        let mut home_side = side_base(&home_profile, &away_profile, weights, cfg, true)?;
        let mut away_side = side_base(&away_profile, &home_profile, weights, cfg, false)?;

        let rbs = self.rbs_adjustment(home, away, referee, preset, cfg)?;
        if let Some(side) = &rbs.home {
            home_side.rbs_multiplier = side.multiplier;
        }
        if let Some(side) = &rbs.away {
            away_side.rbs_multiplier = side.multiplier;
        }
        finish_side(&mut home_side, cfg);
        finish_side(&mut away_side, cfg);

        let dist = win_prob::score_distribution(
            home_side.expected_goals,
            away_side.expected_goals,
            cfg.max_goals,
        );

        let mut methods = vec![METHOD_WEIGHTED_POISSON.to_string()];
        if rbs.applied {
            methods.push(METHOD_RBS.to_string());
        }

        let ensemble = if request.ensemble {
            Some(self.ensemble(&home_profile, &away_profile, cfg))
        } else {
            None
        };
        let mut outcome = dist.outcome;
        if let Some(info) = &ensemble
            && let Some(probs) = info.probabilities
        {
            outcome = dist.outcome.blend(probs, cfg.ensemble_blend_weight);
            methods.push(METHOD_ENSEMBLE.to_string());
        }

        let confidence = (home_profile
            .effective_sample_weight
            .min(away_profile.effective_sample_weight)
            * cfg.confidence_multiplier)
            .clamp(cfg.min_confidence, cfg.max_confidence);

        tracing::debug!(
            home = %home,
            away = %away,
            lambda_home = home_side.expected_goals,
            lambda_away = away_side.expected_goals,
            methods = ?methods,
            "predicted fixture"
        );

        Ok(PredictionResult {
            home_team: home.to_string(),
            away_team: away.to_string(),
            referee: referee.map(str::to_string),
            predicted_home_goals: home_side.expected_goals,
            predicted_away_goals: away_side.expected_goals,
            home_win_probability: outcome.home,
            draw_probability: outcome.draw,
            away_win_probability: outcome.away,
            confidence,
            most_likely_score: dist.most_likely_score,
            over_2_5_probability: dist.over_2_5,
            both_teams_score_probability: dist.both_teams_score,
            prediction_breakdown: PredictionBreakdown {
                config_used: config_used.to_string(),
                methods,
                weights: AppliedWeights {
                    shot_based: weights.shot_based,
                    historical: weights.historical,
                    opponent_defense: weights.opponent_defense,
                    normalized,
                },
                home: home_side,
                away: away_side,
                rbs,
                poisson_probabilities: dist.outcome,
                max_goals: cfg.max_goals,
                ensemble,
                time_decay_info: time_decay_info(preset, self.as_of, &home_profile, &away_profile),
            },
        })
    }

    fn profile(&self, team: &str, preset: DecayPreset) -> EngineResult<WeightedTeamProfile> {
        aggregate::aggregate_team(self.snapshot, team, &ProfileScope::all(), preset, self.as_of)
    }

    fn resolve_team(&self, name: &str) -> EngineResult<&'a str> {
        self.snapshot
            .resolve_team(name)
            .ok_or_else(|| EngineError::team_not_found(name))
    }

    fn rbs_adjustment(
        &self,
        home: &str,
        away: &str,
        referee: Option<&str>,
        preset: DecayPreset,
        cfg: &PredictionConfig,
    ) -> EngineResult<RbsAdjustment> {
        let Some(referee) = referee else {
            return Ok(RbsAdjustment {
                applied: false,
                referee: None,
                config_used: None,
                scaling_factor: cfg.rbs_scaling_factor,
                reason: Some("no referee specified".to_string()),
                home: None,
                away: None,
            });
        };
        let (rbs_name, rbs_cfg) = self.configs.rbs(cfg.rbs_config.as_deref());
        let run = RbsRun {
            preset,
            as_of: self.as_of,
            config_name: rbs_name,
            config: rbs_cfg,
        };
        let home_rbs = side_rbs(rbs::score_bias(self.snapshot, home, referee, run)?, cfg);
        let away_rbs = side_rbs(rbs::score_bias(self.snapshot, away, referee, run)?, cfg);
        let applied = home_rbs.scored || away_rbs.scored;
        Ok(RbsAdjustment {
            applied,
            referee: Some(referee.to_string()),
            config_used: Some(rbs_name.to_string()),
            scaling_factor: cfg.rbs_scaling_factor,
            reason: (!applied).then(|| "insufficient referee data for both teams".to_string()),
            home: Some(home_rbs),
            away: Some(away_rbs),
        })
    }

    fn ensemble(
        &self,
        home: &WeightedTeamProfile,
        away: &WeightedTeamProfile,
        cfg: &PredictionConfig,
    ) -> EnsembleInfo {
        let mut info = EnsembleInfo {
            used: false,
            blend_weight: cfg.ensemble_blend_weight,
            features: cfg.ensemble_features.clone(),
            home_goals: None,
            away_goals: None,
            probabilities: None,
            r2_score: None,
            training_rows: None,
            skipped_reason: None,
        };

        let request = RegressionRequest {
            selected_stats: cfg
                .ensemble_features
                .iter()
                .map(|k| k.name().to_string())
                .collect(),
            target: StatKey::Goals.name().to_string(),
            test_size: cfg.ensemble_test_size,
            random_state: cfg.ensemble_random_state,
        };
        let (_, reg_cfg) = self.configs.regression(None);
        let fit = match regression::fit(self.snapshot, &request, reg_cfg, self.as_of) {
            Ok(fit) => fit,
            Err(err) => {
                tracing::warn!(error = %err, "ensemble skipped");
                info.skipped_reason = Some(err.to_string());
                return info;
            }
        };
        info.r2_score = fit.report.r2_score;
        info.training_rows = Some(fit.report.train_rows);

        let (Some(h), Some(a)) = (fit.model.predict(home), fit.model.predict(away)) else {
            info.skipped_reason =
                Some("a team profile leaves an ensemble feature undefined".to_string());
            return info;
        };
        let h = h.max(cfg.min_xg_per_match);
        let a = a.max(cfg.min_xg_per_match);
        info.home_goals = Some(h);
        info.away_goals = Some(a);
        info.probabilities = Some(win_prob::outcome_probs(h, a, cfg.max_goals));
        info.used = true;
        info
    }
}

fn side_base(
    own: &WeightedTeamProfile,
    opponent: &WeightedTeamProfile,
    weights: BlendWeights,
    cfg: &PredictionConfig,
    is_home: bool,
) -> EngineResult<SideBreakdown> {
    let conversion_multiplier = own
        .get(StatKey::GoalsPerXg)
        .map(|c| c.clamp(cfg.min_conversion_rate, cfg.max_conversion_rate));
    let shot_based = match (own.get(StatKey::Shots), own.get(StatKey::XgPerShot)) {
        (Some(shots), Some(per_shot)) => {
            Some(shots * per_shot * conversion_multiplier.unwrap_or(1.0))
        }
        _ => None,
    };
    let historical = own.get(StatKey::Goals);
    let opponent_defense = opponent.get(StatKey::GoalsConceded);

    let parts = [
        ("shot_based", shot_based, weights.shot_based),
        ("historical", historical, weights.historical),
        ("opponent_defense", opponent_defense, weights.opponent_defense),
    ];
    let mut dropped_components = Vec::new();
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (name, value, w) in parts {
        match value {
            Some(v) => {
                weighted += w * v;
                weight_sum += w;
            }
            None => dropped_components.push(name.to_string()),
        }
    }
    if weight_sum <= 0.0 {
        return Err(EngineError::InsufficientData(format!(
            "no expected-goals component is defined for {}",
            own.team
        )));
    }

    let home_advantage = if is_home { cfg.home_advantage } else { 1.0 };
    let base_rate = weighted / weight_sum * home_advantage;
    Ok(SideBreakdown {
        team: own.team.clone(),
        shot_based,
        conversion_multiplier,
        historical,
        opponent_defense,
        dropped_components,
        home_advantage,
        base_rate,
        rbs_multiplier: 1.0,
        expected_goals: base_rate,
        floored: false,
        sample_size: own.sample_size,
        effective_sample_weight: own.effective_sample_weight,
        confidence: (own.effective_sample_weight * cfg.confidence_multiplier)
            .clamp(cfg.min_confidence, cfg.max_confidence),
    })
}

fn finish_side(side: &mut SideBreakdown, cfg: &PredictionConfig) {
    let raw = side.base_rate * side.rbs_multiplier;
    side.floored = raw < cfg.min_xg_per_match;
    side.expected_goals = raw.max(cfg.min_xg_per_match);
}

fn side_rbs(result: RbsResult, cfg: &PredictionConfig) -> SideRbs {
    let multiplier = match result.rbs_score {
        Some(score) if result.is_scored() => (1.0 + cfg.rbs_scaling_factor * score)
            .clamp(cfg.min_rbs_multiplier, cfg.max_rbs_multiplier),
        _ => 1.0,
    };
    SideRbs {
        scored: result.is_scored(),
        skipped_reason: result.insufficient_reason().map(str::to_string),
        team: result.team,
        rbs_score: result.rbs_score,
        confidence_level: result.confidence_level,
        matches_with_ref: result.matches_with_ref,
        multiplier,
    }
}

fn time_decay_info(
    preset: DecayPreset,
    as_of: NaiveDate,
    home: &WeightedTeamProfile,
    away: &WeightedTeamProfile,
) -> TimeDecayInfo {
    let info = preset.info();
    TimeDecayInfo {
        preset,
        decay_type: info.decay_type,
        half_life_months: info.half_life_months,
        decay_rate_per_month: info.decay_rate_per_month,
        as_of,
        home_effective_sample: home.effective_sample_weight,
        away_effective_sample: away.effective_sample_weight,
    }
}
