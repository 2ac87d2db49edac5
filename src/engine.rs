use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::aggregate::{self, ProfileScope, WeightedTeamProfile};
use crate::calibration::{self, BacktestOptions, BacktestReport};
use crate::config::ConfigStore;
use crate::decay::{self, DecayPreset, DecayPresetInfo};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::observations::{ObservationQuery, ObservationSnapshot, ObservationSource};
use crate::predict::{PredictionEngine, PredictionRequest, PredictionResult};
use crate::rbs::{self, RbsBatch, RbsResult, RbsRun};
use crate::regression::{self, RegressionReport, RegressionRequest};

/// Envelope every engine operation answers with. Failures never escape as panics or `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub data: Option<T>,
}

impl<T> EngineResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            data: Some(data),
        }
    }

    pub fn failed(err: &EngineError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error_kind: Some(err.kind()),
            data: None,
        }
    }

    fn from_result(result: EngineResult<T>, message: impl FnOnce(&T) -> String) -> Self {
        match result {
            Ok(data) => {
                let msg = message(&data);
                Self::ok(data, msg)
            }
            Err(err) => {
                tracing::debug!(kind = ?err.kind(), error = %err, "engine operation failed");
                Self::failed(&err)
            }
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.message),
        }
    }
}

/// Facade over an observation source and named configs exposing the public operations.
///
/// Each call fetches its own snapshot, so concurrent callers share nothing mutable.
pub struct Engine {
    source: Box<dyn ObservationSource>,
    configs: ConfigStore,
    default_preset: DecayPreset,
    as_of: NaiveDate,
}

impl Engine {
    pub fn new(source: Box<dyn ObservationSource>, configs: ConfigStore, as_of: NaiveDate) -> Self {
        Self {
            source,
            configs,
            default_preset: DecayPreset::default(),
            as_of,
        }
    }

    /// Preset used by calls that leave theirs unset. Without this the default is `none`.
    pub fn with_default_preset(mut self, preset: DecayPreset) -> Self {
        self.default_preset = preset;
        self
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn decay_presets(&self) -> EngineResponse<Vec<DecayPresetInfo>> {
        let presets = decay::catalog();
        let msg = format!("{} decay presets", presets.len());
        EngineResponse::ok(presets, msg)
    }

    /// Weighted profile for `team`, optionally restricted to fixtures run by `referee`.
    pub fn aggregate(
        &self,
        team: &str,
        referee: Option<&str>,
        preset: Option<DecayPreset>,
        as_of: Option<NaiveDate>,
    ) -> EngineResponse<WeightedTeamProfile> {
        let as_of = as_of.unwrap_or(self.as_of);
        let preset = preset.unwrap_or(self.default_preset);
        let result = self.snapshot(as_of).and_then(|snap| {
            let scope = match referee.map(str::trim).filter(|r| !r.is_empty()) {
                Some(r) => {
                    let name = snap
                        .resolve_referee(r)
                        .ok_or_else(|| EngineError::referee_not_found(r))?;
                    ProfileScope::with_referee(name)
                }
                None => ProfileScope::all(),
            };
            aggregate::aggregate_team(&snap, team, &scope, preset, as_of)
        });
        EngineResponse::from_result(result, |p| {
            format!(
                "{} profile from {} matches (effective {:.2})",
                p.team, p.sample_size, p.effective_sample_weight
            )
        })
    }

    /// RBS for one pair. An insufficient-data outcome still carries the structured result.
    pub fn score_bias(
        &self,
        team: &str,
        referee: &str,
        preset: Option<DecayPreset>,
        config: Option<&str>,
    ) -> EngineResponse<RbsResult> {
        let (config_name, cfg) = self.configs.rbs(config);
        let run = RbsRun {
            preset: preset.unwrap_or(self.default_preset),
            as_of: self.as_of,
            config_name,
            config: cfg,
        };
        let result = self
            .snapshot(self.as_of)
            .and_then(|snap| rbs::score_bias(&snap, team, referee, run));
        match result {
            Ok(res) => match res.insufficient_reason() {
                None => {
                    let msg = format!(
                        "{} under {}: rbs {:.4}",
                        res.team,
                        res.referee,
                        res.rbs_score.unwrap_or_default()
                    );
                    EngineResponse::ok(res, msg)
                }
                Some(reason) => EngineResponse {
                    success: false,
                    message: format!("insufficient data: {reason}"),
                    error_kind: Some(ErrorKind::InsufficientData),
                    data: Some(res),
                },
            },
            Err(err) => EngineResponse::failed(&err),
        }
    }

    pub fn fit_regression(
        &self,
        request: &RegressionRequest,
        config: Option<&str>,
    ) -> EngineResponse<RegressionReport> {
        let (_, cfg) = self.configs.regression(config);
        let result = self
            .snapshot(self.as_of)
            .and_then(|snap| regression::fit(&snap, request, cfg, self.as_of))
            .map(|fit| fit.report);
        EngineResponse::from_result(result, |r| match r.r2_score {
            Some(r2) => format!("fitted {} rows, held-out r2 {r2:.3}", r.sample_size),
            None => format!("fitted {} rows, held-out r2 undefined", r.sample_size),
        })
    }

    pub fn predict(&self, request: &PredictionRequest) -> EngineResponse<PredictionResult> {
        let mut request = request.clone();
        if request.preset.is_none() {
            request.preset = Some(self.default_preset);
        }
        let result = self.snapshot(self.as_of).and_then(|snap| {
            PredictionEngine::new(&snap, &self.configs, self.as_of).predict(&request)
        });
        EngineResponse::from_result(result, |p| {
            format!(
                "{} v {}: {:.2}-{:.2}",
                p.home_team, p.away_team, p.predicted_home_goals, p.predicted_away_goals
            )
        })
    }

    /// Scores every (team, referee) pair in the current snapshot.
    pub fn recalculate_all(
        &self,
        preset: Option<DecayPreset>,
        config: Option<&str>,
    ) -> EngineResponse<RbsBatch> {
        let (config_name, cfg) = self.configs.rbs(config);
        let run = RbsRun {
            preset: preset.unwrap_or(self.default_preset),
            as_of: self.as_of,
            config_name,
            config: cfg,
        };
        let result = self
            .snapshot(self.as_of)
            .and_then(|snap| rbs::recalculate_all(&snap, run));
        EngineResponse::from_result(result, |b| {
            format!(
                "{} pairs: {} scored, {} insufficient",
                b.results.len(),
                b.scored,
                b.insufficient
            )
        })
    }

    pub fn backtest(&self, options: &BacktestOptions) -> EngineResponse<BacktestReport> {
        let result = self
            .snapshot(self.as_of)
            .and_then(|snap| calibration::backtest(&snap, &self.configs, options));
        EngineResponse::from_result(result, |r| {
            format!(
                "{} matches, brier {:.4} (baseline {:.4})",
                r.metrics.samples, r.metrics.brier, r.baseline.brier
            )
        })
    }

    fn snapshot(&self, as_of: NaiveDate) -> EngineResult<ObservationSnapshot> {
        let query = ObservationQuery {
            to: Some(as_of),
            ..ObservationQuery::default()
        };
        self.source.fetch(&query).map_err(|err| {
            tracing::warn!(error = %format!("{err:#}"), "observation fetch failed");
            EngineError::unavailable(&err)
        })
    }
}
