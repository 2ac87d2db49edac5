use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::aggregate::{self, ProfileScope, WeightedTeamProfile};
use crate::config::{RegressionConfig, RowGranularity};
use crate::decay::DecayPreset;
use crate::error::{EngineError, EngineResult};
use crate::observations::{ObservationSnapshot, StatKey};

const RANK_TOLERANCE: f64 = 1e-10;

pub const DEFAULT_TARGET: StatKey = StatKey::PointsPerGame;

fn default_target() -> String {
    DEFAULT_TARGET.name().to_string()
}

fn default_test_size() -> f64 {
    0.2
}

fn default_random_state() -> u64 {
    42
}

/// Stat names arrive as strings from callers and are validated by [`fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegressionRequest {
    pub selected_stats: Vec<String>,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
}

impl RegressionRequest {
    pub fn new(selected_stats: &[&str], test_size: f64, random_state: u64) -> Self {
        Self {
            selected_stats: selected_stats.iter().map(|s| s.to_string()).collect(),
            target: default_target(),
            test_size,
            random_state,
        }
    }

    fn validate(&self) -> EngineResult<(Vec<StatKey>, StatKey)> {
        if self.selected_stats.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "selected_stats must not be empty".to_string(),
            ));
        }
        let mut features = Vec::with_capacity(self.selected_stats.len());
        let mut seen = HashSet::new();
        for raw in &self.selected_stats {
            let key = StatKey::parse(raw).ok_or_else(|| EngineError::stat_not_found(raw))?;
            if !seen.insert(key) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "stat {key} selected twice"
                )));
            }
            features.push(key);
        }
        let target = StatKey::parse(&self.target)
            .ok_or_else(|| EngineError::stat_not_found(&self.target))?;
        if seen.contains(&target) {
            return Err(EngineError::InvalidConfiguration(format!(
                "target {target} is also a selected stat"
            )));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(EngineError::InvalidConfiguration(format!(
                "test_size must lie in (0, 1), got {}",
                self.test_size
            )));
        }
        Ok((features, target))
    }
}

/// Fitted `target ≈ intercept + Σ coefficient · stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<StatKey>,
    pub target: StatKey,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn predict_values(&self, values: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(values)
                .map(|(c, v)| c * v)
                .sum::<f64>()
    }

    /// `None` when the profile leaves any feature undefined.
    pub fn predict(&self, profile: &WeightedTeamProfile) -> Option<f64> {
        let values: Option<Vec<f64>> = self.features.iter().map(|k| profile.get(*k)).collect();
        values.map(|v| self.predict_values(&v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub target: StatKey,
    pub coefficients: BTreeMap<StatKey, f64>,
    pub intercept: f64,
    /// Held-out R²; `None` when the test target has zero variance.
    pub r2_score: Option<f64>,
    pub train_r2: Option<f64>,
    /// Complete rows used for the fit (train + test).
    pub sample_size: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub dropped_rows: usize,
    pub granularity: RowGranularity,
    pub preset: DecayPreset,
    pub test_size: f64,
    pub random_state: u64,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionFit {
    pub model: LinearModel,
    pub report: RegressionReport,
}

#[derive(Debug, Clone)]
struct Row {
    values: Vec<f64>,
    target: f64,
}

/// Groups a team's fixtures into rows: one per team, or one per team and season.
fn build_rows(
    snapshot: &ObservationSnapshot,
    features: &[StatKey],
    target: StatKey,
    config: &RegressionConfig,
    as_of: NaiveDate,
) -> EngineResult<(Vec<Row>, usize)> {
    let mut rows = Vec::new();
    let mut dropped = 0usize;

    for team in snapshot.teams() {
        let views = snapshot.team_views(team)?;
        let scopes: Vec<ProfileScope> = match config.granularity {
            RowGranularity::Team => vec![ProfileScope::all()],
            RowGranularity::TeamSeason => {
                let seasons: BTreeSet<&str> = views
                    .iter()
                    .filter(|v| v.observation.date <= as_of)
                    .map(|v| v.observation.season.as_str())
                    .collect();
                seasons.into_iter().map(ProfileScope::season).collect()
            }
        };

        for scope in scopes {
            let profile =
                match aggregate::aggregate_views(team, &views, &scope, config.preset, as_of) {
                    Ok(p) => p,
                    Err(EngineError::InsufficientData(_)) => continue,
                    Err(err) => return Err(err),
                };
            if profile.sample_size < config.min_matches_per_row {
                continue;
            }
            let values: Option<Vec<f64>> = features.iter().map(|k| profile.get(*k)).collect();
            match (values, profile.get(target)) {
                (Some(values), Some(target)) => rows.push(Row { values, target }),
                _ => dropped += 1,
            }
        }
    }
    Ok((rows, dropped))
}

fn r2(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    if actual.is_empty() {
        return None;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot <= f64::EPSILON {
        return None;
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Some(1.0 - ss_res / ss_tot)
}

/// Ordinary least squares with an intercept column, solved through the SVD.
fn ols(rows: &[&Row], p: usize) -> EngineResult<(f64, Vec<f64>)> {
    let n = rows.len();
    let x = DMatrix::from_fn(n, p + 1, |r, c| {
        if c == 0 { 1.0 } else { rows[r].values[c - 1] }
    });
    let y = DVector::from_iterator(n, rows.iter().map(|r| r.target));

    let svd = x.svd(true, true);
    let max_sv = svd.singular_values.max();
    let tol = max_sv * RANK_TOLERANCE;
    if max_sv <= 0.0 || svd.rank(tol) < p + 1 {
        return Err(EngineError::NumericDegenerate(format!(
            "design matrix is rank deficient ({n} rows, {} columns)",
            p + 1
        )));
    }
    let beta = svd
        .solve(&y, tol)
        .map_err(|e| EngineError::NumericDegenerate(e.to_string()))?;
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(EngineError::NumericDegenerate(
            "least squares produced non-finite coefficients".to_string(),
        ));
    }
    Ok((beta[0], beta.iter().skip(1).copied().collect()))
}

/// Fits the request against rows built from `snapshot` as of `as_of`.
///
/// The train/test split is a seeded shuffle of rows in team/season order, so identical data and
/// `random_state` always give identical coefficients.
pub fn fit(
    snapshot: &ObservationSnapshot,
    request: &RegressionRequest,
    config: &RegressionConfig,
    as_of: NaiveDate,
) -> EngineResult<RegressionFit> {
    config.validate()?;
    let (features, target) = request.validate()?;
    let (rows, dropped_rows) = build_rows(snapshot, &features, target, config, as_of)?;

    let p = features.len();
    if rows.len() < config.min_rows.max(2) {
        return Err(EngineError::InsufficientData(format!(
            "{} complete rows, need at least {}",
            rows.len(),
            config.min_rows.max(2)
        )));
    }
    let n = rows.len();
    let test_rows = ((n as f64 * request.test_size).round() as usize).clamp(1, n - 1);
    let train_rows = n - test_rows;
    if train_rows < p + 2 {
        return Err(EngineError::InsufficientData(format!(
            "{train_rows} training rows cannot fit {p} stats plus an intercept"
        )));
    }

    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(request.random_state);
    order.shuffle(&mut rng);
    let (test_idx, train_idx) = order.split_at(test_rows);
    let train: Vec<&Row> = train_idx.iter().map(|&i| &rows[i]).collect();
    let test: Vec<&Row> = test_idx.iter().map(|&i| &rows[i]).collect();

    let (intercept, coefficients) = ols(&train, p)?;
    let model = LinearModel {
        features: features.clone(),
        target,
        intercept,
        coefficients,
    };

    let score = |set: &[&Row]| {
        let actual: Vec<f64> = set.iter().map(|r| r.target).collect();
        let predicted: Vec<f64> = set.iter().map(|r| model.predict_values(&r.values)).collect();
        r2(&actual, &predicted)
    };
    let r2_score = score(&test);
    let train_r2 = score(&train);

    tracing::info!(
        target = %target,
        rows = n,
        train_rows,
        test_rows,
        r2 = ?r2_score,
        "fitted regression"
    );

    let report = RegressionReport {
        target,
        coefficients: features
            .iter()
            .copied()
            .zip(model.coefficients.iter().copied())
            .collect(),
        intercept,
        r2_score,
        train_r2,
        sample_size: n,
        train_rows,
        test_rows,
        dropped_rows,
        granularity: config.granularity,
        preset: config.preset,
        test_size: request.test_size,
        random_state: request.random_state,
        as_of,
    };
    Ok(RegressionFit { model, report })
}
