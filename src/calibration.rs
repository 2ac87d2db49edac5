use chrono::{Days, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::decay::DecayPreset;
use crate::error::{EngineError, EngineResult};
use crate::observations::{MatchObservation, ObservationSnapshot};
use crate::predict::{PredictionEngine, PredictionRequest};
use crate::win_prob::OutcomeProbs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

pub fn classify_outcome(home_goals: u32, away_goals: u32) -> Outcome {
    if home_goals > away_goals {
        Outcome::Home
    } else if home_goals < away_goals {
        Outcome::Away
    } else {
        Outcome::Draw
    }
}

pub fn empirical_outcome_probs(outcomes: &[Outcome]) -> OutcomeProbs {
    if outcomes.is_empty() {
        return OutcomeProbs::uniform();
    }

    let mut home = 0usize;
    let mut draw = 0usize;
    let mut away = 0usize;
    for outcome in outcomes {
        match outcome {
            Outcome::Home => home += 1,
            Outcome::Draw => draw += 1,
            Outcome::Away => away += 1,
        }
    }
    let n = outcomes.len() as f64;
    OutcomeProbs {
        home: home as f64 / n,
        draw: draw as f64 / n,
        away: away as f64 / n,
    }
}

pub fn evaluate_probs(predictions: &[OutcomeProbs], outcomes: &[Outcome]) -> Metrics {
    if predictions.is_empty() || outcomes.is_empty() || predictions.len() != outcomes.len() {
        return Metrics {
            samples: 0,
            brier: 0.0,
            log_loss: 0.0,
            accuracy: 0.0,
        };
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let y = one_hot(*outcome);
        brier_sum +=
            (p.home - y.home).powi(2) + (p.draw - y.draw).powi(2) + (p.away - y.away).powi(2);

        let actual_prob = class_prob(*p, *outcome).clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();

        if argmax(*p) == *outcome {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}

pub fn calibration_bins(
    predictions: &[OutcomeProbs],
    outcomes: &[Outcome],
    class: Outcome,
    bins: usize,
) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let prob = class_prob(*p, class).clamp(0.0, 1.0);
        let idx = ((prob * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += prob;
        if *outcome == class {
            actual_sum[idx] += 1.0;
        }
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

fn class_prob(p: OutcomeProbs, class: Outcome) -> f64 {
    match class {
        Outcome::Home => p.home,
        Outcome::Draw => p.draw,
        Outcome::Away => p.away,
    }
}

fn argmax(p: OutcomeProbs) -> Outcome {
    if p.home >= p.draw && p.home >= p.away {
        Outcome::Home
    } else if p.draw >= p.away {
        Outcome::Draw
    } else {
        Outcome::Away
    }
}

fn one_hot(outcome: Outcome) -> OutcomeProbs {
    match outcome {
        Outcome::Home => OutcomeProbs {
            home: 1.0,
            draw: 0.0,
            away: 0.0,
        },
        Outcome::Draw => OutcomeProbs {
            home: 0.0,
            draw: 1.0,
            away: 0.0,
        },
        Outcome::Away => OutcomeProbs {
            home: 0.0,
            draw: 0.0,
            away: 1.0,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestOptions {
    /// First match date to predict; earlier matches only feed history.
    pub from: NaiveDate,
    pub preset: DecayPreset,
    pub config: Option<String>,
    pub use_referee: bool,
    pub ensemble: bool,
}

impl BacktestOptions {
    pub fn new(from: NaiveDate) -> Self {
        Self {
            from,
            preset: DecayPreset::None,
            config: None,
            use_referee: true,
            ensemble: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRow {
    pub match_id: String,
    pub date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub predicted: OutcomeProbs,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSkip {
    pub match_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub preset: DecayPreset,
    pub metrics: Metrics,
    /// Constant prior from results before `from`.
    pub baseline: Metrics,
    pub draw_bins: Vec<CalibrationBin>,
    pub rows: Vec<BacktestRow>,
    pub skipped: Vec<BacktestSkip>,
}

/// Predicts every match on or after `options.from` using only observations dated before it.
///
/// Matches whose teams have no usable history before kick-off are skipped and listed.
pub fn backtest(
    snapshot: &ObservationSnapshot,
    configs: &ConfigStore,
    options: &BacktestOptions,
) -> EngineResult<BacktestReport> {
    let targets: Vec<&MatchObservation> = snapshot
        .matches()
        .iter()
        .filter(|m| m.date >= options.from)
        .collect();

    let results: Vec<Result<BacktestRow, BacktestSkip>> = targets
        .par_iter()
        .map(|m| predict_one(snapshot, configs, options, m))
        .collect::<EngineResult<Vec<_>>>()?;

    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for res in results {
        match res {
            Ok(row) => rows.push(row),
            Err(skip) => skipped.push(skip),
        }
    }
    if rows.is_empty() {
        return Err(EngineError::InsufficientData(format!(
            "no predictable matches on or after {} ({} skipped)",
            options.from,
            skipped.len()
        )));
    }

    let predictions: Vec<OutcomeProbs> = rows.iter().map(|r| r.predicted).collect();
    let outcomes: Vec<Outcome> = rows.iter().map(|r| r.outcome).collect();
    let history: Vec<Outcome> = snapshot
        .matches()
        .iter()
        .filter(|m| m.date < options.from)
        .map(|m| classify_outcome(m.home_score, m.away_score))
        .collect();
    let prior = empirical_outcome_probs(&history);

    let metrics = evaluate_probs(&predictions, &outcomes);
    let baseline = evaluate_probs(&vec![prior; outcomes.len()], &outcomes);
    tracing::info!(
        samples = metrics.samples,
        skipped = skipped.len(),
        brier = metrics.brier,
        baseline_brier = baseline.brier,
        "backtest finished"
    );

    Ok(BacktestReport {
        preset: options.preset,
        metrics,
        baseline,
        draw_bins: calibration_bins(&predictions, &outcomes, Outcome::Draw, 10),
        rows,
        skipped,
    })
}

fn predict_one(
    snapshot: &ObservationSnapshot,
    configs: &ConfigStore,
    options: &BacktestOptions,
    m: &MatchObservation,
) -> EngineResult<Result<BacktestRow, BacktestSkip>> {
    let skip = |reason: String| -> EngineResult<Result<BacktestRow, BacktestSkip>> {
        Ok(Err(BacktestSkip {
            match_id: m.match_id.clone(),
            reason,
        }))
    };
    let Some(as_of) = m.date.checked_sub_days(Days::new(1)) else {
        return skip("match date has no previous day".to_string());
    };

    let mut request = PredictionRequest::new(&m.home_team, &m.away_team);
    request.preset = Some(options.preset);
    request.config = options.config.clone();
    request.ensemble = options.ensemble;
    if options.use_referee {
        request.referee = m.referee.clone();
    }

    let engine = PredictionEngine::new(snapshot, configs, as_of);
    match engine.predict(&request) {
        Ok(result) => Ok(Ok(BacktestRow {
            match_id: m.match_id.clone(),
            date: m.date,
            home_team: result.home_team.clone(),
            away_team: result.away_team.clone(),
            predicted: result.probabilities(),
            outcome: classify_outcome(m.home_score, m.away_score),
        })),
        Err(err @ (EngineError::InsufficientData(_) | EngineError::NumericDegenerate(_))) => {
            skip(err.to_string())
        }
        Err(err) => Err(err),
    }
}
