use std::collections::BTreeMap;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{self, ProfileScope, WeightedTeamProfile};
use crate::config::RbsConfig;
use crate::decay::DecayPreset;
use crate::error::{EngineError, EngineResult};
use crate::observations::{ObservationSnapshot, StatKey, normalize_name};

/// Shared parameters of one scoring call or batch run.
#[derive(Debug, Clone, Copy)]
pub struct RbsRun<'a> {
    pub preset: DecayPreset,
    pub as_of: NaiveDate,
    pub config_name: &'a str,
    pub config: &'a RbsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RbsStatus {
    Scored,
    InsufficientData { reason: String },
}

/// One configured stat's contribution to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbsComponent {
    pub stat: StatKey,
    pub referee_value: Option<f64>,
    pub baseline_value: Option<f64>,
    /// `referee_value - baseline_value`.
    pub differential: Option<f64>,
    /// Differential divided by its scale and oriented so positive favours the team.
    pub normalized: Option<f64>,
    pub weight: f64,
    pub contribution: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbsResult {
    pub team: String,
    pub referee: String,
    pub preset: DecayPreset,
    pub as_of: NaiveDate,
    pub config_used: String,
    #[serde(flatten)]
    pub status: RbsStatus,
    /// Positive when the referee's presence correlates with outcomes favourable to the team.
    pub rbs_score: Option<f64>,
    pub confidence_level: Option<f64>,
    /// Signed raw differential for every configured stat; `None` when either side is undefined.
    pub stats_breakdown: BTreeMap<StatKey, Option<f64>>,
    pub components: Vec<RbsComponent>,
    pub matches_with_ref: usize,
    pub effective_matches_with_ref: f64,
    pub baseline_matches: usize,
    pub effective_baseline_matches: f64,
}

impl RbsResult {
    pub fn is_scored(&self) -> bool {
        self.status == RbsStatus::Scored
    }

    pub fn insufficient_reason(&self) -> Option<&str> {
        match &self.status {
            RbsStatus::Scored => None,
            RbsStatus::InsufficientData { reason } => Some(reason),
        }
    }
}

/// Confidence grows with the effective referee sample and saturates towards the maximum.
pub fn confidence_for(effective_matches: f64, config: &RbsConfig) -> f64 {
    let span = config.max_confidence - config.min_confidence;
    let raw = config.min_confidence
        + span * (1.0 - (-effective_matches.max(0.0) / config.confidence_scale).exp());
    raw.clamp(config.min_confidence, config.max_confidence)
}

/// Scores how `team`'s weighted profile shifts under `referee` relative to its other fixtures.
///
/// Unknown team or referee names are errors. A referee with too few fixtures for the team is
/// not an error: the result carries [`RbsStatus::InsufficientData`] and no score.
pub fn score_bias(
    snapshot: &ObservationSnapshot,
    team: &str,
    referee: &str,
    run: RbsRun<'_>,
) -> EngineResult<RbsResult> {
    run.config.validate()?;
    let views = snapshot.team_views(team)?;
    let team_name = snapshot.resolve_team(team).unwrap_or(team);
    let Some(referee_name) = snapshot.resolve_referee(referee) else {
        return Err(EngineError::referee_not_found(referee));
    };
    let referee_norm = normalize_name(referee_name);

    let referee_profile = optional_profile(aggregate::aggregate_views(
        team_name,
        &views,
        &ProfileScope::with_referee(referee_name),
        run.preset,
        run.as_of,
    ))?;
    let baseline_profile = optional_profile(aggregate::aggregate_views(
        team_name,
        &views,
        &ProfileScope::without_referee(referee_name),
        run.preset,
        run.as_of,
    ))?;

    let components: Vec<RbsComponent> = run
        .config
        .stats
        .iter()
        .map(|s| {
            let referee_value = referee_profile.as_ref().and_then(|p| p.get(s.stat));
            let baseline_value = baseline_profile.as_ref().and_then(|p| p.get(s.stat));
            let differential = referee_value.zip(baseline_value).map(|(r, b)| r - b);
            let normalized = differential.map(|d| s.favorable.sign() * d / s.scale);
            RbsComponent {
                stat: s.stat,
                referee_value,
                baseline_value,
                differential,
                normalized,
                weight: s.weight,
                contribution: normalized.map(|n| n * s.weight),
            }
        })
        .collect();
    let stats_breakdown = components.iter().map(|c| (c.stat, c.differential)).collect();

    let officiated = views
        .iter()
        .filter(|v| v.observation.date <= run.as_of && v.observation.officiated_by(&referee_norm))
        .count();
    // Only fixtures the preset still weights count towards the minimums.
    let matches_with_ref = contributing(&referee_profile);
    let baseline_matches = contributing(&baseline_profile);
    let effective_ref = effective(&referee_profile);
    let effective_base = effective(&baseline_profile);
    let defined: Vec<f64> = components.iter().filter_map(|c| c.contribution).collect();

    let insufficient = if officiated == 0 {
        Some(format!("{referee_name} has not officiated {team_name}"))
    } else if matches_with_ref < run.config.min_matches_with_ref {
        Some(format!(
            "{matches_with_ref} weighted matches with {referee_name} ({officiated} on record, \
             preset {}), need {}",
            run.preset, run.config.min_matches_with_ref
        ))
    } else if baseline_matches < run.config.min_baseline_matches {
        Some(format!(
            "{baseline_matches} weighted baseline matches without {referee_name}, need {}",
            run.config.min_baseline_matches
        ))
    } else if defined.is_empty() {
        Some("no configured stat is defined on both sides".to_string())
    } else {
        None
    };

    let (status, rbs_score, confidence_level) = match insufficient {
        Some(reason) => (RbsStatus::InsufficientData { reason }, None, None),
        None => (
            RbsStatus::Scored,
            Some(defined.iter().sum::<f64>()),
            Some(confidence_for(effective_ref, run.config)),
        ),
    };

    tracing::debug!(
        team = %team_name,
        referee = %referee_name,
        matches_with_ref,
        score = ?rbs_score,
        "scored referee bias"
    );

    Ok(RbsResult {
        team: team_name.to_string(),
        referee: referee_name.to_string(),
        preset: run.preset,
        as_of: run.as_of,
        config_used: run.config_name.to_string(),
        status,
        rbs_score,
        confidence_level,
        stats_breakdown,
        components,
        matches_with_ref,
        effective_matches_with_ref: effective_ref,
        baseline_matches,
        effective_baseline_matches: effective_base,
    })
}

// An empty scope is a normal outcome here; other failures propagate.
fn optional_profile(
    res: EngineResult<WeightedTeamProfile>,
) -> EngineResult<Option<WeightedTeamProfile>> {
    match res {
        Ok(profile) => Ok(Some(profile)),
        Err(EngineError::InsufficientData(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn contributing(profile: &Option<WeightedTeamProfile>) -> usize {
    profile.as_ref().map_or(0, |p| p.sample_size)
}

fn effective(profile: &Option<WeightedTeamProfile>) -> f64 {
    profile.as_ref().map_or(0.0, |p| p.effective_sample_weight)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbsBatch {
    pub preset: DecayPreset,
    pub as_of: NaiveDate,
    pub config_used: String,
    pub scored: usize,
    pub insufficient: usize,
    pub results: Vec<RbsResult>,
}

/// Scores every (team, referee) pair in the snapshot. Either every pair is scored or the
/// whole batch fails; results are ordered by team then referee.
pub fn recalculate_all(snapshot: &ObservationSnapshot, run: RbsRun<'_>) -> EngineResult<RbsBatch> {
    let pairs = snapshot.team_referee_pairs();
    tracing::info!(
        pairs = pairs.len(),
        preset = %run.preset,
        as_of = %run.as_of,
        "recalculating referee bias scores"
    );

    let results: Vec<RbsResult> = pairs
        .par_iter()
        .map(|(team, referee)| score_bias(snapshot, team, referee, run))
        .collect::<EngineResult<Vec<_>>>()?;

    let scored = results.iter().filter(|r| r.is_scored()).count();
    let insufficient = results.len() - scored;
    tracing::info!(scored, insufficient, "referee bias recalculation finished");

    Ok(RbsBatch {
        preset: run.preset,
        as_of: run.as_of,
        config_used: run.config_name.to_string(),
        scored,
        insufficient,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::{MatchObservation, TeamMatchStat};

    struct Fx {
        day: u32,
        referee: &'static str,
        yellows: u32,
        fouls_drawn: u32,
    }

    fn snapshot(fixtures: &[Fx]) -> ObservationSnapshot {
        let mut matches = Vec::new();
        let mut rows = Vec::new();
        for (i, fx) in fixtures.iter().enumerate() {
            let id = format!("m{i}");
            matches.push(MatchObservation {
                match_id: id.clone(),
                date: NaiveDate::from_ymd_opt(2024, 1, fx.day).unwrap(),
                home_team: "Rovers".to_string(),
                away_team: format!("Opp {i}"),
                referee: Some(fx.referee.to_string()),
                competition: "League".to_string(),
                season: "2023/24".to_string(),
                home_score: 1,
                away_score: 1,
            });
            rows.push(TeamMatchStat {
                match_id: id,
                team: "Rovers".to_string(),
                is_home: true,
                shots: 10,
                shots_on_target: 4,
                goals: 1,
                xg: Some(1.0),
                possession_percentage: Some(50.0),
                fouls_committed: 10,
                fouls_drawn: fx.fouls_drawn,
                yellow_cards: fx.yellows,
                red_cards: 0,
                penalties_awarded: 0,
                penalty_attempts: 0,
            });
        }
        ObservationSnapshot::new(matches, rows).unwrap()
    }

    fn run(config: &RbsConfig) -> RbsRun<'_> {
        RbsRun {
            preset: DecayPreset::None,
            as_of: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            config_name: "default",
            config,
        }
    }

    fn fx(day: u32, referee: &'static str, yellows: u32, fouls_drawn: u32) -> Fx {
        Fx {
            day,
            referee,
            yellows,
            fouls_drawn,
        }
    }

    #[test]
    fn lenient_referee_scores_positive() {
        let snap = snapshot(&[
            fx(1, "Kind", 0, 14),
            fx(3, "Kind", 1, 14),
            fx(5, "Kind", 0, 14),
            fx(7, "Strict", 3, 8),
            fx(9, "Strict", 3, 8),
            fx(11, "Strict", 3, 8),
        ]);
        let cfg = RbsConfig::default();
        let res = score_bias(&snap, "rovers", "kind", run(&cfg)).unwrap();
        assert!(res.is_scored());
        assert_eq!(res.referee, "Kind");
        assert_eq!(res.matches_with_ref, 3);
        let score = res.rbs_score.unwrap();
        assert!(score > 0.0, "score {score}");
        let yellow = res.stats_breakdown[&StatKey::YellowCards].unwrap();
        assert!((yellow - (1.0 / 3.0 - 3.0)).abs() < 1e-9);
        // identical on both sides, so genuinely neutral
        assert_eq!(res.stats_breakdown[&StatKey::FoulsCommitted], Some(0.0));

        let strict = score_bias(&snap, "Rovers", "Strict", run(&cfg)).unwrap();
        assert!(strict.rbs_score.unwrap() < 0.0);
    }

    #[test]
    fn never_officiated_is_insufficient_not_zero() {
        let snap = snapshot(&[
            fx(1, "Kind", 0, 10),
            fx(3, "Kind", 0, 10),
            fx(5, "Kind", 0, 10),
        ]);
        let mut other = snapshot(&[fx(1, "Other", 0, 10)]).to_document();
        let mut doc = snap.to_document();
        // Referee known to the snapshot but never in a Rovers fixture.
        other.matches[0].match_id = "x".to_string();
        other.matches[0].home_team = "City".to_string();
        other.team_stats.clear();
        doc.matches.extend(other.matches);
        let snap = ObservationSnapshot::from_document(doc).unwrap();

        let cfg = RbsConfig::default();
        let res = score_bias(&snap, "Rovers", "Other", run(&cfg)).unwrap();
        assert_eq!(res.matches_with_ref, 0);
        assert!(!res.is_scored());
        assert!(res.rbs_score.is_none());
        assert!(res.confidence_level.is_none());
        for s in &cfg.stats {
            assert_eq!(res.stats_breakdown.get(&s.stat), Some(&None));
        }
    }

    #[test]
    fn unknown_referee_is_an_error() {
        let snap = snapshot(&[fx(1, "Kind", 0, 10)]);
        let cfg = RbsConfig::default();
        let err = score_bias(&snap, "Rovers", "Nobody", run(&cfg)).unwrap_err();
        assert_eq!(err, EngineError::referee_not_found("Nobody"));
    }

    #[test]
    fn below_minimum_keeps_breakdown_but_no_score() {
        let snap = snapshot(&[
            fx(1, "Kind", 0, 14),
            fx(7, "Strict", 3, 8),
            fx(9, "Strict", 3, 8),
            fx(11, "Strict", 3, 8),
        ]);
        let cfg = RbsConfig::default();
        let res = score_bias(&snap, "Rovers", "Kind", run(&cfg)).unwrap();
        assert_eq!(res.matches_with_ref, 1);
        assert!(res.insufficient_reason().unwrap().contains("need 3"));
        assert_eq!(res.stats_breakdown.len(), cfg.stats.len());
        assert_eq!(res.stats_breakdown[&StatKey::YellowCards], Some(-3.0));
    }

    #[test]
    fn zero_weight_fixtures_do_not_count_towards_minimum() {
        // Linear decay zeroes anything older than ten months; only the day-29 Kind match survives.
        let snap = snapshot(&[
            fx(1, "Kind", 0, 14),
            fx(2, "Kind", 0, 14),
            fx(29, "Kind", 0, 14),
            fx(25, "Strict", 3, 8),
            fx(27, "Strict", 3, 8),
            fx(28, "Strict", 3, 8),
        ]);
        let cfg = RbsConfig::default();
        let linear = RbsRun {
            preset: DecayPreset::Linear,
            as_of: NaiveDate::from_ymd_opt(2024, 11, 15).unwrap(),
            ..run(&cfg)
        };
        let res = score_bias(&snap, "Rovers", "Kind", linear).unwrap();
        assert!(!res.is_scored());
        assert_eq!(res.rbs_score, None);
        assert_eq!(res.matches_with_ref, 1);
        assert_eq!(res.baseline_matches, 3);
        assert!(res.effective_matches_with_ref < 0.1);
        let reason = res.insufficient_reason().unwrap();
        assert!(reason.contains("3 on record"), "{reason}");

        let flat = score_bias(&snap, "Rovers", "Kind", run(&cfg)).unwrap();
        assert!(flat.is_scored());
        assert_eq!(flat.matches_with_ref, 3);
    }

    #[test]
    fn invalid_config_is_rejected_before_scoring() {
        let snap = snapshot(&[
            fx(1, "Kind", 0, 14),
            fx(3, "Kind", 1, 14),
            fx(5, "Kind", 0, 14),
            fx(7, "Strict", 3, 8),
            fx(9, "Strict", 3, 8),
            fx(11, "Strict", 3, 8),
        ]);
        let mut cfg = RbsConfig::default();
        cfg.stats[0].scale = 0.0;
        let err = score_bias(&snap, "Rovers", "Kind", run(&cfg)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn confidence_is_monotone_and_bounded() {
        let cfg = RbsConfig::default();
        let mut prev = confidence_for(0.0, &cfg);
        assert_eq!(prev, cfg.min_confidence);
        for n in 1..60 {
            let c = confidence_for(n as f64, &cfg);
            assert!(c >= prev);
            assert!(c <= cfg.max_confidence);
            prev = c;
        }
    }

    #[test]
    fn batch_is_sorted_and_repeatable() {
        let snap = snapshot(&[
            fx(1, "Kind", 0, 14),
            fx(3, "Kind", 1, 14),
            fx(5, "Kind", 0, 14),
            fx(7, "Strict", 3, 8),
            fx(9, "Strict", 3, 8),
            fx(11, "Strict", 3, 8),
        ]);
        let cfg = RbsConfig::default();
        let a = recalculate_all(&snap, run(&cfg)).unwrap();
        let b = recalculate_all(&snap, run(&cfg)).unwrap();
        assert_eq!(a, b);
        let keys: Vec<(&str, &str)> = a
            .results
            .iter()
            .map(|r| (r.team.as_str(), r.referee.as_str()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(a.scored + a.insufficient, a.results.len());
    }
}
