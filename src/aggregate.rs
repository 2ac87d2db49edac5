use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::decay::{self, DecayPreset};
use crate::error::{EngineError, EngineResult};
use crate::observations::{ObservationSnapshot, StatKey, TeamMatchView, normalize_name};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    #[default]
    All,
    Home,
    Away,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "referee", rename_all = "snake_case")]
pub enum RefereeFilter {
    #[default]
    Any,
    Only(String),
    Excluding(String),
}

/// Which of a team's fixtures a profile is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileScope {
    #[serde(default)]
    pub venue: Venue,
    #[serde(default)]
    pub referee: RefereeFilter,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub season: Option<String>,
}

impl ProfileScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_referee(referee: &str) -> Self {
        Self {
            referee: RefereeFilter::Only(referee.to_string()),
            ..Self::default()
        }
    }

    pub fn without_referee(referee: &str) -> Self {
        Self {
            referee: RefereeFilter::Excluding(referee.to_string()),
            ..Self::default()
        }
    }

    pub fn season(season: &str) -> Self {
        Self {
            season: Some(season.to_string()),
            ..Self::default()
        }
    }

    fn accepts(&self, view: &TeamMatchView<'_>) -> bool {
        match self.venue {
            Venue::All => {}
            Venue::Home if !view.is_home() => return false,
            Venue::Away if view.is_home() => return false,
            _ => {}
        }
        match &self.referee {
            RefereeFilter::Any => {}
            RefereeFilter::Only(r) => {
                if !view.observation.officiated_by(&normalize_name(r)) {
                    return false;
                }
            }
            RefereeFilter::Excluding(r) => {
                if view.observation.officiated_by(&normalize_name(r)) {
                    return false;
                }
            }
        }
        if self.from.is_some_and(|from| view.observation.date < from) {
            return false;
        }
        if let Some(season) = self.season.as_deref()
            && view.observation.season != season
        {
            return false;
        }
        true
    }
}

impl fmt::Display for ProfileScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let venue = match self.venue {
            Venue::All => "all venues",
            Venue::Home => "home",
            Venue::Away => "away",
        };
        write!(f, "{venue}")?;
        match &self.referee {
            RefereeFilter::Any => {}
            RefereeFilter::Only(r) => write!(f, ", referee {r}")?,
            RefereeFilter::Excluding(r) => write!(f, ", excluding referee {r}")?,
        }
        if let Some(season) = &self.season {
            write!(f, ", season {season}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTeamProfile {
    pub team: String,
    pub scope: ProfileScope,
    pub preset: DecayPreset,
    pub as_of: NaiveDate,
    /// Observations that contributed a non-zero weight.
    pub sample_size: usize,
    /// Σw over contributing observations.
    pub effective_sample_weight: f64,
    /// `None` marks a ratio whose weighted denominator is zero.
    pub weighted_stats: BTreeMap<StatKey, Option<f64>>,
    pub first_match: Option<NaiveDate>,
    pub last_match: Option<NaiveDate>,
}

impl WeightedTeamProfile {
    pub fn get(&self, key: StatKey) -> Option<f64> {
        self.weighted_stats.get(&key).copied().flatten()
    }

    pub fn undefined_stats(&self) -> Vec<StatKey> {
        self.weighted_stats
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| *k)
            .collect()
    }
}

// Weighted numerators and denominators. Ratios are formed from these sums only.
#[derive(Debug, Clone, Default)]
struct WeightedSums {
    count: usize,
    w: f64,
    shots: f64,
    shots_on_target: f64,
    goals: f64,
    fouls_committed: f64,
    fouls_drawn: f64,
    yellow_cards: f64,
    red_cards: f64,
    penalties_awarded: f64,
    penalty_attempts: f64,
    goals_conceded: f64,
    points: f64,
    wins: f64,
    w_xg: f64,
    xg: f64,
    shots_with_xg: f64,
    goals_with_xg: f64,
    w_xga: f64,
    xga: f64,
    w_xgd: f64,
    xgd: f64,
    w_poss: f64,
    possession: f64,
}

impl WeightedSums {
    fn push(&mut self, w: f64, view: &TeamMatchView<'_>) {
        let own = view.own;
        self.count += 1;
        self.w += w;
        self.shots += w * own.shots as f64;
        self.shots_on_target += w * own.shots_on_target as f64;
        self.goals += w * own.goals as f64;
        self.fouls_committed += w * own.fouls_committed as f64;
        self.fouls_drawn += w * own.fouls_drawn as f64;
        self.yellow_cards += w * own.yellow_cards as f64;
        self.red_cards += w * own.red_cards as f64;
        self.penalties_awarded += w * own.penalties_awarded as f64;
        self.penalty_attempts += w * own.penalty_attempts as f64;
        self.goals_conceded += w * view.goals_conceded() as f64;
        let points = view.points();
        self.points += w * points as f64;
        if points == 3 {
            self.wins += w;
        }

        if let Some(xg) = own.xg {
            self.w_xg += w;
            self.xg += w * xg;
            self.shots_with_xg += w * own.shots as f64;
            self.goals_with_xg += w * own.goals as f64;
        }
        let xga = view.opponent.and_then(|o| o.xg);
        if let Some(xga) = xga {
            self.w_xga += w;
            self.xga += w * xga;
        }
        if let (Some(xg), Some(xga)) = (own.xg, xga) {
            self.w_xgd += w;
            self.xgd += w * (xg - xga);
        }
        if let Some(p) = own.possession_percentage {
            self.w_poss += w;
            self.possession += w * p;
        }
    }

    fn stat(&self, key: StatKey) -> Option<f64> {
        match key {
            StatKey::Shots => ratio(self.shots, self.w),
            StatKey::ShotsOnTarget => ratio(self.shots_on_target, self.w),
            StatKey::Goals => ratio(self.goals, self.w),
            StatKey::Xg => ratio(self.xg, self.w_xg),
            StatKey::PossessionPercentage => ratio(self.possession, self.w_poss),
            StatKey::FoulsCommitted => ratio(self.fouls_committed, self.w),
            StatKey::FoulsDrawn => ratio(self.fouls_drawn, self.w),
            StatKey::YellowCards => ratio(self.yellow_cards, self.w),
            StatKey::RedCards => ratio(self.red_cards, self.w),
            StatKey::PenaltiesAwarded => ratio(self.penalties_awarded, self.w),
            StatKey::PenaltyAttempts => ratio(self.penalty_attempts, self.w),
            StatKey::GoalsConceded => ratio(self.goals_conceded, self.w),
            StatKey::XgConceded => ratio(self.xga, self.w_xga),
            StatKey::PointsPerGame => ratio(self.points, self.w),
            StatKey::WinRate => ratio(self.wins, self.w),
            StatKey::XgPerShot => ratio(self.xg, self.shots_with_xg),
            StatKey::ShotAccuracy => ratio(self.shots_on_target, self.shots),
            StatKey::ConversionRate => ratio(self.goals, self.shots),
            StatKey::GoalsPerXg => ratio(self.goals_with_xg, self.xg),
            StatKey::XgDifference => ratio(self.xgd, self.w_xgd),
        }
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 { Some(num / den) } else { None }
}

/// Builds a decay-weighted profile for `team` from the snapshot.
///
/// Observations dated after `as_of` are ignored. A scope with no positive weight yields
/// [`EngineError::InsufficientData`]; an unknown team yields [`EngineError::UnknownEntity`].
pub fn aggregate_team(
    snapshot: &ObservationSnapshot,
    team: &str,
    scope: &ProfileScope,
    preset: DecayPreset,
    as_of: NaiveDate,
) -> EngineResult<WeightedTeamProfile> {
    let views = snapshot.team_views(team)?;
    let display = snapshot.resolve_team(team).unwrap_or(team);
    aggregate_views(display, &views, scope, preset, as_of)
}

pub fn aggregate_views(
    team: &str,
    views: &[TeamMatchView<'_>],
    scope: &ProfileScope,
    preset: DecayPreset,
    as_of: NaiveDate,
) -> EngineResult<WeightedTeamProfile> {
    let mut sums = WeightedSums::default();
    let mut first_match: Option<NaiveDate> = None;
    let mut last_match: Option<NaiveDate> = None;

    for view in views {
        if !scope.accepts(view) {
            continue;
        }
        let age = decay::age_months(as_of, view.observation.date);
        if age < 0.0 {
            continue;
        }
        let w = preset.weight(age);
        if w <= 0.0 {
            continue;
        }
        sums.push(w, view);
        let date = view.observation.date;
        first_match = Some(first_match.map_or(date, |d| d.min(date)));
        last_match = Some(last_match.map_or(date, |d| d.max(date)));
    }

    if sums.w <= 0.0 {
        return Err(EngineError::InsufficientData(format!(
            "no eligible observations for {team} ({scope}, preset {preset}, as of {as_of})"
        )));
    }

    let weighted_stats = StatKey::ALL
        .into_iter()
        .map(|key| (key, sums.stat(key)))
        .collect();

    tracing::debug!(
        team = %team,
        scope = %scope,
        preset = %preset,
        samples = sums.count,
        effective = sums.w,
        "built weighted profile"
    );

    Ok(WeightedTeamProfile {
        team: team.to_string(),
        scope: scope.clone(),
        preset,
        as_of,
        sample_size: sums.count,
        effective_sample_weight: sums.w,
        weighted_stats,
        first_match,
        last_match,
    })
}
