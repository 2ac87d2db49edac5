use std::collections::{BTreeSet, HashMap};
use std::fmt;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchObservation {
    pub match_id: String,
    pub date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub referee: Option<String>,
    #[serde(default)]
    pub competition: String,
    #[serde(default)]
    pub season: String,
    pub home_score: u32,
    pub away_score: u32,
}

impl MatchObservation {
    pub fn involves(&self, team_norm: &str) -> bool {
        normalize_name(&self.home_team) == team_norm || normalize_name(&self.away_team) == team_norm
    }

    pub fn officiated_by(&self, referee_norm: &str) -> bool {
        self.referee
            .as_deref()
            .is_some_and(|r| normalize_name(r) == referee_norm)
    }

    /// Goals (for, against) from the side's perspective.
    pub fn score_for(&self, is_home: bool) -> (u32, u32) {
        if is_home {
            (self.home_score, self.away_score)
        } else {
            (self.away_score, self.home_score)
        }
    }
}

/// Raw per-match counters for one side. Derived ratios are methods, never stored.
///
/// `fouls` and `possession_pct` are accepted as input aliases; a row carrying both an alias and
/// its canonical name is rejected as a duplicate field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamMatchStat {
    pub match_id: String,
    pub team: String,
    pub is_home: bool,
    #[serde(default)]
    pub shots: u32,
    #[serde(default)]
    pub shots_on_target: u32,
    #[serde(default)]
    pub goals: u32,
    #[serde(default)]
    pub xg: Option<f64>,
    #[serde(default, alias = "possession_pct")]
    pub possession_percentage: Option<f64>,
    #[serde(default, alias = "fouls")]
    pub fouls_committed: u32,
    #[serde(default)]
    pub fouls_drawn: u32,
    #[serde(default)]
    pub yellow_cards: u32,
    #[serde(default)]
    pub red_cards: u32,
    #[serde(default)]
    pub penalties_awarded: u32,
    #[serde(default)]
    pub penalty_attempts: u32,
}

impl TeamMatchStat {
    pub fn xg_per_shot(&self) -> Option<f64> {
        let xg = self.xg?;
        ratio(xg, self.shots as f64)
    }

    pub fn shot_accuracy(&self) -> Option<f64> {
        ratio(self.shots_on_target as f64, self.shots as f64)
    }

    pub fn conversion_rate(&self) -> Option<f64> {
        ratio(self.goals as f64, self.shots as f64)
    }

    pub fn goals_per_xg(&self) -> Option<f64> {
        ratio(self.goals as f64, self.xg?)
    }

    /// Alias kept numerically identical to `fouls_committed`.
    pub fn fouls(&self) -> u32 {
        self.fouls_committed
    }

    /// Alias kept numerically identical to `possession_percentage`.
    pub fn possession_pct(&self) -> Option<f64> {
        self.possession_percentage
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 { Some(num / den) } else { None }
}

/// Every statistic a weighted profile can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKey {
    Shots,
    ShotsOnTarget,
    Goals,
    Xg,
    #[serde(alias = "possession_pct", alias = "possession")]
    PossessionPercentage,
    #[serde(alias = "fouls")]
    FoulsCommitted,
    FoulsDrawn,
    YellowCards,
    RedCards,
    PenaltiesAwarded,
    PenaltyAttempts,
    GoalsConceded,
    XgConceded,
    PointsPerGame,
    WinRate,
    XgPerShot,
    ShotAccuracy,
    ConversionRate,
    GoalsPerXg,
    XgDifference,
}

impl StatKey {
    pub const ALL: [StatKey; 20] = [
        StatKey::Shots,
        StatKey::ShotsOnTarget,
        StatKey::Goals,
        StatKey::Xg,
        StatKey::PossessionPercentage,
        StatKey::FoulsCommitted,
        StatKey::FoulsDrawn,
        StatKey::YellowCards,
        StatKey::RedCards,
        StatKey::PenaltiesAwarded,
        StatKey::PenaltyAttempts,
        StatKey::GoalsConceded,
        StatKey::XgConceded,
        StatKey::PointsPerGame,
        StatKey::WinRate,
        StatKey::XgPerShot,
        StatKey::ShotAccuracy,
        StatKey::ConversionRate,
        StatKey::GoalsPerXg,
        StatKey::XgDifference,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatKey::Shots => "shots",
            StatKey::ShotsOnTarget => "shots_on_target",
            StatKey::Goals => "goals",
            StatKey::Xg => "xg",
            StatKey::PossessionPercentage => "possession_percentage",
            StatKey::FoulsCommitted => "fouls_committed",
            StatKey::FoulsDrawn => "fouls_drawn",
            StatKey::YellowCards => "yellow_cards",
            StatKey::RedCards => "red_cards",
            StatKey::PenaltiesAwarded => "penalties_awarded",
            StatKey::PenaltyAttempts => "penalty_attempts",
            StatKey::GoalsConceded => "goals_conceded",
            StatKey::XgConceded => "xg_conceded",
            StatKey::PointsPerGame => "points_per_game",
            StatKey::WinRate => "win_rate",
            StatKey::XgPerShot => "xg_per_shot",
            StatKey::ShotAccuracy => "shot_accuracy",
            StatKey::ConversionRate => "conversion_rate",
            StatKey::GoalsPerXg => "goals_per_xg",
            StatKey::XgDifference => "xg_difference",
        }
    }

    /// Accepts canonical names and the input aliases (`fouls`, `possession_pct`, `possession`).
    pub fn parse(raw: &str) -> Option<StatKey> {
        let key = raw.trim().to_ascii_lowercase();
        match key.as_str() {
            "fouls" => return Some(StatKey::FoulsCommitted),
            "possession_pct" | "possession" => return Some(StatKey::PossessionPercentage),
            _ => {}
        }
        StatKey::ALL.into_iter().find(|k| k.name() == key)
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read filter for observation sources. Team and referee filters select fixtures; both sides'
/// stat rows of a selected fixture are always returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationQuery {
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub referee: Option<String>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl ObservationQuery {
    pub fn accepts(&self, m: &MatchObservation) -> bool {
        if let Some(team) = self.team.as_deref()
            && !m.involves(&normalize_name(team))
        {
            return false;
        }
        if let Some(referee) = self.referee.as_deref()
            && !m.officiated_by(&normalize_name(referee))
        {
            return false;
        }
        if self.from.is_some_and(|from| m.date < from) {
            return false;
        }
        if self.to.is_some_and(|to| m.date > to) {
            return false;
        }
        true
    }
}

/// Wire/document form of a snapshot (JSON import, remote fetch).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub matches: Vec<MatchObservation>,
    #[serde(default)]
    pub team_stats: Vec<TeamMatchStat>,
}

/// One team's view of one fixture: the fixture, its own stat row and the opponent's row.
#[derive(Debug, Clone, Copy)]
pub struct TeamMatchView<'a> {
    pub observation: &'a MatchObservation,
    pub own: &'a TeamMatchStat,
    pub opponent: Option<&'a TeamMatchStat>,
}

impl TeamMatchView<'_> {
    pub fn is_home(&self) -> bool {
        self.own.is_home
    }

    pub fn goals_conceded(&self) -> u32 {
        self.observation.score_for(self.own.is_home).1
    }

    pub fn points(&self) -> u32 {
        let (gf, ga) = self.observation.score_for(self.own.is_home);
        match gf.cmp(&ga) {
            std::cmp::Ordering::Greater => 3,
            std::cmp::Ordering::Equal => 1,
            std::cmp::Ordering::Less => 0,
        }
    }

    pub fn opponent_name(&self) -> &str {
        if self.own.is_home {
            &self.observation.away_team
        } else {
            &self.observation.home_team
        }
    }
}

/// Immutable, validated set of observations. Shared read-only across concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct ObservationSnapshot {
    matches: Vec<MatchObservation>,
    match_index: HashMap<String, usize>,
    rows: Vec<TeamMatchStat>,
    // match index -> [home row, away row]
    sides: Vec<[Option<usize>; 2]>,
    teams: HashMap<String, String>,
    referees: HashMap<String, String>,
}

impl ObservationSnapshot {
    pub fn new(mut matches: Vec<MatchObservation>, rows: Vec<TeamMatchStat>) -> Result<Self> {
        matches.sort_by(|a, b| a.date.cmp(&b.date).then(a.match_id.cmp(&b.match_id)));

        let mut match_index = HashMap::with_capacity(matches.len());
        let mut teams = HashMap::new();
        let mut referees = HashMap::new();
        for (idx, m) in matches.iter().enumerate() {
            if m.match_id.trim().is_empty() {
                return Err(anyhow!("match with empty match_id on {}", m.date));
            }
            if match_index.insert(m.match_id.clone(), idx).is_some() {
                return Err(anyhow!("duplicate match_id {}", m.match_id));
            }
            let home = normalize_name(&m.home_team);
            let away = normalize_name(&m.away_team);
            if home.is_empty() || away.is_empty() || home == away {
                return Err(anyhow!("match {} has invalid teams", m.match_id));
            }
            teams.entry(home).or_insert_with(|| m.home_team.trim().to_string());
            teams.entry(away).or_insert_with(|| m.away_team.trim().to_string());
            if let Some(r) = m.referee.as_deref() {
                let norm = normalize_name(r);
                if !norm.is_empty() {
                    referees.entry(norm).or_insert_with(|| r.trim().to_string());
                }
            }
        }

        let mut sides = vec![[None, None]; matches.len()];
        for (row_idx, row) in rows.iter().enumerate() {
            let Some(&m_idx) = match_index.get(&row.match_id) else {
                return Err(anyhow!("stat row references unknown match {}", row.match_id));
            };
            let m = &matches[m_idx];
            let expected = if row.is_home { &m.home_team } else { &m.away_team };
            if normalize_name(expected) != normalize_name(&row.team) {
                return Err(anyhow!(
                    "stat row for {} in match {} does not match the {} side",
                    row.team,
                    row.match_id,
                    if row.is_home { "home" } else { "away" }
                ));
            }
            let slot = &mut sides[m_idx][usize::from(!row.is_home)];
            if slot.is_some() {
                return Err(anyhow!(
                    "duplicate stat row for {} in match {}",
                    row.team,
                    row.match_id
                ));
            }
            *slot = Some(row_idx);
        }

        Ok(Self {
            matches,
            match_index,
            rows,
            sides,
            teams,
            referees,
        })
    }

    pub fn from_document(doc: SnapshotDocument) -> Result<Self> {
        Self::new(doc.matches, doc.team_stats)
    }

    pub fn to_document(&self) -> SnapshotDocument {
        SnapshotDocument {
            matches: self.matches.clone(),
            team_stats: self.rows.clone(),
        }
    }

    pub fn matches(&self) -> &[MatchObservation] {
        &self.matches
    }

    pub fn rows(&self) -> &[TeamMatchStat] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn observation(&self, match_id: &str) -> Option<&MatchObservation> {
        self.match_index.get(match_id).map(|&idx| &self.matches[idx])
    }

    /// Canonical display name for a team, looked up case/punctuation-insensitively.
    pub fn resolve_team(&self, name: &str) -> Option<&str> {
        self.teams.get(&normalize_name(name)).map(String::as_str)
    }

    pub fn resolve_referee(&self, name: &str) -> Option<&str> {
        self.referees.get(&normalize_name(name)).map(String::as_str)
    }

    pub fn teams(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.teams.values().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    pub fn referees(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.referees.values().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    /// Every (team, referee) pair where the referee officiated at least one of the team's
    /// fixtures that has a stat row for the team. Sorted.
    pub fn team_referee_pairs(&self) -> Vec<(String, String)> {
        let mut out = BTreeSet::new();
        for (m_idx, m) in self.matches.iter().enumerate() {
            let Some(referee) = m.referee.as_deref().and_then(|r| self.resolve_referee(r)) else {
                continue;
            };
            for row_idx in self.sides[m_idx].iter().flatten() {
                let team = &self.rows[*row_idx].team;
                if let Some(team) = self.resolve_team(team) {
                    out.insert((team.to_string(), referee.to_string()));
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn team_views(&self, team: &str) -> EngineResult<Vec<TeamMatchView<'_>>> {
        let norm = normalize_name(team);
        if !self.teams.contains_key(&norm) {
            return Err(EngineError::team_not_found(team));
        }
        let mut out = Vec::new();
        for (m_idx, m) in self.matches.iter().enumerate() {
            let [home, away] = self.sides[m_idx];
            let (own, opponent) = if normalize_name(&m.home_team) == norm {
                (home, away)
            } else if normalize_name(&m.away_team) == norm {
                (away, home)
            } else {
                continue;
            };
            let Some(own) = own else {
                continue;
            };
            out.push(TeamMatchView {
                observation: m,
                own: &self.rows[own],
                opponent: opponent.map(|idx| &self.rows[idx]),
            });
        }
        Ok(out)
    }

    /// A new snapshot restricted to fixtures accepted by `query`.
    pub fn filtered(&self, query: &ObservationQuery) -> Result<Self> {
        let matches: Vec<MatchObservation> = self
            .matches
            .iter()
            .filter(|m| query.accepts(m))
            .cloned()
            .collect();
        let keep: std::collections::HashSet<&str> =
            matches.iter().map(|m| m.match_id.as_str()).collect();
        let rows = self
            .rows
            .iter()
            .filter(|r| keep.contains(r.match_id.as_str()))
            .cloned()
            .collect();
        Self::new(matches, rows)
    }
}

/// Anything that can hand out a snapshot for a query: the SQLite store, the remote HTTP source,
/// or an in-memory snapshot.
pub trait ObservationSource: Send + Sync {
    fn fetch(&self, query: &ObservationQuery) -> Result<ObservationSnapshot>;
}

impl ObservationSource for ObservationSnapshot {
    fn fetch(&self, query: &ObservationQuery) -> Result<ObservationSnapshot> {
        self.filtered(query)
    }
}

pub fn normalize_name(input: &str) -> String {
    let lower = input.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut prev_us = false;
    for ch in lower.chars() {
        let mapped = if ch.is_ascii_alphanumeric() {
            Some(ch)
        } else if ch == '&' {
            Some('a')
        } else {
            None
        };

        if let Some(c) = mapped {
            out.push(c);
            prev_us = false;
        } else if !prev_us && !out.is_empty() {
            out.push('_');
            prev_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str, home: &str, away: &str, referee: &str) -> MatchObservation {
        MatchObservation {
            match_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            home_team: home.to_string(),
            away_team: away.to_string(),
            referee: Some(referee.to_string()),
            competition: "League".to_string(),
            season: "2023/24".to_string(),
            home_score: 2,
            away_score: 1,
        }
    }

    fn row(id: &str, team: &str, is_home: bool) -> TeamMatchStat {
        TeamMatchStat {
            match_id: id.to_string(),
            team: team.to_string(),
            is_home,
            shots: 10,
            shots_on_target: 4,
            goals: 1,
            xg: Some(1.2),
            possession_percentage: Some(50.0),
            fouls_committed: 11,
            fouls_drawn: 9,
            yellow_cards: 2,
            red_cards: 0,
            penalties_awarded: 0,
            penalty_attempts: 0,
        }
    }

    #[test]
    fn normalize_name_compacts() {
        assert_eq!(normalize_name(" Man City "), "man_city");
        assert_eq!(normalize_name("Brighton & Hove"), "brighton_a_hove");
        assert_eq!(normalize_name("A.B-C"), "a_b_c");
    }

    #[test]
    fn fouls_alias_deserializes_into_fouls_committed() {
        let raw = r#"{"match_id":"m1","team":"A","is_home":true,"fouls":14,"possession_pct":61.5}"#;
        let row: TeamMatchStat = serde_json::from_str(raw).unwrap();
        assert_eq!(row.fouls_committed, 14);
        assert_eq!(row.fouls(), row.fouls_committed);
        assert_eq!(row.possession_pct(), Some(61.5));
    }

    #[test]
    fn alias_and_canonical_field_together_is_rejected() {
        let raw = r#"{"match_id":"m1","team":"A","is_home":true,"fouls":14,"fouls_committed":9}"#;
        assert!(serde_json::from_str::<TeamMatchStat>(raw).is_err());
    }

    #[test]
    fn unknown_stat_field_is_rejected() {
        let raw = r#"{"match_id":"m1","team":"A","is_home":true,"foul_count":14}"#;
        assert!(serde_json::from_str::<TeamMatchStat>(raw).is_err());
    }

    #[test]
    fn derived_ratios_are_undefined_without_denominator() {
        let mut r = row("m1", "A", true);
        r.shots = 0;
        assert!(r.xg_per_shot().is_none());
        assert!(r.conversion_rate().is_none());
        r.xg = Some(0.0);
        assert!(r.goals_per_xg().is_none());
    }

    #[test]
    fn stat_key_parse_accepts_aliases() {
        assert_eq!(StatKey::parse("fouls"), Some(StatKey::FoulsCommitted));
        assert_eq!(StatKey::parse("possession_pct"), Some(StatKey::PossessionPercentage));
        assert_eq!(StatKey::parse("XG_PER_SHOT"), Some(StatKey::XgPerShot));
        assert_eq!(StatKey::parse("corners"), None);
        let key: StatKey = serde_json::from_str("\"fouls\"").unwrap();
        assert_eq!(key, StatKey::FoulsCommitted);
    }

    #[test]
    fn snapshot_rejects_duplicate_match_ids() {
        let err = ObservationSnapshot::new(
            vec![obs("m1", "A", "B", "R"), obs("m1", "C", "D", "R")],
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate match_id"));
    }

    #[test]
    fn snapshot_rejects_row_on_wrong_side() {
        let err =
            ObservationSnapshot::new(vec![obs("m1", "A", "B", "R")], vec![row("m1", "B", true)])
                .unwrap_err();
        assert!(err.to_string().contains("home side"));
    }

    #[test]
    fn team_views_pair_opponent_rows() {
        let snap = ObservationSnapshot::new(
            vec![obs("m1", "Alpha FC", "Beta", "Ref One")],
            vec![row("m1", "Alpha FC", true), row("m1", "Beta", false)],
        )
        .unwrap();
        let views = snap.team_views("beta").unwrap();
        assert_eq!(views.len(), 1);
        assert!(!views[0].is_home());
        assert_eq!(views[0].goals_conceded(), 2);
        assert_eq!(views[0].points(), 0);
        assert_eq!(views[0].opponent.unwrap().team, "Alpha FC");
        assert!(matches!(
            snap.team_views("Gamma"),
            Err(EngineError::UnknownEntity { .. })
        ));
        assert_eq!(snap.resolve_referee("ref one"), Some("Ref One"));
    }

    #[test]
    fn filtered_keeps_both_sides_of_selected_fixtures() {
        let snap = ObservationSnapshot::new(
            vec![obs("m1", "A", "B", "R1"), obs("m2", "C", "D", "R2")],
            vec![
                row("m1", "A", true),
                row("m1", "B", false),
                row("m2", "C", true),
                row("m2", "D", false),
            ],
        )
        .unwrap();
        let query = ObservationQuery {
            team: Some("a".to_string()),
            ..Default::default()
        };
        let sub = snap.filtered(&query).unwrap();
        assert_eq!(sub.matches().len(), 1);
        assert_eq!(sub.rows().len(), 2);
    }
}
