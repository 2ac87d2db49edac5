use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::observations::{
    MatchObservation, ObservationQuery, ObservationSnapshot, ObservationSource, TeamMatchStat,
    normalize_name,
};
use crate::rbs::{RbsBatch, RbsResult};
use crate::settings::data_dir;

pub const DB_FILE_NAME: &str = "observations.sqlite";

pub fn default_db_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join(DB_FILE_NAME))
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            home_key TEXT NOT NULL,
            away_key TEXT NOT NULL,
            referee TEXT NULL,
            referee_key TEXT NULL,
            competition TEXT NOT NULL,
            season TEXT NOT NULL,
            home_score INTEGER NOT NULL,
            away_score INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(date);
        CREATE INDEX IF NOT EXISTS idx_matches_home ON matches(home_key);
        CREATE INDEX IF NOT EXISTS idx_matches_away ON matches(away_key);
        CREATE INDEX IF NOT EXISTS idx_matches_referee ON matches(referee_key);

        CREATE TABLE IF NOT EXISTS team_match_stats (
            match_id TEXT NOT NULL REFERENCES matches(match_id) ON DELETE CASCADE,
            is_home INTEGER NOT NULL,
            team TEXT NOT NULL,
            shots INTEGER NOT NULL,
            shots_on_target INTEGER NOT NULL,
            goals INTEGER NOT NULL,
            xg REAL NULL,
            possession_percentage REAL NULL,
            fouls_committed INTEGER NOT NULL,
            fouls_drawn INTEGER NOT NULL,
            yellow_cards INTEGER NOT NULL,
            red_cards INTEGER NOT NULL,
            penalties_awarded INTEGER NOT NULL,
            penalty_attempts INTEGER NOT NULL,
            PRIMARY KEY (match_id, is_home)
        );

        CREATE TABLE IF NOT EXISTS rbs_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            preset TEXT NOT NULL,
            as_of TEXT NOT NULL,
            config_used TEXT NOT NULL,
            pairs INTEGER NOT NULL,
            scored INTEGER NOT NULL,
            insufficient INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rbs_results (
            team TEXT NOT NULL,
            referee TEXT NOT NULL,
            run_id INTEGER NOT NULL REFERENCES rbs_runs(run_id),
            status TEXT NOT NULL,
            rbs_score REAL NULL,
            confidence_level REAL NULL,
            matches_with_ref INTEGER NOT NULL,
            result_json TEXT NOT NULL,
            PRIMARY KEY (team, referee)
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub matches_upserted: usize,
    pub stat_rows_upserted: usize,
}

/// Upserts every match and stat row of the snapshot in one transaction.
pub fn upsert_snapshot(
    conn: &mut Connection,
    snapshot: &ObservationSnapshot,
) -> Result<ImportSummary> {
    let tx = conn.transaction().context("begin import transaction")?;
    let now = Utc::now().to_rfc3339();
    for m in snapshot.matches() {
        upsert_match(&tx, m, &now)?;
    }
    for row in snapshot.rows() {
        upsert_stat_row(&tx, row)?;
    }
    tx.commit().context("commit import transaction")?;
    Ok(ImportSummary {
        matches_upserted: snapshot.matches().len(),
        stat_rows_upserted: snapshot.rows().len(),
    })
}

fn upsert_match(tx: &rusqlite::Transaction<'_>, m: &MatchObservation, now: &str) -> Result<()> {
    let referee_key = m.referee.as_deref().map(normalize_name);
    tx.execute(
        r#"
        INSERT INTO matches (
            match_id, date, home_team, away_team, home_key, away_key,
            referee, referee_key, competition, season, home_score, away_score, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(match_id) DO UPDATE SET
            date = excluded.date,
            home_team = excluded.home_team,
            away_team = excluded.away_team,
            home_key = excluded.home_key,
            away_key = excluded.away_key,
            referee = excluded.referee,
            referee_key = excluded.referee_key,
            competition = excluded.competition,
            season = excluded.season,
            home_score = excluded.home_score,
            away_score = excluded.away_score,
            updated_at = excluded.updated_at
        "#,
        params![
            m.match_id,
            m.date.to_string(),
            m.home_team,
            m.away_team,
            normalize_name(&m.home_team),
            normalize_name(&m.away_team),
            m.referee,
            referee_key,
            m.competition,
            m.season,
            m.home_score,
            m.away_score,
            now,
        ],
    )
    .with_context(|| format!("upsert match {}", m.match_id))?;
    Ok(())
}

fn upsert_stat_row(tx: &rusqlite::Transaction<'_>, r: &TeamMatchStat) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO team_match_stats (
            match_id, is_home, team, shots, shots_on_target, goals, xg, possession_percentage,
            fouls_committed, fouls_drawn, yellow_cards, red_cards, penalties_awarded,
            penalty_attempts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(match_id, is_home) DO UPDATE SET
            team = excluded.team,
            shots = excluded.shots,
            shots_on_target = excluded.shots_on_target,
            goals = excluded.goals,
            xg = excluded.xg,
            possession_percentage = excluded.possession_percentage,
            fouls_committed = excluded.fouls_committed,
            fouls_drawn = excluded.fouls_drawn,
            yellow_cards = excluded.yellow_cards,
            red_cards = excluded.red_cards,
            penalties_awarded = excluded.penalties_awarded,
            penalty_attempts = excluded.penalty_attempts
        "#,
        params![
            r.match_id,
            r.is_home,
            r.team,
            r.shots,
            r.shots_on_target,
            r.goals,
            r.xg,
            r.possession_percentage,
            r.fouls_committed,
            r.fouls_drawn,
            r.yellow_cards,
            r.red_cards,
            r.penalties_awarded,
            r.penalty_attempts,
        ],
    )
    .with_context(|| format!("upsert stat row {} ({})", r.match_id, r.team))?;
    Ok(())
}

const MATCH_FILTER: &str = r#"
    (?1 IS NULL OR m.home_key = ?1 OR m.away_key = ?1)
    AND (?2 IS NULL OR m.referee_key = ?2)
    AND (?3 IS NULL OR m.date >= ?3)
    AND (?4 IS NULL OR m.date <= ?4)
"#;

/// Loads the fixtures accepted by `query` together with both sides' stat rows.
pub fn load_snapshot(conn: &Connection, query: &ObservationQuery) -> Result<ObservationSnapshot> {
    let team = query.team.as_deref().map(normalize_name);
    let referee = query.referee.as_deref().map(normalize_name);
    let from = query.from.map(|d| d.to_string());
    let to = query.to.map(|d| d.to_string());

    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT m.match_id, m.date, m.home_team, m.away_team, m.referee,
                   m.competition, m.season, m.home_score, m.away_score
            FROM matches m
            WHERE {MATCH_FILTER}
            ORDER BY m.date ASC, m.match_id ASC
            "#
        ))
        .context("prepare load matches query")?;
    let raw = stmt
        .query_map(params![team, referee, from, to], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, u32>(8)?,
            ))
        })
        .context("query matches")?;
    let mut matches = Vec::new();
    for r in raw {
        let (match_id, date, home_team, away_team, referee, competition, season, hs, aws) =
            r.context("read match row")?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .with_context(|| format!("bad date '{date}' for match {match_id}"))?;
        matches.push(MatchObservation {
            match_id,
            date,
            home_team,
            away_team,
            referee,
            competition,
            season,
            home_score: hs,
            away_score: aws,
        });
    }

    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT s.match_id, s.team, s.is_home, s.shots, s.shots_on_target, s.goals, s.xg,
                   s.possession_percentage, s.fouls_committed, s.fouls_drawn, s.yellow_cards,
                   s.red_cards, s.penalties_awarded, s.penalty_attempts
            FROM team_match_stats s
            JOIN matches m ON m.match_id = s.match_id
            WHERE {MATCH_FILTER}
            ORDER BY m.date ASC, s.match_id ASC, s.is_home DESC
            "#
        ))
        .context("prepare load stat rows query")?;
    let rows = stmt
        .query_map(params![team, referee, from, to], |row| {
            Ok(TeamMatchStat {
                match_id: row.get(0)?,
                team: row.get(1)?,
                is_home: row.get(2)?,
                shots: row.get(3)?,
                shots_on_target: row.get(4)?,
                goals: row.get(5)?,
                xg: row.get(6)?,
                possession_percentage: row.get(7)?,
                fouls_committed: row.get(8)?,
                fouls_drawn: row.get(9)?,
                yellow_cards: row.get(10)?,
                red_cards: row.get(11)?,
                penalties_awarded: row.get(12)?,
                penalty_attempts: row.get(13)?,
            })
        })
        .context("query stat rows")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read stat rows")?;

    ObservationSnapshot::new(matches, rows).context("validate stored observations")
}

/// Replaces the stored RBS table with `batch` and records the run. All-or-nothing.
pub fn replace_rbs_results(conn: &mut Connection, batch: &RbsBatch) -> Result<i64> {
    let tx = conn.transaction().context("begin rbs transaction")?;
    tx.execute(
        "INSERT INTO rbs_runs (started_at, preset, as_of, config_used, pairs, scored, insufficient)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Utc::now().to_rfc3339(),
            batch.preset.name(),
            batch.as_of.to_string(),
            batch.config_used,
            batch.results.len() as i64,
            batch.scored as i64,
            batch.insufficient as i64,
        ],
    )
    .context("insert rbs run")?;
    let run_id = tx.last_insert_rowid();

    tx.execute("DELETE FROM rbs_results", [])
        .context("clear rbs results")?;
    for r in &batch.results {
        let json = serde_json::to_string(r).context("serialize rbs result")?;
        tx.execute(
            r#"
            INSERT INTO rbs_results (
                team, referee, run_id, status, rbs_score, confidence_level, matches_with_ref,
                result_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                r.team,
                r.referee,
                run_id,
                if r.is_scored() { "scored" } else { "insufficient_data" },
                r.rbs_score,
                r.confidence_level,
                r.matches_with_ref as i64,
                json,
            ],
        )
        .with_context(|| format!("insert rbs result {} / {}", r.team, r.referee))?;
    }

    tx.execute(
        "UPDATE rbs_runs SET finished_at = ?1 WHERE run_id = ?2",
        params![Utc::now().to_rfc3339(), run_id],
    )
    .context("finish rbs run")?;
    tx.commit().context("commit rbs transaction")?;
    Ok(run_id)
}

pub fn load_rbs_results(conn: &Connection) -> Result<Vec<RbsResult>> {
    let mut stmt = conn
        .prepare("SELECT result_json FROM rbs_results ORDER BY team ASC, referee ASC")
        .context("prepare rbs results query")?;
    let raw = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .context("query rbs results")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read rbs results")?;
    raw.iter()
        .map(|json| serde_json::from_str(json).context("parse stored rbs result"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbsRunRecord {
    pub run_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub preset: String,
    pub as_of: String,
    pub config_used: String,
    pub pairs: i64,
    pub scored: i64,
    pub insufficient: i64,
}

pub fn rbs_runs(conn: &Connection) -> Result<Vec<RbsRunRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, started_at, finished_at, preset, as_of, config_used, pairs, scored,
                    insufficient
             FROM rbs_runs ORDER BY run_id ASC",
        )
        .context("prepare rbs runs query")?;
    stmt.query_map([], |row| {
        Ok(RbsRunRecord {
            run_id: row.get(0)?,
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            preset: row.get(3)?,
            as_of: row.get(4)?,
            config_used: row.get(5)?,
            pairs: row.get(6)?,
            scored: row.get(7)?,
            insufficient: row.get(8)?,
        })
    })
    .context("query rbs runs")?
    .collect::<rusqlite::Result<Vec<_>>>()
    .context("read rbs runs")
}

/// [`ObservationSource`] over a SQLite file. The connection is serialized behind a mutex.
#[derive(Debug)]
pub struct SqliteSource {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(open_db(path)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
        f(&mut conn)
    }
}

impl ObservationSource for SqliteSource {
    fn fetch(&self, query: &ObservationQuery) -> Result<ObservationSnapshot> {
        self.with_conn(|conn| load_snapshot(conn, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ObservationSnapshot {
        let raw = r#"{
            "matches": [
                {"match_id":"1","date":"2024-01-06","home_team":"Alpha","away_team":"Beta",
                 "referee":"M. Oliver","season":"2023/24","home_score":2,"away_score":1},
                {"match_id":"2","date":"2024-01-13","home_team":"Gamma","away_team":"Alpha",
                 "referee":"A. Taylor","season":"2023/24","home_score":0,"away_score":0}
            ],
            "team_stats": [
                {"match_id":"1","team":"Alpha","is_home":true,"shots":12,"goals":2,"xg":1.6},
                {"match_id":"1","team":"Beta","is_home":false,"shots":7,"goals":1,"xg":0.7},
                {"match_id":"2","team":"Gamma","is_home":true,"shots":9,"possession_pct":47.5},
                {"match_id":"2","team":"Alpha","is_home":false,"shots":10,"fouls":14}
            ]
        }"#;
        ObservationSnapshot::from_document(serde_json::from_str(raw).unwrap()).unwrap()
    }

    #[test]
    fn snapshot_round_trips_through_sqlite() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let snap = snapshot();
        let summary = upsert_snapshot(&mut conn, &snap).unwrap();
        assert_eq!(summary.matches_upserted, 2);
        // Re-import is an upsert, not a duplicate.
        upsert_snapshot(&mut conn, &snap).unwrap();

        let loaded = load_snapshot(&conn, &ObservationQuery::default()).unwrap();
        assert_eq!(loaded.matches(), snap.matches());
        assert_eq!(loaded.rows().len(), 4);
    }

    #[test]
    fn query_filters_by_referee_and_team() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        upsert_snapshot(&mut conn, &snapshot()).unwrap();

        let by_ref = ObservationQuery {
            referee: Some("m oliver".to_string()),
            ..Default::default()
        };
        let loaded = load_snapshot(&conn, &by_ref).unwrap();
        assert_eq!(loaded.matches().len(), 1);
        assert_eq!(loaded.rows().len(), 2);

        let by_team = ObservationQuery {
            team: Some("GAMMA".to_string()),
            ..Default::default()
        };
        let loaded = load_snapshot(&conn, &by_team).unwrap();
        assert_eq!(loaded.matches()[0].match_id, "2");
        let alpha = loaded.rows().iter().find(|r| r.team == "Alpha").unwrap();
        assert_eq!(alpha.fouls_committed, 14);
    }
}
