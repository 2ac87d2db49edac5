use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;

use rbs_engine::config::{ConfigStore, RbsConfig};
use rbs_engine::decay::DecayPreset;
use rbs_engine::observations::{
    ObservationQuery, ObservationSnapshot, ObservationSource, SnapshotDocument,
};
use rbs_engine::predict::PredictionRequest;
use rbs_engine::rbs::{self, RbsRun};
use rbs_engine::store::{self, SqliteSource};
use rbs_engine::Engine;

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn league() -> ObservationSnapshot {
    let doc: SnapshotDocument =
        serde_json::from_str(&read_fixture("league_snapshot.json")).expect("fixture should parse");
    ObservationSnapshot::from_document(doc).expect("fixture should validate")
}

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

#[test]
fn imported_league_serves_queries_and_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("observations.sqlite");
    let mut conn = store::open_db(&db_path).unwrap();
    let summary = store::upsert_snapshot(&mut conn, &league()).unwrap();
    assert_eq!(summary.matches_upserted, 60);
    assert_eq!(summary.stat_rows_upserted, 120);
    drop(conn);

    let source = SqliteSource::open(&db_path).unwrap();
    let everton = source
        .fetch(&ObservationQuery {
            team: Some("Everton".to_string()),
            ..ObservationQuery::default()
        })
        .unwrap();
    assert_eq!(everton.matches().len(), 20);

    let first_season = source
        .fetch(&ObservationQuery {
            to: NaiveDate::from_ymd_opt(2023, 6, 30),
            ..ObservationQuery::default()
        })
        .unwrap();
    assert_eq!(first_season.matches().len(), 30);

    let engine = Engine::new(Box::new(source), ConfigStore::default(), as_of());
    let resp = engine.predict(&PredictionRequest::new("Brighton", "Fulham"));
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.data.unwrap().home_team, "Brighton");
}

#[test]
fn rbs_recalculation_replaces_results_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = store::open_db(&dir.path().join("rbs.sqlite")).unwrap();
    let cfg = RbsConfig::default();
    let run = RbsRun {
        preset: DecayPreset::Moderate,
        as_of: as_of(),
        config_name: "default",
        config: &cfg,
    };
    let batch = rbs::recalculate_all(&league(), run).unwrap();

    store::replace_rbs_results(&mut conn, &batch).unwrap();
    store::replace_rbs_results(&mut conn, &batch).unwrap();
    let stored = store::load_rbs_results(&conn).unwrap();
    assert_eq!(stored.len(), batch.results.len());
    for (saved, fresh) in stored.iter().zip(&batch.results) {
        assert_eq!(saved.team, fresh.team);
        assert_eq!(saved.referee, fresh.referee);
        assert_eq!(saved.status, fresh.status);
        assert_eq!(saved.stats_breakdown.len(), cfg.stats.len());
    }
    let runs = store::rbs_runs(&conn).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.finished_at.is_some()));
    assert_eq!(runs[1].pairs, 27);

    // A batch that violates the (team, referee) key fails as a whole.
    let mut broken = batch.clone();
    broken.results.push(batch.results[0].clone());
    assert!(store::replace_rbs_results(&mut conn, &broken).is_err());
    assert_eq!(store::load_rbs_results(&conn).unwrap().len(), batch.results.len());
    assert_eq!(store::rbs_runs(&conn).unwrap().len(), 2);
}
