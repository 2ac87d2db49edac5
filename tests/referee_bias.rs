use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;

use rbs_engine::config::RbsConfig;
use rbs_engine::decay::DecayPreset;
use rbs_engine::error::{EngineError, EntityKind};
use rbs_engine::observations::{ObservationSnapshot, SnapshotDocument, StatKey};
use rbs_engine::rbs::{self, RbsRun, RbsStatus};

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

fn run(config: &RbsConfig, preset: DecayPreset) -> RbsRun<'_> {
    RbsRun {
        preset,
        as_of: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        config_name: "default",
        config,
    }
}

#[test]
fn strict_referee_shows_up_in_card_differential() {
    let cfg = RbsConfig::default();
    let res = rbs::score_bias(
        &league(),
        "Everton",
        "michael oliver",
        run(&cfg, DecayPreset::None),
    )
    .unwrap();

    assert!(res.is_scored());
    assert_eq!(res.referee, "Michael Oliver");
    assert_eq!(res.matches_with_ref, 5);
    assert_eq!(res.baseline_matches, 15);
    let yellow = res.stats_breakdown[&StatKey::YellowCards].unwrap();
    assert!((yellow - (3.2 - 25.0 / 15.0)).abs() < 1e-9);

    // More cards than usual counts against the team.
    let card_component = res
        .components
        .iter()
        .find(|c| c.stat == StatKey::YellowCards)
        .unwrap();
    assert!(card_component.contribution.unwrap() < 0.0);

    let confidence = res.confidence_level.unwrap();
    assert!((cfg.min_confidence..=cfg.max_confidence).contains(&confidence));
}

#[test]
fn breakdown_lists_every_configured_stat() {
    let cfg = RbsConfig::default();
    let snap = league();
    for (team, referee) in [("Everton", "Michael Oliver"), ("Arsenal", "John Brooks")] {
        let res = rbs::score_bias(&snap, team, referee, run(&cfg, DecayPreset::Moderate)).unwrap();
        assert_eq!(res.stats_breakdown.len(), cfg.stats.len());
        for s in &cfg.stats {
            assert!(res.stats_breakdown.contains_key(&s.stat));
        }
    }
}

#[test]
fn referee_who_never_met_team_is_insufficient() {
    let cfg = RbsConfig::default();
    let res = rbs::score_bias(&league(), "Everton", "John Brooks", run(&cfg, DecayPreset::None))
        .unwrap();
    assert_eq!(res.matches_with_ref, 0);
    assert!(res.rbs_score.is_none());
    assert!(res.confidence_level.is_none());
    assert!(matches!(res.status, RbsStatus::InsufficientData { .. }));
}

#[test]
fn single_fixture_is_below_threshold() {
    let cfg = RbsConfig::default();
    let res = rbs::score_bias(&league(), "Arsenal", "John Brooks", run(&cfg, DecayPreset::None))
        .unwrap();
    assert_eq!(res.matches_with_ref, 1);
    assert!(!res.is_scored());
    assert!(res.insufficient_reason().unwrap().contains("need 3"));
}

#[test]
fn unknown_referee_is_an_error() {
    let cfg = RbsConfig::default();
    let err = rbs::score_bias(&league(), "Everton", "Howard Webb", run(&cfg, DecayPreset::None))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnknownEntity {
            kind: EntityKind::Referee,
            ..
        }
    ));
}

#[test]
fn batch_scores_every_pair_deterministically() {
    let cfg = RbsConfig::default();
    let snap = league();
    let first = rbs::recalculate_all(&snap, run(&cfg, DecayPreset::None)).unwrap();
    let second = rbs::recalculate_all(&snap, run(&cfg, DecayPreset::None)).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.results.len(), 27);
    assert_eq!(first.scored, 21);
    assert_eq!(first.insufficient, 6);
    let keys: Vec<(&str, &str)> = first
        .results
        .iter()
        .map(|r| (r.team.as_str(), r.referee.as_str()))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
}
