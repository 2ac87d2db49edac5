use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use rbs_engine::observations::{ObservationSnapshot, SnapshotDocument};
use rbs_engine::{logging, store};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    logging::init();

    let path = std::env::args()
        .skip(1)
        .find(|arg| !arg.starts_with("--"))
        .map(PathBuf::from)
        .context("usage: import_snapshot <snapshot.json> [--db=<path>]")?;
    let db_path = parse_db_path_arg()
        .or_else(store::default_db_path)
        .context("unable to resolve sqlite path")?;

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read snapshot {}", path.display()))?;
    let doc: SnapshotDocument = serde_json::from_str(&raw)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    let snapshot = ObservationSnapshot::from_document(doc)?;

    let mut conn = store::open_db(&db_path)?;
    let summary = store::upsert_snapshot(&mut conn, &snapshot)?;

    println!("Snapshot import complete");
    println!("DB: {}", db_path.display());
    println!("Matches upserted: {}", summary.matches_upserted);
    println!("Stat rows upserted: {}", summary.stat_rows_upserted);
    println!("Teams: {}  Referees: {}", snapshot.teams().len(), snapshot.referees().len());
    Ok(())
}

fn parse_db_path_arg() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db" {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
