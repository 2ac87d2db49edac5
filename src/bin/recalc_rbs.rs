use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use rbs_engine::decay::DecayPreset;
use rbs_engine::settings::Settings;
use rbs_engine::{Engine, logging, report_export, store};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    logging::init();

    let settings = Settings::from_env()?;
    let preset = match arg_value("--preset") {
        Some(raw) => raw.parse::<DecayPreset>()?,
        None => settings.default_preset,
    };
    let config = arg_value("--config");
    let engine = Engine::new(
        settings.observation_source()?,
        settings.load_configs()?,
        settings.as_of,
    );

    tracing::info!(preset = %preset, as_of = %settings.as_of, "recalculating referee bias scores");
    let resp = engine.recalculate_all(Some(preset), config.as_deref());
    let batch = resp.into_result().map_err(|msg| anyhow!("recalculation failed: {msg}"))?;

    println!("RBS recalculation complete");
    println!("Preset: {}  As of: {}  Config: {}", batch.preset, batch.as_of, batch.config_used);
    println!(
        "Pairs: {}  scored={}  insufficient={}",
        batch.results.len(),
        batch.scored,
        batch.insufficient
    );

    if has_flag("--dry-run") {
        println!("Dry run: nothing persisted");
    } else {
        let db_path = arg_value("--db")
            .map(PathBuf::from)
            .or_else(|| settings.db_path.clone())
            .context("unable to resolve sqlite path")?;
        let mut conn = store::open_db(&db_path)?;
        let run_id = store::replace_rbs_results(&mut conn, &batch)?;
        println!("DB: {} (run {run_id})", db_path.display());
    }

    if let Some(path) = arg_value("--xlsx").map(PathBuf::from) {
        let report = report_export::export_rbs_batch(&path, &batch)?;
        println!("XLSX: {} ({} rows)", path.display(), report.rows);
    }

    Ok(())
}

fn arg_value(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
