use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;

use rbs_engine::calibration::BacktestOptions;
use rbs_engine::decay::DecayPreset;
use rbs_engine::settings::Settings;
use rbs_engine::{Engine, logging};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    logging::init();

    let settings = Settings::from_env()?;
    let from_raw =
        arg_value("--from").context("usage: backtest --from=YYYY-MM-DD [--all-presets]")?;
    let from = NaiveDate::parse_from_str(&from_raw, "%Y-%m-%d")
        .with_context(|| format!("--from '{from_raw}' is not YYYY-MM-DD"))?;

    let engine = Engine::new(
        settings.observation_source()?,
        settings.load_configs()?,
        settings.as_of,
    );

    let presets = if has_flag("--all-presets") {
        DecayPreset::ALL.to_vec()
    } else {
        match arg_value("--preset") {
            Some(raw) => vec![raw.parse::<DecayPreset>()?],
            None => vec![settings.default_preset],
        }
    };

    println!(
        "{:<14} {:>7} {:>8} {:>9} {:>8} {:>13} {:>8}",
        "preset", "matches", "brier", "log_loss", "accuracy", "base_brier", "skipped"
    );
    for preset in presets {
        let mut options = BacktestOptions::new(from);
        options.preset = preset;
        options.config = arg_value("--config");
        options.use_referee = !has_flag("--no-referee");
        options.ensemble = has_flag("--ensemble");

        let report = engine
            .backtest(&options)
            .into_result()
            .map_err(|msg| anyhow!("backtest with {preset} failed: {msg}"))?;
        println!(
            "{:<14} {:>7} {:>8.4} {:>9.4} {:>8.3} {:>13.4} {:>8}",
            preset.name(),
            report.metrics.samples,
            report.metrics.brier,
            report.metrics.log_loss,
            report.metrics.accuracy,
            report.baseline.brier,
            report.skipped.len()
        );
        if has_flag("--bins") {
            for bin in &report.draw_bins {
                println!(
                    "  draw {:.1}-{:.1}: n={} pred={:.3} actual={:.3}",
                    bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
                );
            }
        }
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
