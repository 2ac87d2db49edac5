use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use rbs_engine::decay::DecayPreset;
use rbs_engine::predict::PredictionRequest;
use rbs_engine::settings::Settings;
use rbs_engine::{Engine, logging, report_export};

const USAGE: &str = "usage: rbs_engine --home=<team> --away=<team> [--referee=<name>] \
[--config=<name>] [--preset=<name>] [--ensemble] [--xlsx=<path>] [--presets]";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    logging::init();

    let settings = Settings::from_env()?;
    let engine = Engine::new(
        settings.observation_source()?,
        settings.load_configs()?,
        settings.as_of,
    )
    .with_default_preset(settings.default_preset);

    if has_flag("--presets") {
        let resp = engine.decay_presets();
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    let home = arg_value("--home").ok_or_else(|| anyhow!("missing --home\n{USAGE}"))?;
    let away = arg_value("--away").ok_or_else(|| anyhow!("missing --away\n{USAGE}"))?;
    let mut request = PredictionRequest::new(&home, &away);
    if let Some(referee) = arg_value("--referee") {
        request = request.with_referee(&referee);
    }
    if let Some(config) = arg_value("--config") {
        request = request.with_config(&config);
    }
    if let Some(raw) = arg_value("--preset") {
        let preset = raw
            .parse::<DecayPreset>()
            .map_err(|e| anyhow!("--preset: {e}"))?;
        request = request.with_preset(preset);
    }
    if has_flag("--ensemble") {
        request = request.with_ensemble();
    }

    let resp = engine.predict(&request);
    println!("{}", serde_json::to_string_pretty(&resp)?);

    if let Some(path) = arg_value("--xlsx").map(PathBuf::from)
        && let Some(prediction) = &resp.data
    {
        report_export::export_predictions(&path, std::slice::from_ref(prediction))
            .with_context(|| format!("export prediction to {}", path.display()))?;
        eprintln!("wrote {}", path.display());
    }

    if !resp.success {
        std::process::exit(2);
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
