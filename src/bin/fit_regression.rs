use anyhow::{Result, anyhow};

use rbs_engine::regression::RegressionRequest;
use rbs_engine::settings::Settings;
use rbs_engine::{Engine, logging};

const DEFAULT_STATS: &str = "shots,shots_on_target,xg,possession_percentage";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    logging::init();

    let settings = Settings::from_env()?;
    let engine = Engine::new(
        settings.observation_source()?,
        settings.load_configs()?,
        settings.as_of,
    );

    let stats_raw = arg_value("--stats").unwrap_or_else(|| DEFAULT_STATS.to_string());
    let stats = stats_raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    let test_size = parse_f64_arg("--test-size").unwrap_or(0.2);
    let random_state = arg_value("--seed")
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .map_err(|e| anyhow!("--seed: {e}"))?
        .unwrap_or(42);

    let mut request = RegressionRequest::new(&stats, test_size, random_state);
    if let Some(target) = arg_value("--target") {
        request.target = target;
    }

    let resp = engine.fit_regression(&request, arg_value("--config").as_deref());
    println!("{}", serde_json::to_string_pretty(&resp)?);
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

fn parse_f64_arg(name: &str) -> Option<f64> {
    arg_value(name).and_then(|raw| raw.parse::<f64>().ok())
}
