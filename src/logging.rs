use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter_directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["RBS_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|key| lookup(key))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Installs a stderr fmt subscriber filtered by `RBS_LOG`, then `RUST_LOG`, then `info`.
///
/// A second call (or a subscriber installed elsewhere) is left in place.
pub fn init() {
    let directives = filter_directives(|key| env::var(key).ok());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("ignoring log filter '{directives}': {err}");
        EnvFilter::new(DEFAULT_FILTER)
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_variable_wins_over_rust_log() {
        let got = filter_directives(|key| match key {
            "RBS_LOG" => Some("debug".to_string()),
            "RUST_LOG" => Some("warn".to_string()),
            _ => None,
        });
        assert_eq!(got, "debug");
    }

    #[test]
    fn blank_values_fall_through() {
        let got = filter_directives(|key| match key {
            "RBS_LOG" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(got, DEFAULT_FILTER);
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
    }
}
