use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};

use crate::config::ConfigStore;
use crate::decay::DecayPreset;
use crate::http_client::DEFAULT_TIMEOUT_SECS;
use crate::observations::ObservationSource;
use crate::remote_source::RemoteSource;
use crate::store::{self, SqliteSource};

const APP_DIR: &str = "rbs_engine";

/// `$XDG_DATA_HOME/rbs_engine`, falling back to `~/.local/share/rbs_engine`.
pub fn data_dir() -> Option<PathBuf> {
    data_dir_from(|key| env::var(key).ok())
}

fn data_dir_from(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(base) = lookup("XDG_DATA_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_DIR));
    }
    let home = lookup("HOME")?;
    if home.trim().is_empty() {
        return None;
    }
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR),
    )
}

/// Runtime settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub fetch_timeout: Duration,
    pub default_preset: DecayPreset,
    pub as_of: NaiveDate,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let db_path = get("RBS_DB_PATH")
            .map(PathBuf::from)
            .or_else(|| data_dir_from(&lookup).map(|d| d.join(store::DB_FILE_NAME)));
        let config_path = get("RBS_CONFIG_PATH").map(PathBuf::from);
        let remote_url = get("RBS_REMOTE_URL");
        let timeout_secs = get("RBS_FETCH_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, 300);
        let default_preset = match get("RBS_DEFAULT_PRESET") {
            Some(raw) => raw
                .parse::<DecayPreset>()
                .map_err(|e| anyhow!("RBS_DEFAULT_PRESET: {e}"))?,
            None => DecayPreset::None,
        };
        let as_of = match get("RBS_AS_OF") {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .with_context(|| format!("RBS_AS_OF '{raw}' is not YYYY-MM-DD"))?,
            None => Local::now().date_naive(),
        };

        Ok(Self {
            db_path,
            config_path,
            remote_url,
            fetch_timeout: Duration::from_secs(timeout_secs),
            default_preset,
            as_of,
        })
    }

    /// Named configs from `RBS_CONFIG_PATH`, or the built-in defaults.
    pub fn load_configs(&self) -> Result<ConfigStore> {
        match &self.config_path {
            Some(path) => ConfigStore::load(path),
            None => Ok(ConfigStore::default()),
        }
    }

    /// The remote source when `RBS_REMOTE_URL` is set, else the SQLite store.
    pub fn observation_source(&self) -> Result<Box<dyn ObservationSource>> {
        if let Some(url) = &self.remote_url {
            return Ok(Box::new(RemoteSource::with_timeout(url, self.fetch_timeout)?));
        }
        let path = self
            .db_path
            .as_ref()
            .ok_or_else(|| anyhow!("no database path: set RBS_DB_PATH or HOME"))?;
        Ok(Box::new(SqliteSource::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_xdg_data_dir() {
        let s = Settings::from_lookup(lookup(&[
            ("XDG_DATA_HOME", "/data"),
            ("RBS_AS_OF", "2024-05-01"),
        ]))
        .unwrap();
        assert_eq!(
            s.db_path,
            Some(PathBuf::from("/data/rbs_engine").join(store::DB_FILE_NAME))
        );
        assert_eq!(s.fetch_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(s.default_preset, DecayPreset::None);
        assert_eq!(s.as_of, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    #[test]
    fn home_fallback_and_overrides() {
        let s = Settings::from_lookup(lookup(&[
            ("HOME", "/home/ref"),
            ("RBS_FETCH_TIMEOUT_SECS", "0"),
            ("RBS_DEFAULT_PRESET", "Moderate"),
            ("RBS_REMOTE_URL", " http://localhost:9000/snapshot "),
        ]))
        .unwrap();
        assert_eq!(
            s.db_path,
            Some(PathBuf::from("/home/ref/.local/share/rbs_engine/observations.sqlite"))
        );
        assert_eq!(s.fetch_timeout, Duration::from_secs(1));
        assert_eq!(s.default_preset, DecayPreset::Moderate);
        assert_eq!(s.remote_url.as_deref(), Some("http://localhost:9000/snapshot"));
    }

    #[test]
    fn rejects_bad_preset_and_date() {
        assert!(Settings::from_lookup(lookup(&[("RBS_DEFAULT_PRESET", "turbo")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("RBS_AS_OF", "01/05/2024")])).is_err());
    }
}
