use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Team,
    Referee,
    Stat,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Team => "team",
            EntityKind::Referee => "referee",
            EntityKind::Stat => "stat",
        };
        f.write_str(label)
    }
}

/// Stable, serializable code for an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientData,
    UnknownEntity,
    InvalidConfiguration,
    NumericDegenerate,
    DataUnavailable,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("{kind} not found: {name}")]
    UnknownEntity { kind: EntityKind, name: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("numerically degenerate: {0}")]
    NumericDegenerate(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InsufficientData(_) => ErrorKind::InsufficientData,
            EngineError::UnknownEntity { .. } => ErrorKind::UnknownEntity,
            EngineError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            EngineError::NumericDegenerate(_) => ErrorKind::NumericDegenerate,
            EngineError::DataUnavailable(_) => ErrorKind::DataUnavailable,
        }
    }

    pub fn team_not_found(name: &str) -> Self {
        EngineError::UnknownEntity {
            kind: EntityKind::Team,
            name: name.to_string(),
        }
    }

    pub fn referee_not_found(name: &str) -> Self {
        EngineError::UnknownEntity {
            kind: EntityKind::Referee,
            name: name.to_string(),
        }
    }

    pub fn stat_not_found(name: &str) -> Self {
        EngineError::UnknownEntity {
            kind: EntityKind::Stat,
            name: name.to_string(),
        }
    }

    /// Wraps an I/O-side `anyhow` chain (store, HTTP) crossing into the core.
    pub fn unavailable(err: &anyhow::Error) -> Self {
        EngineError::DataUnavailable(format!("{err:#}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
