pub mod aggregate;
pub mod calibration;
pub mod config;
pub mod decay;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod observations;
pub mod predict;
pub mod rbs;
pub mod regression;
pub mod remote_source;
pub mod report_export;
pub mod settings;
pub mod store;
pub mod win_prob;

pub use engine::{Engine, EngineResponse};
pub use error::{EngineError, EngineResult, ErrorKind};
