use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared client with the default request timeout.
pub fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| build_client(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
}

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("rbs_engine/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build http client")
}
