use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;

use crate::http_client::{build_client, http_client};
use crate::observations::{
    ObservationQuery, ObservationSnapshot, ObservationSource, SnapshotDocument,
};

/// Observation source backed by an HTTP endpoint serving a [`SnapshotDocument`].
///
/// Query filters are sent as `team`, `referee`, `from` and `to` parameters and applied again
/// locally, so endpoints that ignore them still yield the requested subset.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    url: String,
    client: Client,
}

impl RemoteSource {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: url.trim().to_string(),
            client: http_client()?.clone(),
        })
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.trim().to_string(),
            client: build_client(timeout)?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn fetch_document(&self, query: &ObservationQuery) -> Result<SnapshotDocument> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(team) = &query.team {
            params.push(("team", team.clone()));
        }
        if let Some(referee) = &query.referee {
            params.push(("referee", referee.clone()));
        }
        if let Some(from) = query.from {
            params.push(("from", from.to_string()));
        }
        if let Some(to) = query.to {
            params.push(("to", to.to_string()));
        }

        let resp = self
            .client
            .get(&self.url)
            .query(&params)
            .send()
            .with_context(|| format!("request {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned http {status}", self.url));
        }
        let body = resp.text().context("read snapshot body")?;
        serde_json::from_str(&body).context("parse snapshot json")
    }
}

impl ObservationSource for RemoteSource {
    fn fetch(&self, query: &ObservationQuery) -> Result<ObservationSnapshot> {
        let doc = self.fetch_document(query)?;
        tracing::debug!(
            url = %self.url,
            matches = doc.matches.len(),
            rows = doc.team_stats.len(),
            "fetched remote snapshot"
        );
        ObservationSnapshot::from_document(doc)?.filtered(query)
    }
}
