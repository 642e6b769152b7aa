use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::db::Database;
use crate::ingest::{self, IngestStats, Ingested};
use crate::models::Source;
use crate::settings::AppSettings;
use crate::sources;

const ADZUNA_API_URL: &str = "https://api.adzuna.com/v1/api/jobs/gb/search";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Value>,
}

/// Polls the paid search API. Construction goes through the source
/// registry, so partial credentials can never reach the wire.
#[derive(Debug)]
pub struct SearchClient {
    app_id: String,
    app_key: String,
    client: reqwest::blocking::Client,
}

impl SearchClient {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        if !sources::is_enabled(settings, Source::SearchApi) {
            return Err(anyhow!(
                "search-api source is disabled. Set adzuna_app_id and adzuna_app_key with 'pursuit settings set'."
            ));
        }
        // the registry guarantees both are present and non-empty
        let app_id = settings.adzuna_app_id.clone().unwrap_or_default();
        let app_key = settings.adzuna_app_key.clone().unwrap_or_default();
        Ok(Self {
            app_id,
            app_key,
            client: reqwest::blocking::Client::new(),
        })
    }

    pub fn fetch_page(&self, what: &str, where_: &str, page: u32) -> Result<Vec<Value>> {
        let url = format!("{}/{}", ADZUNA_API_URL, page);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("app_id", self.app_id.as_str()),
                ("app_key", self.app_key.as_str()),
                ("what", what),
                ("where", where_),
                ("results_per_page", "50"),
            ])
            .send()
            .context("Failed to reach search API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Search API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let body: SearchResponse = response
            .json()
            .context("Failed to parse search API response")?;
        Ok(body.results)
    }
}

/// Push one page of raw results through the normalizer. Bad records are
/// counted and logged, never fatal to the batch.
pub fn ingest_results(db: &Database, results: &[Value]) -> IngestStats {
    let mut stats = IngestStats::default();
    for result in results {
        stats.found += 1;
        match ingest::normalize(db, Source::SearchApi, &result.to_string()) {
            Ok(Ingested { created: true, .. }) => stats.added += 1,
            Ok(Ingested { created: false, .. }) => stats.duplicates += 1,
            Err(e) => {
                stats.errors += 1;
                warn!(error = %e, "discarding search result");
            }
        }
    }
    stats
}
