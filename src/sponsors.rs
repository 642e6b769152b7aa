use anyhow::{Context, anyhow};
use serde::Deserialize;
use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::models::{Source, Sponsor, StageFilter};
use crate::settings::AppSettings;
use crate::sources;

/// Similarity floor for treating a posting's company as a feed sponsor
/// when the normalized names are not byte-equal.
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.93;

/// One organisation from the sponsor register feed.
#[derive(Debug, Clone, Deserialize)]
pub struct SponsorRecord {
    #[serde(alias = "organisation")]
    pub name: String,
    #[serde(default)]
    pub route: Option<String>,
}

/// Lowercase, strip punctuation, collapse whitespace, and drop trailing
/// legal suffixes. "Acme Ltd" and "ACME LIMITED." both become "acme".
pub fn normalize_company(name: &str) -> String {
    const SUFFIXES: [&str; 8] = ["ltd", "limited", "plc", "llp", "llc", "inc", "co", "uk"];

    let lower = name.to_lowercase();
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    while words.len() > 1 {
        let Some(last) = words.last() else { break };
        if SUFFIXES.contains(last) {
            words.pop();
        } else {
            break;
        }
    }
    words.join(" ")
}

pub fn fetch_feed(url: &str) -> anyhow::Result<Vec<SponsorRecord>> {
    let response = reqwest::blocking::Client::new()
        .get(url)
        .send()
        .context("Failed to reach sponsor feed")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Sponsor feed request failed with status {}",
            response.status()
        ));
    }

    response.json().context("Failed to parse sponsor feed")
}

/// Replace the sponsor register with a fresh feed snapshot. Gated on the
/// source registry like every other ingestion path.
pub fn refresh_from_feed(db: &mut Database, settings: &AppSettings) -> anyhow::Result<usize> {
    if !sources::is_enabled(settings, Source::VisaFeed) {
        return Err(anyhow!(
            "visa-feed source is disabled. Set sponsor_feed_url with 'pursuit settings set'."
        ));
    }
    let url = settings.sponsor_feed_url.clone().unwrap_or_default();
    let records = fetch_feed(&url)?;
    let count = store_records(db, &records)?;
    info!(count, "sponsor register refreshed");
    Ok(count)
}

pub fn store_records(db: &mut Database, records: &[SponsorRecord]) -> Result<usize> {
    let rows: Vec<(String, String, Option<String>)> = records
        .iter()
        .filter_map(|r| {
            let normalized = normalize_company(&r.name);
            if normalized.is_empty() {
                None
            } else {
                Some((r.name.clone(), normalized, r.route.clone()))
            }
        })
        .collect();
    db.replace_sponsors(&rows)
}

#[derive(Debug, Default)]
pub struct CrossRefStats {
    pub checked: usize,
    pub flagged: usize,
    pub unflagged: usize,
    pub skipped: usize,
}

/// Populate the visa-sponsor flag on every posting with a known company.
/// Postings without one keep a NULL flag.
pub fn cross_reference(db: &Database) -> Result<CrossRefStats> {
    let sponsors = db.list_sponsors()?;
    let postings = db.list_postings(StageFilter::All)?;

    let mut stats = CrossRefStats::default();
    for posting in postings {
        let Some(company) = posting.company.as_deref() else {
            stats.skipped += 1;
            continue;
        };
        let normalized = normalize_company(company);
        if normalized.is_empty() {
            stats.skipped += 1;
            continue;
        }

        stats.checked += 1;
        let sponsored = matches_sponsor(&normalized, &sponsors);
        db.set_visa_sponsor(posting.id, sponsored)?;
        if sponsored {
            debug!(posting_id = posting.id, company, "company is a licensed sponsor");
            stats.flagged += 1;
        } else {
            stats.unflagged += 1;
        }
    }
    Ok(stats)
}

fn matches_sponsor(normalized_company: &str, sponsors: &[Sponsor]) -> bool {
    sponsors.iter().any(|s| {
        s.normalized_name == normalized_company
            || jaro_winkler(&s.normalized_name, normalized_company) >= FUZZY_MATCH_THRESHOLD
    })
}
