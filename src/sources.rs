use std::collections::BTreeSet;

use crate::models::Source;
use crate::settings::AppSettings;

/// Credential fields a source declares as required before it may ingest.
pub fn required_credentials(source: Source) -> &'static [&'static str] {
    match source {
        Source::SearchApi => &["adzuna_app_id", "adzuna_app_key"],
        Source::Webhook => &["webhook_secret"],
        Source::VisaFeed => &["sponsor_feed_url"],
        Source::Manual => &[],
    }
}

fn credential<'a>(settings: &'a AppSettings, field: &str) -> Option<&'a str> {
    match field {
        "adzuna_app_id" => settings.adzuna_app_id.as_deref(),
        "adzuna_app_key" => settings.adzuna_app_key.as_deref(),
        "webhook_secret" => settings.webhook_secret.as_deref(),
        "sponsor_feed_url" => settings.sponsor_feed_url.as_deref(),
        _ => None,
    }
}

/// Pure function of the current settings; never cached as process state.
/// A source is enabled iff every required credential is present and
/// non-empty, so partial credentials never enable anything.
pub fn enabled_sources(settings: &AppSettings) -> BTreeSet<Source> {
    Source::ALL
        .iter()
        .copied()
        .filter(|source| {
            required_credentials(*source)
                .iter()
                .all(|field| credential(settings, field).is_some_and(|v| !v.trim().is_empty()))
        })
        .collect()
}

pub fn is_enabled(settings: &AppSettings, source: Source) -> bool {
    enabled_sources(settings).contains(&source)
}
