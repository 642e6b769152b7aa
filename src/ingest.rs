use scraper::Html;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::{Database, is_unique_violation};
use crate::error::{PipelineError, Result};
use crate::models::{NewPosting, Source};

/// Outcome of pushing one payload through the normalizer.
#[derive(Debug, Clone, Copy)]
pub struct Ingested {
    pub id: i64,
    /// false when the dedup key matched an existing posting
    pub created: bool,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub found: usize,
    pub added: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Convert a raw source payload into exactly one posting record.
///
/// Re-ingesting a payload whose dedup key already exists returns the
/// existing posting's id and leaves its stage untouched. Manual payloads
/// reaching this function are the user-confirmed ones; drafts under review
/// never get here (see [`infer_draft`] / [`confirm_draft`]).
pub fn normalize(db: &Database, source: Source, payload: &str) -> Result<Ingested> {
    let posting = match source {
        Source::SearchApi => extract_search_api(payload)?,
        Source::Webhook => extract_webhook(payload)?,
        Source::VisaFeed => extract_visa_feed(payload)?,
        Source::Manual => infer_draft(payload)?.into_new_posting(),
    };
    insert_normalized(db, posting)
}

/// Feed every element of a JSON array payload through the normalizer,
/// counting outcomes instead of aborting the batch on one bad record.
pub fn ingest_json_array(db: &Database, source: Source, payload: &str) -> Result<IngestStats> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| malformed(source, format!("invalid JSON: {}", e)))?;
    let items = value
        .as_array()
        .ok_or_else(|| malformed(source, "expected a JSON array of records".to_string()))?;

    let mut stats = IngestStats::default();
    for item in items {
        stats.found += 1;
        match normalize(db, source, &item.to_string()) {
            Ok(Ingested { created: true, .. }) => stats.added += 1,
            Ok(Ingested { created: false, .. }) => stats.duplicates += 1,
            Err(e) => {
                stats.errors += 1;
                warn!(source = %source, error = %e, "discarding record");
            }
        }
    }
    Ok(stats)
}

fn insert_normalized(db: &Database, posting: NewPosting) -> Result<Ingested> {
    if let Some(existing) = db.find_posting_by_dedup_key(&posting.dedup_key)? {
        debug!(
            id = existing.id,
            key = %posting.dedup_key,
            "dedup key already known; keeping existing posting"
        );
        return Ok(Ingested {
            id: existing.id,
            created: false,
        });
    }

    match db.insert_posting(&posting) {
        Ok(id) => Ok(Ingested { id, created: true }),
        // lost an insert race to another writer; the UNIQUE index is the backstop
        Err(e) if is_unique_violation(&e) => {
            match db.find_posting_by_dedup_key(&posting.dedup_key)? {
                Some(existing) => Ok(Ingested {
                    id: existing.id,
                    created: false,
                }),
                None => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

// --- Per-source extraction ---

fn extract_search_api(payload: &str) -> Result<NewPosting> {
    let source = Source::SearchApi;
    let value = parse_json(source, payload)?;

    let title = str_field(&value, "title")
        .ok_or_else(|| malformed(source, "missing title".to_string()))?;
    let company = value
        .get("company")
        .and_then(|c| c.get("display_name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let description = str_field(&value, "description").map(str::to_string);
    let url = str_field(&value, "redirect_url").map(str::to_string);
    let external_id = str_or_number_field(&value, "id");

    let dedup_key = compute_dedup_key(source, url.as_deref(), external_id.as_deref())
        .ok_or_else(|| malformed(source, "missing both redirect_url and id".to_string()))?;

    Ok(NewPosting {
        source,
        dedup_key,
        title: title.to_string(),
        company,
        description,
        url,
        raw_payload: Some(payload.to_string()),
    })
}

fn extract_webhook(payload: &str) -> Result<NewPosting> {
    let source = Source::Webhook;
    let value = parse_json(source, payload)?;

    let title = str_field(&value, "title")
        .ok_or_else(|| malformed(source, "missing title".to_string()))?;
    let company = str_field(&value, "company").map(str::to_string);
    // webhook senders often post HTML descriptions
    let description = str_field(&value, "description")
        .map(|d| if d.contains('<') { html_to_text(d) } else { d.to_string() });
    let url = str_field(&value, "url").map(str::to_string);
    let external_id = str_or_number_field(&value, "external_id");

    let dedup_key = compute_dedup_key(source, url.as_deref(), external_id.as_deref())
        .ok_or_else(|| malformed(source, "missing both url and external_id".to_string()))?;

    Ok(NewPosting {
        source,
        dedup_key,
        title: title.to_string(),
        company,
        description,
        url,
        raw_payload: Some(payload.to_string()),
    })
}

fn extract_visa_feed(payload: &str) -> Result<NewPosting> {
    let source = Source::VisaFeed;
    let value = parse_json(source, payload)?;

    let title = str_field(&value, "title")
        .ok_or_else(|| malformed(source, "missing title".to_string()))?;
    let company = str_field(&value, "organisation")
        .or_else(|| str_field(&value, "company"))
        .ok_or_else(|| malformed(source, "missing organisation".to_string()))?;
    let description = str_field(&value, "description").map(str::to_string);
    let url = str_field(&value, "url").map(str::to_string);
    let external_id = str_or_number_field(&value, "id");

    let dedup_key = compute_dedup_key(source, url.as_deref(), external_id.as_deref())
        .ok_or_else(|| malformed(source, "missing both url and id".to_string()))?;

    Ok(NewPosting {
        source,
        dedup_key,
        title: title.to_string(),
        company: Some(company.to_string()),
        description,
        url,
        raw_payload: Some(payload.to_string()),
    })
}

fn parse_json(source: Source, payload: &str) -> Result<Value> {
    serde_json::from_str(payload).map_err(|e| malformed(source, format!("invalid JSON: {}", e)))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn str_or_number_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn malformed(source: Source, reason: String) -> PipelineError {
    warn!(source = %source, %reason, "malformed payload discarded");
    PipelineError::MalformedPayload { source, reason }
}

// --- Dedup key ---

/// One canonical key per external posting, regardless of which source
/// delivered it: the normalized external URL when present, else a
/// source-qualified external id.
pub fn compute_dedup_key(
    source: Source,
    url: Option<&str>,
    external_id: Option<&str>,
) -> Option<String> {
    if let Some(url) = url {
        if let Some(normalized) = normalize_url(url) {
            return Some(normalized);
        }
    }
    external_id.map(|id| format!("{}:{}", source, id))
}

/// Case- and trailing-slash-normalized, with tracking query parameters and
/// fragments stripped. Returns None for an effectively empty URL.
pub fn normalize_url(url: &str) -> Option<String> {
    let mut url = url.trim();
    if let Some(idx) = url.find('#') {
        url = &url[..idx];
    }
    if let Some(idx) = url.find('?') {
        url = &url[..idx];
    }
    let normalized = url.to_lowercase();
    let normalized = normalized.trim_end_matches('/');
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// --- Manual paste-and-infer ---

/// An inferred draft under user review. Ephemeral on purpose: nothing is
/// persisted until [`confirm_draft`] runs, so abandoning the review leaves
/// no trace in the store.
#[derive(Debug, Clone)]
pub struct ManualDraft {
    pub title: String,
    pub company: Option<String>,
    pub url: Option<String>,
    pub description: String,
    raw: String,
}

impl ManualDraft {
    fn into_new_posting(self) -> NewPosting {
        let dedup_key = compute_dedup_key(Source::Manual, self.url.as_deref(), None)
            .unwrap_or_else(|| manual_fallback_key(&self.title, self.company.as_deref()));
        NewPosting {
            source: Source::Manual,
            dedup_key,
            title: self.title,
            company: self.company,
            description: Some(self.description),
            url: self.url,
            raw_payload: Some(self.raw),
        }
    }
}

/// Infer a draft posting from pasted text. Pure inspection of the paste;
/// the store is not touched.
pub fn infer_draft(payload: &str) -> Result<ManualDraft> {
    let source = Source::Manual;
    let text = if payload.trim_start().starts_with('<') {
        html_to_text(payload)
    } else {
        payload.to_string()
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed(source, "empty paste".to_string()));
    }

    let title = extract_title(trimmed);
    let company = extract_company(trimmed);
    let url = extract_url(trimmed);

    Ok(ManualDraft {
        title,
        company,
        url,
        description: trimmed.to_string(),
        raw: payload.to_string(),
    })
}

/// Persist a reviewed draft through the same dedup path as every other
/// source. New postings land in stage `discovered`.
pub fn confirm_draft(db: &Database, draft: &ManualDraft) -> Result<Ingested> {
    insert_normalized(db, draft.clone().into_new_posting())
}

fn extract_title(content: &str) -> String {
    // first non-empty line, or first 100 chars
    let first_line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(content);
    if first_line.len() > 100 {
        format!("{}...", &first_line[..97])
    } else {
        first_line.to_string()
    }
}

fn extract_company(content: &str) -> Option<String> {
    // Pattern: "at <Company>"
    let lower = content.to_lowercase();
    if let Some(idx) = lower.find(" at ") {
        let after = &content[idx + 4..];
        let end = after
            .find(|c: char| c == '\n' || c == ',' || c == '-' || c == '.')
            .unwrap_or(after.len());
        let company = after[..end].trim();
        if !company.is_empty() && company.len() < 50 {
            return Some(company.to_string());
        }
    }
    None
}

fn extract_url(content: &str) -> Option<String> {
    let re = regex::Regex::new(r#"https?://[^\s"'<>]+"#).ok()?;
    re.find(content).map(|m| m.as_str().to_string())
}

fn manual_fallback_key(title: &str, company: Option<&str>) -> String {
    format!(
        "manual:{}|{}",
        title.to_lowercase(),
        company.unwrap_or("").to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Stage, StageFilter};

    #[test]
    fn test_normalize_url_case_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://Jobs.Example.COM/View/123/"),
            Some("https://jobs.example.com/view/123".to_string())
        );
        assert_eq!(
            normalize_url("https://jobs.example.com/view/123"),
            normalize_url("https://JOBS.example.com/view/123/")
        );
    }

    #[test]
    fn test_normalize_url_strips_tracking_noise() {
        assert_eq!(
            normalize_url("https://example.com/job?utm_source=alert&ref=9#apply"),
            Some("https://example.com/job".to_string())
        );
        assert_eq!(normalize_url("   "), None);
        assert_eq!(normalize_url("?utm_source=x"), None);
    }

    #[test]
    fn test_compute_dedup_key_prefers_url_over_id() {
        let key = compute_dedup_key(
            Source::SearchApi,
            Some("https://Example.com/j/1/"),
            Some("adz-1"),
        );
        assert_eq!(key, Some("https://example.com/j/1".to_string()));

        let key = compute_dedup_key(Source::SearchApi, None, Some("adz-1"));
        assert_eq!(key, Some("search-api:adz-1".to_string()));

        assert_eq!(compute_dedup_key(Source::SearchApi, None, None), None);
    }

    #[test]
    fn test_extract_search_api_payload() {
        let payload = r#"{
            "id": 4321,
            "title": "Backend Engineer",
            "company": {"display_name": "Globex"},
            "description": "Build services.",
            "redirect_url": "https://adzuna.example/j/4321?se=alert"
        }"#;
        let posting = extract_search_api(payload).unwrap();
        assert_eq!(posting.title, "Backend Engineer");
        assert_eq!(posting.company.as_deref(), Some("Globex"));
        assert_eq!(posting.dedup_key, "https://adzuna.example/j/4321");
    }

    #[test]
    fn test_extract_search_api_requires_title() {
        let err = extract_search_api(r#"{"id": 1, "redirect_url": "https://x.test/1"}"#).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedPayload { source: Source::SearchApi, .. }
        ));
    }

    #[test]
    fn test_extract_search_api_requires_some_identity() {
        let err = extract_search_api(r#"{"title": "Engineer"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload { .. }));
    }

    #[test]
    fn test_extract_webhook_strips_html_description() {
        let payload = r#"{
            "title": "SRE",
            "company": "Initech",
            "description": "<p>Keep the <b>lights</b> on.</p>",
            "url": "https://boards.example/sre"
        }"#;
        let posting = extract_webhook(payload).unwrap();
        assert_eq!(posting.description.as_deref(), Some("Keep the lights on."));
    }

    #[test]
    fn test_extract_webhook_falls_back_to_external_id() {
        let posting =
            extract_webhook(r#"{"title": "SRE", "external_id": "evt-77"}"#).unwrap();
        assert_eq!(posting.dedup_key, "webhook:evt-77");
    }

    #[test]
    fn test_extract_visa_feed_requires_organisation() {
        let err = extract_visa_feed(r#"{"title": "Engineer", "id": "v1"}"#).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedPayload { source: Source::VisaFeed, .. }
        ));

        let posting = extract_visa_feed(
            r#"{"title": "Engineer", "organisation": "Acme Ltd", "id": "v1"}"#,
        )
        .unwrap();
        assert_eq!(posting.company.as_deref(), Some("Acme Ltd"));
        assert_eq!(posting.dedup_key, "visa-feed:v1");
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = normalize(&db, Source::Webhook, "not json").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload { .. }));
        assert!(db.list_postings(StageFilter::All).unwrap().is_empty());
    }

    #[test]
    fn test_reingest_same_key_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let payload = r#"{"title": "SRE", "url": "https://boards.example/sre"}"#;

        let first = normalize(&db, Source::Webhook, payload).unwrap();
        assert!(first.created);

        let second = normalize(&db, Source::Webhook, payload).unwrap();
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_postings(StageFilter::All).unwrap().len(), 1);
    }

    #[test]
    fn test_reingest_never_touches_stage() {
        let db = Database::open_in_memory().unwrap();
        let payload = r#"{"title": "SRE", "url": "https://boards.example/sre"}"#;
        let first = normalize(&db, Source::Webhook, payload).unwrap();

        assert!(db.compare_and_set_stage(first.id, Stage::Discovered, Stage::Ready).unwrap());
        let again = normalize(&db, Source::Webhook, payload).unwrap();
        assert!(!again.created);
        assert_eq!(db.get_posting(first.id).unwrap().unwrap().stage, Stage::Ready);
    }

    #[test]
    fn test_cross_source_dedup_resolves_to_one_record() {
        let db = Database::open_in_memory().unwrap();
        let webhook = r#"{"title": "SRE", "url": "https://Boards.example/sre/"}"#;
        let search = r#"{"title": "SRE", "id": 9, "redirect_url": "https://boards.example/sre?src=adz"}"#;

        let first = normalize(&db, Source::Webhook, webhook).unwrap();
        let second = normalize(&db, Source::SearchApi, search).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_infer_draft_from_plain_text() {
        let draft = infer_draft(
            "Senior Rust Engineer at Ferropolis\n\nWork on pipelines.\nApply: https://ferropolis.example/jobs/12?src=paste",
        )
        .unwrap();
        assert_eq!(draft.title, "Senior Rust Engineer at Ferropolis");
        assert_eq!(draft.company.as_deref(), Some("Ferropolis"));
        assert_eq!(
            draft.url.as_deref(),
            Some("https://ferropolis.example/jobs/12?src=paste")
        );
    }

    #[test]
    fn test_infer_draft_rejects_empty_paste() {
        let err = infer_draft("   \n  ").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedPayload { source: Source::Manual, .. }
        ));
    }

    #[test]
    fn test_unconfirmed_draft_persists_nothing() {
        let db = Database::open_in_memory().unwrap();
        let draft = infer_draft("Platform Engineer at Acme\nGreat job.").unwrap();

        // review happened, user walked away
        assert!(db.list_postings(StageFilter::All).unwrap().is_empty());

        let ingested = confirm_draft(&db, &draft).unwrap();
        assert!(ingested.created);
        let posting = db.get_posting(ingested.id).unwrap().unwrap();
        assert_eq!(posting.stage, Stage::Discovered);
        assert_eq!(posting.source, Source::Manual);
    }

    #[test]
    fn test_confirm_draft_twice_dedupes() {
        let db = Database::open_in_memory().unwrap();
        let draft = infer_draft("Platform Engineer at Acme\nhttps://acme.example/jobs/1").unwrap();

        let first = confirm_draft(&db, &draft).unwrap();
        let second = confirm_draft(&db, &draft).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_ingest_json_array_counts_outcomes() {
        let db = Database::open_in_memory().unwrap();
        let payload = r#"[
            {"title": "A", "organisation": "Acme", "id": "1"},
            {"title": "A", "organisation": "Acme", "id": "1"},
            {"organisation": "NoTitle Ltd", "id": "2"}
        ]"#;
        let stats = ingest_json_array(&db, Source::VisaFeed, payload).unwrap();
        assert_eq!(stats.found, 3);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.errors, 1);
    }
}
