use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    SearchApi,
    Manual,
    Webhook,
    VisaFeed,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::SearchApi,
        Source::Manual,
        Source::Webhook,
        Source::VisaFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::SearchApi => "search-api",
            Source::Manual => "manual",
            Source::Webhook => "webhook",
            Source::VisaFeed => "visa-feed",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s {
            "search-api" => Some(Source::SearchApi),
            "manual" => Some(Source::Manual),
            "webhook" => Some(Source::Webhook),
            "visa-feed" => Some(Source::VisaFeed),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discovered,
    Ready,
    Applied,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Ready => "ready",
            Stage::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "discovered" => Some(Stage::Discovered),
            "ready" => Some(Stage::Ready),
            "applied" => Some(Stage::Applied),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query-time filter; "all" is never a stored stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFilter {
    All,
    Only(Stage),
}

impl StageFilter {
    pub fn parse(s: &str) -> Option<StageFilter> {
        if s == "all" {
            Some(StageFilter::All)
        } else {
            Stage::parse(s).map(StageFilter::Only)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub source: Source,
    pub dedup_key: String,
    pub title: String,
    pub company: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub raw_payload: Option<String>,
    pub visa_sponsor: Option<bool>, // NULL until cross-referenced against the sponsor list
    pub stage: Stage,
    pub discovered_at: String,
    pub updated_at: String,
}

/// A normalized posting that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewPosting {
    pub source: Source,
    pub dedup_key: String,
    pub title: String,
    pub company: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub raw_payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Streaming,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Streaming => "streaming",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation/streaming session bound to a single posting.
///
/// `generation` is the counter value captured when the run started; chunks
/// emitted by a superseded run carry an older value and are discarded.
#[derive(Debug, Clone)]
pub struct GenerationRun {
    pub id: i64,
    pub posting_id: i64,
    pub status: RunStatus,
    pub generation: u64,
    pub chunks: Vec<String>,
    pub error: Option<String>,
}

impl GenerationRun {
    pub fn transcript(&self) -> String {
        self.chunks.concat()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub summary: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sponsor {
    pub id: i64,
    pub name: String,
    pub normalized_name: String,
    pub route: Option<String>,
}
