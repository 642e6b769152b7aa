use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::Project;

/// Upper bound for `max_projects`; user values are clamped into
/// `0..=MAX_SELECTABLE_PROJECTS` rather than rejected.
pub const MAX_SELECTABLE_PROJECTS: usize = 10;

pub const DEFAULT_MAX_PROJECTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // per-source credentials; absence or empty string leaves a source disabled
    pub adzuna_app_id: Option<String>,
    pub adzuna_app_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub sponsor_feed_url: Option<String>,

    // project selection preferences for generation prompts
    pub max_projects: usize,
    pub locked_project_ids: Vec<i64>,
    pub ai_selectable_project_ids: Vec<i64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            adzuna_app_id: None,
            adzuna_app_key: None,
            webhook_secret: None,
            sponsor_feed_url: None,
            max_projects: DEFAULT_MAX_PROJECTS,
            locked_project_ids: Vec::new(),
            ai_selectable_project_ids: Vec::new(),
        }
    }
}

/// A partial settings edit. `None` fields keep the current value; list
/// fields replace the stored list wholesale.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub adzuna_app_id: Option<String>,
    pub adzuna_app_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub sponsor_feed_url: Option<String>,
    pub max_projects: Option<usize>,
    pub locked_project_ids: Option<Vec<i64>>,
    pub ai_selectable_project_ids: Option<Vec<i64>>,
}

/// Validate an update against the current settings and produce the value to
/// persist. Nothing is written here; a validation failure leaves the stored
/// settings untouched (the caller only saves the Ok result).
pub fn apply_update(current: &AppSettings, update: SettingsUpdate) -> Result<AppSettings> {
    let mut next = current.clone();

    if let Some(v) = update.adzuna_app_id {
        next.adzuna_app_id = non_empty(v);
    }
    if let Some(v) = update.adzuna_app_key {
        next.adzuna_app_key = non_empty(v);
    }
    if let Some(v) = update.webhook_secret {
        next.webhook_secret = non_empty(v);
    }
    if let Some(v) = update.sponsor_feed_url {
        next.sponsor_feed_url = non_empty(v);
    }
    if let Some(v) = update.max_projects {
        next.max_projects = v.min(MAX_SELECTABLE_PROJECTS);
    }
    if let Some(mut ids) = update.locked_project_ids {
        ids.sort_unstable();
        ids.dedup();
        next.locked_project_ids = ids;
    }
    if let Some(mut ids) = update.ai_selectable_project_ids {
        ids.sort_unstable();
        ids.dedup();
        next.ai_selectable_project_ids = ids;
    }

    let overlap: Vec<i64> = next
        .locked_project_ids
        .iter()
        .filter(|id| next.ai_selectable_project_ids.contains(id))
        .copied()
        .collect();
    if !overlap.is_empty() {
        return Err(PipelineError::InvalidSettings(format!(
            "project ids {:?} cannot be both locked and AI-selectable",
            overlap
        )));
    }

    Ok(next)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Pick the projects a generation prompt may mine. Locked projects are the
/// user's explicit picks and always included; AI-selectable projects fill
/// the remaining slots up to `max_projects`.
pub fn select_projects<'a>(settings: &AppSettings, all: &'a [Project]) -> Vec<&'a Project> {
    let mut chosen: Vec<&Project> = all
        .iter()
        .filter(|p| settings.locked_project_ids.contains(&p.id))
        .collect();

    for project in all {
        if chosen.len() >= settings.max_projects {
            break;
        }
        if settings.ai_selectable_project_ids.contains(&project.id)
            && !settings.locked_project_ids.contains(&project.id)
        {
            chosen.push(project);
        }
    }

    chosen
}
