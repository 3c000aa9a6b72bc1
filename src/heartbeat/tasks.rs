use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::schedule::parse_timestamp;

/// Whether a task's result is surfaced to the operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Silent,
    Notify,
}

/// A scheduled background prompt, as written by the task store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub prompt: String,
    /// Cron expression or absolute timestamp
    pub schedule: String,
    pub next_run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    /// Fields owned by the task store that we carry through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Enabled and scheduled at or before `now`.
    ///
    /// An unreadable `nextRun` counts as due so the task gets rescheduled
    /// instead of silently never firing.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match parse_timestamp(&self.next_run) {
            Some(at) => at <= now,
            None => {
                warn!(task = %self.id, next_run = %self.next_run, "Unreadable nextRun, treating as due");
                true
            }
        }
    }
}

/// The JSON array of tasks shared with the task store
#[derive(Debug, Clone)]
pub struct TaskFile {
    path: PathBuf,
}

impl TaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All tasks; a missing file is an empty list
    pub async fn load(&self) -> Result<Vec<Task>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("Malformed task file {}", self.path.display()))
    }

    pub async fn save(&self, tasks: &[Task]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(tasks)?).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
