use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Reasoning entries kept per message when compacting
const KEEP_THOUGHTS: usize = 3;

/// Result of a compaction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compaction {
    pub before_bytes: u64,
    pub after_bytes: u64,
}

/// Access to the agent's persisted chat transcripts.
///
/// The agent keeps one JSON file per session under
/// `<home>/.gemini/tmp/<sha256(home)>/chats/`, named
/// `session-<timestamp>-<id prefix>.json`. Only the newest file matching a
/// session is ever touched.
#[derive(Debug, Clone)]
pub struct Transcripts {
    home_dir: PathBuf,
    compact_threshold: u64,
}

impl Transcripts {
    pub fn new(home_dir: impl Into<PathBuf>, compact_threshold: u64) -> Self {
        Self {
            home_dir: home_dir.into(),
            compact_threshold,
        }
    }

    /// Directory the agent writes transcripts to for this home
    pub fn chats_dir(&self) -> PathBuf {
        let project_hash = Sha256::digest(self.home_dir.to_string_lossy().as_bytes());
        self.home_dir
            .join(".gemini")
            .join("tmp")
            .join(format!("{project_hash:x}"))
            .join("chats")
    }

    /// Newest transcript file belonging to `session_id`
    pub async fn locate(&self, session_id: &str) -> Result<Option<PathBuf>> {
        let dir = self.chats_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to list transcript directory"),
        };

        let prefix: String = session_id.chars().take(8).collect();
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("session-") && name.ends_with(".json") && name.contains(&prefix)) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
                newest = Some((modified, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Drop the last user turn and everything after it.
    ///
    /// Returns the index the transcript was truncated at, or `None` when
    /// there was no transcript or no user entry.
    pub async fn prune_last_turn(&self, session_id: &str) -> Result<Option<usize>> {
        let Some(path) = self.locate(session_id).await? else {
            return Ok(None);
        };
        let mut doc = read_document(&path).await?;
        let Some(index) = truncate_before_last_user(&mut doc) else {
            return Ok(None);
        };
        write_document(&path, &doc).await?;
        debug!(path = %path.display(), index, "Pruned transcript");
        Ok(Some(index))
    }

    /// Strip auxiliary metadata from an oversized transcript
    pub async fn compact(&self, session_id: &str) -> Result<Option<Compaction>> {
        let Some(path) = self.locate(session_id).await? else {
            return Ok(None);
        };
        let before_bytes = tokio::fs::metadata(&path).await?.len();
        if before_bytes < self.compact_threshold {
            return Ok(None);
        }

        let mut doc = read_document(&path).await?;
        compact_document(&mut doc);
        write_document(&path, &doc).await?;
        let after_bytes = tokio::fs::metadata(&path).await?.len();
        Ok(Some(Compaction {
            before_bytes,
            after_bytes,
        }))
    }
}

async fn read_document(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed transcript {}", path.display()))
}

async fn write_document(path: &Path, doc: &Value) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_string_pretty(doc)?).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace transcript {}", path.display()))
}

/// Truncate `messages` (or the older `history` layout) before its last user entry
fn truncate_before_last_user(doc: &mut Value) -> Option<usize> {
    for (list, key, user) in [("messages", "type", "user"), ("history", "role", "user")] {
        let Some(entries) = doc.get_mut(list).and_then(Value::as_array_mut) else {
            continue;
        };
        if entries.is_empty() {
            continue;
        }
        let index = entries
            .iter()
            .rposition(|entry| entry.get(key).and_then(Value::as_str) == Some(user))?;
        entries.truncate(index);
        return Some(index);
    }
    None
}

fn compact_document(doc: &mut Value) {
    for list in ["messages", "history"] {
        if let Some(entries) = doc.get_mut(list).and_then(Value::as_array_mut) {
            entries.iter_mut().for_each(compact_entry);
        }
    }
}

fn compact_entry(entry: &mut Value) {
    let Some(obj) = entry.as_object_mut() else {
        return;
    };
    obj.remove("resultDisplay");

    if let Some(thoughts) = obj.get_mut("thoughts").and_then(Value::as_array_mut) {
        if thoughts.len() > KEEP_THOUGHTS {
            thoughts.drain(..thoughts.len() - KEEP_THOUGHTS);
        }
    }

    if let Some(calls) = obj.get_mut("toolCalls").and_then(Value::as_array_mut) {
        for call in calls.iter_mut().filter_map(Value::as_object_mut) {
            call.remove("resultDisplay");
        }
    }

    if let Some(content) = obj.get_mut("content").and_then(Value::as_array_mut) {
        for item in content.iter_mut() {
            let Some(results) = item.get_mut("result").and_then(Value::as_array_mut) else {
                continue;
            };
            for result in results.iter_mut() {
                if let Some(response) = result
                    .pointer_mut("/functionResponse/response")
                    .and_then(Value::as_object_mut)
                {
                    response.remove("resultDisplay");
                }
            }
        }
    }
}
