use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::agent::UsageStats;

/// Durable state of the active conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Size of the context at the last interaction, not a running sum
    pub total_input_tokens: u64,
    /// Cumulative
    pub total_output_tokens: u64,
    /// Cache state at the last interaction
    pub total_cached_tokens: u64,
    /// Cumulative input excluding cache hits
    pub total_net_tokens: u64,
    pub interaction_count: u64,
    pub last_interaction_at: DateTime<Utc>,
    pub last_input_tokens: u64,
}

impl SessionRecord {
    fn fresh(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_interaction_at: now,
            ..Self::default()
        }
    }

    /// Fold one invocation's usage into the record
    pub fn apply_usage(&mut self, usage: &UsageStats) {
        self.total_net_tokens += usage.net_input();
        self.total_input_tokens = usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cached_tokens = usage.cached_tokens;
        self.interaction_count += 1;
        self.last_interaction_at = Utc::now();
        self.last_input_tokens = usage.input_tokens;
    }
}

/// Single-record persistence of the active session and its token accounting
pub struct SessionStore {
    path: PathBuf,
    record: Option<SessionRecord>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record: None,
        }
    }

    /// Read the stored session, returning its id.
    ///
    /// Absent or unreadable records mean "no active session".
    pub async fn load(&mut self) -> Option<String> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read session");
                return None;
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse session");
                return None;
            }
        };
        let has_net = value.get("totalNetTokens").is_some();
        let mut record: SessionRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unexpected session shape");
                return None;
            }
        };
        if record.session_id.is_empty() {
            return None;
        }
        // Records written before net accounting existed
        if !has_net {
            record.total_net_tokens = record.total_input_tokens;
        }

        let session_id = record.session_id.clone();
        self.record = Some(record);
        Some(session_id)
    }

    /// Persist `session_id`, starting a fresh record only if it changed
    pub async fn save(&mut self, session_id: &str) -> Result<()> {
        let record = match self.record.take() {
            Some(record) if record.session_id == session_id => record,
            _ => SessionRecord::fresh(session_id),
        };
        self.record = Some(record);
        self.persist().await?;
        info!(session = session_id, "Session saved");
        Ok(())
    }

    /// Record the usage of the latest invocation
    pub async fn update_usage(&mut self, usage: &UsageStats) -> Result<()> {
        let Some(record) = self.record.as_mut() else {
            warn!("Cannot update usage without an active session");
            return Ok(());
        };
        record.apply_usage(usage);
        self.persist().await
    }

    pub fn stats(&self) -> Option<SessionRecord> {
        self.record.clone()
    }

    /// Forget the session, deleting the backing file
    pub async fn clear(&mut self) -> Result<()> {
        self.record = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Session cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete session file"),
        }
    }

    async fn persist(&self) -> Result<()> {
        let Some(record) = &self.record else {
            return Ok(());
        };
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create session directory")?;
        }
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("data").join("session.json"))
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        assert_eq!(store.load().await, None);
        assert!(store.stats().is_none());
    }

    #[tokio::test]
    async fn test_load_garbage_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(SessionStore::new(&path).load().await, None);

        std::fs::write(&path, r#"{"createdAt":"2026-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(SessionStore::new(&path).load().await, None);
    }

    #[tokio::test]
    async fn test_update_usage_is_asymmetric() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"sessionId":"test-session","totalInputTokens":100,"totalOutputTokens":50,"totalCachedTokens":10,"interactionCount":1}"#,
        )
        .unwrap();

        let mut store = SessionStore::new(&path);
        assert_eq!(store.load().await.as_deref(), Some("test-session"));
        store
            .update_usage(&UsageStats {
                input_tokens: 50,
                output_tokens: 25,
                cached_tokens: 5,
            })
            .await
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_input_tokens, 50);
        assert_eq!(stats.total_output_tokens, 75);
        assert_eq!(stats.total_cached_tokens, 5);
        assert_eq!(stats.total_net_tokens, 145);
        assert_eq!(stats.interaction_count, 2);
        assert_eq!(stats.last_input_tokens, 50);

        let mut reloaded = SessionStore::new(&path);
        reloaded.load().await;
        assert_eq!(reloaded.stats(), Some(stats));
    }

    #[tokio::test]
    async fn test_existing_net_tokens_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"sessionId":"s","totalInputTokens":100,"totalNetTokens":7}"#,
        )
        .unwrap();
        let mut store = SessionStore::new(&path);
        store.load().await;
        assert_eq!(store.stats().unwrap().total_net_tokens, 7);
    }

    #[tokio::test]
    async fn test_save_is_idempotent_for_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save("first").await.unwrap();
        store
            .update_usage(&UsageStats {
                input_tokens: 10,
                output_tokens: 3,
                cached_tokens: 0,
            })
            .await
            .unwrap();

        store.save("first").await.unwrap();
        assert_eq!(store.stats().unwrap().interaction_count, 1);

        store.save("second").await.unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.session_id, "second");
        assert_eq!(stats.interaction_count, 0);
        assert_eq!(stats.total_output_tokens, 0);
    }

    #[tokio::test]
    async fn test_update_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.update_usage(&UsageStats::default()).await.unwrap();
        assert!(store.stats().is_none());
        assert!(!dir.path().join("data").join("session.json").exists());
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save("doomed").await.unwrap();
        store.clear().await.unwrap();
        assert!(store.stats().is_none());
        assert_eq!(store.load().await, None);
        store.clear().await.unwrap();
    }
}
