use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::agent::{AgentEvent, AgentProcessClient};
use crate::config::Config;
use crate::error::{AgentError, SupervisorError};
use crate::session::{SessionRecord, SessionStore};

/// What happens to a background turn once it succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Drop the turn from the transcript so it does not pollute the conversation
    Prune,
    Keep,
    /// Prune only if the reply contains this marker
    PruneIfContains(&'static str),
}

impl Retention {
    fn should_prune(self, reply: &str) -> bool {
        match self {
            Retention::Prune => true,
            Retention::Keep => false,
            Retention::PruneIfContains(marker) => reply.contains(marker),
        }
    }
}

/// Serializes all agent work and owns the session lifecycle.
///
/// Interactive messages and heartbeat tasks both come through here; at most
/// one invocation is in flight and a second caller is rejected, not queued.
pub struct Supervisor {
    config: Arc<Config>,
    client: AgentProcessClient,
    session: Mutex<SessionStore>,
    busy: AtomicBool,
}

/// Clears the busy flag when the invocation ends, however it ends
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Supervisor {
    pub async fn new(config: Arc<Config>) -> Self {
        let mut store = SessionStore::new(&config.session_file_path);
        match store.load().await {
            Some(id) => info!(session = %id, "Resuming stored session"),
            None => info!("No stored session, the next message starts one"),
        }
        Self {
            client: AgentProcessClient::new(config.clone()),
            session: Mutex::new(store),
            busy: AtomicBool::new(false),
            config,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn session_stats(&self) -> Option<SessionRecord> {
        self.session.lock().await.stats()
    }

    /// Forget the stored session so the next message starts a new one
    pub async fn clear_session(&self) -> anyhow::Result<()> {
        self.session.lock().await.clear().await
    }

    /// Run an interactive message, streaming every event to `on_event`.
    ///
    /// Failures are reported both as the returned error and as a terminal
    /// `Error` event, so stream consumers need not inspect the result.
    pub async fn run<F>(
        &self,
        content: &str,
        session_override: Option<&str>,
        mut on_event: F,
    ) -> Result<(), SupervisorError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let Some(_guard) = self.try_acquire() else {
            on_event(AgentEvent::Error {
                message: SupervisorError::Busy.to_string(),
            });
            return Err(SupervisorError::Busy);
        };

        let session = match session_override {
            Some(id) => Some(id.to_string()),
            None => self.current_session().await,
        };
        let result = self.invoke(content, session, &mut on_event).await;
        if let Err(e) = &result {
            error!(error = %e, "Agent invocation failed");
            on_event(AgentEvent::Error {
                message: e.to_string(),
            });
        }

        self.compact().await;
        result.map_err(Into::into)
    }

    /// Run a background prompt in the current session and return its text
    pub async fn execute_task(&self, prompt: &str, retention: Retention) -> Result<String, SupervisorError> {
        let Some(_guard) = self.try_acquire() else {
            return Err(SupervisorError::Busy);
        };

        let session = self.current_session().await;
        let mut text = String::new();
        let mut collect = |event: AgentEvent| {
            if let Some(fragment) = event.assistant_text() {
                text.push_str(fragment);
            }
        };
        let result = self.invoke(prompt, session, &mut collect).await;

        if result.is_ok() && retention.should_prune(&text) {
            self.prune_current().await;
        }
        self.compact().await;
        result?;
        Ok(text)
    }

    /// Ask a one-off question in a throwaway session, leaving the stored one untouched
    pub async fn ask(&self, prompt: &str) -> Result<String, SupervisorError> {
        let Some(_guard) = self.try_acquire() else {
            return Err(SupervisorError::Busy);
        };
        Ok(self.client.run_sync(prompt, None).await?)
    }

    /// Drop the most recent turn from the stored session's transcript
    pub async fn prune_last_turn(&self) -> Result<(), SupervisorError> {
        let Some(_guard) = self.try_acquire() else {
            return Err(SupervisorError::Busy);
        };
        self.prune_current().await;
        Ok(())
    }

    fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    async fn current_session(&self) -> Option<String> {
        self.session.lock().await.stats().map(|record| record.session_id)
    }

    async fn prune_current(&self) {
        if let Some(session_id) = self.current_session().await {
            self.client.prune_last_turn(&session_id).await;
        }
    }

    async fn compact(&self) {
        if let Some(session_id) = self.current_session().await {
            self.client.compact_session(&session_id).await;
        }
    }

    /// Run the agent, retrying once without a session if it reports the
    /// stored one as unusable
    async fn invoke<F>(
        &self,
        prompt: &str,
        mut session: Option<String>,
        on_event: &mut F,
    ) -> Result<(), AgentError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let corruption_code = self.config.agent.session_corruption_exit_code;
        let mut retried = false;
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let agent = async {
                let tx = tx;
                self.client
                    .run(prompt, session.as_deref(), &self.config.agent.extensions, |event| {
                        let _ = tx.send(event);
                    })
                    .await
            };
            // Session persistence awaits file I/O, so events are observed off the reader
            let forward = async {
                let mut effective = session.clone();
                while let Some(event) = rx.recv().await {
                    self.observe(&event, &mut effective).await;
                    on_event(event);
                }
            };
            let (result, ()) = tokio::join!(agent, forward);

            match result {
                Err(e) if !retried && e.exit_code() == Some(corruption_code) => {
                    warn!(
                        session = session.as_deref().unwrap_or("none"),
                        code = corruption_code,
                        "Agent rejected the session, retrying with a fresh one"
                    );
                    if let Err(e) = self.session.lock().await.clear().await {
                        warn!(error = %e, "Failed to clear corrupted session");
                    }
                    session = None;
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Keep the session record in step with the event stream.
    ///
    /// `effective` starts as the session the agent was resumed with and
    /// follows any id the agent announces, so usage lands on the session
    /// that actually served the invocation.
    async fn observe(&self, event: &AgentEvent, effective: &mut Option<String>) {
        match event {
            AgentEvent::Init { session_id, .. } => {
                *effective = Some(session_id.clone());
                let mut store = self.session.lock().await;
                let known = store.stats().is_some_and(|r| &r.session_id == session_id);
                if !known {
                    if let Err(e) = store.save(session_id).await {
                        warn!(error = %e, "Failed to persist session");
                    }
                }
            }
            AgentEvent::Done { usage } => {
                let Some(session_id) = effective.as_deref() else {
                    return;
                };
                let mut store = self.session.lock().await;
                if let Err(e) = store.save(session_id).await {
                    warn!(error = %e, "Failed to persist session");
                    return;
                }
                if let Some(usage) = usage {
                    if let Err(e) = store.update_usage(usage).await {
                        warn!(error = %e, "Failed to record usage");
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{recorded_calls as calls, scripted_config};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;

    const REPLY: &str = r#"
echo '{"type":"init","session_id":"abcdef12-live"}'
echo '{"type":"message","role":"assistant","content":"on it"}'
echo '{"type":"result","status":"success","stats":{"input_tokens":100,"output_tokens":20,"cached":40}}'
"#;

    async fn supervisor_for(home: &Path, script: &str) -> Supervisor {
        Supervisor::new(Arc::new(scripted_config(home, script))).await
    }

    fn seed_session(home: &Path, id: &str) {
        let data = home.join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(
            data.join("session.json"),
            json!({"sessionId": id, "interactionCount": 3}).to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_learns_and_persists_session() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(home.path(), REPLY).await;
        assert!(supervisor.session_stats().await.is_none());

        let mut events = Vec::new();
        supervisor
            .run("hello", None, |event| events.push(event))
            .await
            .unwrap();

        assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));
        let stats = supervisor.session_stats().await.unwrap();
        assert_eq!(stats.session_id, "abcdef12-live");
        assert_eq!(stats.interaction_count, 1);
        assert_eq!(stats.total_input_tokens, 100);
        assert_eq!(stats.total_net_tokens, 60);

        let saved: Value = serde_json::from_str(
            &std::fs::read_to_string(home.path().join("data/session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved["sessionId"], "abcdef12-live");

        supervisor.run("again", None, |_| {}).await.unwrap();
        let calls = calls(home.path());
        assert!(!calls[0].contains("--resume"));
        assert!(calls[1].contains("--resume abcdef12-live"));
        assert_eq!(supervisor.session_stats().await.unwrap().interaction_count, 2);
    }

    #[tokio::test]
    async fn test_session_override_wins() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "stored");
        let supervisor = supervisor_for(home.path(), REPLY).await;

        supervisor.run("hi", Some("explicit"), |_| {}).await.unwrap();
        assert!(calls(home.path())[0].contains("--resume explicit"));
    }

    #[tokio::test]
    async fn test_busy_rejects_without_spawning() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(
            home.path(),
            r#"sleep 1; echo '{"type":"done"}'"#,
        )
        .await;

        let first = supervisor.run("slow", None, |_| {});
        let second = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(supervisor.is_busy());
            let mut events = Vec::new();
            let result = supervisor.run("impatient", None, |e| events.push(e)).await;
            (result, events)
        };
        let (first, (second, events)) = tokio::join!(first, second);

        first.unwrap();
        assert!(matches!(second, Err(SupervisorError::Busy)));
        assert_eq!(
            events,
            vec![AgentEvent::Error {
                message: "supervisor busy".into()
            }]
        );
        assert_eq!(calls(home.path()).len(), 1);
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_execute_task_fails_fast_when_busy() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(home.path(), REPLY).await;

        let guard = supervisor.try_acquire().unwrap();
        let result = supervisor.execute_task("check mail", Retention::Prune).await;
        assert!(matches!(result, Err(SupervisorError::Busy)));
        assert!(calls(home.path()).is_empty());

        drop(guard);
        let text = supervisor.execute_task("check mail", Retention::Keep).await.unwrap();
        assert_eq!(text, "on it");
    }

    #[tokio::test]
    async fn test_corrupted_session_retries_once_fresh() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "stale");
        let supervisor = supervisor_for(
            home.path(),
            &format!(
                r#"
if [ ! -f "$HOME/failed-once" ]; then
  touch "$HOME/failed-once"
  exit 42
fi
{REPLY}"#
            ),
        )
        .await;

        supervisor.run("hello", None, |_| {}).await.unwrap();

        let calls = calls(home.path());
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("--resume stale"));
        assert!(!calls[1].contains("--resume"));
        let stats = supervisor.session_stats().await.unwrap();
        assert_eq!(stats.session_id, "abcdef12-live");
        assert_eq!(stats.interaction_count, 1);
    }

    #[tokio::test]
    async fn test_corruption_retry_is_bounded() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "stale");
        let supervisor = supervisor_for(home.path(), "exit 42").await;

        let mut events = Vec::new();
        let result = supervisor.run("hello", None, |e| events.push(e)).await;

        assert!(matches!(
            result,
            Err(SupervisorError::Agent(AgentError::NonZeroExit { code: Some(42) }))
        ));
        assert_eq!(calls(home.path()).len(), 2);
        assert!(matches!(events.last(), Some(AgentEvent::Error { .. })));
        assert!(supervisor.session_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_surfaces_as_error_event() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(home.path(), "exit 3").await;

        let mut events = Vec::new();
        let result = supervisor.run("hello", None, |e| events.push(e)).await;
        assert!(result.is_err());
        assert_eq!(
            events,
            vec![AgentEvent::Error {
                message: "agent exited with code 3".into()
            }]
        );
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_execute_task_retention() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "abcdef12-live");
        let supervisor = supervisor_for(home.path(), REPLY).await;

        let chats = crate::agent::Transcripts::new(home.path(), u64::MAX).chats_dir();
        std::fs::create_dir_all(&chats).unwrap();
        let transcript = chats.join("session-1-abcdef12.json");
        let turn = json!({"messages": [
            {"type": "gemini", "content": "earlier"},
            {"type": "user", "content": "check mail"},
            {"type": "gemini", "content": "on it"},
        ]});
        let read = || -> Value {
            serde_json::from_str(&std::fs::read_to_string(&transcript).unwrap()).unwrap()
        };

        std::fs::write(&transcript, turn.to_string()).unwrap();
        supervisor.execute_task("check mail", Retention::Keep).await.unwrap();
        assert_eq!(read()["messages"].as_array().unwrap().len(), 3);

        supervisor.execute_task("check mail", Retention::Prune).await.unwrap();
        assert_eq!(
            read()["messages"],
            json!([{"type": "gemini", "content": "earlier"}])
        );
    }

    #[tokio::test]
    async fn test_usage_lands_on_the_session_that_ran() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "stored");
        let supervisor = supervisor_for(
            home.path(),
            r#"echo '{"type":"result","status":"success","stats":{"input_tokens":100,"output_tokens":20,"cached":40}}'"#,
        )
        .await;

        supervisor.run("hi", Some("explicit"), |_| {}).await.unwrap();

        let stats = supervisor.session_stats().await.unwrap();
        assert_eq!(stats.session_id, "explicit");
        assert_eq!(stats.interaction_count, 1);
        assert_eq!(stats.total_input_tokens, 100);
        let saved: Value = serde_json::from_str(
            &std::fs::read_to_string(home.path().join("data/session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved["sessionId"], "explicit");
        assert_eq!(saved["interactionCount"], 1);
    }

    #[tokio::test]
    async fn test_conditional_retention_decides_on_the_reply() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "abcdef12-live");
        let supervisor = supervisor_for(home.path(), REPLY).await;

        let chats = crate::agent::Transcripts::new(home.path(), u64::MAX).chats_dir();
        std::fs::create_dir_all(&chats).unwrap();
        let transcript = chats.join("session-1-abcdef12.json");
        let turn = json!({"messages": [
            {"type": "gemini", "content": "earlier"},
            {"type": "user", "content": "anything new?"},
            {"type": "gemini", "content": "on it"},
        ]});
        let len = || -> usize {
            let doc: Value =
                serde_json::from_str(&std::fs::read_to_string(&transcript).unwrap()).unwrap();
            doc["messages"].as_array().unwrap().len()
        };

        std::fs::write(&transcript, turn.to_string()).unwrap();
        let reply = supervisor
            .execute_task("anything new?", Retention::PruneIfContains("NOTHING_TO_DO"))
            .await
            .unwrap();
        assert_eq!(reply, "on it");
        assert_eq!(len(), 3);

        supervisor
            .execute_task("anything new?", Retention::PruneIfContains("on it"))
            .await
            .unwrap();
        assert_eq!(len(), 1);
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_prune_last_turn_waits_for_idle() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "abcdef12-live");
        let supervisor = supervisor_for(home.path(), REPLY).await;

        let chats = crate::agent::Transcripts::new(home.path(), u64::MAX).chats_dir();
        std::fs::create_dir_all(&chats).unwrap();
        let transcript = chats.join("session-1-abcdef12.json");
        let turn = json!({"messages": [
            {"type": "gemini", "content": "earlier"},
            {"type": "user", "content": "hello"},
            {"type": "gemini", "content": "hi"},
        ]})
        .to_string();
        std::fs::write(&transcript, &turn).unwrap();

        let guard = supervisor.try_acquire().unwrap();
        let result = supervisor.prune_last_turn().await;
        assert!(matches!(result, Err(SupervisorError::Busy)));
        assert_eq!(std::fs::read_to_string(&transcript).unwrap(), turn);

        drop(guard);
        supervisor.prune_last_turn().await.unwrap();
        assert_ne!(std::fs::read_to_string(&transcript).unwrap(), turn);
    }

    #[tokio::test]
    async fn test_ask_leaves_stored_session_alone() {
        let home = tempfile::tempdir().unwrap();
        seed_session(home.path(), "stored");
        let supervisor = supervisor_for(home.path(), REPLY).await;

        assert_eq!(supervisor.ask("side question").await.unwrap(), "on it");

        assert!(!calls(home.path())[0].contains("--resume"));
        let stats = supervisor.session_stats().await.unwrap();
        assert_eq!(stats.session_id, "stored");
        assert_eq!(stats.interaction_count, 3);
    }
}
