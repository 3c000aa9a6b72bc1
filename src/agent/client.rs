use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::parser::StreamParser;
use super::{AgentEvent, Transcripts};
use crate::config::Config;
use crate::error::AgentError;

/// Spawns the external agent once per prompt and streams its output
pub struct AgentProcessClient {
    config: Arc<Config>,
    transcripts: Transcripts,
}

impl AgentProcessClient {
    pub fn new(config: Arc<Config>) -> Self {
        let transcripts =
            Transcripts::new(&config.home_dir, config.agent.compact_threshold_bytes);
        Self {
            config,
            transcripts,
        }
    }

    fn build_command(&self, prompt: &str, session_id: Option<&str>, extensions: &[String]) -> Command {
        let settings = &self.config.agent;
        let home = &self.config.home_dir;

        let mut cmd = Command::new(&settings.binary);
        cmd.args(&settings.leading_args)
            .args(["--output-format", "stream-json", "--yolo", "--include-directories"])
            .arg(home);
        if !settings.model.is_empty() && settings.model != "auto" {
            cmd.arg("--model").arg(&settings.model);
        }
        if let Some(session_id) = session_id {
            cmd.arg("--resume").arg(session_id);
        }
        for extension in extensions {
            cmd.arg("--extensions").arg(extension);
        }
        cmd.arg("--prompt").arg(prompt);

        // Keep the agent away from the operator's own dotfiles and project context
        cmd.env("HOME", home)
            .current_dir(home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run one invocation, handing every normalized event to `on_event`.
    ///
    /// Resolves once a completion record is seen (without waiting for the
    /// process to exit) or the process exits cleanly. Idle and total timers
    /// kill the process and reject.
    pub async fn run<F>(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        extensions: &[String],
        mut on_event: F,
    ) -> Result<(), AgentError>
    where
        F: FnMut(AgentEvent) + Send,
    {
        let settings = &self.config.agent;
        if let Err(e) = tokio::fs::create_dir_all(&self.config.home_dir).await {
            warn!(error = %e, "Could not create agent home directory");
        }

        info!(
            binary = %settings.binary,
            session = session_id.unwrap_or("new"),
            "Spawning agent"
        );
        let mut child = self
            .build_command(prompt, session_id, extensions)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                binary: settings.binary.clone(),
                source,
            })?;

        let Some(mut stdout) = child.stdout.take() else {
            kill(&mut child).await;
            return Err(AgentError::MissingStdout);
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        let started = Instant::now();
        let deadline = started + settings.total_timeout;
        let total = tokio::time::sleep_until(deadline);
        tokio::pin!(total);
        let idle = tokio::time::sleep(settings.idle_timeout);
        tokio::pin!(idle);

        let mut parser = StreamParser::new();
        let mut buf = vec![0u8; 8192];

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(error = %e, "Failed reading agent stdout");
                            break;
                        }
                    };
                    idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                    for event in parser.push(&buf[..n]) {
                        on_event(event);
                    }
                    if parser.is_finished() {
                        break;
                    }
                }
                () = &mut idle => {
                    warn!(idle = ?settings.idle_timeout, "Agent went idle, killing");
                    kill(&mut child).await;
                    return Err(AgentError::IdleTimeout(settings.idle_timeout));
                }
                () = &mut total => {
                    warn!(limit = ?settings.total_timeout, "Agent exceeded total run time, killing");
                    kill(&mut child).await;
                    return Err(AgentError::TotalTimeout(settings.total_timeout));
                }
            }
        }

        if !parser.is_finished() {
            for event in parser.finish() {
                on_event(event);
            }
        }
        if parser.is_finished() {
            // Some agent builds hold the pipe open after the result record
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Agent signalled completion");
            reap_in_background(child);
            return Ok(());
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status.map_err(AgentError::Wait)?,
            Err(_) => {
                warn!(limit = ?settings.total_timeout, "Agent did not exit in time, killing");
                kill(&mut child).await;
                return Err(AgentError::TotalTimeout(settings.total_timeout));
            }
        };
        info!(
            code = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Agent exited"
        );

        if status.success() {
            on_event(parser.complete());
            Ok(())
        } else {
            Err(AgentError::NonZeroExit {
                code: status.code(),
            })
        }
    }

    /// Run a prompt and return only the assistant's text
    pub async fn run_sync(&self, prompt: &str, session_id: Option<&str>) -> Result<String, AgentError> {
        let mut text = String::new();
        self.run(prompt, session_id, &self.config.agent.extensions, |event| {
            if let Some(fragment) = event.assistant_text() {
                text.push_str(fragment);
            }
        })
        .await?;
        Ok(text)
    }

    /// Discard the most recent turn of a session's transcript
    pub async fn prune_last_turn(&self, session_id: &str) {
        match self.transcripts.prune_last_turn(session_id).await {
            Ok(Some(index)) => debug!(session = session_id, index, "Pruned last turn"),
            Ok(None) => debug!(session = session_id, "Nothing to prune"),
            Err(e) => warn!(session = session_id, error = %e, "Pruning failed"),
        }
    }

    /// Compact a session's transcript if it has grown past the threshold
    pub async fn compact_session(&self, session_id: &str) {
        match self.transcripts.compact(session_id).await {
            Ok(Some(c)) => info!(
                session = session_id,
                before_kb = c.before_bytes / 1024,
                after_kb = c.after_bytes / 1024,
                "Compacted transcript"
            ),
            Ok(None) => {}
            Err(e) => warn!(session = session_id, error = %e, "Compaction failed"),
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Agent already gone");
    }
}

fn reap_in_background(mut child: Child) {
    let _ = child.start_kill();
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            warn!(target: "tars::agent::stderr", "{line}");
        }
    }
}
