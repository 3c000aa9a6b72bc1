use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_HEARTBEAT_SECS: u64 = 300;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 900;
const DEFAULT_CORRUPTION_EXIT_CODE: i32 = 42;
const DEFAULT_COMPACT_THRESHOLD: u64 = 50 * 1024;

/// Settings for spawning the external agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Binary to launch (resolved through PATH)
    pub binary: String,
    /// Arguments placed before the generated ones, e.g. a wrapper script
    pub leading_args: Vec<String>,
    /// Model name, `auto` leaves the choice to the agent
    pub model: String,
    /// Extension references passed on every invocation
    pub extensions: Vec<String>,
    pub idle_timeout: Duration,
    pub total_timeout: Duration,
    /// Exit code the agent uses when it cannot resume a session
    pub session_corruption_exit_code: i32,
    /// Transcripts above this size get compacted
    pub compact_threshold_bytes: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: "gemini".to_string(),
            leading_args: Vec::new(),
            model: "auto".to_string(),
            extensions: Vec::new(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
            session_corruption_exit_code: DEFAULT_CORRUPTION_EXIT_CODE,
            compact_threshold_bytes: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

/// Process-wide configuration, built once in `main` and shared by handle
#[derive(Debug, Clone)]
pub struct Config {
    /// Isolated home for the daemon and the agent (`~/.tars`)
    pub home_dir: PathBuf,
    pub task_file_path: PathBuf,
    pub session_file_path: PathBuf,
    /// Short-lived generated files, expired after an hour
    pub tmp_dir: PathBuf,
    /// Incoming attachments, expired after a day
    pub uploads_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// Shell command run on every heartbeat to refresh the agent's knowledge store
    pub knowledge_sync_command: Option<String>,
    pub agent: AgentSettings,
}

/// On-disk `config.json`; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub gemini_model: Option<String>,
    pub heartbeat_interval_sec: Option<u64>,
    pub agent_binary: Option<String>,
    pub agent_args: Option<Vec<String>>,
    pub extensions: Option<Vec<String>>,
    pub idle_timeout_sec: Option<u64>,
    pub total_timeout_sec: Option<u64>,
    pub session_corruption_exit_code: Option<i32>,
    pub compact_threshold_bytes: Option<u64>,
    pub knowledge_sync_command: Option<String>,
}

impl Config {
    /// Defaults rooted at `home_dir`
    pub fn for_home(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        let data = home_dir.join("data");
        Self {
            task_file_path: data.join("tasks.json"),
            session_file_path: data.join("session.json"),
            tmp_dir: data.join("tmp"),
            uploads_dir: data.join("uploads"),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            knowledge_sync_command: None,
            agent: AgentSettings::default(),
            home_dir,
        }
    }

    /// Load from the real environment: home resolution, `config.json`, env vars
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let home_dir = resolve_home(&env)?;
        let file = read_file_config(&home_dir.join("config.json"));
        Ok(Self::from_sources(home_dir, file, env))
    }

    /// Layer defaults, file values and environment overrides
    pub fn from_sources<F>(home_dir: PathBuf, file: FileConfig, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::for_home(home_dir);
        let agent = &mut config.agent;

        if let Some(model) = env("GEMINI_MODEL").or(file.gemini_model) {
            agent.model = model;
        }
        if let Some(binary) = env("TARS_AGENT_BIN").or(file.agent_binary) {
            agent.binary = binary;
        }
        if let Some(args) = file.agent_args {
            agent.leading_args = args;
        }
        if let Some(extensions) = file.extensions {
            agent.extensions = extensions;
        }
        if let Some(secs) = file.idle_timeout_sec {
            agent.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.total_timeout_sec {
            agent.total_timeout = Duration::from_secs(secs);
        }
        if let Some(code) = file.session_corruption_exit_code {
            agent.session_corruption_exit_code = code;
        }
        if let Some(bytes) = file.compact_threshold_bytes {
            agent.compact_threshold_bytes = bytes;
        }

        let heartbeat_secs = match env("HEARTBEAT_INTERVAL_SEC") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring invalid HEARTBEAT_INTERVAL_SEC");
                file.heartbeat_interval_sec.unwrap_or(DEFAULT_HEARTBEAT_SECS)
            }),
            None => file.heartbeat_interval_sec.unwrap_or(DEFAULT_HEARTBEAT_SECS),
        };
        config.heartbeat_interval = if heartbeat_secs == 0 {
            warn!(default = DEFAULT_HEARTBEAT_SECS, "Heartbeat interval must be positive, using the default");
            Duration::from_secs(DEFAULT_HEARTBEAT_SECS)
        } else {
            Duration::from_secs(heartbeat_secs)
        };

        config.knowledge_sync_command = env("TARS_KNOWLEDGE_SYNC")
            .or(file.knowledge_sync_command)
            .filter(|cmd| !cmd.trim().is_empty());

        config
    }
}

fn resolve_home<F>(env: &F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(home) = env("TARS_HOME") {
        return Ok(PathBuf::from(home));
    }
    // The agent runs with HOME pointed at ~/.tars, so prefer the real home
    let user_home = match env("REAL_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir().context("Could not determine the user's home directory")?,
    };
    if user_home.ends_with(".tars") {
        return Ok(user_home);
    }
    Ok(user_home.join(".tars"))
}

fn read_file_config(path: &Path) -> FileConfig {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileConfig::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read config file");
            return FileConfig::default();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Could not parse config file");
        FileConfig::default()
    })
}
