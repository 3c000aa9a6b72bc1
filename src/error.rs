use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single agent invocation
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent binary could not be started (missing, not executable, ...)
    #[error("failed to spawn agent `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("agent stdout was not captured")]
    MissingStdout,

    /// No output arrived within the idle window; the process was killed
    #[error("agent produced no output for {0:?}, killed (idle timeout)")]
    IdleTimeout(Duration),

    /// The invocation ran past its hard ceiling; the process was killed
    #[error("agent ran longer than {0:?}, killed (total timeout)")]
    TotalTimeout(Duration),

    /// The process exited without ever signalling completion
    #[error("agent exited with code {}", display_code(*code))]
    NonZeroExit { code: Option<i32> },

    #[error("failed waiting for agent exit: {0}")]
    Wait(#[source] io::Error),
}

impl AgentError {
    /// Exit code reported by the process, if the failure carries one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AgentError::NonZeroExit { code } => *code,
            _ => None,
        }
    }
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

/// Failures surfaced by the supervisor to its callers
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another invocation is already in flight
    #[error("supervisor busy")]
    Busy,

    #[error(transparent)]
    Agent(#[from] AgentError),
}
