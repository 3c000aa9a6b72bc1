//! Scripted stand-in for the agent binary.
//!
//! The script is run through `sh` as a leading argument rather than executed
//! directly, which sidesteps ETXTBSY when tests write and spawn in parallel.
//! Every invocation appends its arguments as a single line to `$HOME/calls`,
//! with embedded newlines flattened so multi-line prompts still count once.

use std::path::Path;
use std::time::Duration;

use crate::config::Config;

const RECORD_CALL: &str = r#"printf '%s ' "$@" | tr '\n' ' ' >> "$HOME/calls"; echo >> "$HOME/calls""#;

/// Config rooted at `home` whose agent is `sh <home>/fake-agent.sh`
pub fn scripted_config(home: &Path, script: &str) -> Config {
    let path = home.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{RECORD_CALL}\n{script}\n")).unwrap();

    let mut config = Config::for_home(home);
    config.agent.binary = "sh".to_string();
    config.agent.leading_args = vec![path.display().to_string()];
    config.agent.idle_timeout = Duration::from_secs(5);
    config.agent.total_timeout = Duration::from_secs(15);
    config
}

/// Argument lines of every agent invocation so far, oldest first
pub fn recorded_calls(home: &Path) -> Vec<String> {
    std::fs::read_to_string(home.join("calls"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
