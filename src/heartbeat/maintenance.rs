use anyhow::{bail, Context};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;

const TMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const UPLOADS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Async hook run on every tick to sync external knowledge into the agent's memory
pub type SyncHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Housekeeping performed at the start of every heartbeat tick
pub struct Maintenance {
    sweeps: Vec<(PathBuf, Duration)>,
    sync: Option<SyncHook>,
}

impl Maintenance {
    pub fn new(config: &Config) -> Self {
        Self {
            sweeps: vec![
                (config.tmp_dir.clone(), TMP_MAX_AGE),
                (config.uploads_dir.clone(), UPLOADS_MAX_AGE),
            ],
            sync: None,
        }
    }

    pub fn with_sync_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.sync = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Expire stale files and run the sync hook; never fails the tick
    pub async fn run(&self) -> usize {
        let sweeps = self.sweeps.clone();
        let removed = tokio::task::spawn_blocking(move || {
            sweeps
                .iter()
                .map(|(dir, max_age)| expire_files(dir, *max_age, SystemTime::now()))
                .sum::<usize>()
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "File expiry task panicked");
            0
        });
        if removed > 0 {
            info!(removed, "Expired ephemeral files");
        }

        if let Some(sync) = &self.sync {
            if let Err(e) = sync().await {
                warn!(error = %e, "Knowledge sync failed");
            }
        }
        removed
    }
}

/// Run a shell sync command from `cwd`, failing on a non-zero exit
pub async fn sync_command(command: String, cwd: PathBuf) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&cwd)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run `{command}`"))?;
    if !output.status.success() {
        bail!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!(command, "Knowledge sync finished");
    Ok(())
}

/// Delete files under `dir` last modified more than `max_age` before `now`
fn expire_files(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    if !dir.exists() {
        return 0;
    }
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            _ => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "Deleted expired file");
                removed += 1;
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete expired file"),
        }
    }
    removed
}
