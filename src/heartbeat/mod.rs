mod maintenance;
mod schedule;
mod tasks;

pub use maintenance::{sync_command, Maintenance};
pub use schedule::calculate_next_run;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actions::Action;
use crate::config::Config;
use crate::supervisor::{Retention, Supervisor};
use schedule::{format_timestamp, parse_timestamp};
use tasks::{Task, TaskFile, TaskMode};

/// Shortest period the timer accepts
const MIN_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Reply token meaning "nothing needs attention"
pub const SILENT_ACK: &str = "SILENT_ACK";

const SELF_CHECK_PROMPT: &str = "Self-Correction and Autonomous Heartbeat:\n\
Review your current objectives in GEMINI.md and any pending tasks.\n\
If everything is on track and no immediate action is required, reply exactly with 'SILENT_ACK'.\n\
If you detect an issue, a missed deadline, or a high-priority task that needs starting, \
provide a short internal reasoning and then describe the action you are taking.";

/// What a single tick ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick was still executing
    Overlapping,
    /// An interactive invocation holds the agent
    SupervisorBusy,
    /// The task file exists but could not be read
    TasksUnavailable,
    Ran { succeeded: usize, failed: usize },
    SelfCheck(SelfCheck),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCheck {
    /// Nothing to do; the exchange was pruned
    Acknowledged,
    /// The agent took some action, kept in the conversation
    Acted,
    Failed,
}

/// Periodically wakes the agent to run due tasks or check in on itself
pub struct HeartbeatScheduler {
    ticker: Arc<Ticker>,
    period: std::time::Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Ticker {
    supervisor: Arc<Supervisor>,
    maintenance: Maintenance,
    tasks: TaskFile,
    notifier: Option<UnboundedSender<Action>>,
    ticking: AtomicBool,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HeartbeatScheduler {
    pub fn new(
        config: Arc<Config>,
        supervisor: Arc<Supervisor>,
        maintenance: Maintenance,
        notifier: Option<UnboundedSender<Action>>,
    ) -> Self {
        Self {
            ticker: Arc::new(Ticker {
                supervisor,
                maintenance,
                tasks: TaskFile::new(&config.task_file_path),
                notifier,
                ticking: AtomicBool::new(false),
            }),
            period: config.heartbeat_interval.max(MIN_PERIOD),
            handle: Mutex::new(None),
        }
    }

    /// Start ticking; the first tick fires immediately
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        info!(period_secs = self.period.as_secs(), "Heartbeat started");

        let ticker = self.ticker.clone();
        let period = self.period;
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // Each tick runs on its own task so a slow one is skipped over, not queued
                let ticker = ticker.clone();
                tokio::spawn(async move {
                    match ticker.tick().await {
                        TickOutcome::Ran { succeeded, failed } => {
                            info!(succeeded, failed, "Heartbeat ran due tasks")
                        }
                        outcome => debug!(?outcome, "Heartbeat tick finished"),
                    }
                });
            }
        }));
    }

    /// Cancel the timer; a tick already executing runs to completion
    pub fn stop(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handle.take() {
            handle.abort();
            info!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Ticker {
    async fn tick(&self) -> TickOutcome {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous heartbeat tick still running, skipping");
            return TickOutcome::Overlapping;
        }
        let _guard = TickGuard(&self.ticking);

        self.maintenance.run().await;

        if self.supervisor.is_busy() {
            debug!("Agent busy with a conversation, skipping heartbeat");
            return TickOutcome::SupervisorBusy;
        }

        let mut tasks = match self.tasks.load().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(path = %self.tasks.path().display(), error = %e, "Could not load tasks, skipping tick");
                return TickOutcome::TasksUnavailable;
            }
        };

        let now = Utc::now();
        let due: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.is_due(now))
            .map(|(i, _)| i)
            .collect();

        if due.is_empty() {
            return TickOutcome::SelfCheck(self.self_check().await);
        }

        info!(count = due.len(), "Running due tasks");
        let (mut succeeded, mut failed) = (0, 0);
        for i in due {
            if self.run_task(&mut tasks[i]).await {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }
        if let Err(e) = self.tasks.save(&tasks).await {
            error!(error = %e, "Failed to save task state");
        }
        TickOutcome::Ran { succeeded, failed }
    }

    /// Run one task and update its bookkeeping, returning whether it succeeded
    async fn run_task(&self, task: &mut Task) -> bool {
        info!(task = %task.id, title = %task.title, "Running task");
        let retention = match task.mode {
            TaskMode::Silent => Retention::Prune,
            TaskMode::Notify => Retention::Keep,
        };

        let succeeded = match self.supervisor.execute_task(&task.prompt, retention).await {
            Ok(output) => {
                info!(task = %task.id, result_len = output.len(), "Task completed");
                task.last_run = Some(format_timestamp(Utc::now()));
                task.failed_count = 0;
                if task.mode == TaskMode::Notify {
                    self.notify(format!("{}: {}", display_title(task), output.trim()));
                }
                true
            }
            Err(e) => {
                error!(task = %task.id, error = %e, "Task failed");
                task.failed_count += 1;
                false
            }
        };

        let now = Utc::now();
        task.next_run = calculate_next_run(&task.schedule, now);
        task.updated_at = format_timestamp(now);

        // A one-shot schedule keeps pointing at the past once it has fired
        if succeeded && parse_timestamp(&task.next_run).is_some_and(|at| at <= now) {
            info!(task = %task.id, "One-shot task done, disabling");
            task.enabled = false;
        }
        succeeded
    }

    async fn self_check(&self) -> SelfCheck {
        match self
            .supervisor
            .execute_task(SELF_CHECK_PROMPT, Retention::PruneIfContains(SILENT_ACK))
            .await
        {
            Ok(reply) if reply.contains(SILENT_ACK) => {
                debug!("Heartbeat acknowledged, exchange pruned");
                SelfCheck::Acknowledged
            }
            Ok(reply) => {
                let preview: String = reply.chars().take(100).collect();
                info!(action = %preview, "Heartbeat initiated an action");
                SelfCheck::Acted
            }
            Err(e) => {
                error!(error = %e, "Autonomous check failed");
                SelfCheck::Failed
            }
        }
    }

    fn notify(&self, message: String) {
        if let Some(tx) = &self.notifier {
            if tx.send(Action::Notify(message)).is_err() {
                debug!("Notification receiver gone");
            }
        }
    }
}

fn display_title(task: &Task) -> &str {
    if task.title.is_empty() {
        &task.id
    } else {
        &task.title
    }
}
