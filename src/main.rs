use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod actions;
mod agent;
mod config;
mod error;
mod heartbeat;
mod session;
mod supervisor;
#[cfg(test)]
mod testing;

use actions::Action;
use agent::AgentEvent;
use config::Config;
use heartbeat::{sync_command, HeartbeatScheduler, Maintenance};
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Arc::new(Config::load()?);
    info!(home = %config.home_dir.display(), model = %config.agent.model, "Starting tars");

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    let supervisor = Arc::new(Supervisor::new(config.clone()).await);

    let mut maintenance = Maintenance::new(&config);
    if let Some(command) = config.knowledge_sync_command.clone() {
        info!(command = %command, "Knowledge sync enabled");
        let home = config.home_dir.clone();
        maintenance = maintenance.with_sync_hook(move || sync_command(command.clone(), home.clone()));
    }
    let heartbeat = HeartbeatScheduler::new(
        config.clone(),
        supervisor.clone(),
        maintenance,
        Some(tx.clone()),
    );
    heartbeat.start();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(action) = Action::from_input(&line) {
                        let _ = input_tx.send(action);
                    }
                }
                Ok(None) => {
                    let _ = input_tx.send(Action::Quit);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed reading console input");
                    let _ = input_tx.send(Action::Quit);
                    break;
                }
            }
        }
    });

    // Main event loop
    loop {
        tokio::select! {
            Some(action) = rx.recv() => {
                match action {
                    Action::Prompt(content) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            // Errors also arrive as an Error event
                            let _ = supervisor.run(&content, None, print_event).await;
                        });
                    }
                    Action::Ask(question) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            match supervisor.ask(&question).await {
                                Ok(answer) => println!("{}", answer.trim()),
                                Err(e) => println!("[error] {e}"),
                            }
                        });
                    }
                    Action::Status => print_status(&supervisor).await,
                    Action::ResetSession => match supervisor.clear_session().await {
                        Ok(()) => println!("Session cleared, the next message starts a new one."),
                        Err(e) => error!(error = %e, "Failed to clear session"),
                    },
                    Action::PruneLastTurn => match supervisor.prune_last_turn().await {
                        Ok(()) => println!("Dropped the last exchange."),
                        Err(e) => println!("[error] {e}"),
                    },
                    Action::Notify(message) => println!("[heartbeat] {message}"),
                    Action::Quit => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    heartbeat.stop();
    info!("Shutting down");
    Ok(())
}

fn print_event(event: AgentEvent) {
    match &event {
        AgentEvent::Done { .. } => println!(),
        AgentEvent::Error { message } => println!("\n[error] {message}"),
        AgentEvent::ToolCall { name, .. } => info!(tool = %name, "Agent called tool"),
        _ => {
            if let Some(text) = event.assistant_text() {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    }
}

async fn print_status(supervisor: &Supervisor) {
    let Some(stats) = supervisor.session_stats().await else {
        println!("No active session.");
        return;
    };
    println!(
        "Session {} | {} interactions | context {} tokens ({} cached) | {} output | {} net input | last active {}",
        stats.session_id,
        stats.interaction_count,
        stats.total_input_tokens,
        stats.total_cached_tokens,
        stats.total_output_tokens,
        stats.total_net_tokens,
        stats.last_interaction_at.to_rfc3339(),
    );
    if supervisor.is_busy() {
        println!("Agent is currently working.");
    }
}
