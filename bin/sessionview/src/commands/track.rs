use sessionview_core::{Config, Paths, Workflow};
use sessionview_remote::{ClientContext, DefaultLauncher};
use sessionview_tracker::{SessionActivationTracker, SessionSupervisor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::parse_family;

fn load_workflows(path: &Path) -> anyhow::Result<Vec<Workflow>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let workflows: Vec<Workflow> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid workflow JSON in {}: {}", path.display(), e))?;
    Ok(workflows)
}

/// Evaluate activation once and print the decision as JSON.
pub async fn run(tasks: &Path, streaming: bool, family: &str) -> anyhow::Result<()> {
    let family = parse_family(family)?;
    let workflows = load_workflows(tasks)?;
    let mut tracker = SessionActivationTracker::new(family);
    let eval = tracker.evaluate(&workflows, streaming);
    println!("{}", serde_json::to_string_pretty(&eval)?);
    Ok(())
}

/// Re-read the snapshot every `interval` and keep the live session mounted
/// through a supervisor until Ctrl-C.
pub async fn follow(
    tasks: &Path,
    streaming: bool,
    family: &str,
    interval: Duration,
) -> anyhow::Result<()> {
    let family = parse_family(family)?;
    let config = Config::load_or_default(&Paths::new())?;
    let launcher = Arc::new(DefaultLauncher::new(ClientContext::from_config(config)?));
    let mut supervisor = SessionSupervisor::new(family, launcher);

    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let workflows = match load_workflows(tasks) {
                    Ok(w) => w,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable snapshot");
                        continue;
                    }
                };
                let eval = supervisor.update(workflows, streaming).await;
                println!("{}", serde_json::to_string(&eval)?);
            }
            Some(event) = supervisor.next_event() => {
                info!(event = ?event, "Session event");
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}
