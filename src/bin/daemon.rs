//! Visit Pacer Daemon - scheduled-mode background process

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;
use tracing::{error, info, warn};

use visit_pacer::{PacerConfig, PacerEngine, RunnerState};

const PID_FILE: &str = "/tmp/visit-pacer.pid";
const STATUS_FILE: &str = "/tmp/visit-pacer.status.json";
const SUMMARY_FILE: &str = "/tmp/visit-pacer.summary.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("🌙 Visit Pacer daemon started");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = PacerConfig::load(config_path.as_deref())?;

    let pid = std::process::id();
    tokio::fs::write(PID_FILE, pid.to_string()).await?;

    let result = run(config).await;
    if let Err(e) = &result {
        error!("❌ Daemon failed: {}", e);
    }

    tokio::fs::remove_file(PID_FILE).await.ok();
    tokio::fs::remove_file(STATUS_FILE).await.ok();
    result
}

async fn run(config: PacerConfig) -> Result<()> {
    let engine = PacerEngine::new(config).await?;
    engine.start_scheduled().await?;

    let mut terminate = signal(SignalKind::terminate())?;
    let mut tick = interval(Duration::from_secs(30));

    // Pinned so a status tick never cancels the session close.
    let wait = engine.wait_scheduled();
    tokio::pin!(wait);

    let finished = loop {
        tokio::select! {
            state = &mut wait => break state,
            _ = terminate.recv() => {
                engine.stop("SIGTERM").await;
            }
            _ = tokio::signal::ctrl_c() => {
                engine.stop("User interrupt (Ctrl+C)").await;
            }
            _ = tick.tick() => {
                let status = engine.schedule_status();
                if let Err(e) = tokio::fs::write(STATUS_FILE, serde_json::to_string(&status)?).await {
                    warn!("⚠️ Could not write status snapshot: {}", e);
                }
            }
        }
    };

    match finished {
        RunnerState::Completed => info!("✅ Schedule completed"),
        state => info!("🔌 Schedule ended in state {:?}", state),
    }

    if let Some(session) = engine.session().await {
        tokio::fs::write(SUMMARY_FILE, serde_json::to_string_pretty(&session)?).await?;
        info!(
            "💾 Summary saved: {} ({} visits, {} rotations)",
            SUMMARY_FILE,
            session.total_visits(),
            session.rotation_count
        );
    }
    Ok(())
}
