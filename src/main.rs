//! Visit Pacer CLI
//!
//! Immediate-mode runs, schedule previews, manual rotation and control of
//! the scheduled-mode daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use visit_pacer::{
    engine::PacerEngine,
    schedule::{SchedulePlan, TrafficSchedule},
    types::SimulationSession,
    utils::{format_duration, format_percent},
    PacerConfig,
};

const PID_FILE: &str = "/tmp/visit-pacer.pid";
const STATUS_FILE: &str = "/tmp/visit-pacer.status.json";

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "visit-pacer",
    version = "1.0.0",
    about = "Human-paced visit orchestration with egress rotation and traffic scheduling"
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Target URL, overrides the configuration
    #[arg(short, long)]
    target: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run an immediate-mode session
    Run {
        /// Number of visits
        #[arg(short = 'n', long)]
        iterations: Option<u32>,
        /// Rotate the egress identity between visits
        #[arg(long)]
        rotate: bool,
        /// Write the session summary to a file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Preview the traffic schedule
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rotate the egress identity once
    Rotate,
    /// Show the scheduled-mode daemon state
    Status,
    /// Stop the scheduled-mode daemon
    Stop,
}

// ── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let mut config = PacerConfig::load(cli.config.as_deref())?;
    if let Some(target) = &cli.target {
        config.session.target_url = target.clone();
    }

    match cli.command.clone().unwrap_or(Commands::Run {
        iterations: None,
        rotate: false,
        output: None,
    }) {
        Commands::Run { iterations, rotate, output } => {
            if let Some(n) = iterations {
                config.session.iterations = n;
            }
            config.session.rotate_identity |= rotate;
            run_session(config, output).await?
        }
        Commands::Plan { json } => run_plan(&config, json)?,
        Commands::Rotate => run_rotate(config).await?,
        Commands::Status => run_status().await?,
        Commands::Stop => run_stop().await?,
    }

    Ok(())
}

// ── Command Handlers ─────────────────────────────────────────────────────────

async fn run_session(config: PacerConfig, output: Option<PathBuf>) -> Result<()> {
    info!("🚀 Immediate session:");
    info!("   Target:     {}", config.session.target_url);
    info!("   Iterations: {}", config.session.iterations);
    info!("   Rotation:   {}", config.session.rotate_identity);

    let engine = PacerEngine::new(config).await?;
    let mut handle = engine.run_immediate().await?;

    tokio::select! {
        joined = &mut handle => {
            if let Err(e) = joined {
                error!("❌ Session task failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            engine.stop("User interrupt (Ctrl+C)").await;
            handle.await.ok();
        }
    }

    match engine.session().await {
        Some(session) => {
            print_summary(&session);
            if let Some(path) = output {
                tokio::fs::write(&path, serde_json::to_string_pretty(&session)?).await?;
                info!("💾 Summary saved: {}", path.display());
            }
        }
        None => warn!("⚠️ No session recorded"),
    }
    Ok(())
}

fn run_plan(config: &PacerConfig, json: bool) -> Result<()> {
    let (schedule, plan) = PacerEngine::plan_schedule(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&schedule, &plan);
    }
    Ok(())
}

async fn run_rotate(config: PacerConfig) -> Result<()> {
    info!("🔄 Rotating egress identity...");
    let engine = PacerEngine::new(config).await?;
    let result = engine.rotate_now().await;
    if result.success {
        info!(
            "✅ {} -> {} (reconnect {})",
            result.identity_before,
            result.identity_after,
            format_duration(result.reconnect_wait)
        );
    } else {
        warn!("❌ Rotation failed: {}", result.message);
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    info!("📊 Visit Pacer status:");
    let pid_file = Path::new(PID_FILE);
    if pid_file.exists() {
        let pid_str = tokio::fs::read_to_string(pid_file)
            .await
            .unwrap_or_else(|_| "N/A".to_string());
        info!("   State: ✅ running (PID: {})", pid_str.trim());
    } else {
        info!("   State: ❌ stopped");
    }
    if let Ok(snapshot) = tokio::fs::read_to_string(STATUS_FILE).await {
        if let Ok(status) = serde_json::from_str::<serde_json::Value>(&snapshot) {
            info!("   Schedule: {}", status);
        }
    }
    Ok(())
}

async fn run_stop() -> Result<()> {
    info!("🛑 Stopping scheduled session...");
    let pid_file = Path::new(PID_FILE);
    if pid_file.exists() {
        let pid_str = tokio::fs::read_to_string(pid_file).await?;
        let pid: i32 = pid_str.trim().parse()?;
        info!("📤 Sending SIGTERM to PID {}", pid);
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    } else {
        warn!("⚠️ PID file not found, daemon is not running.");
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

fn print_summary(session: &SimulationSession) {
    println!("\n{}", "═".repeat(64));
    println!("  {} {}", "Session".bold(), session.id);
    println!("{}", "═".repeat(64));
    println!("  Target:      {}", session.target);
    println!("  Visits:      {}/{}", session.total_visits(), session.budget);
    let rate = format_percent(session.success_rate());
    let rate = if session.success_rate() >= 50.0 { rate.green() } else { rate.red() };
    println!("  Success:     {} ({})", session.successful_visits(), rate);
    println!("  Rotations:   {}", session.rotation_count);
    println!("  Identities:  {}", session.identities.len());
    let elapsed = session.duration().to_std().unwrap_or_default();
    println!("  Duration:    {}", format_duration(elapsed));
    println!("{}\n", "═".repeat(64));
}

fn print_plan(schedule: &TrafficSchedule, plan: &SchedulePlan) {
    println!("\n{}", "═".repeat(64));
    println!(
        "  {} {} visits over {}h",
        plan.pattern.display_name().bold(),
        plan.total_visits,
        plan.duration_hours
    );
    println!("{}", "═".repeat(64));

    let peak = schedule.peak_window();
    for (hour, weight) in schedule.hourly_weights().iter().enumerate() {
        let bar = "█".repeat((weight * 200.0).round() as usize);
        let line = format!("  {:02}:00  {:>5.1}%  {}", hour, weight * 100.0, bar);
        if peak.contains(hour) {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }

    println!("{}", "─".repeat(64));
    if let Some(start) = plan.start_hour {
        println!("  Anchored at:  {:02}:00", start);
    }
    let shortest = plan.intervals.iter().min().copied().unwrap_or(0);
    let longest = plan.intervals.iter().max().copied().unwrap_or(0);
    println!("  Intervals:    {}", plan.intervals.len());
    println!("  Shortest:     {}", format_duration(Duration::from_millis(shortest)));
    println!("  Longest:      {}", format_duration(Duration::from_millis(longest)));
    println!(
        "  Total wait:   {}",
        format_duration(Duration::from_millis(plan.total_wait_ms()))
    );
    println!("{}\n", "═".repeat(64));
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(level: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
