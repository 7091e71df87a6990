//! Failover warden CLI.
//!
//! `warden run` drives the tick loop as a daemon; `tick` evaluates a
//! single tick for cron-style operation; `status` and `history` read the
//! incident store; `check` verifies connectivity to the control plane and
//! telemetry without touching any state.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use notify::{Notifier, NotifyChannel, SlackChannel, TopicChannel};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use warden::config::WardenConfig;
use warden::control_plane::{ControlPlaneClient, FailoverControl};
use warden::incident::{Incident, IncidentState};
use warden::lag::{MetricsLagMonitor, TelemetryClient};
use warden::orchestrator::{Orchestrator, OrchestratorSettings, TickError};
use warden::probe::StatusProbe;
use warden::promote::{PromotionSettings, StandbyPromoter};
use warden::store::IncidentStore;
use warden::types::TickRecord;

/// Automated multi-region database failover orchestrator
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Automated multi-region database failover orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file (defaults to warden.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the failover control loop until interrupted
    Run,
    /// Evaluate a single tick and exit
    Tick,
    /// Show the open incident and the most recent tick
    Status,
    /// List recent incidents, newest first
    History {
        /// Maximum number of incidents to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Verify connectivity to the control plane and telemetry
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.format);

    let config = WardenConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run_daemon(config).await,
        Commands::Tick => run_single_tick(config, cli.format).await,
        Commands::Status => show_status(&config, cli.format),
        Commands::History { limit } => show_history(&config, limit, cli.format),
        Commands::Check => run_check(&config, cli.format).await,
    }
}

fn init_tracing(verbose: bool, format: OutputFormat) {
    let default_directives = if verbose {
        "warden=debug,notify=debug"
    } else {
        "warden=info,notify=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));

    match format {
        OutputFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        OutputFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Wire the full component stack from configuration.
fn build_orchestrator(config: &WardenConfig) -> Result<Orchestrator> {
    let control: Arc<dyn FailoverControl> =
        Arc::new(ControlPlaneClient::new(config.control_plane.clone()));
    let probe = Arc::new(StatusProbe::new(Arc::clone(&control), config.probe_timeout()));
    let lag = Arc::new(MetricsLagMonitor::new(TelemetryClient::new(
        config.telemetry.clone(),
    )));
    let executor = Arc::new(StandbyPromoter::new(
        Arc::clone(&control),
        config.primary_id.clone(),
        config.standby_id.clone(),
        PromotionSettings {
            poll_interval: config.promotion_poll_interval(),
            timeout: config.promotion_timeout(),
        },
    ));
    let notifier = build_notifier(config);
    let store = IncidentStore::open(&config.db_path).with_context(|| {
        format!(
            "Failed to open incident store at {}",
            config.db_path.display()
        )
    })?;

    let settings = OrchestratorSettings {
        primary_id: config.primary_id.clone(),
        standby_id: config.standby_id.clone(),
        unhealthy_threshold: config.unhealthy_threshold,
        lag_threshold_secs: config.lag_threshold_secs,
        lag_window: config.lag_window(),
        warning_cooldown: config.warning_cooldown(),
        health_window: config.health_window,
    };
    Ok(Orchestrator::new(
        settings, probe, lag, executor, notifier, store,
    ))
}

fn build_notifier(config: &WardenConfig) -> Notifier {
    if config.notifications.disabled {
        info!("Notifications disabled by configuration");
        return Notifier::disabled();
    }

    let mut channels: Vec<Arc<dyn NotifyChannel>> = Vec::new();
    if let Some(url) = &config.notifications.topic_url {
        let mut channel = TopicChannel::new(url.clone());
        if let Some(token) = &config.notifications.topic_token {
            channel = channel.with_auth_token(token.clone());
        }
        channels.push(Arc::new(channel));
    }
    if let Some(url) = &config.notifications.slack_webhook_url {
        channels.push(Arc::new(SlackChannel::new(url.clone())));
    }
    if channels.is_empty() {
        warn!("No notification channels configured, events will only be logged");
    }

    Notifier::with_channels(channels).with_retry_policy(config.retry_policy())
}

async fn run_daemon(config: WardenConfig) -> Result<()> {
    let mut orchestrator = build_orchestrator(&config)?;

    let retention = chrono::Duration::days(i64::from(config.retention_days));
    match orchestrator.prune_history(Utc::now() - retention) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Pruned expired history"),
        Err(e) => warn!(error = %e, "History pruning failed"),
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received, finishing the current tick");
        let _ = shutdown_tx.send(true);
    });

    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        primary_id = %config.primary_id,
        standby_id = %config.standby_id,
        tick_interval_secs = config.tick_interval_secs,
        "Failover warden started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }

        // The tick itself is never raced against shutdown; an in-flight
        // promotion always runs to completion.
        match orchestrator.tick().await {
            Ok(record) => debug!(action = %record.action, "Tick recorded"),
            Err(TickError::Conflict { incident_id }) => {
                warn!(
                    incident_id = %incident_id,
                    "Tick aborted on a concurrent update, reconciling next tick"
                );
            }
            Err(e) => error!(error = %e, "Tick failed"),
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    info!("Failover warden stopped");
    Ok(())
}

async fn run_single_tick(config: WardenConfig, format: OutputFormat) -> Result<()> {
    let mut orchestrator = build_orchestrator(&config)?;
    let record = orchestrator.tick().await.context("Tick failed")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Text => print_tick(&record),
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    open_incident: Option<Incident>,
    last_tick: Option<TickRecord>,
}

fn show_status(config: &WardenConfig, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let report = StatusReport {
        open_incident: store.load_open_incident()?,
        last_tick: store.last_tick()?,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            match &report.open_incident {
                None => println!("{}", "No open incident".green()),
                Some(incident) => {
                    println!("{}", "Open incident".red().bold());
                    println!("  id:               {}", incident.id);
                    println!("  state:            {}", state_label(incident.state));
                    println!(
                        "  first unhealthy:  {}",
                        incident.first_unhealthy_at.to_rfc3339()
                    );
                    println!(
                        "  unhealthy checks: {}",
                        incident.consecutive_unhealthy_checks
                    );
                    println!("  promotion tried:  {}", incident.promotion_attempted);
                    if let Some(detail) = &incident.resolution_detail {
                        println!("  detail:           {detail}");
                    }
                }
            }
            match &report.last_tick {
                None => println!("{}", "No ticks recorded yet".dimmed()),
                Some(tick) => print_tick(tick),
            }
        }
    }
    Ok(())
}

fn show_history(config: &WardenConfig, limit: usize, format: OutputFormat) -> Result<()> {
    let store = open_store(config)?;
    let incidents = store.recent_incidents(limit)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&incidents)?),
        OutputFormat::Text => {
            if incidents.is_empty() {
                println!("No incidents recorded");
                return Ok(());
            }
            for incident in incidents {
                let outcome = incident
                    .resolution
                    .map_or_else(|| "open".yellow(), |r| r.as_str().normal());
                println!(
                    "{}  {:<20} checks={:<3} {}",
                    incident.first_unhealthy_at.format("%Y-%m-%d %H:%M:%S"),
                    state_label(incident.state),
                    incident.consecutive_unhealthy_checks,
                    outcome,
                );
                if let Some(detail) = &incident.resolution_detail {
                    println!("    {}", detail.dimmed());
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct CheckReport {
    control_plane: bool,
    telemetry: bool,
    notification_channels: Vec<&'static str>,
}

async fn run_check(config: &WardenConfig, format: OutputFormat) -> Result<()> {
    let control = ControlPlaneClient::new(config.control_plane.clone());
    let telemetry = TelemetryClient::new(config.telemetry.clone());

    let (control_ok, telemetry_ok) =
        tokio::join!(control.health_check(), telemetry.health_check());
    let report = CheckReport {
        control_plane: control_ok.unwrap_or(false),
        telemetry: telemetry_ok.unwrap_or(false),
        notification_channels: build_notifier(config).channel_names(),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("  {} control plane", mark(report.control_plane));
            println!("  {} telemetry", mark(report.telemetry));
            if report.notification_channels.is_empty() {
                println!("  {} notification channels", "-".yellow());
            } else {
                println!(
                    "  {} notification channels: {}",
                    "✓".green(),
                    report.notification_channels.join(", ")
                );
            }
        }
    }

    if !(report.control_plane && report.telemetry) {
        anyhow::bail!("Connectivity check failed");
    }
    Ok(())
}

fn open_store(config: &WardenConfig) -> Result<IncidentStore> {
    IncidentStore::open(&config.db_path).with_context(|| {
        format!(
            "Failed to open incident store at {}",
            config.db_path.display()
        )
    })
}

fn print_tick(record: &TickRecord) {
    println!("{} {}", "Tick".bold(), record.at.to_rfc3339());
    println!("  state:            {}", state_label(record.incident_state));
    println!("  action:           {}", record.action);
    println!("  notifications:    {}", record.notifications_sent);
    if let Some(id) = record.incident_id {
        println!("  incident:         {id}");
    }
}

fn state_label(state: IncidentState) -> colored::ColoredString {
    match state {
        IncidentState::Healthy => state.as_str().green(),
        IncidentState::Degraded => state.as_str().yellow(),
        IncidentState::PromotionInFlight => state.as_str().cyan(),
        IncidentState::Promoted => state.as_str().green().bold(),
        IncidentState::Failed => state.as_str().red().bold(),
    }
}

fn mark(ok: bool) -> colored::ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}
