use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use game_pulse::config::{interval_from_minutes, PipelineConfig};
use game_pulse::database_ops::connectors_from_config;
use game_pulse::database_ops::warehouse::Warehouse;
use game_pulse::orchestrator::Pipeline;
use game_pulse::report::{RunReport, RunStatus};
use game_pulse::tracing::{init_tracing, DEFAULT_FILTER};
use game_pulse::util::db::{open_warehouse, prepare_warehouse};
use game_pulse::util::env::{self as env_util, env_flag};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "game-pulse", version, about = "Gaming telemetry ETL and forecasting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Execute one orchestrated run and print the JSON run report
    Run {
        /// Also write the report to this file
        #[arg(long)]
        report_out: Option<PathBuf>,
        /// Reference time for the run (RFC 3339, default: now)
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Run periodically until Ctrl-C
    Schedule {
        /// Override RUN_INTERVAL_MINS
        #[arg(long)]
        interval_mins: Option<u64>,
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<u64>,
    },
    /// Create the warehouse schema if absent and seed reference games
    Seed,
    /// Run only the forecasting stage
    Forecast {
        /// Restrict to one game id
        #[arg(long)]
        game: Option<String>,
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    env_util::preflight_check(
        "game-pulse",
        &[],
        &[
            "DB_MODE",
            "EMBEDDED_DB_PATH",
            "DATABASE_URL",
            "MOCK_DATA_ENABLED",
            "OPENDOTA_API_KEY",
            "STEAM_API_KEY",
            "RIOT_API_KEY",
            "MAX_WORKERS",
        ],
    )?;

    let config = PipelineConfig::from_env().context("loading configuration")?;
    let warehouse = open_warehouse(&config.db).await?;

    match cli.command {
        Commands::Seed => {
            let seeded = prepare_warehouse(warehouse.as_ref())
                .await
                .context("preparing warehouse")?;
            println!("seeded {seeded} games into {} warehouse", warehouse.backend());
        }
        Commands::Run { report_out, as_of } => {
            auto_prepare(warehouse.as_ref()).await?;
            let pipeline = build_pipeline(warehouse, config)?;
            let report = pipeline
                .run_once(as_of.unwrap_or_else(Utc::now))
                .await
                .context("pipeline run aborted")?;
            emit_report(&report, report_out.as_deref())?;
        }
        Commands::Schedule {
            interval_mins,
            max_runs,
        } => {
            auto_prepare(warehouse.as_ref()).await?;
            let interval = interval_mins
                .map(interval_from_minutes)
                .unwrap_or(config.run.run_interval);
            let pipeline = build_pipeline(warehouse, config)?;
            schedule(pipeline, interval, max_runs).await?;
        }
        Commands::Forecast { game, as_of } => {
            let pipeline = build_pipeline(warehouse, config)?;
            let outcomes = pipeline
                .forecast_only(as_of.unwrap_or_else(Utc::now), game.as_deref())
                .await
                .context("forecast stage aborted")?;
            let written = outcomes.iter().filter(|o| o.is_written()).count();
            info!(written, total = outcomes.len(), "forecast stage finished");
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
    }
    Ok(())
}

fn build_pipeline(warehouse: Arc<dyn Warehouse>, config: PipelineConfig) -> Result<Pipeline> {
    let connectors = connectors_from_config(&config.sources)?;
    info!(
        backend = warehouse.backend(),
        connectors = connectors.len(),
        mock_fallback = config.sources.mock_enabled,
        "pipeline configured"
    );
    Ok(Pipeline::new(warehouse, connectors, config))
}

/// Schema bootstrap before a run; AUTO_MIGRATE=0 leaves the warehouse as is.
async fn auto_prepare(warehouse: &dyn Warehouse) -> Result<()> {
    if env_flag("AUTO_MIGRATE", true) {
        prepare_warehouse(warehouse)
            .await
            .context("preparing warehouse")?;
    }
    Ok(())
}

fn emit_report(report: &RunReport, out: Option<&std::path::Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    if let Some(path) = out {
        std::fs::write(path, &json)
            .with_context(|| format!("writing run report to {}", path.display()))?;
        info!(path = %path.display(), "run report written");
    }
    println!("{json}");
    Ok(())
}

async fn schedule(pipeline: Pipeline, interval: Duration, max_runs: Option<u64>) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut runs = 0u64;
    info!(interval_secs = interval.as_secs(), "scheduler started");
    loop {
        let mut stop = cancel_rx.clone();
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.wait_for(|c| *c) => break,
        }
        match pipeline.run_once_with_cancel(Utc::now(), cancel_rx.clone()).await {
            Ok(report) => {
                info!(run_id = %report.run_id, "{}", report.summary_line());
                if report.status == RunStatus::Cancelled {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "scheduled run aborted");
                return Err(e).context("scheduled run aborted");
            }
        }
        runs += 1;
        if max_runs.is_some_and(|max| runs >= max) {
            break;
        }
    }
    info!(runs, "scheduler stopped");
    Ok(())
}
