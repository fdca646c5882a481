use std::sync::Arc;

use anyhow::{bail, Context, Result};
use berth_core::{InstanceId, LineId, Period, PipelineMode};
use berth_store::{CheckpointStore, JobQueue, LineLocks, ModeStore, PgStore};
use berth_sync::{build_scheduler, reconstruct, AuditMode, AuditScope, SyncConfig, SyncServices};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const DEFAULT_LOG_FILTER: &str = "warn,berth=info";

#[derive(Debug, Parser)]
#[command(name = "berth")]
#[command(about = "Cruise feed ingestion and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// HTTP server plus webhook workers and the scheduler.
    Serve {
        #[arg(long)]
        no_workers: bool,
    },
    /// Webhook workers and the scheduler, without HTTP.
    Worker,
    /// Bulk sync the given periods, or the current month plus look-ahead.
    Sync {
        #[arg(long = "period", value_parser = parse_period)]
        periods: Vec<Period>,
        #[arg(long)]
        lookahead: Option<u32>,
    },
    /// Queue an incremental sync for one line.
    SyncLine { line_id: i64 },
    Pause {
        #[arg(long)]
        reason: Option<String>,
    },
    Resume,
    /// Drop a stuck per-line lease.
    ClearLock { line_id: i64 },
    ResetCheckpoint {
        #[arg(value_parser = parse_period)]
        period: Period,
    },
    /// Forget failed attempts so the next bulk run retries them.
    RetryFailed {
        #[arg(value_parser = parse_period)]
        period: Period,
    },
    Audit {
        #[arg(long, value_parser = parse_audit_mode)]
        mode: Option<AuditMode>,
        #[arg(long)]
        sample: Option<usize>,
    },
    /// Re-fetch one sailing from its source file and upsert it.
    Reconstruct { instance_id: String },
    Maintenance,
    /// Show a queued job.
    Job { id: Uuid },
}

fn parse_period(raw: &str) -> Result<Period, String> {
    let (year, month) = raw
        .split_once(['/', '-'])
        .ok_or_else(|| format!("expected YYYY/MM, got `{raw}`"))?;
    let year: i32 = year.parse().map_err(|_| format!("invalid year in `{raw}`"))?;
    let month: u32 = month.parse().map_err(|_| format!("invalid month in `{raw}`"))?;
    Period::new(year, month).ok_or_else(|| format!("`{raw}` is not a valid period"))
}

fn parse_audit_mode(raw: &str) -> Result<AuditMode, String> {
    AuditMode::parse(raw).ok_or_else(|| format!("expected `report` or `repair`, got `{raw}`"))
}

fn line_id(raw: i64) -> Result<LineId> {
    match LineId::new(raw) {
        Some(id) => Ok(id),
        None => bail!("line id must be a positive integer, got {raw}"),
    }
}

async fn store(config: &SyncConfig) -> Result<PgStore> {
    let url = config.require_database()?;
    PgStore::connect(url, 4).await.context("connecting to database")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        trigger.cancel();
    });
    token
}

async fn run_background(services: Arc<SyncServices>, shutdown: CancellationToken, workers: bool) -> Result<()> {
    let scheduler = build_scheduler(services.clone(), shutdown.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    }
    if workers {
        Arc::new(services.worker_pool()).run_until_cancelled(shutdown.clone()).await;
    } else {
        shutdown.cancelled().await;
    }
    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command {
        Commands::Migrate => {
            store(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { no_workers } => {
            let services = Arc::new(SyncServices::connect(config).await?);
            let shutdown = shutdown_on_ctrl_c();
            let state = berth_web::AppState::new(services.store().clone());
            let port = services.config().web_port;
            let (web, background) = tokio::join!(
                berth_web::serve(state, port, shutdown.clone()),
                run_background(services.clone(), shutdown.clone(), !no_workers),
            );
            web?;
            background?;
        }
        Commands::Worker => {
            let services = Arc::new(SyncServices::connect(config).await?);
            run_background(services, shutdown_on_ctrl_c(), true).await?;
        }
        Commands::Sync { periods, lookahead } => {
            let mut config = config;
            if let Some(lookahead) = lookahead {
                config.lookahead_months = lookahead;
            }
            let services = SyncServices::connect(config).await?;
            let bulk = services.bulk();
            let periods = if periods.is_empty() { bulk.default_periods() } else { periods };
            let report = bulk.run_periods(&periods, &shutdown_on_ctrl_c()).await?;
            let totals = report.totals();
            println!(
                "bulk sync complete: run_id={} periods={} seen={} skipped={} succeeded={} failed={} reports={}",
                report.run_id,
                report.periods.len(),
                totals.files_seen,
                totals.files_skipped,
                totals.succeeded,
                totals.failed,
                report.report_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::SyncLine { line_id } => {
            let store = Arc::new(store(&config).await?);
            let job_id = berth_sync::WebhookIntake::new(store).receive_event(line_id).await?;
            println!("queued job {job_id}");
        }
        Commands::Pause { reason } => {
            let record = store(&config)
                .await?
                .set_mode(PipelineMode::Paused, reason.as_deref())
                .await?;
            print_json(&record)?;
        }
        Commands::Resume => {
            let record = store(&config).await?.set_mode(PipelineMode::Active, None).await?;
            print_json(&record)?;
        }
        Commands::ClearLock { line_id: raw } => {
            let line = line_id(raw)?;
            let cleared = store(&config).await?.force_clear(line).await?;
            println!("line {line}: {}", if cleared { "lock cleared" } else { "no lock held" });
        }
        Commands::ResetCheckpoint { period } => {
            store(&config).await?.reset_checkpoint(period).await?;
            println!("checkpoint for {period} reset");
        }
        Commands::RetryFailed { period } => {
            let forgotten = store(&config).await?.forget_failed(period).await?;
            println!("{forgotten} failed files in {period} will be retried on the next bulk run");
        }
        Commands::Audit { mode, sample } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.audit_mode = mode;
            }
            if sample.is_some() {
                config.audit_sample_size = sample;
            }
            let services = SyncServices::connect(config).await?;
            let summary = services.auditor().run(services.audit_scope()).await?;
            print_json(&summary)?;
        }
        Commands::Reconstruct { instance_id } => {
            let services = SyncServices::connect(config).await?;
            let outcome = reconstruct(services.pipeline(), &InstanceId::new(instance_id.clone())).await?;
            println!("sailing {instance_id} reconstructed ({outcome:?})");
        }
        Commands::Maintenance => {
            let store: Arc<dyn berth_store::Store> = Arc::new(store(&config).await?);
            let maintenance =
                berth_sync::Maintenance::new(store, berth_sync::MaintenanceOptions::from_config(&config));
            print_json(&maintenance.run_once(Utc::now()).await?)?;
        }
        Commands::Job { id } => match store(&config).await?.job(id).await? {
            Some(job) => print_json(&job)?,
            None => bail!("job {id} not found"),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_parse_with_slash_or_dash() {
        assert_eq!(parse_period("2025/05"), Ok(Period::new(2025, 5).unwrap()));
        assert_eq!(parse_period("2025-12"), Ok(Period::new(2025, 12).unwrap()));
        assert!(parse_period("2025/13").is_err());
        assert!(parse_period("May 2025").is_err());
    }

    #[test]
    fn cli_parses_operator_commands() {
        let cli = Cli::try_parse_from(["berth", "sync", "--period", "2025/05", "--period", "2025/06"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { ref periods, .. } if periods.len() == 2));

        let cli = Cli::try_parse_from(["berth", "audit", "--mode", "repair", "--sample", "50"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Audit {
                mode: Some(AuditMode::Repair),
                sample: Some(50)
            }
        ));

        assert!(Cli::try_parse_from(["berth", "clear-lock", "16"]).is_ok());
        assert!(Cli::try_parse_from(["berth", "audit", "--mode", "fix"]).is_err());
    }
}
