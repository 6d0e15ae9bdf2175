//! StoryForge retry tool
//!
//! Operator CLI for derivative registration coverage:
//! - `status` prints how many eligible jobs carry an IP
//! - `retry` registers one job or a bounded batch, or previews the batch
//!
//! Exits non-zero only when the provenance store cannot be reached.

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use std::fmt::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use storyforge_common::{
    backfill::{BatchReport, DryRunReport, JobReport, JobResult},
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, Repository},
    engine::EngineSettings,
    ratelimit::RegistrationPacer,
    registration::create_registration_client,
    store::RegistrationSummary,
    AppError, BatchOptions, Orchestrator, ProvenanceStore, RegistrationEngine,
    RegistrationOutcome,
};
use tracing::{error, info, Subscriber};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

const STORE_UNREACHABLE: u8 = 2;

/// Command-line arguments for retry-tool
#[derive(Parser, Debug)]
#[command(name = "retry-tool")]
#[command(about = "Registration status and retry for StoryForge training jobs")]
#[command(version)]
struct Cli {
    /// Print full reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Seconds to keep retrying the database connection before giving up
    #[arg(long, default_value = "30", env = "STORYFORGE_CONNECT_TIMEOUT_SECS", global = true)]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show registration coverage of succeeded jobs
    Status {
        /// Only count jobs completed within this many days
        #[arg(long)]
        max_age_days: Option<i64>,
    },
    /// Register jobs that are missing an IP
    Retry(RetryArgs),
}

#[derive(Args, Debug)]
struct RetryArgs {
    /// Batch size (defaults to backfill.default_limit)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    limit: Option<u64>,

    /// Re-register jobs that already have an IP
    #[arg(long)]
    force: bool,

    /// Register a single job by internal or provider id
    #[arg(long, conflicts_with = "dry_run")]
    job_id: Option<String>,

    /// Show what a batch would do without calling out or writing
    #[arg(long)]
    dry_run: bool,

    /// Only consider jobs completed within this many days
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
    max_age_days: Option<i64>,
}

impl RetryArgs {
    fn batch_options(&self, defaults: BatchOptions) -> BatchOptions {
        BatchOptions {
            limit: self.limit.unwrap_or(defaults.limit),
            force: self.force,
            max_age_days: self.max_age_days.unwrap_or(defaults.max_age_days),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Arc::new(AppConfig::load().context("Failed to load configuration")?);
    init_tracing(&config.observability);

    let timeout = Duration::from_secs(cli.connect_timeout_secs);
    let db = match connect(&config, timeout).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Provenance store unreachable");
            eprintln!("error: provenance store unreachable: {}", e);
            return Ok(ExitCode::from(STORE_UNREACHABLE));
        }
    };
    let store: Arc<dyn ProvenanceStore> = Arc::new(Repository::new(db));

    let result = match &cli.command {
        Command::Status { max_age_days } => status(store, *max_age_days, cli.json).await,
        Command::Retry(args) => retry(config, store, args, cli.json).await,
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if is_store_error(&e) => {
            error!(error = %e, "Provenance store failed mid-run");
            eprintln!("error: provenance store unreachable: {}", e);
            Ok(ExitCode::from(STORE_UNREACHABLE))
        }
        Err(AppError::JobNotFound { id }) => {
            println!("No training job matches {}", id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Err(e.into()),
    }
}

fn init_tracing(config: &ObservabilityConfig) {
    let subscriber = build_subscriber(config, std::io::stderr);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: tracing already initialised: {}", e);
    }
}

/// Log subscriber writing to `writer`; stdout stays free for reports
fn build_subscriber<W>(
    config: &ObservabilityConfig,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer);

    if config.json_logging {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

async fn connect(config: &AppConfig, timeout: Duration) -> storyforge_common::Result<DbPool> {
    let db = DbPool::connect_with_retry(&config.database, timeout).await?;
    db.ping().await?;
    info!("Connected to provenance store");
    Ok(db)
}

fn is_store_error(e: &AppError) -> bool {
    matches!(
        e,
        AppError::Database(_) | AppError::DatabaseConnection { .. } | AppError::Migration(_)
    )
}

async fn status(
    store: Arc<dyn ProvenanceStore>,
    max_age_days: Option<i64>,
    json: bool,
) -> storyforge_common::Result<()> {
    let completed_after = max_age_days.map(|days| Utc::now() - ChronoDuration::days(days));
    let summary = store.registration_summary(completed_after).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", render_summary(&summary, max_age_days));
    }
    Ok(())
}

async fn retry(
    config: Arc<AppConfig>,
    store: Arc<dyn ProvenanceStore>,
    args: &RetryArgs,
    json: bool,
) -> storyforge_common::Result<()> {
    let client = create_registration_client(&config.registration)?;
    let engine = Arc::new(RegistrationEngine::new(
        store,
        client,
        EngineSettings::from_config(&config),
    ));
    let pacer = RegistrationPacer::new(config.pacing_interval(), config.backfill.pacing_burst);
    let orchestrator = Orchestrator::new(engine, pacer);

    if let Some(reference) = &args.job_id {
        let report = orchestrator.retry_one(reference, args.force).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", render_job(&report));
        }
        return Ok(());
    }

    let options = args.batch_options(BatchOptions::from_config(&config.backfill));
    if args.dry_run {
        let report = orchestrator.dry_run_batch(options).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", render_dry_run(&report, &options));
        }
    } else {
        let report = orchestrator.retry_batch(options).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", render_batch(&report));
        }
    }
    Ok(())
}

fn render_summary(summary: &RegistrationSummary, max_age_days: Option<i64>) -> String {
    let window = match max_age_days {
        Some(days) => format!("last {} days", days),
        None => "all time".to_string(),
    };

    let mut out = String::new();
    let _ = writeln!(out, "Registration status ({})", window);
    let _ = writeln!(out, "  eligible jobs:    {}", summary.eligible);
    let _ = writeln!(out, "  registered:       {}", summary.registered);
    let _ = writeln!(out, "  unregistered:     {}", summary.unregistered);
    let _ = writeln!(out, "  failed attempts:  {}", summary.failed_attempts);
    out
}

fn render_job(report: &JobReport) -> String {
    let name = report
        .external_id
        .clone()
        .unwrap_or_else(|| report.job_id.to_string());

    let detail = match &report.result {
        JobResult::Completed(RegistrationOutcome::Registered {
            ip_id,
            parents_used,
            parents_total,
            flow,
            ..
        }) => format!("{} (flow {}, {}/{} parents)", ip_id, flow, parents_used, parents_total),
        JobResult::Completed(RegistrationOutcome::AlreadyRegistered { ip_id: Some(ip_id) }) => {
            ip_id.clone()
        }
        JobResult::Completed(RegistrationOutcome::Failed { reason, .. }) => reason.clone(),
        JobResult::Errored { error, .. } => error.clone(),
        JobResult::Completed(_) => String::new(),
    };

    format!("{} {} {}", name, report.result.label(), detail)
        .trim_end()
        .to_string()
}

fn render_batch(report: &BatchReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Batch: {} considered, {} registered, {} skipped, {} failed",
        report.considered, report.registered, report.skipped, report.failed
    );
    for job in &report.jobs {
        let _ = writeln!(out, "  {}", render_job(job));
    }
    out
}

fn render_dry_run(report: &DryRunReport, options: &BatchOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Dry run (limit {}, last {} days{}): {} candidates, {} would register, {} have no parents",
        options.limit,
        options.max_age_days,
        if options.force { ", forced" } else { "" },
        report.jobs.len(),
        report.would_attempt,
        report.would_fail_no_parents
    );
    for entry in &report.jobs {
        let name = entry
            .external_id
            .clone()
            .unwrap_or_else(|| entry.job_id.to_string());
        let flow = entry
            .flow
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {} flow {} parents {}/{}{}{}",
            name,
            flow,
            entry.parents_submitted,
            entry.parents_total,
            if entry.already_registered { " registered" } else { "" },
            if entry.would_attempt { " -> attempt" } else { " -> skip" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use storyforge_common::engine::FailureKind;
    use storyforge_common::store::ProvenanceFlow;
    use uuid::Uuid;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("retry-tool").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_status() {
        let cli = parse(&["status", "--max-age-days", "3"]);
        assert!(matches!(cli.command, Command::Status { max_age_days: Some(3) }));
        assert!(!cli.json);
        assert_eq!(cli.connect_timeout_secs, 30);
    }

    #[test]
    fn test_parse_retry_batch() {
        let cli = parse(&["retry", "--limit", "25", "--force", "--json"]);
        let Command::Retry(args) = cli.command else {
            panic!("expected retry");
        };
        assert!(cli.json);
        assert_eq!(args.limit, Some(25));
        assert!(args.force);
        assert!(!args.dry_run);

        let defaults = BatchOptions {
            limit: 10,
            force: false,
            max_age_days: 7,
        };
        assert_eq!(
            args.batch_options(defaults),
            BatchOptions {
                limit: 25,
                force: true,
                max_age_days: 7
            }
        );
    }

    #[test]
    fn test_job_id_conflicts_with_dry_run() {
        let result = Cli::try_parse_from(["retry-tool", "retry", "--job-id", "r8-a", "--dry-run"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(Cli::try_parse_from(["retry-tool", "retry", "--limit", "0"]).is_err());
    }

    #[test]
    fn test_render_job_lines() {
        let registered = JobReport {
            job_id: Uuid::new_v4(),
            external_id: Some("r8-one".to_string()),
            result: JobResult::Completed(RegistrationOutcome::Registered {
                ip_id: "0xabc".to_string(),
                tx_hash: None,
                parents_used: 16,
                parents_total: 20,
                flow: ProvenanceFlow::Collection,
            }),
        };
        assert_eq!(render_job(&registered), "r8-one registered 0xabc (flow B, 16/20 parents)");

        let failed = JobReport {
            job_id: Uuid::new_v4(),
            external_id: None,
            result: JobResult::Completed(RegistrationOutcome::Failed {
                kind: FailureKind::ExternalCallFailed,
                reason: "execution reverted".to_string(),
            }),
        };
        let line = render_job(&failed);
        assert!(line.starts_with(&failed.job_id.to_string()));
        assert!(line.ends_with("external_call_failed execution reverted"));

        let in_flight = JobReport {
            job_id: Uuid::new_v4(),
            external_id: Some("r8-two".to_string()),
            result: JobResult::Completed(RegistrationOutcome::RegistrationInFlight),
        };
        assert_eq!(render_job(&in_flight), "r8-two in_flight");
    }

    #[test]
    fn test_render_summary() {
        let summary = RegistrationSummary {
            eligible: 5,
            registered: 3,
            unregistered: 2,
            failed_attempts: 1,
        };
        let out = render_summary(&summary, Some(7));
        assert!(out.starts_with("Registration status (last 7 days)"));
        assert!(out.contains("unregistered:     2"));
    }

    #[test]
    fn test_store_errors_are_classified() {
        assert!(is_store_error(&AppError::DatabaseConnection {
            message: "refused".to_string()
        }));
        assert!(!is_store_error(&AppError::JobNotFound {
            id: "r8-x".to_string()
        }));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn log_line(json_logging: bool) -> String {
        let config = ObservabilityConfig {
            log_level: "info".to_string(),
            json_logging,
            metrics_port: 0,
        };
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = build_subscriber(&config, move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            info!(limit = 5, "Retry run starting");
        });

        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_json_logging_toggle() {
        let json_line = log_line(true);
        let parsed: serde_json::Value = serde_json::from_str(json_line.trim()).unwrap();
        assert_eq!(parsed["fields"]["message"], "Retry run starting");
        assert_eq!(parsed["fields"]["limit"], 5);

        let text_line = log_line(false);
        assert!(text_line.contains("Retry run starting"));
        assert!(serde_json::from_str::<serde_json::Value>(text_line.trim()).is_err());
    }
}
