use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fundscope_core::{FundType, JobKey, JobStatus, ReportPeriod};
use fundscope_storage::{connect_pool, run_migrations, JobMatcher};
use fundscope_sync::{Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "fundscope")]
#[command(about = "Crawls regulator fund disclosures and keeps derived fund metrics current")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the job scheduler until interrupted.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Discover managers and start their crawl chains.
    Init,
    /// Refresh the mutual-fund scheme list and queue NAV syncs.
    MfSync,
    /// Start a chained crawl from a month (`YYYY-MM`).
    Crawl {
        #[arg(long, value_parser = parse_period)]
        from: ReportPeriod,
        /// Registration id; every known manager when omitted.
        #[arg(long)]
        uid: Option<String>,
    },
    /// Re-crawl an inclusive month range without chaining.
    Refetch {
        #[arg(long, value_parser = parse_period)]
        from: ReportPeriod,
        #[arg(long, value_parser = parse_period)]
        to: ReportPeriod,
        #[arg(long)]
        uid: Option<String>,
    },
    /// Re-enqueue every recorded crawl failure.
    RetryFailed,
    /// Reconcile a fund house, or queue it with `--later`.
    Reconcile {
        fund_manager_id: i64,
        #[arg(long)]
        later: bool,
    },
    Fund {
        #[command(subcommand)]
        command: FundCommands,
    },
    /// Recompute fund-level returns from stored reports.
    ComputeReturns {
        /// `PMF` or `MF`; all funds when omitted.
        #[arg(long, value_parser = parse_fund_type)]
        fund_type: Option<FundType>,
    },
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Debug, Subcommand)]
enum FundCommands {
    /// Mark DUPLICATE as a copy of CANONICAL.
    Merge { duplicate: i64, canonical: i64 },
    Unmerge { fund_id: i64 },
    Hide { fund_id: i64 },
    Unhide { fund_id: i64 },
}

#[derive(Debug, Subcommand)]
enum JobCommands {
    List {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Delete a job by `group::name`.
    Remove { key: JobKey },
    /// Put a failed job back on the queue.
    Requeue { key: JobKey },
}

fn parse_period(raw: &str) -> Result<ReportPeriod, String> {
    ReportPeriod::parse(raw).ok_or_else(|| format!("expected YYYY-MM, got `{raw}`"))
}

fn parse_fund_type(raw: &str) -> Result<FundType, String> {
    FundType::parse(&raw.to_ascii_uppercase())
        .ok_or_else(|| format!("expected PMF or MF, got `{raw}`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(&logging::LoggingConfig::from_env())?;
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Migrate = command {
        let pool = connect_pool(&config.database_url, 1).await?;
        run_migrations(&pool).await?;
        println!("migrations applied");
        return Ok(());
    }

    let pipeline = Pipeline::from_config(config).await?;
    match command {
        Commands::Run => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("interrupt received; draining workers"),
                    Err(err) => warn!(error = %err, "listening for ctrl-c failed"),
                }
                on_signal.cancel();
            });
            pipeline.run(cancel).await?;
        }
        // applied before the pipeline is built
        Commands::Migrate => {}
        Commands::Init => report_enqueued("init", pipeline.schedule_init().await?),
        Commands::MfSync => report_enqueued("mf-sync", pipeline.schedule_mf_sync().await?),
        Commands::Crawl { from, uid } => {
            let queued = pipeline.crawl(uid.as_deref(), from).await?;
            println!("queued {queued} crawl(s) from {from}");
        }
        Commands::Refetch { from, to, uid } => {
            let queued = pipeline.refetch_range(uid.as_deref(), from, to).await?;
            println!("queued {queued} refetch(es) for {from}..={to}");
        }
        Commands::RetryFailed => {
            let queued = pipeline.replay_failed_crawls().await?;
            println!("queued {queued} failed crawl(s)");
        }
        Commands::Reconcile {
            fund_manager_id,
            later,
        } => {
            if later {
                let queued = pipeline.schedule_reconciliation(fund_manager_id).await?;
                report_enqueued("reconcile", queued);
            } else {
                let summary = pipeline
                    .reconcile_now(fund_manager_id)
                    .await
                    .with_context(|| format!("reconciling fund manager {fund_manager_id}"))?;
                println!(
                    "reconciled manager {fund_manager_id}: \
                     funds={} merged_reports={} drawdowns={} hidden={}",
                    summary.funds, summary.merged_reports, summary.drawdowns, summary.hidden
                );
            }
        }
        Commands::Fund { command } => match command {
            FundCommands::Merge {
                duplicate,
                canonical,
            } => {
                pipeline.merge_fund(duplicate, canonical).await?;
                println!("fund {duplicate} merged into {canonical}");
            }
            FundCommands::Unmerge { fund_id } => {
                pipeline.unmerge_fund(fund_id).await?;
                println!("fund {fund_id} unmerged");
            }
            FundCommands::Hide { fund_id } => {
                pipeline.set_fund_hidden(fund_id, true).await?;
                println!("fund {fund_id} hidden");
            }
            FundCommands::Unhide { fund_id } => {
                pipeline.set_fund_hidden(fund_id, false).await?;
                println!("fund {fund_id} visible");
            }
        },
        Commands::ComputeReturns { fund_type } => {
            let updated = pipeline.compute_returns(fund_type).await?;
            println!("updated returns for {updated} fund(s)");
        }
        Commands::Jobs { command } => match command {
            JobCommands::List { group, status } => {
                let mut matchers = Vec::new();
                matchers.extend(group.map(JobMatcher::Group));
                matchers.extend(status.map(JobMatcher::Status));
                for job in pipeline.list_jobs(&matchers).await? {
                    println!(
                        "{}\t{}\t{}\tattempts={}\t{}",
                        job.key,
                        job.status.as_str(),
                        job.next_run_time.to_rfc3339(),
                        job.attempts,
                        job.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
            JobCommands::Remove { key } => {
                let removed = pipeline.remove_job(&key).await?;
                println!("removed {} ({})", removed.key, removed.status.as_str());
            }
            JobCommands::Requeue { key } => {
                let job = pipeline.requeue_job(&key).await?;
                println!("requeued {} for {}", job.key, job.next_run_time.to_rfc3339());
            }
        },
    }

    Ok(())
}

fn report_enqueued(what: &str, queued: bool) {
    if queued {
        println!("{what} job queued");
    } else {
        println!("{what} job already pending");
    }
}
