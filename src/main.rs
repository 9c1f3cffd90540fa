//! Binary entrypoint for the chainvault CLI.
//!
//! Commands:
//! - `init` - write a starter `chainvault.toml`
//! - `start` - reconcile configured jobs and run scheduler, workers and retention sweeper
//! - `status` - list jobs with their lease, last run and newest valid entry
//! - `backup <job>` - run one backup now
//! - `restore <entry> <destination> [--resume-from N]` - restore a chain entry
//! - `entries <environment> <volume>` / `history <job>` - inspect chains and run records
//! - `sweep [--dry-run]` - apply retention once
//! - `retention <job>` / `enable <job>` / `disable <job>` - adjust a job
//!
//! See the library crate docs for module-level details: `chainvault::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use chainvault::config::Config;
use chainvault::model::{EntryId, RetentionPolicy, RunOutcome, RunRecord, VolumeRef};
use chainvault::service::Service;

#[derive(Parser)]
#[command(name = "chainvault")]
#[command(about = "Scheduled full/incremental volume backups with chain-aware retention")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "chainvault.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init,
    /// Run the scheduler, worker pool and retention sweeper until interrupted
    Start,
    /// Show jobs, leases and the newest entry of each volume
    Status,
    /// Run a backup of a job immediately
    Backup {
        /// Job name or id
        job: String,
    },
    /// Restore a chain entry into a destination directory
    Restore {
        /// Entry id (`entry-N` or `N`)
        entry: String,
        destination: String,
        /// Skip the first N entries of the restore path (already applied)
        #[arg(long, default_value_t = 0)]
        resume_from: usize,
    },
    /// List the chain entries of a volume
    Entries {
        /// Environment name or id
        environment: String,
        volume: String,
    },
    /// Show the run history of a job
    History {
        job: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Apply retention once
    Sweep {
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
    /// Replace a job's retention policy (applies to future entries and future sweeps)
    Retention {
        job: String,
        #[arg(long)]
        keep_last: Option<u32>,
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Resume scheduling a job
    Enable { job: String },
    /// Stop scheduling a job
    Disable { job: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        if std::path::Path::new(&cli.config).exists() {
            return Err(anyhow!("{} already exists; refusing to overwrite", cli.config));
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    config.validate()?;
    init_logging(&Some(config.clone()), cli.verbose);
    let service = Service::from_config(&config)?;

    match cli.command {
        Commands::Init => {}
        Commands::Start => {
            info!("Starting chainvault v{}", env!("CARGO_PKG_VERSION"));
            service.apply_config(&config)?;
            service
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                    info!("Received shutdown signal");
                })
                .await?;
        }
        Commands::Status => {
            service.apply_config(&config)?;
            println!("=== chainvault status ===");
            println!("Node: {}", config.orchestrator.node_id);
            for env in service.list_environments()? {
                println!("Environment {} ({})", env.name, env.id);
            }
            for job in service.list_jobs()? {
                let view = service.job_status(job.id)?;
                println!(
                    "{} {:<20} {:<8} schedule={} retention={} next={}",
                    job.id,
                    job.name,
                    job.status,
                    job.schedule,
                    job.retention,
                    job.next_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into())
                );
                if let Some(lease) = view.lease {
                    println!("    lease: {} until {}", lease.owner, lease.expires_at);
                }
                if let Some(run) = view.last_run {
                    println!("    last run: {}", describe_run(&run));
                }
                if let Some(entry) = view.latest_entry {
                    println!(
                        "    latest: {} {} {} bytes at {}",
                        entry.id,
                        entry.kind.label(),
                        entry.size_bytes,
                        entry.created_at
                    );
                }
            }
        }
        Commands::Backup { job } => {
            service.apply_config(&config)?;
            let job = service.resolve_job(&job)?;
            let run = service.backup_now(job.id).await?;
            println!("{}", describe_run(&run));
            exit_on_failure(&service, &run)?;
        }
        Commands::Restore {
            entry,
            destination,
            resume_from,
        } => {
            let entry: EntryId = entry
                .parse()
                .map_err(|_| anyhow!("'{}' is not an entry id", entry))?;
            let run = service.restore_now(entry, &destination, resume_from).await?;
            println!("{}", describe_run(&run));
            exit_on_failure(&service, &run)?;
        }
        Commands::Entries {
            environment,
            volume,
        } => {
            let environment = service.resolve_environment(&environment)?;
            let volume = VolumeRef::new(environment.id, volume);
            for entry in service.list_entries(&volume)? {
                println!(
                    "{} {:<12} parent={} status={} units={} bytes={} created={}",
                    entry.id,
                    entry.kind.label(),
                    entry
                        .parent()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".into()),
                    entry.status,
                    entry.checksums.len(),
                    entry.size_bytes,
                    entry.created_at
                );
            }
        }
        Commands::History { job, limit } => {
            let job = service.resolve_job(&job)?;
            for run in service.run_history(job.id)?.into_iter().take(limit) {
                println!("{}", describe_run(&run));
            }
        }
        Commands::Sweep { dry_run } => {
            let report = service.sweep_retention(dry_run).await?;
            let verb = if dry_run { "would delete" } else { "deleted" };
            println!("{} {} entries", verb, report.deleted.len());
            for id in &report.deleted {
                println!("  {}", id);
            }
            if !report.pinned.is_empty() {
                println!("{} entries held by running restores", report.pinned.len());
            }
            if !report.recovered.is_empty() {
                println!("{} abandoned entries marked corrupt", report.recovered.len());
            }
            if report.expired_pins > 0 {
                println!("{} stale restore pins dropped", report.expired_pins);
            }
            if report.purge_failures > 0 {
                warn!("{} payload purges failed", report.purge_failures);
            }
        }
        Commands::Retention {
            job,
            keep_last,
            max_age_hours,
        } => {
            if keep_last == Some(0) {
                return Err(anyhow!("--keep-last must be at least 1"));
            }
            let job = service.resolve_job(&job)?;
            let job = service.update_retention_policy(
                job.id,
                RetentionPolicy {
                    keep_last,
                    max_age_hours,
                },
            )?;
            println!("{} retention is now {}", job.name, job.retention);
        }
        Commands::Enable { job } => {
            let job = service.resolve_job(&job)?;
            service.set_job_enabled(job.id, true)?;
        }
        Commands::Disable { job } => {
            let job = service.resolve_job(&job)?;
            service.set_job_enabled(job.id, false)?;
        }
    }

    service.store().flush()?;
    Ok(())
}

fn describe_run(run: &RunRecord) -> String {
    let outcome = run
        .outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| "in progress".into());
    let mut line = format!(
        "{} started={} outcome={} bytes={}",
        run.id, run.started_at, outcome, run.bytes_moved
    );
    if let Some(entry) = run.produced_entry() {
        line.push_str(&format!(" entry={}", entry));
    }
    if let Some(detail) = &run.error_detail {
        line.push_str(&format!(" error=\"{}\"", detail));
    }
    line
}

fn exit_on_failure(service: &Service, run: &RunRecord) -> Result<()> {
    if matches!(run.outcome, Some(RunOutcome::Failed) | Some(RunOutcome::Aborted)) {
        service.store().flush()?;
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
