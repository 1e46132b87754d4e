use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use objsync::{run_sync, FilesystemStorage, StatsSnapshot, SyncOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "objsync")]
#[command(about = "Migrate and synchronize object trees between storage roots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy objects from a source root to a target root
    Sync(RunArgs),
    /// Only verify existing targets against the source, copying nothing
    Verify(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Source root directory
    #[arg(short, long)]
    source: PathBuf,
    /// Target root directory (created when missing)
    #[arg(short, long)]
    target: PathBuf,
    /// YAML file with the full option set; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Worker count for the sync pools
    #[arg(long)]
    threads: Option<usize>,
    /// Retries per object before it is counted as failed
    #[arg(long)]
    retries: Option<u32>,
    /// Copy every object even when the ledger says it is up to date
    #[arg(long)]
    force: bool,
    /// Verify target content after copying
    #[arg(long)]
    verify: bool,
    /// Do not recurse into directories
    #[arg(long)]
    no_recursive: bool,
    /// Delete each source object after it has been synced
    #[arg(long)]
    delete_source: bool,
    /// SQLite file backing the status ledger
    #[arg(long)]
    db_file: Option<String>,
    /// Database URL backing the status ledger (e.g. mysql://...)
    #[arg(long)]
    db_url: Option<String>,
    /// Table name for the status ledger
    #[arg(long)]
    db_table: Option<String>,
    /// File with one source identifier per line
    #[arg(long)]
    list_file: Option<String>,
    /// Treat list-file lines verbatim: no comments, escapes or trimming
    #[arg(long)]
    raw_values: bool,
    /// Bandwidth cap in bytes per second
    #[arg(long)]
    bandwidth_limit: Option<u64>,
    /// Throughput cap in objects per second
    #[arg(long)]
    throughput_limit: Option<u64>,
}

impl RunArgs {
    fn build_options(&self, verify_only: bool) -> Result<SyncOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => SyncOptions::default(),
        };
        if let Some(threads) = self.threads {
            options.thread_count = threads;
        }
        if let Some(retries) = self.retries {
            options.retry_attempts = retries;
        }
        if self.force {
            options.force_sync = true;
        }
        if self.verify {
            options.verify = true;
        }
        if self.no_recursive {
            options.recursive = false;
        }
        if self.delete_source {
            options.delete_source = true;
        }
        if let Some(db_file) = &self.db_file {
            options.db_file = Some(db_file.clone());
        }
        if let Some(db_url) = &self.db_url {
            options.db_connect_string = Some(db_url.clone());
        }
        if let Some(db_table) = &self.db_table {
            options.db_table = Some(db_table.clone());
        }
        if let Some(list_file) = &self.list_file {
            options.source_list_file = Some(list_file.clone());
        }
        if self.raw_values {
            options.source_list_raw_values = true;
        }
        if let Some(limit) = self.bandwidth_limit {
            options.bandwidth_limit = limit;
        }
        if let Some(limit) = self.throughput_limit {
            options.throughput_limit = limit;
        }
        options.verify_only = verify_only;
        // Failure reporting below needs the identifiers
        options.remember_failed = true;
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let (args, verify_only) = match &cli.command {
        Commands::Sync(args) => (args, false),
        Commands::Verify(args) => (args, true),
    };
    let options = args.build_options(verify_only)?;

    info!(
        source = %args.source.display(),
        target = %args.target.display(),
        "starting run"
    );
    let source = Arc::new(FilesystemStorage::new(&args.source));
    let target = Arc::new(FilesystemStorage::new_create(&args.target));

    match run_sync(options, source, vec![], target).await {
        Ok(stats) => {
            report(&stats);
            if stats.objects_failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(2);
        }
    }
}

fn report(stats: &StatsSnapshot) {
    println!(
        "{} objects complete ({} bytes), {} skipped, {} copy-skipped, {} failed in {:.2}s",
        stats.objects_complete,
        stats.bytes_complete,
        stats.objects_skipped,
        stats.objects_copy_skipped,
        stats.objects_failed,
        stats.elapsed.as_secs_f64()
    );
    for failed in &stats.failed_objects {
        match failed.list_row_num {
            Some(row) => eprintln!("failed: {} (list row {row})", failed.identifier),
            None => eprintln!("failed: {}", failed.identifier),
        }
    }
}
