//! Run orchestration: plugin assembly, pool lifecycle, and the drain loop

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::control::SyncControl;
use crate::db::{DbService, NoDbService, SqlDbService};
use crate::error::{Result, SyncError};
use crate::estimate::{EstimateSnapshot, SyncEstimate};
use crate::filter::{FilterChain, SyncFilter};
use crate::options::SyncOptions;
use crate::stats::{StatsSnapshot, SyncStats};
use crate::storage::{AssemblyInfo, Storage};
use crate::target_filter::TargetFilter;
use crate::task::{crawl_job, JobRuntime, Pools};
use crate::throttle::Throttle;
use crate::verifier::Md5Verifier;

/// Drain-poll interval while waiting for outstanding work
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One assembled sync run: source, filter chain, target, ledger, pools.
///
/// Construction configures every plugin and spins up the pools; `run` drives
/// the crawl, waits for the work to drain and tears everything down. The
/// control methods (`pause`, `resume`, `terminate`, `set_thread_count`) are
/// safe to call from other tasks while `run` is in flight.
pub struct SyncJob {
    runtime: Arc<JobRuntime>,
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
}

impl SyncJob {
    /// Assemble a job, resolving the ledger from the options: sqlite file,
    /// then database URL, then no persistence, in that priority order
    pub async fn new(
        options: SyncOptions,
        source: Arc<dyn Storage>,
        filters: Vec<Arc<dyn SyncFilter>>,
        target: Arc<dyn Storage>,
    ) -> Result<Self> {
        let db: Arc<dyn DbService> = if let Some(path) = &options.db_file {
            Arc::new(SqlDbService::sqlite_file(path, options.db_table.as_deref()).await?)
        } else if let Some(url) = &options.db_connect_string {
            Arc::new(SqlDbService::connect(url, options.db_table.as_deref()).await?)
        } else {
            Arc::new(NoDbService::new())
        };
        Self::with_db(options, source, filters, target, db).await
    }

    /// Assemble a job around an externally managed ledger
    pub async fn with_db(
        options: SyncOptions,
        source: Arc<dyn Storage>,
        filters: Vec<Arc<dyn SyncFilter>>,
        target: Arc<dyn Storage>,
        db: Arc<dyn DbService>,
    ) -> Result<Self> {
        options.validate()?;

        let assembly = AssemblyInfo {
            source: source.name().to_string(),
            filters: filters.iter().map(|f| f.name().to_string()).collect(),
            target: target.name().to_string(),
        };
        configure_plugin(source.name(), source.configure(&assembly).await)?;
        configure_plugin(target.name(), target.configure(&assembly).await)?;
        for filter in &filters {
            configure_plugin(filter.name(), filter.configure(&assembly).await)?;
        }

        let chain = FilterChain::new(filters, TargetFilter::new(target.clone()));
        let verifier = Md5Verifier::new(options.use_metadata_checksum);
        let pools = Pools::new(options.thread_count);
        let bandwidth = throttle_from_limit(options.bandwidth_limit);
        let throughput = throttle_from_limit(options.throughput_limit);

        let runtime = Arc::new(JobRuntime {
            options: Arc::new(options),
            source: source.clone(),
            chain,
            verifier,
            db,
            stats: Arc::new(SyncStats::new()),
            estimate: Arc::new(SyncEstimate::new()),
            control: SyncControl::new(),
            pools,
            bandwidth: Mutex::new(bandwidth),
            throughput: Mutex::new(throughput),
            run_error: Mutex::new(None),
        });
        Ok(Self {
            runtime,
            source,
            target,
        })
    }

    /// Stats for this run, live while `run` is in flight
    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.runtime.stats
    }

    /// Serializable stats snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        self.runtime.stats.snapshot()
    }

    /// Progress-estimate totals discovered so far
    pub fn estimate(&self) -> EstimateSnapshot {
        self.runtime.estimate.snapshot()
    }

    /// Replace the bandwidth throttle, e.g. with one shared across jobs
    pub fn set_bandwidth_throttle(&self, throttle: Option<Arc<Throttle>>) {
        *self.runtime.bandwidth.lock().unwrap() = throttle;
    }

    /// Replace the throughput throttle, e.g. with one shared across jobs
    pub fn set_throughput_throttle(&self, throttle: Option<Arc<Throttle>>) {
        *self.runtime.throughput.lock().unwrap() = throttle;
    }

    /// Drive the run to completion.
    ///
    /// Launches the estimate pass and the crawl pass, polls until the
    /// payload pools drain or the job is terminated, then tears down. A
    /// run-level error is re-thrown after teardown completes; per-object
    /// failures are reflected only in the stats and the ledger.
    pub async fn run(&self) -> Result<()> {
        let runtime = &self.runtime;
        runtime.stats.job_started();
        info!(
            job_id = %runtime.stats.job_id(),
            source = self.source.name(),
            target = self.target.name(),
            threads = runtime.options.thread_count,
            "sync job starting"
        );

        // The estimate pass is best-effort and never gates the real work
        if let Err(e) = runtime.pools.list.submit(crawl_job(runtime.clone(), true)) {
            warn!(error = %e, "estimate pass could not start");
        }
        if let Err(e) = runtime
            .pools
            .list
            .blocking_submit(crawl_job(runtime.clone(), false))
            .await
        {
            // A rejection after terminate() is a normal wind-down; anything
            // else is a run-level failure that still goes through teardown
            if runtime.control.is_running() {
                runtime.record_run_error(e);
                runtime.control.terminate();
            }
        }

        while runtime.control.is_running() && runtime.pools.outstanding() > 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.teardown().await;
        runtime.stats.job_complete();

        match runtime.run_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop dequeuing in every pool and freeze elapsed-time accounting;
    /// queued work is preserved
    pub fn pause(&self) {
        for pool in self.runtime.pools.all() {
            if let Err(e) = pool.pause() {
                warn!(pool = pool.name(), error = %e, "pause failed");
            }
        }
        self.runtime.stats.pause();
    }

    /// Resume a paused job
    pub fn resume(&self) {
        for pool in self.runtime.pools.all() {
            if let Err(e) = pool.resume() {
                warn!(pool = pool.name(), error = %e, "resume failed");
            }
        }
        self.runtime.stats.resume();
    }

    /// Hard stop: flips the control flag and discards queued-but-unstarted
    /// work in every pool. Running tasks finish their current unit.
    pub fn terminate(&self) {
        self.runtime.control.terminate();
        self.runtime.pools.stop_all();
    }

    /// Whether the job has not been terminated
    pub fn is_running(&self) -> bool {
        self.runtime.control.is_running()
    }

    /// Resize every pool live and notify plugins that registered interest
    /// in option changes
    pub fn set_thread_count(&self, thread_count: usize) -> Result<()> {
        if thread_count == 0 {
            return Err(SyncError::config("options", "thread_count must be at least 1"));
        }
        self.runtime.pools.resize(thread_count)?;
        let updated = SyncOptions {
            thread_count,
            ..(*self.runtime.options).clone()
        };
        self.source.notify_options_changed(&updated);
        self.target.notify_options_changed(&updated);
        self.runtime.chain.notify_options_changed(&updated);
        info!(thread_count, "pools resized");
        Ok(())
    }

    /// Close failures are logged and never escalated so teardown always
    /// completes for every sibling
    async fn teardown(&self) {
        self.runtime.pools.stop_all();
        if let Err(e) = self.source.close().await {
            warn!(plugin = self.source.name(), error = %e, "close failed");
        }
        for (name, result) in self.runtime.chain.close_filters().await {
            if let Err(e) = result {
                warn!(plugin = %name, error = %e, "close failed");
            }
        }
        if let Err(e) = self.target.close().await {
            warn!(plugin = self.target.name(), error = %e, "close failed");
        }
        if let Err(e) = self.runtime.db.close().await {
            warn!(error = %e, "ledger close failed");
        }
    }
}

fn configure_plugin(name: &str, result: Result<()>) -> Result<()> {
    result.map_err(|e| match e {
        err @ SyncError::Config { .. } => err,
        other => SyncError::config(name, other.to_string()),
    })
}

fn throttle_from_limit(limit: u64) -> Option<Arc<Throttle>> {
    if limit == 0 {
        None
    } else {
        Some(Arc::new(Throttle::new(limit)))
    }
}

/// Assemble and run one job, returning the final stats snapshot
pub async fn run_sync(
    options: SyncOptions,
    source: Arc<dyn Storage>,
    filters: Vec<Arc<dyn SyncFilter>>,
    target: Arc<dyn Storage>,
) -> Result<StatsSnapshot> {
    let job = SyncJob::new(options, source, filters, target).await?;
    job.run().await?;
    Ok(job.snapshot())
}
