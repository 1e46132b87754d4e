//! Per-object sync task, retry handling, and the crawl/query/estimate jobs

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tracing::{debug, error, warn};

use crate::control::SyncControl;
use crate::db::{DbService, SyncRecord};
use crate::error::{Result, SyncError};
use crate::estimate::SyncEstimate;
use crate::filter::FilterChain;
use crate::list_file::read_list_file;
use crate::model::{ObjectContext, ObjectStatus, ObjectSummary};
use crate::options::SyncOptions;
use crate::pool::{job, Job, WorkerPool};
use crate::stats::SyncStats;
use crate::storage::Storage;
use crate::throttle::Throttle;
use crate::verifier::Md5Verifier;

/// Queue capacity for the pools that carry object payloads
const BOUNDED_QUEUE: usize = 1000;

/// The six pools of one job.
///
/// The payload-carrying pools (list, estimate, sync) have bounded queues so
/// memory stays bounded during a large crawl; the fan-out pools are
/// unbounded because their jobs only carry control state. Retry submission
/// runs on its own pool so a stalled sync pool can never deadlock retry
/// scheduling.
pub(crate) struct Pools {
    pub list: WorkerPool,
    pub estimate_query: WorkerPool,
    pub estimate: WorkerPool,
    pub query: WorkerPool,
    pub sync: WorkerPool,
    pub retry: WorkerPool,
}

impl Pools {
    pub fn new(thread_count: usize) -> Self {
        Self {
            list: WorkerPool::new("list", 2, Some(BOUNDED_QUEUE)),
            estimate_query: WorkerPool::new("estimate-query", thread_count, None),
            estimate: WorkerPool::new("estimate", thread_count, Some(BOUNDED_QUEUE)),
            query: WorkerPool::new("query", thread_count, None),
            sync: WorkerPool::new("sync", thread_count, Some(BOUNDED_QUEUE)),
            retry: WorkerPool::new("retry-submit", retry_size(thread_count), None),
        }
    }

    pub fn all(&self) -> [&WorkerPool; 6] {
        [
            &self.list,
            &self.estimate_query,
            &self.estimate,
            &self.query,
            &self.sync,
            &self.retry,
        ]
    }

    /// Resize every pool for a new thread count; the list pool keeps its
    /// fixed small size
    pub fn resize(&self, thread_count: usize) -> Result<()> {
        self.estimate_query.resize(thread_count)?;
        self.estimate.resize(thread_count)?;
        self.query.resize(thread_count)?;
        self.sync.resize(thread_count)?;
        self.retry.resize(retry_size(thread_count))?;
        Ok(())
    }

    pub fn stop_all(&self) {
        for pool in self.all() {
            pool.stop();
        }
    }

    /// Unfinished work across the pools that gate run completion. The
    /// estimate pools are excluded: estimation is best-effort and never
    /// holds the run open.
    pub fn outstanding(&self) -> usize {
        self.list.unfinished_tasks()
            + self.query.unfinished_tasks()
            + self.sync.unfinished_tasks()
            + self.retry.unfinished_tasks()
    }
}

fn retry_size(thread_count: usize) -> usize {
    (thread_count / 2).max(1)
}

/// Everything the per-object tasks of one run share by reference
pub(crate) struct JobRuntime {
    pub options: Arc<SyncOptions>,
    pub source: Arc<dyn Storage>,
    pub chain: FilterChain,
    pub verifier: Md5Verifier,
    pub db: Arc<dyn DbService>,
    pub stats: Arc<SyncStats>,
    pub estimate: Arc<SyncEstimate>,
    pub control: SyncControl,
    pub pools: Pools,
    /// Bandwidth cap in bytes/s; may be shared across jobs
    pub bandwidth: Mutex<Option<Arc<Throttle>>>,
    /// Throughput cap in objects/s; may be shared across jobs
    pub throughput: Mutex<Option<Arc<Throttle>>>,
    /// First run-level error; re-thrown after teardown
    pub run_error: Mutex<Option<SyncError>>,
}

/// How the two phases of one task resolved, for stats bucketing
struct TaskOutcome {
    copy_skipped: bool,
    verify_skipped: bool,
}

impl JobRuntime {
    pub fn record_run_error(&self, err: SyncError) {
        let mut slot = self.run_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    async fn acquire_throughput(&self) {
        let throttle = self.throughput.lock().unwrap().clone();
        if let Some(throttle) = throttle {
            throttle.acquire(1).await;
        }
    }

    async fn acquire_bandwidth(&self, bytes: u64) {
        let throttle = self.bandwidth.lock().unwrap().clone();
        if let Some(throttle) = throttle {
            throttle.acquire(bytes).await;
        }
    }

    /// Persist the context's status, downgrading ledger failures to a
    /// warning: a DB hiccup must never turn into a false object failure
    async fn persist(&self, ctx: &ObjectContext, error_summary: Option<&str>, is_new: &mut bool) {
        match self.db.set_status(ctx, error_summary, *is_new).await {
            Ok(_) => *is_new = false,
            Err(e) => {
                warn!(identifier = %ctx.identifier(), error = %e, "ledger status write failed");
            }
        }
    }

    /// Submit one discovered object: a sync task, plus a query task that
    /// enumerates children when it is a directory and recursion is on
    pub async fn submit_object(self: &Arc<Self>, summary: ObjectSummary) {
        if !self.control.is_running() {
            return;
        }
        let recurse = summary.is_directory && self.options.recursive;
        let ctx = ObjectContext::new(summary.clone(), self.options.clone());
        if let Err(e) = self
            .pools
            .sync
            .blocking_submit(sync_job(self.clone(), ctx))
            .await
        {
            warn!(identifier = %summary.identifier, error = %e, "sync submission rejected");
            return;
        }
        if recurse {
            if let Err(e) = self.pools.query.submit(query_job(self.clone(), summary.clone())) {
                warn!(identifier = %summary.identifier, error = %e, "query submission rejected");
            }
        }
    }

    /// Submit one discovered object to the estimate pool, fanning directory
    /// enumeration out to the estimate-query pool
    pub async fn submit_estimate(self: &Arc<Self>, summary: ObjectSummary) {
        if !self.control.is_running() {
            return;
        }
        if let Err(e) = self
            .pools
            .estimate
            .blocking_submit(estimate_job(self.clone(), summary))
            .await
        {
            debug!(error = %e, "estimate submission rejected");
        }
    }
}

/// Build the boxed sync job for one object context
pub(crate) fn sync_job(runtime: Arc<JobRuntime>, ctx: ObjectContext) -> Job {
    job(async move { run_sync_task(runtime, ctx).await })
}

/// Build the boxed query job that enumerates a directory's children
pub(crate) fn query_job(runtime: Arc<JobRuntime>, parent: ObjectSummary) -> Job {
    job(async move {
        if !runtime.control.is_running() {
            return;
        }
        let mut children = runtime.source.children(&parent);
        while let Some(item) = children.next().await {
            if !runtime.control.is_running() {
                return;
            }
            match item {
                Ok(summary) => runtime.submit_object(summary).await,
                Err(e) => {
                    warn!(parent = %parent.identifier, error = %e, "child listing failed");
                }
            }
        }
    })
}

/// Build the boxed estimate job for one discovered object
pub(crate) fn estimate_job(runtime: Arc<JobRuntime>, summary: ObjectSummary) -> Job {
    job(async move {
        if !runtime.control.is_running() {
            return;
        }
        runtime
            .estimate
            .add(1, if summary.is_directory { 0 } else { summary.size });
        if summary.is_directory && runtime.options.recursive {
            let rt = runtime.clone();
            let result = runtime.pools.estimate_query.submit(job(async move {
                if !rt.control.is_running() {
                    return;
                }
                let mut children = rt.source.children(&summary);
                while let Some(item) = children.next().await {
                    if !rt.control.is_running() {
                        return;
                    }
                    match item {
                        Ok(child) => rt.submit_estimate(child).await,
                        Err(e) => debug!(error = %e, "estimate child listing failed"),
                    }
                }
            }));
            if let Err(e) = result {
                debug!(error = %e, "estimate fan-out rejected");
            }
        }
    })
}

/// Build the crawl job driving either the estimate pass or the real sync
/// pass. Source priority: literal list, then list file, then full
/// enumeration. A failed sync crawl is a run-level error; a failed estimate
/// crawl only loses progress totals.
pub(crate) fn crawl_job(runtime: Arc<JobRuntime>, for_estimate: bool) -> Job {
    job(async move {
        if let Err(e) = crawl(&runtime, for_estimate).await {
            if for_estimate {
                warn!(error = %e, "estimate crawl failed");
            } else {
                error!(error = %e, "source crawl failed; terminating run");
                runtime.record_run_error(e);
                runtime.control.terminate();
            }
        }
    })
}

async fn crawl(runtime: &Arc<JobRuntime>, for_estimate: bool) -> Result<()> {
    if let Some(list) = &runtime.options.source_list {
        for (index, value) in list.iter().enumerate() {
            if !runtime.control.is_running() {
                return Ok(());
            }
            let mut summary = runtime.source.parse_list_line(value).await?;
            summary.list_row_num = Some(index as u64 + 1);
            dispatch(runtime, summary, for_estimate).await;
        }
        return Ok(());
    }
    if let Some(path) = &runtime.options.source_list_file {
        let raw = runtime.options.source_list_raw_values;
        for (row, value) in read_list_file(std::path::Path::new(path), raw).await? {
            if !runtime.control.is_running() {
                return Ok(());
            }
            let mut summary = runtime.source.parse_list_line(&value).await?;
            summary.list_row_num = Some(row);
            dispatch(runtime, summary, for_estimate).await;
        }
        return Ok(());
    }
    let mut objects = runtime.source.all_objects();
    while let Some(item) = objects.next().await {
        if !runtime.control.is_running() {
            return Ok(());
        }
        dispatch(runtime, item?, for_estimate).await;
    }
    Ok(())
}

async fn dispatch(runtime: &Arc<JobRuntime>, summary: ObjectSummary, for_estimate: bool) {
    if for_estimate {
        runtime.submit_estimate(summary).await;
    } else {
        runtime.submit_object(summary).await;
    }
}

async fn run_sync_task(runtime: Arc<JobRuntime>, mut ctx: ObjectContext) {
    if !runtime.control.is_running() {
        return;
    }
    let identifier = ctx.identifier().to_string();
    // Serializes concurrent attempts at the same identifier; duplicates can
    // appear in list-file input
    let _lock = runtime.db.lock(&identifier).await;
    let record = match runtime.db.get_record(&identifier).await {
        Ok(record) => record,
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "ledger read failed; treating as new");
            None
        }
    };
    let mut is_new = record.is_none();
    match process(&runtime, &mut ctx, record.as_ref(), &mut is_new).await {
        Ok(outcome) => {
            let options = &ctx.options;
            let copy_done = options.copy_requested() && !outcome.copy_skipped;
            let verify_done = options.verify_requested() && !outcome.verify_skipped;
            if !copy_done && !verify_done {
                runtime.stats.object_skipped(ctx.size());
            } else {
                runtime.stats.object_complete(ctx.size());
                if options.copy_requested() && outcome.copy_skipped {
                    runtime.stats.object_copy_skipped(ctx.size());
                }
            }
        }
        Err(err) => {
            if !runtime.control.is_running()
                && matches!(err, SyncError::Cancelled | SyncError::PoolShutDown { .. })
            {
                return;
            }
            handle_failure(&runtime, ctx, err, is_new).await;
        }
    }
}

async fn process(
    runtime: &Arc<JobRuntime>,
    ctx: &mut ObjectContext,
    record: Option<&SyncRecord>,
    is_new: &mut bool,
) -> Result<TaskOutcome> {
    // First point an object-not-found condition can surface
    if ctx.object.is_none() {
        ctx.object = Some(runtime.source.load_object(ctx.identifier()).await?);
    }
    runtime.acquire_throughput().await;

    let mut outcome = TaskOutcome {
        copy_skipped: false,
        verify_skipped: false,
    };

    if ctx.options.copy_requested() {
        if copy_needed(ctx, record) {
            ctx.status = ObjectStatus::InTransfer;
            runtime.persist(ctx, None, is_new).await;
            runtime.acquire_bandwidth(ctx.size()).await;
            match runtime.chain.send(ctx).await {
                Ok(()) => {
                    ctx.status = ObjectStatus::Transferred;
                    runtime.persist(ctx, None, is_new).await;
                }
                Err(SyncError::SkipObject { reason }) => {
                    debug!(identifier = %ctx.identifier(), reason, "copy skipped by filter chain");
                    outcome.copy_skipped = true;
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!(identifier = %ctx.identifier(), "copy skipped by ledger");
            outcome.copy_skipped = true;
        }
    }

    if ctx.options.verify_requested() {
        if verify_needed(ctx, record) {
            ctx.status = ObjectStatus::InVerification;
            runtime.persist(ctx, None, is_new).await;
            let target = runtime.chain.load_back(ctx).await?;
            let source = ctx
                .object
                .as_ref()
                .ok_or_else(|| SyncError::not_found(ctx.identifier()))?;
            let target_md5 = runtime.verifier.verify(source, &target).await?;
            ctx.target_md5 = target_md5;
            ctx.status = ObjectStatus::Verified;
            runtime.persist(ctx, None, is_new).await;
        } else {
            debug!(identifier = %ctx.identifier(), "verification skipped by ledger");
            outcome.verify_skipped = true;
        }
    }

    if ctx.options.delete_source {
        match runtime.source.delete(ctx.identifier()).await {
            Ok(()) => {
                if let Err(e) = runtime.db.set_deleted(ctx, *is_new).await {
                    warn!(identifier = %ctx.identifier(), error = %e, "delete-mark failed");
                }
            }
            Err(e) => {
                warn!(identifier = %ctx.identifier(), error = %e, "source deletion failed");
            }
        }
    }

    Ok(outcome)
}

/// Whether the copy phase must run given the prior ledger record
pub(crate) fn copy_needed(ctx: &ObjectContext, record: Option<&SyncRecord>) -> bool {
    let Some(record) = record else {
        return true;
    };
    if ctx.options.force_sync {
        return true;
    }
    if !record.status.is_success() {
        return true;
    }
    source_newer(ctx, record)
}

/// Whether the verification phase must run given the prior ledger record
pub(crate) fn verify_needed(ctx: &ObjectContext, record: Option<&SyncRecord>) -> bool {
    let Some(record) = record else {
        return true;
    };
    if ctx.options.force_sync {
        return true;
    }
    if record.status != ObjectStatus::Verified {
        return true;
    }
    source_newer(ctx, record)
}

fn source_newer(ctx: &ObjectContext, record: &SyncRecord) -> bool {
    match (ctx.source_mtime(), record.mtime) {
        (Some(source), Some(recorded)) => source > recorded,
        // A record without an observed mtime cannot prove freshness
        (Some(_), None) => true,
        _ => false,
    }
}

async fn handle_failure(
    runtime: &Arc<JobRuntime>,
    mut ctx: ObjectContext,
    err: SyncError,
    mut is_new: bool,
) {
    // Verification failures under verify-only are terminal: there was no
    // copy whose transient effects a retry could smooth over
    let terminal = !err.is_retriable()
        || (ctx.options.verify_only && matches!(err, SyncError::Verification { .. }));
    if terminal {
        fail_terminal(runtime, &mut ctx, &err, &mut is_new).await;
        return;
    }
    match submit_for_retry(runtime, ctx, &err, &mut is_new).await {
        RetryDecision::Queued => {}
        RetryDecision::Escalate(mut ctx) => {
            fail_terminal(runtime, &mut ctx, &err, &mut is_new).await;
        }
        RetryDecision::EnqueueFailed(mut ctx) => {
            // The original error propagates as the terminal outcome, not the
            // scheduling error that blocked the retry
            fail_terminal(runtime, &mut ctx, &err, &mut is_new).await;
        }
    }
}

enum RetryDecision {
    Queued,
    Escalate(ObjectContext),
    EnqueueFailed(ObjectContext),
}

/// Re-queue a failed context through the decoupled retry pool.
///
/// Escalates when the object was never loaded or the retry budget is
/// exhausted. A failure to even enqueue the retry also ends the object with
/// the *original* error so the real cause is never masked by a scheduling
/// error.
async fn submit_for_retry(
    runtime: &Arc<JobRuntime>,
    mut ctx: ObjectContext,
    original: &SyncError,
    is_new: &mut bool,
) -> RetryDecision {
    if ctx.object.is_none() || ctx.failures + 1 > ctx.options.retry_attempts {
        return RetryDecision::Escalate(ctx);
    }
    ctx.failures += 1;
    ctx.status = ObjectStatus::RetryQueue;
    runtime
        .persist(&ctx, Some(&original.to_string()), is_new)
        .await;
    // Release the payload while queued; the retry reloads from source
    ctx.object = None;
    debug!(
        identifier = %ctx.identifier(),
        attempt = ctx.failures,
        error = %original,
        "object re-queued for retry"
    );

    // Payload-free copy kept aside so a failed enqueue can still record the
    // terminal outcome in the ledger
    let parked = ctx.clone();
    let rt = runtime.clone();
    let retry = job(async move {
        if !rt.control.is_running() {
            return;
        }
        let next = sync_job(rt.clone(), ctx);
        if let Err(e) = rt.pools.sync.blocking_submit(next).await {
            warn!(error = %e, "retry resubmission rejected");
        }
    });
    match runtime.pools.retry.submit(retry) {
        Ok(()) => RetryDecision::Queued,
        Err(e) => {
            warn!(error = %e, "retry scheduling failed");
            RetryDecision::EnqueueFailed(parked)
        }
    }
}

async fn fail_terminal(
    runtime: &Arc<JobRuntime>,
    ctx: &mut ObjectContext,
    err: &SyncError,
    is_new: &mut bool,
) {
    ctx.status = ObjectStatus::Error;
    runtime.persist(ctx, Some(&err.to_string()), is_new).await;
    runtime.stats.object_failed(
        ctx.identifier(),
        ctx.summary.list_row_num,
        ctx.options.remember_failed,
    );
    warn!(identifier = %ctx.identifier(), error = %err, "object failed terminally");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDbService;
    use crate::model::{ObjectMetadata, SyncObject};
    use crate::storage::MemoryStorage;
    use crate::target_filter::TargetFilter;
    use bytes::Bytes;
    use chrono::{Duration, Utc};

    fn runtime_with(options: SyncOptions) -> Arc<JobRuntime> {
        let target = Arc::new(MemoryStorage::new());
        Arc::new(JobRuntime {
            options: Arc::new(options),
            source: Arc::new(MemoryStorage::new()),
            chain: FilterChain::new(vec![], TargetFilter::new(target)),
            verifier: Md5Verifier::new(false),
            db: Arc::new(MemoryDbService::new()),
            stats: Arc::new(SyncStats::new()),
            estimate: Arc::new(SyncEstimate::new()),
            control: SyncControl::new(),
            pools: Pools::new(1),
            bandwidth: Mutex::new(None),
            throughput: Mutex::new(None),
            run_error: Mutex::new(None),
        })
    }

    fn ctx_with_mtime(options: SyncOptions, mtime: chrono::DateTime<Utc>) -> ObjectContext {
        let mut ctx = ObjectContext::new(ObjectSummary::file("a", 4), Arc::new(options));
        ctx.object = Some(SyncObject::new(
            "a",
            ObjectMetadata::file(4, Some(mtime)),
            Bytes::from_static(b"data"),
        ));
        ctx
    }

    fn record(status: ObjectStatus, mtime: Option<chrono::DateTime<Utc>>) -> SyncRecord {
        SyncRecord {
            identifier: "a".to_string(),
            status,
            error_summary: None,
            mtime,
            target_id: Some("a".to_string()),
            is_deleted: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_retry_enqueue_still_records_terminal_error() {
        let options = SyncOptions {
            retry_attempts: 2,
            remember_failed: true,
            ..SyncOptions::default()
        };
        let runtime = runtime_with(options.clone());
        // With the retry pool stopped, re-queueing the failure cannot succeed
        runtime.pools.retry.stop();

        let ctx = ctx_with_mtime(options, Utc::now());
        let err = SyncError::storage("a", "simulated outage");
        handle_failure(&runtime, ctx, err, true).await;

        let stats = runtime.stats.snapshot();
        assert_eq!(stats.objects_failed, 1);
        assert_eq!(stats.failed_objects[0].identifier, "a");

        // The ledger reflects the terminal outcome with the original error,
        // not a parked RetryQueue state
        let record = runtime.db.get_record("a").await.unwrap().unwrap();
        assert_eq!(record.status, ObjectStatus::Error);
        assert!(record
            .error_summary
            .as_deref()
            .unwrap()
            .contains("simulated outage"));
        runtime.pools.stop_all();
    }

    #[test]
    fn test_copy_needed_without_record() {
        let ctx = ctx_with_mtime(SyncOptions::default(), Utc::now());
        assert!(copy_needed(&ctx, None));
    }

    #[test]
    fn test_copy_skipped_for_successful_up_to_date_record() {
        let then = Utc::now();
        let ctx = ctx_with_mtime(SyncOptions::default(), then);
        let rec = record(ObjectStatus::Transferred, Some(then));
        assert!(!copy_needed(&ctx, Some(&rec)));

        let rec = record(ObjectStatus::Verified, Some(then));
        assert!(!copy_needed(&ctx, Some(&rec)));
    }

    #[test]
    fn test_copy_needed_when_forced_failed_or_newer() {
        let then = Utc::now();

        let forced = SyncOptions {
            force_sync: true,
            ..SyncOptions::default()
        };
        let ctx = ctx_with_mtime(forced, then);
        assert!(copy_needed(&ctx, Some(&record(ObjectStatus::Verified, Some(then)))));

        let ctx = ctx_with_mtime(SyncOptions::default(), then);
        assert!(copy_needed(&ctx, Some(&record(ObjectStatus::Error, Some(then)))));

        let newer = then + Duration::hours(1);
        let ctx = ctx_with_mtime(SyncOptions::default(), newer);
        assert!(copy_needed(&ctx, Some(&record(ObjectStatus::Verified, Some(then)))));
    }

    #[test]
    fn test_record_without_mtime_never_proves_freshness() {
        let ctx = ctx_with_mtime(SyncOptions::default(), Utc::now());
        assert!(copy_needed(&ctx, Some(&record(ObjectStatus::Transferred, None))));
    }

    #[test]
    fn test_verify_needed_unless_already_verified() {
        let then = Utc::now();
        let options = SyncOptions {
            verify: true,
            ..SyncOptions::default()
        };
        let ctx = ctx_with_mtime(options, then);

        assert!(verify_needed(&ctx, None));
        assert!(verify_needed(&ctx, Some(&record(ObjectStatus::Transferred, Some(then)))));
        assert!(!verify_needed(&ctx, Some(&record(ObjectStatus::Verified, Some(then)))));

        let newer = then + Duration::hours(1);
        let ctx2 = ctx_with_mtime(
            SyncOptions {
                verify: true,
                ..SyncOptions::default()
            },
            newer,
        );
        assert!(verify_needed(&ctx2, Some(&record(ObjectStatus::Verified, Some(then)))));
    }
}
