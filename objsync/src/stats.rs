//! Aggregated counters and rate windows for one sync job

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::perf::PerformanceWindow;

/// Run-scoped aggregate counters plus three sliding rate windows.
///
/// Every counter uses its own internal synchronization; callers never need
/// external locking. Pausing freezes elapsed-time accounting while the
/// counters keep their values; `reset` prepares the object for reuse.
#[derive(Debug)]
pub struct SyncStats {
    job_id: Uuid,
    objects_complete: AtomicU64,
    bytes_complete: AtomicU64,
    objects_skipped: AtomicU64,
    bytes_skipped: AtomicU64,
    objects_copy_skipped: AtomicU64,
    bytes_copy_skipped: AtomicU64,
    objects_failed: AtomicU64,
    complete_rate: PerformanceWindow,
    skip_rate: PerformanceWindow,
    error_rate: PerformanceWindow,
    clock: Mutex<StatsClock>,
    failed_objects: Mutex<Vec<FailedObject>>,
}

#[derive(Debug)]
struct StatsClock {
    started_at: Option<Instant>,
    accumulated: Duration,
    finished: bool,
}

/// Identifier (and optional list-file row) of an object that failed terminally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedObject {
    pub identifier: String,
    pub list_row_num: Option<u64>,
}

/// Serializable point-in-time view of the stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub job_id: Uuid,
    pub objects_complete: u64,
    pub bytes_complete: u64,
    pub objects_skipped: u64,
    pub bytes_skipped: u64,
    pub objects_copy_skipped: u64,
    pub bytes_copy_skipped: u64,
    pub objects_failed: u64,
    pub failed_objects: Vec<FailedObject>,
    pub elapsed: Duration,
    pub complete_rate: f64,
    pub skip_rate: f64,
    pub error_rate: f64,
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStats {
    /// Create stats for a new job
    pub fn new() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            objects_complete: AtomicU64::new(0),
            bytes_complete: AtomicU64::new(0),
            objects_skipped: AtomicU64::new(0),
            bytes_skipped: AtomicU64::new(0),
            objects_copy_skipped: AtomicU64::new(0),
            bytes_copy_skipped: AtomicU64::new(0),
            objects_failed: AtomicU64::new(0),
            complete_rate: PerformanceWindow::default(),
            skip_rate: PerformanceWindow::default(),
            error_rate: PerformanceWindow::default(),
            clock: Mutex::new(StatsClock {
                started_at: None,
                accumulated: Duration::default(),
                finished: false,
            }),
            failed_objects: Mutex::new(Vec::new()),
        }
    }

    /// Job id these stats belong to
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Start (or restart) elapsed-time accounting
    pub fn job_started(&self) {
        let mut clock = self.clock.lock().unwrap();
        clock.started_at = Some(Instant::now());
        clock.finished = false;
    }

    /// Finalize elapsed-time accounting and log the run summary
    pub fn job_complete(&self) {
        {
            let mut clock = self.clock.lock().unwrap();
            if let Some(started) = clock.started_at.take() {
                clock.accumulated += started.elapsed();
            }
            clock.finished = true;
        }
        info!(
            job_id = %self.job_id,
            objects_complete = self.objects_complete(),
            bytes_complete = self.bytes_complete(),
            objects_skipped = self.objects_skipped(),
            objects_failed = self.objects_failed(),
            elapsed_secs = self.elapsed().as_secs_f64(),
            "Sync job finished"
        );
    }

    /// Freeze elapsed-time accounting; returns whether state changed
    pub fn pause(&self) -> bool {
        let mut clock = self.clock.lock().unwrap();
        match clock.started_at.take() {
            Some(started) => {
                clock.accumulated += started.elapsed();
                true
            }
            None => false,
        }
    }

    /// Resume elapsed-time accounting; returns whether state changed
    pub fn resume(&self) -> bool {
        let mut clock = self.clock.lock().unwrap();
        if clock.started_at.is_none() && !clock.finished {
            clock.started_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Wall time spent running (pauses excluded)
    pub fn elapsed(&self) -> Duration {
        let clock = self.clock.lock().unwrap();
        clock.accumulated
            + clock
                .started_at
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }

    /// Clear all counters and windows for reuse
    pub fn reset(&self) {
        self.objects_complete.store(0, Ordering::Relaxed);
        self.bytes_complete.store(0, Ordering::Relaxed);
        self.objects_skipped.store(0, Ordering::Relaxed);
        self.bytes_skipped.store(0, Ordering::Relaxed);
        self.objects_copy_skipped.store(0, Ordering::Relaxed);
        self.bytes_copy_skipped.store(0, Ordering::Relaxed);
        self.objects_failed.store(0, Ordering::Relaxed);
        self.complete_rate.reset();
        self.skip_rate.reset();
        self.error_rate.reset();
        let mut clock = self.clock.lock().unwrap();
        clock.started_at = None;
        clock.accumulated = Duration::default();
        clock.finished = false;
        self.failed_objects.lock().unwrap().clear();
    }

    /// Record a completed object
    pub fn object_complete(&self, bytes: u64) {
        self.objects_complete.fetch_add(1, Ordering::Relaxed);
        self.bytes_complete.fetch_add(bytes, Ordering::Relaxed);
        self.complete_rate.increment(1);
    }

    /// Record a fully skipped object
    pub fn object_skipped(&self, bytes: u64) {
        self.objects_skipped.fetch_add(1, Ordering::Relaxed);
        self.bytes_skipped.fetch_add(bytes, Ordering::Relaxed);
        self.skip_rate.increment(1);
    }

    /// Record a skipped copy phase on an otherwise processed object
    pub fn object_copy_skipped(&self, bytes: u64) {
        self.objects_copy_skipped.fetch_add(1, Ordering::Relaxed);
        self.bytes_copy_skipped.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a terminal failure; the identifier is kept when requested
    pub fn object_failed(&self, identifier: &str, list_row_num: Option<u64>, remember: bool) {
        self.objects_failed.fetch_add(1, Ordering::Relaxed);
        self.error_rate.increment(1);
        if remember {
            self.failed_objects.lock().unwrap().push(FailedObject {
                identifier: identifier.to_string(),
                list_row_num,
            });
        }
    }

    pub fn objects_complete(&self) -> u64 {
        self.objects_complete.load(Ordering::Relaxed)
    }

    pub fn bytes_complete(&self) -> u64 {
        self.bytes_complete.load(Ordering::Relaxed)
    }

    pub fn objects_skipped(&self) -> u64 {
        self.objects_skipped.load(Ordering::Relaxed)
    }

    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped.load(Ordering::Relaxed)
    }

    pub fn objects_copy_skipped(&self) -> u64 {
        self.objects_copy_skipped.load(Ordering::Relaxed)
    }

    pub fn bytes_copy_skipped(&self) -> u64 {
        self.bytes_copy_skipped.load(Ordering::Relaxed)
    }

    pub fn objects_failed(&self) -> u64 {
        self.objects_failed.load(Ordering::Relaxed)
    }

    /// Identifiers recorded by `object_failed` when remembering was requested
    pub fn failed_objects(&self) -> Vec<FailedObject> {
        self.failed_objects.lock().unwrap().clone()
    }

    /// Serializable snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            job_id: self.job_id,
            objects_complete: self.objects_complete(),
            bytes_complete: self.bytes_complete(),
            objects_skipped: self.objects_skipped(),
            bytes_skipped: self.bytes_skipped(),
            objects_copy_skipped: self.objects_copy_skipped(),
            bytes_copy_skipped: self.bytes_copy_skipped(),
            objects_failed: self.objects_failed(),
            failed_objects: self.failed_objects(),
            elapsed: self.elapsed(),
            complete_rate: self.complete_rate.window_rate(),
            skip_rate: self.skip_rate.window_rate(),
            error_rate: self.error_rate.window_rate(),
        }
    }

    /// Human-readable one-line summary
    pub fn summary(&self) -> String {
        format!(
            "{} objects complete ({} bytes), {} skipped, {} copy-skipped, {} failed in {:.2}s",
            self.objects_complete(),
            self.bytes_complete(),
            self.objects_skipped(),
            self.objects_copy_skipped(),
            self.objects_failed(),
            self.elapsed().as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = SyncStats::new();
        stats.object_complete(100);
        stats.object_complete(200);
        stats.object_skipped(50);
        stats.object_copy_skipped(200);
        stats.object_failed("bad", Some(3), true);

        assert_eq!(stats.objects_complete(), 2);
        assert_eq!(stats.bytes_complete(), 300);
        assert_eq!(stats.objects_skipped(), 1);
        assert_eq!(stats.bytes_skipped(), 50);
        assert_eq!(stats.objects_copy_skipped(), 1);
        assert_eq!(stats.objects_failed(), 1);

        let failed = stats.failed_objects();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].identifier, "bad");
        assert_eq!(failed[0].list_row_num, Some(3));
    }

    #[test]
    fn test_failed_not_remembered_when_disabled() {
        let stats = SyncStats::new();
        stats.object_failed("bad", None, false);
        assert_eq!(stats.objects_failed(), 1);
        assert!(stats.failed_objects().is_empty());
    }

    #[test]
    fn test_pause_freezes_elapsed() {
        let stats = SyncStats::new();
        stats.job_started();
        std::thread::sleep(Duration::from_millis(20));
        assert!(stats.pause());
        let frozen = stats.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.elapsed(), frozen);

        assert!(stats.resume());
        std::thread::sleep(Duration::from_millis(10));
        assert!(stats.elapsed() > frozen);

        // pause/resume are idempotent
        assert!(stats.pause());
        assert!(!stats.pause());
        assert!(stats.resume());
        assert!(!stats.resume());
    }

    #[test]
    fn test_reset() {
        let stats = SyncStats::new();
        stats.job_started();
        stats.object_complete(10);
        stats.object_failed("x", None, true);
        stats.reset();
        assert_eq!(stats.objects_complete(), 0);
        assert_eq!(stats.objects_failed(), 0);
        assert!(stats.failed_objects().is_empty());
        assert_eq!(stats.elapsed(), Duration::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = SyncStats::new();
        stats.object_complete(5);
        let snapshot = stats.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.objects_complete, 1);
        assert_eq!(parsed.bytes_complete, 5);
    }
}
