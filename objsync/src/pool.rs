//! Bounded worker pool with blocking submission, pause/resume and graceful
//! resize

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// A unit of work accepted by a [`WorkerPool`]
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Box a future into a [`Job`]
pub fn job<F>(future: F) -> Job
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(future)
}

/// Fixed-identity worker pool over a double-ended work queue.
///
/// Submission is non-blocking and rejects when the (optional) queue capacity
/// is reached; `blocking_submit` instead back-pressures the submitting task.
/// Workers can be paused before they dequeue their next job, and the pool can
/// be resized live without losing or duplicating queued work: surplus workers
/// take a termination permit, push their about-to-run job back to the head of
/// the queue, and exit their loop.
///
/// Cloning the handle shares the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    state: Mutex<PoolState>,
    /// Wakes workers when work arrives, pause state changes or permits appear
    work_available: Notify,
    /// Wakes blocked submitters when a job finishes or the pool stops
    slot_available: Notify,
    active: AtomicUsize,
    unfinished: AtomicUsize,
}

struct PoolState {
    queue: VecDeque<Job>,
    capacity: Option<usize>,
    paused: bool,
    shut_down: bool,
    /// Live worker loops, including those that will take a permit
    workers: usize,
    /// Outstanding self-termination permits from a shrink
    termination_permits: usize,
}

impl WorkerPool {
    /// Create a pool with `size` workers and an optional queue capacity
    pub fn new(name: impl Into<String>, size: usize, capacity: Option<usize>) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    capacity,
                    paused: false,
                    shut_down: false,
                    workers: 0,
                    termination_permits: 0,
                }),
                work_available: Notify::new(),
                slot_available: Notify::new(),
                active: AtomicUsize::new(0),
                unfinished: AtomicUsize::new(0),
            }),
        };
        {
            let mut state = pool.inner.state.lock().unwrap();
            state.workers = size;
        }
        for _ in 0..size {
            tokio::spawn(worker_loop(pool.inner.clone()));
        }
        pool
    }

    /// Pool name, used in errors and logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submit without blocking; errors when the queue is full or the pool is
    /// shut down
    pub fn submit(&self, job: Job) -> Result<()> {
        self.try_submit(job).map_err(|(_, err)| err)
    }

    /// Submit, waiting for queue capacity when necessary.
    ///
    /// Blocks the *submitting* task, never a worker; woken whenever any task
    /// finishes. Errors if the pool shuts down before the job is accepted.
    pub async fn blocking_submit(&self, mut pending: Job) -> Result<()> {
        loop {
            let mut notified = std::pin::pin!(self.inner.slot_available.notified());
            // Register with the Notify before the submission attempt, so a
            // notify_waiters firing between a QueueFull and the await (a
            // concurrent stop(), say) is stored instead of lost
            notified.as_mut().enable();
            match self.try_submit(pending) {
                Ok(()) => return Ok(()),
                Err((job, SyncError::QueueFull { .. })) => {
                    pending = job;
                    notified.await;
                }
                Err((_, err)) => return Err(err),
            }
        }
    }

    fn try_submit(&self, job: Job) -> std::result::Result<(), (Job, SyncError)> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            return Err((
                job,
                SyncError::PoolShutDown {
                    pool: self.inner.name.clone(),
                },
            ));
        }
        if let Some(capacity) = state.capacity {
            if state.queue.len() >= capacity {
                return Err((
                    job,
                    SyncError::QueueFull {
                        pool: self.inner.name.clone(),
                    },
                ));
            }
        }
        self.inner.unfinished.fetch_add(1, Ordering::SeqCst);
        state.queue.push_back(job);
        drop(state);
        self.inner.work_available.notify_one();
        Ok(())
    }

    /// Stop workers from dequeuing further jobs; running jobs finish.
    /// Returns whether the state changed. Errors after shutdown.
    pub fn pause(&self) -> Result<bool> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            return Err(SyncError::PoolShutDown {
                pool: self.inner.name.clone(),
            });
        }
        if state.paused {
            Ok(false)
        } else {
            state.paused = true;
            Ok(true)
        }
    }

    /// Let paused workers dequeue again; returns whether the state changed.
    /// Errors after shutdown.
    pub fn resume(&self) -> Result<bool> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            return Err(SyncError::PoolShutDown {
                pool: self.inner.name.clone(),
            });
        }
        if state.paused {
            state.paused = false;
            drop(state);
            self.inner.work_available.notify_waiters();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Resize the pool to `size` workers.
    ///
    /// Growing spawns additional workers (cancelling pending termination
    /// permits first). Shrinking issues exactly the surplus number of
    /// permits; each is honored by one worker before it starts its next job.
    pub fn resize(&self, size: usize) -> Result<()> {
        let to_spawn = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                return Err(SyncError::PoolShutDown {
                    pool: self.inner.name.clone(),
                });
            }
            let effective = state.workers - state.termination_permits;
            if size >= effective {
                let mut deficit = size - effective;
                let cancelled = deficit.min(state.termination_permits);
                state.termination_permits -= cancelled;
                deficit -= cancelled;
                state.workers += deficit;
                deficit
            } else {
                state.termination_permits += effective - size;
                0
            }
        };
        for _ in 0..to_spawn {
            tokio::spawn(worker_loop(self.inner.clone()));
        }
        // Idle workers must observe new permits
        self.inner.work_available.notify_waiters();
        debug!(pool = %self.inner.name, size, "pool resized");
        Ok(())
    }

    /// Shut down immediately, discarding queued-but-unstarted jobs and waking
    /// paused workers and blocked submitters
    pub fn stop(&self) {
        let discarded = {
            let mut state = self.inner.state.lock().unwrap();
            state.shut_down = true;
            state.paused = false;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        if discarded > 0 {
            self.inner.unfinished.fetch_sub(discarded, Ordering::SeqCst);
            debug!(pool = %self.inner.name, discarded, "discarded queued jobs on stop");
        }
        self.inner.work_available.notify_waiters();
        self.inner.slot_available.notify_waiters();
    }

    /// Whether `stop` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().unwrap().shut_down
    }

    /// Exact number of jobs currently executing
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Exact number of submitted jobs not yet finished (queued + active)
    pub fn unfinished_tasks(&self) -> usize {
        self.inner.unfinished.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let mut notified = std::pin::pin!(inner.work_available.notified());
        // Registered before the state check, so a resume() or stop() landing
        // after the lock is released still wakes this worker
        notified.as_mut().enable();
        let job = {
            let mut state = inner.state.lock().unwrap();
            if state.shut_down {
                state.workers -= 1;
                return;
            }
            if state.paused {
                None
            } else {
                let job = state.queue.pop_front();
                if state.termination_permits > 0 {
                    // Honor a shrink: put the about-to-run job back at the
                    // head of the queue and exit this worker's loop
                    state.termination_permits -= 1;
                    state.workers -= 1;
                    let requeued = job.is_some();
                    if let Some(job) = job {
                        state.queue.push_front(job);
                    }
                    drop(state);
                    if requeued {
                        inner.work_available.notify_one();
                    }
                    return;
                }
                job
            }
        };
        match job {
            Some(job) => {
                inner.active.fetch_add(1, Ordering::SeqCst);
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    warn!(pool = %inner.name, "worker task panicked");
                }
                inner.active.fetch_sub(1, Ordering::SeqCst);
                inner.unfinished.fetch_sub(1, Ordering::SeqCst);
                inner.slot_available.notify_waiters();
                // Keep siblings moving in case a submission notify was missed
                if !inner.state.lock().unwrap().queue.is_empty() {
                    inner.work_available.notify_one();
                }
            }
            None => notified.await,
        }
    }
}
