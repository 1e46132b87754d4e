//! Object Migration Engine
//!
//! A pluggable async engine for migrating and synchronizing object trees
//! between storage systems, providing:
//! - Storage and filter plugin contracts with a built-in filesystem backend
//! - A persistent per-identifier status ledger for idempotent re-runs
//! - Bounded worker pools with pause/resume, live resize and hard stop
//! - Retry handling with a configurable attempt budget
//! - Post-copy md5 verification
//! - Bandwidth and throughput throttles shareable across jobs
//! - Progress estimation and run statistics

pub mod control;
pub mod db;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod filter;
pub mod list_file;
pub mod model;
pub mod options;
pub mod perf;
pub mod pool;
pub mod stats;
pub mod storage;
pub mod target_filter;
pub mod throttle;
pub mod verifier;

mod task;

// Re-export main types and functions
pub use control::SyncControl;
pub use db::{DbService, MemoryDbService, NoDbService, SqlDbService, SyncRecord, DEFAULT_TABLE};
pub use engine::{run_sync, SyncJob};
pub use error::{Result, SyncError};
pub use estimate::{EstimateSnapshot, SyncEstimate};
pub use filter::{FilterChain, SyncFilter};
pub use model::{ObjectContext, ObjectMetadata, ObjectStatus, ObjectSummary, SyncObject};
pub use options::SyncOptions;
pub use perf::PerformanceWindow;
pub use pool::WorkerPool;
pub use stats::{FailedObject, StatsSnapshot, SyncStats};
pub use storage::{AssemblyInfo, FilesystemStorage, MemoryStorage, Storage, SummaryStream};
pub use target_filter::TargetFilter;
pub use throttle::Throttle;
pub use verifier::Md5Verifier;
