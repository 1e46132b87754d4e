//! Run-level configuration for a sync job

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Options for one sync job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Worker count for the sync/query/estimate pools
    pub thread_count: usize,
    /// How many times a retriable failure is re-queued before it is terminal
    pub retry_attempts: u32,
    /// Recurse into directories discovered during the crawl
    pub recursive: bool,
    /// Copy every object even when the ledger says it is up to date
    pub force_sync: bool,
    /// Verify target content after copying
    pub verify: bool,
    /// Skip the copy phase entirely and only verify existing targets
    pub verify_only: bool,
    /// Delete each source object after it has been synced
    pub delete_source: bool,
    /// Keep the identifiers (and list row numbers) of failed objects in stats
    pub remember_failed: bool,
    /// SQLite file backing the status ledger
    pub db_file: Option<String>,
    /// Database URL backing the status ledger (e.g. mysql://...)
    pub db_connect_string: Option<String>,
    /// Table name for the status ledger
    pub db_table: Option<String>,
    /// Literal list of source identifiers to sync instead of crawling
    pub source_list: Option<Vec<String>>,
    /// File containing one source identifier per line (see `list_file`)
    pub source_list_file: Option<String>,
    /// Treat each list-file line verbatim: no comments, escapes or trimming
    pub source_list_raw_values: bool,
    /// Bandwidth cap in bytes per second (0 = unlimited)
    pub bandwidth_limit: u64,
    /// Throughput cap in objects per second (0 = unlimited)
    pub throughput_limit: u64,
    /// Trust a checksum recorded in object metadata instead of hashing bytes
    pub use_metadata_checksum: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            thread_count: 16,
            retry_attempts: 2,
            recursive: true,
            force_sync: false,
            verify: false,
            verify_only: false,
            delete_source: false,
            remember_failed: false,
            db_file: None,
            db_connect_string: None,
            db_table: None,
            source_list: None,
            source_list_file: None,
            source_list_raw_values: false,
            bandwidth_limit: 0,
            throughput_limit: 0,
            use_metadata_checksum: false,
        }
    }
}

impl SyncOptions {
    /// Validate option combinations before a job is assembled
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(SyncError::config("options", "thread_count must be at least 1"));
        }
        if self.source_list.is_some() && self.source_list_file.is_some() {
            return Err(SyncError::config(
                "options",
                "source_list and source_list_file are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Whether this run performs the copy phase at all
    pub fn copy_requested(&self) -> bool {
        !self.verify_only
    }

    /// Whether this run performs the verification phase
    pub fn verify_requested(&self) -> bool {
        self.verify || self.verify_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.thread_count, 16);
        assert_eq!(options.retry_attempts, 2);
        assert!(options.recursive);
        assert!(options.copy_requested());
        assert!(!options.verify_requested());
        options.validate().unwrap();
    }

    #[test]
    fn test_verify_only_implies_verify() {
        let options = SyncOptions {
            verify_only: true,
            ..Default::default()
        };
        assert!(options.verify_requested());
        assert!(!options.copy_requested());
    }

    #[test]
    fn test_invalid_combinations() {
        let options = SyncOptions {
            thread_count: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = SyncOptions {
            source_list: Some(vec!["a".to_string()]),
            source_list_file: Some("list.txt".to_string()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let options = SyncOptions {
            verify: true,
            bandwidth_limit: 1024,
            db_file: Some("ledger.db".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let parsed: SyncOptions = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify);
        assert_eq!(parsed.bandwidth_limit, 1024);
        assert_eq!(parsed.db_file.as_deref(), Some("ledger.db"));
    }
}
