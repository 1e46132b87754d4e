//! Core data model: listing entries, loaded objects, and per-object work state

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::options::SyncOptions;

/// Lightweight listing entry produced by storage crawl/list operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Storage identifier of the object
    pub identifier: String,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Size in bytes as reported by the listing
    pub size: u64,
    /// Row number when the entry came from a source list file
    pub list_row_num: Option<u64>,
}

impl ObjectSummary {
    /// Create a summary for a data object
    pub fn file(identifier: impl Into<String>, size: u64) -> Self {
        Self {
            identifier: identifier.into(),
            is_directory: false,
            size,
            list_row_num: None,
        }
    }

    /// Create a summary for a directory
    pub fn directory(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            is_directory: true,
            size: 0,
            list_row_num: None,
        }
    }
}

/// Metadata attached to a loaded object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Content length in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: Option<DateTime<Utc>>,
    /// Metadata-change time; falls back to mtime when the storage has none
    pub ctime: Option<DateTime<Utc>>,
    /// Checksum recorded by the source system (hex md5), if any
    pub checksum: Option<String>,
    /// Whether the object is a directory
    pub is_directory: bool,
}

impl ObjectMetadata {
    /// Metadata for a data object of the given size
    pub fn file(size: u64, mtime: Option<DateTime<Utc>>) -> Self {
        Self {
            size,
            mtime,
            ctime: None,
            checksum: None,
            is_directory: false,
        }
    }

    /// Metadata for a directory
    pub fn directory(mtime: Option<DateTime<Utc>>) -> Self {
        Self {
            size: 0,
            mtime,
            ctime: None,
            checksum: None,
            is_directory: true,
        }
    }

    /// Metadata-change time, falling back to mtime when absent
    pub fn ctime_or_mtime(&self) -> Option<DateTime<Utc>> {
        self.ctime.or(self.mtime)
    }
}

/// A fully loaded object moving through the filter chain
#[derive(Debug, Clone)]
pub struct SyncObject {
    /// Path relative to the storage root; target identifiers derive from it
    pub relative_path: String,
    /// Object metadata
    pub metadata: ObjectMetadata,
    /// Object payload (empty for directories)
    pub data: Bytes,
}

impl SyncObject {
    /// Create an object from its parts
    pub fn new(relative_path: impl Into<String>, metadata: ObjectMetadata, data: Bytes) -> Self {
        Self {
            relative_path: relative_path.into(),
            metadata,
            data,
        }
    }

    /// Whether the object is a directory
    pub fn is_directory(&self) -> bool {
        self.metadata.is_directory
    }
}

/// Per-object state machine.
///
/// Only forward transitions are valid. `Error` is terminal; `Transferred`
/// (without verification) and `Verified` are terminal for a given attempt.
/// `RetryQueue` is a side-state entered on failure-pending-retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    Queue,
    InTransfer,
    Transferred,
    InVerification,
    Verified,
    RetryQueue,
    Error,
}

impl ObjectStatus {
    /// Whether this status represents a successfully processed object
    pub fn is_success(self) -> bool {
        matches!(self, Self::Transferred | Self::Verified)
    }

    /// Stable string form used by the ledger
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "Queue",
            Self::InTransfer => "InTransfer",
            Self::Transferred => "Transferred",
            Self::InVerification => "InVerification",
            Self::Verified => "Verified",
            Self::RetryQueue => "RetryQueue",
            Self::Error => "Error",
        }
    }

    /// Parse the ledger string form; unknown values map to `Queue`
    pub fn parse(value: &str) -> Self {
        match value {
            "InTransfer" => Self::InTransfer,
            "Transferred" => Self::Transferred,
            "InVerification" => Self::InVerification,
            "Verified" => Self::Verified,
            "RetryQueue" => Self::RetryQueue,
            "Error" => Self::Error,
            _ => Self::Queue,
        }
    }
}

impl std::fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work: one object's state carried through one sync attempt.
///
/// A context is owned by exactly one task at a time, serialized through the
/// ledger's per-identifier lock, and re-used across retry attempts with the
/// failure count incremented.
#[derive(Debug, Clone)]
pub struct ObjectContext {
    /// Listing entry the context was built from
    pub summary: ObjectSummary,
    /// Lazily loaded source object
    pub object: Option<SyncObject>,
    /// Resolved target identifier, cached after first resolution
    pub target_id: Option<String>,
    /// Target mtime captured during the verification read, if any
    pub target_mtime: Option<DateTime<Utc>>,
    /// Hex md5 of the target captured during verification, if any
    pub target_md5: Option<String>,
    /// Number of failed attempts so far
    pub failures: u32,
    /// Current state-machine position
    pub status: ObjectStatus,
    /// Run-wide options
    pub options: Arc<SyncOptions>,
}

impl ObjectContext {
    /// Create a fresh context for a discovered object
    pub fn new(summary: ObjectSummary, options: Arc<SyncOptions>) -> Self {
        Self {
            summary,
            object: None,
            target_id: None,
            target_mtime: None,
            target_md5: None,
            failures: 0,
            status: ObjectStatus::Queue,
            options,
        }
    }

    /// Source identifier of the object
    pub fn identifier(&self) -> &str {
        &self.summary.identifier
    }

    /// Best known size: loaded metadata if present, listing size otherwise
    pub fn size(&self) -> u64 {
        self.object
            .as_ref()
            .map(|o| o.metadata.size)
            .unwrap_or(self.summary.size)
    }

    /// Source mtime from the loaded object, if loaded
    pub fn source_mtime(&self) -> Option<DateTime<Utc>> {
        self.object.as_ref().and_then(|o| o.metadata.mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_success() {
        assert!(ObjectStatus::Transferred.is_success());
        assert!(ObjectStatus::Verified.is_success());
        assert!(!ObjectStatus::Queue.is_success());
        assert!(!ObjectStatus::InTransfer.is_success());
        assert!(!ObjectStatus::RetryQueue.is_success());
        assert!(!ObjectStatus::Error.is_success());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ObjectStatus::Queue,
            ObjectStatus::InTransfer,
            ObjectStatus::Transferred,
            ObjectStatus::InVerification,
            ObjectStatus::Verified,
            ObjectStatus::RetryQueue,
            ObjectStatus::Error,
        ] {
            assert_eq!(ObjectStatus::parse(status.as_str()), status);
        }
        assert_eq!(ObjectStatus::parse("garbage"), ObjectStatus::Queue);
    }

    #[test]
    fn test_context_size_prefers_loaded_metadata() {
        let options = Arc::new(SyncOptions::default());
        let mut ctx = ObjectContext::new(ObjectSummary::file("a", 10), options);
        assert_eq!(ctx.size(), 10);

        ctx.object = Some(SyncObject::new(
            "a",
            ObjectMetadata::file(42, None),
            Bytes::from_static(b"x"),
        ));
        assert_eq!(ctx.size(), 42);
    }

    #[test]
    fn test_ctime_falls_back_to_mtime() {
        let mtime = Utc::now();
        let meta = ObjectMetadata::file(1, Some(mtime));
        assert_eq!(meta.ctime_or_mtime(), Some(mtime));
    }
}
