//! Storage plugin contract and built-in backends.
//!
//! A storage implementation covers one end of a sync: it enumerates objects,
//! loads and stores their content, and resolves target identifiers from
//! relative paths. The engine itself is storage-agnostic; anything that can
//! implement [`Storage`] can be a source or a target.

mod filesystem;
mod memory;

pub use self::filesystem::FilesystemStorage;
pub use self::memory::MemoryStorage;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{ObjectSummary, SyncObject};
use crate::options::SyncOptions;

/// Lazy, finite, non-restartable listing of objects
pub type SummaryStream = BoxStream<'static, Result<ObjectSummary>>;

/// Names of the plugins assembled into one job, passed to `configure` so a
/// plugin can validate its position in the pipeline
#[derive(Debug, Clone)]
pub struct AssemblyInfo {
    pub source: String,
    pub filters: Vec<String>,
    pub target: String,
}

/// Unified interface for storage backends.
///
/// All content operations are asynchronous; enumeration is exposed as
/// streams so crawling large namespaces never materializes a full listing.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Plugin name, used in configuration errors and logs
    fn name(&self) -> &str;

    /// Validate configuration before any work starts; an error here aborts
    /// the whole run
    async fn configure(&self, assembly: &AssemblyInfo) -> Result<()> {
        let _ = assembly;
        Ok(())
    }

    /// Enumerate the top level of the storage
    fn all_objects(&self) -> SummaryStream;

    /// Enumerate the direct children of a directory entry
    fn children(&self, parent: &ObjectSummary) -> SummaryStream;

    /// Build a listing entry from one source-list line
    async fn parse_list_line(&self, line: &str) -> Result<ObjectSummary>;

    /// Load the full object for an identifier; `ObjectNotFound` when absent
    async fn load_object(&self, identifier: &str) -> Result<SyncObject>;

    /// Store a new object; returns the identifier it was stored under
    async fn create_object(&self, object: &SyncObject) -> Result<String>;

    /// Overwrite an existing object
    async fn update_object(&self, identifier: &str, object: &SyncObject) -> Result<()>;

    /// Map a relative path to this storage's identifier form
    fn get_identifier(&self, relative_path: &str, is_directory: bool) -> String;

    /// Remove an object
    async fn delete(&self, identifier: &str) -> Result<()>;

    /// Release any underlying resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Hook fired when run options change mid-job (e.g. a live thread-count
    /// change)
    fn notify_options_changed(&self, options: &SyncOptions) {
        let _ = options;
    }
}
