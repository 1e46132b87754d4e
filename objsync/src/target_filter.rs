//! Terminal chain stage: resolves target identifiers and writes objects

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{ObjectContext, SyncObject};
use crate::storage::Storage;

/// Writer at the end of the filter chain.
///
/// Resolves and caches the target identifier on the context, decides
/// between create, update and skip, and reads objects back for
/// verification.
pub struct TargetFilter {
    target: Arc<dyn Storage>,
}

impl TargetFilter {
    pub fn new(target: Arc<dyn Storage>) -> Self {
        Self { target }
    }

    /// The storage this filter writes to
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.target
    }

    fn resolve_id(&self, ctx: &mut ObjectContext, relative_path: &str, is_directory: bool) -> String {
        if let Some(id) = &ctx.target_id {
            return id.clone();
        }
        let id = self.target.get_identifier(relative_path, is_directory);
        ctx.target_id = Some(id.clone());
        id
    }

    /// Store the (possibly filtered) object in the target.
    ///
    /// Directories are always written so their metadata stays current. A
    /// file is skipped only when the target already matches: same size, not
    /// older than the source, no forced sync, and this is not a retry
    /// attempt. Skips surface as `SkipObject` so the caller can count them.
    pub async fn store(&self, ctx: &mut ObjectContext, object: SyncObject) -> Result<()> {
        let id = self.resolve_id(ctx, &object.relative_path, object.is_directory());
        match self.target.load_object(&id).await {
            Ok(existing) => {
                if !object.is_directory() && self.up_to_date(ctx, &object, &existing) {
                    debug!(identifier = %ctx.identifier(), "target already up to date");
                    return Err(SyncError::skip("target is up to date"));
                }
                self.target.update_object(&id, &object).await
            }
            Err(SyncError::ObjectNotFound { .. }) => {
                let stored_id = self.target.create_object(&object).await?;
                ctx.target_id = Some(stored_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Load the stored object back for verification, capturing its mtime on
    /// the context
    pub async fn load(&self, ctx: &mut ObjectContext) -> Result<SyncObject> {
        let (relative_path, is_directory) = match &ctx.object {
            Some(object) => (object.relative_path.clone(), object.is_directory()),
            None => (ctx.summary.identifier.clone(), ctx.summary.is_directory),
        };
        let id = self.resolve_id(ctx, &relative_path, is_directory);
        let object = self.target.load_object(&id).await?;
        ctx.target_mtime = object.metadata.mtime;
        Ok(object)
    }

    fn up_to_date(&self, ctx: &ObjectContext, object: &SyncObject, existing: &SyncObject) -> bool {
        if ctx.options.force_sync || ctx.failures > 0 {
            return false;
        }
        if existing.metadata.size != object.metadata.size {
            return false;
        }
        match (object.metadata.ctime_or_mtime(), existing.metadata.mtime) {
            (Some(source), Some(target)) => source <= target,
            // Without both timestamps there is no basis to skip
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectMetadata, ObjectSummary};
    use crate::options::SyncOptions;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;
    use chrono::{Duration, Utc};

    fn file_ctx(identifier: &str, data: &'static [u8], options: SyncOptions) -> ObjectContext {
        let mut ctx = ObjectContext::new(
            ObjectSummary::file(identifier, data.len() as u64),
            Arc::new(options),
        );
        ctx.object = Some(SyncObject::new(
            identifier,
            ObjectMetadata::file(data.len() as u64, Some(Utc::now())),
            Bytes::from_static(data),
        ));
        ctx
    }

    #[tokio::test]
    async fn test_create_then_skip_then_update_when_newer() {
        let storage = Arc::new(MemoryStorage::new());
        let filter = TargetFilter::new(storage.clone());

        let mut ctx = file_ctx("f", b"v1", SyncOptions::default());
        let object = ctx.object.clone().unwrap();
        filter.store(&mut ctx, object.clone()).await.unwrap();
        assert_eq!(storage.create_count("f"), 1);

        // Unchanged object is skipped on the second pass
        let mut ctx2 = file_ctx("f", b"v1", SyncOptions::default());
        ctx2.object = Some(object.clone());
        let err = filter.store(&mut ctx2, object.clone()).await.unwrap_err();
        assert!(matches!(err, SyncError::SkipObject { .. }));
        assert_eq!(storage.update_count("f"), 0);

        // A newer source mtime forces the update
        let mut newer = object.clone();
        newer.metadata.mtime = Some(Utc::now() + Duration::hours(1));
        let mut ctx3 = file_ctx("f", b"v1", SyncOptions::default());
        filter.store(&mut ctx3, newer).await.unwrap();
        assert_eq!(storage.update_count("f"), 1);
    }

    #[tokio::test]
    async fn test_force_sync_and_retry_never_skip() {
        let storage = Arc::new(MemoryStorage::new());
        let filter = TargetFilter::new(storage.clone());

        let mut ctx = file_ctx("f", b"data", SyncOptions::default());
        let object = ctx.object.clone().unwrap();
        filter.store(&mut ctx, object.clone()).await.unwrap();

        let forced = SyncOptions {
            force_sync: true,
            ..SyncOptions::default()
        };
        let mut ctx2 = file_ctx("f", b"data", forced);
        filter.store(&mut ctx2, object.clone()).await.unwrap();
        assert_eq!(storage.update_count("f"), 1);

        let mut ctx3 = file_ctx("f", b"data", SyncOptions::default());
        ctx3.failures = 1;
        filter.store(&mut ctx3, object).await.unwrap();
        assert_eq!(storage.update_count("f"), 2);
    }

    #[tokio::test]
    async fn test_directories_always_written() {
        let storage = Arc::new(MemoryStorage::new());
        let filter = TargetFilter::new(storage.clone());

        let dir = SyncObject::new(
            "d",
            ObjectMetadata::directory(Some(Utc::now())),
            Bytes::new(),
        );
        let options = Arc::new(SyncOptions::default());
        let mut ctx = ObjectContext::new(ObjectSummary::directory("d"), options.clone());
        ctx.object = Some(dir.clone());
        filter.store(&mut ctx, dir.clone()).await.unwrap();

        let mut ctx2 = ObjectContext::new(ObjectSummary::directory("d"), options);
        ctx2.object = Some(dir.clone());
        filter.store(&mut ctx2, dir).await.unwrap();
        assert_eq!(storage.update_count("d"), 1);
    }

    #[tokio::test]
    async fn test_load_resolves_id_without_prior_store() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put_file("f", "stored");
        let filter = TargetFilter::new(storage);

        let options = Arc::new(SyncOptions::default());
        let mut ctx = ObjectContext::new(ObjectSummary::file("f", 6), options);
        let object = filter.load(&mut ctx).await.unwrap();
        assert_eq!(&object.data[..], b"stored");
        assert_eq!(ctx.target_id.as_deref(), Some("f"));
        assert!(ctx.target_mtime.is_some());
    }
}
