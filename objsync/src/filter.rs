//! Filter plugin contract and the chain that runs objects through them

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ObjectContext, SyncObject};
use crate::options::SyncOptions;
use crate::storage::AssemblyInfo;
use crate::target_filter::TargetFilter;

/// A transformation stage between source and target.
///
/// Filters see every object on its way to the target and may rewrite its
/// content, metadata or relative path. `reverse_filter` must undo the
/// transformation so verification can compare against the original source
/// bytes; the default passes the object through unchanged.
#[async_trait]
pub trait SyncFilter: Send + Sync {
    /// Plugin name, used in configuration errors and logs
    fn name(&self) -> &str;

    /// Validate configuration before any work starts
    async fn configure(&self, assembly: &AssemblyInfo) -> Result<()> {
        let _ = assembly;
        Ok(())
    }

    /// Transform an object on its way to the target
    async fn filter(&self, object: SyncObject, ctx: &ObjectContext) -> Result<SyncObject>;

    /// Undo the transformation on an object read back from the target
    async fn reverse_filter(&self, object: SyncObject, ctx: &ObjectContext) -> Result<SyncObject> {
        let _ = ctx;
        Ok(object)
    }

    /// Release any underlying resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Hook fired when run options change mid-job
    fn notify_options_changed(&self, options: &SyncOptions) {
        let _ = options;
    }
}

/// Ordered filter stages ending in the target writer.
///
/// `send` folds the object forward through every stage and stores the result;
/// `load_back` reads the stored object and folds it backward through the
/// stages in reverse order. The source object held in the context is never
/// replaced by filter output, so verification always compares against the
/// original bytes.
pub struct FilterChain {
    filters: Vec<Arc<dyn SyncFilter>>,
    target: TargetFilter,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn SyncFilter>>, target: TargetFilter) -> Self {
        Self { filters, target }
    }

    /// Names of the filter stages, in order
    pub fn filter_names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    /// The target writer at the end of the chain
    pub fn target(&self) -> &TargetFilter {
        &self.target
    }

    /// Run the context's loaded object through all stages and store it
    pub async fn send(&self, ctx: &mut ObjectContext) -> Result<()> {
        let mut object = ctx
            .object
            .clone()
            .ok_or_else(|| crate::error::SyncError::not_found(ctx.identifier()))?;
        for filter in &self.filters {
            object = filter.filter(object, ctx).await?;
        }
        self.target.store(ctx, object).await
    }

    /// Load the stored object back and undo all stages in reverse order
    pub async fn load_back(&self, ctx: &mut ObjectContext) -> Result<SyncObject> {
        let mut object = self.target.load(ctx).await?;
        for filter in self.filters.iter().rev() {
            object = filter.reverse_filter(object, ctx).await?;
        }
        Ok(object)
    }

    /// Configure every stage; the first failure aborts
    pub async fn configure(&self, assembly: &AssemblyInfo) -> Result<()> {
        for filter in &self.filters {
            filter.configure(assembly).await?;
        }
        Ok(())
    }

    /// Close every stage; errors are collected by the caller per stage
    pub async fn close_filters(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            results.push((filter.name().to_string(), filter.close().await));
        }
        results
    }

    /// Fan an options change out to every stage
    pub fn notify_options_changed(&self, options: &SyncOptions) {
        for filter in &self.filters {
            filter.notify_options_changed(options);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectMetadata, ObjectSummary};
    use crate::storage::{MemoryStorage, Storage};
    use bytes::Bytes;
    use chrono::Utc;

    /// XORs every byte with a key; reversing applies the same XOR again
    struct XorFilter {
        key: u8,
    }

    #[async_trait]
    impl SyncFilter for XorFilter {
        fn name(&self) -> &str {
            "xor"
        }

        async fn filter(&self, mut object: SyncObject, _ctx: &ObjectContext) -> Result<SyncObject> {
            let data: Vec<u8> = object.data.iter().map(|b| b ^ self.key).collect();
            object.data = Bytes::from(data);
            Ok(object)
        }

        async fn reverse_filter(
            &self,
            object: SyncObject,
            ctx: &ObjectContext,
        ) -> Result<SyncObject> {
            self.filter(object, ctx).await
        }
    }

    fn context_with(data: &'static [u8]) -> ObjectContext {
        let options = Arc::new(crate::options::SyncOptions::default());
        let mut ctx = ObjectContext::new(ObjectSummary::file("f", data.len() as u64), options);
        ctx.object = Some(SyncObject::new(
            "f",
            ObjectMetadata::file(data.len() as u64, Some(Utc::now())),
            Bytes::from_static(data),
        ));
        ctx
    }

    #[tokio::test]
    async fn test_send_applies_stages_in_order_and_load_back_undoes_them() {
        let target = Arc::new(MemoryStorage::new());
        let chain = FilterChain::new(
            vec![Arc::new(XorFilter { key: 0x55 }), Arc::new(XorFilter { key: 0x0f })],
            TargetFilter::new(target.clone()),
        );

        let mut ctx = context_with(b"hello");
        chain.send(&mut ctx).await.unwrap();

        // Target holds the transformed bytes, not the source bytes
        let stored = target.data("f").unwrap();
        let expected: Vec<u8> = b"hello".iter().map(|b| b ^ 0x55 ^ 0x0f).collect();
        assert_eq!(&stored[..], &expected[..]);

        // The context still holds the original source object
        assert_eq!(&ctx.object.as_ref().unwrap().data[..], b"hello");

        let restored = chain.load_back(&mut ctx).await.unwrap();
        assert_eq!(&restored.data[..], b"hello");
        assert!(ctx.target_mtime.is_some());
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let target = Arc::new(MemoryStorage::new());
        let chain = FilterChain::new(vec![], TargetFilter::new(target.clone()));

        let mut ctx = context_with(b"plain");
        chain.send(&mut ctx).await.unwrap();
        assert_eq!(&target.data("f").unwrap()[..], b"plain");
        assert_eq!(ctx.target_id.as_deref(), Some("f"));
    }

    #[tokio::test]
    async fn test_filter_error_stops_before_target() {
        struct FailFilter;

        #[async_trait]
        impl SyncFilter for FailFilter {
            fn name(&self) -> &str {
                "fail"
            }

            async fn filter(
                &self,
                _object: SyncObject,
                _ctx: &ObjectContext,
            ) -> Result<SyncObject> {
                Err(crate::error::SyncError::non_retriable("corrupt input"))
            }
        }

        let target = Arc::new(MemoryStorage::new());
        let chain = FilterChain::new(vec![Arc::new(FailFilter)], TargetFilter::new(target.clone()));

        let mut ctx = context_with(b"data");
        let err = chain.send(&mut ctx).await.unwrap_err();
        assert!(!err.is_retriable());
        assert!(target.is_empty());
    }
}
