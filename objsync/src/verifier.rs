//! Post-copy content verification

use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::SyncObject;

/// Compares source and target content by md5.
///
/// With `use_metadata_checksum` set, a checksum recorded in the source
/// metadata is trusted instead of re-hashing the source bytes; the target
/// is always hashed from the bytes actually read back.
pub struct Md5Verifier {
    use_metadata_checksum: bool,
}

impl Md5Verifier {
    pub fn new(use_metadata_checksum: bool) -> Self {
        Self {
            use_metadata_checksum,
        }
    }

    /// Verify that `target` matches `source`.
    ///
    /// Returns the target's hex md5 for the ledger, `None` for directories.
    /// A file/directory kind mismatch is permanent: no retry can fix it.
    pub async fn verify(&self, source: &SyncObject, target: &SyncObject) -> Result<Option<String>> {
        if source.is_directory() != target.is_directory() {
            return Err(SyncError::non_retriable(format!(
                "kind mismatch for '{}': source is a {}, target is a {}",
                source.relative_path,
                kind(source),
                kind(target),
            )));
        }
        if source.is_directory() {
            return Ok(None);
        }

        let target_hash = md5_hex(target.data.clone());
        let source_md5 = match (self.use_metadata_checksum, &source.metadata.checksum) {
            (true, Some(checksum)) => {
                debug!(
                    identifier = %source.relative_path,
                    "trusting metadata checksum for source"
                );
                checksum.to_ascii_lowercase()
            }
            _ => {
                let source_hash = md5_hex(source.data.clone());
                let (source_md5, target_md5) = tokio::try_join!(source_hash, target_hash)?;
                return self.compare(source, source_md5, target_md5);
            }
        };
        let target_md5 = target_hash.await?;
        self.compare(source, source_md5, target_md5)
    }

    fn compare(
        &self,
        source: &SyncObject,
        source_md5: String,
        target_md5: String,
    ) -> Result<Option<String>> {
        if source_md5 != target_md5 {
            return Err(SyncError::verification(format!(
                "md5 mismatch for '{}': source {source_md5}, target {target_md5}",
                source.relative_path,
            )));
        }
        Ok(Some(target_md5))
    }
}

async fn md5_hex(data: Bytes) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut hasher = Md5::new();
        hasher.update(&data);
        format!("{:x}", hasher.finalize())
    })
    .await
    .map_err(|e| SyncError::verification(format!("hashing task failed: {e}")))
}

fn kind(object: &SyncObject) -> &'static str {
    if object.is_directory() {
        "directory"
    } else {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectMetadata;
    use chrono::Utc;

    fn file(path: &str, data: &'static [u8]) -> SyncObject {
        SyncObject::new(
            path,
            ObjectMetadata::file(data.len() as u64, Some(Utc::now())),
            Bytes::from_static(data),
        )
    }

    fn directory(path: &str) -> SyncObject {
        SyncObject::new(path, ObjectMetadata::directory(Some(Utc::now())), Bytes::new())
    }

    #[tokio::test]
    async fn test_matching_content_returns_target_md5() {
        let verifier = Md5Verifier::new(false);
        let md5 = verifier
            .verify(&file("f", b"payload"), &file("f", b"payload"))
            .await
            .unwrap();
        // Known md5 of "payload"
        assert_eq!(md5.as_deref(), Some("321c3cf486ed509164edec1e1981fec8"));
    }

    #[tokio::test]
    async fn test_mismatch_is_retriable_verification_error() {
        let verifier = Md5Verifier::new(false);
        let err = verifier
            .verify(&file("f", b"payload"), &file("f", b"corrupt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Verification { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_non_retriable() {
        let verifier = Md5Verifier::new(false);
        let err = verifier
            .verify(&file("x", b"data"), &directory("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NonRetriable { .. }));
    }

    #[tokio::test]
    async fn test_directories_verify_without_hashing() {
        let verifier = Md5Verifier::new(false);
        let md5 = verifier
            .verify(&directory("d"), &directory("d"))
            .await
            .unwrap();
        assert_eq!(md5, None);
    }

    #[tokio::test]
    async fn test_metadata_checksum_trusted_over_source_bytes() {
        let verifier = Md5Verifier::new(true);
        // Source bytes are wrong on purpose; the recorded checksum matches
        // the target, so verification must pass
        let mut source = file("f", b"stale-bytes");
        source.metadata.checksum = Some("321C3CF486ED509164EDEC1E1981FEC8".to_string());
        let md5 = verifier
            .verify(&source, &file("f", b"payload"))
            .await
            .unwrap();
        assert_eq!(md5.as_deref(), Some("321c3cf486ed509164edec1e1981fec8"));
    }

    #[tokio::test]
    async fn test_metadata_checksum_ignored_when_absent() {
        let verifier = Md5Verifier::new(true);
        let md5 = verifier
            .verify(&file("f", b"payload"), &file("f", b"payload"))
            .await
            .unwrap();
        assert!(md5.is_some());
    }
}
