//! In-memory storage backend, used by tests and as a reference implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;

use super::{Storage, SummaryStream};
use crate::error::{Result, SyncError};
use crate::list_file::first_csv_field;
use crate::model::{ObjectMetadata, ObjectSummary, SyncObject};

/// Storage over a `BTreeMap` of path-like identifiers.
///
/// Identifiers are `/`-separated relative paths; directories are explicit
/// entries. Create/update calls are counted per identifier so tests can
/// assert exactly which objects were written.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, StoredEntry>>>,
    create_counts: Mutex<HashMap<String, u64>>,
    update_counts: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    metadata: ObjectMetadata,
    data: Bytes,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file entry with the current time as mtime
    pub fn put_file(&self, path: &str, data: impl Into<Bytes>) {
        self.put_file_at(path, data, Utc::now());
    }

    /// Insert or replace a file entry with an explicit mtime
    pub fn put_file_at(&self, path: &str, data: impl Into<Bytes>, mtime: DateTime<Utc>) {
        let data = data.into();
        let metadata = ObjectMetadata::file(data.len() as u64, Some(mtime));
        self.objects
            .write()
            .unwrap()
            .insert(path.to_string(), StoredEntry { metadata, data });
    }

    /// Insert or replace a directory entry
    pub fn put_directory(&self, path: &str) {
        self.objects.write().unwrap().insert(
            path.to_string(),
            StoredEntry {
                metadata: ObjectMetadata::directory(Some(Utc::now())),
                data: Bytes::new(),
            },
        );
    }

    /// Advance an entry's mtime, as if it had been modified
    pub fn touch(&self, path: &str, mtime: DateTime<Utc>) {
        if let Some(entry) = self.objects.write().unwrap().get_mut(path) {
            entry.metadata.mtime = Some(mtime);
        }
    }

    /// Record a metadata checksum for an entry
    pub fn set_checksum(&self, path: &str, checksum: impl Into<String>) {
        if let Some(entry) = self.objects.write().unwrap().get_mut(path) {
            entry.metadata.checksum = Some(checksum.into());
        }
    }

    /// Content of an entry, if present
    pub fn data(&self, path: &str) -> Option<Bytes> {
        self.objects.read().unwrap().get(path).map(|e| e.data.clone())
    }

    /// Mtime of an entry, if present
    pub fn mtime(&self, path: &str) -> Option<DateTime<Utc>> {
        self.objects
            .read()
            .unwrap()
            .get(path)
            .and_then(|e| e.metadata.mtime)
    }

    /// Whether an entry exists
    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().unwrap().contains_key(path)
    }

    /// Total entry count
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    /// Whether the storage holds no entries
    pub fn is_empty(&self) -> bool {
        self.objects.read().unwrap().is_empty()
    }

    /// Times `create_object` stored this identifier
    pub fn create_count(&self, path: &str) -> u64 {
        *self.create_counts.lock().unwrap().get(path).unwrap_or(&0)
    }

    /// Times `update_object` stored this identifier
    pub fn update_count(&self, path: &str) -> u64 {
        *self.update_counts.lock().unwrap().get(path).unwrap_or(&0)
    }

    fn summary_for(&self, identifier: &str, entry: &StoredEntry) -> ObjectSummary {
        ObjectSummary {
            identifier: identifier.to_string(),
            is_directory: entry.metadata.is_directory,
            size: entry.metadata.size,
            list_row_num: None,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn all_objects(&self) -> SummaryStream {
        let summaries: Vec<Result<ObjectSummary>> = self
            .objects
            .read()
            .unwrap()
            .iter()
            .filter(|(id, _)| !id.contains('/'))
            .map(|(id, entry)| Ok(self.summary_for(id, entry)))
            .collect();
        Box::pin(stream::iter(summaries))
    }

    fn children(&self, parent: &ObjectSummary) -> SummaryStream {
        let prefix = format!("{}/", parent.identifier);
        let summaries: Vec<Result<ObjectSummary>> = self
            .objects
            .read()
            .unwrap()
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .filter(|(id, _)| !id[prefix.len()..].contains('/'))
            .map(|(id, entry)| Ok(self.summary_for(id, entry)))
            .collect();
        Box::pin(stream::iter(summaries))
    }

    async fn parse_list_line(&self, line: &str) -> Result<ObjectSummary> {
        let identifier = first_csv_field(line);
        if identifier.is_empty() {
            return Err(SyncError::storage(line, "empty identifier in list line"));
        }
        let objects = self.objects.read().unwrap();
        Ok(match objects.get(&identifier) {
            Some(entry) => self.summary_for(&identifier, entry),
            None => ObjectSummary::file(identifier, 0),
        })
    }

    async fn load_object(&self, identifier: &str) -> Result<SyncObject> {
        let objects = self.objects.read().unwrap();
        let entry = objects
            .get(identifier)
            .ok_or_else(|| SyncError::not_found(identifier))?;
        Ok(SyncObject::new(
            identifier,
            entry.metadata.clone(),
            entry.data.clone(),
        ))
    }

    async fn create_object(&self, object: &SyncObject) -> Result<String> {
        let identifier = object.relative_path.clone();
        self.objects.write().unwrap().insert(
            identifier.clone(),
            StoredEntry {
                metadata: object.metadata.clone(),
                data: object.data.clone(),
            },
        );
        *self
            .create_counts
            .lock()
            .unwrap()
            .entry(identifier.clone())
            .or_insert(0) += 1;
        Ok(identifier)
    }

    async fn update_object(&self, identifier: &str, object: &SyncObject) -> Result<()> {
        self.objects.write().unwrap().insert(
            identifier.to_string(),
            StoredEntry {
                metadata: object.metadata.clone(),
                data: object.data.clone(),
            },
        );
        *self
            .update_counts
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    fn get_identifier(&self, relative_path: &str, _is_directory: bool) -> String {
        relative_path.to_string()
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap()
            .remove(identifier)
            .ok_or_else(|| SyncError::not_found(identifier))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_listing_and_children() {
        let storage = MemoryStorage::new();
        storage.put_file("a.txt", "aaa");
        storage.put_directory("dir");
        storage.put_file("dir/b.txt", "bbb");
        storage.put_file("dir/c.txt", "cc");
        storage.put_directory("dir/sub");
        storage.put_file("dir/sub/d.txt", "d");

        let top: Vec<_> = storage.all_objects().try_collect().await.unwrap();
        let names: Vec<_> = top.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "dir"]);

        let dir = top.iter().find(|s| s.is_directory).unwrap();
        let kids: Vec<_> = storage.children(dir).try_collect().await.unwrap();
        let names: Vec<_> = kids.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(names, vec!["dir/b.txt", "dir/c.txt", "dir/sub"]);
    }

    #[tokio::test]
    async fn test_load_create_update_delete() {
        let storage = MemoryStorage::new();
        storage.put_file("x", "old");

        let object = storage.load_object("x").await.unwrap();
        assert_eq!(&object.data[..], b"old");
        assert_eq!(object.metadata.size, 3);

        let updated = SyncObject::new(
            "x",
            ObjectMetadata::file(3, Some(Utc::now())),
            Bytes::from_static(b"new"),
        );
        storage.update_object("x", &updated).await.unwrap();
        assert_eq!(&storage.data("x").unwrap()[..], b"new");
        assert_eq!(storage.update_count("x"), 1);

        let created = SyncObject::new(
            "y",
            ObjectMetadata::file(1, Some(Utc::now())),
            Bytes::from_static(b"y"),
        );
        let id = storage.create_object(&created).await.unwrap();
        assert_eq!(id, "y");
        assert_eq!(storage.create_count("y"), 1);

        storage.delete("y").await.unwrap();
        assert!(!storage.contains("y"));
        assert!(matches!(
            storage.load_object("y").await,
            Err(SyncError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_parse_list_line_uses_first_csv_field() {
        let storage = MemoryStorage::new();
        storage.put_file("known", "data");

        let summary = storage.parse_list_line("known,extra,cols").await.unwrap();
        assert_eq!(summary.identifier, "known");
        assert_eq!(summary.size, 4);

        let summary = storage.parse_list_line("missing").await.unwrap();
        assert_eq!(summary.identifier, "missing");
        assert_eq!(summary.size, 0);
    }
}
