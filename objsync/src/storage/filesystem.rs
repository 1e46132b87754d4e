//! Local-filesystem storage backend

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use futures::stream;
use tracing::debug;
use walkdir::WalkDir;

use super::{AssemblyInfo, Storage, SummaryStream};
use crate::error::{Result, SyncError};
use crate::list_file::first_csv_field;
use crate::model::{ObjectMetadata, ObjectSummary, SyncObject};

/// Storage rooted at a local directory.
///
/// Identifiers are `/`-separated paths relative to the root, regardless of
/// platform, so records written on one OS stay valid on another.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
    create_root: bool,
}

impl FilesystemStorage {
    /// Storage over an existing directory; `configure` fails if it is missing
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create_root: false,
        }
    }

    /// Storage that creates its root directory during `configure` if absent,
    /// the usual choice for a sync target
    pub fn new_create(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create_root: true,
        }
    }

    /// Root directory this storage operates under
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, identifier: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in identifier.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    fn list_level(&self, dir: PathBuf) -> SummaryStream {
        let root = self.root.clone();
        let entries: Vec<Result<ObjectSummary>> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(move |entry| {
                let entry = entry.map_err(|e| {
                    SyncError::storage(dir.display().to_string(), e.to_string())
                })?;
                let meta = entry.metadata().map_err(|e| {
                    SyncError::storage(entry.path().display().to_string(), e.to_string())
                })?;
                let identifier =
                    relative_identifier(&root, entry.path()).ok_or_else(|| {
                        SyncError::storage(
                            entry.path().display().to_string(),
                            "path escapes storage root",
                        )
                    })?;
                Ok(ObjectSummary {
                    identifier,
                    is_directory: meta.is_dir(),
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    list_row_num: None,
                })
            })
            .collect();
        Box::pin(stream::iter(entries))
    }

    async fn stat_metadata(&self, path: &Path) -> Result<ObjectMetadata> {
        let meta = tokio::fs::metadata(path).await?;
        let mtime = meta.modified().ok().map(to_utc);
        let ctime = meta.created().ok().map(to_utc);
        Ok(ObjectMetadata {
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
            ctime,
            checksum: None,
            is_directory: meta.is_dir(),
        })
    }

    async fn write_object(&self, path: &Path, object: &SyncObject) -> Result<()> {
        if object.is_directory() {
            tokio::fs::create_dir_all(path).await?;
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, &object.data).await?;
            if let Some(mtime) = object.metadata.mtime {
                let ft = FileTime::from_system_time(mtime.into());
                let target = path.to_path_buf();
                let label = object.relative_path.clone();
                tokio::task::spawn_blocking(move || filetime::set_file_mtime(&target, ft))
                    .await
                    .map_err(|e| SyncError::storage(label, e.to_string()))??;
            }
        }
        Ok(())
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    time.into()
}

/// `/`-separated path of `path` relative to `root`, `None` for the root
/// itself or paths outside it
fn relative_identifier(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn configure(&self, _assembly: &AssemblyInfo) -> Result<()> {
        if !self.root.exists() {
            if self.create_root {
                tokio::fs::create_dir_all(&self.root).await?;
                debug!(root = %self.root.display(), "created storage root");
            } else {
                return Err(SyncError::config(
                    self.name(),
                    format!("root directory does not exist: {}", self.root.display()),
                ));
            }
        } else if !self.root.is_dir() {
            return Err(SyncError::config(
                self.name(),
                format!("root is not a directory: {}", self.root.display()),
            ));
        }
        Ok(())
    }

    fn all_objects(&self) -> SummaryStream {
        self.list_level(self.root.clone())
    }

    fn children(&self, parent: &ObjectSummary) -> SummaryStream {
        self.list_level(self.full_path(&parent.identifier))
    }

    async fn parse_list_line(&self, line: &str) -> Result<ObjectSummary> {
        let identifier = first_csv_field(line);
        if identifier.is_empty() {
            return Err(SyncError::storage(line, "empty identifier in list line"));
        }
        let path = self.full_path(&identifier);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(ObjectSummary {
                identifier,
                is_directory: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                list_row_num: None,
            }),
            Err(_) => Ok(ObjectSummary::file(identifier, 0)),
        }
    }

    async fn load_object(&self, identifier: &str) -> Result<SyncObject> {
        let path = self.full_path(identifier);
        if !path.exists() {
            return Err(SyncError::not_found(identifier));
        }
        let metadata = self.stat_metadata(&path).await?;
        let data = if metadata.is_directory {
            Bytes::new()
        } else {
            Bytes::from(tokio::fs::read(&path).await?)
        };
        Ok(SyncObject::new(identifier, metadata, data))
    }

    async fn create_object(&self, object: &SyncObject) -> Result<String> {
        let identifier = self.get_identifier(&object.relative_path, object.is_directory());
        let path = self.full_path(&identifier);
        self.write_object(&path, object).await?;
        Ok(identifier)
    }

    async fn update_object(&self, identifier: &str, object: &SyncObject) -> Result<()> {
        let path = self.full_path(identifier);
        self.write_object(&path, object).await
    }

    fn get_identifier(&self, relative_path: &str, _is_directory: bool) -> String {
        relative_path.trim_matches('/').to_string()
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        let path = self.full_path(identifier);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| SyncError::not_found(identifier))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
