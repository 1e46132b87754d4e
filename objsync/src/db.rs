//! Per-identifier status ledger: the contract that makes re-runs idempotent

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{ObjectContext, ObjectStatus};

/// Default ledger table name
pub const DEFAULT_TABLE: &str = "objsync_status";

/// Persisted per-identifier state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub identifier: String,
    pub status: ObjectStatus,
    pub error_summary: Option<String>,
    /// Source mtime observed when the record was last written
    pub mtime: Option<DateTime<Utc>>,
    pub target_id: Option<String>,
    pub is_deleted: bool,
}

/// RAII per-identifier lock; dropping it releases the identifier
pub struct IdLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

/// Process-local lock table serializing concurrent attempts per identifier
#[derive(Debug, Clone, Default)]
pub struct IdentifierLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdentifierLocks {
    /// Acquire the lock for `identifier`, waiting if another task holds it
    pub async fn lock(&self, identifier: &str) -> IdLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        IdLock {
            _guard: mutex.lock_owned().await,
        }
    }
}

/// Status-ledger contract.
///
/// `lock` serializes concurrent sync attempts at one identifier; record
/// operations persist the per-object state machine so repeated runs can skip
/// up-to-date objects.
#[async_trait]
pub trait DbService: Send + Sync {
    /// Serialize all work on `identifier` until the returned guard drops
    async fn lock(&self, identifier: &str) -> IdLock;

    /// Fetch the prior record for an identifier, if any
    async fn get_record(&self, identifier: &str) -> Result<Option<SyncRecord>>;

    /// Persist the context's current status; returns whether a new record was
    /// created
    async fn set_status(
        &self,
        ctx: &ObjectContext,
        error_summary: Option<&str>,
        is_new: bool,
    ) -> Result<bool>;

    /// Mark the identifier's source object as deleted
    async fn set_deleted(&self, ctx: &ObjectContext, is_new: bool) -> Result<()>;

    /// Release any underlying resources
    async fn close(&self) -> Result<()>;
}

fn record_from_context(ctx: &ObjectContext, error_summary: Option<&str>) -> SyncRecord {
    SyncRecord {
        identifier: ctx.identifier().to_string(),
        status: ctx.status,
        error_summary: error_summary.map(str::to_string),
        mtime: ctx.source_mtime(),
        target_id: ctx.target_id.clone(),
        is_deleted: false,
    }
}

/// Ledger that persists nothing; still provides per-identifier locking
#[derive(Debug, Default)]
pub struct NoDbService {
    locks: IdentifierLocks,
}

impl NoDbService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DbService for NoDbService {
    async fn lock(&self, identifier: &str) -> IdLock {
        self.locks.lock(identifier).await
    }

    async fn get_record(&self, _identifier: &str) -> Result<Option<SyncRecord>> {
        Ok(None)
    }

    async fn set_status(
        &self,
        _ctx: &ObjectContext,
        _error_summary: Option<&str>,
        is_new: bool,
    ) -> Result<bool> {
        Ok(is_new)
    }

    async fn set_deleted(&self, _ctx: &ObjectContext, _is_new: bool) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory ledger; shareable across jobs within one process
#[derive(Debug, Default)]
pub struct MemoryDbService {
    records: tokio::sync::RwLock<HashMap<String, SyncRecord>>,
    locks: IdentifierLocks,
}

impl MemoryDbService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl DbService for MemoryDbService {
    async fn lock(&self, identifier: &str) -> IdLock {
        self.locks.lock(identifier).await
    }

    async fn get_record(&self, identifier: &str) -> Result<Option<SyncRecord>> {
        Ok(self.records.read().await.get(identifier).cloned())
    }

    async fn set_status(
        &self,
        ctx: &ObjectContext,
        error_summary: Option<&str>,
        _is_new: bool,
    ) -> Result<bool> {
        let record = record_from_context(ctx, error_summary);
        let mut records = self.records.write().await;
        let existing = records.insert(record.identifier.clone(), record);
        Ok(existing.is_none())
    }

    async fn set_deleted(&self, ctx: &ObjectContext, _is_new: bool) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(ctx.identifier()) {
            Some(record) => record.is_deleted = true,
            None => {
                let mut record = record_from_context(ctx, None);
                record.is_deleted = true;
                records.insert(record.identifier.clone(), record);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// SQL-backed ledger over sqlite or mysql, selected by connection URL
pub struct SqlDbService {
    pool: AnyPool,
    table: String,
    locks: IdentifierLocks,
}

impl SqlDbService {
    /// Connect to a database URL (`sqlite://...` or `mysql://...`) and
    /// create the status table when missing
    pub async fn connect(url: &str, table: Option<&str>) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let table = table.unwrap_or(DEFAULT_TABLE).to_string();
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SyncError::Db(format!("invalid table name '{table}'")));
        }
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| SyncError::Db(format!("connect failed: {e}")))?;
        let service = Self {
            pool,
            table,
            locks: IdentifierLocks::default(),
        };
        service.init_schema().await?;
        Ok(service)
    }

    /// Open (creating if necessary) a sqlite file ledger
    pub async fn sqlite_file(path: &str, table: Option<&str>) -> Result<Self> {
        Self::connect(&format!("sqlite://{path}?mode=rwc"), table).await
    }

    async fn init_schema(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                identifier VARCHAR(750) NOT NULL PRIMARY KEY,
                status VARCHAR(32) NOT NULL,
                error_summary TEXT,
                mtime BIGINT,
                target_id TEXT,
                is_deleted BIGINT NOT NULL DEFAULT 0
            )",
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Db(format!("schema init failed: {e}")))?;
        Ok(())
    }

    fn row_to_record(&self, row: &AnyRow) -> Result<SyncRecord> {
        let map_err = |e: sqlx::Error| SyncError::Db(format!("row decode failed: {e}"));
        let status: String = row.try_get("status").map_err(map_err)?;
        let mtime: Option<i64> = row.try_get("mtime").map_err(map_err)?;
        Ok(SyncRecord {
            identifier: row.try_get("identifier").map_err(map_err)?,
            status: ObjectStatus::parse(&status),
            error_summary: row.try_get("error_summary").map_err(map_err)?,
            mtime: mtime.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            target_id: row.try_get("target_id").map_err(map_err)?,
            is_deleted: row.try_get::<i64, _>("is_deleted").map_err(map_err)? != 0,
        })
    }

    async fn insert(&self, record: &SyncRecord) -> std::result::Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (identifier, status, error_summary, mtime, target_id, is_deleted)
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        );
        sqlx::query(&sql)
            .bind(&record.identifier)
            .bind(record.status.as_str())
            .bind(&record.error_summary)
            .bind(record.mtime.map(|t| t.timestamp_millis()))
            .bind(&record.target_id)
            .bind(record.is_deleted as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &SyncRecord) -> std::result::Result<u64, sqlx::Error> {
        let sql = format!(
            "UPDATE {} SET status = ?, error_summary = ?, mtime = ?, target_id = ?, is_deleted = ?
             WHERE identifier = ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(record.status.as_str())
            .bind(&record.error_summary)
            .bind(record.mtime.map(|t| t.timestamp_millis()))
            .bind(&record.target_id)
            .bind(record.is_deleted as i64)
            .bind(&record.identifier)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DbService for SqlDbService {
    async fn lock(&self, identifier: &str) -> IdLock {
        self.locks.lock(identifier).await
    }

    async fn get_record(&self, identifier: &str) -> Result<Option<SyncRecord>> {
        let sql = format!(
            "SELECT identifier, status, error_summary, mtime, target_id, is_deleted
             FROM {} WHERE identifier = ?",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Db(format!("select failed: {e}")))?;
        row.map(|r| self.row_to_record(&r)).transpose()
    }

    async fn set_status(
        &self,
        ctx: &ObjectContext,
        error_summary: Option<&str>,
        is_new: bool,
    ) -> Result<bool> {
        let record = record_from_context(ctx, error_summary);
        if is_new {
            match self.insert(&record).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    // Another run may have created the row already
                    debug!(identifier = %record.identifier, error = %e, "insert fell back to update");
                }
            }
        }
        let updated = self
            .update(&record)
            .await
            .map_err(|e| SyncError::Db(format!("update failed: {e}")))?;
        if updated == 0 {
            self.insert(&record)
                .await
                .map_err(|e| SyncError::Db(format!("insert failed: {e}")))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_deleted(&self, ctx: &ObjectContext, _is_new: bool) -> Result<()> {
        let sql = format!("UPDATE {} SET is_deleted = 1 WHERE identifier = ?", self.table);
        let result = sqlx::query(&sql)
            .bind(ctx.identifier())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Db(format!("delete-mark failed: {e}")))?;
        if result.rows_affected() == 0 {
            let mut record = record_from_context(ctx, None);
            record.is_deleted = true;
            self.insert(&record)
                .await
                .map_err(|e| SyncError::Db(format!("delete-mark insert failed: {e}")))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
