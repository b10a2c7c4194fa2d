//! Download record repository.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::SqlitePool;

use crate::database::models::{DownloadRecord, DownloadStatus, ProgressUpdate};
use crate::database::retry::retry_on_busy;
use crate::{Error, Result};

/// Narrow store interface used by workers and the control API.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Get the record for a content id.
    async fn get_record(&self, content_id: &str) -> Result<Option<DownloadRecord>>;

    /// List all records, most recently created first.
    async fn list_all(&self) -> Result<Vec<DownloadRecord>>;

    /// Insert a record unless one already exists for the id.
    /// Returns `true` if the record was inserted.
    async fn create_if_absent(&self, record: &DownloadRecord) -> Result<bool>;

    /// Write status, progress and completion fields, creating the row if needed.
    async fn upsert_progress(&self, update: &ProgressUpdate) -> Result<()>;

    /// Change the status of an existing record.
    ///
    /// Completion carries a timestamp and path, so `Completed` must go through
    /// [`upsert_progress`](Self::upsert_progress) instead. Returns `false` if no
    /// record exists.
    async fn update_status(&self, content_id: &str, status: DownloadStatus) -> Result<bool>;
}

fn reject_completed_status(content_id: &str, status: DownloadStatus) -> Result<()> {
    if status == DownloadStatus::Completed {
        return Err(Error::invalid_input(format!(
            "completion of {content_id} must be written with its local path"
        )));
    }
    Ok(())
}

/// SQLx implementation of DownloadRepository.
pub struct SqlxDownloadRepository {
    pool: SqlitePool,
    write_pool: SqlitePool,
}

impl SqlxDownloadRepository {
    /// Create a new repository from a read pool and a serialized write pool.
    pub fn new(pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl DownloadRepository for SqlxDownloadRepository {
    async fn get_record(&self, content_id: &str) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>(
            "SELECT * FROM downloads WHERE content_id = ?",
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            "SELECT * FROM downloads ORDER BY created_at_ms DESC, content_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn create_if_absent(&self, record: &DownloadRecord) -> Result<bool> {
        retry_on_busy("create_download", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO downloads (
                    content_id, status, progress, completed_at_ms, local_path,
                    title, season_id, season_name, thumbnail_url, season_thumbnail_url,
                    stream_keys, created_at_ms, updated_at_ms, revision
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_id) DO NOTHING
                "#,
            )
            .bind(&record.content_id)
            .bind(<&str>::from(record.status))
            .bind(i64::from(record.progress))
            .bind(record.completed_at_ms)
            .bind(&record.local_path)
            .bind(&record.title)
            .bind(&record.season_id)
            .bind(&record.season_name)
            .bind(&record.thumbnail_url)
            .bind(&record.season_thumbnail_url)
            .bind(&record.stream_keys)
            .bind(record.created_at_ms)
            .bind(record.updated_at_ms)
            .bind(record.revision)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn upsert_progress(&self, update: &ProgressUpdate) -> Result<()> {
        update.validate()?;

        retry_on_busy("upsert_progress", || async {
            let now = Utc::now().timestamp_millis();
            sqlx::query(
                r#"
                INSERT INTO downloads (
                    content_id, status, progress, completed_at_ms, local_path,
                    created_at_ms, updated_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_id) DO UPDATE SET
                    status = excluded.status,
                    progress = excluded.progress,
                    completed_at_ms = excluded.completed_at_ms,
                    local_path = excluded.local_path,
                    updated_at_ms = excluded.updated_at_ms,
                    revision = downloads.revision + 1
                "#,
            )
            .bind(&update.content_id)
            .bind(<&str>::from(update.status))
            .bind(i64::from(update.progress))
            .bind(update.completed_at_ms)
            .bind(&update.local_path)
            .bind(now)
            .bind(now)
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_status(&self, content_id: &str, status: DownloadStatus) -> Result<bool> {
        reject_completed_status(content_id, status)?;

        retry_on_busy("update_status", || async {
            let now = Utc::now().timestamp_millis();
            let result = sqlx::query(
                r#"
                UPDATE downloads
                SET status = ?,
                    progress = MIN(progress, 99),
                    completed_at_ms = NULL,
                    local_path = NULL,
                    updated_at_ms = ?,
                    revision = revision + 1
                WHERE content_id = ?
                "#,
            )
            .bind(<&str>::from(status))
            .bind(now)
            .bind(content_id)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}

/// In-memory repository for tests and engine-only deployments.
#[derive(Debug, Default)]
pub struct MemoryDownloadRepository {
    records: RwLock<HashMap<String, DownloadRecord>>,
}

impl MemoryDownloadRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadRepository for MemoryDownloadRepository {
    async fn get_record(&self, content_id: &str) -> Result<Option<DownloadRecord>> {
        Ok(self.records.read().get(content_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let mut records: Vec<DownloadRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        Ok(records)
    }

    async fn create_if_absent(&self, record: &DownloadRecord) -> Result<bool> {
        let mut records = self.records.write();
        if records.contains_key(&record.content_id) {
            return Ok(false);
        }
        records.insert(record.content_id.clone(), record.clone());
        Ok(true)
    }

    async fn upsert_progress(&self, update: &ProgressUpdate) -> Result<()> {
        update.validate()?;

        let now = Utc::now().timestamp_millis();
        let mut records = self.records.write();
        match records.entry(update.content_id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.apply(update, now);
                record.revision += 1;
            }
            Entry::Vacant(entry) => {
                let mut record = DownloadRecord::queued(update.content_id.clone(), now);
                record.apply(update, now);
                entry.insert(record);
            }
        }
        Ok(())
    }

    async fn update_status(&self, content_id: &str, status: DownloadStatus) -> Result<bool> {
        reject_completed_status(content_id, status)?;

        let now = Utc::now().timestamp_millis();
        match self.records.write().get_mut(content_id) {
            Some(record) => {
                record.apply_status(status, now);
                record.revision += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
