//! Metadata store contract and its SQLite implementation.
//!
//! The storage pipelines only see the [`MetadataStore`] trait. Deletes are
//! idempotent and report whether the calling `delete` removed the row, which
//! is what makes disposable consumption race-free.

use super::error::StorageResult;
use crate::models::object::ObjectRecord;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Records are never updated afterwards.
    async fn create(&self, record: &ObjectRecord) -> StorageResult<()>;

    async fn find(&self, id: &str) -> StorageResult<Option<ObjectRecord>>;

    /// Ids of every record with `expire_at <= now_ms`.
    async fn find_expired(&self, now_ms: i64) -> StorageResult<Vec<String>>;

    /// Remove a record. Returns `true` only for the call that removed it.
    async fn delete(&self, id: &str) -> StorageResult<bool>;

    async fn list_all_ids(&self) -> StorageResult<Vec<String>>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> StorageResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create(&self, record: &ObjectRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO files (
                id, uploaded_at, expire_at, management_token, name,
                content_type, is_disposable, is_encrypted
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.uploaded_at)
        .bind(record.expire_at)
        .bind(&record.management_token)
        .bind(&record.name)
        .bind(&record.content_type)
        .bind(record.is_disposable)
        .bind(record.is_encrypted)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn find(&self, id: &str) -> StorageResult<Option<ObjectRecord>> {
        let record = sqlx::query_as::<_, ObjectRecord>(
            "SELECT id, uploaded_at, expire_at, management_token, name,
                    content_type, is_disposable, is_encrypted
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn find_expired(&self, now_ms: i64) -> StorageResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM files WHERE expire_at <= ?")
            .bind(now_ms)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all_ids(&self) -> StorageResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM files")
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
