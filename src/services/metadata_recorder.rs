//! Persists one catalog record per finished merge.

use crate::models::{
    file_record::{FileStatus, UploadedFileRecord},
    upload::MergeContext,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

/// A merged file that is complete on disk and ready to be indexed.
#[derive(Clone, Debug)]
pub struct MergedFile {
    /// `<uuid><ext>`, also the last component of `storage_path`.
    pub file_name: String,
    pub storage_path: PathBuf,
    pub size_bytes: i64,
    /// MD5 of the merged content, lowercase hex.
    pub etag: String,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("metadata backend unavailable: {0}")]
    Unavailable(String),
}

/// Writes the record describing a merged file.
///
/// Implementations generate the record id and timestamp. They must not touch
/// the file itself: on failure the caller keeps it on disk as an orphan.
#[async_trait]
pub trait MetadataRecorder: Send + Sync {
    async fn record(
        &self,
        file: &MergedFile,
        ctx: &MergeContext,
    ) -> Result<UploadedFileRecord, RecordError>;
}

/// Recorder backed by the `uploaded_files` SQLite table.
#[derive(Clone)]
pub struct SqliteMetadataRecorder {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataRecorder {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataRecorder for SqliteMetadataRecorder {
    async fn record(
        &self,
        file: &MergedFile,
        ctx: &MergeContext,
    ) -> Result<UploadedFileRecord, RecordError> {
        let record = sqlx::query_as::<_, UploadedFileRecord>(
            r#"
            INSERT INTO uploaded_files (
                id, file_name, original_name, storage_path, size_bytes, etag,
                uploader_id, uploader_name, uploader_account, organization_id,
                description, product_name, patient_name, uploaded_at, status, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            RETURNING id, file_name, original_name, storage_path, size_bytes, etag,
                      uploader_id, uploader_name, uploader_account, organization_id,
                      description, product_name, patient_name, uploaded_at, status, deleted_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&file.file_name)
        .bind(&ctx.file_name)
        .bind(file.storage_path.to_string_lossy().into_owned())
        .bind(file.size_bytes)
        .bind(&file.etag)
        .bind(&ctx.uploader.id)
        .bind(ctx.uploader.name.as_deref())
        .bind(ctx.uploader.account.as_deref())
        .bind(ctx.uploader.organization_id.as_deref())
        .bind(ctx.details.description.as_deref())
        .bind(ctx.details.product_name.as_deref())
        .bind(ctx.details.patient_name.as_deref())
        .bind(Utc::now())
        .bind(FileStatus::Active)
        .fetch_one(&*self.db)
        .await?;

        tracing::info!(
            record_id = %record.id,
            file_name = %record.file_name,
            size_bytes = record.size_bytes,
            "recorded merged file"
        );
        Ok(record)
    }
}
