//! src/services/catalog_service.rs
//!
//! CatalogService is the read and delete side over recorded files: filtered
//! listing, single lookups, soft delete and opening a file for download.
//! It never touches upload sessions or staged chunks.

use crate::models::file_record::{FileStatus, UploadedFileRecord};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::debug;
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, file_name, original_name, storage_path, size_bytes, etag, \
     uploader_id, uploader_name, uploader_account, organization_id, \
     description, product_name, patient_name, uploaded_at, status, deleted_at \
     FROM uploaded_files";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("file `{0}` not found")]
    NotFound(Uuid),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Listing filters. Text fields match by substring, ids by equality, and the
/// date range is inclusive on both ends.
#[derive(Clone, Debug, Default)]
pub struct ListFilesParams {
    pub patient_name: Option<String>,
    pub product_name: Option<String>,
    pub description: Option<String>,
    pub uploader_id: Option<String>,
    pub organization_id: Option<String>,
    pub uploaded_from: Option<NaiveDate>,
    pub uploaded_to: Option<NaiveDate>,
}

#[derive(Clone)]
pub struct CatalogService {
    pub db: Arc<SqlitePool>,
    /// Remove the file from disk on delete, not just the listing.
    pub purge_files: bool,
}

impl CatalogService {
    pub fn new(db: Arc<SqlitePool>, purge_files: bool) -> Self {
        Self { db, purge_files }
    }

    /// Active records matching `params`, newest first.
    pub async fn list(&self, params: &ListFilesParams) -> CatalogResult<Vec<UploadedFileRecord>> {
        if let (Some(from), Some(to)) = (params.uploaded_from, params.uploaded_to) {
            if from > to {
                return Err(CatalogError::InvalidFilter(format!(
                    "start date {} is after end date {}",
                    from, to
                )));
            }
        }

        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        builder.push(" WHERE status = ");
        builder.push_bind(FileStatus::Active);

        for (column, value) in [
            ("patient_name", &params.patient_name),
            ("product_name", &params.product_name),
            ("description", &params.description),
        ] {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                builder.push(format!(" AND {} LIKE ", column));
                builder.push_bind(format!("%{}%", escape_like(value)));
                builder.push(" ESCAPE '\\'");
            }
        }

        for (column, value) in [
            ("uploader_id", &params.uploader_id),
            ("organization_id", &params.organization_id),
        ] {
            if let Some(value) = value {
                builder.push(format!(" AND {} = ", column));
                builder.push_bind(value.clone());
            }
        }

        if let Some(from) = params.uploaded_from {
            builder.push(" AND uploaded_at >= ");
            builder.push_bind(start_of_day(from));
        }
        if let Some(to) = params.uploaded_to.and_then(|d| d.succ_opt()) {
            builder.push(" AND uploaded_at < ");
            builder.push_bind(start_of_day(to));
        }

        builder.push(" ORDER BY uploaded_at DESC");

        let rows = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// One active record.
    pub async fn get(&self, id: Uuid) -> CatalogResult<UploadedFileRecord> {
        sqlx::query_as::<_, UploadedFileRecord>(&format!("{} WHERE id = ? AND status = ?", SELECT_COLUMNS))
            .bind(id)
            .bind(FileStatus::Active)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => CatalogError::NotFound(id),
                other => CatalogError::Sqlx(other),
            })
    }

    /// Soft-delete a record and, when configured, remove its file.
    ///
    /// Deleting an already deleted record returns NotFound.
    pub async fn delete(&self, id: Uuid) -> CatalogResult<UploadedFileRecord> {
        let record = self.get(id).await?;

        let result = sqlx::query(
            "UPDATE uploaded_files SET status = ?, deleted_at = ? WHERE id = ? AND status = ?",
        )
        .bind(FileStatus::Deleted)
        .bind(Utc::now())
        .bind(id)
        .bind(FileStatus::Active)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id));
        }

        if self.purge_files {
            let path = PathBuf::from(&record.storage_path);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed merged file {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("file {} already missing", path.display());
                }
                Err(err) => return Err(CatalogError::Io(err)),
            }
        }

        Ok(record)
    }

    /// Record plus an open handle ready for streaming out.
    ///
    /// A record whose file is gone from disk is reported as NotFound.
    pub async fn open_for_download(&self, id: Uuid) -> CatalogResult<(UploadedFileRecord, File)> {
        let record = self.get(id).await?;
        let file = File::open(&record.storage_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CatalogError::NotFound(id)
            } else {
                CatalogError::Io(err)
            }
        })?;
        Ok((record, file))
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::upload::{MergeContext, UploadDetails, Uploader},
        services::metadata_recorder::{MergedFile, MetadataRecorder, SqliteMetadataRecorder},
    };
    use chrono::Duration;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        dir: tempfile::TempDir,
        catalog: CatalogService,
        recorder: SqliteMetadataRecorder,
    }

    async fn fixture(purge_files: bool) -> Fixture {
        let db = Arc::new(memory_pool().await);
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            catalog: CatalogService::new(db.clone(), purge_files),
            recorder: SqliteMetadataRecorder::new(db),
        }
    }

    impl Fixture {
        async fn add(&self, name: &str, patient: &str, org: &str) -> UploadedFileRecord {
            let path = self.dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            let file = MergedFile {
                file_name: name.into(),
                storage_path: path,
                size_bytes: name.len() as i64,
                etag: format!("{:x}", md5::compute(name.as_bytes())),
            };
            let ctx = MergeContext {
                file_name: name.into(),
                details: UploadDetails {
                    patient_name: Some(patient.into()),
                    product_name: Some("Bridge 100%".into()),
                    description: None,
                },
                uploader: Uploader {
                    id: "u-9".into(),
                    organization_id: Some(org.into()),
                    ..Uploader::default()
                },
            };
            self.recorder.record(&file, &ctx).await.unwrap()
        }
    }

    #[tokio::test]
    async fn filters_by_text_org_and_date_range() {
        let fx = fixture(false).await;
        fx.add("a.stl", "Zhang Wei", "org-1").await;
        fx.add("b.stl", "Li Na", "org-1").await;
        fx.add("c.stl", "Zhang Min", "org-2").await;

        let all = fx.catalog.list(&ListFilesParams::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].file_name, "c.stl");

        let zhang = ListFilesParams {
            patient_name: Some("Zhang".into()),
            ..ListFilesParams::default()
        };
        assert_eq!(fx.catalog.list(&zhang).await.unwrap().len(), 2);

        let zhang_org1 = ListFilesParams {
            organization_id: Some("org-1".into()),
            ..zhang.clone()
        };
        let rows = fx.catalog.list(&zhang_org1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].patient_name.as_deref(), Some("Zhang Wei"));

        // `%` is matched literally, not as a wildcard
        let literal = ListFilesParams {
            product_name: Some("100%".into()),
            ..ListFilesParams::default()
        };
        assert_eq!(fx.catalog.list(&literal).await.unwrap().len(), 3);
        let wildcard = ListFilesParams {
            product_name: Some("1%0".into()),
            ..ListFilesParams::default()
        };
        assert!(fx.catalog.list(&wildcard).await.unwrap().is_empty());

        let today = Utc::now().date_naive();
        let same_day = ListFilesParams {
            uploaded_from: Some(today),
            uploaded_to: Some(today),
            ..ListFilesParams::default()
        };
        assert_eq!(fx.catalog.list(&same_day).await.unwrap().len(), 3);

        let last_week = ListFilesParams {
            uploaded_from: Some(today - Duration::days(7)),
            uploaded_to: Some(today - Duration::days(1)),
            ..ListFilesParams::default()
        };
        assert!(fx.catalog.list(&last_week).await.unwrap().is_empty());

        let reversed = ListFilesParams {
            uploaded_from: Some(today),
            uploaded_to: Some(today - Duration::days(1)),
            ..ListFilesParams::default()
        };
        assert!(matches!(
            fx.catalog.list(&reversed).await,
            Err(CatalogError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_record_but_keeps_file() {
        let fx = fixture(false).await;
        let record = fx.add("keep.stl", "P", "o").await;

        let deleted = fx.catalog.delete(record.id).await.unwrap();
        assert_eq!(deleted.id, record.id);
        assert!(fx.catalog.list(&ListFilesParams::default()).await.unwrap().is_empty());
        assert!(matches!(fx.catalog.get(record.id).await, Err(CatalogError::NotFound(_))));
        assert!(matches!(fx.catalog.delete(record.id).await, Err(CatalogError::NotFound(_))));
        assert!(std::path::Path::new(&record.storage_path).exists());

        let status: String = sqlx::query_scalar("SELECT status FROM uploaded_files WHERE id = ?")
            .bind(record.id)
            .fetch_one(&*fx.catalog.db)
            .await
            .unwrap();
        assert_eq!(status, "deleted");
    }

    #[tokio::test]
    async fn purge_policy_removes_the_file() {
        let fx = fixture(true).await;
        let record = fx.add("gone.stl", "P", "o").await;

        fx.catalog.delete(record.id).await.unwrap();
        assert!(!std::path::Path::new(&record.storage_path).exists());
    }

    #[tokio::test]
    async fn download_streams_file_or_reports_not_found() {
        let fx = fixture(false).await;
        let record = fx.add("dl.stl", "P", "o").await;

        let (meta, mut file) = fx.catalog.open_for_download(record.id).await.unwrap();
        let mut body = Vec::new();
        file.read_to_end(&mut body).await.unwrap();
        assert_eq!(meta.id, record.id);
        assert_eq!(body, b"dl.stl");

        assert!(matches!(
            fx.catalog.open_for_download(Uuid::new_v4()).await,
            Err(CatalogError::NotFound(_))
        ));

        std::fs::remove_file(&record.storage_path).unwrap();
        assert!(matches!(
            fx.catalog.open_for_download(record.id).await,
            Err(CatalogError::NotFound(_))
        ));
    }
}
