//! Represents a finalized, merged file and the metadata recorded about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a catalog entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Deleted,
}

/// A merged file as persisted in the `uploaded_files` table.
///
/// Written exactly once per successful merge. `storage_path` always points to
/// a complete file; no row exists for a merge that did not finish.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFileRecord {
    /// Record identifier, unrelated to the client's upload id.
    pub id: Uuid,

    /// Name of the merged file on disk (`<uuid><ext>`).
    pub file_name: String,

    /// File name the client declared when uploading.
    pub original_name: String,

    /// Absolute or storage-relative path of the merged file.
    pub storage_path: String,

    /// Size of the merged file in bytes.
    pub size_bytes: i64,

    /// MD5 of the merged content, lowercase hex.
    pub etag: String,

    pub uploader_id: String,
    pub uploader_name: Option<String>,
    pub uploader_account: Option<String>,
    pub organization_id: Option<String>,

    pub description: Option<String>,
    pub product_name: Option<String>,
    pub patient_name: Option<String>,

    /// When the merge finished and the record was written.
    #[serde(rename = "uploadDate")]
    pub uploaded_at: DateTime<Utc>,

    pub status: FileStatus,

    /// Set when the record was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}
