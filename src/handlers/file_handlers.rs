//! HTTP handlers for the file catalog: list, inspect, delete, download.
//! Downloads stream from disk instead of buffering the file in memory.

use crate::{
    errors::AppError,
    models::file_record::UploadedFileRecord,
    services::catalog_service::ListFilesParams,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Query params accepted by `GET /api/files`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesQuery {
    pub patient_name: Option<String>,
    pub product_name: Option<String>,
    pub description: Option<String>,
    pub uploader_id: Option<String>,
    pub organization_id: Option<String>,
    /// `YYYY-MM-DD`, inclusive.
    pub upload_start_date: Option<String>,
    /// `YYYY-MM-DD`, inclusive.
    pub upload_end_date: Option<String>,
}

impl ListFilesQuery {
    fn into_params(self) -> Result<ListFilesParams, AppError> {
        Ok(ListFilesParams {
            patient_name: non_empty(self.patient_name),
            product_name: non_empty(self.product_name),
            description: non_empty(self.description),
            uploader_id: non_empty(self.uploader_id),
            organization_id: non_empty(self.organization_id),
            uploaded_from: parse_date(self.upload_start_date, "uploadStartDate")?,
            uploaded_to: parse_date(self.upload_end_date, "uploadEndDate")?,
        })
    }
}

/// GET `/api/files`: list active files, newest first.
pub async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<ListFilesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let params = q.into_params()?;
    let files = state.catalog.list(&params).await?;
    let total = files.len();
    Ok(Json(json!({ "data": files, "total": total })))
}

/// GET `/api/files/{id}`: metadata of one file.
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadedFileRecord>, AppError> {
    Ok(Json(state.catalog.get(id).await?))
}

/// DELETE `/api/files/{id}`: soft-delete a file.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.catalog.delete(id).await?;
    tracing::info!(record_id = %record.id, file_name = %record.file_name, "deleted file");
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/api/files/{id}/download`: stream the merged file.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (meta, file) = state.catalog.open_for_download(id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, meta: &UploadedFileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    let disposition = format!(
        "attachment; filename=\"{}\"",
        disposition_name(&meta.original_name, &meta.file_name)
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.uploaded_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}

/// Client-facing download name: the original name with anything that cannot
/// sit inside a quoted header value replaced, or the stored name if nothing
/// usable is left.
fn disposition_name(original: &str, stored: &str) -> String {
    let cleaned: String = original
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('_').trim().is_empty() {
        stored.to_string()
    } else {
        cleaned
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_date(value: Option<String>, name: &str) -> Result<Option<NaiveDate>, AppError> {
    match non_empty(value) {
        None => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("`{}` must be YYYY-MM-DD, got `{}`", name, raw))),
    }
}
