//! HTTP handlers for chunk uploads.
//!
//! A chunk arrives as one multipart form. Field names are matched without
//! regard to case so both `uploadId` and `UploadId` clients work:
//! - `uploadId` (alias `fileId`), `chunkIndex`, `totalChunks`, `fileName`
//! - `fileChunk` (alias `file`, `chunk`): the raw bytes
//! - `orderData`: JSON with `description`, `productName`, `patientName`
//!   (PascalCase keys accepted too);
//!   the same three may also be sent as plain fields

use crate::{
    errors::AppError,
    models::upload::{ChunkUpload, MergeContext, UploadDetails, Uploader},
    services::{merge_engine::MergeOutcome, upload_service::ChunkReceipt},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

/// Body of `POST /api/uploads/{upload_id}/merge`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_name: String,
    #[serde(flatten)]
    pub details: UploadDetails,
}

/// Raw multipart fields of one chunk request, before validation.
#[derive(Debug, Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_name: Option<String>,
    bytes: Option<Bytes>,
    order_data: Option<String>,
    details: UploadDetails,
}

impl ChunkForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, AppError> {
        let mut form = ChunkForm::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_ascii_lowercase();
            match name.as_str() {
                "filechunk" | "file" | "chunk" => {
                    form.bytes = Some(field.bytes().await.map_err(multipart_error)?);
                }
                "uploadid" | "fileid" => form.upload_id = Some(text(field).await?),
                "chunkindex" => form.chunk_index = Some(text(field).await?),
                "totalchunks" => form.total_chunks = Some(text(field).await?),
                "filename" => form.file_name = Some(text(field).await?),
                "orderdata" => form.order_data = Some(text(field).await?),
                "description" => form.details.description = Some(text(field).await?),
                "productname" => form.details.product_name = Some(text(field).await?),
                "patientname" => form.details.patient_name = Some(text(field).await?),
                other => tracing::debug!("ignoring multipart field `{}`", other),
            }
        }
        Ok(form)
    }

    fn into_parts(self, uploader: Uploader) -> Result<(ChunkUpload, MergeContext), AppError> {
        let upload_id = required(self.upload_id, "uploadId")?;
        let chunk_index = parse_count(required(self.chunk_index, "chunkIndex")?, "chunkIndex")?;
        let total_chunks = parse_count(required(self.total_chunks, "totalChunks")?, "totalChunks")?;
        let file_name = required(self.file_name, "fileName")?;
        let bytes = self
            .bytes
            .ok_or_else(|| AppError::bad_request("missing field `fileChunk`"))?;

        let details = match self.order_data.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => serde_json::from_str::<UploadDetails>(raw)
                .map_err(|err| AppError::bad_request(format!("invalid orderData: {}", err)))?,
            _ => self.details,
        };

        Ok((
            ChunkUpload {
                upload_id,
                chunk_index,
                total_chunks,
                bytes,
            },
            MergeContext {
                file_name,
                details,
                uploader,
            },
        ))
    }
}

/// `POST /api/uploads/chunks`: stage one chunk; the chunk completing the set
/// also merges and records the file.
pub async fn upload_chunk(
    State(state): State<AppState>,
    uploader: Uploader,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let form = ChunkForm::read(&mut multipart).await?;
    let (chunk, ctx) = form.into_parts(uploader)?;
    let upload_id = chunk.upload_id.clone();

    let receipt = state.uploads.receive_chunk(chunk, ctx).await?;
    Ok(match receipt {
        ChunkReceipt::Stored {
            received_chunks,
            total_chunks,
        } => (
            StatusCode::OK,
            Json(json!({
                "message": "Chunk uploaded successfully.",
                "uploadId": upload_id,
                "receivedChunks": received_chunks,
                "totalChunks": total_chunks,
            })),
        )
            .into_response(),
        ChunkReceipt::Merged(record) => merged_response(&record),
        ChunkReceipt::MergeInProgress => in_progress_response(&upload_id),
    })
}

/// `POST /api/uploads/{upload_id}/merge`: retry the merge of a known upload,
/// e.g. after resending a missing chunk or after a storage failure.
pub async fn merge_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    uploader: Uploader,
    Json(req): Json<MergeRequest>,
) -> Result<Response, AppError> {
    let ctx = MergeContext {
        file_name: req.file_name,
        details: req.details,
        uploader,
    };

    Ok(match state.uploads.merge(upload_id.clone(), ctx).await? {
        MergeOutcome::Merged(record) => merged_response(&record),
        MergeOutcome::InProgress => in_progress_response(&upload_id),
    })
}

fn merged_response(record: &crate::models::file_record::UploadedFileRecord) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "message": "Files uploaded successfully.",
            "id": record.id,
            "fileName": record.file_name,
            "sizeBytes": record.size_bytes,
        })),
    )
        .into_response()
}

fn in_progress_response(upload_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Merge already in progress.",
            "uploadId": upload_id,
        })),
    )
        .into_response()
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field.text().await.map_err(multipart_error)
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("missing field `{}`", name)))
}

fn parse_count(value: String, name: &str) -> Result<u32, AppError> {
    value
        .parse::<u32>()
        .map_err(|_| AppError::bad_request(format!("`{}` must be a non-negative integer, got `{}`", name, value)))
}
