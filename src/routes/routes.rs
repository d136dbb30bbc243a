//! Defines routes for chunk uploads and the file catalog.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /api/uploads/chunks`: upload one chunk (multipart)
//!   - `POST   /api/uploads/{upload_id}/merge`: retry the merge of an upload
//!
//! - **Catalog endpoints**
//!   - `GET    /api/files`: list files (patientName, productName, description,
//!     uploaderId, organizationId, uploadStartDate, uploadEndDate)
//!   - `GET    /api/files/{id}`: file metadata
//!   - `DELETE /api/files/{id}`: soft-delete file
//!   - `GET    /api/files/{id}/download`: download file

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, get_file, list_files},
        health_handlers::{healthz, readyz},
        upload_handlers::{merge_upload, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all routes.
///
/// `max_chunk_bytes` bounds the body of a single chunk request; the other
/// routes keep axum's default limit.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route(
            "/api/uploads/chunks",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/api/uploads/{upload_id}/merge", post(merge_upload))
        // Catalog routes
        .route("/api/files", get(list_files))
        .route("/api/files/{id}", get(get_file).delete(delete_file))
        .route("/api/files/{id}/download", get(download_file))
}
