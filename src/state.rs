//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        catalog_service::CatalogService, chunk_store::ChunkStore, merge_engine::MergeEngine,
        metadata_recorder::SqliteMetadataRecorder, session_registry::SessionRegistry,
        upload_service::UploadService,
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    pub uploads: UploadService,
    pub catalog: CatalogService,
}

impl AppState {
    /// Wire the upload pipeline and catalog over one pool and the configured
    /// directories.
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig) -> Self {
        let chunks = ChunkStore::new(&cfg.staging_dir);
        let registry = SessionRegistry::with_max_total_chunks(cfg.max_total_chunks);
        let recorder = Arc::new(SqliteMetadataRecorder::new(db.clone()));
        let merger = MergeEngine::new(chunks.clone(), registry.clone(), recorder, &cfg.storage_dir);

        Self {
            uploads: UploadService::new(chunks, registry, merger),
            catalog: CatalogService::new(db.clone(), cfg.purge_files_on_delete),
            db,
        }
    }
}
