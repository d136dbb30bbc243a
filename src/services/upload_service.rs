//! src/services/upload_service.rs
//!
//! UploadService: the entry point for chunk reception. It stages each chunk,
//! records it in the session registry and, when the registry reports the set
//! complete, hands the upload to the merge engine. It also owns the periodic
//! reclamation of abandoned uploads.

use crate::{
    models::{
        file_record::UploadedFileRecord,
        upload::{ChunkUpload, MergeContext},
    },
    services::{
        chunk_store::ChunkStore,
        merge_engine::{MergeEngine, MergeOutcome},
        session_registry::{Admission, Completion, SessionRegistry},
    },
};
use chrono::{DateTime, Utc};
use std::{io, path::PathBuf, time::Duration, time::SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("invalid upload id `{0}`")]
    InvalidUploadId(String),
    #[error("upload `{0}` not found")]
    SessionNotFound(String),
    #[error("Chunk {index} is missing. File: {}", .path.display())]
    IncompleteUpload { index: u32, path: PathBuf },
    #[error("merge failed: {0}")]
    MergeIo(#[source] io::Error),
    #[error("file merged to {} but its record could not be written: {reason}", .path.display())]
    MetadataWriteFailure { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// What the client gets back for one chunk.
#[derive(Debug)]
pub enum ChunkReceipt {
    /// Staged; more chunks are expected.
    Stored {
        received_chunks: usize,
        total_chunks: u32,
    },
    /// This chunk completed the set and the file is merged and recorded.
    Merged(UploadedFileRecord),
    /// Another request is merging this upload right now.
    MergeInProgress,
}

#[derive(Clone)]
pub struct UploadService {
    pub chunks: ChunkStore,
    pub registry: SessionRegistry,
    pub merger: MergeEngine,
}

impl UploadService {
    pub fn new(chunks: ChunkStore, registry: SessionRegistry, merger: MergeEngine) -> Self {
        Self {
            chunks,
            registry,
            merger,
        }
    }

    /// Stage one chunk and merge if it completes the upload.
    ///
    /// `ctx` only matters when this chunk triggers the merge; its descriptive
    /// fields are the ones recorded.
    pub async fn receive_chunk(&self, chunk: ChunkUpload, ctx: MergeContext) -> UploadResult<ChunkReceipt> {
        ChunkStore::ensure_upload_id_safe(&chunk.upload_id)?;

        match self
            .registry
            .admit(&chunk.upload_id, chunk.chunk_index, chunk.total_chunks)?
        {
            Admission::Accept => {}
            Admission::Merging => {
                debug!(upload_id = %chunk.upload_id, "chunk arrived during merge; ignored");
                return Ok(ChunkReceipt::MergeInProgress);
            }
            Admission::Completed(completion) => {
                debug!(upload_id = %chunk.upload_id, "chunk arrived after completion");
                return completion_outcome(completion).map(ChunkReceipt::from);
            }
        }

        self.chunks
            .put_chunk(&chunk.upload_id, chunk.chunk_index, &chunk.bytes)
            .await?;

        let complete =
            self.registry
                .record_received(&chunk.upload_id, chunk.chunk_index, chunk.total_chunks)?;
        if !complete {
            let received_chunks = self
                .registry
                .status(&chunk.upload_id)
                .map(|status| status.received_chunks)
                .unwrap_or(1);
            return Ok(ChunkReceipt::Stored {
                received_chunks,
                total_chunks: chunk.total_chunks,
            });
        }

        info!(
            upload_id = %chunk.upload_id,
            total_chunks = chunk.total_chunks,
            "all chunks received; merging"
        );
        self.merge(chunk.upload_id, ctx).await.map(ChunkReceipt::from)
    }

    /// Run a merge attempt for `upload_id`.
    ///
    /// The merge runs on its own task so it finishes, and resolves the session
    /// state, even if the requesting connection goes away.
    pub async fn merge(&self, upload_id: String, ctx: MergeContext) -> UploadResult<MergeOutcome> {
        ChunkStore::ensure_upload_id_safe(&upload_id)?;

        let engine = self.merger.clone();
        tokio::spawn(async move { engine.merge_if_ready(&upload_id, &ctx).await })
            .await
            .map_err(|err| UploadError::MergeIo(io::Error::other(err)))?
    }

    /// Reclaim abandoned uploads and return how many were removed.
    ///
    /// Drops registry sessions idle past `session_ttl` (completed ones past
    /// `completed_retention`) together with their staged chunks, then removes
    /// staging directories no session knows about, such as those left by a
    /// previous process. Each directory is detached while its registry entry
    /// is held, so a chunk arriving mid-sweep starts a new session in a new
    /// directory and is never deleted with the old one.
    pub async fn sweep_expired(&self, session_ttl: Duration, completed_retention: Duration) -> usize {
        let now = Utc::now();
        let mut detached = Vec::new();
        let expired = self.registry.take_expired(
            cutoff(now, session_ttl),
            cutoff(now, completed_retention),
            |upload_id| match self.chunks.detach_upload(upload_id) {
                Ok(Some(path)) => detached.push(path),
                Ok(None) => {}
                Err(err) => warn!(upload_id = %upload_id, "failed to detach staged chunks: {}", err),
            },
        );
        let mut removed = expired.len();

        let stale_cutoff = SystemTime::now()
            .checked_sub(session_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        match self.chunks.stale_uploads(stale_cutoff).await {
            Ok(stale) => {
                for upload_id in &stale {
                    let outcome = self
                        .registry
                        .run_if_untracked(upload_id, || self.chunks.detach_upload(upload_id));
                    match outcome {
                        None | Some(Ok(None)) => {}
                        Some(Ok(Some(path))) => {
                            detached.push(path);
                            removed += 1;
                        }
                        Some(Err(err)) => {
                            warn!(upload_id = %upload_id, "failed to detach stale staging dir: {}", err)
                        }
                    }
                }
            }
            Err(err) => warn!("failed to scan staging area: {}", err),
        }

        match self.chunks.leftover_detached().await {
            Ok(leftovers) => {
                for path in leftovers {
                    if !detached.contains(&path) {
                        detached.push(path);
                    }
                }
            }
            Err(err) => warn!("failed to scan for leftover reclaimed dirs: {}", err),
        }
        for path in &detached {
            if let Err(err) = self.chunks.remove_detached(path).await {
                warn!("failed to remove {}: {}", path.display(), err);
            }
        }

        if removed > 0 {
            info!(removed, "swept abandoned uploads");
        }
        removed
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Replay a remembered completion as the result of a new request.
pub(crate) fn completion_outcome(completion: Completion) -> UploadResult<MergeOutcome> {
    match completion {
        Completion::Recorded(record) => Ok(MergeOutcome::Merged(record)),
        Completion::Orphaned { path, reason } => {
            Err(UploadError::MetadataWriteFailure { path, reason })
        }
    }
}

impl From<MergeOutcome> for ChunkReceipt {
    fn from(outcome: MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Merged(record) => ChunkReceipt::Merged(record),
            MergeOutcome::InProgress => ChunkReceipt::MergeInProgress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::upload::{UploadDetails, Uploader},
        services::metadata_recorder::SqliteMetadataRecorder,
    };
    use crate::services::session_registry::MergePermit;
    use bytes::Bytes;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        service: UploadService,
        files_dir: PathBuf,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let files_dir = dir.path().join("files");
        let chunks = ChunkStore::new(dir.path().join("staging"));
        let registry = SessionRegistry::new();
        let recorder = Arc::new(SqliteMetadataRecorder::new(Arc::new(memory_pool().await)));
        let merger = MergeEngine::new(chunks.clone(), registry.clone(), recorder, &files_dir);
        Harness {
            _dir: dir,
            service: UploadService::new(chunks, registry, merger),
            files_dir,
        }
    }

    fn chunk(upload_id: &str, index: u32, total: u32, bytes: &'static [u8]) -> ChunkUpload {
        ChunkUpload {
            upload_id: upload_id.into(),
            chunk_index: index,
            total_chunks: total,
            bytes: Bytes::from_static(bytes),
        }
    }

    fn ctx(file_name: &str) -> MergeContext {
        MergeContext {
            file_name: file_name.into(),
            details: UploadDetails::default(),
            uploader: Uploader {
                id: "7".into(),
                ..Uploader::default()
            },
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_merge_in_index_order() {
        let h = harness().await;

        let r = h.service.receive_chunk(chunk("u1", 1, 3, b"B"), ctx("a.txt")).await.unwrap();
        assert!(matches!(r, ChunkReceipt::Stored { received_chunks: 1, total_chunks: 3 }));
        let r = h.service.receive_chunk(chunk("u1", 0, 3, b"A"), ctx("a.txt")).await.unwrap();
        assert!(matches!(r, ChunkReceipt::Stored { received_chunks: 2, .. }));
        let r = h.service.receive_chunk(chunk("u1", 2, 3, b"C"), ctx("a.txt")).await.unwrap();

        let ChunkReceipt::Merged(record) = r else {
            panic!("expected merge");
        };
        assert!(record.file_name.ends_with(".txt"));
        assert!(!record.file_name.contains("u1"));
        assert_eq!(std::fs::read(h.files_dir.join(&record.file_name)).unwrap(), b"ABC");
        assert!(!h.service.chunks.upload_dir("u1").exists());
    }

    #[tokio::test]
    async fn retransmission_before_merge_later_bytes_win() {
        let h = harness().await;

        h.service.receive_chunk(chunk("r1", 0, 2, b"old"), ctx("r.bin")).await.unwrap();
        let r = h.service.receive_chunk(chunk("r1", 0, 2, b"new"), ctx("r.bin")).await.unwrap();
        assert!(matches!(r, ChunkReceipt::Stored { received_chunks: 1, .. }));

        let r = h.service.receive_chunk(chunk("r1", 1, 2, b"!"), ctx("r.bin")).await.unwrap();
        let ChunkReceipt::Merged(record) = r else {
            panic!("expected merge");
        };
        assert_eq!(std::fs::read(&record.storage_path).unwrap(), b"new!");
    }

    #[tokio::test]
    async fn late_duplicate_gets_the_same_result() {
        let h = harness().await;
        h.service.receive_chunk(chunk("d1", 0, 1, b"x"), ctx("d.bin")).await.unwrap();

        let again = h.service.receive_chunk(chunk("d1", 0, 1, b"x"), ctx("d.bin")).await.unwrap();
        let ChunkReceipt::Merged(record) = again else {
            panic!("expected replayed merge");
        };
        assert_eq!(std::fs::read_dir(&h.files_dir).unwrap().count(), 1);
        assert!(h.files_dir.join(record.file_name).exists());
        assert!(!h.service.chunks.upload_dir("d1").exists());
    }

    #[tokio::test]
    async fn invalid_chunks_are_rejected_without_staging() {
        let h = harness().await;

        let err = h.service.receive_chunk(chunk("../x", 0, 1, b"x"), ctx("x")).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidUploadId(_)));

        let err = h.service.receive_chunk(chunk("bad", 2, 2, b"x"), ctx("x")).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidChunk(_)));

        h.service.receive_chunk(chunk("bad", 0, 2, b"x"), ctx("x")).await.unwrap();
        let err = h.service.receive_chunk(chunk("bad", 1, 3, b"y"), ctx("x")).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidChunk(_)));
        assert!(!h.service.chunks.chunk_exists("bad", 1).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_sessions_and_unknown_staging_dirs() {
        let h = harness().await;
        h.service.receive_chunk(chunk("idle", 0, 3, b"x"), ctx("x")).await.unwrap();
        h.service.chunks.put_chunk("leftover", 0, b"y").await.unwrap();

        // nothing is old enough yet
        assert_eq!(h.service.sweep_expired(Duration::from_secs(3600), Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = h.service.sweep_expired(Duration::ZERO, Duration::ZERO).await;
        assert_eq!(removed, 2);
        assert!(!h.service.registry.contains("idle"));
        assert!(!h.service.chunks.upload_dir("idle").exists());
        assert!(!h.service.chunks.upload_dir("leftover").exists());

        // the swept id starts over cleanly with its next chunk
        let r = h.service.receive_chunk(chunk("idle", 0, 1, b"z"), ctx("z.bin")).await.unwrap();
        let ChunkReceipt::Merged(record) = r else {
            panic!("expected merge");
        };
        assert_eq!(std::fs::read(&record.storage_path).unwrap(), b"z");
    }

    #[tokio::test]
    async fn sweep_leaves_tracked_staging_dirs_alone() {
        let h = harness().await;
        h.service.chunks.put_chunk("busy", 0, b"a").await.unwrap();
        h.service.registry.record_received("busy", 0, 2).unwrap();
        let MergePermit::Granted(guard) = h.service.registry.try_begin_merge("busy").unwrap() else {
            panic!("expected permit");
        };

        let orphan = h.service.chunks.base_path.join(".reclaim-interrupted");
        std::fs::create_dir_all(orphan.join("chunk_0")).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.service.sweep_expired(Duration::ZERO, Duration::ZERO).await, 0);
        assert!(h.service.chunks.chunk_exists("busy", 0).await.unwrap());
        assert!(!orphan.exists());
        guard.fail();
    }
}
