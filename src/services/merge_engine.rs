//! src/services/merge_engine.rs
//!
//! MergeEngine: turns a complete set of staged chunks into one durable file.
//!
//! The registry only says *when* to try; before writing anything the engine
//! re-reads the staging directory, because a chunk write and its registry
//! update are two separate steps. Output is written to a temporary file in
//! the storage directory, fsynced and renamed, so a merged file either exists
//! completely or not at all.

use crate::{
    models::{file_record::UploadedFileRecord, upload::MergeContext},
    services::{
        chunk_store::ChunkStore,
        metadata_recorder::{MergedFile, MetadataRecorder},
        session_registry::{Completion, MergePermit, SessionRegistry},
        upload_service::{UploadError, UploadResult, completion_outcome},
    },
};
use std::{io, path::Path, path::PathBuf, sync::Arc};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{error, info, warn};
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a merge attempt that did not fail.
#[derive(Debug)]
pub enum MergeOutcome {
    /// Merged and recorded, by this call or by an earlier one.
    Merged(UploadedFileRecord),
    /// Another task holds the merge permit.
    InProgress,
}

#[derive(Clone)]
pub struct MergeEngine {
    chunks: ChunkStore,
    registry: SessionRegistry,
    recorder: Arc<dyn MetadataRecorder>,
    /// Directory receiving merged files.
    output_dir: PathBuf,
}

impl MergeEngine {
    pub fn new(
        chunks: ChunkStore,
        registry: SessionRegistry,
        recorder: Arc<dyn MetadataRecorder>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            chunks,
            registry,
            recorder,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Merge `upload_id` if this call wins the permit.
    ///
    /// - missing chunk: session Failed, `IncompleteUpload` for the lowest
    ///   missing index, nothing deleted
    /// - I/O failure while concatenating: partial output removed, chunks
    ///   kept, session Failed, `MergeIo`
    /// - metadata failure: merged file kept on disk, `MetadataWriteFailure`
    pub async fn merge_if_ready(&self, upload_id: &str, ctx: &MergeContext) -> UploadResult<MergeOutcome> {
        let guard = match self.registry.try_begin_merge(upload_id)? {
            MergePermit::Granted(guard) => guard,
            MergePermit::AlreadyInProgress => {
                info!(upload_id, "merge already in progress");
                return Ok(MergeOutcome::InProgress);
            }
            MergePermit::AlreadyCompleted(completion) => {
                info!(upload_id, "upload already merged");
                return completion_outcome(completion);
            }
        };
        let total_chunks = guard.total_chunks();

        let missing = match self.chunks.first_missing(upload_id, total_chunks).await {
            Ok(missing) => missing,
            Err(err) => {
                guard.fail();
                error!(upload_id, "could not verify staged chunks: {}", err);
                return Err(UploadError::MergeIo(err));
            }
        };
        if let Some(index) = missing {
            guard.fail();
            let path = self.chunks.chunk_path(upload_id, index);
            warn!(
                upload_id,
                index,
                "cannot merge, chunk {} is missing",
                path.display()
            );
            return Err(UploadError::IncompleteUpload { index, path });
        }

        let merged = match self.concatenate(upload_id, total_chunks, ctx).await {
            Ok(merged) => merged,
            Err(err) => {
                guard.fail();
                error!(upload_id, "merge failed, staged chunks kept for retry: {}", err);
                return Err(UploadError::MergeIo(err));
            }
        };
        info!(
            upload_id,
            file_name = %merged.file_name,
            size_bytes = merged.size_bytes,
            "merged {} chunks",
            total_chunks
        );

        // The output is durable now; staged copies are no longer needed.
        if let Err(err) = self.chunks.discard_upload(upload_id).await {
            warn!(upload_id, "merged, but staged chunks could not be removed: {}", err);
        }

        match self.recorder.record(&merged, ctx).await {
            Ok(record) => {
                guard.complete(Completion::Recorded(record.clone()));
                Ok(MergeOutcome::Merged(record))
            }
            Err(err) => {
                let reason = err.to_string();
                error!(
                    upload_id,
                    path = %merged.storage_path.display(),
                    "merged file left unindexed: {}",
                    reason
                );
                guard.complete(Completion::Orphaned {
                    path: merged.storage_path.clone(),
                    reason: reason.clone(),
                });
                Err(UploadError::MetadataWriteFailure {
                    path: merged.storage_path,
                    reason,
                })
            }
        }
    }

    /// Append every chunk in ascending index order into a fresh output file.
    async fn concatenate(&self, upload_id: &str, total_chunks: u32, ctx: &MergeContext) -> io::Result<MergedFile> {
        fs::create_dir_all(&self.output_dir).await?;

        let file_id = Uuid::new_v4();
        let file_name = format!("{}{}", file_id, ctx.extension());
        let final_path = self.output_dir.join(&file_name);
        let tmp_path = self.output_dir.join(format!(".tmp-{}", file_id));

        let (size_bytes, etag) = match self.write_output(upload_id, total_chunks, &tmp_path).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(MergedFile {
            file_name,
            storage_path: final_path,
            size_bytes,
            etag,
        })
    }

    async fn write_output(&self, upload_id: &str, total_chunks: u32, path: &Path) -> io::Result<(i64, String)> {
        let mut output = File::create(path).await?;
        let mut digest = md5::Context::new();
        let mut size_bytes: i64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        for index in 0..total_chunks {
            let mut chunk = self.chunks.open_chunk(upload_id, index).await?;
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                output.write_all(&buf[..n]).await?;
                size_bytes += n as i64;
            }
        }

        output.flush().await?;
        output.sync_all().await?;
        Ok((size_bytes, format!("{:x}", digest.compute())))
    }
}
