//! src/services/chunk_store.rs
//!
//! ChunkStore: staging area for chunk payloads on local disk. Each upload
//! gets its own directory beneath `base_path/{upload_id}/` and each chunk is a
//! single file `chunk_{index}` inside it. The store knows nothing about
//! session state or merging; it only reads, writes and removes chunk files.

use crate::services::upload_service::{UploadError, UploadResult};
use futures::{StreamExt, pin_mut, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_UPLOAD_ID_LEN: usize = 128;

/// How many chunk existence checks run at once during verification.
const VERIFY_CONCURRENCY: usize = 16;

/// Name prefix of staging directories detached for removal by the sweeper.
const RECLAIM_PREFIX: &str = ".reclaim-";

#[derive(Clone, Debug)]
pub struct ChunkStore {
    /// Root of the staging area.
    pub base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject upload ids that could escape the staging directory.
    ///
    /// Only ASCII letters, digits, `-` and `_` are accepted, so an id is
    /// always a single plain path component.
    pub fn ensure_upload_id_safe(upload_id: &str) -> UploadResult<()> {
        if upload_id.is_empty() || upload_id.len() > MAX_UPLOAD_ID_LEN {
            return Err(UploadError::InvalidUploadId(upload_id.to_string()));
        }
        if !upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(UploadError::InvalidUploadId(upload_id.to_string()));
        }
        Ok(())
    }

    /// Directory holding every staged chunk of one upload.
    pub fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(upload_id)
    }

    /// Location of one staged chunk. Does not check for existence.
    pub fn chunk_path(&self, upload_id: &str, chunk_index: u32) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("chunk_{}", chunk_index))
    }

    /// Write one chunk, replacing whatever was staged for the same index.
    ///
    /// Bytes land in a temporary sibling first and are renamed into place, so
    /// a reader never sees a partially written chunk.
    pub async fn put_chunk(&self, upload_id: &str, chunk_index: u32, bytes: &[u8]) -> UploadResult<()> {
        Self::ensure_upload_id_safe(upload_id)?;

        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let final_path = self.chunk_path(upload_id, chunk_index);
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        debug!(
            upload_id,
            chunk_index,
            size = bytes.len(),
            "staged chunk at {}",
            final_path.display()
        );
        Ok(())
    }

    /// Whether a chunk file is currently staged.
    pub async fn chunk_exists(&self, upload_id: &str, chunk_index: u32) -> io::Result<bool> {
        match fs::metadata(self.chunk_path(upload_id, chunk_index)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Lowest index in `0..total_chunks` with no staged file, if any.
    ///
    /// Reads the filesystem directly; this is the ground truth at merge time.
    /// Stops at the first gap, so the cost is bounded by the chunks actually
    /// staged rather than by the declared total.
    pub async fn first_missing(&self, upload_id: &str, total_chunks: u32) -> io::Result<Option<u32>> {
        let checks = stream::iter(0..total_chunks)
            .map(|index| async move {
                self.chunk_exists(upload_id, index)
                    .await
                    .map(|exists| (index, exists))
            })
            .buffered(VERIFY_CONCURRENCY);
        pin_mut!(checks);

        while let Some(check) = checks.next().await {
            let (index, exists) = check?;
            if !exists {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Open a staged chunk for reading.
    pub async fn open_chunk(&self, upload_id: &str, chunk_index: u32) -> io::Result<File> {
        File::open(self.chunk_path(upload_id, chunk_index)).await
    }

    /// Remove one staged chunk. A chunk that is already gone is not an error.
    pub async fn remove_chunk(&self, upload_id: &str, chunk_index: u32) -> io::Result<()> {
        match fs::remove_file(self.chunk_path(upload_id, chunk_index)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Remove the whole staging directory of an upload, including stray temp
    /// files left by interrupted writes.
    pub async fn discard_upload(&self, upload_id: &str) -> io::Result<()> {
        Self::ensure_upload_id_safe(upload_id)
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(_) => {
                debug!(upload_id, "discarded staging directory");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Move an upload's staging directory out of the way under a fresh
    /// `.reclaim-<uuid>` name and return where it went.
    ///
    /// Synchronous so it can run while the caller holds the registry entry for
    /// `upload_id`. A chunk admitted after the rename starts a new directory
    /// that the pending removal never touches.
    pub fn detach_upload(&self, upload_id: &str) -> io::Result<Option<PathBuf>> {
        Self::ensure_upload_id_safe(upload_id)
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
        let detached = self
            .base_path
            .join(format!("{}{}", RECLAIM_PREFIX, Uuid::new_v4()));
        match std::fs::rename(self.upload_dir(upload_id), &detached) {
            Ok(_) => Ok(Some(detached)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Delete a directory returned by [`ChunkStore::detach_upload`].
    pub async fn remove_detached(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(_) => {
                debug!("removed reclaimed staging directory {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reclaimed directories whose removal never finished, e.g. because the
    /// process stopped mid-sweep.
    pub async fn leftover_detached(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut leftovers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(RECLAIM_PREFIX) {
                leftovers.push(entry.path());
            }
        }
        Ok(leftovers)
    }

    /// Upload ids whose staging directory was last modified before `cutoff`.
    pub async fn stale_uploads(&self, cutoff: SystemTime) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::ensure_upload_id_safe(&name).is_err() {
                continue;
            }
            if meta.modified()? < cutoff {
                stale.push(name);
            }
        }
        Ok(stale)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
