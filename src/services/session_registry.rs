//! src/services/session_registry.rs
//!
//! SessionRegistry: process-wide, in-memory state of every upload in flight.
//! Sessions live in a sharded `DashMap`, so two different upload ids never
//! contend on the same lock and no lock is ever held across an `.await`.
//!
//! The registry answers two separate questions:
//! - `record_received`: has the chunk set just become complete? This is only
//!   a hint used to trigger a merge.
//! - `try_begin_merge`: who merges? An atomic Open/Failed → Merging
//!   transition, handed out as a [`MergeGuard`].

use crate::{
    models::{file_record::UploadedFileRecord, upload::MergeState},
    services::upload_service::{UploadError, UploadResult},
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tracing::{debug, warn};

/// Final outcome of a finished merge, remembered so late duplicates of the
/// completing chunk receive the same answer.
#[derive(Clone, Debug)]
pub enum Completion {
    /// Merged and indexed.
    Recorded(UploadedFileRecord),
    /// Merged, but the metadata write failed; the file is on disk unindexed.
    Orphaned { path: PathBuf, reason: String },
}

/// Session state as seen by an arriving chunk.
#[derive(Clone, Debug)]
pub enum Admission {
    /// Chunk may be staged (session is Open or Failed).
    Accept,
    /// A merge is running; the chunk is not needed.
    Merging,
    /// The upload already finished.
    Completed(Completion),
}

/// Result of asking for the right to merge.
#[derive(Debug)]
pub enum MergePermit {
    Granted(MergeGuard),
    AlreadyInProgress,
    AlreadyCompleted(Completion),
}

/// Point-in-time view of one session.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub total_chunks: u32,
    pub received_chunks: usize,
    pub state: MergeState,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct UploadSession {
    total_chunks: u32,
    received: HashSet<u32>,
    state: MergeState,
    /// Cleared once completion has been reported; re-armed on failure so a
    /// retransmitted final chunk can trigger a retry.
    trigger_armed: bool,
    completion: Option<Completion>,
    last_activity: DateTime<Utc>,
}

impl UploadSession {
    fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            received: HashSet::new(),
            state: MergeState::Open,
            trigger_armed: true,
            completion: None,
            last_activity: Utc::now(),
        }
    }

    fn check_total(&self, upload_id: &str, total_chunks: u32) -> UploadResult<()> {
        if self.total_chunks != total_chunks {
            return Err(UploadError::InvalidChunk(format!(
                "upload `{}` declared {} chunks, got {}",
                upload_id, self.total_chunks, total_chunks
            )));
        }
        Ok(())
    }
}

/// Largest `totalChunks` accepted unless configured otherwise.
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 100_000;

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, UploadSession>>,
    max_total_chunks: u32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_max_total_chunks(DEFAULT_MAX_TOTAL_CHUNKS)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry rejecting uploads that declare more than `max_total_chunks`.
    pub fn with_max_total_chunks(max_total_chunks: u32) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            max_total_chunks: max_total_chunks.max(1),
        }
    }

    /// Validate a chunk's coordinates and find out whether it should be staged.
    ///
    /// Creates the session on first contact. A `total_chunks` that disagrees
    /// with the first chunk's value is rejected.
    pub fn admit(&self, upload_id: &str, chunk_index: u32, total_chunks: u32) -> UploadResult<Admission> {
        self.validate_coordinates(chunk_index, total_chunks)?;

        let mut session = self
            .sessions
            .entry(upload_id.to_string())
            .or_insert_with(|| UploadSession::new(total_chunks));
        session.check_total(upload_id, total_chunks)?;
        session.last_activity = Utc::now();

        Ok(match session.state {
            MergeState::Open | MergeState::Failed => Admission::Accept,
            MergeState::Merging => Admission::Merging,
            MergeState::Completed => match &session.completion {
                Some(completion) => Admission::Completed(completion.clone()),
                None => Admission::Merging,
            },
        })
    }

    /// Mark `chunk_index` as received.
    ///
    /// Returns true exactly once per attempt: on the call that makes the set
    /// of distinct indices complete while the session is Open, or on the first
    /// complete observation after a failed merge.
    pub fn record_received(&self, upload_id: &str, chunk_index: u32, total_chunks: u32) -> UploadResult<bool> {
        self.validate_coordinates(chunk_index, total_chunks)?;

        let mut session = self
            .sessions
            .entry(upload_id.to_string())
            .or_insert_with(|| UploadSession::new(total_chunks));
        session.check_total(upload_id, total_chunks)?;
        session.last_activity = Utc::now();
        session.received.insert(chunk_index);

        let complete = session.received.len() as u64 == u64::from(session.total_chunks);
        let eligible = matches!(session.state, MergeState::Open | MergeState::Failed);
        if complete && eligible && session.trigger_armed {
            session.trigger_armed = false;
            debug!(upload_id, total_chunks, "chunk set complete");
            return Ok(true);
        }
        Ok(false)
    }

    /// Atomically claim the merge for `upload_id`.
    pub fn try_begin_merge(&self, upload_id: &str) -> UploadResult<MergePermit> {
        let mut session = self
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))?;

        match session.state {
            MergeState::Open | MergeState::Failed => {
                session.state = MergeState::Merging;
                session.trigger_armed = false;
                session.last_activity = Utc::now();
                Ok(MergePermit::Granted(MergeGuard {
                    registry: self.clone(),
                    upload_id: upload_id.to_string(),
                    total_chunks: session.total_chunks,
                    resolved: false,
                }))
            }
            MergeState::Merging => Ok(MergePermit::AlreadyInProgress),
            MergeState::Completed => Ok(match &session.completion {
                Some(completion) => MergePermit::AlreadyCompleted(completion.clone()),
                None => MergePermit::AlreadyInProgress,
            }),
        }
    }

    pub fn mark_completed(&self, upload_id: &str, completion: Completion) {
        if let Some(mut session) = self.sessions.get_mut(upload_id) {
            session.state = MergeState::Completed;
            session.completion = Some(completion);
            session.trigger_armed = false;
            session.last_activity = Utc::now();
        }
    }

    pub fn mark_failed(&self, upload_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(upload_id) {
            session.state = MergeState::Failed;
            session.trigger_armed = true;
            session.last_activity = Utc::now();
        }
    }

    pub fn status(&self, upload_id: &str) -> Option<SessionStatus> {
        self.sessions.get(upload_id).map(|session| SessionStatus {
            total_chunks: session.total_chunks,
            received_chunks: session.received.len(),
            state: session.state,
            last_activity: session.last_activity,
        })
    }

    pub fn contains(&self, upload_id: &str) -> bool {
        self.sessions.contains_key(upload_id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions that have gone quiet and return their ids.
    ///
    /// Completed sessions go once older than `completed_cutoff`, open and
    /// failed ones once older than `idle_cutoff`. A running merge is never
    /// interrupted. `on_expired` runs for each dropped session while its
    /// shard is still locked, so no chunk for that id is admitted until it
    /// returns; keep it short and non-blocking apart from a rename.
    pub fn take_expired<F>(
        &self,
        idle_cutoff: DateTime<Utc>,
        completed_cutoff: DateTime<Utc>,
        mut on_expired: F,
    ) -> Vec<String>
    where
        F: FnMut(&str),
    {
        let mut expired = Vec::new();
        self.sessions.retain(|upload_id, session| {
            let keep = match session.state {
                MergeState::Merging => true,
                MergeState::Completed => session.last_activity >= completed_cutoff,
                MergeState::Open | MergeState::Failed => session.last_activity >= idle_cutoff,
            };
            if !keep {
                on_expired(upload_id);
                expired.push(upload_id.clone());
            }
            keep
        });
        expired
    }

    /// Run `f` only if no session exists for `upload_id`, holding that key's
    /// shard so a session cannot appear while `f` runs.
    pub fn run_if_untracked<T>(&self, upload_id: &str, f: impl FnOnce() -> T) -> Option<T> {
        match self.sessions.entry(upload_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(_vacant) => Some(f()),
        }
    }

    /// Forget a session unless it is currently merging.
    pub fn remove(&self, upload_id: &str) -> bool {
        match self.sessions.entry(upload_id.to_string()) {
            Entry::Occupied(entry) if entry.get().state != MergeState::Merging => {
                entry.remove();
                true
            }
            _ => false,
        }
    }
}

impl SessionRegistry {
    fn validate_coordinates(&self, chunk_index: u32, total_chunks: u32) -> UploadResult<()> {
        if total_chunks == 0 {
            return Err(UploadError::InvalidChunk("totalChunks must be greater than 0".into()));
        }
        if total_chunks > self.max_total_chunks {
            return Err(UploadError::InvalidChunk(format!(
                "totalChunks {} exceeds the limit of {}",
                total_chunks, self.max_total_chunks
            )));
        }
        if chunk_index >= total_chunks {
            return Err(UploadError::InvalidChunk(format!(
                "chunkIndex {} is outside 0..{}",
                chunk_index, total_chunks
            )));
        }
        Ok(())
    }
}

/// Exclusive right to merge one upload.
///
/// Resolve it with [`MergeGuard::complete`] or [`MergeGuard::fail`]. Dropping
/// an unresolved guard marks the session Failed so it can be retried.
#[derive(Debug)]
pub struct MergeGuard {
    registry: SessionRegistry,
    upload_id: String,
    total_chunks: u32,
    resolved: bool,
}

impl MergeGuard {
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn complete(mut self, completion: Completion) {
        self.resolved = true;
        self.registry.mark_completed(&self.upload_id, completion);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.registry.mark_failed(&self.upload_id);
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(upload_id = %self.upload_id, "merge ended without an outcome; marking failed");
            self.registry.mark_failed(&self.upload_id);
        }
    }
}
