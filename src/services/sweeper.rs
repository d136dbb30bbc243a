//! Background reclamation of abandoned uploads.

use crate::services::upload_service::UploadService;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Timing of the periodic sweep.
#[derive(Clone, Copy, Debug)]
pub struct SweepSchedule {
    pub interval: Duration,
    pub session_ttl: Duration,
    pub completed_retention: Duration,
}

/// Spawn a task that calls [`UploadService::sweep_expired`] every
/// `schedule.interval`, starting with an immediate pass so staging
/// directories left by a previous run are reclaimed early.
pub fn spawn_sweeper(uploads: UploadService, schedule: SweepSchedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = uploads
                .sweep_expired(schedule.session_ttl, schedule.completed_retention)
                .await;
            tracing::debug!(removed, "sweep pass finished");
        }
    })
}
