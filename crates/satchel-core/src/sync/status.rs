//! Read model surfaced to UI/host code.

use serde::Serialize;

use crate::db::{
    Database, LibSqlMetaRepository, LibSqlSubmissionRepository, MetaRepository,
    SubmissionRepository,
};
use crate::error::Result;
use crate::models::{SubmissionRecord, SubmissionStatus};

use super::engine::LAST_SYNCED_AT_KEY;

/// Aggregate queue state observed by hosts.
///
/// A thin projection recomputed from the store on demand; never cached.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Records still owed to the server: pending, failed, and conflicted
    pub pending_count: u64,
    /// Records awaiting an explicit conflict decision
    pub conflict_count: u64,
    /// The conflicted records themselves
    pub conflicts: Vec<SubmissionRecord>,
    /// Completion time of the last sync run (Unix ms)
    pub last_synced_at: Option<i64>,
    pub is_online: bool,
    pub is_syncing: bool,
}

impl SyncStatus {
    /// Project the current queue state out of the store
    pub async fn read(db: &Database, is_online: bool, is_syncing: bool) -> Result<Self> {
        let repo = LibSqlSubmissionRepository::new(db.connection());
        let pending_count = repo
            .count_by_status(&[
                SubmissionStatus::Pending,
                SubmissionStatus::Failed,
                SubmissionStatus::VersionConflict,
            ])
            .await?;
        let conflicts = repo
            .list_by_status(&[SubmissionStatus::VersionConflict])
            .await?;

        let meta = LibSqlMetaRepository::new(db.connection());
        let last_synced_at = meta
            .get(LAST_SYNCED_AT_KEY)
            .await?
            .and_then(|value| value.parse().ok());

        Ok(Self {
            pending_count,
            conflict_count: conflicts.len() as u64,
            conflicts,
            last_synced_at,
            is_online,
            is_syncing,
        })
    }
}
