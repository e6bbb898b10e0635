//! Terminal user decisions for version-conflicted submissions.

use crate::db::{LibSqlSubmissionRepository, SubmissionRepository};
use crate::error::Result;
use crate::models::SubmissionStatus;
use crate::remote::FormsRemote;

use super::engine::{SyncEngine, SyncReport};

/// Two-way decision point for every record in `VersionConflict`: deliver
/// anyway against the changed form, or drop the capture for good.
pub struct ConflictResolver<'a, R> {
    engine: &'a SyncEngine<R>,
}

impl<'a, R: FormsRemote> ConflictResolver<'a, R> {
    pub const fn new(engine: &'a SyncEngine<R>) -> Self {
        Self { engine }
    }

    /// Re-deliver every conflicted record, skipping version checks.
    ///
    /// Each record is handled independently: one failed delivery surfaces as
    /// that record returning to `Failed` and never blocks the rest of the
    /// batch. A skipped run (offline, or another run in flight) leaves every
    /// record in `VersionConflict`, so the decision is never half-applied.
    /// Returns the run report (`synced` is the count that made it).
    pub async fn force_submit(&self) -> Result<SyncReport> {
        let repo = LibSqlSubmissionRepository::new(self.engine.database().connection());
        let conflicts = repo
            .list_by_status(&[SubmissionStatus::VersionConflict])
            .await?;
        if conflicts.is_empty() {
            return Ok(SyncReport::default());
        }

        let ids: Vec<_> = conflicts.iter().map(|record| record.local_id).collect();
        tracing::info!(count = ids.len(), "force-submitting conflicted records");
        self.engine.force_sync(&ids).await
    }

    /// Permanently delete every conflicted record. Irreversible.
    pub async fn discard(&self) -> Result<u64> {
        let repo = LibSqlSubmissionRepository::new(self.engine.database().connection());
        let deleted = repo
            .delete_by_status(SubmissionStatus::VersionConflict)
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, "discarded conflicted records");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{NewSubmission, Visibility};
    use crate::remote::{RemoteError, RemoteForm, RemoteResult};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex as StdMutex};
    use uuid::Uuid;

    /// Remote that always reports a newer form version, so every normal sync
    /// run parks records as conflicts.
    #[derive(Clone, Default)]
    struct ConflictingRemote {
        fail_submit_forms: Arc<StdMutex<HashSet<String>>>,
        submitted: Arc<StdMutex<Vec<String>>>,
    }

    impl FormsRemote for ConflictingRemote {
        async fn fetch_form_version(&self, _form_id: &str) -> RemoteResult<String> {
            Ok("999.0".to_string())
        }

        async fn fetch_form(&self, form_id: &str) -> RemoteResult<RemoteForm> {
            Err(RemoteError::Api(format!("no definition for {form_id}")))
        }

        async fn submit_private(
            &self,
            form_id: &str,
            _payload: &[u8],
            _idempotency_key: Uuid,
        ) -> RemoteResult<()> {
            if self.fail_submit_forms.lock().unwrap().contains(form_id) {
                return Err(RemoteError::Api("internal server error (500)".to_string()));
            }
            self.submitted.lock().unwrap().push(form_id.to_string());
            Ok(())
        }

        async fn submit_public(
            &self,
            form_id: &str,
            payload: &[u8],
            idempotency_key: Uuid,
        ) -> RemoteResult<()> {
            self.submit_private(form_id, payload, idempotency_key).await
        }
    }

    async fn engine_with_conflicts(
        remote: ConflictingRemote,
        form_ids: &[&str],
    ) -> SyncEngine<ConflictingRemote> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let engine = SyncEngine::new(db, remote);

        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        for form_id in form_ids {
            repo.add(NewSubmission::new(
                *form_id,
                "1.0",
                b"{}".to_vec(),
                Visibility::Private,
            ))
            .await
            .unwrap();
        }

        // Every record conflicts against the always-newer remote version
        let report = engine.sync().await.unwrap();
        assert_eq!(report.conflicts, form_ids.len());
        engine
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_submit_delivers_conflicted_records() {
        let remote = ConflictingRemote::default();
        let engine = engine_with_conflicts(remote.clone(), &["form-a", "form-b"]).await;

        let resolver = ConflictResolver::new(&engine);
        let report = resolver.force_submit().await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.conflicts, 0);

        let status = engine.status().await.unwrap();
        assert_eq!(status.conflict_count, 0);
        assert_eq!(status.pending_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_submit_with_nothing_to_do() {
        let remote = ConflictingRemote::default();
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let engine = SyncEngine::new(db, remote);

        let resolver = ConflictResolver::new(&engine);
        let report = resolver.force_submit().await.unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_submit_partial_failure_does_not_block_the_batch() {
        let remote = ConflictingRemote::default();
        remote
            .fail_submit_forms
            .lock()
            .unwrap()
            .insert("form-bad".to_string());
        let engine = engine_with_conflicts(remote.clone(), &["form-bad", "form-good"]).await;

        let resolver = ConflictResolver::new(&engine);
        let report = resolver.force_submit().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(remote.submitted.lock().unwrap().as_slice(), ["form-good"]);

        // The failure stays visible instead of silently disappearing
        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        let failed = repo
            .list_by_status(&[SubmissionStatus::Failed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].form_id, "form-bad");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_submit_while_offline_leaves_conflicts_intact() {
        let remote = ConflictingRemote::default();
        let engine = engine_with_conflicts(remote.clone(), &["form-a"]).await;

        engine.set_online(false);
        let resolver = ConflictResolver::new(&engine);
        let report = resolver.force_submit().await.unwrap();
        assert!(report.skipped);
        assert!(remote.submitted.lock().unwrap().is_empty());

        // Nothing delivered, nothing demoted: the record keeps its conflict
        // state and message until a run actually claims it
        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        let conflicts = repo
            .list_by_status(&[SubmissionStatus::VersionConflict])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].error.is_some());

        engine.set_online(true);
        let report = resolver.force_submit().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(remote.submitted.lock().unwrap().as_slice(), ["form-a"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discard_removes_records_permanently() {
        let remote = ConflictingRemote::default();
        let engine = engine_with_conflicts(remote, &["form-a", "form-b"]).await;

        let resolver = ConflictResolver::new(&engine);
        let discarded = resolver.discard().await.unwrap();
        assert_eq!(discarded, 2);

        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        let remaining = repo
            .list_by_status(&[
                SubmissionStatus::Pending,
                SubmissionStatus::Syncing,
                SubmissionStatus::Synced,
                SubmissionStatus::Failed,
                SubmissionStatus::VersionConflict,
            ])
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
