//! Sync engine: drains the submission queue against the remote authority.
//!
//! One engine instance per process/session, passed by reference to any
//! consumer. At most one sync run executes at a time; a second trigger while
//! a run is in flight (or while offline) is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{
    Database, LibSqlMetaRepository, LibSqlSubmissionRepository, MetaRepository,
    SubmissionRepository,
};
use crate::error::Result;
use crate::models::{LocalId, SubmissionRecord, SubmissionStatus, Visibility};
use crate::remote::FormsRemote;

use super::status::SyncStatus;

/// Sync meta key holding the completion time of the last run.
pub const LAST_SYNCED_AT_KEY: &str = "last_synced_at";

/// Tunable engine behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-enter `Failed` records into normal sync runs.
    ///
    /// Off by default: failed records stay put until a manual or force
    /// action, so transient server trouble can't turn into a retry storm.
    pub retry_failed: bool,
}

/// Outcome of a single sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records claimed by this run
    pub attempted: usize,
    /// Records acknowledged by the server
    pub synced: usize,
    /// Records whose delivery attempt failed
    pub failed: usize,
    /// Records parked for an explicit conflict decision
    pub conflicts: usize,
    /// True when the run was a no-op (offline, or another run in flight)
    pub skipped: bool,
}

impl SyncReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Version check against the live server before delivery
    Normal,
    /// Version comparison skipped entirely; the user accepted the risk
    Force,
}

/// The state-machine driver for queued submissions.
pub struct SyncEngine<R> {
    db: Arc<Database>,
    remote: R,
    options: SyncOptions,
    is_online: AtomicBool,
    is_syncing: AtomicBool,
    run_lock: Mutex<()>,
}

impl<R: FormsRemote> SyncEngine<R> {
    pub fn new(db: Arc<Database>, remote: R) -> Self {
        Self::with_options(db, remote, SyncOptions::default())
    }

    pub fn with_options(db: Arc<Database>, remote: R, options: SyncOptions) -> Self {
        Self {
            db,
            remote,
            options,
            is_online: AtomicBool::new(true),
            is_syncing: AtomicBool::new(false),
            run_lock: Mutex::new(()),
        }
    }

    /// The engine's backing store, shared with the conflict resolver
    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn set_online(&self, online: bool) {
        self.is_online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Startup recovery: a record left `Syncing` by an interrupted run is
    /// indeterminate, so reset it to `Pending` and let the idempotency key
    /// deduplicate a possible redelivery on the server side.
    pub async fn recover(&self) -> Result<u64> {
        let repo = LibSqlSubmissionRepository::new(self.db.connection());
        let reset = repo.reset_in_flight().await?;
        if reset > 0 {
            tracing::warn!(reset, "re-queued submissions left in flight by a previous run");
        }
        Ok(reset)
    }

    /// Run one normal sync: claim pending records, check their captured form
    /// versions against the server, and deliver the safe ones.
    pub async fn sync(&self) -> Result<SyncReport> {
        if !self.is_online() {
            tracing::debug!("sync requested while offline, skipping");
            return Ok(SyncReport::skipped());
        }
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::debug!("sync already in flight, skipping");
            return Ok(SyncReport::skipped());
        };

        self.is_syncing.store(true, Ordering::SeqCst);
        let result = self.run(RunMode::Normal, None).await;
        self.is_syncing.store(false, Ordering::SeqCst);
        result
    }

    /// Force-mode run over an explicit set of records. No version fetch, no
    /// comparison; used by the conflict resolver after the user opted in.
    /// Records still parked as conflicts are claimed directly, so a skipped
    /// run (offline, or another run in flight) leaves them untouched.
    pub(crate) async fn force_sync(&self, ids: &[LocalId]) -> Result<SyncReport> {
        if !self.is_online() {
            return Ok(SyncReport::skipped());
        }
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Ok(SyncReport::skipped());
        };

        self.is_syncing.store(true, Ordering::SeqCst);
        let result = self.run(RunMode::Force, Some(ids)).await;
        self.is_syncing.store(false, Ordering::SeqCst);
        result
    }

    /// Current queue state for UI/host code
    pub async fn status(&self) -> Result<SyncStatus> {
        SyncStatus::read(&self.db, self.is_online(), self.is_syncing()).await
    }

    async fn run(&self, mode: RunMode, explicit: Option<&[LocalId]>) -> Result<SyncReport> {
        let repo = LibSqlSubmissionRepository::new(self.db.connection());

        let records = match explicit {
            Some(ids) => {
                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(record) = repo.get(*id).await? {
                        let eligible = match mode {
                            RunMode::Normal => record.status == SubmissionStatus::Pending,
                            RunMode::Force => matches!(
                                record.status,
                                SubmissionStatus::Pending | SubmissionStatus::VersionConflict
                            ),
                        };
                        if eligible {
                            records.push(record);
                        }
                    }
                }
                records
            }
            None => {
                let mut statuses = vec![SubmissionStatus::Pending];
                if self.options.retry_failed {
                    statuses.push(SubmissionStatus::Failed);
                }
                repo.list_by_status(&statuses).await?
            }
        };

        let versions = match mode {
            RunMode::Force => HashMap::new(),
            RunMode::Normal => self.fetch_versions(&records).await,
        };

        let mut report = SyncReport {
            attempted: records.len(),
            ..SyncReport::default()
        };

        for record in records {
            repo.update_status(record.local_id, SubmissionStatus::Syncing, None)
                .await?;

            if mode == RunMode::Normal {
                // versions holds None when the fetch failed; in that case
                // delivery proceeds and the server is the final arbiter
                if let Some(Some(server_version)) = versions.get(&record.form_id) {
                    if *server_version != record.form_version {
                        let message = format!(
                            "form {} changed on the server: captured against version {}, server now at {}",
                            record.form_id, record.form_version, server_version
                        );
                        repo.update_status(
                            record.local_id,
                            SubmissionStatus::VersionConflict,
                            Some(&message),
                        )
                        .await?;
                        report.conflicts += 1;
                        tracing::info!(
                            local_id = %record.local_id,
                            form_id = %record.form_id,
                            "submission parked as version conflict"
                        );
                        continue;
                    }
                }
            }

            match self.deliver(&record).await {
                Ok(()) => {
                    repo.update_status(record.local_id, SubmissionStatus::Synced, None)
                        .await?;
                    report.synced += 1;
                    tracing::debug!(local_id = %record.local_id, "submission delivered");
                }
                Err(error) => {
                    let message = error.to_string();
                    repo.update_status(record.local_id, SubmissionStatus::Failed, Some(&message))
                        .await?;
                    report.failed += 1;
                    tracing::warn!(
                        local_id = %record.local_id,
                        error = %message,
                        "submission delivery failed"
                    );
                }
            }
        }

        let meta = LibSqlMetaRepository::new(self.db.connection());
        meta.set(
            LAST_SYNCED_AT_KEY,
            &chrono::Utc::now().timestamp_millis().to_string(),
        )
        .await?;

        tracing::info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            conflicts = report.conflicts,
            "sync run finished"
        );
        Ok(report)
    }

    /// One version fetch per distinct form, not per submission.
    async fn fetch_versions(
        &self,
        records: &[SubmissionRecord],
    ) -> HashMap<String, Option<String>> {
        let mut versions: HashMap<String, Option<String>> = HashMap::new();

        for record in records {
            if versions.contains_key(&record.form_id) {
                continue;
            }
            let version = match self.remote.fetch_form_version(&record.form_id).await {
                Ok(version) => Some(version),
                Err(error) => {
                    tracing::warn!(
                        form_id = %record.form_id,
                        error = %error,
                        "form version fetch failed, delivering without version check"
                    );
                    None
                }
            };
            versions.insert(record.form_id.clone(), version);
        }

        versions
    }

    async fn deliver(&self, record: &SubmissionRecord) -> crate::remote::RemoteResult<()> {
        match record.visibility {
            Visibility::Private => {
                self.remote
                    .submit_private(&record.form_id, &record.payload, record.idempotency_key)
                    .await
            }
            Visibility::Public => {
                self.remote
                    .submit_public(&record.form_id, &record.payload, record.idempotency_key)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSubmission;
    use crate::remote::{RemoteError, RemoteForm, RemoteResult};
    use crate::sync::ConflictResolver;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct MockState {
        versions: HashMap<String, String>,
        version_fetches: Vec<String>,
        submissions: Vec<(String, Uuid)>,
        fail_version_fetch: bool,
        fail_submit_forms: HashSet<String>,
        submit_delay: Option<Duration>,
    }

    #[derive(Clone, Default)]
    struct MockRemote {
        state: Arc<StdMutex<MockState>>,
    }

    impl MockRemote {
        fn with_version(self, form_id: &str, version: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .versions
                .insert(form_id.to_string(), version.to_string());
            self
        }

        fn failing_version_fetch(self) -> Self {
            self.state.lock().unwrap().fail_version_fetch = true;
            self
        }

        fn failing_submit_for(self, form_id: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .fail_submit_forms
                .insert(form_id.to_string());
            self
        }

        fn with_submit_delay(self, delay: Duration) -> Self {
            self.state.lock().unwrap().submit_delay = Some(delay);
            self
        }

        fn allow_submit_for(&self, form_id: &str) {
            self.state.lock().unwrap().fail_submit_forms.remove(form_id);
        }

        fn version_fetches(&self) -> Vec<String> {
            self.state.lock().unwrap().version_fetches.clone()
        }

        fn submit_count(&self) -> usize {
            self.state.lock().unwrap().submissions.len()
        }

        async fn record_submit(&self, form_id: &str, idempotency_key: Uuid) -> RemoteResult<()> {
            let delay = self.state.lock().unwrap().submit_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock().unwrap();
            if state.fail_submit_forms.contains(form_id) {
                return Err(RemoteError::Api("internal server error (500)".to_string()));
            }
            state
                .submissions
                .push((form_id.to_string(), idempotency_key));
            Ok(())
        }
    }

    impl FormsRemote for MockRemote {
        async fn fetch_form_version(&self, form_id: &str) -> RemoteResult<String> {
            let mut state = self.state.lock().unwrap();
            state.version_fetches.push(form_id.to_string());
            if state.fail_version_fetch {
                return Err(RemoteError::Api("form not found (404)".to_string()));
            }
            state
                .versions
                .get(form_id)
                .cloned()
                .ok_or_else(|| RemoteError::Api("form not found (404)".to_string()))
        }

        async fn fetch_form(&self, form_id: &str) -> RemoteResult<RemoteForm> {
            Err(RemoteError::Api(format!("no definition for {form_id}")))
        }

        async fn submit_private(
            &self,
            form_id: &str,
            _payload: &[u8],
            idempotency_key: Uuid,
        ) -> RemoteResult<()> {
            self.record_submit(form_id, idempotency_key).await
        }

        async fn submit_public(
            &self,
            form_id: &str,
            _payload: &[u8],
            idempotency_key: Uuid,
        ) -> RemoteResult<()> {
            self.record_submit(form_id, idempotency_key).await
        }
    }

    async fn setup_engine(remote: MockRemote) -> SyncEngine<MockRemote> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        SyncEngine::new(db, remote)
    }

    async fn queue(
        engine: &SyncEngine<MockRemote>,
        form_id: &str,
        version: &str,
    ) -> SubmissionRecord {
        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        repo.add(NewSubmission::new(
            form_id,
            version,
            b"{\"answers\":{}}".to_vec(),
            Visibility::Private,
        ))
        .await
        .unwrap()
    }

    async fn status_of(engine: &SyncEngine<MockRemote>, id: LocalId) -> SubmissionStatus {
        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        repo.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_match_delivers_exactly_once() {
        let remote = MockRemote::default().with_version("form-1", "1.0");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 0);
        assert!(!report.skipped);
        assert_eq!(remote.submit_count(), 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_mismatch_parks_conflict_without_delivery() {
        let remote = MockRemote::default().with_version("form-1", "1.2");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        let report = engine.sync().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(remote.submit_count(), 0);

        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        let conflicted = repo.get(record.local_id).await.unwrap().unwrap();
        assert_eq!(conflicted.status, SubmissionStatus::VersionConflict);
        let message = conflicted.error.unwrap();
        assert!(message.contains("1.0"));
        assert!(message.contains("1.2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_fetch_failure_still_delivers() {
        let remote = MockRemote::default().failing_version_fetch();
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(remote.submit_count(), 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_fetch_is_batched_per_form() {
        let remote = MockRemote::default()
            .with_version("form-a", "1.0")
            .with_version("form-b", "1.0");
        let engine = setup_engine(remote.clone()).await;

        for _ in 0..3 {
            queue(&engine, "form-a", "1.0").await;
        }
        for _ in 0..2 {
            queue(&engine, "form-b", "1.0").await;
        }

        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 5);

        let fetches = remote.version_fetches();
        assert_eq!(fetches.len(), 2);
        assert!(fetches.contains(&"form-a".to_string()));
        assert!(fetches.contains(&"form-b".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retriggered_sync_does_not_redeliver() {
        let remote = MockRemote::default().with_version("form-1", "1.0");
        let engine = setup_engine(remote.clone()).await;
        queue(&engine, "form-1", "1.0").await;

        let first = engine.sync().await.unwrap();
        assert_eq!(first.synced, 1);

        let second = engine.sync().await.unwrap();
        assert_eq!(second.attempted, 0);
        assert_eq!(remote.submit_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_while_offline_is_a_noop() {
        let remote = MockRemote::default().with_version("form-1", "1.0");
        let engine = setup_engine(remote.clone()).await;
        queue(&engine, "form-1", "1.0").await;

        engine.set_online(false);
        let report = engine.sync().await.unwrap();
        assert!(report.skipped);
        assert_eq!(remote.submit_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_triggers_run_exactly_one_sync() {
        let remote = MockRemote::default()
            .with_version("form-1", "1.0")
            .with_submit_delay(Duration::from_millis(50));
        let engine = Arc::new(setup_engine(remote.clone()).await);
        queue(&engine, "form-1", "1.0").await;

        let first = Arc::clone(&engine);
        let second = Arc::clone(&engine);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.sync().await.unwrap() }),
            tokio::spawn(async move { second.sync().await.unwrap() }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(remote.submit_count(), 1);
        assert!(a.skipped || b.skipped);
        assert_eq!(a.synced + b.synced, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_records_stay_put_by_default() {
        let remote = MockRemote::default()
            .with_version("form-1", "1.0")
            .failing_submit_for("form-1");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        let first = engine.sync().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Failed);

        remote.allow_submit_for("form-1");
        let second = engine.sync().await.unwrap();
        assert_eq!(second.attempted, 0);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_failed_option_reenters_failed_records() {
        let remote = MockRemote::default()
            .with_version("form-1", "1.0")
            .failing_submit_for("form-1");
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let engine = SyncEngine::with_options(
            Arc::clone(&db),
            remote.clone(),
            SyncOptions { retry_failed: true },
        );
        let record = queue(&engine, "form-1", "1.0").await;

        engine.sync().await.unwrap();
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Failed);

        remote.allow_submit_for("form-1");
        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_requeues_interrupted_records() {
        let remote = MockRemote::default().with_version("form-1", "1.0");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        let repo = LibSqlSubmissionRepository::new(engine.database().connection());
        repo.update_status(record.local_id, SubmissionStatus::Syncing, None)
            .await
            .unwrap();

        let reset = engine.recover().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Pending);

        let report = engine.sync().await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idempotency_key_travels_with_the_submission() {
        let remote = MockRemote::default().with_version("form-1", "1.0");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        engine.sync().await.unwrap();

        let submitted = remote.state.lock().unwrap().submissions.clone();
        assert_eq!(submitted, vec![("form-1".to_string(), record.idempotency_key)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_counts_everything_still_owed() {
        let remote = MockRemote::default()
            .with_version("form-ok", "1.0")
            .with_version("form-changed", "2.0")
            .with_version("form-down", "1.0")
            .failing_submit_for("form-down");
        let engine = setup_engine(remote.clone()).await;

        queue(&engine, "form-ok", "1.0").await;
        queue(&engine, "form-changed", "1.0").await;
        queue(&engine, "form-down", "1.0").await;

        engine.sync().await.unwrap();
        queue(&engine, "form-ok", "1.0").await; // captured after the run

        let status = engine.status().await.unwrap();
        // failed + conflicted + freshly pending
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.conflict_count, 1);
        assert_eq!(status.conflicts[0].form_id, "form-changed");
        assert!(status.last_synced_at.is_some());
        assert!(status.is_online);
        assert!(!status.is_syncing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_sync_skips_version_comparison() {
        let remote = MockRemote::default().with_version("form-1", "9.9");
        let engine = setup_engine(remote.clone()).await;
        let record = queue(&engine, "form-1", "1.0").await;

        // Park it as a conflict first, then resolve by force.
        engine.sync().await.unwrap();
        assert_eq!(
            status_of(&engine, record.local_id).await,
            SubmissionStatus::VersionConflict
        );
        let fetches_before = remote.version_fetches().len();

        let resolver = ConflictResolver::new(&engine);
        let report = resolver.force_submit().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(status_of(&engine, record.local_id).await, SubmissionStatus::Synced);
        // Force mode performed no additional version fetches
        assert_eq!(remote.version_fetches().len(), fetches_before);
    }
}
