//! Batch reconciliation of locally pending records with the remote service.
//!
//! `run_sync` is not re-entrant; callers serialize it (the CLI does so with the
//! data directory lock). Remote failures are folded into record status and never
//! returned; storage failures are.

use std::sync::Arc;

use serde::Serialize;

use crate::capability::Connectivity;
use crate::entities::{project, supervisor};
use crate::error::AppError;
use crate::remote::{RemoteService, SyncBatch};
use crate::store::{BatchKeys, QueueCursor, Store};

pub const DEFAULT_BATCH_SIZE: u64 = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub synced: u64,
    pub failed: u64,
    pub skipped: bool,
}

impl SyncOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheRefresh {
    pub projects: Option<usize>,
    pub supervisors: Option<usize>,
}

pub struct SyncEngine {
    store: Store,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<dyn Connectivity>,
    batch_size: u64,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn run_sync(&self) -> Result<SyncOutcome, AppError> {
        if !self.connectivity.is_online().await {
            tracing::info!("offline, sync skipped");
            return Ok(SyncOutcome::skipped());
        }

        let limit = self.batch_size;
        let mut outcome = SyncOutcome::default();
        // Each queue only moves towards older records, so a record sent in this
        // run is not picked up again until the next run.
        let mut tally_cursor: Option<QueueCursor> = None;
        let mut session_cursor: Option<QueueCursor> = None;
        let mut bagup_cursor: Option<QueueCursor> = None;

        loop {
            let batch = SyncBatch {
                tallies: self
                    .store
                    .tally_sync_queue(limit, tally_cursor.as_ref())
                    .await?,
                sessions: self
                    .store
                    .session_sync_queue(limit, session_cursor.as_ref())
                    .await?,
                bagups: self
                    .store
                    .bagup_sync_queue(limit, bagup_cursor.as_ref())
                    .await?,
            };
            if batch.is_empty() {
                break;
            }

            let exhausted = (batch.tallies.len() as u64) < limit
                && (batch.sessions.len() as u64) < limit
                && (batch.bagups.len() as u64) < limit;
            if let Some(last) = batch.tallies.last() {
                tally_cursor = Some(QueueCursor::new(last.created_at, last.id.as_str()));
            }
            if let Some(last) = batch.sessions.last() {
                session_cursor = Some(QueueCursor::new(last.created_at, last.id.as_str()));
            }
            if let Some(last) = batch.bagups.last() {
                bagup_cursor = Some(QueueCursor::new(last.created_at, last.id.as_str()));
            }
            let keys = BatchKeys {
                tallies: batch.tallies.iter().map(|item| item.id.clone()).collect(),
                sessions: batch.sessions.iter().map(|item| item.id.clone()).collect(),
                bagups: batch.bagups.iter().map(|item| item.id.clone()).collect(),
            };

            // Counts come from the status writes, which skip records whose
            // state moved on while the batch was in flight.
            match self.remote.submit_batch(&batch).await {
                Ok(()) => {
                    let written = self.store.mark_batch_synced(&keys).await? as u64;
                    outcome.synced += written;
                    tracing::info!(
                        tallies = keys.tallies.len(),
                        sessions = keys.sessions.len(),
                        bagups = keys.bagups.len(),
                        written,
                        "batch synced"
                    );
                }
                Err(err) => {
                    let message = err.to_string();
                    let written = self.store.mark_batch_error(&keys, &message).await? as u64;
                    outcome.failed += written;
                    tracing::warn!(records = written, error = %message, "batch rejected");
                }
            }

            if exhausted {
                break;
            }
        }

        Ok(outcome)
    }

    /// Best-effort refresh of the project and supervisor caches. Failures are
    /// logged and leave the existing cache in place.
    pub async fn sync_projects(&self) -> CacheRefresh {
        let mut refresh = CacheRefresh::default();
        if !self.connectivity.is_online().await {
            tracing::debug!("offline, project refresh skipped");
            return refresh;
        }

        match self.remote.fetch_projects().await {
            Ok(projects) => {
                let models: Vec<project::Model> = projects.into_iter().map(Into::into).collect();
                match self.store.replace_projects(models).await {
                    Ok(count) => refresh.projects = Some(count),
                    Err(err) => tracing::warn!(error = %err, "failed to store projects"),
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to sync projects"),
        }

        match self.remote.fetch_supervisors().await {
            Ok(supervisors) => {
                let models: Vec<supervisor::Model> =
                    supervisors.into_iter().map(Into::into).collect();
                match self.store.replace_supervisors(models).await {
                    Ok(count) => refresh.supervisors = Some(count),
                    Err(err) => tracing::warn!(error = %err, "failed to store supervisors"),
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to sync supervisors"),
        }

        refresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use url::Url;

    use crate::capability::{ManualClock, SequentialIds, StaticConnectivity};
    use crate::db;
    use crate::model::{BagupInput, SessionInput, SpeciesRequirement, TallyInput};
    use crate::remote::{HttpRemote, RemoteError, RemoteProject, RemoteSupervisor};

    #[derive(Default)]
    struct FakeRemote {
        failure: Mutex<Option<String>>,
        batches: Mutex<Vec<(usize, usize, usize)>>,
        projects: Mutex<Option<Vec<RemoteProject>>>,
    }

    impl FakeRemote {
        fn failing(message: &str) -> Self {
            let remote = Self::default();
            remote.fail_with(Some(message));
            remote
        }

        fn fail_with(&self, message: Option<&str>) {
            *self.failure.lock().unwrap() = message.map(str::to_string);
        }

        fn batches(&self) -> Vec<(usize, usize, usize)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteService for FakeRemote {
        async fn submit_batch(&self, batch: &SyncBatch) -> Result<(), RemoteError> {
            self.batches.lock().unwrap().push((
                batch.tallies.len(),
                batch.sessions.len(),
                batch.bagups.len(),
            ));
            match self.failure.lock().unwrap().clone() {
                Some(message) => Err(RemoteError::Rejected {
                    status: 500,
                    message,
                }),
                None => Ok(()),
            }
        }

        async fn fetch_projects(&self) -> Result<Vec<RemoteProject>, RemoteError> {
            self.projects
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| RemoteError::Transport("connection reset".to_string()))
        }

        async fn fetch_supervisors(&self) -> Result<Vec<RemoteSupervisor>, RemoteError> {
            Ok(vec![RemoteSupervisor {
                name: "Avery".to_string(),
                project_name: None,
            }])
        }
    }

    async fn setup_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = db::resolve_db_path(dir.path());
        db::ensure_parent_dir(&db_path).expect("ensure parent");
        let conn = db::connect(&db_path).await.expect("connect db");
        db::ensure_schema(&conn).await.expect("ensure schema");
        let start = DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        let store = Store::new(
            conn,
            Arc::new(ManualClock::new(start)),
            Arc::new(SequentialIds::new("rec")),
        );
        (dir, store)
    }

    fn engine(store: &Store, remote: Arc<FakeRemote>, online: bool) -> SyncEngine {
        SyncEngine::new(store.clone(), remote, Arc::new(StaticConnectivity(online)))
    }

    async fn seed(store: &Store, tallies: usize, sessions: usize, bagups_per_session: usize) {
        for trees in 1..=tallies {
            store
                .create_tally(TallyInput {
                    date: "2024-05-01".to_string(),
                    trees: trees as i64,
                    notes: None,
                    block_name: None,
                })
                .await
                .expect("tally");
        }
        for index in 0..sessions {
            let session = store
                .create_session(SessionInput {
                    block_name: format!("Block {index}"),
                    species: vec![SpeciesRequirement {
                        species_code: "pl".to_string(),
                        display_name: "Pine".to_string(),
                        required_ratio: 1.0,
                    }],
                    ..Default::default()
                })
                .await
                .expect("session");
            for _ in 0..bagups_per_session {
                store
                    .create_bagup(&session.id, BagupInput::default())
                    .await
                    .expect("bagup");
            }
            store.finalize_session(&session.id).await.expect("finalize");
        }
    }

    async fn all_statuses(store: &Store) -> Vec<(String, Option<String>)> {
        let mut statuses = Vec::new();
        for item in store
            .list_tallies_by_status(&crate::lifecycle::TallyStatus::ALL)
            .await
            .expect("tallies")
        {
            statuses.push((item.status, item.status_error));
        }
        for item in store
            .list_sessions_by_status(&crate::lifecycle::SessionStatus::ALL)
            .await
            .expect("sessions")
        {
            statuses.push((item.status, item.status_error));
        }
        for item in store
            .list_bagups_by_status(&crate::lifecycle::BagupStatus::ALL)
            .await
            .expect("bagups")
        {
            statuses.push((item.status, item.status_error));
        }
        statuses
    }

    #[tokio::test]
    async fn offline_run_skips_without_writes() {
        let (_dir, store) = setup_store().await;
        seed(&store, 2, 1, 1).await;
        let before = all_statuses(&store).await;
        let remote = Arc::new(FakeRemote::default());

        let outcome = engine(&store, remote.clone(), false)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(
            outcome,
            SyncOutcome {
                synced: 0,
                failed: 0,
                skipped: true
            }
        );
        assert!(remote.batches().is_empty());
        assert_eq!(before, all_statuses(&store).await);
    }

    #[tokio::test]
    async fn empty_queue_makes_no_remote_call() {
        let (_dir, store) = setup_store().await;
        store
            .create_session(SessionInput {
                block_name: "Still draft".to_string(),
                ..Default::default()
            })
            .await
            .expect("draft session");
        let remote = Arc::new(FakeRemote::default());
        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::default());
        assert!(remote.batches().is_empty());
    }

    #[tokio::test]
    async fn failed_batch_marks_every_record_then_retry_syncs_them() {
        let (_dir, store) = setup_store().await;
        seed(&store, 3, 2, 2).await;
        let remote = Arc::new(FakeRemote::failing("upstream exploded"));

        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(
            outcome,
            SyncOutcome {
                synced: 0,
                failed: 9,
                skipped: false
            }
        );
        assert_eq!(remote.batches(), vec![(3, 2, 4)]);
        let statuses = all_statuses(&store).await;
        assert_eq!(statuses.len(), 9);
        for (status, error) in &statuses {
            assert_eq!(status, "error");
            assert_eq!(error.as_deref(), Some("upstream exploded"));
        }

        remote.fail_with(None);
        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome.synced, 9);
        assert_eq!(outcome.failed, 0);
        for (status, error) in all_statuses(&store).await {
            assert_eq!(status, "synced");
            assert_eq!(error, None);
        }

        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(remote.batches().len(), 2);
    }

    #[tokio::test]
    async fn large_queue_drains_in_bounded_batches() {
        let (_dir, store) = setup_store().await;
        seed(&store, 5, 0, 0).await;
        let remote = Arc::new(FakeRemote::default());
        let outcome = engine(&store, remote.clone(), true)
            .with_batch_size(2)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome.synced, 5);
        assert_eq!(remote.batches(), vec![(2, 0, 0), (2, 0, 0), (1, 0, 0)]);
    }

    #[tokio::test]
    async fn persistent_failure_does_not_resend_within_a_run() {
        let (_dir, store) = setup_store().await;
        seed(&store, 4, 0, 0).await;
        let remote = Arc::new(FakeRemote::failing("nope"));
        let outcome = engine(&store, remote.clone(), true)
            .with_batch_size(2)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome.failed, 4);
        assert_eq!(remote.batches(), vec![(2, 0, 0), (2, 0, 0)]);
    }

    #[tokio::test]
    async fn pending_bagups_and_draft_sessions_wait_for_finalize() {
        let (_dir, store) = setup_store().await;
        let session = store
            .create_session(SessionInput {
                block_name: "Open".to_string(),
                ..Default::default()
            })
            .await
            .expect("session");
        store
            .create_bagup(&session.id, BagupInput::default())
            .await
            .expect("bagup");
        let remote = Arc::new(FakeRemote::default());
        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome.synced, 0);
        assert!(remote.batches().is_empty());
    }

    #[tokio::test]
    async fn archived_sessions_and_their_bagups_are_never_sent() {
        let (_dir, store) = setup_store().await;
        seed(&store, 0, 1, 2).await;
        let session = store
            .list_sessions_by_status(&crate::lifecycle::SessionStatus::ALL)
            .await
            .expect("sessions")
            .remove(0);
        store.archive_session(&session.id).await.expect("archive");
        let remote = Arc::new(FakeRemote::default());
        let outcome = engine(&store, remote.clone(), true)
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::default());
        assert!(remote.batches().is_empty());
        let bagups = store
            .list_bagups_by_session(&session.id)
            .await
            .expect("bagups");
        assert_eq!(bagups.len(), 2);
        assert!(bagups.iter().all(|item| item.status == "finalized"));
    }

    /// Archives the session while its batch is in flight.
    struct ArchivingRemote {
        store: Store,
        session_id: String,
    }

    #[async_trait]
    impl RemoteService for ArchivingRemote {
        async fn submit_batch(&self, _batch: &SyncBatch) -> Result<(), RemoteError> {
            self.store
                .archive_session(&self.session_id)
                .await
                .map_err(|err| RemoteError::Transport(err.to_string()))?;
            Ok(())
        }

        async fn fetch_projects(&self) -> Result<Vec<RemoteProject>, RemoteError> {
            Ok(Vec::new())
        }

        async fn fetch_supervisors(&self) -> Result<Vec<RemoteSupervisor>, RemoteError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn synced_count_reflects_status_writes() {
        let (_dir, store) = setup_store().await;
        seed(&store, 1, 1, 0).await;
        let session = store
            .list_sessions_by_status(&crate::lifecycle::SessionStatus::ALL)
            .await
            .expect("sessions")
            .remove(0);
        let remote = Arc::new(ArchivingRemote {
            store: store.clone(),
            session_id: session.id.clone(),
        });
        let outcome = SyncEngine::new(store.clone(), remote, Arc::new(StaticConnectivity(true)))
            .run_sync()
            .await
            .expect("sync");
        assert_eq!(
            outcome,
            SyncOutcome {
                synced: 1,
                failed: 0,
                skipped: false
            }
        );
        let session = store.get_session(&session.id).await.expect("session");
        assert_eq!(session.status, "archived");
    }

    #[tokio::test]
    async fn request_timeout_marks_batch_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        // Accepts the connection and never answers.
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let (_dir, store) = setup_store().await;
        seed(&store, 1, 0, 0).await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).expect("url");
        let remote = HttpRemote::new(url, Duration::from_secs(1)).expect("remote");
        let outcome = SyncEngine::new(
            store.clone(),
            Arc::new(remote),
            Arc::new(StaticConnectivity(true)),
        )
        .run_sync()
        .await
        .expect("sync");
        silent.abort();

        assert_eq!(
            outcome,
            SyncOutcome {
                synced: 0,
                failed: 1,
                skipped: false
            }
        );
        let tallies = store
            .list_tallies_by_status(&crate::lifecycle::TallyStatus::ALL)
            .await
            .expect("tallies");
        assert_eq!(tallies[0].status, "error");
        assert_eq!(
            tallies[0].status_error.as_deref(),
            Some("Request timed out after 1s")
        );
    }

    #[tokio::test]
    async fn project_refresh_is_best_effort() {
        let (_dir, store) = setup_store().await;
        store
            .replace_projects(vec![project::Model {
                project_name: "Old".to_string(),
                species_data: json!({}),
                blocks_data: json!([]),
            }])
            .await
            .expect("seed cache");
        let remote = Arc::new(FakeRemote::default());

        let refresh = engine(&store, remote.clone(), true).sync_projects().await;
        assert_eq!(refresh.projects, None);
        assert_eq!(refresh.supervisors, Some(1));
        let names: Vec<_> = store
            .list_projects()
            .await
            .expect("projects")
            .into_iter()
            .map(|item| item.project_name)
            .collect();
        assert_eq!(names, vec!["Old".to_string()]);

        *remote.projects.lock().unwrap() = Some(vec![RemoteProject {
            project_name: "New".to_string(),
            species_data: json!({"pl": "Pine"}),
            blocks_data: json!(["B1"]),
        }]);
        let refresh = engine(&store, remote.clone(), true).sync_projects().await;
        assert_eq!(refresh.projects, Some(1));
        let project = store.get_project("New").await.expect("project");
        assert_eq!(project.blocks_data, json!(["B1"]));
        assert!(store.get_project("Old").await.is_err());

        let refresh = engine(&store, remote, false).sync_projects().await;
        assert_eq!(refresh, CacheRefresh::default());
    }
}
