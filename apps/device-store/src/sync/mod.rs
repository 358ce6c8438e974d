//! Incremental pull sync of data points.
//!
//! Each survey group is synced by a strictly sequential pipeline:
//! resolve the server, resolve the API key, read the group's synced time,
//! fetch everything modified since then, merge it. The synced time only
//! advances together with a fully merged batch, so a failed run can simply
//! be repeated.

pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{DbError, MergeStats, RemoteBatch, SettingsRepository, SurveyStore, SyncRepository};

pub use remote::{HttpRemoteSource, RemoteDataPoint, RemoteSource, API_KEY_HEADER};

/// Sync errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("No API key configured")]
    MissingApiKey,

    #[error("Sync already in progress for survey group {0}")]
    AlreadyInProgress(i64),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Sync status of one survey group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SyncStatus {
    Idle,
    Syncing { stage: SyncStage },
    Completed { stats: MergeStats },
    Failed { error: String },
}

/// Current pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name")]
pub enum SyncStage {
    ResolvingServer,
    ResolvingApiKey,
    ReadingSyncedTime,
    FetchingDataPoints { since: Option<i64> },
    Merging { count: usize },
}

/// Static sync configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Compiled-in or configured server base URL, used unless the user overrides it.
    pub default_base_url: String,
    pub api_key: Option<String>,
}

struct SyncEngineInner {
    store: SurveyStore,
    remote: Arc<dyn RemoteSource>,
    config: SyncConfig,
    statuses: Mutex<HashMap<i64, SyncStatus>>,
}

/// Data point sync engine.
///
/// Cheap to clone; independent groups may be synced concurrently.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    pub fn new(store: SurveyStore, remote: Arc<dyn RemoteSource>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncEngineInner {
                store,
                remote,
                config,
                statuses: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current status of a survey group.
    pub async fn status(&self, survey_group_id: i64) -> SyncStatus {
        self.statuses()
            .get(&survey_group_id)
            .cloned()
            .unwrap_or(SyncStatus::Idle)
    }

    /// Prepare a cancellable sync of one survey group.
    pub fn task(&self, survey_group_id: i64) -> SyncTask {
        SyncTask {
            engine: self.clone(),
            survey_group_id,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sync one survey group to completion.
    pub async fn sync_group(&self, survey_group_id: i64) -> Result<MergeStats, SyncError> {
        self.task(survey_group_id).execute().await
    }

    async fn run(&self, survey_group_id: i64, disposed: &AtomicBool) -> Result<MergeStats, SyncError> {
        let mut guard = self.begin(survey_group_id)?;

        let result = self.pipeline(survey_group_id, disposed).await;

        let status = match &result {
            Ok(stats) => {
                info!(
                    survey_group_id,
                    records = stats.records_merged,
                    synced_time = ?stats.synced_time,
                    "data point sync completed"
                );
                SyncStatus::Completed {
                    stats: stats.clone(),
                }
            }
            Err(e) => {
                warn!(survey_group_id, error = %e, "data point sync failed");
                SyncStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        guard.finish(status);
        result
    }

    /// Mark the group as syncing, refusing if a run is already active.
    fn begin(&self, survey_group_id: i64) -> Result<RunGuard<'_>, SyncError> {
        let mut statuses = self.statuses();
        if matches!(statuses.get(&survey_group_id), Some(SyncStatus::Syncing { .. })) {
            return Err(SyncError::AlreadyInProgress(survey_group_id));
        }
        statuses.insert(
            survey_group_id,
            SyncStatus::Syncing {
                stage: SyncStage::ResolvingServer,
            },
        );
        Ok(RunGuard {
            engine: self,
            survey_group_id,
            outcome: None,
        })
    }

    async fn pipeline(
        &self,
        survey_group_id: i64,
        disposed: &AtomicBool,
    ) -> Result<MergeStats, SyncError> {
        let store = &self.inner.store;

        // 1. Server base URL
        check_disposed(disposed)?;
        let base_url = self.resolve_base_url()?;

        // 2. API key
        check_disposed(disposed)?;
        self.set_stage(survey_group_id, SyncStage::ResolvingApiKey);
        let api_key = self
            .inner
            .config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(SyncError::MissingApiKey)?;

        // 3. Synced time
        check_disposed(disposed)?;
        self.set_stage(survey_group_id, SyncStage::ReadingSyncedTime);
        let since = store.synced_time(survey_group_id)?.map(|t| t.time);

        // 4. Fetch
        check_disposed(disposed)?;
        self.set_stage(survey_group_id, SyncStage::FetchingDataPoints { since });
        let data_points = self
            .inner
            .remote
            .fetch_data_points(&base_url, &api_key, survey_group_id, since)
            .await?;

        // 5. Merge, results of a disposed task are discarded
        check_disposed(disposed)?;
        self.set_stage(
            survey_group_id,
            SyncStage::Merging {
                count: data_points.len(),
            },
        );
        let batch = to_batch(survey_group_id, &data_points);
        Ok(store.merge_remote_batch(&batch)?)
    }

    /// User override from settings, else the configured default.
    fn resolve_base_url(&self) -> Result<String, SyncError> {
        let settings = self.inner.store.get_settings()?;
        let base_url = settings
            .server_base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.inner.config.default_base_url.clone());
        Ok(base_url.trim_end_matches('/').to_string())
    }

    fn set_stage(&self, survey_group_id: i64, stage: SyncStage) {
        self.set_status(survey_group_id, SyncStatus::Syncing { stage });
    }

    fn set_status(&self, survey_group_id: i64, status: SyncStatus) {
        self.statuses().insert(survey_group_id, status);
    }

    /// Held only for single map operations, never across an await.
    fn statuses(&self) -> MutexGuard<'_, HashMap<i64, SyncStatus>> {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the `Syncing` status of one run. A run whose future is dropped
/// before it finishes leaves the group `Failed` instead of stuck in `Syncing`.
struct RunGuard<'a> {
    engine: &'a SyncEngine,
    survey_group_id: i64,
    outcome: Option<SyncStatus>,
}

impl RunGuard<'_> {
    fn finish(&mut self, status: SyncStatus) {
        self.outcome = Some(status);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let status = self.outcome.take().unwrap_or_else(|| {
            warn!(survey_group_id = self.survey_group_id, "data point sync abandoned");
            SyncStatus::Failed {
                error: SyncError::Cancelled.to_string(),
            }
        });
        self.engine.set_status(self.survey_group_id, status);
    }
}

fn check_disposed(disposed: &AtomicBool) -> Result<(), SyncError> {
    if disposed.load(Ordering::SeqCst) {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

/// Group fetched data points into one mergeable batch.
fn to_batch(survey_group_id: i64, data_points: &[RemoteDataPoint]) -> RemoteBatch {
    RemoteBatch {
        survey_group_id,
        records: data_points.iter().map(RemoteDataPoint::to_record).collect(),
        instances: data_points
            .iter()
            .flat_map(RemoteDataPoint::to_instances)
            .collect(),
        latest_modified: data_points.iter().map(|p| p.last_modified).max(),
    }
}

/// One cancellable sync run for a survey group.
pub struct SyncTask {
    engine: SyncEngine,
    survey_group_id: i64,
    disposed: Arc<AtomicBool>,
}

impl SyncTask {
    pub fn survey_group_id(&self) -> i64 {
        self.survey_group_id
    }

    /// Handle that disposes this task from elsewhere.
    pub fn disposer(&self) -> SyncDisposer {
        SyncDisposer {
            disposed: Arc::clone(&self.disposed),
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run the pipeline. A task disposed before any stage returns
    /// [`SyncError::Cancelled`] and leaves the store untouched.
    pub async fn execute(self) -> Result<MergeStats, SyncError> {
        check_disposed(&self.disposed)?;
        self.engine.run(self.survey_group_id, &self.disposed).await
    }
}

/// Cancels a [`SyncTask`] it was taken from.
#[derive(Clone)]
pub struct SyncDisposer {
    disposed: Arc<AtomicBool>,
}

impl SyncDisposer {
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSource {
        calls: StdMutex<Vec<(String, Option<i64>)>>,
    }

    #[async_trait]
    impl RemoteSource for RecordingSource {
        async fn fetch_data_points(
            &self,
            base_url: &str,
            _api_key: &str,
            survey_group_id: i64,
            since: Option<i64>,
        ) -> Result<Vec<RemoteDataPoint>, SyncError> {
            self.calls.lock().unwrap().push((base_url.to_string(), since));
            Ok(vec![RemoteDataPoint {
                record_id: "r-1".to_string(),
                survey_group_id,
                name: None,
                latitude: None,
                longitude: None,
                last_modified: 42,
                survey_instances: Vec::new(),
            }])
        }
    }

    /// Stalls on its first fetch only.
    #[derive(Default)]
    struct StallingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSource for StallingSource {
        async fn fetch_data_points(
            &self,
            _base_url: &str,
            _api_key: &str,
            _survey_group_id: i64,
            _since: Option<i64>,
        ) -> Result<Vec<RemoteDataPoint>, SyncError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(Vec::new())
        }
    }

    fn engine(source: Arc<dyn RemoteSource>, api_key: Option<&str>) -> SyncEngine {
        SyncEngine::new(
            SurveyStore::open_in_memory().unwrap(),
            source,
            SyncConfig {
                default_base_url: "https://default.example.org/".to_string(),
                api_key: api_key.map(str::to_string),
            },
        )
    }

    #[tokio::test]
    async fn user_override_wins_over_default() {
        let source = Arc::new(RecordingSource::default());
        let engine = engine(source.clone(), Some("key"));
        let mut settings = engine.inner.store.get_settings().unwrap();
        settings.server_base_url = Some("https://override.example.org".to_string());
        engine.inner.store.save_settings(&settings).unwrap();

        engine.sync_group(10).await.unwrap();

        let calls = source.calls.lock().unwrap();
        assert_eq!(calls[0].0, "https://override.example.org");
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_fetch() {
        let source = Arc::new(RecordingSource::default());
        let engine = engine(source.clone(), None);

        let err = engine.sync_group(10).await.unwrap_err();

        assert!(matches!(err, SyncError::MissingApiKey));
        assert!(source.calls.lock().unwrap().is_empty());
        assert!(matches!(engine.status(10).await, SyncStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn second_run_fetches_since_ledger() {
        let source = Arc::new(RecordingSource::default());
        let engine = engine(source.clone(), Some("key"));

        engine.sync_group(10).await.unwrap();
        engine.sync_group(10).await.unwrap();

        let calls = source.calls.lock().unwrap();
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[1].1, Some(42));
        assert_eq!(calls[0].0, "https://default.example.org");
    }

    #[tokio::test]
    async fn disposed_task_is_cancelled() {
        let source = Arc::new(RecordingSource::default());
        let engine = engine(source.clone(), Some("key"));

        let task = engine.task(10);
        task.disposer().dispose();
        assert!(task.is_disposed());

        let err = task.execute().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(source.calls.lock().unwrap().is_empty());
        assert_eq!(engine.inner.store.synced_time(10).unwrap(), None);
        assert_eq!(engine.status(10).await, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn dropped_run_does_not_block_the_next_one() {
        let source = Arc::new(StallingSource::default());
        let engine = engine(source.clone(), Some("key"));

        let timed_out = tokio::time::timeout(Duration::from_millis(20), engine.sync_group(10)).await;
        assert!(timed_out.is_err());
        assert!(matches!(engine.status(10).await, SyncStatus::Failed { .. }));

        let stats = engine.sync_group(10).await.unwrap();
        assert_eq!(stats.records_merged, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(engine.status(10).await, SyncStatus::Completed { .. }));
    }
}
