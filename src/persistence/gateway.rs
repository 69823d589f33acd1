//! Read-through cache and change feed in front of a [`Store`].
//!
//! Writes go to the store first; the cache is only updated once the store
//! accepted them. Failures are returned to the caller and never undo the
//! engine's in-memory change that prompted the write.
//!
//! External writers push [`ChangeNotification`]s into a bounded channel. A
//! single sync loop drains it into the engine, so pushed changes are
//! serialized with each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::task::{Task, TaskId};
use crate::error::Result;
use crate::orchestration::{Engine, Metrics};
use crate::persistence::{HistoryEntry, MemoryStore, MetricsSample, SqliteStore, Store, TaskRecord};
use crate::workflow::{Workflow, WorkflowExecution};

/// A change made to the durable store by another writer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification {
    Insert(Task),
    Update(Task),
    Delete(TaskId),
}

impl ChangeNotification {
    pub fn task_id(&self) -> TaskId {
        match self {
            ChangeNotification::Insert(task) | ChangeNotification::Update(task) => task.id,
            ChangeNotification::Delete(id) => *id,
        }
    }
}

/// Durable persistence with a task cache and a push-change feed.
pub struct PersistenceGateway {
    store: Arc<dyn Store>,
    cache: Mutex<HashMap<TaskId, TaskRecord>>,
    history_limit: usize,
    changes_tx: mpsc::Sender<ChangeNotification>,
    changes_rx: Mutex<Option<mpsc::Receiver<ChangeNotification>>>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        let (changes_tx, changes_rx) = mpsc::channel(config.sync_queue_capacity.max(1));
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            history_limit: config.history_limit.max(1),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
        }
    }

    /// Gateway over an in-process store.
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Gateway over the configured SQLite file, or an in-process store when
    /// none is configured.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        match config.database_path() {
            Some(path) => Self::open_sqlite(&path, config),
            None => Ok(Self::in_memory(config)),
        }
    }

    pub fn open_sqlite(path: &Path, config: &EngineConfig) -> Result<Self> {
        let store = SqliteStore::open(path)?;
        tracing::info!(path = %path.display(), "opened task database");
        Ok(Self::new(Arc::new(store), config))
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- tasks ----

    /// Upsert a task, appending a history entry when `history` is set.
    pub fn save_task(&self, task: &Task, history: bool) -> Result<()> {
        let mut record = match self.get_task(&task.id)? {
            Some(record) => record,
            None => TaskRecord::new(task.clone()),
        };
        record.task = task.clone();
        if history {
            record.push_history(HistoryEntry::from_task(task), self.history_limit);
        }
        self.store.upsert_task(&record)?;
        self.cache().insert(task.id, record);
        Ok(())
    }

    /// Cached record, falling back to the store.
    pub fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        if let Some(record) = self.cache().get(id) {
            return Ok(Some(record.clone()));
        }
        let record = self.store.load_task(id)?;
        if let Some(record) = &record {
            self.cache().insert(*id, record.clone());
        }
        Ok(record)
    }

    /// Every stored task; refreshes the cache.
    pub fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let records = self.store.load_tasks()?;
        let mut cache = self.cache();
        for record in &records {
            cache.insert(record.task.id, record.clone());
        }
        Ok(records)
    }

    pub fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let removed = self.store.delete_task(id)?;
        self.cache().remove(id);
        Ok(removed)
    }

    pub fn history(&self, id: &TaskId) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .get_task(id)?
            .map(|record| record.execution_history)
            .unwrap_or_default())
    }

    pub fn cached_tasks(&self) -> usize {
        self.cache().len()
    }

    // ---- workflows, executions, metrics ----

    pub fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.store.upsert_workflow(workflow)
    }

    pub fn load_workflows(&self) -> Result<Vec<Workflow>> {
        self.store.load_workflows()
    }

    pub fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.store.upsert_execution(execution)
    }

    pub fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
        self.store.load_executions()
    }

    pub fn record_metrics(&self, metrics: &Metrics) -> Result<()> {
        self.store.append_metrics(&MetricsSample {
            recorded_at: Utc::now(),
            metrics: metrics.clone(),
        })
    }

    pub fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricsSample>> {
        self.store.recent_metrics(limit)
    }

    // ---- change feed ----

    /// Sender for external change notifications.
    pub fn sender(&self) -> mpsc::Sender<ChangeNotification> {
        self.changes_tx.clone()
    }

    /// Start the loop that applies pushed changes to `engine`.
    ///
    /// The feed has a single consumer: returns `None` if the loop was
    /// already started.
    pub fn spawn_sync(self: &Arc<Self>, engine: &Arc<Engine>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self
            .changes_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let gateway = Arc::downgrade(self);
        let engine = Arc::downgrade(engine);

        Some(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = rx.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let (Some(engine), Some(gateway)) = (engine.upgrade(), gateway.upgrade()) else {
                    break;
                };
                gateway.apply_to_cache(&change);
                let id = change.task_id();
                if let Err(e) = engine.apply_change(change) {
                    tracing::warn!(task = %id.short(), error = %e, "rejected change notification");
                }
            }
            tracing::debug!("change feed stopped");
        }))
    }

    /// Keep the cache in line with a change another writer already made to
    /// the store.
    fn apply_to_cache(&self, change: &ChangeNotification) {
        let mut cache = self.cache();
        match change {
            ChangeNotification::Insert(task) | ChangeNotification::Update(task) => {
                let stale = cache
                    .get(&task.id)
                    .is_some_and(|record| record.task.updated_at > task.updated_at);
                if !stale {
                    cache
                        .entry(task.id)
                        .and_modify(|record| record.task = task.clone())
                        .or_insert_with(|| TaskRecord::new(task.clone()));
                }
            }
            ChangeNotification::Delete(id) => {
                cache.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use crate::error::Error;
    use serde_json::json;

    struct CountingStore {
        inner: MemoryStore,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl Store for CountingStore {
        fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
            self.inner.upsert_task(record)
        }
        fn load_task(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.load_task(id)
        }
        fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
            self.inner.load_tasks()
        }
        fn delete_task(&self, id: &TaskId) -> Result<bool> {
            self.inner.delete_task(id)
        }
        fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
            self.inner.upsert_workflow(workflow)
        }
        fn load_workflows(&self) -> Result<Vec<Workflow>> {
            self.inner.load_workflows()
        }
        fn upsert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
            self.inner.upsert_execution(execution)
        }
        fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
            self.inner.load_executions()
        }
        fn append_metrics(&self, sample: &MetricsSample) -> Result<()> {
            self.inner.append_metrics(sample)
        }
        fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricsSample>> {
            self.inner.recent_metrics(limit)
        }
    }


    #[test]
    fn test_cache_avoids_store_reads() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            reads: Default::default(),
        });
        let gateway = PersistenceGateway::new(store.clone(), &EngineConfig::default());
        let task = Task::from_spec(TaskSpec::new("a"));
        gateway.save_task(&task, false).unwrap();
        let reads_after_save = store.reads.load(std::sync::atomic::Ordering::SeqCst);

        for _ in 0..3 {
            assert!(gateway.get_task(&task.id).unwrap().is_some());
        }
        assert_eq!(store.reads.load(std::sync::atomic::Ordering::SeqCst), reads_after_save);
    }

    #[test]
    fn test_history_capped_at_limit() {
        let config = EngineConfig {
            history_limit: 3,
            ..Default::default()
        };
        let gateway = PersistenceGateway::in_memory(&config);
        let mut task = Task::from_spec(TaskSpec::new("recurring"));
        for run in 0..5 {
            task.start().unwrap();
            task.complete(json!(run)).unwrap();
            gateway.save_task(&task, true).unwrap();
            task.rearm().unwrap();
        }
        let history = gateway.history(&task.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].result, Some(json!(2)));
        assert_eq!(history[2].result, Some(json!(4)));
    }

    #[test]
    fn test_failed_write_leaves_cache_untouched() {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone(), &EngineConfig::default());
        let mut task = Task::from_spec(TaskSpec::new("a"));
        gateway.save_task(&task, false).unwrap();

        store.set_failing(true);
        task.title = "renamed".to_string();
        assert!(matches!(gateway.save_task(&task, false), Err(Error::Persistence(_))));
        assert_eq!(gateway.get_task(&task.id).unwrap().unwrap().task.title, "a");
    }

    #[test]
    fn test_delete_evicts_cache() {
        let gateway = PersistenceGateway::in_memory(&EngineConfig::default());
        let task = Task::from_spec(TaskSpec::new("a"));
        gateway.save_task(&task, false).unwrap();
        assert_eq!(gateway.cached_tasks(), 1);
        assert!(gateway.delete_task(&task.id).unwrap());
        assert_eq!(gateway.cached_tasks(), 0);
        assert!(gateway.get_task(&task.id).unwrap().is_none());
    }

    #[test]
    fn test_metrics_recorded() {
        let gateway = PersistenceGateway::in_memory(&EngineConfig::default());
        let engine = Engine::new(EngineConfig::default());
        gateway.record_metrics(&engine.get_metrics()).unwrap();
        gateway.record_metrics(&engine.get_metrics()).unwrap();
        assert_eq!(gateway.recent_metrics(1).unwrap().len(), 1);
        assert_eq!(gateway.recent_metrics(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_loop_starts_once() {
        let gateway = Arc::new(PersistenceGateway::in_memory(&EngineConfig::default()));
        let engine = Engine::new(EngineConfig::default());
        let cancel = CancellationToken::new();
        let handle = gateway.spawn_sync(&engine, cancel.clone()).unwrap();
        assert!(gateway.spawn_sync(&engine, cancel.clone()).is_none());
        cancel.cancel();
        handle.await.unwrap();
    }
}
