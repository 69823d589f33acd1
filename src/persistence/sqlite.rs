//! SQLite-backed store.
//!
//! Entities are stored as JSON documents next to a few indexed columns;
//! the schema is created on open.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::task::TaskId;
use crate::error::Result;
use crate::persistence::{MetricsSample, Store, TaskRecord};
use crate::workflow::{Workflow, WorkflowExecution};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        data TEXT NOT NULL          -- TaskRecord as JSON
    );

    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);

    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at TEXT NOT NULL,
        data TEXT NOT NULL
    );
";

/// Store backed by one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_documents<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(serde_json::from_str(&row?)?);
        }
        Ok(documents)
    }
}

impl Store for SqliteStore {
    fn upsert_task(&self, record: &TaskRecord) -> Result<()> {
        let data = serde_json::to_string(record)?;
        let task = &record.task;
        self.conn().execute(
            "INSERT OR REPLACE INTO tasks (id, status, created_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id.to_string(),
                task.status.to_string(),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                data
            ],
        )?;
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        let data: Option<String> = self
            .conn()
            .query_row("SELECT data FROM tasks WHERE id = ?1", params![id.to_string()], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.load_documents("SELECT data FROM tasks ORDER BY created_at")
    }

    fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }

    fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let data = serde_json::to_string(workflow)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO workflows (id, name, created_at, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                workflow.id.to_string(),
                workflow.name,
                workflow.created_at.to_rfc3339(),
                data
            ],
        )?;
        Ok(())
    }

    fn load_workflows(&self) -> Result<Vec<Workflow>> {
        self.load_documents("SELECT data FROM workflows ORDER BY created_at")
    }

    fn upsert_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let data = serde_json::to_string(execution)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO executions (id, workflow_id, status, started_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution.id.to_string(),
                execution.workflow_id.to_string(),
                execution.status.to_string(),
                execution.started_at.to_rfc3339(),
                data
            ],
        )?;
        Ok(())
    }

    fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
        self.load_documents("SELECT data FROM executions ORDER BY started_at")
    }

    fn append_metrics(&self, sample: &MetricsSample) -> Result<()> {
        let data = serde_json::to_string(sample)?;
        self.conn().execute(
            "INSERT INTO metrics (recorded_at, data) VALUES (?1, ?2)",
            params![sample.recorded_at.to_rfc3339(), data],
        )?;
        Ok(())
    }

    fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricsSample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM metrics ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(serde_json::from_str(&row?)?);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{Task, TaskSpec, TaskStatus};
    use crate::persistence::HistoryEntry;
    use crate::workflow::{StepSpec, WorkflowId};
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("cadence.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.load_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_task_upsert_load_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = TaskRecord::new(Task::from_spec(TaskSpec::new("Book venue").category("venue")));
        store.upsert_task(&record).unwrap();

        record.task.start().unwrap();
        record.task.complete(serde_json::json!({"booked": true})).unwrap();
        record.push_history(HistoryEntry::from_task(&record.task), 50);
        store.upsert_task(&record).unwrap();

        let loaded = store.load_task(&record.task.id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.task.status, TaskStatus::Completed);
        assert_eq!(store.load_tasks().unwrap().len(), 1);

        assert!(store.delete_task(&record.task.id).unwrap());
        assert!(store.load_task(&record.task.id).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cadence.db");
        let record = TaskRecord::new(Task::from_spec(TaskSpec::new("a")));
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_task(&record).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_tasks().unwrap(), vec![record]);
    }

    #[test]
    fn test_workflow_and_execution_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let workflow = Workflow {
            id: WorkflowId::new(),
            name: "plan".to_string(),
            description: String::new(),
            steps: crate::workflow::level::normalize(vec![StepSpec::new("a", TaskSpec::new("a"))]).unwrap(),
            created_at: chrono::Utc::now(),
            execution_count: 0,
        };
        store.upsert_workflow(&workflow).unwrap();
        let execution = WorkflowExecution::new(workflow.id, serde_json::json!({"guests": 10}));
        store.upsert_execution(&execution).unwrap();

        assert_eq!(store.load_workflows().unwrap(), vec![workflow]);
        assert_eq!(store.load_executions().unwrap(), vec![execution]);
    }
}
