use crate::types::{ExecutionId, WorkflowExecution};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

const EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Durable store of execution snapshots
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace the snapshot for `execution.id`
    async fn save(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn load(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>>;

    async fn delete(&self, id: &ExecutionId) -> Result<()>;

    /// All executions, most recently created first
    async fn list(&self) -> Result<Vec<WorkflowExecution>>;
}

/// State store backed by a single redb file
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _executions = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl StateStore for RedbStateStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;

            let key = execution.id.to_string();
            let value = serde_json::to_vec(execution).context("Failed to serialize execution")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert execution")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    async fn load(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("Failed to get execution")? {
            Some(guard) => {
                let execution: WorkflowExecution = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize execution")?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &ExecutionId) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open table")?;
            table
                .remove(id.to_string().as_str())
                .context("Failed to remove execution")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowExecution>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let mut executions = Vec::new();
        for item in table.iter().context("Failed to iterate executions")? {
            let (_key, value) = item.context("Failed to read item")?;
            let execution: WorkflowExecution = serde_json::from_slice(value.value())
                .context("Failed to deserialize execution")?;
            executions.push(execution);
        }

        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }
}

/// In-process state store for tests and embedded use
#[derive(Default)]
pub struct MemoryStateStore {
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &ExecutionId) -> Result<()> {
        self.executions.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<_> = self.executions.read().await.values().cloned().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }
}
