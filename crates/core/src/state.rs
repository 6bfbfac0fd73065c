use crate::storage::StateStore;
use crate::types::{
    ExecutionContext, ExecutionId, ExecutionStatus, StepId, StepRecord, WorkflowExecution,
};
use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct CachedExecution {
    inserted_at: Instant,
    execution: WorkflowExecution,
}

/// Bounded-lifetime snapshot cache in front of the durable store
pub struct StateCache {
    ttl: Duration,
    entries: DashMap<ExecutionId, CachedExecution>,
}

impl StateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, id: &ExecutionId) -> Option<WorkflowExecution> {
        let expired = match self.entries.get(id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.execution.clone())
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(id);
        }
        None
    }

    pub fn put(&self, execution: WorkflowExecution) {
        self.entries.insert(
            execution.id,
            CachedExecution {
                inserted_at: Instant::now(),
                execution,
            },
        );
    }

    pub fn evict(&self, id: &ExecutionId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where an interrupted execution can pick up again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub last_successful_step: Option<StepId>,
    pub completed_steps: Vec<StepId>,
    pub resumable: bool,
}

/// Persists and retrieves execution progress.
///
/// Read-modify-write operations are serialized so a pause or cancel issued
/// while the executor saves progress is never lost.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    cache: StateCache,
    write_lock: Mutex<()>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: StateCache::new(cache_ttl),
            write_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Create and persist a `pending` execution
    pub async fn create_execution(
        &self,
        workflow_id: &str,
        workflow_revision: u32,
        parent_execution_id: Option<ExecutionId>,
        user_id: &str,
        input: Value,
    ) -> Result<WorkflowExecution> {
        let now = Utc::now();
        let execution = WorkflowExecution {
            id: ExecutionId::new(),
            workflow_id: workflow_id.to_string(),
            workflow_revision,
            parent_execution_id,
            user_id: user_id.to_string(),
            status: ExecutionStatus::Pending,
            current_step: None,
            state: ExecutionContext::new(input),
            output: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        self.store
            .save(&execution)
            .await
            .context("Failed to persist new execution")?;
        self.cache.put(execution.clone());

        tracing::info!(
            execution_id = %execution.id,
            workflow_id,
            user_id,
            "Created execution"
        );

        Ok(execution)
    }

    /// Cache first, falling back to the durable store
    pub async fn get_state(&self, id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        if let Some(execution) = self.cache.get(id) {
            return Ok(Some(execution));
        }

        let loaded = self.store.load(id).await?;
        if let Some(execution) = &loaded {
            if !execution.status.is_terminal() {
                self.cache.put(execution.clone());
            }
        }
        Ok(loaded)
    }

    /// Apply `change` to the stored execution. `change` returns whether
    /// anything changed; nothing is written otherwise.
    async fn update<F>(&self, id: &ExecutionId, change: F) -> Result<Option<WorkflowExecution>>
    where
        F: FnOnce(&mut WorkflowExecution) -> bool,
    {
        let _guard = self.write_lock.lock().await;

        let Some(mut execution) = self.get_state(id).await? else {
            return Ok(None);
        };

        if !change(&mut execution) {
            return Ok(None);
        }

        execution.updated_at = Utc::now();
        self.store
            .save(&execution)
            .await
            .with_context(|| format!("Failed to persist execution {}", id))?;

        if execution.status.is_terminal() {
            self.cache.evict(id);
        } else {
            self.cache.put(execution.clone());
        }

        Ok(Some(execution))
    }

    /// Overwrite current step, context and status
    pub async fn save_state(
        &self,
        id: &ExecutionId,
        current_step: Option<StepId>,
        context: &ExecutionContext,
        status: ExecutionStatus,
    ) -> Result<()> {
        self.update(id, |execution| {
            execution.current_step = current_step;
            execution.state = context.clone();
            execution.retry_count = retries_in(context);
            execution.status = status;
            true
        })
        .await?;
        Ok(())
    }

    /// Overwrite current step and context, leaving the status alone
    pub async fn save_progress(
        &self,
        id: &ExecutionId,
        current_step: Option<StepId>,
        context: &ExecutionContext,
    ) -> Result<()> {
        self.update(id, |execution| {
            execution.current_step = current_step;
            execution.state = context.clone();
            execution.retry_count = retries_in(context);
            true
        })
        .await?;
        Ok(())
    }

    /// Mark `step_id` as current; the first step flips `pending` to `running`
    pub async fn record_step_start(&self, id: &ExecutionId, step_id: &StepId) -> Result<()> {
        self.update(id, |execution| {
            execution.current_step = Some(step_id.clone());
            if execution.status == ExecutionStatus::Pending {
                execution.status = ExecutionStatus::Running;
                execution.started_at = Some(Utc::now());
            }
            true
        })
        .await?;
        Ok(())
    }

    pub async fn record_step_completion(
        &self,
        id: &ExecutionId,
        step_id: &StepId,
        record: StepRecord,
    ) -> Result<()> {
        self.update(id, |execution| {
            execution.state.record(step_id.clone(), record);
            execution.retry_count = retries_in(&execution.state);
            true
        })
        .await?;
        Ok(())
    }

    pub async fn record_execution_complete(&self, id: &ExecutionId, output: Value) -> Result<()> {
        self.update(id, |execution| {
            execution.status = ExecutionStatus::Completed;
            execution.output = Some(output);
            execution.error_message = None;
            execution.completed_at = Some(Utc::now());
            true
        })
        .await?;
        self.cache.evict(id);
        Ok(())
    }

    pub async fn record_execution_failure(&self, id: &ExecutionId, error: &str) -> Result<()> {
        self.update(id, |execution| {
            execution.status = ExecutionStatus::Failed;
            execution.error_message = Some(error.to_string());
            execution.completed_at = Some(Utc::now());
            true
        })
        .await?;
        self.cache.evict(id);
        Ok(())
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        allowed: &[ExecutionStatus],
        target: ExecutionStatus,
    ) -> Result<bool> {
        let updated = self
            .update(id, |execution| {
                if !allowed.contains(&execution.status) {
                    tracing::debug!(
                        execution_id = %execution.id,
                        from = %execution.status,
                        to = %target,
                        "Ignoring invalid status transition"
                    );
                    return false;
                }
                execution.status = target;
                if target.is_terminal() {
                    execution.completed_at = Some(Utc::now());
                }
                true
            })
            .await?;

        Ok(updated.is_some())
    }

    /// `running -> paused`
    pub async fn pause(&self, id: &ExecutionId) -> Result<bool> {
        self.transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused)
            .await
    }

    /// `paused -> running`
    pub async fn resume(&self, id: &ExecutionId) -> Result<bool> {
        self.transition(id, &[ExecutionStatus::Paused], ExecutionStatus::Running)
            .await
    }

    /// `{pending, running, paused} -> cancelled`
    pub async fn cancel(&self, id: &ExecutionId) -> Result<bool> {
        self.transition(
            id,
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
            ],
            ExecutionStatus::Cancelled,
        )
        .await
    }

    /// Crash recovery: put a `running` or `failed` execution back to
    /// `running`, dropping step records that did not succeed along with the
    /// `stale` records derived from them
    pub async fn reopen_for_recovery(&self, id: &ExecutionId, stale: &[StepId]) -> Result<bool> {
        let updated = self
            .update(id, |execution| {
                if !matches!(
                    execution.status,
                    ExecutionStatus::Running | ExecutionStatus::Failed
                ) {
                    return false;
                }
                let dropped: Vec<StepId> = execution
                    .state
                    .steps
                    .iter()
                    .filter(|(id, record)| !record.success || stale.contains(id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for step_id in dropped {
                    execution.state.steps.remove(&step_id);
                    execution.state.completion_order.retain(|id| id != &step_id);
                }
                execution.state.version += 1;
                execution.status = ExecutionStatus::Running;
                execution.error_message = None;
                execution.completed_at = None;
                true
            })
            .await?;

        Ok(updated.is_some())
    }

    /// Last successful step and whether the execution can be resumed
    pub async fn recover(&self, id: &ExecutionId) -> Result<Option<RecoveryPoint>> {
        let Some(execution) = self.get_state(id).await? else {
            return Ok(None);
        };

        let last_successful_step = execution
            .state
            .completion_order
            .iter()
            .rev()
            .find(|step_id| {
                execution
                    .state
                    .steps
                    .get(*step_id)
                    .is_some_and(|record| record.success)
            })
            .cloned();

        Ok(Some(RecoveryPoint {
            execution_id: execution.id,
            status: execution.status,
            last_successful_step,
            completed_steps: execution.state.completion_order.clone(),
            resumable: matches!(
                execution.status,
                ExecutionStatus::Running | ExecutionStatus::Failed | ExecutionStatus::Paused
            ),
        }))
    }
}

fn retries_in(context: &ExecutionContext) -> u32 {
    context
        .steps
        .values()
        .map(|record| record.attempts.saturating_sub(1))
        .sum()
}
