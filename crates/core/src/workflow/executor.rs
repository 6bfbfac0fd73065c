use super::dag::EdgeKind;
use super::handlers::{loop_step, merge, sub_workflow};
use super::parser::{self, ParsedWorkflow};
use super::step_executor::{
    normalize_output, AgentInvoker, ApiInvoker, DisabledApiInvoker, Invocation, StepExecutor,
    StepScope,
};
use crate::condition;
use crate::config::EngineConfig;
use crate::error::{EvaluationError, ExecutorError, ExecutorResult, ParseError, StepError};
use crate::events::{self, EventSink, EventType, NullEventSink};
use crate::state::StateManager;
use crate::storage::{DefinitionStore, StoredDefinition};
use crate::template;
use crate::types::{
    ExecutionContext, ExecutionId, ExecutionOutcome, ExecutionStatus, FailurePolicy, SkipReason,
    StepDefinition, StepId, StepRecord, StepType, WorkflowDefinition, WorkflowExecution,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the main loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Completed,
    Paused,
    Cancelled,
}

/// Entry in `WorkflowExecutor::active`, removed when dropped
struct ActiveRun<'a> {
    active: &'a DashMap<ExecutionId, CancellationToken>,
    id: ExecutionId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

/// Workflow executor that coordinates DAG execution.
///
/// One coordinating loop drives each execution. Concurrency only exists
/// inside a parallel group, whose members are awaited together before the
/// group is recorded.
pub struct WorkflowExecutor {
    state: Arc<StateManager>,
    definitions: Arc<dyn DefinitionStore>,
    events: Arc<dyn EventSink>,
    steps: StepExecutor,
    config: EngineConfig,
    // Parsed workflows keyed by definition fingerprint
    parsed: DashMap<String, Arc<ParsedWorkflow>>,
    // Cancellation tokens of executions driven by this executor
    active: DashMap<ExecutionId, CancellationToken>,
}

impl WorkflowExecutor {
    pub fn new(
        state: Arc<StateManager>,
        definitions: Arc<dyn DefinitionStore>,
        agents: Arc<dyn AgentInvoker>,
        config: EngineConfig,
    ) -> Self {
        let events: Arc<dyn EventSink> = Arc::new(NullEventSink);
        let steps = StepExecutor::new(
            agents,
            Arc::new(DisabledApiInvoker),
            events.clone(),
            config.clone(),
        );

        Self {
            state,
            definitions,
            events,
            steps,
            config,
            parsed: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.steps.set_event_sink(events.clone());
        self.events = events;
        self
    }

    pub fn with_api_invoker(mut self, apis: Arc<dyn ApiInvoker>) -> Self {
        self.steps.set_api_invoker(apis);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn definitions(&self) -> &dyn DefinitionStore {
        self.definitions.as_ref()
    }

    /// Execute the latest revision of a workflow (by id or name slug)
    pub async fn execute(
        &self,
        workflow_ref: &str,
        input: Value,
        user_id: &str,
    ) -> ExecutorResult<ExecutionOutcome> {
        let stored = self
            .definitions
            .get(workflow_ref, None)
            .await?
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_ref.to_string()))?;

        self.start(stored, input, user_id, None, 0, CancellationToken::new())
            .await
    }

    /// Execute a nested workflow on behalf of a parent step
    pub(crate) fn run_child<'a>(
        &'a self,
        stored: StoredDefinition,
        input: Value,
        parent: &'a StepScope,
    ) -> BoxFuture<'a, ExecutorResult<ExecutionOutcome>> {
        Box::pin(async move {
            self.start(
                stored,
                input,
                &parent.user_id,
                Some(parent.execution_id),
                parent.depth + 1,
                parent.token.child_token(),
            )
            .await
        })
    }

    /// Move a running execution to `paused`; it stops at the next sweep boundary
    pub async fn pause(&self, id: &ExecutionId) -> ExecutorResult<bool> {
        self.require_execution(id).await?;

        let paused = self.state.pause(id).await?;
        if paused {
            tracing::info!(execution_id = %id, "Execution paused");
            events::emit(self.events.as_ref(), *id, EventType::ExecutionPaused).await;
        }
        Ok(paused)
    }

    /// Cancel a non-terminal execution and interrupt its in-flight calls
    pub async fn cancel(&self, id: &ExecutionId) -> ExecutorResult<bool> {
        self.require_execution(id).await?;

        let cancelled = self.state.cancel(id).await?;
        let token = self.active.get(id).map(|entry| entry.value().clone());

        match token {
            // The driving loop reports the cancellation once it stops
            Some(token) => token.cancel(),
            None if cancelled => {
                tracing::info!(execution_id = %id, "Execution cancelled");
                events::emit(self.events.as_ref(), *id, EventType::ExecutionCancelled).await;
            }
            None => {}
        }

        Ok(cancelled)
    }

    /// Continue a paused execution, or recover one left `running`/`failed`
    /// by a crash. Steps with a successful record are never re-run.
    pub async fn resume(&self, id: &ExecutionId) -> ExecutorResult<ExecutionOutcome> {
        let execution = self.require_execution(id).await?;
        if !matches!(
            execution.status,
            ExecutionStatus::Paused | ExecutionStatus::Running | ExecutionStatus::Failed
        ) {
            return Err(ExecutorError::NotResumable {
                id: *id,
                status: execution.status,
            });
        }

        // A resumed child still answers to its parent's cancellation
        let token = execution
            .parent_execution_id
            .and_then(|parent| self.active.get(&parent).map(|entry| entry.value().child_token()))
            .unwrap_or_else(CancellationToken::new);
        let Some(_run) = self.claim(*id, &token) else {
            return Err(ExecutorError::NotResumable {
                id: *id,
                status: execution.status,
            });
        };

        let stored = self
            .definitions
            .get(&execution.workflow_id, Some(execution.workflow_revision))
            .await?
            .ok_or_else(|| ExecutorError::WorkflowNotFound(execution.workflow_id.clone()))?;

        let parsed = match self.parse_cached(&stored.definition) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(id, e.into()).await,
        };

        let reopened = match execution.status {
            ExecutionStatus::Paused => self.state.resume(id).await?,
            _ => {
                let stale = stale_records(&parsed, &execution.state);
                tracing::debug!(execution_id = %id, stale = ?stale, "Discarding step records");
                self.state.reopen_for_recovery(id, &stale).await?
            }
        };
        if !reopened {
            return Err(ExecutorError::NotResumable {
                id: *id,
                status: execution.status,
            });
        }

        let execution = self.require_execution(id).await?;
        let depth = self.nesting_depth(&execution).await?;

        tracing::info!(
            execution_id = %id,
            completed_steps = execution.state.steps.len(),
            depth,
            "Resuming execution"
        );
        events::emit(self.events.as_ref(), *id, EventType::ExecutionResumed).await;

        let scope = StepScope {
            execution_id: *id,
            user_id: execution.user_id.clone(),
            depth,
            token,
        };
        self.drive(&scope, &parsed, execution.state).await
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> ExecutorResult<Option<WorkflowExecution>> {
        Ok(self.state.get_state(id).await?)
    }

    /// Parse a definition, reusing earlier results for identical definitions
    pub fn parse_cached(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Arc<ParsedWorkflow>, ParseError> {
        let key = parser::fingerprint(definition)?;
        if let Some(parsed) = self.parsed.get(&key) {
            return Ok(parsed.value().clone());
        }

        let parsed = Arc::new(parser::from_definition(definition.clone())?);
        self.parsed.insert(key, parsed.clone());
        Ok(parsed)
    }

    /// Register the loop driving an execution; `None` if one already runs
    fn claim(&self, id: ExecutionId, token: &CancellationToken) -> Option<ActiveRun<'_>> {
        match self.active.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Some(ActiveRun {
                    active: &self.active,
                    id,
                })
            }
        }
    }

    /// Number of parent executions above this one
    async fn nesting_depth(&self, execution: &WorkflowExecution) -> ExecutorResult<u32> {
        let mut depth = 0;
        let mut parent = execution.parent_execution_id;
        while let Some(parent_id) = parent {
            depth += 1;
            if depth > self.config.max_sub_workflow_depth {
                break;
            }
            parent = self
                .state
                .get_state(&parent_id)
                .await?
                .and_then(|p| p.parent_execution_id);
        }
        Ok(depth)
    }

    async fn require_execution(&self, id: &ExecutionId) -> ExecutorResult<WorkflowExecution> {
        self.state
            .get_state(id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(*id))
    }

    async fn start(
        &self,
        stored: StoredDefinition,
        input: Value,
        user_id: &str,
        parent_execution_id: Option<ExecutionId>,
        depth: u32,
        token: CancellationToken,
    ) -> ExecutorResult<ExecutionOutcome> {
        let execution = self
            .state
            .create_execution(
                &stored.workflow_id,
                stored.revision,
                parent_execution_id,
                user_id,
                input,
            )
            .await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %stored.workflow_id,
            revision = stored.revision,
            depth,
            "Starting workflow execution"
        );

        let parsed = match self.parse_cached(&stored.definition) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(&execution.id, e.into()).await,
        };

        let _run = self.claim(execution.id, &token);
        let scope = StepScope {
            execution_id: execution.id,
            user_id: user_id.to_string(),
            depth,
            token,
        };
        self.drive(&scope, &parsed, execution.state).await
    }

    /// Run the main loop and persist how it ended. The caller holds the
    /// execution's claim in `active`.
    async fn drive(
        &self,
        scope: &StepScope,
        parsed: &ParsedWorkflow,
        mut context: ExecutionContext,
    ) -> ExecutorResult<ExecutionOutcome> {
        let id = scope.execution_id;

        match self.run_loop(scope, parsed, &mut context).await {
            Ok(LoopExit::Completed) => {
                let output = context.final_output();
                self.state.record_execution_complete(&id, output.clone()).await?;

                tracing::info!(execution_id = %id, "Workflow execution completed");
                events::emit(
                    self.events.as_ref(),
                    id,
                    EventType::ExecutionComplete {
                        success: true,
                        output: output.clone(),
                    },
                )
                .await;

                Ok(ExecutionOutcome {
                    success: true,
                    execution_id: id,
                    status: ExecutionStatus::Completed,
                    output: Some(output),
                    error: None,
                    completed_at: Some(Utc::now()),
                })
            }
            Ok(LoopExit::Paused) => {
                tracing::info!(execution_id = %id, "Execution stopped at pause");
                Ok(interrupted(id, ExecutionStatus::Paused))
            }
            Ok(LoopExit::Cancelled) => {
                tracing::info!(execution_id = %id, "Execution cancelled");
                events::emit(self.events.as_ref(), id, EventType::ExecutionCancelled).await;
                Ok(interrupted(id, ExecutionStatus::Cancelled))
            }
            Err(e) => self.fail(&id, e).await,
        }
    }

    /// Persist an execution-level failure and report it to the host
    async fn fail(
        &self,
        id: &ExecutionId,
        error: ExecutorError,
    ) -> ExecutorResult<ExecutionOutcome> {
        let message = error.to_string();
        tracing::error!(execution_id = %id, error = %message, "Workflow execution failed");

        self.state.record_execution_failure(id, &message).await?;

        let step_id = match &error {
            ExecutorError::StepAborted { step_id, .. } => Some(step_id.as_str().into()),
            _ => None,
        };
        events::emit(
            self.events.as_ref(),
            *id,
            EventType::ExecutionError {
                message: "Workflow execution failed".to_string(),
                error: message.clone(),
                step_id,
            },
        )
        .await;

        Ok(ExecutionOutcome {
            success: false,
            execution_id: *id,
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(message),
            completed_at: Some(Utc::now()),
        })
    }

    /// Stop at a sweep boundary when the execution was paused or cancelled
    async fn check_control(&self, scope: &StepScope) -> ExecutorResult<Option<LoopExit>> {
        let id = scope.execution_id;
        if scope.token.is_cancelled() {
            self.state.cancel(&id).await?;
            return Ok(Some(LoopExit::Cancelled));
        }

        let execution = self
            .state
            .get_state(&id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(id))?;

        Ok(match execution.status {
            ExecutionStatus::Paused => Some(LoopExit::Paused),
            ExecutionStatus::Cancelled => {
                // Cancelled elsewhere; stop nested executions too
                scope.token.cancel();
                Some(LoopExit::Cancelled)
            }
            _ => None,
        })
    }

    async fn run_loop(
        &self,
        scope: &StepScope,
        parsed: &ParsedWorkflow,
        context: &mut ExecutionContext,
    ) -> ExecutorResult<LoopExit> {
        let total = parsed.steps().len();

        loop {
            if let Some(exit) = self.check_control(scope).await? {
                return Ok(exit);
            }

            let remaining: Vec<&StepDefinition> = parsed
                .steps()
                .iter()
                .filter(|s| !context.is_complete(s.id.as_str()))
                .collect();
            if remaining.is_empty() {
                return Ok(LoopExit::Completed);
            }

            let ready: Vec<&StepDefinition> = remaining
                .iter()
                .copied()
                .filter(|s| {
                    parsed
                        .dag()
                        .predecessors(s.id.as_str())
                        .iter()
                        .all(|(pred, _)| context.is_complete(pred.as_str()))
                })
                .collect();

            let unrouted: Vec<&StepDefinition> = ready
                .iter()
                .copied()
                .filter(|s| !route_taken(parsed, context, s))
                .collect();
            if !unrouted.is_empty() {
                for step in unrouted {
                    self.skip_step(scope, context, step, SkipReason::RouteNotTaken)
                        .await?;
                }
                continue;
            }

            let admitted: Vec<&StepDefinition> = ready
                .into_iter()
                .filter(|s| admitted_by_branch(parsed, context, s))
                .collect();
            if admitted.is_empty() {
                let stuck: Vec<String> = remaining.iter().map(|s| s.id.to_string()).collect();
                tracing::error!(
                    execution_id = %scope.execution_id,
                    stuck = ?stuck,
                    "No ready steps while steps remain"
                );
                return Err(ExecutorError::Deadlock { stuck });
            }

            for (i, group) in plan_groups(&admitted).into_iter().enumerate() {
                if i > 0 {
                    if let Some(exit) = self.check_control(scope).await? {
                        return Ok(exit);
                    }
                }
                self.run_group(scope, parsed, context, &group, total).await?;
            }
        }
    }

    /// Run one group (a singleton or a parallel group), record every member,
    /// and persist a single combined snapshot
    async fn run_group(
        &self,
        scope: &StepScope,
        parsed: &ParsedWorkflow,
        context: &mut ExecutionContext,
        group: &[&StepDefinition],
        total: usize,
    ) -> ExecutorResult<()> {
        let id = scope.execution_id;
        let done = context.steps.len();

        for (offset, &step) in group.iter().enumerate() {
            self.state.record_step_start(&id, &step.id).await?;
            tracing::info!(
                execution_id = %id,
                step_id = %step.id,
                step_type = step.step_type.as_str(),
                "Starting step"
            );
            events::emit(
                self.events.as_ref(),
                id,
                EventType::StepStarted {
                    step_id: step.id.clone(),
                    name: step.display_name().to_string(),
                    order: done + offset + 1,
                    total,
                },
            )
            .await;
        }

        let snapshot = context.to_value();
        let records: Vec<StepRecord> = match group {
            [step] => vec![self.run_step(scope, step, parsed.steps(), snapshot).await],
            _ => {
                join_all(
                    group
                        .iter()
                        .map(|&step| self.run_step(scope, step, parsed.steps(), snapshot.clone())),
                )
                .await
            }
        };

        if scope.token.is_cancelled() {
            tracing::info!(execution_id = %id, "Discarding results of cancelled group");
            return Ok(());
        }

        let mut aborted = None;
        for (&step, mut record) in group.iter().zip(records) {
            if step.branch_group.is_some() && record.skipped {
                record.skip_reason = Some(SkipReason::BranchNotTaken);
            }

            if !record.success && step.on_error == FailurePolicy::Abort && aborted.is_none() {
                aborted = Some(ExecutorError::StepAborted {
                    step_id: step.id.to_string(),
                    message: record.error.clone().unwrap_or_default(),
                });
            }

            let claims = !record.skipped;
            self.publish_record(id, step, &record).await;
            context.record(step.id.clone(), record);

            // The first member that runs claims its branch group
            if let Some(group_name) = step.branch_group.as_deref().filter(|_| claims) {
                for sibling in parsed.branch_members(group_name) {
                    if !context.is_complete(sibling.id.as_str()) {
                        let skipped = StepRecord::skipped(SkipReason::BranchNotTaken);
                        self.publish_record(id, sibling, &skipped).await;
                        context.record(sibling.id.clone(), skipped);
                    }
                }
            }
        }

        let current = group.last().map(|s| s.id.clone());
        self.state.save_progress(&id, current, context).await?;

        let completed = context.steps.len();
        events::emit(
            self.events.as_ref(),
            id,
            EventType::ProgressUpdate {
                percent: progress_percent(completed, total),
                current: completed,
                total,
            },
        )
        .await;

        match aborted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn skip_step(
        &self,
        scope: &StepScope,
        context: &mut ExecutionContext,
        step: &StepDefinition,
        reason: SkipReason,
    ) -> ExecutorResult<()> {
        tracing::info!(
            execution_id = %scope.execution_id,
            step_id = %step.id,
            reason = ?reason,
            "Skipping step"
        );

        let record = StepRecord::skipped(reason);
        self.publish_record(scope.execution_id, step, &record).await;
        context.record(step.id.clone(), record.clone());
        self.state
            .record_step_completion(&scope.execution_id, &step.id, record)
            .await?;
        Ok(())
    }

    async fn publish_record(&self, id: ExecutionId, step: &StepDefinition, record: &StepRecord) {
        let event = if record.skipped {
            EventType::StepSkipped {
                step_id: step.id.clone(),
                reason: record.skip_reason.unwrap_or(SkipReason::ConditionFalse),
            }
        } else {
            EventType::StepCompleted {
                step_id: step.id.clone(),
                name: step.display_name().to_string(),
                success: record.success,
                result: if record.success {
                    record.output.clone()
                } else {
                    serde_json::json!({ "error": record.error })
                },
            }
        };
        events::emit(self.events.as_ref(), id, event).await;
    }

    /// Evaluate guards and dispatch one step. Step-local failures end up in
    /// the returned record rather than as errors.
    pub(crate) fn run_step<'a>(
        &'a self,
        scope: &'a StepScope,
        step: &'a StepDefinition,
        siblings: &'a [StepDefinition],
        context: Value,
    ) -> BoxFuture<'a, StepRecord> {
        Box::pin(async move {
            let started_at = Utc::now();

            let invocation = match evaluate_guards(step, &context) {
                Ok(Some(reason)) => {
                    tracing::debug!(
                        execution_id = %scope.execution_id,
                        step_id = %step.id,
                        reason = ?reason,
                        "Step guard skipped step"
                    );
                    return StepRecord::skipped(reason);
                }
                Ok(None) if step.step_type == StepType::Merge => {
                    match merge::run(step, siblings, &context) {
                        Some(output) => Invocation::once(Ok(output)),
                        None => return StepRecord::nothing_merged(),
                    }
                }
                Ok(None) => self.dispatch(scope, step, &context).await,
                Err(e) => Invocation {
                    result: Err(e.into()),
                    attempts: 0,
                },
            };

            let completed_at = Some(Utc::now());
            match invocation.result {
                Ok(output) => StepRecord {
                    success: true,
                    output: normalize_output(output),
                    skipped: false,
                    skip_reason: None,
                    error: None,
                    attempts: invocation.attempts,
                    started_at: Some(started_at),
                    completed_at,
                },
                Err(e) => {
                    tracing::warn!(
                        execution_id = %scope.execution_id,
                        step_id = %step.id,
                        attempts = invocation.attempts,
                        error = %e,
                        "Step failed"
                    );
                    StepRecord {
                        success: false,
                        output: Value::Null,
                        skipped: false,
                        skip_reason: None,
                        error: Some(e.to_string()),
                        attempts: invocation.attempts,
                        started_at: Some(started_at),
                        completed_at,
                    }
                }
            }
        })
    }

    /// Merge steps are resolved by `run_step` and never get here
    async fn dispatch(&self, scope: &StepScope, step: &StepDefinition, context: &Value) -> Invocation {
        match step.step_type {
            StepType::Loop => Invocation::once(loop_step::run(self, scope, step, context).await),
            _ => {
                let inputs = match template::resolve_value(&step.inputs, context) {
                    Ok(inputs) => inputs,
                    Err(e) => return Invocation::once(Err(StepError::from(e))),
                };

                match step.step_type {
                    StepType::ApiCall => self.steps.run_api(scope, step, inputs).await,
                    StepType::SubWorkflow => Invocation::once(
                        sub_workflow::run(self, scope, step, context, inputs).await,
                    ),
                    _ => self.steps.run_agent(scope, step, inputs).await,
                }
            }
        }
    }
}

/// `skip_if` first, then `condition`; empty expressions never skip
fn evaluate_guards(
    step: &StepDefinition,
    context: &Value,
) -> Result<Option<SkipReason>, EvaluationError> {
    if let Some(expr) = step.skip_if.as_deref().filter(|e| !e.trim().is_empty()) {
        if condition::evaluate(expr, context)? {
            return Ok(Some(SkipReason::SkipIf));
        }
    }

    if let Some(expr) = step.condition.as_deref() {
        if !condition::evaluate(expr, context)? {
            return Ok(Some(SkipReason::ConditionFalse));
        }
    }

    Ok(None)
}

/// A step with incoming route edges runs only if at least one was taken
fn route_taken(parsed: &ParsedWorkflow, context: &ExecutionContext, step: &StepDefinition) -> bool {
    let routes = parsed.dag().route_sources(step.id.as_str());
    if routes.is_empty() {
        return true;
    }

    routes.iter().any(|(source, kind)| {
        context
            .steps
            .get(source.as_str())
            .is_some_and(|record| {
                !record.is_pruned()
                    && match kind {
                        EdgeKind::OnSuccess => record.success,
                        EdgeKind::OnFailure => !record.success,
                        _ => false,
                    }
            })
    })
}

/// Records a crash recovery must discard: failed steps, plus every record
/// decided by them. A route target or branch sibling of a discarded step is
/// decided by it, and so is anything downstream of such a decided record.
/// Plain `depends_on` dependents of a failed step keep their records.
fn stale_records(parsed: &ParsedWorkflow, context: &ExecutionContext) -> Vec<StepId> {
    let dag = parsed.dag();
    let mut stale: Vec<(StepId, bool)> = context
        .steps
        .iter()
        .filter(|(_, record)| !record.success)
        .map(|(id, _)| (id.clone(), false))
        .collect();

    let mut next = 0;
    while next < stale.len() {
        let (source, derived) = stale[next].clone();
        next += 1;

        let mut decided: Vec<StepId> = dag
            .dependents(source.as_str())
            .into_iter()
            .filter(|dependent| {
                derived
                    || dag.predecessors(dependent.as_str()).iter().any(|(pred, kind)| {
                        *pred == source && (kind.is_route() || *kind == EdgeKind::MergeAfter)
                    })
            })
            .collect();
        if let Some(group) = parsed
            .step(source.as_str())
            .and_then(|step| step.branch_group.as_deref())
        {
            decided.extend(parsed.branch_members(group).map(|member| member.id.clone()));
        }

        for step_id in decided {
            if context.is_complete(step_id.as_str()) && !stale.iter().any(|(id, _)| *id == step_id) {
                stale.push((step_id, true));
            }
        }
    }

    stale.into_iter().map(|(id, _)| id).collect()
}

/// Only the first unevaluated member of a branch group may run in a sweep
fn admitted_by_branch(
    parsed: &ParsedWorkflow,
    context: &ExecutionContext,
    step: &StepDefinition,
) -> bool {
    match step.branch_group.as_deref() {
        None => true,
        Some(group) => parsed
            .branch_members(group)
            .find(|member| !context.is_complete(member.id.as_str()))
            .is_some_and(|first| first.id == step.id),
    }
}

/// Members sharing a parallel key form one group at the position of the
/// first member; everything else runs alone, in definition order
fn plan_groups<'a>(admitted: &[&'a StepDefinition]) -> Vec<Vec<&'a StepDefinition>> {
    let mut groups: Vec<Vec<&'a StepDefinition>> = Vec::new();
    let mut by_key: HashMap<&'a str, usize> = HashMap::new();

    for &step in admitted {
        match step.parallel_key() {
            Some(key) => match by_key.get(key) {
                Some(&index) => groups[index].push(step),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push(vec![step]);
                }
            },
            None => groups.push(vec![step]),
        }
    }

    groups
}

fn progress_percent(completed: usize, total: usize) -> u8 {
    (completed * 100 / total.max(1)).min(100) as u8
}

fn interrupted(id: ExecutionId, status: ExecutionStatus) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        execution_id: id,
        status,
        output: None,
        error: Some(format!("execution {}", status)),
        completed_at: None,
    }
}
