use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within one workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::borrow::Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Agent,
    Merge,
    Loop,
    SubWorkflow,
    ApiCall,
    FileGeneration,
    RepoCreation,
}

impl StepType {
    /// Step types whose work is delegated to an agent backend
    pub fn is_agent_backed(self) -> bool {
        matches!(self, Self::Agent | Self::FileGeneration | Self::RepoCreation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Merge => "merge",
            Self::Loop => "loop",
            Self::SubWorkflow => "sub_workflow",
            Self::ApiCall => "api_call",
            Self::FileGeneration => "file_generation",
            Self::RepoCreation => "repo_creation",
        }
    }
}

/// What happens to the execution when a step exhausts its retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure on the step and keep scheduling
    #[default]
    Continue,
    /// Fail the whole execution
    Abort,
}

/// Authored workflow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// Specification for a single workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Templated inputs, resolved against the execution context
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<StepId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_group: Option<String>,
    /// Branch group this step waits on (merge steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_after: Option<String>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<SubWorkflowConfig>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_error: FailurePolicy,
}

impl StepDefinition {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Key of the concurrent group this step belongs to, if any
    pub fn parallel_key(&self) -> Option<&str> {
        match self.parallel_group.as_deref() {
            Some(group) if !group.is_empty() => Some(group),
            _ if self.parallel => Some(""),
            _ => None,
        }
    }

    /// Agent reference used when dispatching to the agent backend
    pub fn agent_ref(&self) -> Option<&str> {
        match self.agent.as_deref() {
            Some(agent) if !agent.trim().is_empty() => Some(agent),
            _ if self.step_type.is_agent_backed() && self.step_type != StepType::Agent => {
                Some(self.step_type.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    For,
    While,
}

/// Configuration of a `loop` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(rename = "type")]
    pub kind: LoopKind,
    /// Array (or `{{path}}` to one) iterated by `for` loops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Re-evaluated before every `while` iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    pub steps: Vec<StepDefinition>,
}

fn default_item_var() -> String {
    "item".to_string()
}

/// Configuration of a `sub_workflow` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    /// Workflow id or slug
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    /// sub-workflow input key -> parent context path
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// parent output key -> path into the sub-workflow output
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

/// Why a step was marked skipped instead of running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SkipIf,
    ConditionFalse,
    BranchNotTaken,
    RouteNotTaken,
    /// Merge step whose branch members were all skipped
    NothingToMerge,
}

impl SkipReason {
    /// Pruned steps never fire their outgoing routes
    pub fn prunes(self) -> bool {
        matches!(self, Self::BranchNotTaken | Self::RouteNotTaken)
    }
}

/// Persisted result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn skipped(reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            success: true,
            output: serde_json::json!({ "skipped": true }),
            skipped: true,
            skip_reason: Some(reason),
            error: None,
            attempts: 0,
            started_at: Some(now),
            completed_at: Some(now),
        }
    }

    /// Merge with no branch output; its output stays `null`
    pub fn nothing_merged() -> Self {
        Self {
            output: Value::Null,
            ..Self::skipped(SkipReason::NothingToMerge)
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.skip_reason.is_some_and(SkipReason::prunes)
    }

    /// The `{success, output, skipped, error}` view exposed to templates
    pub fn context_view(&self) -> Value {
        serde_json::json!({
            "success": self.success,
            "output": self.output,
            "skipped": self.skipped,
            "error": self.error,
        })
    }
}

/// Accumulating state of one execution: `{input, steps}` plus bound variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub steps: BTreeMap<StepId, StepRecord>,
    /// Step ids in the order their records were written
    #[serde(default)]
    pub completion_order: Vec<StepId>,
    /// Incremented on every mutation
    #[serde(default)]
    pub version: u64,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn record(&mut self, step_id: StepId, record: StepRecord) {
        self.completion_order.retain(|id| id != &step_id);
        self.completion_order.push(step_id.clone());
        self.steps.insert(step_id, record);
        self.version += 1;
    }

    pub fn is_complete(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    /// Output of the most recently completed step that actually ran
    pub fn final_output(&self) -> Value {
        self.completion_order
            .iter()
            .rev()
            .filter_map(|id| self.steps.get(id))
            .find(|record| !record.skipped)
            .map(|record| record.output.clone())
            .unwrap_or(Value::Null)
    }

    /// Tree view used for `{{path}}` resolution
    pub fn to_value(&self) -> Value {
        let steps: Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, record)| (id.0.clone(), record.context_view()))
            .collect();

        serde_json::json!({
            "input": self.input,
            "steps": steps,
        })
    }
}

/// A specific execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub workflow_revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<StepId>,
    pub state: ExecutionContext,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Result returned to the host for `execute`/`resume`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_definition_defaults() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "triage",
            "agent": "triager",
        }))
        .unwrap();

        assert_eq!(step.step_type, StepType::Agent);
        assert_eq!(step.max_retries, 0);
        assert_eq!(step.on_error, FailurePolicy::Continue);
        assert_eq!(step.display_name(), "triage");
        assert!(step.parallel_key().is_none());
    }

    #[test]
    fn test_parallel_key() {
        let mut step: StepDefinition = serde_json::from_value(json!({
            "id": "a",
            "agent": "x",
            "parallel": true,
        }))
        .unwrap();
        assert_eq!(step.parallel_key(), Some(""));

        step.parallel_group = Some("notify".to_string());
        assert_eq!(step.parallel_key(), Some("notify"));
    }

    #[test]
    fn test_agent_ref_defaults_for_generation_steps() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "gen",
            "step_type": "file_generation",
        }))
        .unwrap();
        assert_eq!(step.agent_ref(), Some("file_generation"));
    }

    #[test]
    fn test_final_output_ignores_skipped() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.record(
            StepId::new("a"),
            StepRecord {
                success: true,
                output: json!({"content": "first"}),
                skipped: false,
                skip_reason: None,
                error: None,
                attempts: 1,
                started_at: None,
                completed_at: None,
            },
        );
        ctx.record(StepId::new("b"), StepRecord::skipped(SkipReason::ConditionFalse));
        ctx.record(StepId::new("join"), StepRecord::nothing_merged());

        assert_eq!(ctx.final_output(), json!({"content": "first"}));
        assert_eq!(ctx.version, 3);
        assert_eq!(ctx.steps["join"].output, Value::Null);
        assert!(!ctx.steps["join"].is_pruned());
    }

    #[test]
    fn test_context_value_shape() {
        let mut ctx = ExecutionContext::new(json!({"task": "x"}));
        ctx.record(StepId::new("b"), StepRecord::skipped(SkipReason::SkipIf));

        let value = ctx.to_value();
        assert_eq!(value["input"]["task"], "x");
        assert_eq!(value["steps"]["b"]["skipped"], true);
        assert_eq!(value["steps"]["b"]["success"], true);
    }
}
