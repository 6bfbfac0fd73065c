use crate::error::{ExecutorError, StepError};
use crate::template;
use crate::types::{StepDefinition, SubWorkflowConfig};
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::step_executor::StepScope;
use serde_json::{Map, Value};

/// Run a nested workflow as one step of the parent execution
pub async fn run(
    executor: &WorkflowExecutor,
    scope: &StepScope,
    step: &StepDefinition,
    context: &Value,
    inputs: Value,
) -> Result<Value, StepError> {
    let config = step.sub_workflow.as_ref().ok_or_else(|| {
        StepError::Config(format!("sub_workflow step '{}' has no config", step.id))
    })?;

    let depth = scope.depth + 1;
    let max = executor.config().max_sub_workflow_depth;
    if depth > max {
        return Err(StepError::SubWorkflow(
            ExecutorError::SubWorkflowDepthExceeded { depth, max }.to_string(),
        ));
    }

    let stored = executor
        .definitions()
        .get(&config.workflow, config.revision)
        .await
        .map_err(|e| StepError::SubWorkflow(format!("{:#}", e)))?
        .ok_or_else(|| {
            StepError::SubWorkflow(ExecutorError::WorkflowNotFound(config.workflow.clone()).to_string())
        })?;

    let input = map_input(config, inputs, context)?;

    tracing::info!(
        execution_id = %scope.execution_id,
        step_id = %step.id,
        workflow_id = %stored.workflow_id,
        revision = stored.revision,
        depth,
        "Starting sub-workflow"
    );

    let outcome = executor
        .run_child(stored, input, scope)
        .await
        .map_err(|e| StepError::SubWorkflow(e.to_string()))?;

    if !outcome.success {
        return Err(StepError::SubWorkflow(format!(
            "execution {} ended {}: {}",
            outcome.execution_id,
            outcome.status,
            outcome.error.as_deref().unwrap_or("no error reported")
        )));
    }

    map_output(config, outcome.output.unwrap_or(Value::Null))
}

/// Resolved step inputs, overlaid with `input_mapping` paths from the parent context
fn map_input(
    config: &SubWorkflowConfig,
    inputs: Value,
    context: &Value,
) -> Result<Value, StepError> {
    let mut input = match inputs {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    for (key, path) in &config.input_mapping {
        let value = template::resolve_path(context, template::normalize_path(path))?;
        input.insert(key.clone(), value.clone());
    }

    Ok(Value::Object(input))
}

/// Whole sub-workflow output when unmapped, otherwise only the mapped paths
fn map_output(config: &SubWorkflowConfig, output: Value) -> Result<Value, StepError> {
    if config.output_mapping.is_empty() {
        return Ok(output);
    }

    let mut mapped = Map::new();
    for (key, path) in &config.output_mapping {
        let value = template::resolve_path(&output, template::normalize_path(path))?;
        mapped.insert(key.clone(), value.clone());
    }

    Ok(Value::Object(mapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use serde_json::json;

    fn config(value: Value) -> SubWorkflowConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_input_mapping_overlays_inputs() {
        let config = config(json!({
            "workflow": "notify",
            "input_mapping": {"email": "{{input.reporter}}", "severity": "steps.triage.output.severity"}
        }));
        let context = json!({
            "input": {"reporter": "a@example.com"},
            "steps": {"triage": {"output": {"severity": "high"}}}
        });

        let input = map_input(&config, json!({"channel": "email", "email": "old"}), &context).unwrap();

        assert_eq!(
            input,
            json!({"channel": "email", "email": "a@example.com", "severity": "high"})
        );
    }

    #[test]
    fn test_missing_mapping_path_fails() {
        let config = config(json!({
            "workflow": "notify",
            "input_mapping": {"email": "input.missing"}
        }));

        let err = map_input(&config, Value::Null, &json!({"input": {}})).unwrap_err();
        assert!(matches!(
            err,
            StepError::Evaluation(EvaluationError::UnresolvedPath { .. })
        ));
    }

    #[test]
    fn test_output_mapping() {
        let output = json!({"content": "sent", "meta": {"id": 7}});

        let passthrough = config(json!({"workflow": "notify"}));
        assert_eq!(map_output(&passthrough, output.clone()).unwrap(), output);

        let mapped = config(json!({
            "workflow": "notify",
            "output_mapping": {"message_id": "meta.id"}
        }));
        assert_eq!(
            map_output(&mapped, output).unwrap(),
            json!({"message_id": 7})
        );
    }
}
