use crate::condition;
use crate::error::{EvaluationError, StepError};
use crate::template;
use crate::types::{FailurePolicy, LoopKind, SkipReason, StepDefinition, StepRecord};
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::step_executor::StepScope;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Iteration control requested by a nested step's output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Break,
    Continue,
}

/// `{"break": true}`, `{"continue": true}` or `{"control": "break"|"continue"}`
pub fn control_signal(output: &Value) -> Option<LoopControl> {
    if output.get("break").and_then(Value::as_bool) == Some(true) {
        return Some(LoopControl::Break);
    }
    if output.get("continue").and_then(Value::as_bool) == Some(true) {
        return Some(LoopControl::Continue);
    }
    match output.get("control").and_then(Value::as_str) {
        Some("break") => Some(LoopControl::Break),
        Some("continue") => Some(LoopControl::Continue),
        _ => None,
    }
}

/// Run a `loop` step. Output is `{iterations, results, capped}` where
/// `results` holds one `{nested_id: output}` object per iteration.
pub async fn run(
    executor: &WorkflowExecutor,
    scope: &StepScope,
    step: &StepDefinition,
    context: &Value,
) -> Result<Value, StepError> {
    let config = step
        .loop_config
        .as_ref()
        .ok_or_else(|| StepError::Config(format!("loop step '{}' has no loop config", step.id)))?;
    let cap = config
        .max_iterations
        .unwrap_or(executor.config().default_max_iterations);

    let mut results = Vec::new();
    let mut capped = false;

    match config.kind {
        LoopKind::For => {
            let items = resolve_items(config.items.as_ref(), context)?;
            let count = items.len();

            for (index, item) in items.into_iter().enumerate() {
                if index >= cap {
                    capped = true;
                    break;
                }

                let mut bindings = Map::new();
                bindings.insert(config.item_var.clone(), item);
                bindings.insert(
                    "loop".to_string(),
                    json!({
                        "index": index,
                        "count": count,
                        "first": index == 0,
                        "last": index + 1 == count,
                    }),
                );

                let body = run_body(executor, scope, &config.steps, bind(context, bindings)).await?;
                results.push(body.outputs);
                if body.control == Some(LoopControl::Break) {
                    break;
                }
            }
        }
        LoopKind::While => {
            let condition = config.condition.as_deref().unwrap_or_default();
            let mut current = context.clone();

            loop {
                let index = results.len();
                if index >= cap {
                    capped = true;
                    break;
                }

                let mut bindings = Map::new();
                bindings.insert("loop".to_string(), json!({ "index": index }));
                current = bind(&current, bindings);

                if !condition::evaluate(condition, &current)? {
                    break;
                }

                let body = run_body(executor, scope, &config.steps, current).await?;
                results.push(body.outputs);
                // The next condition sees this iteration's nested records
                current = body.context;
                if body.control == Some(LoopControl::Break) {
                    break;
                }
            }
        }
    }

    if capped {
        tracing::warn!(
            execution_id = %scope.execution_id,
            step_id = %step.id,
            max_iterations = cap,
            "Loop stopped at iteration cap"
        );
    }

    Ok(json!({
        "iterations": results.len(),
        "results": results,
        "capped": capped,
    }))
}

struct BodyRun {
    outputs: Value,
    control: Option<LoopControl>,
    context: Value,
}

/// Run the nested steps of one iteration in definition order
async fn run_body(
    executor: &WorkflowExecutor,
    scope: &StepScope,
    steps: &[StepDefinition],
    mut context: Value,
) -> Result<BodyRun, StepError> {
    let mut outputs = Map::new();
    let mut claimed_groups: HashSet<&str> = HashSet::new();

    for nested in steps {
        if scope.token.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let record = match nested.branch_group.as_deref() {
            Some(group) if claimed_groups.contains(group) => {
                StepRecord::skipped(SkipReason::BranchNotTaken)
            }
            group => {
                let record = executor
                    .run_step(scope, nested, steps, context.clone())
                    .await;
                if let Some(group) = group.filter(|_| !record.skipped) {
                    claimed_groups.insert(group);
                }
                record
            }
        };

        if let Some(Value::Object(records)) = context.get_mut("steps") {
            records.insert(nested.id.to_string(), record.context_view());
        }

        if !record.success && nested.on_error == FailurePolicy::Abort {
            return Err(StepError::Invocation(format!(
                "nested step '{}' failed: {}",
                nested.id,
                record.error.as_deref().unwrap_or("unknown error")
            )));
        }

        let control = control_signal(&record.output);
        outputs.insert(nested.id.to_string(), record.output);

        if control.is_some() {
            return Ok(BodyRun {
                outputs: Value::Object(outputs),
                control,
                context,
            });
        }
    }

    Ok(BodyRun {
        outputs: Value::Object(outputs),
        control: None,
        context,
    })
}

fn bind(context: &Value, bindings: Map<String, Value>) -> Value {
    let mut bound = context.clone();
    if let Value::Object(map) = &mut bound {
        map.extend(bindings);
    }
    bound
}

/// `items` may be a literal array, a `{{path}}` placeholder, or a bare path
fn resolve_items(items: Option<&Value>, context: &Value) -> Result<Vec<Value>, StepError> {
    let Some(items) = items else {
        return Err(StepError::Config("for loop has no items".to_string()));
    };

    let resolved = match items {
        Value::String(text) if !text.contains("{{") => {
            template::resolve_path(context, text)?.clone()
        }
        other => template::resolve_value(other, context)?,
    };

    match resolved {
        Value::Array(items) => Ok(items),
        other => Err(EvaluationError::TypeMismatch(format!(
            "loop items must resolve to an array, got {}",
            other
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signal() {
        assert_eq!(control_signal(&json!({"break": true})), Some(LoopControl::Break));
        assert_eq!(
            control_signal(&json!({"continue": true, "content": "x"})),
            Some(LoopControl::Continue)
        );
        assert_eq!(
            control_signal(&json!({"control": "break"})),
            Some(LoopControl::Break)
        );
        assert_eq!(control_signal(&json!({"break": false})), None);
        assert_eq!(control_signal(&Value::Null), None);
    }

    #[test]
    fn test_resolve_items() {
        let context = json!({"input": {"files": ["a.rs", "b.rs"], "name": "x"}});

        assert_eq!(
            resolve_items(Some(&json!("{{input.files}}")), &context).unwrap(),
            vec![json!("a.rs"), json!("b.rs")]
        );
        assert_eq!(
            resolve_items(Some(&json!("input.files")), &context).unwrap().len(),
            2
        );
        assert_eq!(
            resolve_items(Some(&json!([1, "{{input.name}}"])), &context).unwrap(),
            vec![json!(1), json!("x")]
        );
        assert!(matches!(
            resolve_items(Some(&json!("{{input.name}}")), &context),
            Err(StepError::Evaluation(EvaluationError::TypeMismatch(_)))
        ));
        assert!(matches!(
            resolve_items(None, &context),
            Err(StepError::Config(_))
        ));
    }

    #[test]
    fn test_bind_overlays_top_level() {
        let context = json!({"input": {"a": 1}, "steps": {}});
        let mut bindings = Map::new();
        bindings.insert("item".to_string(), json!("x"));

        let bound = bind(&context, bindings);
        assert_eq!(bound["item"], "x");
        assert_eq!(bound["input"]["a"], 1);
    }
}
