use crate::types::{StepDefinition, StepId};
use serde_json::Value;

/// Output of a merge step: the output of the branch member that actually
/// ran, or `None` when every member was skipped.
///
/// Without `merge_after` the step's `depends_on` list is searched instead.
pub fn run(step: &StepDefinition, siblings: &[StepDefinition], context: &Value) -> Option<Value> {
    let candidates: Vec<&StepId> = match &step.merge_after {
        Some(group) => siblings
            .iter()
            .filter(|s| s.branch_group.as_deref() == Some(group.as_str()))
            .map(|s| &s.id)
            .collect(),
        None => step.depends_on.iter().collect(),
    };

    candidates
        .into_iter()
        .filter_map(|id| context.get("steps").and_then(|steps| steps.get(id.as_str())))
        .find(|record| record.get("skipped").and_then(Value::as_bool) != Some(true))
        .map(|record| record.get("output").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps() -> Vec<StepDefinition> {
        serde_json::from_value(json!([
            {"id": "hi", "agent": "x", "branch_group": "sev"},
            {"id": "lo", "agent": "x", "branch_group": "sev"},
            {"id": "join", "step_type": "merge", "merge_after": "sev"},
        ]))
        .unwrap()
    }

    #[test]
    fn test_merge_takes_winner_output() {
        let steps = steps();
        let context = json!({
            "input": {},
            "steps": {
                "hi": {"success": true, "output": {"skipped": true}, "skipped": true},
                "lo": {"success": true, "output": {"content": "low path"}, "skipped": false},
            }
        });

        assert_eq!(
            run(&steps[2], &steps, &context),
            Some(json!({"content": "low path"}))
        );
    }

    #[test]
    fn test_merge_all_skipped_is_none() {
        let steps = steps();
        let context = json!({
            "steps": {
                "hi": {"success": true, "output": {"skipped": true}, "skipped": true},
                "lo": {"success": true, "output": {"skipped": true}, "skipped": true},
            }
        });

        assert_eq!(run(&steps[2], &steps, &context), None);
    }

    #[test]
    fn test_merge_over_dependencies() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "join", "step_type": "merge", "depends_on": ["a", "b"]
        }))
        .unwrap();
        let context = json!({
            "steps": {
                "a": {"success": true, "output": null, "skipped": true},
                "b": {"success": true, "output": {"value": 2}, "skipped": false},
            }
        });

        assert_eq!(run(&step, &[], &context), Some(json!({"value": 2})));
    }
}
