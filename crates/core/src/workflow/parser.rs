use super::dag::WorkflowDag;
use crate::error::ParseError;
use crate::types::{LoopKind, StepDefinition, StepId, StepType, WorkflowDefinition};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// A validated workflow ready to execute
#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    definition: WorkflowDefinition,
    index: HashMap<StepId, usize>,
    dag: WorkflowDag,
}

impl PartialEq for ParsedWorkflow {
    fn eq(&self, other: &Self) -> bool {
        self.definition == other.definition
    }
}

impl ParsedWorkflow {
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn into_definition(self) -> WorkflowDefinition {
        self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.definition.steps
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.index.get(id).map(|&i| &self.definition.steps[i])
    }

    /// The first step of the definition
    pub fn entry_step(&self) -> &StepDefinition {
        &self.definition.steps[0]
    }

    pub fn dag(&self) -> &WorkflowDag {
        &self.dag
    }

    /// Members of a branch group in definition order
    pub fn branch_members<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = &'a StepDefinition> + 'a {
        self.definition
            .steps
            .iter()
            .filter(move |s| s.branch_group.as_deref() == Some(group))
    }
}

/// Read a JSON or YAML document into a generic tree
pub fn parse_document(text: &str) -> Result<Value, ParseError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| ParseError::Document(e.to_string()))
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| ParseError::Document(e.to_string()))
    }
}

/// Validate a raw definition document
pub fn parse(raw: &Value) -> Result<ParsedWorkflow, ParseError> {
    from_definition(normalize(raw)?)
}

pub fn parse_str(text: &str) -> Result<ParsedWorkflow, ParseError> {
    parse(&parse_document(text)?)
}

/// Parse and validate, keeping only the typed definition
pub fn definition_from_str(text: &str) -> Result<WorkflowDefinition, ParseError> {
    parse_str(text).map(ParsedWorkflow::into_definition)
}

/// Validate an already-typed definition
pub fn from_definition(definition: WorkflowDefinition) -> Result<ParsedWorkflow, ParseError> {
    if definition.name.trim().is_empty() {
        return Err(ParseError::Schema(
            "workflow requires a non-empty name".to_string(),
        ));
    }
    if definition.version.trim().is_empty() {
        return Err(ParseError::Schema("workflow requires a version".to_string()));
    }
    if definition.steps.is_empty() {
        return Err(ParseError::Schema(
            "workflow requires at least one step".to_string(),
        ));
    }

    validate_scope(&definition.steps)?;

    let index = definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| (step.id.clone(), i))
        .collect();
    let dag = WorkflowDag::from_steps(&definition.steps);

    Ok(ParsedWorkflow {
        definition,
        index,
        dag,
    })
}

/// SHA-256 of the canonical JSON form, used as the parse cache key
pub fn fingerprint(definition: &WorkflowDefinition) -> Result<String, ParseError> {
    let bytes =
        serde_json::to_vec(definition).map_err(|e| ParseError::Document(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn normalize(raw: &Value) -> Result<WorkflowDefinition, ParseError> {
    let Value::Object(map) = raw else {
        return Err(ParseError::Schema(
            "workflow definition must be an object".to_string(),
        ));
    };

    match map.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => {}
        _ => {
            return Err(ParseError::Schema(
                "workflow requires a non-empty name".to_string(),
            ))
        }
    }

    let version = match map.get("version") {
        Some(Value::String(v)) if !v.trim().is_empty() => v.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(ParseError::Schema("workflow requires a version".to_string())),
    };

    match map.get("steps") {
        Some(Value::Array(steps)) if !steps.is_empty() => {}
        _ => {
            return Err(ParseError::Schema(
                "workflow requires at least one step".to_string(),
            ))
        }
    }

    let mut normalized = map.clone();
    normalized.insert("version".to_string(), Value::String(version));

    serde_json::from_value(Value::Object(normalized)).map_err(|e| ParseError::Schema(e.to_string()))
}

/// Validate one list of sibling steps (the workflow, or a loop body)
fn validate_scope(steps: &[StepDefinition]) -> Result<(), ParseError> {
    let mut ids = HashSet::new();
    for step in steps {
        validate_step(step)?;
        if !ids.insert(step.id.as_str()) {
            return Err(ParseError::DuplicateId(step.id.to_string()));
        }
    }

    let groups: HashSet<&str> = steps
        .iter()
        .filter_map(|s| s.branch_group.as_deref())
        .collect();

    for step in steps {
        let routes = [
            ("on_success", step.on_success.as_ref()),
            ("on_failure", step.on_failure.as_ref()),
        ];
        let deps = step.depends_on.iter().map(|d| ("depends_on", Some(d)));

        for (field, target) in routes.into_iter().chain(deps) {
            if let Some(target) = target {
                if !ids.contains(target.as_str()) {
                    return Err(ParseError::Reference {
                        step: step.id.to_string(),
                        field,
                        kind: "step",
                        target: target.to_string(),
                    });
                }
            }
        }

        if let Some(group) = &step.merge_after {
            if !groups.contains(group.as_str()) {
                return Err(ParseError::Reference {
                    step: step.id.to_string(),
                    field: "merge_after",
                    kind: "branch group",
                    target: group.clone(),
                });
            }
        }
    }

    detect_cycle(steps)
}

fn validate_step(step: &StepDefinition) -> Result<(), ParseError> {
    let id = step.id.as_str();
    if id.trim().is_empty() {
        return Err(ParseError::Schema("step id must not be empty".to_string()));
    }

    match step.step_type {
        StepType::Agent if step.agent_ref().is_none() => Err(ParseError::Schema(format!(
            "agent step '{}' requires a non-empty agent reference",
            id
        ))),
        StepType::ApiCall => match step.inputs.get("url") {
            Some(Value::String(url)) if !url.trim().is_empty() => Ok(()),
            _ => Err(ParseError::Schema(format!(
                "api_call step '{}' requires inputs.url",
                id
            ))),
        },
        StepType::Loop => {
            let config = step.loop_config.as_ref().ok_or_else(|| {
                ParseError::Schema(format!("loop step '{}' requires a loop config", id))
            })?;

            match config.kind {
                LoopKind::For if config.items.is_none() => {
                    return Err(ParseError::Schema(format!(
                        "for loop '{}' requires items",
                        id
                    )))
                }
                LoopKind::While
                    if config
                        .condition
                        .as_deref()
                        .map_or(true, |c| c.trim().is_empty()) =>
                {
                    return Err(ParseError::Schema(format!(
                        "while loop '{}' requires a condition",
                        id
                    )))
                }
                _ => {}
            }

            if config.steps.is_empty() {
                return Err(ParseError::Schema(format!(
                    "loop step '{}' requires nested steps",
                    id
                )));
            }
            validate_scope(&config.steps)
        }
        StepType::SubWorkflow => match &step.sub_workflow {
            Some(config) if !config.workflow.trim().is_empty() => Ok(()),
            _ => Err(ParseError::Schema(format!(
                "sub_workflow step '{}' requires a workflow reference",
                id
            ))),
        },
        _ => Ok(()),
    }
}

/// DFS over route edges from the entry step
fn detect_cycle(steps: &[StepDefinition]) -> Result<(), ParseError> {
    let Some(entry) = steps.first() else {
        return Ok(());
    };

    let index: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut stack = Vec::new();
    let mut visited = HashSet::new();

    visit(entry.id.as_str(), &index, &mut stack, &mut visited)
}

fn visit<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a StepDefinition>,
    stack: &mut Vec<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> Result<(), ParseError> {
    if let Some(pos) = stack.iter().position(|s| *s == id) {
        let mut path: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
        path.push(id.to_string());
        return Err(ParseError::Cycle { path });
    }
    if !visited.insert(id) {
        return Ok(());
    }

    stack.push(id);
    if let Some(&step) = index.get(id) {
        for next in [step.on_success.as_ref(), step.on_failure.as_ref()]
            .into_iter()
            .flatten()
        {
            visit(next.as_str(), index, stack, visited)?;
        }
    }
    stack.pop();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "name": "Bug Triage",
            "version": "1.0",
            "steps": [
                {"id": "classify", "agent": "triager", "on_success": "assign"},
                {"id": "assign", "agent": "assigner"},
            ]
        })
    }

    #[test]
    fn test_parse_minimal() {
        let parsed = parse(&minimal()).unwrap();
        assert_eq!(parsed.name(), "Bug Triage");
        assert_eq!(parsed.entry_step().id.as_str(), "classify");
        assert_eq!(parsed.step("assign").unwrap().agent.as_deref(), Some("assigner"));
        assert!(parsed.step("missing").is_none());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let first = parse(&minimal()).unwrap();
        let second = parse(&minimal()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            fingerprint(first.definition()).unwrap(),
            fingerprint(second.definition()).unwrap()
        );
    }

    #[test]
    fn test_yaml_with_numeric_version() {
        let parsed = parse_str(
            "name: Notify\nversion: 2\nsteps:\n  - id: send\n    agent: mailer\n    inputs:\n      to: '{{input.email}}'\n",
        )
        .unwrap();
        assert_eq!(parsed.definition().version, "2");
        assert_eq!(parsed.steps()[0].inputs["to"], "{{input.email}}");
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            parse_str("{not json"),
            Err(ParseError::Document(_))
        ));
    }

    #[test]
    fn test_schema_errors() {
        let missing_name = json!({"version": "1", "steps": [{"id": "a", "agent": "x"}]});
        assert!(matches!(parse(&missing_name), Err(ParseError::Schema(_))));

        let no_steps = json!({"name": "w", "version": "1", "steps": []});
        assert!(matches!(parse(&no_steps), Err(ParseError::Schema(_))));

        let no_version = json!({"name": "w", "steps": [{"id": "a", "agent": "x"}]});
        assert!(matches!(parse(&no_version), Err(ParseError::Schema(_))));

        let no_agent = json!({"name": "w", "version": "1", "steps": [{"id": "a", "agent": " "}]});
        let err = parse(&no_agent).unwrap_err();
        assert!(err.to_string().contains("agent step 'a'"));

        let no_url = json!({"name": "w", "version": "1", "steps": [
            {"id": "call", "step_type": "api_call", "inputs": {"method": "GET"}}
        ]});
        assert!(matches!(parse(&no_url), Err(ParseError::Schema(_))));
    }

    #[test]
    fn test_generation_steps_need_no_agent() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "gen", "step_type": "file_generation"}
        ]});
        assert!(parse(&raw).is_ok());
    }

    #[test]
    fn test_duplicate_id() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "a", "agent": "x"},
            {"id": "a", "agent": "y"},
        ]});
        assert_eq!(parse(&raw), Err(ParseError::DuplicateId("a".to_string())));
    }

    #[test]
    fn test_dangling_reference() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "a", "agent": "x", "on_failure": "ghost"},
        ]});
        assert_eq!(
            parse(&raw),
            Err(ParseError::Reference {
                step: "a".to_string(),
                field: "on_failure",
                kind: "step",
                target: "ghost".to_string(),
            })
        );

        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "a", "agent": "x", "depends_on": ["nope"]},
        ]});
        assert!(matches!(parse(&raw), Err(ParseError::Reference { .. })));

        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "m", "step_type": "merge", "merge_after": "sev"},
        ]});
        assert!(matches!(
            parse(&raw),
            Err(ParseError::Reference { kind: "branch group", .. })
        ));
    }

    #[test]
    fn test_route_cycle_names_path() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "a", "agent": "x", "on_success": "b"},
            {"id": "b", "agent": "x", "on_success": "c"},
            {"id": "c", "agent": "x", "on_failure": "a"},
        ]});
        let err = parse(&raw).unwrap_err();
        assert_eq!(
            err,
            ParseError::Cycle {
                path: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
        assert_eq!(err.to_string(), "cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn test_dependency_cycle_is_not_a_parse_error() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "a", "agent": "x"},
            {"id": "b", "agent": "x", "depends_on": ["c"]},
            {"id": "c", "agent": "x", "depends_on": ["b"]},
        ]});
        assert!(parse(&raw).is_ok());
    }

    #[test]
    fn test_loop_validation() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "each", "step_type": "loop", "loop": {"type": "for", "steps": [
                {"id": "n", "agent": "x"}
            ]}},
        ]});
        assert!(matches!(parse(&raw), Err(ParseError::Schema(_))));

        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "each", "step_type": "loop", "loop": {
                "type": "for",
                "items": "{{input.items}}",
                "steps": [{"id": "n", "agent": "x"}, {"id": "n", "agent": "y"}]
            }},
        ]});
        assert_eq!(parse(&raw), Err(ParseError::DuplicateId("n".to_string())));

        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "poll", "step_type": "loop", "loop": {
                "type": "while",
                "condition": "{{input.pending}}",
                "max_iterations": 5,
                "steps": [{"id": "check", "agent": "x"}]
            }},
        ]});
        let parsed = parse(&raw).unwrap();
        let config = parsed.entry_step().loop_config.as_ref().unwrap();
        assert_eq!(config.max_iterations, Some(5));
        assert_eq!(config.item_var, "item");
    }

    #[test]
    fn test_branch_members_in_order() {
        let raw = json!({"name": "w", "version": "1", "steps": [
            {"id": "hi", "agent": "x", "branch_group": "sev", "condition": "{{input.high}}"},
            {"id": "other", "agent": "x"},
            {"id": "lo", "agent": "x", "branch_group": "sev"},
            {"id": "join", "step_type": "merge", "merge_after": "sev"},
        ]});
        let parsed = parse(&raw).unwrap();
        let members: Vec<&str> = parsed.branch_members("sev").map(|s| s.id.as_str()).collect();
        assert_eq!(members, vec!["hi", "lo"]);
    }

    #[test]
    fn test_fingerprint_changes_with_definition() {
        let a = parse(&minimal()).unwrap();
        let mut raw = minimal();
        raw["version"] = json!("1.1");
        let b = parse(&raw).unwrap();
        assert_ne!(
            fingerprint(a.definition()).unwrap(),
            fingerprint(b.definition()).unwrap()
        );
    }
}
