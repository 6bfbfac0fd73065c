// `{{dotted.path}}` resolution over a context tree

use crate::error::EvaluationError;
use serde_json::Value;

/// Placeholder span found in a template string
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    path: &'a str,
}

fn placeholders(text: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(open) = text[offset..].find("{{") {
        let start = offset + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        found.push(Placeholder {
            start,
            end,
            path: text[start + 2..end - 2].trim(),
        });
        offset = end;
    }

    found
}

/// Path of a string that consists of exactly one placeholder
pub fn placeholder_path(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    match placeholders(trimmed).as_slice() {
        [only] if only.start == 0 && only.end == trimmed.len() => Some(only.path),
        _ => None,
    }
}

/// Accept both `{{a.b}}` and bare `a.b` spellings of a path
pub fn normalize_path(text: &str) -> &str {
    placeholder_path(text).unwrap_or_else(|| text.trim())
}

/// Extract every placeholder path from a template string
pub fn extract_paths(text: &str) -> Vec<String> {
    placeholders(text)
        .into_iter()
        .map(|p| p.path.to_string())
        .collect()
}

/// Walk `path` through nested objects and arrays
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value, EvaluationError> {
    let path = path.trim();
    if path.is_empty() {
        return Ok(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };

        current = next.ok_or_else(|| EvaluationError::UnresolvedPath {
            path: path.to_string(),
            segment: segment.to_string(),
        })?;
    }

    Ok(current)
}

/// String form used when a value is interpolated into surrounding text
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every placeholder in `text` with its resolved value
pub fn render(text: &str, root: &Value) -> Result<String, EvaluationError> {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for placeholder in placeholders(text) {
        result.push_str(&text[last..placeholder.start]);
        result.push_str(&to_display(resolve_path(root, placeholder.path)?));
        last = placeholder.end;
    }
    result.push_str(&text[last..]);

    Ok(result)
}

/// Resolve templated inputs recursively.
///
/// A string made of a single placeholder yields the referenced value with its
/// type intact; strings with embedded placeholders are rendered to text.
pub fn resolve_value(value: &Value, root: &Value) -> Result<Value, EvaluationError> {
    match value {
        Value::String(text) => {
            if let Some(path) = placeholder_path(text) {
                return Ok(resolve_path(root, path)?.clone());
            }
            if text.contains("{{") {
                return Ok(Value::String(render(text, root)?));
            }
            Ok(value.clone())
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, root))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_value(item, root)?)))
            .collect::<Result<serde_json::Map<_, _>, EvaluationError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "input": {"task": "x", "labels": ["bug", "ui"], "count": 3},
            "steps": {
                "triage": {"success": true, "output": {"severity": "high"}, "skipped": false}
            }
        })
    }

    #[test]
    fn test_resolve_nested_and_indexed() {
        let ctx = context();
        assert_eq!(resolve_path(&ctx, "input.task").unwrap(), "x");
        assert_eq!(resolve_path(&ctx, "input.labels.1").unwrap(), "ui");
        assert_eq!(
            resolve_path(&ctx, "steps.triage.output.severity").unwrap(),
            "high"
        );
    }

    #[test]
    fn test_missing_segment_is_named() {
        let ctx = context();
        let err = resolve_path(&ctx, "steps.assign.output").unwrap_err();
        assert_eq!(
            err,
            EvaluationError::UnresolvedPath {
                path: "steps.assign.output".to_string(),
                segment: "assign".to_string(),
            }
        );

        let err = resolve_path(&ctx, "input.labels.7").unwrap_err();
        assert!(err.to_string().contains("'7'"));
    }

    #[test]
    fn test_render_interpolates() {
        let ctx = context();
        let text = render("Fix {{ input.task }} ({{input.count}} items)", &ctx).unwrap();
        assert_eq!(text, "Fix x (3 items)");
    }

    #[test]
    fn test_resolve_value_keeps_types() {
        let ctx = context();
        let inputs = json!({
            "labels": "{{input.labels}}",
            "summary": "severity={{steps.triage.output.severity}}",
            "fixed": 7,
        });

        let resolved = resolve_value(&inputs, &ctx).unwrap();
        assert_eq!(resolved["labels"], json!(["bug", "ui"]));
        assert_eq!(resolved["summary"], "severity=high");
        assert_eq!(resolved["fixed"], 7);
    }

    #[test]
    fn test_normalize_and_extract() {
        assert_eq!(normalize_path("{{ input.a }}"), "input.a");
        assert_eq!(normalize_path(" input.a "), "input.a");
        assert_eq!(
            extract_paths("{{a}} and {{ b.c }}"),
            vec!["a".to_string(), "b.c".to_string()]
        );
        assert_eq!(placeholder_path("x {{a}}"), None);
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let ctx = context();
        assert_eq!(render("oops {{input.task", &ctx).unwrap(), "oops {{input.task");
    }
}
