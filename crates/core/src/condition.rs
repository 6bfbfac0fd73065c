// Whitelisted boolean expressions over `{{path}}` variables

use crate::error::EvaluationError;
use crate::template;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Evaluate `condition` against `context`.
///
/// An empty condition is always true. Placeholders are resolved to values
/// before parsing, so substituted strings can never inject operators.
pub fn evaluate(condition: &str, context: &Value) -> Result<bool, EvaluationError> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Ok(true);
    }

    let tokens = tokenize(condition, context)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        expression: condition,
    };

    let value = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(parser.malformed(format!(
            "unexpected token at position {}",
            parser.pos
        )));
    }

    Ok(truthy(&value))
}

/// Python-style truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn malformed(expression: &str, reason: impl Into<String>) -> EvaluationError {
    EvaluationError::Malformed {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(expression: &str, context: &Value) -> Result<Vec<Token>, EvaluationError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' if chars.get(i + 1) == Some(&'{') => {
                let rest: String = chars[i + 2..].iter().collect();
                let close = rest
                    .find("}}")
                    .ok_or_else(|| malformed(expression, "unterminated placeholder"))?;
                let path = rest[..close].trim();
                let value = template::resolve_path(context, path)?;
                tokens.push(Token::Literal(value.clone()));
                i += 2 + rest[..close].chars().count() + 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(malformed(expression, "unterminated string literal")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                literal.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            literal.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(literal)));
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', _) => (CmpOp::Gt, 1),
                    ('<', _) => (CmpOp::Lt, 1),
                    _ => return Err(malformed(expression, format!("unsupported operator '{c}'"))),
                };
                tokens.push(Token::Cmp(op));
                i += width;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| malformed(expression, format!("invalid number '{text}'")))?;
                tokens.push(Token::Literal(number_value(number)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Value::Bool(true)),
                    "false" | "False" => Token::Literal(Value::Bool(false)),
                    "null" | "None" => Token::Literal(Value::Null),
                    _ => {
                        return Err(malformed(
                            expression,
                            format!("unknown identifier '{word}'"),
                        ))
                    }
                };
                tokens.push(token);
            }
            other => {
                return Err(malformed(
                    expression,
                    format!("unexpected character '{other}'"),
                ))
            }
        }
    }

    Ok(tokens)
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::from(number as i64)
    } else {
        Value::from(number)
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    expression: &'a str,
}

impl Parser<'_> {
    fn malformed(&self, reason: impl Into<String>) -> EvaluationError {
        malformed(self.expression, reason)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Value, EvaluationError> {
        let mut result = truthy(&self.parse_and()?);
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = truthy(&self.parse_and()?);
            result = result || rhs;
        }
        Ok(Value::Bool(result))
    }

    fn parse_and(&mut self) -> Result<Value, EvaluationError> {
        let mut result = truthy(&self.parse_not()?);
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = truthy(&self.parse_not()?);
            result = result && rhs;
        }
        Ok(Value::Bool(result))
    }

    fn parse_not(&mut self) -> Result<Value, EvaluationError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Value::Bool(!truthy(&inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value, EvaluationError> {
        let lhs = self.parse_atom()?;
        let Some(Token::Cmp(op)) = self.peek().cloned() else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.parse_atom()?;

        if matches!(self.peek(), Some(Token::Cmp(_))) {
            return Err(self.malformed("chained comparisons are not supported"));
        }

        compare(op, &lhs, &rhs).map(Value::Bool)
    }

    fn parse_atom(&mut self) -> Result<Value, EvaluationError> {
        match self.peek().cloned() {
            Some(Token::Literal(value)) => {
                self.pos += 1;
                Ok(value)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.malformed("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(token) => Err(self.malformed(format!("expected operand, found {token:?}"))),
            None => Err(self.malformed("expected operand, found end of expression")),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, EvaluationError> {
    let numeric = match (lhs, rhs) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            as_number(lhs).zip(as_number(rhs))
        }
        _ => None,
    };

    let ordering = if let Some((l, r)) = numeric {
        l.partial_cmp(&r)
    } else {
        match (lhs, rhs) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
            _ => None,
        }
    };

    match op {
        CmpOp::Eq => Ok(ordering.map_or_else(|| lhs == rhs, |o| o == Ordering::Equal)),
        CmpOp::Ne => Ok(ordering.map_or_else(|| lhs != rhs, |o| o != Ordering::Equal)),
        _ => {
            let ordering = ordering.ok_or_else(|| {
                EvaluationError::TypeMismatch(format!("cannot order {lhs} against {rhs}"))
            })?;
            Ok(match op {
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Ge => ordering != Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "input": {"priority": "high", "count": 5, "flag": true, "none": null, "tags": []},
            "steps": {"triage": {"success": true, "output": {"score": 0.75, "team": "web"}}}
        })
    }

    #[test]
    fn test_empty_condition_is_true() {
        assert!(evaluate("", &context()).unwrap());
        assert!(evaluate("   ", &context()).unwrap());
    }

    #[test]
    fn test_string_equality() {
        let ctx = context();
        assert!(evaluate("{{input.priority}} == 'high'", &ctx).unwrap());
        assert!(!evaluate("{{input.priority}} == \"low\"", &ctx).unwrap());
        assert!(evaluate("{{input.priority}} != 'low'", &ctx).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = context();
        assert!(evaluate("{{input.count}} > 3", &ctx).unwrap());
        assert!(evaluate("{{input.count}} >= 5", &ctx).unwrap());
        assert!(evaluate("{{input.count}} <= 5", &ctx).unwrap());
        assert!(!evaluate("{{input.count}} < 5", &ctx).unwrap());
        assert!(evaluate("{{steps.triage.output.score}} > 0.5", &ctx).unwrap());
        assert!(evaluate("{{input.count}} == '5'", &ctx).unwrap());
    }

    #[test]
    fn test_boolean_connectives() {
        let ctx = context();
        assert!(evaluate("{{input.flag}} and {{input.count}} > 1", &ctx).unwrap());
        assert!(evaluate("{{input.count}} > 10 or {{input.flag}}", &ctx).unwrap());
        assert!(!evaluate("not {{input.flag}}", &ctx).unwrap());
        assert!(evaluate("not ({{input.count}} > 10 and {{input.flag}})", &ctx).unwrap());
    }

    #[test]
    fn test_literals_and_truthiness() {
        let ctx = context();
        assert!(evaluate("true", &ctx).unwrap());
        assert!(!evaluate("False", &ctx).unwrap());
        assert!(!evaluate("{{input.none}}", &ctx).unwrap());
        assert!(!evaluate("{{input.tags}}", &ctx).unwrap());
        assert!(evaluate("{{steps.triage.output.team}}", &ctx).unwrap());
        assert!(evaluate("{{input.none}} == None", &ctx).unwrap());
    }

    #[test]
    fn test_substituted_strings_cannot_inject() {
        let ctx = json!({"input": {"title": "x' or 'a' == 'a"}});
        assert!(!evaluate("{{input.title}} == 'y'", &ctx).unwrap());
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let err = evaluate("{{steps.assign.output}} == 1", &context()).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::UnresolvedPath { ref segment, .. } if segment == "assign"
        ));
    }

    #[test]
    fn test_malformed_expressions() {
        let ctx = context();
        assert!(matches!(
            evaluate("{{input.count}} >", &ctx),
            Err(EvaluationError::Malformed { .. })
        ));
        assert!(matches!(
            evaluate("rm -rf", &ctx),
            Err(EvaluationError::Malformed { .. })
        ));
        assert!(matches!(
            evaluate("1 < 2 < 3", &ctx),
            Err(EvaluationError::Malformed { .. })
        ));
        assert!(matches!(
            evaluate("(true", &ctx),
            Err(EvaluationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_ordering_type_mismatch() {
        let ctx = context();
        assert!(matches!(
            evaluate("{{input.flag}} > 'a'", &ctx),
            Err(EvaluationError::TypeMismatch(_))
        ));
    }
}
