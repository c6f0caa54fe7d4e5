//! Expression evaluation over build state
//!
//! Run-if expressions and templated input values are evaluated against an
//! immutable snapshot of `{build-state, env-list}`. Evaluation is pure: the
//! same expression and state always produce the same result, and nothing
//! here reads the process environment.
//!
//! Expressions may be written bare (`.IsCI`), with the `$` shorthand
//! (`$.IsCI`) or wrapped in braces (`{{.IsCI}}`). Boolean results follow
//! truthiness coercion: `"yes"`/`"y"`/`"true"` (case-insensitive) are true,
//! `"no"`/`"n"`/`"false"` are false, integers are true when nonzero, the
//! empty string is false, anything else is an error.

mod parser;

use std::collections::HashMap;

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::models::BuildRunResults;

use parser::{parse, Expr};

/// Immutable evaluation state.
#[derive(Debug, Clone, Default)]
pub struct TemplateState {
    pub is_ci: bool,
    pub is_pr: bool,
    pub is_build_failed: bool,
    envs: HashMap<String, String>,
}

impl TemplateState {
    pub fn new(
        ctx: &BuildContext,
        results: &BuildRunResults,
        envs: &[(String, String)],
    ) -> Self {
        Self {
            is_ci: ctx.is_ci,
            is_pr: ctx.is_pr,
            is_build_failed: results.is_build_failed(),
            envs: envs.iter().cloned().collect(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    fn getenv(&self, key: &str) -> String {
        self.envs.get(key).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    fn truthy(&self, expression: &str) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Str(s) => match s.to_lowercase().as_str() {
                "yes" | "y" | "true" => Ok(true),
                "no" | "n" | "false" | "" => Ok(false),
                other => Err(eval_error(
                    expression,
                    format!("value ({other}) is not coercible to bool"),
                )),
            },
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

fn eval_error(expression: &str, message: impl Into<String>) -> Error {
    Error::TemplateEval {
        expression: expression.to_string(),
        message: message.into(),
    }
}

fn eval(expr: &Expr, state: &TemplateState, expression: &str) -> Result<Value> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Var(name) => match name.as_str() {
            "IsCI" => Ok(Value::Bool(state.is_ci)),
            "IsPR" => Ok(Value::Bool(state.is_pr)),
            "IsBuildFailed" => Ok(Value::Bool(state.is_build_failed)),
            "IsBuildOK" => Ok(Value::Bool(!state.is_build_failed)),
            other => Err(eval_error(expression, format!("unknown variable (.{other})"))),
        },
        Expr::Call { name, args } => {
            let values: Vec<Value> = args
                .iter()
                .map(|arg| eval(arg, state, expression))
                .collect::<Result<_>>()?;
            apply(name, &values, state, expression)
        }
    }
}

fn apply(name: &str, args: &[Value], state: &TemplateState, expression: &str) -> Result<Value> {
    match name {
        "not" => {
            let [arg] = args else {
                return Err(eval_error(expression, "not expects exactly 1 argument"));
            };
            Ok(Value::Bool(!arg.truthy(expression)?))
        }
        "and" => {
            if args.is_empty() {
                return Err(eval_error(expression, "and expects at least 1 argument"));
            }
            for arg in args {
                if !arg.truthy(expression)? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "or" => {
            if args.is_empty() {
                return Err(eval_error(expression, "or expects at least 1 argument"));
            }
            for arg in args {
                if arg.truthy(expression)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "eq" => {
            let [first, rest @ ..] = args else {
                return Err(eval_error(expression, "eq expects at least 2 arguments"));
            };
            if rest.is_empty() {
                return Err(eval_error(expression, "eq expects at least 2 arguments"));
            }
            for other in rest {
                if !values_comparable(first, other) {
                    return Err(eval_error(expression, "eq arguments have incompatible types"));
                }
                if first == other {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "getenv" => {
            let [Value::Str(key)] = args else {
                return Err(eval_error(expression, "getenv expects 1 string argument"));
            };
            Ok(Value::Str(state.getenv(key)))
        }
        "enveq" => {
            let [Value::Str(key), Value::Str(expected)] = args else {
                return Err(eval_error(expression, "enveq expects 2 string arguments"));
            };
            Ok(Value::Bool(state.getenv(key) == *expected))
        }
        other => Err(eval_error(expression, format!("unknown function ({other})"))),
    }
}

fn values_comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Str(_), Value::Str(_))
            | (Value::Int(_), Value::Int(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Strip an optional `{{ ... }}` wrapper.
fn unwrap_braces(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Evaluate an expression to a boolean via truthiness coercion.
pub fn evaluate_to_bool(expression: &str, state: &TemplateState) -> Result<bool> {
    let inner = unwrap_braces(expression);
    if inner.is_empty() {
        return Err(eval_error(expression, "empty expression"));
    }
    let ast = parse(inner)?;
    eval(&ast, state, expression)?.truthy(expression)
}

/// Evaluate a template to a string. Text outside `{{ ... }}` regions passes
/// through verbatim; each braced expression is replaced by its rendered
/// value.
pub fn evaluate_to_string(template: &str, state: &TemplateState) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(eval_error(template, "unterminated {{ in template"));
        };
        let inner = after[..end].trim();
        if inner.is_empty() {
            return Err(eval_error(template, "empty expression"));
        }
        let ast = parse(inner)?;
        result.push_str(&eval(&ast, state, template)?.render());
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}
