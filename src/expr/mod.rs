//! Sandboxed expression language for transition conditions and action properties.
//!
//! Expressions are a small Python-flavoured subset: literals, lists, dicts,
//! variable lookup, attribute and index access, `mapping.get(key, default)`,
//! boolean, comparison, membership and arithmetic operators. There is no
//! assignment, no function call other than `.get`, and no access to anything
//! outside the [`Context`] handed to [`evaluate`].

mod eval;
mod lexer;
mod parser;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

pub use eval::is_truthy;
pub use parser::{BinOp, Expr, parse};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("name `{0}` is not defined")]
    UnknownName(String),

    #[error("key `{0}` not found")]
    MissingKey(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes every key of a JSON object as a top-level variable.
    /// Non-object values yield an empty context.
    pub fn from_object(value: &Value) -> Self {
        let vars = value
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { vars }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Parses and evaluates `source` against `ctx`.
pub fn evaluate(source: &str, ctx: &Context) -> Result<Value, ExprError> {
    let expr = parse(source)?;
    eval::eval(&expr, ctx)
}

/// Evaluates `source` and reduces the result to its truthiness.
pub fn evaluate_condition(source: &str, ctx: &Context) -> Result<bool, ExprError> {
    evaluate(source, ctx).map(|v| is_truthy(&v))
}
