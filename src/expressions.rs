//! The jq expression gateway.
//!
//! All data transformations in a workflow go through [`evaluate`]: input/output
//! filters, guards, switch cases, loop collections, `set` values. Expressions
//! are jq programs, usually wrapped in `${ ... }`; scope variables (`$context`,
//! `$input`, `$secrets`, loop variables, caught errors) are bound as jq global
//! variables rather than spliced into the data.

use jaq_core::{Ctx, RcIter};
use jaq_json::Val;
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::WorkflowError;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("JQ load errors: {errors}"))]
    JqLoad { errors: String },

    #[snafu(display("JQ compile errors: {errors}"))]
    JqCompile { errors: String },

    #[snafu(display("JQ evaluation error: {message}"))]
    JqEvaluation { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for WorkflowError {
    fn from(source: Error) -> Self {
        WorkflowError::expression("Expression evaluation failed").with_detail(source.to_string())
    }
}

/// A layered evaluation scope.
///
/// Layers are ordered innermost first (task descriptor, input/output, custom
/// variables, then ancestor overlays, finally the root layer with context,
/// secrets and descriptors). Merging never overrides a key already present in
/// a lower (inner) layer.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    layers: Vec<Map<String, Value>>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outer layer. Keys already bound by inner layers keep their
    /// existing binding.
    #[must_use]
    pub fn layered(mut self, layer: Map<String, Value>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append an outer layer holding a single variable.
    #[must_use]
    pub fn with_var(self, name: impl Into<String>, value: Value) -> Self {
        let mut layer = Map::new();
        layer.insert(name.into(), value);
        self.layered(layer)
    }

    /// Resolve the effective bindings, inner layers winning.
    #[must_use]
    pub fn flatten(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for layer in &self.layers {
            for (key, value) in layer {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        merged
    }
}

/// Evaluate a DSL expression against `data` with `scope` bound as jq globals.
///
/// A string wrapped in `${ ... }` is evaluated as jq; any other string is a
/// literal. Deterministic and side-effect-free.
pub fn evaluate(data: &Value, expression: &str, scope: &Scope) -> Result<Value> {
    match strip_wrapper(expression) {
        Some(code) => run_jq(code, data, scope),
        None => Ok(Value::String(expression.to_string())),
    }
}

/// Evaluate an expression field that is always jq, with or without the
/// `${ ... }` wrapper (guards, switch cases, loop collections).
pub fn evaluate_jq(data: &Value, expression: &str, scope: &Scope) -> Result<Value> {
    let code = strip_wrapper(expression).unwrap_or(expression.trim());
    run_jq(code, data, scope)
}

/// Recursively evaluate every string leaf of a template value.
pub fn evaluate_value(data: &Value, template: &Value, scope: &Scope) -> Result<Value> {
    match template {
        Value::String(text) => evaluate(data, text, scope),
        Value::Object(map) => {
            let mut result = Map::with_capacity(map.len());
            for (key, value) in map {
                result.insert(key.clone(), evaluate_value(data, value, scope)?);
            }
            Ok(Value::Object(result))
        }
        Value::Array(items) => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                result.push(evaluate_value(data, item, scope)?);
            }
            Ok(Value::Array(result))
        }
        other => Ok(other.clone()),
    }
}

/// jq truthiness: null and false are falsy, everything else truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn strip_wrapper(expression: &str) -> Option<&str> {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

fn run_jq(code: &str, data: &Value, scope: &Scope) -> Result<Value> {
    use jaq_core::compile::Compiler;
    use jaq_core::load::{Arena, File, Loader};

    let bindings = scope.flatten();

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File { path: (), code };

    let modules = loader.load(&arena, file).map_err(|errs| Error::JqLoad {
        errors: format!("{errs:?}"),
    })?;

    let var_names: Vec<String> = bindings.keys().map(|name| format!("${name}")).collect();
    let compiler = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(var_names.iter().map(String::as_str));
    let filter = compiler.compile(modules).map_err(|errs| Error::JqCompile {
        errors: format!("{errs:?}"),
    })?;

    let var_values: Vec<Val> = bindings.values().map(|value| value.clone().into()).collect();
    let input: Val = data.clone().into();
    let inputs = RcIter::new(core::iter::empty());
    let mut results = filter.run((Ctx::new(var_values, &inputs), input));

    match results.next() {
        Some(Ok(val)) => Ok(val.into()),
        Some(Err(e)) => JqEvaluationSnafu {
            message: e.to_string(),
        }
        .fail(),
        None => Ok(Value::Null),
    }
}
