// Built-in Functions
// Comparison, string predicate and status functions available in conditions

use crate::expression::evaluator::{compare, values_equal, EvalError, ExpressionContext};
use crate::parser::models::{Status, Value};

/// Function table. `and`/`or` are handled by the evaluator so they can short-circuit.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &ExpressionContext,
    ) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Comparison
            "eq" => self.binary(&args, "eq", |a, b| Ok(values_equal(a, b))),
            "ne" => self.binary(&args, "ne", |a, b| Ok(!values_equal(a, b))),
            "lt" => self.binary(&args, "lt", |a, b| Ok(compare(a, b)? < 0)),
            "le" => self.binary(&args, "le", |a, b| Ok(compare(a, b)? <= 0)),
            "gt" => self.binary(&args, "gt", |a, b| Ok(compare(a, b)? > 0)),
            "ge" => self.binary(&args, "ge", |a, b| Ok(compare(a, b)? >= 0)),
            "in" => self.fn_in(&args).map(Value::Bool),
            "notin" => self.fn_in(&args).map(|found| Value::Bool(!found)),

            // Logical
            "not" => {
                require_args(&args, 1, "not")?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }
            "xor" => self.binary(&args, "xor", |a, b| Ok(a.is_truthy() ^ b.is_truthy())),

            // String predicates
            "contains" => self.fn_contains(&args),
            "containsvalue" => {
                require_args(&args, 2, "containsValue")?;
                let found = match &args[0] {
                    Value::Array(items) => items.iter().any(|v| values_equal(v, &args[1])),
                    Value::Object(map) => map.values().any(|v| values_equal(v, &args[1])),
                    _ => false,
                };
                Ok(Value::Bool(found))
            }
            "startswith" => self.binary(&args, "startsWith", |a, b| {
                Ok(a.as_string().to_lowercase().starts_with(&b.as_string().to_lowercase()))
            }),
            "endswith" => self.binary(&args, "endsWith", |a, b| {
                Ok(a.as_string().to_lowercase().ends_with(&b.as_string().to_lowercase()))
            }),

            // String helpers
            "lower" => {
                require_args(&args, 1, "lower")?;
                Ok(Value::String(args[0].as_string().to_lowercase()))
            }
            "upper" => {
                require_args(&args, 1, "upper")?;
                Ok(Value::String(args[0].as_string().to_uppercase()))
            }
            "format" => self.fn_format(&args),
            "join" => self.fn_join(&args),
            "length" => self.fn_length(&args),

            // Utility
            "coalesce" => Ok(args
                .into_iter()
                .find(|v| !matches!(v, Value::Null) && !v.as_string().is_empty())
                .unwrap_or(Value::Null)),
            "iif" => {
                require_args(&args, 3, "iif")?;
                let mut args = args;
                let otherwise = args.pop().unwrap_or_default();
                let then = args.pop().unwrap_or_default();
                Ok(if args[0].is_truthy() { then } else { otherwise })
            }

            // Status
            "always" => Ok(Value::Bool(true)),
            "canceled" => Ok(Value::Bool(context.status.canceled)),
            "succeeded" => self
                .statuses(&args, context)
                .map(|s| Value::Bool(!context.status.canceled && s.iter().all(Status::is_success))),
            "failed" => self
                .statuses(&args, context)
                .map(|s| Value::Bool(s.iter().any(|st| *st == Status::Failed))),
            "succeededorfailed" => self.statuses(&args, context).map(|s| {
                Value::Bool(
                    !context.status.canceled
                        && s.iter()
                            .all(|st| st.is_success() || *st == Status::Failed),
                )
            }),

            _ => Err(EvalError::new(format!("unknown function: {}", name))),
        }
    }

    /// Statuses a status predicate looks at: the named nodes, or the implicit set
    fn statuses(
        &self,
        args: &[Value],
        context: &ExpressionContext,
    ) -> Result<Vec<Status>, EvalError> {
        if args.is_empty() {
            return Ok(context.status.implicit.clone());
        }

        args.iter()
            .map(|arg| {
                let name = arg.as_string();
                context
                    .status
                    .named
                    .get(&name)
                    .copied()
                    .ok_or_else(|| EvalError::new(format!("unknown dependency: '{}'", name)))
            })
            .collect()
    }

    fn binary<F>(&self, args: &[Value], name: &str, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&Value, &Value) -> Result<bool, EvalError>,
    {
        require_args(args, 2, name)?;
        f(&args[0], &args[1]).map(Value::Bool)
    }

    fn fn_in(&self, args: &[Value]) -> Result<bool, EvalError> {
        if args.len() < 2 {
            return Err(EvalError::new("in() requires at least 2 arguments"));
        }
        let needle = &args[0];
        Ok(args[1..].iter().any(|candidate| match candidate {
            Value::Array(items) => items.iter().any(|item| values_equal(needle, item)),
            other => values_equal(needle, other),
        }))
    }

    fn fn_contains(&self, args: &[Value]) -> Result<Value, EvalError> {
        require_args(args, 2, "contains")?;
        let found = match (&args[0], &args[1]) {
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            (haystack, needle) => haystack
                .as_string()
                .to_lowercase()
                .contains(&needle.as_string().to_lowercase()),
        };
        Ok(Value::Bool(found))
    }

    fn fn_format(&self, args: &[Value]) -> Result<Value, EvalError> {
        let Some(template) = args.first() else {
            return Err(EvalError::new("format() requires at least 1 argument"));
        };

        let mut result = template.as_string();
        for (i, arg) in args.iter().skip(1).enumerate() {
            result = result.replace(&format!("{{{}}}", i), &arg.as_string());
        }
        Ok(Value::String(result))
    }

    fn fn_join(&self, args: &[Value]) -> Result<Value, EvalError> {
        require_args(args, 2, "join")?;
        let separator = args[0].as_string();
        match &args[1] {
            Value::Array(items) => Ok(Value::String(
                items
                    .iter()
                    .map(Value::as_string)
                    .collect::<Vec<_>>()
                    .join(&separator),
            )),
            other => Ok(Value::String(other.as_string())),
        }
    }

    fn fn_length(&self, args: &[Value]) -> Result<Value, EvalError> {
        require_args(args, 1, "length")?;
        let len = match &args[0] {
            Value::Null => 0,
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            other => {
                return Err(EvalError::new(format!(
                    "length() requires string, array, or object, got {}",
                    other.as_string()
                )))
            }
        };
        Ok(Value::Number(len as f64))
    }
}

fn require_args(args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
    if args.len() != count {
        return Err(EvalError::new(format!(
            "{}() requires {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}
