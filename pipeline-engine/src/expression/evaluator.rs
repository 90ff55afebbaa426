// Expression Evaluator
// Evaluates condition ASTs against variables, parameters and prior node status

use crate::expression::functions::BuiltinFunctions;
use crate::expression::lexer::{segments, Segment};
use crate::expression::parser::{BinaryOp, Expr, ExprParser, Reference, ReferencePart, UnaryOp};
use crate::parser::models::{Status, Value};

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("expression error: {message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a condition can observe. Evaluation never mutates it.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    /// Flattened variable environment of the evaluating scope
    pub variables: HashMap<String, Value>,

    pub parameters: HashMap<String, Value>,

    /// Loop variables bound by `${{ each }}`
    pub locals: HashMap<String, Value>,

    /// `dependencies.<name>.result` / `.outputs[...]`
    pub dependencies: HashMap<String, DependencyContext>,

    pub status: StatusContext,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyContext {
    pub result: Status,
    pub outputs: HashMap<String, String>,
}

/// Status facts consumed by `succeeded()`, `failed()` and friends
#[derive(Debug, Clone, Default)]
pub struct StatusContext {
    /// What the no-argument forms look at: the stage's dependencies,
    /// the job's dependencies, or the job's status so far for a step
    pub implicit: Vec<Status>,
    /// Nodes that may be named explicitly, e.g. `succeeded('Build')`
    pub named: HashMap<String, Status>,
    pub canceled: bool,
}

impl ExpressionContext {
    pub fn with_parameters(mut self, parameters: &BTreeMap<String, serde_yaml::Value>) -> Self {
        self.parameters = parameters
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_yaml(v)))
            .collect();
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        self
    }

    /// Record a dependency under both its own name and the status lookup table
    pub fn add_dependency(&mut self, name: &str, result: Status, outputs: HashMap<String, String>) {
        self.status.implicit.push(result);
        self.status.named.insert(name.to_string(), result);
        self.dependencies
            .insert(name.to_string(), DependencyContext { result, outputs });
    }
}

pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self {
            context,
            functions: BuiltinFunctions,
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Reference(reference) => self.eval_reference(reference),

            Expr::FunctionCall { name, args } => self.eval_function(name, args),

            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                self.eval_index(&obj, &idx)
            }

            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => Ok(Value::Bool(!self.eval(expr)?.is_truthy())),

            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => self.eval_and(&[left.as_ref(), right.as_ref()]),
                BinaryOp::Or => self.eval_or(&[left.as_ref(), right.as_ref()]),
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    self.eval_binary(*op, &left, &right)
                }
            },

            Expr::Array(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    /// Left-to-right, stopping at the first falsy operand
    fn eval_and(&self, operands: &[&Expr]) -> Result<Value, EvalError> {
        for operand in operands {
            if !self.eval(operand)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }

    fn eval_or(&self, operands: &[&Expr]) -> Result<Value, EvalError> {
        for operand in operands {
            if self.eval(operand)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }

    fn eval_function(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let operands: Vec<&Expr> = args.iter().collect();
        match name.to_lowercase().as_str() {
            "and" => {
                require_at_least(&operands, 2, name)?;
                self.eval_and(&operands)
            }
            "or" => {
                require_at_least(&operands, 2, name)?;
                self.eval_or(&operands)
            }
            _ => {
                let evaluated = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, evaluated, self.context)
            }
        }
    }

    fn eval_reference(&self, reference: &Reference) -> Result<Value, EvalError> {
        let root = reference.root();
        let rest = &reference.parts[1..];

        // Variable names may contain dots (Build.SourceBranch); missing ones are empty
        if root.eq_ignore_ascii_case("variables") {
            let Some(name) = self.variable_name(rest)? else {
                return Ok(Value::Object(
                    self.context
                        .variables
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ));
            };
            return Ok(self
                .context
                .variables
                .get(&name)
                .cloned()
                .unwrap_or_else(|| Value::String(String::new())));
        }

        let mut current = self.lookup_root(root)?;
        for part in rest {
            current = match part {
                ReferencePart::Property(name) => self.eval_member(&current, name),
                ReferencePart::Index(index) => {
                    let index = self.eval(index)?;
                    self.eval_index(&current, &index)?
                }
            };
        }
        Ok(current)
    }

    fn variable_name(&self, parts: &[ReferencePart]) -> Result<Option<String>, EvalError> {
        let mut names = Vec::new();
        for part in parts {
            match part {
                ReferencePart::Property(name) => names.push(name.clone()),
                ReferencePart::Index(index) => names.push(self.eval(index)?.as_string()),
            }
        }
        Ok((!names.is_empty()).then(|| names.join(".")))
    }

    fn lookup_root(&self, name: &str) -> Result<Value, EvalError> {
        // `each` loop variables shadow everything else
        if let Some(value) = self.context.locals.get(name) {
            return Ok(value.clone());
        }

        match name.to_lowercase().as_str() {
            "parameters" => Ok(Value::Object(
                self.context
                    .parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            "dependencies" | "stagedependencies" => Ok(self.dependencies_to_value()),
            _ => Err(EvalError::new(format!("unrecognized value: '{}'", name))),
        }
    }

    fn dependencies_to_value(&self) -> Value {
        let entries = self
            .context
            .dependencies
            .iter()
            .map(|(name, dep)| {
                let mut node = BTreeMap::new();
                node.insert("result".to_string(), Value::String(dep.result.to_string()));
                node.insert(
                    "outputs".to_string(),
                    Value::Object(
                        dep.outputs
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    ),
                );
                (name.clone(), Value::Object(node))
            })
            .collect();
        Value::Object(entries)
    }

    fn eval_member(&self, object: &Value, property: &str) -> Value {
        match object {
            Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn eval_index(&self, object: &Value, index: &Value) -> Result<Value, EvalError> {
        match (object, index) {
            (Value::Array(items), Value::Number(n)) => Ok(items
                .get(*n as usize)
                .cloned()
                .unwrap_or(Value::Null)),
            (Value::Object(map), key) => Ok(map.get(&key.as_string()).cloned().unwrap_or(Value::Null)),
            (Value::Null, _) => Ok(Value::Null),
            _ => Err(EvalError::new(format!(
                "cannot index {} with {}",
                object.as_string(),
                index.as_string()
            ))),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
        let result = match op {
            BinaryOp::Eq => values_equal(left, right),
            BinaryOp::Ne => !values_equal(left, right),
            BinaryOp::Lt => compare(left, right)? < 0,
            BinaryOp::Le => compare(left, right)? <= 0,
            BinaryOp::Gt => compare(left, right)? > 0,
            BinaryOp::Ge => compare(left, right)? >= 0,
            BinaryOp::And | BinaryOp::Or => {
                return Err(EvalError::new(format!("operator {} is short-circuit", op)))
            }
        };
        Ok(Value::Bool(result))
    }
}

fn require_at_least(args: &[&Expr], count: usize, name: &str) -> Result<(), EvalError> {
    if args.len() < count {
        return Err(EvalError::new(format!(
            "{}() requires at least {} arguments",
            name, count
        )));
    }
    Ok(())
}

/// Loose equality: strings compare case-insensitively, and mixed types are
/// coerced to the left operand's type
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => b
            .trim()
            .parse::<f64>()
            .map(|n| (a - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => false,
    }
}

/// Numeric comparison when both sides are numeric, else case-insensitive string ordering
pub fn compare(left: &Value, right: &Value) -> Result<i8, EvalError> {
    let ordering = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::new("cannot compare NaN"))?,
        _ => left
            .as_string()
            .to_lowercase()
            .cmp(&right.as_string().to_lowercase()),
    };
    Ok(ordering as i8)
}

/// Parses and evaluates expression text against an owned context
#[derive(Debug, Clone, Default)]
pub struct ExpressionEngine {
    context: ExpressionContext,
}

impl ExpressionEngine {
    pub fn new(context: ExpressionContext) -> Self {
        Self { context }
    }

    pub fn evaluate(&self, expr: &str) -> Result<Value, EvalError> {
        let ast = ExprParser::parse_str(expr)
            .map_err(|e| EvalError::new(format!("invalid expression '{}': {}", expr, e)))?;
        Evaluator::new(&self.context).eval(&ast)
    }

    /// Evaluate a condition. A bare `$[ ... ]` wrapper is accepted.
    pub fn evaluate_condition(&self, condition: &str) -> Result<bool, EvalError> {
        let trimmed = condition.trim();
        let body = trimmed
            .strip_prefix("$[")
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        self.evaluate(body).map(|v| v.is_truthy())
    }

    /// Replace `$(name)` with variable values. Unknown names are left as written.
    pub fn substitute_macros(&self, text: &str) -> String {
        if !text.contains("$(") {
            return text.to_string();
        }

        segments(text)
            .into_iter()
            .map(|segment| match segment {
                Segment::Text(s) => s,
                Segment::Macro(name) => match self.context.variables.get(&name) {
                    Some(value) => value.as_string(),
                    None => format!("$({})", name),
                },
                Segment::CompileTime(expr) => format!("${{{{ {} }}}}", expr),
                Segment::Runtime(expr) => format!("$[ {} ]", expr),
            })
            .collect()
    }

    /// Evaluate `$[ ]` segments. A string that is exactly one runtime expression
    /// becomes that expression's value; otherwise each segment is stringified in place.
    pub fn substitute_runtime(&self, text: &str) -> Result<String, EvalError> {
        if !text.contains("$[") {
            return Ok(text.to_string());
        }

        let mut result = String::new();
        for segment in segments(text) {
            match segment {
                Segment::Runtime(expr) => result.push_str(&self.evaluate(&expr)?.as_string()),
                Segment::Text(s) => result.push_str(&s),
                Segment::Macro(name) => result.push_str(&format!("$({})", name)),
                Segment::CompileTime(expr) => result.push_str(&format!("${{{{ {} }}}}", expr)),
            }
        }
        Ok(result)
    }

    pub fn context(&self) -> &ExpressionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExpressionContext {
        &mut self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> ExpressionContext {
        let mut ctx = ExpressionContext::default()
            .with_variables(HashMap::from([
                ("Configuration".to_string(), "Release".to_string()),
                ("Build.SourceBranch".to_string(), "refs/heads/main".to_string()),
                ("BuildDocs".to_string(), "false".to_string()),
            ]));
        ctx.parameters
            .insert("BuildDocs".to_string(), Value::Bool(true));
        ctx
    }

    fn eval(expr: &str) -> Result<Value, EvalError> {
        ExpressionEngine::new(make_context()).evaluate(expr)
    }

    #[test]
    fn test_eval_variable_reference() {
        assert_eq!(eval("variables.Configuration").unwrap(), "Release".into());
        assert_eq!(
            eval("variables['Build.SourceBranch']").unwrap(),
            "refs/heads/main".into()
        );
        assert_eq!(
            eval("variables.Build.SourceBranch").unwrap(),
            "refs/heads/main".into()
        );
    }

    #[test]
    fn test_unknown_variable_is_empty_string() {
        assert_eq!(eval("variables.Missing").unwrap(), "".into());
        assert_eq!(eval("eq(variables.Missing, '')").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_unknown_root_is_an_error() {
        assert!(eval("bogus.thing").is_err());
    }

    #[test]
    fn test_eval_parameter_reference() {
        assert_eq!(eval("parameters.BuildDocs").unwrap(), Value::Bool(true));
        assert_eq!(eval("parameters.Nope").unwrap(), Value::Null);
    }

    #[test]
    fn test_eval_equality_is_case_insensitive() {
        assert_eq!(
            eval("variables.Configuration == 'release'").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval("eq(parameters.BuildDocs, 'True')").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval("1 < 2").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_and_short_circuits() {
        // The right operand would fail to evaluate; short-circuit must skip it
        assert_eq!(eval("and(false, bogus.value)").unwrap(), Value::Bool(false));
        assert_eq!(eval("false && bogus.value").unwrap(), Value::Bool(false));
        assert_eq!(eval("or(true, bogus.value)").unwrap(), Value::Bool(true));
        assert!(eval("and(true, bogus.value)").is_err());
    }

    #[test]
    fn test_and_requires_two_arguments() {
        assert!(eval("and(true)").is_err());
    }

    #[test]
    fn test_dependencies_result() {
        let mut ctx = make_context();
        ctx.add_dependency(
            "Build",
            Status::SucceededWithIssues,
            HashMap::from([("Job.setVars.tag".to_string(), "v1".to_string())]),
        );
        let engine = ExpressionEngine::new(ctx);
        assert_eq!(
            engine
                .evaluate("dependencies.Build.result")
                .unwrap(),
            "SucceededWithIssues".into()
        );
        assert_eq!(
            engine
                .evaluate("dependencies.Build.outputs['Job.setVars.tag']")
                .unwrap(),
            "v1".into()
        );
    }

    #[test]
    fn test_evaluate_condition_accepts_runtime_wrapper() {
        let engine = ExpressionEngine::new(make_context());
        assert!(!engine.evaluate_condition("$[ eq(variables.BuildDocs, 'true') ]").unwrap());
        assert!(engine.evaluate_condition("ne(variables.BuildDocs, 'true')").unwrap());
        assert!(engine.evaluate_condition("eq(variables.BuildDocs,").is_err());
    }

    #[test]
    fn test_substitute_macros() {
        let engine = ExpressionEngine::new(make_context());
        assert_eq!(
            engine.substitute_macros("dotnet build -c $(Configuration) $(Unknown)"),
            "dotnet build -c Release $(Unknown)"
        );
    }

    #[test]
    fn test_substitute_runtime() {
        let engine = ExpressionEngine::new(make_context());
        assert_eq!(
            engine
                .substitute_runtime("$[ eq(variables.Configuration, 'Release') ]")
                .unwrap(),
            "true"
        );
        assert_eq!(engine.substitute_runtime("plain").unwrap(), "plain");
    }
}
