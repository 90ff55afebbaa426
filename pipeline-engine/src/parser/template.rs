// Template Expander
// Loads template documents, applies compile-time directives and splices template references

use crate::expression::lexer::{has_compile_time_expression, sole_compile_time_expression};
use crate::expression::{ExpressionContext, ExpressionEngine};
use crate::parser::binder::bind_parameters;
use crate::parser::error::ParseError;
use crate::parser::models::{scalar_to_string, Parameter, ParameterType, Pipeline, Value};

use serde_yaml::{Mapping, Value as Yaml};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Error raised while expanding templates. Always fatal: nothing runs.
#[derive(Debug, Clone)]
pub struct TemplateError {
    pub message: String,
    pub template_path: Option<String>,
    pub kind: TemplateErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateErrorKind {
    NotFound,
    /// A template reappeared in its own expansion chain with the same parameters
    CycleDetected,
    UnboundParameter,
    /// An override names a parameter the template does not declare
    UnknownParameter,
    TypeMismatch,
    /// Value outside the parameter's `values:` list
    InvalidParameterValue,
    Expression,
    /// Template file is not valid YAML or has the wrong shape
    Parse,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.template_path {
            Some(path) => write!(f, "template error in '{}': {}", path, self.message),
            None => write!(f, "template error: {}", self.message),
        }
    }
}

impl std::error::Error for TemplateError {}

impl TemplateError {
    pub fn new(message: impl Into<String>, kind: TemplateErrorKind) -> Self {
        Self {
            message: message.into(),
            template_path: None,
            kind,
        }
    }

    /// Attach the template path, keeping the innermost one if already set
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.template_path.is_none() {
            self.template_path = Some(path.into());
        }
        self
    }

    fn parse(err: ParseError, path: &Path) -> Self {
        Self::new(err.to_string(), TemplateErrorKind::Parse).with_path(path.display().to_string())
    }
}

pub type TemplateResult<T> = Result<T, TemplateError>;

/// Root document after expansion, with the parameter values it was bound to
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedPipeline {
    pub pipeline: Pipeline,
    pub parameters: BTreeMap<String, Yaml>,
}

/// The kind of node list a template reference sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Stages,
    Jobs,
    Steps,
    Variables,
}

impl Level {
    fn key(&self) -> &'static str {
        match self {
            Level::Stages => "stages",
            Level::Jobs => "jobs",
            Level::Steps => "steps",
            Level::Variables => "variables",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    If(String),
    ElseIf(String),
    Else,
    /// `${{ each <var> in <collection> }}`
    Each(String, String),
}

/// Evaluation scope of one template instance
#[derive(Clone)]
struct Scope {
    engine: ExpressionEngine,
    file: PathBuf,
}

impl Scope {
    fn with_local(&self, name: &str, value: Value) -> Scope {
        let mut scope = self.clone();
        scope
            .engine
            .context_mut()
            .locals
            .insert(name.to_string(), value);
        scope
    }
}

/// One template instance currently being expanded
#[derive(Debug, Clone)]
struct Frame {
    path: PathBuf,
    signature: String,
}

/// Expands a root document into a concrete tree of stages, jobs and steps.
///
/// Expansion happens on the raw YAML tree, once per template instance:
/// 1. bind the instance's parameters,
/// 2. apply `${{ if }}` / `${{ each }}` directives and substitute `${{ }}` expressions,
/// 3. replace every `template:` reference with the expansion of the referenced file.
///
/// A reference whose (file, bound parameters) pair is already on the expansion stack
/// is a cycle. So is a file that already appears [`MAX_SELF_INCLUSION`] times on the
/// stack, whatever its parameters.
pub struct TemplateEngine {
    repo_root: PathBuf,
    stack: Vec<Frame>,
    /// Literal root variables, readable by compile-time expressions
    variables: HashMap<String, String>,
}

impl TemplateEngine {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            stack: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn expand_file(
        &mut self,
        path: &Path,
        overrides: &BTreeMap<String, Yaml>,
    ) -> TemplateResult<ExpandedPipeline> {
        let source = fs::read_to_string(path).map_err(|e| {
            TemplateError::new(
                format!("failed to read pipeline: {}", e),
                TemplateErrorKind::NotFound,
            )
            .with_path(path.display().to_string())
        })?;
        self.expand_str(&source, path, overrides)
    }

    /// Expand a root document. `origin` is where the document lives; its directory
    /// is the first place relative template paths are looked up.
    pub fn expand_str(
        &mut self,
        source: &str,
        origin: &Path,
        overrides: &BTreeMap<String, Yaml>,
    ) -> TemplateResult<ExpandedPipeline> {
        info!(pipeline = %origin.display(), "expanding pipeline");

        let document: Yaml = serde_yaml::from_str(source)
            .map_err(|e| TemplateError::parse(ParseError::from_yaml_error(&e, source), origin))?;
        let mut root = match document {
            Yaml::Mapping(map) => map,
            Yaml::Null => Mapping::new(),
            _ => {
                return Err(TemplateError::new(
                    "pipeline document must be a mapping",
                    TemplateErrorKind::Parse,
                )
                .with_path(origin.display().to_string()))
            }
        };

        let declared = parse_parameter_declarations(root.remove("parameters"), origin)?;
        let bound = bind_parameters(&declared, overrides, &origin.display().to_string())?;
        self.variables = compile_time_variables(root.get("variables"));

        let identity = canonical(origin);
        self.stack.clear();
        self.stack.push(Frame {
            path: identity.clone(),
            signature: signature(&bound),
        });

        let scope = self.scope(&bound, &identity);
        let expanded = self.expand_root(Yaml::Mapping(root), &scope);
        self.stack.clear();
        let expanded = expanded?;

        let mut pipeline: Pipeline = serde_yaml::from_value(expanded).map_err(|e| {
            TemplateError::parse(ParseError::from_yaml_error(&e, ""), origin)
        })?;
        pipeline.parameters = declared;

        debug!(
            stages = pipeline.stages.len(),
            jobs = pipeline.jobs.len(),
            steps = pipeline.steps.len(),
            "pipeline expanded"
        );

        Ok(ExpandedPipeline {
            pipeline,
            parameters: bound,
        })
    }

    fn expand_root(&mut self, root: Yaml, scope: &Scope) -> TemplateResult<Yaml> {
        let Yaml::Mapping(mut evaluated) = self.evaluate(&root, scope)? else {
            return Err(TemplateError::new(
                "pipeline document must be a mapping",
                TemplateErrorKind::Parse,
            ));
        };

        for level in [Level::Variables, Level::Stages, Level::Jobs, Level::Steps] {
            if let Some(Yaml::Sequence(items)) = evaluated.get(level.key()) {
                let items = items.clone();
                let resolved = self.resolve(level, items, scope)?;
                evaluated.insert(level.key().into(), Yaml::Sequence(resolved));
            }
        }

        Ok(Yaml::Mapping(evaluated))
    }

    fn scope(&self, parameters: &BTreeMap<String, Yaml>, file: &Path) -> Scope {
        let context = ExpressionContext::default()
            .with_parameters(parameters)
            .with_variables(self.variables.clone());
        Scope {
            engine: ExpressionEngine::new(context),
            file: file.to_path_buf(),
        }
    }

    // =========================================================================
    // Template references
    // =========================================================================

    /// Replace template references in an evaluated node list, recursing into children
    fn resolve(&mut self, level: Level, items: Vec<Yaml>, scope: &Scope) -> TemplateResult<Vec<Yaml>> {
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            match template_reference(level, &item) {
                Some(reference) => {
                    let included = self.include(level, &reference, &item, scope)?;
                    resolved.extend(included);
                }
                None => resolved.push(self.resolve_children(level, item, scope)?),
            }
        }
        Ok(resolved)
    }

    fn resolve_children(&mut self, level: Level, item: Yaml, scope: &Scope) -> TemplateResult<Yaml> {
        let children: &[Level] = match level {
            Level::Stages => &[Level::Variables, Level::Jobs],
            Level::Jobs => &[Level::Variables, Level::Steps],
            Level::Steps | Level::Variables => return Ok(item),
        };

        let Yaml::Mapping(mut map) = item else {
            return Ok(item);
        };
        for child in children {
            if let Some(Yaml::Sequence(items)) = map.get(child.key()) {
                let items = items.clone();
                let resolved = self.resolve(*child, items, scope)?;
                map.insert(child.key().into(), Yaml::Sequence(resolved));
            }
        }
        Ok(Yaml::Mapping(map))
    }

    fn include(
        &mut self,
        level: Level,
        reference: &str,
        item: &Yaml,
        scope: &Scope,
    ) -> TemplateResult<Vec<Yaml>> {
        let path = self.resolve_template_path(reference, &scope.file)?;
        debug!(template = %path.display(), from = %scope.file.display(), "including template");

        let source = fs::read_to_string(&path).map_err(|e| {
            TemplateError::new(
                format!("failed to read template: {}", e),
                TemplateErrorKind::NotFound,
            )
            .with_path(reference)
        })?;
        let mut document = match serde_yaml::from_str(&source) {
            Ok(Yaml::Mapping(map)) => map,
            Ok(_) => {
                return Err(TemplateError::new(
                    "template document must be a mapping",
                    TemplateErrorKind::Parse,
                )
                .with_path(reference))
            }
            Err(e) => {
                return Err(TemplateError::parse(
                    ParseError::from_yaml_error(&e, &source),
                    Path::new(reference),
                ))
            }
        };

        let declared = parse_parameter_declarations(document.remove("parameters"), &path)?;
        let overrides = reference_overrides(item, reference)?;
        let bound = bind_parameters(&declared, &overrides, reference)?;

        self.enter(&path, &bound)?;
        let result = self.expand_body(level, &document, &path, &bound, reference);
        self.stack.pop();
        result
    }

    fn expand_body(
        &mut self,
        level: Level,
        document: &Mapping,
        path: &Path,
        bound: &BTreeMap<String, Yaml>,
        reference: &str,
    ) -> TemplateResult<Vec<Yaml>> {
        let Some(body) = document.get(level.key()) else {
            return Err(TemplateError::new(
                format!("template has no '{}' section", level.key()),
                TemplateErrorKind::Parse,
            )
            .with_path(reference));
        };

        let scope = self.scope(bound, path);
        let items = match self.evaluate(body, &scope)? {
            Yaml::Sequence(items) => items,
            Yaml::Null => Vec::new(),
            Yaml::Mapping(map) if level == Level::Variables => map
                .into_iter()
                .map(|(name, value)| {
                    let mut entry = Mapping::new();
                    entry.insert("name".into(), name);
                    entry.insert("value".into(), value);
                    Yaml::Mapping(entry)
                })
                .collect(),
            _ => {
                return Err(TemplateError::new(
                    format!("'{}' section must be a list", level.key()),
                    TemplateErrorKind::Parse,
                )
                .with_path(reference))
            }
        };

        self.resolve(level, items, &scope)
            .map_err(|e| e.with_path(reference))
    }

    /// Relative to the referencing file first, then the repository root.
    /// A leading `/` means repository root only.
    fn resolve_template_path(&self, reference: &str, from: &Path) -> TemplateResult<PathBuf> {
        let mut candidates = Vec::new();
        match reference.strip_prefix('/') {
            Some(rooted) => candidates.push(self.repo_root.join(rooted)),
            None => {
                if let Some(dir) = from.parent() {
                    candidates.push(dir.join(reference));
                }
                candidates.push(self.repo_root.join(reference));
            }
        }

        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(canonical(found));
        }

        let looked: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(TemplateError::new(
            format!("template not found (looked in {})", looked.join(", ")),
            TemplateErrorKind::NotFound,
        )
        .with_path(reference))
    }

    /// Push an expansion frame, failing if the same instance is already being expanded
    fn enter(&mut self, path: &Path, bound: &BTreeMap<String, Yaml>) -> TemplateResult<()> {
        let frame = Frame {
            path: path.to_path_buf(),
            signature: signature(bound),
        };

        let repeated = self
            .stack
            .iter()
            .position(|f| f.path == frame.path && f.signature == frame.signature)
            .or_else(|| {
                let same_path = self.stack.iter().filter(|f| f.path == frame.path).count();
                (same_path >= MAX_SELF_INCLUSION)
                    .then(|| self.stack.iter().position(|f| f.path == frame.path))
                    .flatten()
            });

        if let Some(start) = repeated {
            let chain: Vec<String> = self.stack[start..]
                .iter()
                .chain(std::iter::once(&frame))
                .map(|f| f.path.display().to_string())
                .collect();
            return Err(TemplateError::new(
                format!("template cycle detected:\n  {}", chain.join("\n  -> ")),
                TemplateErrorKind::CycleDetected,
            ));
        }

        self.stack.push(frame);
        Ok(())
    }

    // =========================================================================
    // Compile-time evaluation
    // =========================================================================

    fn evaluate(&self, value: &Yaml, scope: &Scope) -> TemplateResult<Yaml> {
        match value {
            Yaml::Sequence(items) => self.evaluate_sequence(items, scope).map(Yaml::Sequence),
            Yaml::Mapping(map) => self.evaluate_mapping(map, scope).map(Yaml::Mapping),
            Yaml::String(text) => self.evaluate_string(text, scope),
            other => Ok(other.clone()),
        }
    }

    fn evaluate_sequence(&self, items: &[Yaml], scope: &Scope) -> TemplateResult<Vec<Yaml>> {
        let mut result = Vec::new();
        // Some(taken) while inside an if/elseif/else chain
        let mut chain: Option<bool> = None;

        for item in items {
            let Some((directive, body)) = sequence_directive(item) else {
                chain = None;
                match item {
                    // A lone expression yielding a list is spliced in place
                    Yaml::String(text) if sole_compile_time_expression(text).is_some() => {
                        match self.evaluate_string(text, scope)? {
                            Yaml::Sequence(values) => result.extend(values),
                            other => result.push(other),
                        }
                    }
                    other => result.push(self.evaluate(other, scope)?),
                }
                continue;
            };

            match directive {
                Directive::If(condition) => {
                    let taken = self.condition(&condition, scope)?;
                    if taken {
                        result.extend(self.directive_body(body, scope)?);
                    }
                    chain = Some(taken);
                }
                Directive::ElseIf(condition) => {
                    let taken = self.chained(chain, "elseif", scope)?;
                    if !taken && self.condition(&condition, scope)? {
                        result.extend(self.directive_body(body, scope)?);
                        chain = Some(true);
                    }
                }
                Directive::Else => {
                    if !self.chained(chain, "else", scope)? {
                        result.extend(self.directive_body(body, scope)?);
                    }
                    chain = None;
                }
                Directive::Each(var, collection) => {
                    chain = None;
                    for binding in self.iterate(&collection, scope)? {
                        result.extend(self.directive_body(body, &scope.with_local(&var, binding))?);
                    }
                }
            }
        }

        Ok(result)
    }

    fn evaluate_mapping(&self, map: &Mapping, scope: &Scope) -> TemplateResult<Mapping> {
        let mut result = Mapping::new();
        let mut chain: Option<bool> = None;

        for (key, value) in map {
            let Some(directive) = key.as_str().and_then(parse_directive) else {
                chain = None;
                let key = match key {
                    Yaml::String(text) => Yaml::String(self.interpolate(text, scope)?),
                    other => other.clone(),
                };
                result.insert(key, self.evaluate(value, scope)?);
                continue;
            };

            match directive {
                Directive::If(condition) => {
                    let taken = self.condition(&condition, scope)?;
                    if taken {
                        self.merge(&mut result, value, scope)?;
                    }
                    chain = Some(taken);
                }
                Directive::ElseIf(condition) => {
                    let taken = self.chained(chain, "elseif", scope)?;
                    if !taken && self.condition(&condition, scope)? {
                        self.merge(&mut result, value, scope)?;
                        chain = Some(true);
                    }
                }
                Directive::Else => {
                    if !self.chained(chain, "else", scope)? {
                        self.merge(&mut result, value, scope)?;
                    }
                    chain = None;
                }
                Directive::Each(var, collection) => {
                    chain = None;
                    for binding in self.iterate(&collection, scope)? {
                        self.merge(&mut result, value, &scope.with_local(&var, binding))?;
                    }
                }
            }
        }

        Ok(result)
    }

    /// Merge the entries of a mapping-level directive body into `target`
    fn merge(&self, target: &mut Mapping, body: &Yaml, scope: &Scope) -> TemplateResult<()> {
        match body {
            Yaml::Null => Ok(()),
            Yaml::Mapping(map) => {
                for (k, v) in self.evaluate_mapping(map, scope)? {
                    target.insert(k, v);
                }
                Ok(())
            }
            _ => Err(self.error(
                "a directive used as a mapping key must contain a mapping",
                scope,
            )),
        }
    }

    fn directive_body(&self, body: &Yaml, scope: &Scope) -> TemplateResult<Vec<Yaml>> {
        match body {
            Yaml::Null => Ok(Vec::new()),
            Yaml::Sequence(items) => self.evaluate_sequence(items, scope),
            other => self.evaluate_sequence(std::slice::from_ref(other), scope),
        }
    }

    fn chained(&self, chain: Option<bool>, directive: &str, scope: &Scope) -> TemplateResult<bool> {
        chain.ok_or_else(|| {
            self.error(
                &format!("'{}' directive without a preceding 'if'", directive),
                scope,
            )
        })
    }

    fn condition(&self, condition: &str, scope: &Scope) -> TemplateResult<bool> {
        let taken = self.eval(condition, scope)?.is_truthy();
        debug!(condition, taken, "compile-time condition");
        Ok(taken)
    }

    /// Items bound by `each`: list elements, or `{key, value}` per map entry
    fn iterate(&self, collection: &str, scope: &Scope) -> TemplateResult<Vec<Value>> {
        match self.eval(collection, scope)? {
            Value::Array(items) => Ok(items),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| {
                    Value::Object(BTreeMap::from([
                        ("key".to_string(), Value::String(key)),
                        ("value".to_string(), value),
                    ]))
                })
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(self.error(
                &format!(
                    "'each' requires a list or mapping, '{}' evaluated to {}",
                    collection,
                    other.as_string()
                ),
                scope,
            )),
        }
    }

    /// A string that is exactly one expression keeps the value's type
    fn evaluate_string(&self, text: &str, scope: &Scope) -> TemplateResult<Yaml> {
        if !has_compile_time_expression(text) {
            return Ok(Yaml::String(text.to_string()));
        }
        if let Some(expr) = sole_compile_time_expression(text) {
            return Ok(self.eval(&expr, scope)?.to_yaml());
        }
        self.interpolate(text, scope).map(Yaml::String)
    }

    /// Replace each `${{ expr }}` with its string form. Runtime expressions and
    /// macros are left exactly as written.
    fn interpolate(&self, text: &str, scope: &Scope) -> TemplateResult<String> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let Some(end) = closing_braces(after) else {
                result.push_str(&rest[start..]);
                rest = "";
                break;
            };
            result.push_str(&self.eval(after[..end].trim(), scope)?.as_string());
            rest = &after[end + 2..];
        }

        result.push_str(rest);
        Ok(result)
    }

    fn eval(&self, expr: &str, scope: &Scope) -> TemplateResult<Value> {
        scope
            .engine
            .evaluate(expr)
            .map_err(|e| self.error(&format!("{} (in '${{{{ {} }}}}')", e.message, expr), scope))
    }

    fn error(&self, message: &str, scope: &Scope) -> TemplateError {
        TemplateError::new(message, TemplateErrorKind::Expression)
            .with_path(scope.file.display().to_string())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_directive(key: &str) -> Option<Directive> {
    let inner = key
        .trim()
        .strip_prefix("${{")?
        .strip_suffix("}}")?
        .trim();

    if inner == "else" {
        return Some(Directive::Else);
    }
    if let Some(rest) = inner.strip_prefix("elseif ") {
        return Some(Directive::ElseIf(rest.trim().to_string()));
    }
    if let Some(rest) = inner.strip_prefix("else if ") {
        return Some(Directive::ElseIf(rest.trim().to_string()));
    }
    if let Some(rest) = inner.strip_prefix("if ") {
        return Some(Directive::If(rest.trim().to_string()));
    }
    if let Some(rest) = inner.strip_prefix("each ") {
        let (var, collection) = rest.split_once(" in ")?;
        let (var, collection) = (var.trim(), collection.trim());
        if var.is_empty() || collection.is_empty() {
            return None;
        }
        return Some(Directive::Each(var.to_string(), collection.to_string()));
    }
    None
}

/// A sequence item that is a single-key mapping whose key is a directive
fn sequence_directive(item: &Yaml) -> Option<(Directive, &Yaml)> {
    let map = item.as_mapping()?;
    if map.len() != 1 {
        return None;
    }
    let (key, body) = map.iter().next()?;
    parse_directive(key.as_str()?).map(|d| (d, body))
}

fn template_reference(level: Level, item: &Yaml) -> Option<String> {
    let map = item.as_mapping()?;
    let reference = map.get("template")?.as_str()?;
    let named = match level {
        Level::Stages => map.contains_key("stage"),
        Level::Jobs => map.contains_key("job"),
        Level::Steps | Level::Variables => false,
    };
    (!named).then(|| reference.to_string())
}

fn reference_overrides(item: &Yaml, reference: &str) -> TemplateResult<BTreeMap<String, Yaml>> {
    match item.get("parameters") {
        None | Some(Yaml::Null) => Ok(BTreeMap::new()),
        Some(Yaml::Mapping(map)) => Ok(map
            .iter()
            .filter_map(|(k, v)| scalar_to_string(k).map(|k| (k, v.clone())))
            .collect()),
        Some(_) => Err(TemplateError::new(
            "template 'parameters' must be a mapping",
            TemplateErrorKind::Parse,
        )
        .with_path(reference)),
    }
}

/// `parameters:` as a list of declarations, or the shorthand `name: default` map
fn parse_parameter_declarations(value: Option<Yaml>, path: &Path) -> TemplateResult<Vec<Parameter>> {
    match value {
        None | Some(Yaml::Null) => Ok(Vec::new()),
        Some(list @ Yaml::Sequence(_)) => serde_yaml::from_value(list).map_err(|e| {
            TemplateError::new(
                format!("invalid parameter declarations: {}", e),
                TemplateErrorKind::Parse,
            )
            .with_path(path.display().to_string())
        }),
        Some(Yaml::Mapping(map)) => Ok(map
            .into_iter()
            .filter_map(|(name, default)| {
                let name = scalar_to_string(&name)?;
                Some(Parameter {
                    name,
                    display_name: None,
                    param_type: inferred_type(&default),
                    default: Some(default),
                    values: None,
                })
            })
            .collect()),
        Some(_) => Err(TemplateError::new(
            "'parameters' must be a list or a mapping",
            TemplateErrorKind::Parse,
        )
        .with_path(path.display().to_string())),
    }
}

fn inferred_type(default: &Yaml) -> ParameterType {
    match default {
        Yaml::Bool(_) => ParameterType::Boolean,
        Yaml::Number(_) => ParameterType::Number,
        Yaml::Sequence(_) => ParameterType::List,
        Yaml::Mapping(_) => ParameterType::Object,
        _ => ParameterType::String,
    }
}

/// Literal root variables visible to `${{ variables.x }}`
fn compile_time_variables(value: Option<&Yaml>) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    match value {
        Some(Yaml::Mapping(map)) => {
            for (name, value) in map {
                if let (Some(name), Some(value)) = (scalar_to_string(name), scalar_to_string(value)) {
                    if !name.starts_with("${{") {
                        variables.insert(name, value);
                    }
                }
            }
        }
        Some(Yaml::Sequence(items)) => {
            for item in items {
                let name = item.get("name").and_then(scalar_to_string);
                let value = item.get("value").and_then(scalar_to_string);
                if let (Some(name), Some(value)) = (name, value) {
                    variables.insert(name, value);
                }
            }
        }
        _ => {}
    }
    variables
}

/// Stable rendering of bound parameters, part of a template instance's identity
/// Nesting depth at which a file including itself counts as a cycle
pub const MAX_SELF_INCLUSION: usize = 16;

fn signature(bound: &BTreeMap<String, Yaml>) -> String {
    serde_yaml::to_string(bound).unwrap_or_default()
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Byte offset of the `}}` closing an expression, skipping quoted strings
fn closing_braces(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes[i + 1] == b'}' => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}
