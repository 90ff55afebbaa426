// Variable Environment
// Scope chain of pipeline, stage and job variables; ancestor scopes are frozen snapshots

use crate::expression::{EvalError, ExpressionContext, ExpressionEngine};
use crate::parser::models::{Value, Variable};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    #[error("variable '{0}' is read-only")]
    ReadOnly(String),
}

#[derive(Debug, Clone, Default)]
struct Frame {
    values: HashMap<String, String>,
    readonly: HashSet<String>,
}

/// Variables visible to one scope.
///
/// Writes always land in the local frame. Ancestor frames are shared, immutable
/// snapshots taken when the child scope was created, so sibling scopes never
/// observe each other's writes and need no locking.
#[derive(Debug, Clone, Default)]
pub struct VariableEnvironment {
    /// Outermost first
    ancestors: Vec<Arc<Frame>>,
    local: Frame,
}

impl VariableEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            ancestors: Vec::new(),
            local: Frame {
                values,
                readonly: HashSet::new(),
            },
        }
    }

    /// Open a nested scope over a snapshot of this one
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::new(self.local.clone()));
        Self {
            ancestors,
            local: Frame::default(),
        }
    }

    /// Innermost definition wins
    pub fn get(&self, name: &str) -> Option<&str> {
        std::iter::once(&self.local)
            .chain(self.ancestors.iter().rev().map(|f| f.as_ref()))
            .find_map(|frame| frame.values.get(name))
            .map(String::as_str)
    }

    pub fn is_readonly(&self, name: &str) -> bool {
        self.local.readonly.contains(name) || self.ancestors.iter().any(|f| f.readonly.contains(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), VariableError> {
        let name = name.into();
        if self.is_readonly(&name) {
            return Err(VariableError::ReadOnly(name));
        }
        self.local.values.insert(name, value.into());
        Ok(())
    }

    /// Set a value and lock it against later writes in this scope and its children
    pub fn set_readonly(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), VariableError> {
        let name = name.into();
        self.set(name.clone(), value)?;
        self.local.readonly.insert(name);
        Ok(())
    }

    /// Apply variable declarations in order. `$[ ]` values are evaluated against the
    /// variables declared so far plus `base` (dependencies, parameters). Writes to
    /// read-only names are logged and ignored.
    pub fn declare(&mut self, variables: &[Variable], base: &ExpressionContext) -> Result<(), EvalError> {
        for variable in variables {
            let Variable::KeyValue {
                name,
                value,
                readonly,
            } = variable
            else {
                debug!("skipping unexpanded variable template");
                continue;
            };

            let value = if value.contains("$[") {
                let mut context = base.clone();
                context.variables = self.values();
                ExpressionEngine::new(context).substitute_runtime(value)?
            } else {
                value.clone()
            };

            let written = if *readonly {
                self.set_readonly(name.clone(), value)
            } else {
                self.set(name.clone(), value)
            };
            if let Err(e) = written {
                warn!(error = %e, "ignoring variable declaration");
            }
        }
        Ok(())
    }

    /// Every visible variable, inner scopes shadowing outer ones
    pub fn flatten(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();
        for frame in self.ancestors.iter().map(|f| f.as_ref()).chain(std::iter::once(&self.local)) {
            for (k, v) in &frame.values {
                result.insert(k.clone(), v.clone());
            }
        }
        result
    }

    /// Flattened view for expression evaluation
    pub fn values(&self) -> HashMap<String, Value> {
        self.flatten()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect()
    }

    /// Process environment entries: `Build.SourceBranch` becomes `BUILD_SOURCEBRANCH`
    pub fn to_env(&self) -> HashMap<String, String> {
        self.flatten()
            .into_iter()
            .map(|(k, v)| (env_name(&k), v))
            .collect()
    }
}

pub fn env_name(variable: &str) -> String {
    variable
        .chars()
        .map(|c| if c == '.' || c == ' ' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_wins() {
        let mut pipeline = VariableEnvironment::new();
        pipeline.set("config", "Debug").unwrap();
        pipeline.set("region", "eu").unwrap();

        let mut stage = pipeline.child();
        stage.set("config", "Release").unwrap();
        let job = stage.child();

        assert_eq!(job.get("config"), Some("Release"));
        assert_eq!(job.get("region"), Some("eu"));
        assert_eq!(pipeline.get("config"), Some("Debug"));
        assert_eq!(job.get("missing"), None);
    }

    #[test]
    fn test_child_reads_snapshot() {
        let mut stage = VariableEnvironment::new();
        stage.set("a", "1").unwrap();
        let job = stage.child();
        stage.set("a", "2").unwrap();

        assert_eq!(job.get("a"), Some("1"));
    }

    #[test]
    fn test_sibling_writes_are_isolated() {
        let stage = VariableEnvironment::new();
        let mut left = stage.child();
        let right = stage.child();
        left.set("x", "left").unwrap();

        assert_eq!(left.get("x"), Some("left"));
        assert_eq!(right.get("x"), None);
    }

    #[test]
    fn test_readonly_blocks_descendant_writes() {
        let mut pipeline = VariableEnvironment::new();
        pipeline.set_readonly("version", "1.0").unwrap();
        assert_eq!(
            pipeline.set("version", "2.0"),
            Err(VariableError::ReadOnly("version".to_string()))
        );

        let mut job = pipeline.child();
        assert!(job.set("version", "3.0").is_err());
        assert_eq!(job.get("version"), Some("1.0"));
    }

    #[test]
    fn test_declare_evaluates_runtime_values() {
        let mut env = VariableEnvironment::new();
        env.set("branch", "refs/heads/main").unwrap();
        let declarations: Vec<Variable> = serde_yaml::from_str(
            "- { name: isMain, value: \"$[eq(variables.branch, 'refs/heads/main')]\" }\n- { name: locked, value: x, readonly: true }\n- { name: locked, value: y }",
        )
        .unwrap();

        env.declare(&declarations, &ExpressionContext::default()).unwrap();
        assert_eq!(env.get("isMain"), Some("true"));
        assert_eq!(env.get("locked"), Some("x"));
    }

    #[test]
    fn test_declare_rejects_malformed_expression() {
        let mut env = VariableEnvironment::new();
        let declarations: Vec<Variable> =
            serde_yaml::from_str("- { name: bad, value: '$[eq(]' }").unwrap();
        assert!(env.declare(&declarations, &ExpressionContext::default()).is_err());
    }

    #[test]
    fn test_to_env_names() {
        let mut env = VariableEnvironment::new();
        env.set("Build.SourceBranch", "main").unwrap();
        env.set("configuration", "Release").unwrap();
        let exported = env.to_env();
        assert_eq!(exported["BUILD_SOURCEBRANCH"], "main");
        assert_eq!(exported["CONFIGURATION"], "Release");
    }
}
