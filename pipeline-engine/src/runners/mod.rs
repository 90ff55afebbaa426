// Runners Module
// The external-command seam: how a step's opaque action is handed off and what comes back

pub mod scripted;
pub mod shell;

pub use scripted::ScriptedExecutor;
pub use shell::{parse_logging_commands, ShellExecutor};

use crate::parser::models::Step;

use std::collections::HashMap;
use std::path::PathBuf;

/// A single attempt at running a step. Macros have already been substituted.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub stage: String,
    pub job: String,
    pub step_index: usize,
    pub step: Step,
    /// Exported variables with the step's `env` overlay applied
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
}

impl StepInvocation {
    /// `name` if set, otherwise the display label
    pub fn key(&self) -> String {
        self.step.name.clone().unwrap_or_else(|| self.step.label())
    }
}

/// A variable emitted by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableUpdate {
    pub name: String,
    pub value: String,
    pub is_output: bool,
    pub is_readonly: bool,
}

impl VariableUpdate {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_output: false,
            is_readonly: false,
        }
    }

    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.is_readonly = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub variables: Vec<VariableUpdate>,
}

impl StepOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Runs script, bash, pwsh and task steps. Publish and download steps never reach it.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation) -> StepOutcome;
}
