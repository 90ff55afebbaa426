// Scripted Executor
// In-process StepExecutor whose outcomes are configured up front; used by tests and dry runs

use crate::runners::{StepExecutor, StepInvocation, StepOutcome, VariableUpdate};

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Succeeds every step unless told otherwise. Steps are matched by
/// [`StepInvocation::key`]: their `name`, or their display label.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failing: HashSet<String>,
    /// Remaining failures before a step starts succeeding
    flaky: Mutex<HashMap<String, u32>>,
    variables: HashMap<String, Vec<VariableUpdate>>,
    delays: HashMap<String, Duration>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: steps.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_failure(mut self, step: impl Into<String>) -> Self {
        self.failing.insert(step.into());
        self
    }

    /// Fail the first `times` attempts, then succeed
    pub fn with_flaky(self, step: impl Into<String>, times: u32) -> Self {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(step.into(), times);
        }
        self
    }

    pub fn with_variable(mut self, step: impl Into<String>, update: VariableUpdate) -> Self {
        self.variables.entry(step.into()).or_default().push(update);
        self
    }

    pub fn with_delay(mut self, step: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(step.into(), delay);
        self
    }

    /// Keys of every attempted step, in invocation order
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn was_invoked(&self, step: &str) -> bool {
        self.invocations().iter().any(|key| key == step)
    }

    fn flaky_attempt(&self, key: &str) -> bool {
        let Ok(mut flaky) = self.flaky.lock() else {
            return false;
        };
        match flaky.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> StepOutcome {
        let key = invocation.key();
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(key.clone());
        }

        if let Some(delay) = self.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing.contains(&key) || self.flaky_attempt(&key) {
            let mut outcome = StepOutcome::failed(format!("step '{}' failed", key));
            outcome.exit_code = Some(1);
            return outcome;
        }

        StepOutcome {
            variables: self.variables.get(&key).cloned().unwrap_or_default(),
            ..StepOutcome::succeeded(format!("ran {}", key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Step;
    use std::path::PathBuf;

    fn invocation(name: &str) -> StepInvocation {
        StepInvocation {
            stage: "S".to_string(),
            job: "J".to_string(),
            step_index: 0,
            step: Step::script("true").with_name(name),
            env: HashMap::new(),
            working_dir: PathBuf::from("."),
        }
    }

    #[tokio::test]
    async fn test_configured_outcomes() {
        let executor = ScriptedExecutor::failing(["Pylint"])
            .with_variable("Version", VariableUpdate::new("version", "2.0").output());

        assert!(!executor.execute(&invocation("Pylint")).await.success);

        let ok = executor.execute(&invocation("Version")).await;
        assert!(ok.success);
        assert_eq!(ok.variables.len(), 1);

        assert_eq!(executor.invocations(), vec!["Pylint", "Version"]);
        assert!(executor.was_invoked("Version"));
        assert!(!executor.was_invoked("Ruff"));
    }

    #[tokio::test]
    async fn test_flaky_step_recovers() {
        let executor = ScriptedExecutor::new().with_flaky("Upload", 2);
        assert!(!executor.execute(&invocation("Upload")).await.success);
        assert!(!executor.execute(&invocation("Upload")).await.success);
        assert!(executor.execute(&invocation("Upload")).await.success);
    }
}
