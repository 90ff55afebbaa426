// Shell Executor
// Runs script, bash, pwsh and registered task steps as child processes

use crate::parser::models::StepAction;
use crate::runners::{StepExecutor, StepInvocation, StepOutcome, VariableUpdate};

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// sh on Unix, cmd on Windows
    Default,
    Bash,
    Pwsh,
}

impl Shell {
    fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
        }
    }
}

/// Default [`StepExecutor`]. Task steps run the script registered for their
/// identity, with each input exported as `INPUT_<NAME>`.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    tasks: HashMap<String, String>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the script run for `task` (`Pylint@1`, or `Pylint` for any version)
    pub fn with_task(mut self, task: impl Into<String>, script: impl Into<String>) -> Self {
        self.tasks.insert(task.into(), script.into());
        self
    }

    fn task_script(&self, task: &str) -> Option<&String> {
        self.tasks.get(task).or_else(|| {
            let base = task.split('@').next().unwrap_or(task);
            self.tasks.get(base)
        })
    }

    async fn run(
        &self,
        shell: Shell,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> StepOutcome {
        let (program, args) = shell.command();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(script)
            .current_dir(working_dir)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepOutcome::failed(format!("failed to spawn '{}': {}", program, e));
            }
        };

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_lines(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_lines(s)));

        let status = child.wait().await;
        let stdout = match stdout {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => return StepOutcome::failed(format!("failed to wait for '{}': {}", program, e)),
        };
        debug!(program, ?exit_code, "process exited");

        let success = exit_code == Some(0);
        let error = if success {
            None
        } else if stderr.is_empty() {
            Some(match exit_code {
                Some(code) => format!("process exited with code {}", code),
                None => "process terminated by signal".to_string(),
            })
        } else {
            Some(stderr)
        };

        StepOutcome {
            success,
            variables: parse_logging_commands(&stdout),
            output: stdout,
            error,
            exit_code,
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

#[async_trait::async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(&self, invocation: &StepInvocation) -> StepOutcome {
        let dir = |sub: &Option<String>| match sub {
            Some(sub) => invocation.working_dir.join(sub),
            None => invocation.working_dir.clone(),
        };

        match &invocation.step.action {
            StepAction::Script(s) => {
                self.run(Shell::Default, &s.script, &invocation.env, &dir(&s.working_directory))
                    .await
            }
            StepAction::Bash(s) => {
                self.run(Shell::Bash, &s.bash, &invocation.env, &dir(&s.working_directory))
                    .await
            }
            StepAction::Pwsh(s) => {
                self.run(Shell::Pwsh, &s.pwsh, &invocation.env, &dir(&s.working_directory))
                    .await
            }
            StepAction::Task(task) => {
                let Some(script) = self.task_script(&task.task) else {
                    return StepOutcome::failed(format!(
                        "no command registered for task '{}'",
                        task.task
                    ));
                };
                let mut env = invocation.env.clone();
                for (name, value) in &task.inputs {
                    env.insert(format!("INPUT_{}", name.to_uppercase()), value.clone());
                }
                self.run(Shell::Default, script, &env, &invocation.working_dir)
                    .await
            }
            _ => StepOutcome::failed(format!(
                "shell executor cannot run '{}'",
                invocation.step.label()
            )),
        }
    }
}

/// Extract `##vso[task.setvariable ...]value` commands from step output.
///
/// Recognized properties: `variable=`, `isOutput=`, `isReadOnly=` (case-insensitive).
pub fn parse_logging_commands(output: &str) -> Vec<VariableUpdate> {
    let mut updates = Vec::new();

    for line in output.lines() {
        let line = line.trim_start();
        let Some(rest) = line.strip_prefix("##vso[") else {
            continue;
        };
        let Some((command, value)) = rest.split_once(']') else {
            continue;
        };
        let mut parts = command.splitn(2, char::is_whitespace);
        if !parts
            .next()
            .is_some_and(|c| c.eq_ignore_ascii_case("task.setvariable"))
        {
            continue;
        }

        let mut update = VariableUpdate::new("", value);
        for prop in parts.next().unwrap_or("").split(';') {
            let Some((key, val)) = prop.trim().split_once('=') else {
                continue;
            };
            let flag = val.trim().eq_ignore_ascii_case("true");
            match key.trim().to_ascii_lowercase().as_str() {
                "variable" => update.name = val.trim().to_string(),
                "isoutput" => update.is_output = flag,
                "isreadonly" => update.is_readonly = flag,
                _ => {}
            }
        }

        if !update.name.is_empty() {
            updates.push(update);
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Step;

    fn invocation(step: Step) -> StepInvocation {
        StepInvocation {
            stage: "Build".to_string(),
            job: "Compile".to_string(),
            step_index: 0,
            step,
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            working_dir: std::env::temp_dir(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_success_and_env() {
        let outcome = ShellExecutor::new()
            .execute(&invocation(Step::script("echo $GREETING")))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_failure_reports_stderr() {
        let outcome = ShellExecutor::new()
            .execute(&invocation(Step::script("echo broken >&2; exit 3")))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.error.as_deref(), Some("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_emits_variables() {
        let outcome = ShellExecutor::new()
            .execute(&invocation(Step::script(
                "echo '##vso[task.setvariable variable=version;isOutput=true]1.2.3'",
            )))
            .await;
        assert_eq!(
            outcome.variables,
            vec![VariableUpdate::new("version", "1.2.3").output()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registered_task_gets_inputs() {
        let step: Step =
            serde_yaml::from_str("task: Pylint@1\ninputs: { target: src }").unwrap();
        let executor = ShellExecutor::new().with_task("Pylint", "echo lint $INPUT_TARGET");
        let outcome = executor.execute(&invocation(step)).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "lint src");
    }

    #[tokio::test]
    async fn test_unregistered_task_fails() {
        let step: Step = serde_yaml::from_str("task: Unknown@2").unwrap();
        let outcome = ShellExecutor::new().execute(&invocation(step)).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Unknown@2"));
    }

    #[test]
    fn test_parse_logging_commands() {
        let output = r#"
Starting build
##vso[task.setvariable variable=version]1.0.0
##vso[task.setVariable variable=sha;isoutput=true;isReadOnly=true]abc123
##vso[task.prependpath]/opt/bin
##vso[task.setvariable isOutput=true]nameless
done
"#;
        let updates = parse_logging_commands(output);
        assert_eq!(
            updates,
            vec![
                VariableUpdate::new("version", "1.0.0"),
                VariableUpdate::new("sha", "abc123").output().readonly(),
            ]
        );
    }
}
