// Run command
// Resolve, execute and report a pipeline, streaming progress to stderr

use super::{exit, exit_code, parse_assignments, PipelineArgs};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use color_eyre::Result;
use tracing::info;

use pipeline_engine::execution::StepCounts;
use pipeline_engine::{
    progress_channel, render_json, render_text, ExecutionContext, ExecutionEvent, ExecutorConfig,
    MemoryArtifactStore, PipelineExecutor, ScriptedExecutor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Live progress on stderr, status tree on stdout
    Text,
    /// Result tree as JSON on stdout, no live progress
    Json,
}

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Set a pipeline variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Working directory for steps (default: current directory)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Jobs allowed to run at the same time
    #[arg(long, env = "PIPELINE_MAX_AGENTS", default_value_t = 4)]
    pub max_agents: usize,

    /// Where published artifacts are stored (default: <working dir>/.artifacts)
    #[arg(long, env = "PIPELINE_ARTIFACT_DIR", value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Timeout for steps that set no `timeoutInMinutes`
    #[arg(long, value_name = "MINUTES")]
    pub step_timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,

    /// Walk the pipeline without spawning processes; every step succeeds
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: RunArgs) -> Result<i32> {
    let variables = parse_assignments(&args.variables, "variable")?;
    let Some(plan) = args.pipeline.load()? else {
        return Ok(exit::RESOLUTION);
    };

    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let pipeline_name = args.pipeline.pipeline_name(&plan);

    let mut config = ExecutorConfig::default()
        .with_max_agents(args.max_agents)
        .with_working_dir(&working_dir);
    if let Some(dir) = &args.artifact_dir {
        config = config.with_artifact_dir(dir);
    }
    if let Some(minutes) = args.step_timeout {
        config = config.with_default_step_timeout(step_timeout(minutes));
    }

    let mut executor = PipelineExecutor::new(config);
    if args.dry_run {
        output::info("Dry run: steps are not executed");
        executor = executor
            .with_step_executor(Arc::new(ScriptedExecutor::new()))
            .with_artifact_store(Arc::new(MemoryArtifactStore::new()));
    }

    let mut progress = None;
    if args.format == Format::Text {
        let (tx, rx) = progress_channel();
        executor = executor.with_progress(tx);
        progress = Some(rx);
        output::info(&format!(
            "Pipeline '{}': {} stages, {} jobs, {} steps",
            pipeline_name,
            plan.graph.stages.len(),
            plan.graph.job_count(),
            plan.graph.step_count()
        ));
    }

    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, canceling remaining work");
            token.cancel();
        }
    });

    let context = ExecutionContext::new(pipeline_name, working_dir)
        .with_env(std::env::vars().collect())
        .with_variables(variables)
        .with_parameters(plan.parameters.clone());
    let graph = plan.graph;
    let handle = tokio::spawn(async move { executor.execute(&graph, &context).await });

    if let Some(mut rx) = progress {
        while let Some(event) = rx.recv().await {
            render_event(&event);
        }
    }

    let result = handle.await?;
    info!(status = %result.status, "run finished");

    match args.format {
        Format::Text => {
            let counts = StepCounts::of(&result);
            print!("{}", render_text(&result));
            println!(
                "{} succeeded, {} with issues, {} failed, {} skipped, {} canceled",
                counts.succeeded, counts.with_issues, counts.failed, counts.skipped, counts.canceled
            );
        }
        Format::Json => println!("{}", render_json(&result)?),
    }

    Ok(exit_code(result.status))
}

fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_stages,
        } => {
            eprintln!();
            output::header(&format!(
                "Pipeline '{}' ({} stages)",
                pipeline_name, total_stages
            ));
        }

        ExecutionEvent::PipelineCompleted {
            pipeline_name,
            status,
            duration,
        } => {
            eprintln!();
            output::outcome(pipeline_name, *status, duration.as_secs_f64());
        }

        ExecutionEvent::StageStarted {
            stage_name,
            display_name,
            total_jobs,
        } => {
            output::stage_header(display_name.as_deref().unwrap_or(stage_name), *total_jobs);
        }

        ExecutionEvent::StageCompleted {
            stage_name,
            status,
            duration,
        } => {
            let label = format!("Stage '{}'", stage_name);
            output::completed(2, &label, *status, duration.as_secs_f64(), "");
        }

        ExecutionEvent::StageSkipped { stage_name, reason } => {
            output::warning(&format!("Stage '{}' skipped: {}", stage_name, reason));
        }

        ExecutionEvent::JobStarted {
            job_name,
            display_name,
            total_steps,
            ..
        } => {
            let label = display_name.as_deref().unwrap_or(job_name);
            eprintln!("    Job '{}' ({} steps)", label, total_steps);
        }

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            duration,
            ..
        } => {
            let label = format!("Job '{}'", job_name);
            output::completed(4, &label, *status, duration.as_secs_f64(), "");
        }

        ExecutionEvent::JobSkipped {
            job_name, reason, ..
        } => {
            output::warning(&format!("  Job '{}' skipped: {}", job_name, reason));
        }

        ExecutionEvent::StepStarted {
            step_index,
            display_name,
            ..
        } => {
            eprintln!("      [Step {}] {}", step_index + 1, display_name);
        }

        ExecutionEvent::StepOutput {
            output, is_error, ..
        } => {
            for line in output.lines() {
                output::step_output(line, *is_error);
            }
        }

        ExecutionEvent::StepCompleted {
            step_index,
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            output::completed(
                6,
                &format!("Step {}", step_index + 1),
                *status,
                duration.as_secs_f64(),
                &exit_info,
            );
        }

        ExecutionEvent::StepSkipped {
            step_index, reason, ..
        } => {
            output::dim(&format!("      [Step {}] skipped: {}", step_index + 1, reason));
        }

        ExecutionEvent::VariableSet {
            name,
            value,
            is_output,
            ..
        } => {
            let kind = if *is_output { "output" } else { "var" };
            output::dim(&format!("        [{}] {} = {}", kind, name, value));
        }

        ExecutionEvent::ArtifactPublished { artifact, .. } => {
            output::dim(&format!("        [artifact] {}", artifact));
        }
    }
}

/// `--step-timeout` is in minutes; absurd values clamp instead of overflowing
fn step_timeout(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_timeout_minutes() {
        assert_eq!(step_timeout(0), Duration::ZERO);
        assert_eq!(step_timeout(15), Duration::from_secs(900));
        assert_eq!(step_timeout(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
