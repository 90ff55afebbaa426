// Pipeline Executor
// Walks the stage graph, runs jobs on a bounded agent pool and propagates status

use crate::artifacts::{ArtifactLedger, ArtifactStore, LocalArtifactStore};
use crate::execution::environment::VariableEnvironment;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{ExecutionGraph, JobNode, StageNode};
use crate::expression::{EvalError, ExpressionContext, ExpressionEngine};
use crate::parser::models::{
    BoolOrExpression, DownloadStep, ExecutionContext, JobResult, PipelineResult, PublishStep,
    StageResult, Status, Step, StepAction, StepResult,
};
use crate::runners::{ShellExecutor, StepExecutor, StepInvocation, StepOutcome};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Condition applied to stages, jobs and steps that declare none
pub const DEFAULT_CONDITION: &str = "succeeded()";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Jobs that may hold an agent at the same time
    pub max_agents: usize,
    /// Parent of the default artifact directory
    pub working_dir: PathBuf,
    /// Applied to steps without `timeoutInMinutes`
    pub default_step_timeout: Option<Duration>,
    /// Where the default artifact store keeps published artifacts
    pub artifact_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_agents: 4,
            working_dir: PathBuf::from("."),
            default_step_timeout: None,
            artifact_dir: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents.max(1);
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    pub fn with_artifact_dir(mut self, artifact_dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(artifact_dir.into());
        self
    }

    fn artifact_root(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.join(".artifacts"))
    }
}

pub struct PipelineExecutor {
    config: ExecutorConfig,
    steps: Arc<dyn StepExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    progress: Option<ProgressSender>,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    /// Shell steps and a local artifact store under `artifact_dir`
    pub fn new(config: ExecutorConfig) -> Self {
        let artifacts = Arc::new(LocalArtifactStore::new(config.artifact_root()));
        Self {
            config,
            steps: Arc::new(ShellExecutor::new()),
            artifacts,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_step_executor(mut self, steps: Arc<dyn StepExecutor>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Cancelling this token turns every node that has not started into Canceled.
    /// Steps already running finish first.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(&self, graph: &ExecutionGraph, context: &ExecutionContext) -> PipelineResult {
        let start = Instant::now();
        let base = ExpressionContext::default().with_parameters(&context.parameters);

        let run = Arc::new(Run {
            steps: Arc::clone(&self.steps),
            artifacts: Arc::clone(&self.artifacts),
            ledger: ArtifactLedger::new(),
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
            agents: Arc::new(Semaphore::new(self.config.max_agents.max(1))),
            working_dir: context.working_dir.clone(),
            default_step_timeout: self.config.default_step_timeout,
            base,
            process_env: context.env.clone(),
        });

        info!(
            pipeline = %context.pipeline_name,
            stages = graph.stages.len(),
            jobs = graph.job_count(),
            "pipeline started"
        );
        run.progress.send_event(ExecutionEvent::pipeline_started(
            &context.pipeline_name,
            graph.stages.len(),
        ));

        let mut env = VariableEnvironment::from_map(context.variables.clone());
        let stages = match env.declare(&graph.variables, &run.base) {
            Ok(()) => run.schedule_stages(graph, env).await,
            Err(e) => {
                warn!(error = %e, "pipeline variables could not be evaluated");
                graph
                    .stages
                    .iter()
                    .map(|node| not_run_stage(node, Status::Failed, Status::Skipped, Some(e.to_string())))
                    .collect()
            }
        };

        let status = Status::aggregate_all(stages.iter().map(|s| s.status));
        let duration = start.elapsed();
        info!(pipeline = %context.pipeline_name, %status, ?duration, "pipeline completed");
        run.progress.send_event(ExecutionEvent::pipeline_completed(
            &context.pipeline_name,
            status,
            duration,
        ));

        PipelineResult {
            pipeline_name: context.pipeline_name.clone(),
            status,
            stages,
            duration,
        }
    }
}

/// A finished node as seen by its dependents
#[derive(Debug, Clone)]
struct Dependency {
    name: String,
    status: Status,
    outputs: HashMap<String, String>,
}

/// Where a job runs, carried down to its steps
#[derive(Debug, Clone)]
struct Location {
    stage: String,
    job: String,
    ancestors: Arc<HashSet<String>>,
    /// Set once any job of the stage has finished Failed
    stage_failed: Arc<AtomicBool>,
}

/// State shared by every task of one run
struct Run {
    steps: Arc<dyn StepExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    ledger: ArtifactLedger,
    progress: Option<ProgressSender>,
    cancel: CancellationToken,
    agents: Arc<Semaphore>,
    working_dir: PathBuf,
    default_step_timeout: Option<Duration>,
    base: ExpressionContext,
    process_env: HashMap<String, String>,
}

impl Run {
    fn context_for(&self, dependencies: &[Dependency]) -> ExpressionContext {
        let mut context = self.base.clone();
        for dep in dependencies {
            context.add_dependency(&dep.name, dep.status, dep.outputs.clone());
        }
        context.status.canceled = self.cancel.is_cancelled();
        context
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Start each stage once all of its dependencies are terminal
    async fn schedule_stages(
        self: &Arc<Self>,
        graph: &ExecutionGraph,
        env: VariableEnvironment,
    ) -> Vec<StageResult> {
        let mut finished: HashMap<String, StageResult> = HashMap::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut waiting: Vec<&StageNode> = graph.stages.iter().collect();
        let mut running = JoinSet::new();

        loop {
            let (ready, blocked): (Vec<&StageNode>, Vec<&StageNode>) = waiting
                .into_iter()
                .partition(|node| node.dependencies.iter().all(|d| finished.contains_key(d)));
            waiting = blocked;

            for node in ready {
                let dependencies = node
                    .dependencies
                    .iter()
                    .filter_map(|d| finished.get(d))
                    .map(|r| Dependency {
                        name: r.stage_name.clone(),
                        status: r.status,
                        outputs: r.outputs(),
                    })
                    .collect();
                let ancestors = Arc::new(graph.ancestors(&node.name));
                started.insert(node.name.clone());

                let run = Arc::clone(self);
                let node = node.clone();
                let env = env.clone();
                running.spawn(async move { run.run_stage(node, dependencies, env, ancestors).await });
            }

            match running.join_next().await {
                Some(Ok(result)) => {
                    finished.insert(result.stage_name.clone(), result);
                }
                Some(Err(e)) => warn!(error = %e, "stage task did not complete"),
                None => break,
            }
        }

        graph
            .stages
            .iter()
            .map(|node| match finished.remove(&node.name) {
                Some(result) => result,
                None if started.contains(&node.name) => not_run_stage(
                    node,
                    Status::Failed,
                    Status::Skipped,
                    Some("stage task did not complete".to_string()),
                ),
                None => not_run_stage(node, Status::Skipped, Status::Skipped, None),
            })
            .collect()
    }

    async fn run_stage(
        self: Arc<Self>,
        node: StageNode,
        dependencies: Vec<Dependency>,
        pipeline_env: VariableEnvironment,
        ancestors: Arc<HashSet<String>>,
    ) -> StageResult {
        let start = Instant::now();
        let stage = &node.stage;

        if self.cancel.is_cancelled() {
            return not_run_stage(&node, Status::Canceled, Status::Canceled, None);
        }

        let mut context = self.context_for(&dependencies);
        context.variables = pipeline_env.values();
        let condition = stage.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
        match ExpressionEngine::new(context.clone()).evaluate_condition(condition) {
            Ok(true) => debug!(stage = %node.name, condition, "stage condition met"),
            Ok(false) => {
                info!(stage = %node.name, condition, "stage skipped");
                self.progress.send_event(ExecutionEvent::stage_skipped(
                    &node.name,
                    format!("condition '{}' was false", condition),
                ));
                return not_run_stage(&node, Status::Skipped, Status::Skipped, None);
            }
            Err(e) => {
                warn!(stage = %node.name, error = %e, "stage condition failed");
                return not_run_stage(&node, Status::Failed, Status::Skipped, Some(e.to_string()));
            }
        }

        let mut env = pipeline_env.child();
        if let Err(e) = env.declare(&stage.variables, &context) {
            return not_run_stage(&node, Status::Failed, Status::Skipped, Some(e.to_string()));
        }

        info!(stage = %node.name, jobs = node.jobs.len(), "stage started");
        self.progress.send_event(ExecutionEvent::stage_started(
            &node.name,
            stage.display_name.clone(),
            node.jobs.len(),
        ));

        let jobs = self.schedule_jobs(&node, env, ancestors).await;
        let status = Status::aggregate_all(jobs.iter().map(|j| j.status));
        let duration = start.elapsed();

        info!(stage = %node.name, %status, "stage completed");
        self.progress.send_event(ExecutionEvent::stage_completed(&node.name, status, duration));

        StageResult {
            stage_name: node.name.clone(),
            display_name: stage.display_name.clone(),
            status,
            error: None,
            jobs,
            duration,
        }
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    async fn schedule_jobs(
        self: &Arc<Self>,
        stage: &StageNode,
        env: VariableEnvironment,
        ancestors: Arc<HashSet<String>>,
    ) -> Vec<JobResult> {
        let mut finished: HashMap<String, JobResult> = HashMap::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut waiting: Vec<&JobNode> = stage.jobs.iter().collect();
        let mut running = JoinSet::new();
        let stage_failed = Arc::new(AtomicBool::new(false));

        loop {
            let (ready, blocked): (Vec<&JobNode>, Vec<&JobNode>) = waiting
                .into_iter()
                .partition(|node| node.dependencies.iter().all(|d| finished.contains_key(d)));
            waiting = blocked;

            for node in ready {
                let dependencies = node
                    .dependencies
                    .iter()
                    .filter_map(|d| finished.get(d))
                    .map(|r| Dependency {
                        name: r.job_name.clone(),
                        status: r.status,
                        outputs: r.outputs.clone(),
                    })
                    .collect();
                started.insert(node.name.clone());

                let location = Location {
                    stage: stage.name.clone(),
                    job: node.name.clone(),
                    ancestors: Arc::clone(&ancestors),
                    stage_failed: Arc::clone(&stage_failed),
                };
                let run = Arc::clone(self);
                let node = node.clone();
                let env = env.clone();
                running.spawn(async move { run.run_job(location, node, dependencies, env).await });
            }

            match running.join_next().await {
                Some(Ok(result)) => {
                    if result.status == Status::Failed {
                        stage_failed.store(true, Ordering::SeqCst);
                    }
                    finished.insert(result.job_name.clone(), result);
                }
                Some(Err(e)) => {
                    stage_failed.store(true, Ordering::SeqCst);
                    warn!(stage = %stage.name, error = %e, "job task did not complete");
                }
                None => break,
            }
        }

        stage
            .jobs
            .iter()
            .map(|node| match finished.remove(&node.name) {
                Some(result) => result,
                None if started.contains(&node.name) => not_run_job(
                    node,
                    Status::Failed,
                    Status::Skipped,
                    Some("job task did not complete".to_string()),
                ),
                None => not_run_job(node, Status::Skipped, Status::Skipped, None),
            })
            .collect()
    }

    async fn run_job(
        self: Arc<Self>,
        location: Location,
        node: JobNode,
        dependencies: Vec<Dependency>,
        stage_env: VariableEnvironment,
    ) -> JobResult {
        let start = Instant::now();
        let job = &node.job;

        if self.cancel.is_cancelled() {
            return not_run_job(&node, Status::Canceled, Status::Canceled, None);
        }

        let mut context = self.context_for(&dependencies);
        context.variables = stage_env.values();
        let condition = job.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
        match ExpressionEngine::new(context.clone()).evaluate_condition(condition) {
            Ok(true) => debug!(job = %node.name, condition, "job condition met"),
            Ok(false) => {
                info!(stage = %location.stage, job = %node.name, condition, "job skipped");
                self.progress.send_event(ExecutionEvent::job_skipped(
                    &location.stage,
                    &node.name,
                    format!("condition '{}' was false", condition),
                ));
                return not_run_job(&node, Status::Skipped, Status::Skipped, None);
            }
            Err(e) => {
                warn!(job = %node.name, error = %e, "job condition failed");
                return not_run_job(&node, Status::Failed, Status::Skipped, Some(e.to_string()));
            }
        }

        // Queue for an agent; the permit is held until the job finishes
        let _agent = tokio::select! {
            permit = Arc::clone(&self.agents).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return not_run_job(&node, Status::Canceled, Status::Canceled, None),
            },
            _ = self.cancel.cancelled() => {
                return not_run_job(&node, Status::Canceled, Status::Canceled, None);
            }
        };

        let mut env = stage_env.child();
        if let Err(e) = env.declare(&job.variables, &context) {
            return not_run_job(&node, Status::Failed, Status::Skipped, Some(e.to_string()));
        }
        context.variables = env.values();
        let continue_on_error = resolve_flag(&job.continue_on_error, &context).unwrap_or_else(|e| {
            warn!(job = %node.name, error = %e, "continueOnError could not be evaluated");
            false
        });

        info!(stage = %location.stage, job = %node.name, steps = job.steps.len(), "job started");
        self.progress.send_event(ExecutionEvent::job_started(
            &location.stage,
            &node.name,
            job.display_name.clone(),
            job.steps.len(),
        ));

        let (steps, outputs) = self.run_steps(&location, &node, &mut env, context).await;

        let mut status = Status::aggregate_all(steps.iter().map(|s| s.status));
        if status == Status::Failed && continue_on_error {
            status = Status::SucceededWithIssues;
        }
        let duration = start.elapsed();

        info!(stage = %location.stage, job = %node.name, %status, "job completed");
        self.progress.send_event(ExecutionEvent::job_completed(
            &location.stage,
            &node.name,
            status,
            duration,
        ));

        JobResult {
            job_name: node.name.clone(),
            display_name: job.display_name.clone(),
            status,
            error: None,
            steps,
            duration,
            outputs,
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Run a job's steps in order. Each step's implicit status is the job's status so far.
    async fn run_steps(
        &self,
        location: &Location,
        node: &JobNode,
        env: &mut VariableEnvironment,
        mut context: ExpressionContext,
    ) -> (Vec<StepResult>, HashMap<String, String>) {
        let mut results = Vec::with_capacity(node.job.steps.len());
        let mut outputs = HashMap::new();
        let mut so_far = Status::Succeeded;

        for (index, step) in node.job.steps.iter().enumerate() {
            let result = if self.cancel.is_cancelled() {
                StepResult::new(step, Status::Canceled)
            } else {
                context.variables = env.values();
                context.status.implicit = vec![so_far];
                self.run_step(location, index, step, env, &context).await
            };

            if let Some(name) = &step.name {
                context.status.named.insert(name.clone(), result.status);
            }
            let reference = step_reference(step, index);
            for (name, value) in &result.outputs {
                outputs.insert(format!("{}.{}", reference, name), value.clone());
            }

            so_far = so_far.aggregate(result.status);
            results.push(result);
        }

        (results, outputs)
    }

    async fn run_step(
        &self,
        location: &Location,
        index: usize,
        step: &Step,
        env: &mut VariableEnvironment,
        context: &ExpressionContext,
    ) -> StepResult {
        let start = Instant::now();
        let engine = ExpressionEngine::new(context.clone());

        if !step.enabled {
            return self.skip_step(location, index, step, "step is disabled".to_string());
        }

        let continue_on_error = resolve_flag(&step.continue_on_error, context).unwrap_or_else(|e| {
            warn!(step = %step.label(), error = %e, "continueOnError could not be evaluated");
            false
        });
        let failed = if continue_on_error {
            Status::SucceededWithIssues
        } else {
            Status::Failed
        };

        // A publish without its own condition never runs once the stage has a failed job
        if step.condition.is_none()
            && matches!(step.action, StepAction::Publish(_))
            && location.stage_failed.load(Ordering::SeqCst)
        {
            return self.skip_step(
                location,
                index,
                step,
                "stage already has a failed job".to_string(),
            );
        }

        let condition = step.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
        match engine.evaluate_condition(condition) {
            Ok(true) => {}
            Ok(false) => {
                return self.skip_step(
                    location,
                    index,
                    step,
                    format!("condition '{}' was false", condition),
                );
            }
            Err(e) => {
                warn!(step = %step.label(), error = %e, "step condition failed");
                return StepResult::new(step, failed).with_error(e.to_string());
            }
        }

        let step = substitute_macros(step, &engine);
        debug!(job = %location.job, step = %step.label(), "step started");
        self.progress.send_event(ExecutionEvent::StepStarted {
            stage_name: location.stage.clone(),
            job_name: location.job.clone(),
            step_index: index,
            display_name: step.label(),
        });

        let outcome = match &step.action {
            StepAction::Publish(publish) => self.publish(location, publish).await,
            StepAction::Download(download) => self.download(location, download).await,
            StepAction::Template(t) => {
                StepOutcome::failed(format!("unresolved template reference '{}'", t.template))
            }
            _ => self.invoke(location, index, &step, env).await,
        };

        for line in outcome.output.lines() {
            self.progress.send_event(ExecutionEvent::StepOutput {
                stage_name: location.stage.clone(),
                job_name: location.job.clone(),
                step_index: index,
                output: line.to_string(),
                is_error: false,
            });
        }

        let mut result = StepResult::new(&step, Status::Succeeded);
        for update in &outcome.variables {
            let written = if update.is_readonly {
                env.set_readonly(update.name.clone(), update.value.clone())
            } else {
                env.set(update.name.clone(), update.value.clone())
            };
            if let Err(e) = written {
                warn!(step = %step.label(), error = %e, "ignoring variable update");
                continue;
            }
            debug!(variable = %update.name, is_output = update.is_output, "variable set");
            if update.is_output {
                result.outputs.insert(update.name.clone(), update.value.clone());
            }
            self.progress.send_event(ExecutionEvent::VariableSet {
                stage_name: location.stage.clone(),
                job_name: location.job.clone(),
                name: update.name.clone(),
                value: update.value.clone(),
                is_output: update.is_output,
            });
        }

        result.status = if outcome.success { Status::Succeeded } else { failed };
        result.output = outcome.output;
        result.error = outcome.error;
        result.exit_code = outcome.exit_code;
        result.duration = start.elapsed();

        debug!(job = %location.job, step = %result.display_name, status = %result.status, "step completed");
        self.progress.send_event(ExecutionEvent::StepCompleted {
            stage_name: location.stage.clone(),
            job_name: location.job.clone(),
            step_index: index,
            status: result.status,
            duration: result.duration,
            exit_code: result.exit_code,
        });
        result
    }

    fn skip_step(&self, location: &Location, index: usize, step: &Step, reason: String) -> StepResult {
        debug!(job = %location.job, step = %step.label(), %reason, "step skipped");
        self.progress.send_event(ExecutionEvent::StepSkipped {
            stage_name: location.stage.clone(),
            job_name: location.job.clone(),
            step_index: index,
            reason,
        });
        StepResult::new(step, Status::Skipped)
    }

    /// Hand the step to the external executor, honouring timeout and retries
    async fn invoke(
        &self,
        location: &Location,
        index: usize,
        step: &Step,
        env: &VariableEnvironment,
    ) -> StepOutcome {
        let mut process_env = self.process_env.clone();
        process_env.extend(env.to_env());
        process_env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let invocation = StepInvocation {
            stage: location.stage.clone(),
            job: location.job.clone(),
            step_index: index,
            step: step.clone(),
            env: process_env,
            working_dir: self.working_dir.clone(),
        };

        let timeout = step
            .timeout_in_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
            .or(self.default_step_timeout);
        let attempts = step.retry_count_on_task_failure.unwrap_or(0) + 1;

        let mut outcome = StepOutcome::default();
        for attempt in 1..=attempts {
            outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, self.steps.execute(&invocation))
                    .await
                    .unwrap_or_else(|_| StepOutcome::failed(format!("timed out after {:?}", limit))),
                None => self.steps.execute(&invocation).await,
            };
            if outcome.success || self.cancel.is_cancelled() {
                break;
            }
            if attempt < attempts {
                warn!(step = %step.label(), attempt, attempts, "step failed, retrying");
            }
        }
        outcome
    }

    async fn publish(&self, location: &Location, publish: &PublishStep) -> StepOutcome {
        let name = publish.artifact_name();
        if let Err(e) = self.ledger.reserve(&name, &location.stage) {
            return StepOutcome::failed(e.to_string());
        }

        let source = self.working_dir.join(&publish.publish);
        match self.artifacts.publish(&name, &source).await {
            Ok(()) => {
                info!(artifact = %name, stage = %location.stage, "artifact published");
                self.progress.send_event(ExecutionEvent::ArtifactPublished {
                    stage_name: location.stage.clone(),
                    job_name: location.job.clone(),
                    artifact: name.clone(),
                });
                StepOutcome::succeeded(format!("published artifact '{}'", name))
            }
            Err(e) => {
                self.ledger.release(&name);
                StepOutcome::failed(e.to_string())
            }
        }
    }

    async fn download(&self, location: &Location, download: &DownloadStep) -> StepOutcome {
        if download.download == "none" {
            return StepOutcome::succeeded("");
        }

        let name = download.artifact_name();
        if let Err(e) = self
            .ledger
            .check_download(&name, &location.stage, &location.ancestors)
        {
            return StepOutcome::failed(e.to_string());
        }

        let target = match &download.path {
            Some(path) => self.working_dir.join(path),
            None => self.working_dir.join(&name),
        };
        match self.artifacts.download(&name, &target).await {
            Ok(()) => {
                info!(artifact = %name, stage = %location.stage, "artifact downloaded");
                StepOutcome::succeeded(format!("downloaded artifact '{}'", name))
            }
            Err(e) => StepOutcome::failed(e.to_string()),
        }
    }
}

fn resolve_flag(flag: &BoolOrExpression, context: &ExpressionContext) -> Result<bool, EvalError> {
    match flag {
        BoolOrExpression::Bool(value) => Ok(*value),
        BoolOrExpression::Expression(expr) => {
            ExpressionEngine::new(context.clone()).evaluate_condition(expr)
        }
    }
}

/// Name under which a step's output variables are published
fn step_reference(step: &Step, index: usize) -> String {
    step.name
        .clone()
        .unwrap_or_else(|| format!("step{}", index + 1))
}

/// Replace `$(var)` in everything a step hands to the outside world
fn substitute_macros(step: &Step, engine: &ExpressionEngine) -> Step {
    let sub = |text: &mut String| {
        let replaced = engine.substitute_macros(text);
        *text = replaced;
    };
    let mut step = step.clone();

    match &mut step.action {
        StepAction::Script(s) => {
            sub(&mut s.script);
            s.working_directory.iter_mut().for_each(sub);
        }
        StepAction::Bash(s) => {
            sub(&mut s.bash);
            s.working_directory.iter_mut().for_each(sub);
        }
        StepAction::Pwsh(s) => {
            sub(&mut s.pwsh);
            s.working_directory.iter_mut().for_each(sub);
        }
        StepAction::Task(t) => t.inputs.values_mut().for_each(sub),
        StepAction::Publish(p) => {
            sub(&mut p.publish);
            p.artifact.iter_mut().for_each(sub);
        }
        StepAction::Download(d) => {
            d.artifact.iter_mut().for_each(sub);
            d.path.iter_mut().for_each(sub);
        }
        StepAction::Template(_) => {}
    }
    step.env.values_mut().for_each(sub);
    step
}

fn not_run_job(node: &JobNode, status: Status, steps: Status, error: Option<String>) -> JobResult {
    JobResult {
        job_name: node.name.clone(),
        display_name: node.job.display_name.clone(),
        status,
        error,
        steps: node
            .job
            .steps
            .iter()
            .map(|step| StepResult::new(step, steps))
            .collect(),
        duration: Duration::ZERO,
        outputs: HashMap::new(),
    }
}

/// A stage that never started, with every job and step materialized
fn not_run_stage(node: &StageNode, status: Status, children: Status, error: Option<String>) -> StageResult {
    StageResult {
        stage_name: node.name.clone(),
        display_name: node.stage.display_name.clone(),
        status,
        error,
        jobs: node
            .jobs
            .iter()
            .map(|job| not_run_job(job, children, children, None))
            .collect(),
        duration: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::execution::events::progress_channel;
    use crate::parser::PipelineParser;
    use crate::runners::{ScriptedExecutor, VariableUpdate};

    async fn run_with(yaml: &str, steps: Arc<ScriptedExecutor>) -> PipelineResult {
        let pipeline = PipelineParser::parse(yaml).unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        PipelineExecutor::new(ExecutorConfig::default())
            .with_step_executor(steps)
            .with_artifact_store(Arc::new(MemoryArtifactStore::new()))
            .execute(&graph, &ExecutionContext::new("test", "."))
            .await
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let steps = Arc::new(ScriptedExecutor::new());
        let result = run_with(
            "steps:\n  - script: a\n    name: A\n  - script: b\n    name: B\n  - script: c\n    name: C\n",
            Arc::clone(&steps),
        )
        .await;

        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(steps.invocations(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_failure_skips_rest_except_always() {
        let steps = Arc::new(ScriptedExecutor::failing(["Build"]));
        let result = run_with(
            r#"
steps:
  - { script: build, name: Build }
  - { script: test, name: Test }
  - { script: report, name: Report, condition: succeededOrFailed() }
  - { script: clean, name: Clean, condition: always() }
"#,
            Arc::clone(&steps),
        )
        .await;

        let job = result.job("__default").unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.step("Test").unwrap().status, Status::Skipped);
        assert_eq!(job.step("Report").unwrap().status, Status::Succeeded);
        assert_eq!(job.step("Clean").unwrap().status, Status::Succeeded);
        assert!(!steps.was_invoked("Test"));
    }

    #[tokio::test]
    async fn test_continue_on_error_masks_failure() {
        let steps = Arc::new(ScriptedExecutor::failing(["Lint"]));
        let result = run_with(
            "steps:\n  - { script: lint, name: Lint, continueOnError: true }\n  - { script: test, name: Test }\n",
            Arc::clone(&steps),
        )
        .await;

        let job = result.job("__default").unwrap();
        assert_eq!(job.step("Lint").unwrap().status, Status::SucceededWithIssues);
        assert_eq!(job.step("Test").unwrap().status, Status::Succeeded);
        assert_eq!(job.status, Status::SucceededWithIssues);
        assert_eq!(result.status, Status::SucceededWithIssues);
    }

    #[tokio::test]
    async fn test_continue_on_error_runtime_expression() {
        let steps = Arc::new(ScriptedExecutor::failing(["Lint"]));
        let result = run_with(
            r#"
variables: { strict: 'false' }
steps:
  - script: lint
    name: Lint
    continueOnError: $[eq(variables.strict, 'false')]
"#,
            steps,
        )
        .await;
        assert_eq!(result.status, Status::SucceededWithIssues);
    }

    #[tokio::test]
    async fn test_job_continue_on_error() {
        let steps = Arc::new(ScriptedExecutor::failing(["Flaky"]));
        let result = run_with(
            r#"
jobs:
  - job: Optional
    continueOnError: true
    steps: [{ script: x, name: Flaky }]
  - job: Required
    steps: [{ script: y, name: Solid }]
"#,
            steps,
        )
        .await;
        assert_eq!(result.job("Optional").unwrap().status, Status::SucceededWithIssues);
        assert_eq!(result.stages[0].status, Status::SucceededWithIssues);
    }

    #[tokio::test]
    async fn test_dependent_stage_skipped_after_failure() {
        let steps = Arc::new(ScriptedExecutor::failing(["Compile"]));
        let result = run_with(
            r#"
stages:
  - stage: Build
    jobs: [{ job: J, steps: [{ script: make, name: Compile }] }]
  - stage: Deploy
    jobs: [{ job: J, steps: [{ script: ship, name: Ship }] }]
  - stage: Cleanup
    dependsOn: [Build, Deploy]
    condition: always()
    jobs: [{ job: J, steps: [{ script: rm, name: Remove }] }]
"#,
            Arc::clone(&steps),
        )
        .await;

        assert_eq!(result.stage("Build").unwrap().status, Status::Failed);
        let deploy = result.stage("Deploy").unwrap();
        assert_eq!(deploy.status, Status::Skipped);
        assert_eq!(deploy.jobs[0].steps[0].status, Status::Skipped);
        assert_eq!(result.stage("Cleanup").unwrap().status, Status::Succeeded);
        assert!(!steps.was_invoked("Ship"));
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_skipped_dependency_does_not_satisfy_default_condition() {
        let steps = Arc::new(ScriptedExecutor::new());
        let result = run_with(
            r#"
stages:
  - stage: Docs
    condition: "false"
    jobs: [{ job: J, steps: [{ script: docs, name: Docs }] }]
  - stage: Publish
    jobs: [{ job: J, steps: [{ script: up, name: Upload }] }]
"#,
            steps,
        )
        .await;
        assert_eq!(result.stage("Docs").unwrap().status, Status::Skipped);
        assert_eq!(result.stage("Publish").unwrap().status, Status::Skipped);
        assert_eq!(result.status, Status::Skipped);
    }

    #[tokio::test]
    async fn test_malformed_condition_fails_node() {
        let steps = Arc::new(ScriptedExecutor::new());
        let result = run_with(
            "steps:\n  - { script: a, name: A, condition: 'eq(' }\n  - { script: b, name: B }\n",
            Arc::clone(&steps),
        )
        .await;
        let job = result.job("__default").unwrap();
        assert_eq!(job.step("A").unwrap().status, Status::Failed);
        assert!(job.step("A").unwrap().error.is_some());
        assert_eq!(job.step("B").unwrap().status, Status::Skipped);
        assert!(steps.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_step() {
        let steps = Arc::new(ScriptedExecutor::new());
        let result = run_with(
            "steps:\n  - { script: a, name: A, enabled: false }\n  - { script: b, name: B }\n",
            Arc::clone(&steps),
        )
        .await;
        let job = result.job("__default").unwrap();
        assert_eq!(job.step("A").unwrap().status, Status::Skipped);
        assert_eq!(job.status, Status::Succeeded);
        assert_eq!(steps.invocations(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_variables_flow_between_steps_and_jobs() {
        let steps = Arc::new(
            ScriptedExecutor::new()
                .with_variable("SetVersion", VariableUpdate::new("version", "1.2.3").output())
                .with_variable("SetLocal", VariableUpdate::new("local", "yes")),
        );
        let result = run_with(
            r#"
jobs:
  - job: Produce
    steps:
      - { script: a, name: SetVersion }
      - { script: b, name: SetLocal }
      - script: c
        name: UseLocal
        condition: eq(variables.local, 'yes')
  - job: Consume
    dependsOn: Produce
    condition: eq(dependencies.Produce.outputs['SetVersion.version'], '1.2.3')
    steps: [{ script: d, name: Deploy }]
  - job: Unrelated
    condition: eq(variables.local, 'yes')
    steps: [{ script: e, name: Never }]
"#,
            Arc::clone(&steps),
        )
        .await;

        let produce = result.job("Produce").unwrap();
        assert_eq!(produce.step("UseLocal").unwrap().status, Status::Succeeded);
        assert_eq!(produce.outputs["SetVersion.version"], "1.2.3");
        assert_eq!(result.job("Consume").unwrap().status, Status::Succeeded);
        assert_eq!(result.job("Unrelated").unwrap().status, Status::Skipped);
        assert_eq!(result.stages[0].outputs()["Produce.SetVersion.version"], "1.2.3");
    }

    #[tokio::test]
    async fn test_readonly_variable_update_ignored() {
        let steps = Arc::new(
            ScriptedExecutor::new().with_variable("Override", VariableUpdate::new("channel", "beta")),
        );
        let result = run_with(
            r#"
variables:
  - { name: channel, value: stable, readonly: true }
steps:
  - { script: a, name: Override }
  - script: b
    name: Check
    condition: eq(variables.channel, 'stable')
"#,
            steps,
        )
        .await;
        let job = result.job("__default").unwrap();
        assert_eq!(job.step("Override").unwrap().status, Status::Succeeded);
        assert_eq!(job.step("Check").unwrap().status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_retry_and_timeout() {
        let steps = Arc::new(
            ScriptedExecutor::new()
                .with_flaky("Upload", 1)
                .with_delay("Hang", Duration::from_millis(200)),
        );
        let pipeline = PipelineParser::parse(
            "steps:\n  - { script: up, name: Upload, retryCountOnTaskFailure: 1 }\n  - { script: wait, name: Hang }\n",
        )
        .unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        let result = PipelineExecutor::new(
            ExecutorConfig::default().with_default_step_timeout(Duration::from_millis(20)),
        )
        .with_step_executor(steps.clone())
        .execute(&graph, &ExecutionContext::new("test", "."))
        .await;

        let job = result.job("__default").unwrap();
        assert_eq!(job.step("Upload").unwrap().status, Status::Succeeded);
        let hang = job.step("Hang").unwrap();
        assert_eq!(hang.status, Status::Failed);
        assert!(hang.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(steps.invocations(), vec!["Upload", "Upload", "Hang"]);
    }

    #[tokio::test]
    async fn test_independent_stages_run_concurrently() {
        let steps = Arc::new(
            ScriptedExecutor::new()
                .with_delay("Slow", Duration::from_millis(100))
                .with_failure("Broken"),
        );
        let result = run_with(
            r#"
stages:
  - stage: Left
    dependsOn: []
    jobs: [{ job: J, steps: [{ script: x, name: Broken }] }]
  - stage: Right
    dependsOn: []
    jobs: [{ job: J, steps: [{ script: y, name: Slow }] }]
"#,
            Arc::clone(&steps),
        )
        .await;
        assert_eq!(result.stage("Left").unwrap().status, Status::Failed);
        assert_eq!(result.stage("Right").unwrap().status, Status::Succeeded);
        assert!(steps.was_invoked("Slow"));
    }

    #[tokio::test]
    async fn test_cancellation_marks_pending_nodes() {
        let steps = Arc::new(ScriptedExecutor::new().with_delay("Long", Duration::from_millis(100)));
        let pipeline = PipelineParser::parse(
            r#"
stages:
  - stage: First
    jobs: [{ job: J, steps: [{ script: a, name: Long }, { script: b, name: After }] }]
  - stage: Second
    jobs: [{ job: J, steps: [{ script: c, name: Later }] }]
"#,
        )
        .unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        let executor = PipelineExecutor::new(ExecutorConfig::default()).with_step_executor(steps.clone());

        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = executor.execute(&graph, &ExecutionContext::new("test", ".")).await;

        let first = result.stage("First").unwrap();
        assert_eq!(first.jobs[0].steps[0].status, Status::Succeeded);
        assert_eq!(first.jobs[0].steps[1].status, Status::Canceled);
        assert_eq!(first.status, Status::Canceled);
        assert_eq!(result.stage("Second").unwrap().status, Status::Canceled);
        assert_eq!(result.status, Status::Canceled);
        assert_eq!(steps.invocations(), vec!["Long"]);
    }

    #[tokio::test]
    async fn test_cancel_after_failure_keeps_failed() {
        let steps = Arc::new(
            ScriptedExecutor::failing(["Bad"]).with_delay("Long", Duration::from_millis(100)),
        );
        let pipeline = PipelineParser::parse(
            r#"
jobs:
  - { job: A, steps: [{ script: a, name: Bad }] }
  - { job: B, steps: [{ script: b, name: Long }, { script: c, name: After }] }
"#,
        )
        .unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        let executor = PipelineExecutor::new(ExecutorConfig::default()).with_step_executor(steps.clone());

        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });
        let result = executor.execute(&graph, &ExecutionContext::new("test", ".")).await;

        assert_eq!(result.job("A").unwrap().status, Status::Failed);
        assert_eq!(result.job("B").unwrap().status, Status::Canceled);
        assert_eq!(result.stages[0].status, Status::Failed);
        assert_eq!(result.status, Status::Failed);
        assert!(!steps.was_invoked("After"));
    }

    #[tokio::test]
    async fn test_publish_skipped_after_stage_failure() {
        let result = run_with(
            r#"
jobs:
  - { job: A, steps: [{ script: a, name: Bad }] }
  - job: B
    dependsOn: A
    condition: always()
    steps:
      - { script: b, name: Build }
      - { publish: dist, artifact: packages, name: Upload }
      - { publish: logs, artifact: logs, name: Logs, condition: always() }
"#,
            Arc::new(ScriptedExecutor::failing(["Bad"])),
        )
        .await;

        let job = result.job("B").unwrap();
        assert_eq!(job.step("Build").unwrap().status, Status::Succeeded);
        assert_eq!(job.step("Upload").unwrap().status, Status::Skipped);
        assert_eq!(job.step("Logs").unwrap().status, Status::Succeeded);
        assert_eq!(result.status, Status::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_publish_fails_step() {
        let result = run_with(
            r#"
steps:
  - { publish: dist, artifact: packages, name: First }
  - { publish: dist, artifact: packages, name: Second, continueOnError: true }
"#,
            Arc::new(ScriptedExecutor::new()),
        )
        .await;
        let job = result.job("__default").unwrap();
        assert_eq!(job.step("First").unwrap().status, Status::Succeeded);
        let second = job.step("Second").unwrap();
        assert_eq!(second.status, Status::SucceededWithIssues);
        assert!(second.error.as_deref().unwrap().contains("already published"));
    }

    #[tokio::test]
    async fn test_macros_substituted_before_invocation() {
        let steps = Arc::new(ScriptedExecutor::new());
        let result = run_with(
            "variables: { target: prod }\nsteps:\n  - script: deploy $(target) $(unknown)\n",
            Arc::clone(&steps),
        )
        .await;
        assert_eq!(
            result.job("__default").unwrap().steps[0].display_name,
            "Script: deploy prod $(unknown)"
        );
        assert_eq!(steps.invocations(), vec!["Script: deploy prod $(unknown)"]);
    }

    #[tokio::test]
    async fn test_agent_pool_bounds_parallel_jobs() {
        let steps = Arc::new(
            ScriptedExecutor::new()
                .with_delay("A", Duration::from_millis(40))
                .with_delay("B", Duration::from_millis(40)),
        );
        let pipeline = PipelineParser::parse(
            "jobs:\n  - { job: One, steps: [{ script: a, name: A }] }\n  - { job: Two, steps: [{ script: b, name: B }] }\n",
        )
        .unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        let start = Instant::now();
        let result = PipelineExecutor::new(ExecutorConfig::default().with_max_agents(1))
            .with_step_executor(steps)
            .execute(&graph, &ExecutionContext::new("test", "."))
            .await;
        assert_eq!(result.status, Status::Succeeded);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (tx, mut rx) = progress_channel();
        let pipeline = PipelineParser::parse("steps:\n  - { script: a, name: A }\n").unwrap();
        let graph = ExecutionGraph::from_pipeline(&pipeline).unwrap();
        PipelineExecutor::new(ExecutorConfig::default())
            .with_step_executor(Arc::new(ScriptedExecutor::new()))
            .with_progress(tx)
            .execute(&graph, &ExecutionContext::new("ci", "."))
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ExecutionEvent::PipelineStarted { .. })));
        assert!(events.iter().any(|e| matches!(e, ExecutionEvent::StepCompleted { status: Status::Succeeded, .. })));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::PipelineCompleted { status: Status::Succeeded, .. })
        ));
    }
}
