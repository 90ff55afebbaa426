// Pipeline Document Models
// Typed template documents, run statuses, node results and the expression value type

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A boolean literal or a runtime expression string such as
/// `$[eq(variables.strict, 'false')]`, as accepted by `continueOnError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoolOrExpression {
    Bool(bool),
    Expression(String),
}

impl Default for BoolOrExpression {
    fn default() -> Self {
        BoolOrExpression::Bool(false)
    }
}

impl BoolOrExpression {
    pub fn is_false(&self) -> bool {
        matches!(self, BoolOrExpression::Bool(false))
    }
}

/// Root pipeline document, after compile-time directives have been applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    #[serde(
        default,
        deserialize_with = "deserialize_variables",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub variables: Vec<Variable>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    /// Shorthand: jobs without stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Job>,

    /// Shorthand: steps without stages or jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

// =============================================================================
// Variables
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    /// { name: foo, value: bar }
    KeyValue {
        name: String,
        #[serde(deserialize_with = "deserialize_scalar_string")]
        value: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        readonly: bool,
    },
    /// { template: vars.yml, parameters: {...} }
    Template {
        template: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        parameters: BTreeMap<String, serde_yaml::Value>,
    },
}

/// Variables may be written as a plain map or as a list of definitions
fn deserialize_variables<'de, D>(deserializer: D) -> Result<Vec<Variable>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{MapAccess, SeqAccess, Visitor};

    struct VariablesVisitor;

    impl<'de> Visitor<'de> for VariablesVisitor {
        type Value = Vec<Variable>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of variables or a list of variable definitions")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut vars = Vec::new();
            while let Some(var) = seq.next_element::<Variable>()? {
                vars.push(var);
            }
            Ok(vars)
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut vars = Vec::new();
            while let Some((name, value)) = map.next_entry::<String, serde_yaml::Value>()? {
                let value = scalar_to_string(&value).ok_or_else(|| {
                    serde::de::Error::custom(format!("variable '{}' must be a scalar", name))
                })?;
                vars.push(Variable::KeyValue {
                    name,
                    value,
                    readonly: false,
                });
            }
            Ok(vars)
        }
    }

    deserializer.deserialize_any(VariablesVisitor)
}

fn deserialize_scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    scalar_to_string(&value).ok_or_else(|| serde::de::Error::custom("expected a scalar value"))
}

/// Render a YAML scalar as the string a variable would hold
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    List,
    Step,
    StepList,
    Job,
    JobList,
    Stage,
    StageList,
}

impl ParameterType {
    /// Structured types are spliced verbatim and never inspected
    pub fn is_structured(&self) -> bool {
        !matches!(
            self,
            ParameterType::String | ParameterType::Number | ParameterType::Boolean
        )
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            ParameterType::List
                | ParameterType::StepList
                | ParameterType::JobList
                | ParameterType::StageList
        )
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "object",
            ParameterType::List => "list",
            ParameterType::Step => "step",
            ParameterType::StepList => "stepList",
            ParameterType::Job => "job",
            ParameterType::JobList => "jobList",
            ParameterType::Stage => "stage",
            ParameterType::StageList => "stageList",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Stage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "DependsOn::is_implicit")]
    pub depends_on: DependsOn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_variables",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub variables: Vec<Variable>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Job>,

    /// Opaque execution-pool reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

// =============================================================================
// Job
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "DependsOn::is_implicit")]
    pub depends_on: DependsOn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// A failed job with this flag counts as SucceededWithIssues for its stage
    #[serde(default, skip_serializing_if = "BoolOrExpression::is_false")]
    pub continue_on_error: BoolOrExpression,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_yaml::Value>,

    #[serde(
        default,
        deserialize_with = "deserialize_variables",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub variables: Vec<Variable>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

// =============================================================================
// DependsOn
// =============================================================================

/// `dependsOn` as written. Omitted means "the default for this level"
/// (previous stage for stages, nothing for jobs); `[]` means none at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum DependsOn {
    #[default]
    Implicit,
    Single(String),
    Multiple(Vec<String>),
}

impl DependsOn {
    pub fn is_implicit(&self) -> bool {
        matches!(self, DependsOn::Implicit)
    }

    pub fn as_vec(&self) -> Vec<String> {
        match self {
            DependsOn::Implicit => vec![],
            DependsOn::Single(s) => vec![s.clone()],
            DependsOn::Multiple(v) => v.clone(),
        }
    }
}

// =============================================================================
// Step
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Reference name, used by `succeeded('name')` and output variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "BoolOrExpression::is_false")]
    pub continue_on_error: BoolOrExpression,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_minutes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count_on_task_failure: Option<u32>,

    /// Environment overlay applied on top of the exported variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(flatten)]
    pub action: StepAction,
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

impl Step {
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            name: None,
            display_name: None,
            condition: None,
            continue_on_error: BoolOrExpression::default(),
            enabled: true,
            timeout_in_minutes: None,
            retry_count_on_task_failure: None,
            env: BTreeMap::new(),
            action: StepAction::Script(ScriptStep {
                script: script.into(),
                working_directory: None,
            }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in reports: displayName, then name, then a summary of the action
    pub fn label(&self) -> String {
        if let Some(display) = &self.display_name {
            return display.clone();
        }
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.action {
            StepAction::Script(s) => first_line("Script", &s.script),
            StepAction::Bash(s) => first_line("Bash", &s.bash),
            StepAction::Pwsh(s) => first_line("PowerShell", &s.pwsh),
            StepAction::Task(t) => t.task.clone(),
            StepAction::Template(t) => format!("template: {}", t.template),
            StepAction::Publish(p) => format!("Publish {}", p.artifact_name()),
            StepAction::Download(d) => format!("Download {}", d.artifact_name()),
        }
    }
}

fn first_line(kind: &str, body: &str) -> String {
    let line = body.lines().next().unwrap_or("").trim();
    format!("{}: {}", kind, line)
}

/// The action a step performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepAction {
    Script(ScriptStep),
    Bash(BashStep),
    Pwsh(PwshStep),
    Task(TaskStep),
    Template(TemplateStep),
    Publish(PublishStep),
    Download(DownloadStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashStep {
    pub bash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PwshStep {
    pub pwsh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Opaque command identity, e.g. `Pylint@1`
    pub task: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub template: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishStep {
    /// Path to publish, relative to the working directory
    pub publish: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl PublishStep {
    pub fn artifact_name(&self) -> String {
        self.artifact.clone().unwrap_or_else(|| "drop".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStep {
    /// `current`, or the artifact name itself
    pub download: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DownloadStep {
    pub fn artifact_name(&self) -> String {
        match &self.artifact {
            Some(name) => name.clone(),
            None => self.download.clone(),
        }
    }
}

// =============================================================================
// Run status and results
// =============================================================================

/// Lifecycle status shared by stages, jobs and steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Pending,
    Running,
    Succeeded,
    SucceededWithIssues,
    Failed,
    Skipped,
    Canceled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    /// Succeeded or SucceededWithIssues
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Succeeded | Status::SucceededWithIssues)
    }

    /// Fold a child status into a running aggregate.
    /// Failed dominates, then Canceled, then SucceededWithIssues, then Succeeded.
    pub fn aggregate(self, child: Status) -> Status {
        match (self, child) {
            (Status::Failed, _) | (_, Status::Failed) => Status::Failed,
            (Status::Canceled, _) | (_, Status::Canceled) => Status::Canceled,
            (Status::SucceededWithIssues, _) | (_, Status::SucceededWithIssues) => {
                Status::SucceededWithIssues
            }
            _ => Status::Succeeded,
        }
    }

    /// Aggregate a set of child statuses. All-skipped (and non-empty) yields Skipped.
    pub fn aggregate_all(children: impl IntoIterator<Item = Status>) -> Status {
        let mut any = false;
        let mut all_skipped = true;
        let mut result = Status::Succeeded;
        for child in children {
            any = true;
            if child != Status::Skipped {
                all_skipped = false;
            }
            result = result.aggregate(child);
        }
        if any && all_skipped {
            Status::Skipped
        } else {
            result
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Pending => "Pending",
            Status::Running => "Running",
            Status::Succeeded => "Succeeded",
            Status::SucceededWithIssues => "SucceededWithIssues",
            Status::Failed => "Failed",
            Status::Skipped => "Skipped",
            Status::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

fn serialize_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_name: Option<String>,
    pub display_name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "durationMs", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Output variables, keyed by variable name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

impl StepResult {
    pub fn new(step: &Step, status: Status) -> Self {
        Self {
            step_name: step.name.clone(),
            display_name: step.label(),
            status,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
            exit_code: None,
            outputs: HashMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_name: String,
    pub display_name: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
    #[serde(rename = "durationMs", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    /// Output variables, keyed `step.variable`
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage_name: String,
    pub display_name: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub jobs: Vec<JobResult>,
    #[serde(rename = "durationMs", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

impl StageResult {
    /// Output variables of every job, keyed `job.step.variable`
    pub fn outputs(&self) -> HashMap<String, String> {
        self.jobs
            .iter()
            .flat_map(|job| {
                job.outputs
                    .iter()
                    .map(move |(k, v)| (format!("{}.{}", job.job_name, k), v.clone()))
            })
            .collect()
    }
}

/// Status tree of a whole run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub pipeline_name: String,
    /// Aggregate of the stage statuses
    pub status: Status,
    pub stages: Vec<StageResult>,
    #[serde(rename = "durationMs", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

impl PipelineResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Look up a job by `Stage.Job`, or by bare job name when only the default stage exists
    pub fn job(&self, path: &str) -> Option<&JobResult> {
        let (stage, job) = match path.split_once('.') {
            Some((stage, job)) => (self.stage(stage)?, job),
            None => (self.stages.first()?, path),
        };
        stage.jobs.iter().find(|j| j.job_name == job)
    }
}

impl JobResult {
    /// Find a step by reference name or display label
    pub fn step(&self, key: &str) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| s.step_name.as_deref() == Some(key) || s.display_name == key)
    }
}

/// Inputs of a single run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub pipeline_name: String,
    pub working_dir: PathBuf,
    /// Process environment passed through to steps
    pub env: HashMap<String, String>,
    /// Extra pipeline-scope variables (e.g. `--var` on the command line)
    pub variables: HashMap<String, String>,
    /// Resolved root parameters, readable by runtime conditions
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl ExecutionContext {
    pub fn new(pipeline_name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            working_dir: working_dir.into(),
            env: HashMap::new(),
            variables: HashMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, serde_yaml::Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

// =============================================================================
// Value type for expressions
// =============================================================================

/// Expression value. Objects are ordered so that evaluation and expansion are deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_json_value()).unwrap_or_default()
    }

    fn to_json_value(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json_value).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
        }
    }

    pub fn from_yaml(value: &serde_yaml::Value) -> Value {
        match value {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::Array(seq.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::Object(
                map.iter()
                    .filter_map(|(k, v)| scalar_to_string(k).map(|k| (k, Value::from_yaml(v))))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Null => serde_yaml::Value::Null,
            Value::Bool(b) => serde_yaml::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    serde_yaml::Value::Number((*n as i64).into())
                } else {
                    serde_yaml::Value::Number((*n).into())
                }
            }
            Value::String(s) => serde_yaml::Value::String(s.clone()),
            Value::Array(items) => {
                serde_yaml::Value::Sequence(items.iter().map(Value::to_yaml).collect())
            }
            Value::Object(map) => serde_yaml::Value::Mapping(
                map.iter()
                    .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.to_yaml()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}
