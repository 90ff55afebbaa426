// Pipeline Engine Library
// Template expansion, condition evaluation and status-propagating execution of YAML pipelines

pub mod artifacts;
pub mod error;
pub mod execution;
pub mod expression;
pub mod parser;
pub mod plan;
pub mod runners;
pub mod utils;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
pub use plan::RunPlan;

// Re-export parser types
pub use parser::{
    parse_override, ExecutionContext, ExpandedPipeline, JobResult, ParseError, Pipeline,
    PipelineParser, PipelineResult, PipelineValidator, StageResult, Status, StepResult,
    TemplateEngine, TemplateError, TemplateErrorKind, ValidationError,
};

// Re-export expression types
pub use expression::{EvalError, ExpressionContext, ExpressionEngine};

// Re-export execution types
pub use execution::{
    progress_channel, render_json, render_text, ExecutionEvent, ExecutionGraph, ExecutorConfig,
    GraphError, PipelineExecutor, ProgressReceiver, ProgressSender, StepCounts,
};

// Re-export runner and artifact types
pub use artifacts::{ArtifactError, ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
pub use runners::{ScriptedExecutor, ShellExecutor, StepExecutor, StepInvocation, StepOutcome};
