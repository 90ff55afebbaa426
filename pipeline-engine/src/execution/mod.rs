// Execution module
// Dependency graph, variable scopes, the status-propagating executor and run reports

pub mod environment;
pub mod events;
pub mod executor;
pub mod graph;
pub mod report;

pub use environment::{env_name, VariableEnvironment, VariableError};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{ExecutorConfig, PipelineExecutor, DEFAULT_CONDITION};
pub use graph::{ExecutionGraph, GraphError, JobNode, StageNode};
pub use report::{render_json, render_text, status_marker, StepCounts};
