// Run plan
// Load, expand, validate and graph a pipeline document in one pass

use crate::error::EngineResult;
use crate::execution::ExecutionGraph;
use crate::parser::{ExpandedPipeline, Pipeline, PipelineParser, PipelineValidator};

use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A fully resolved pipeline, ready for [`crate::PipelineExecutor::execute`]
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub pipeline: Pipeline,
    /// Root parameters after defaults and overrides
    pub parameters: BTreeMap<String, serde_yaml::Value>,
    pub graph: ExecutionGraph,
}

impl RunPlan {
    pub fn load(
        path: &Path,
        repo_root: &Path,
        overrides: &BTreeMap<String, serde_yaml::Value>,
    ) -> EngineResult<Self> {
        Self::build(PipelineParser::load(path, repo_root, overrides)?)
    }

    pub fn load_str(
        content: &str,
        repo_root: &Path,
        overrides: &BTreeMap<String, serde_yaml::Value>,
    ) -> EngineResult<Self> {
        Self::build(PipelineParser::load_str(content, repo_root, overrides)?)
    }

    fn build(expanded: ExpandedPipeline) -> EngineResult<Self> {
        PipelineValidator::validate(&expanded.pipeline)?;
        let graph = ExecutionGraph::from_pipeline(&expanded.pipeline)?;
        debug!(
            stages = graph.stages.len(),
            jobs = graph.job_count(),
            steps = graph.step_count(),
            "run plan ready"
        );
        Ok(Self {
            pipeline: expanded.pipeline,
            parameters: expanded.parameters,
            graph,
        })
    }

    /// The document's `name:`, else `fallback`
    pub fn name_or(&self, fallback: &str) -> String {
        self.pipeline
            .name
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}
