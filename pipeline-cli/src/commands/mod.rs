// CLI commands
// Shared pipeline arguments, override parsing and exit codes

pub mod expand;
pub mod run;
pub mod validate;

use crate::output;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::utils::default_repo_root;
use pipeline_engine::{parse_override, EngineError, RunPlan, Status};

/// Process exit codes
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const CANCELED: i32 = 2;
    /// Template, validation or graph error; nothing ran
    pub const RESOLUTION: i32 = 3;
    /// Bad arguments or unreadable files
    pub const USAGE: i32 = 4;
}

pub fn exit_code(status: Status) -> i32 {
    match status {
        Status::Succeeded | Status::SucceededWithIssues | Status::Skipped => exit::SUCCESS,
        Status::Canceled => exit::CANCELED,
        Status::Failed | Status::Pending | Status::Running => exit::FAILED,
    }
}

/// Arguments every command needs to resolve a pipeline
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Override a root parameter (can be repeated, format: name=value)
    #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Root for `/`-prefixed template paths (default: enclosing git repository)
    #[arg(long, value_name = "DIR")]
    pub repo_root: Option<PathBuf>,
}

impl PipelineArgs {
    pub fn overrides(&self) -> Result<BTreeMap<String, serde_yaml::Value>> {
        Ok(parse_assignments(&self.params, "parameter")?
            .into_iter()
            .map(|(name, raw)| (name, parse_override(&raw)))
            .collect())
    }

    pub fn repo_root(&self) -> PathBuf {
        self.repo_root
            .clone()
            .unwrap_or_else(|| default_repo_root(&self.pipeline))
    }

    /// The resolved plan, or `None` after reporting a resolution error
    pub fn load(&self) -> Result<Option<RunPlan>> {
        if !self.pipeline.exists() {
            color_eyre::eyre::bail!("Pipeline file not found: {}", self.pipeline.display());
        }
        let overrides = self.overrides()?;
        match RunPlan::load(&self.pipeline, &self.repo_root(), &overrides) {
            Ok(plan) => Ok(Some(plan)),
            Err(err) => {
                report(&err);
                Ok(None)
            }
        }
    }

    /// `name:` from the document, else the file stem
    pub fn pipeline_name(&self, plan: &RunPlan) -> String {
        let stem = self
            .pipeline
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline");
        plan.name_or(stem)
    }
}

pub fn parse_assignments(raw: &[String], what: &str) -> Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    for item in raw {
        match item.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                values.insert(name.trim().to_string(), value.to_string());
            }
            _ => color_eyre::eyre::bail!(
                "Invalid {} format '{}'. Expected name=value",
                what,
                item
            ),
        }
    }
    Ok(values)
}

fn report(err: &EngineError) {
    match err {
        EngineError::Parse(parse) => {
            output::error(&parse.to_string());
            if let Some(suggestion) = &parse.suggestion {
                output::info(&format!("Suggestion: {}", suggestion));
            }
        }
        EngineError::Validation(errors) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in errors {
                output::error(&format!("  - [{}] {}", error.path, error.message));
            }
        }
        other => output::error(&other.to_string()),
    }
}
