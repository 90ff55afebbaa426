// Pipeline Loader
// Parses and expands pipeline documents, normalizes shorthand bodies, validates structure

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
use crate::parser::models::*;
use crate::parser::template::{ExpandedPipeline, TemplateEngine, TemplateResult};

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// Name given to the synthetic stage and job wrapping a `jobs:` or `steps:` body
pub const DEFAULT_NAME: &str = "__default";

pub struct PipelineParser;

impl PipelineParser {
    /// Parse a document that uses no templates or compile-time expressions
    pub fn parse(content: &str) -> ParseResult<Pipeline> {
        let pipeline: Pipeline =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;
        Ok(normalize_pipeline(pipeline))
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<Pipeline> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ParseError::new(format!("failed to read file: {}", e), ParseErrorKind::Io)
        })?;
        Self::parse(&content)
    }

    /// Expand all templates and compile-time directives of the document at `path`
    /// with the given root parameter overrides, then normalize it.
    pub fn load(
        path: &Path,
        repo_root: &Path,
        overrides: &BTreeMap<String, serde_yaml::Value>,
    ) -> TemplateResult<ExpandedPipeline> {
        let mut expanded = TemplateEngine::new(repo_root).expand_file(path, overrides)?;
        expanded.pipeline = normalize_pipeline(expanded.pipeline);
        Ok(expanded)
    }

    /// Like [`PipelineParser::load`] for an in-memory document rooted at `repo_root`
    pub fn load_str(
        content: &str,
        repo_root: &Path,
        overrides: &BTreeMap<String, serde_yaml::Value>,
    ) -> TemplateResult<ExpandedPipeline> {
        let origin = repo_root.join("pipeline.yml");
        let mut expanded = TemplateEngine::new(repo_root).expand_str(content, &origin, overrides)?;
        expanded.pipeline = normalize_pipeline(expanded.pipeline);
        Ok(expanded)
    }
}

/// Wrap a root `steps:` body in a default job and a root `jobs:` body in a default stage
pub fn normalize_pipeline(mut pipeline: Pipeline) -> Pipeline {
    if !pipeline.steps.is_empty() && pipeline.jobs.is_empty() && pipeline.stages.is_empty() {
        pipeline.jobs = vec![Job {
            job: Some(DEFAULT_NAME.to_string()),
            steps: std::mem::take(&mut pipeline.steps),
            ..Job::default()
        }];
    }

    if !pipeline.jobs.is_empty() && pipeline.stages.is_empty() {
        pipeline.stages = vec![Stage {
            stage: Some(DEFAULT_NAME.to_string()),
            jobs: std::mem::take(&mut pipeline.jobs),
            ..Stage::default()
        }];
    }

    pipeline
}

/// Structural checks on a normalized pipeline. Dependency checks live in the graph builder.
pub struct PipelineValidator;

impl PipelineValidator {
    pub fn validate(pipeline: &Pipeline) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if pipeline.stages.is_empty() {
            errors.push(
                ValidationError::new("pipeline has nothing to run", "pipeline")
                    .with_suggestion("add 'stages:', 'jobs:' or 'steps:'"),
            );
        }
        if !pipeline.jobs.is_empty() || !pipeline.steps.is_empty() {
            errors.push(ValidationError::new(
                "only one of 'stages', 'jobs' or 'steps' may be used at the root",
                "pipeline",
            ));
        }

        let mut stage_names = HashSet::new();
        for (i, stage) in pipeline.stages.iter().enumerate() {
            let path = match &stage.stage {
                Some(name) => format!("stages.{}", name),
                None => format!("stages[{}]", i),
            };
            Self::validate_stage(stage, &path, &mut stage_names, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_stage(
        stage: &Stage,
        path: &str,
        seen: &mut HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        check_name(stage.stage.as_deref(), "stage", path, seen, errors);

        if let Some(template) = &stage.template {
            errors.push(unresolved_template(template, path));
        }
        if stage.jobs.is_empty() {
            errors.push(
                ValidationError::new("stage has no jobs", path)
                    .with_suggestion("add 'jobs:' to the stage"),
            );
        }

        let mut job_names = HashSet::new();
        for (i, job) in stage.jobs.iter().enumerate() {
            let job_path = match &job.job {
                Some(name) => format!("{}.jobs.{}", path, name),
                None => format!("{}.jobs[{}]", path, i),
            };
            Self::validate_job(job, &job_path, &mut job_names, errors);
        }
    }

    fn validate_job(
        job: &Job,
        path: &str,
        seen: &mut HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        check_name(job.job.as_deref(), "job", path, seen, errors);

        if let Some(template) = &job.template {
            errors.push(unresolved_template(template, path));
        }
        if job.steps.is_empty() {
            errors.push(
                ValidationError::new("job has no steps", path)
                    .with_suggestion("add 'steps:' to define what the job should do"),
            );
        }

        let mut step_names = HashSet::new();
        for (i, step) in job.steps.iter().enumerate() {
            let step_path = format!("{}.steps[{}]", path, i);
            if let StepAction::Template(t) = &step.action {
                errors.push(unresolved_template(&t.template, &step_path));
            }
            if let Some(name) = &step.name {
                check_name(Some(name), "step", &step_path, &mut step_names, errors);
            }
        }
    }
}

fn check_name(
    name: Option<&str>,
    kind: &str,
    path: &str,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let Some(name) = name else {
        errors.push(
            ValidationError::new(format!("{} has no name", kind), path)
                .with_suggestion(format!("add '{}: <Name>'", kind)),
        );
        return;
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        errors.push(ValidationError::new(
            format!(
                "{} name '{}' may only contain letters, digits and '_'",
                kind, name
            ),
            path,
        ));
    }
    if !seen.insert(name.to_string()) {
        errors.push(ValidationError::new(
            format!("duplicate {} name '{}'", kind, name),
            path,
        ));
    }
}

fn unresolved_template(template: &str, path: &str) -> ValidationError {
    ValidationError::new(format!("unresolved template reference '{}'", template), path)
        .with_suggestion("template references cannot be combined with a stage or job name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_steps_only() {
        let pipeline = PipelineParser::parse("steps:\n  - script: echo hi\n").unwrap();
        assert!(pipeline.steps.is_empty());
        assert!(pipeline.jobs.is_empty());
        assert_eq!(pipeline.stages.len(), 1);
        assert_eq!(pipeline.stages[0].stage.as_deref(), Some(DEFAULT_NAME));
        assert_eq!(pipeline.stages[0].jobs[0].job.as_deref(), Some(DEFAULT_NAME));
        assert_eq!(pipeline.stages[0].jobs[0].steps.len(), 1);
    }

    #[test]
    fn test_normalize_jobs_only() {
        let pipeline = PipelineParser::parse(
            "jobs:\n  - job: A\n    steps: [{script: a}]\n  - job: B\n    dependsOn: A\n    steps: [{script: b}]\n",
        )
        .unwrap();
        assert_eq!(pipeline.stages.len(), 1);
        assert_eq!(pipeline.stages[0].jobs.len(), 2);
        assert!(PipelineValidator::validate(&pipeline).is_ok());
    }

    #[test]
    fn test_parse_reports_schema_errors() {
        let err = PipelineParser::parse("steps:\n  - nothing: here\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidSchema);
    }

    #[test]
    fn test_validate_duplicate_and_missing_names() {
        let pipeline = PipelineParser::parse(
            r#"
stages:
  - stage: Build
    jobs:
      - job: A
        steps: [{script: a}]
  - stage: Build
    jobs:
      - steps: [{script: b}]
"#,
        )
        .unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate stage name 'Build'")));
        assert!(errors.iter().any(|e| e.message == "job has no name"));
    }

    #[test]
    fn test_validate_empty_stage_and_bad_name() {
        let pipeline = PipelineParser::parse("stages:\n  - stage: Bad-Name\n").unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message == "stage has no jobs"));
        assert!(errors.iter().any(|e| e.message.contains("may only contain")));
    }

    #[test]
    fn test_validate_duplicate_step_names() {
        let pipeline = PipelineParser::parse(
            "steps:\n  - script: a\n    name: setVars\n  - script: b\n    name: setVars\n",
        )
        .unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].path.ends_with("steps[1]"));
    }

    #[test]
    fn test_validate_unresolved_step_template() {
        let pipeline = PipelineParser::parse("steps:\n  - template: t.yml\n").unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors[0].message.contains("unresolved template reference"));
    }

    #[test]
    fn test_load_str_expands_and_normalizes() {
        let dir = tempfile::TempDir::new().unwrap();
        let overrides = BTreeMap::from([("go".to_string(), serde_yaml::Value::Bool(false))]);
        let expanded = PipelineParser::load_str(
            "parameters:\n  - { name: go, type: boolean, default: true }\nsteps:\n  - script: a\n  - ${{ if parameters.go }}:\n    - script: b\n",
            dir.path(),
            &overrides,
        )
        .unwrap();
        assert_eq!(expanded.pipeline.stages[0].jobs[0].steps.len(), 1);
        assert_eq!(expanded.parameters["go"], serde_yaml::Value::Bool(false));
    }
}
