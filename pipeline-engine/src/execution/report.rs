// Status Report
// Per-node status tree of a finished run, as indented text or JSON

use crate::parser::models::{JobResult, PipelineResult, StageResult, Status, StepResult};

use std::fmt::Write;

/// Marker shown before a node; every terminal status has its own
pub fn status_marker(status: Status) -> &'static str {
    match status {
        Status::Pending => "[ ]",
        Status::Running => "[~]",
        Status::Succeeded => "[✓]",
        Status::SucceededWithIssues => "[!]",
        Status::Failed => "[✗]",
        Status::Skipped => "[-]",
        Status::Canceled => "[/]",
    }
}

/// Render the tree, one node per line:
///
/// ```text
/// [!] ci: SucceededWithIssues (1.20s)
///   [!] Analyze: SucceededWithIssues
///     [!] Lint: SucceededWithIssues
///       [!] Pylint: SucceededWithIssues - step 'Pylint' failed
/// ```
pub fn render_text(result: &PipelineResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}: {} ({:.2}s)",
        status_marker(result.status),
        result.pipeline_name,
        result.status,
        result.duration.as_secs_f64()
    );
    for stage in &result.stages {
        render_stage(&mut out, stage);
    }
    out
}

fn render_stage(out: &mut String, stage: &StageResult) {
    let label = stage.display_name.as_deref().unwrap_or(&stage.stage_name);
    line(out, 1, stage.status, label, stage.error.as_deref());
    for job in &stage.jobs {
        render_job(out, job);
    }
}

fn render_job(out: &mut String, job: &JobResult) {
    let label = job.display_name.as_deref().unwrap_or(&job.job_name);
    line(out, 2, job.status, label, job.error.as_deref());
    for step in &job.steps {
        render_step(out, step);
    }
}

fn render_step(out: &mut String, step: &StepResult) {
    let error = match step.status {
        Status::Failed | Status::SucceededWithIssues => step.error.as_deref(),
        _ => None,
    };
    line(out, 3, step.status, &step.display_name, error);
}

fn line(out: &mut String, depth: usize, status: Status, label: &str, error: Option<&str>) {
    let _ = write!(
        out,
        "{}{} {}: {}",
        "  ".repeat(depth),
        status_marker(status),
        label,
        status
    );
    if let Some(error) = error.and_then(|e| e.lines().next()) {
        let _ = write!(out, " - {}", error);
    }
    out.push('\n');
}

pub fn render_json(result: &PipelineResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(result)
}

/// Step counts per terminal status, for the one-line summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub succeeded: usize,
    pub with_issues: usize,
    pub failed: usize,
    pub skipped: usize,
    pub canceled: usize,
}

impl StepCounts {
    pub fn of(result: &PipelineResult) -> Self {
        let mut counts = Self::default();
        for step in result
            .stages
            .iter()
            .flat_map(|s| &s.jobs)
            .flat_map(|j| &j.steps)
        {
            match step.status {
                Status::Succeeded => counts.succeeded += 1,
                Status::SucceededWithIssues => counts.with_issues += 1,
                Status::Failed => counts.failed += 1,
                Status::Skipped => counts.skipped += 1,
                Status::Canceled => counts.canceled += 1,
                Status::Pending | Status::Running => {}
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Step;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sample() -> PipelineResult {
        let lint = StepResult::new(&Step::script("pylint").with_name("Pylint"), Status::SucceededWithIssues)
            .with_error("pylint exited with code 4\nmore detail");
        let docs = StepResult::new(&Step::script("sphinx").with_name("Docs"), Status::Skipped);
        PipelineResult {
            pipeline_name: "ci".to_string(),
            status: Status::SucceededWithIssues,
            stages: vec![StageResult {
                stage_name: "Analyze".to_string(),
                display_name: None,
                status: Status::SucceededWithIssues,
                error: None,
                jobs: vec![JobResult {
                    job_name: "Lint".to_string(),
                    display_name: Some("Static analysis".to_string()),
                    status: Status::SucceededWithIssues,
                    error: None,
                    steps: vec![lint, docs],
                    duration: Duration::ZERO,
                    outputs: HashMap::new(),
                }],
                duration: Duration::ZERO,
            }],
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_markers_are_distinct() {
        use Status::*;
        let all = [Pending, Running, Succeeded, SucceededWithIssues, Failed, Skipped, Canceled];
        let markers: std::collections::HashSet<_> = all.iter().map(|s| status_marker(*s)).collect();
        assert_eq!(markers.len(), all.len());
    }

    #[test]
    fn test_render_text_tree() {
        let text = render_text(&sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[!] ci: SucceededWithIssues (1.50s)");
        assert_eq!(lines[1], "  [!] Analyze: SucceededWithIssues");
        assert_eq!(lines[2], "    [!] Static analysis: SucceededWithIssues");
        assert_eq!(
            lines[3],
            "      [!] Pylint: SucceededWithIssues - pylint exited with code 4"
        );
        assert_eq!(lines[4], "      [-] Docs: Skipped");
    }

    #[test]
    fn test_render_json() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&sample()).unwrap()).unwrap();
        assert_eq!(json["status"], "SucceededWithIssues");
        assert_eq!(json["durationMs"], 1500);
        assert_eq!(json["stages"][0]["jobs"][0]["steps"][1]["status"], "Skipped");
    }

    #[test]
    fn test_step_counts() {
        let counts = StepCounts::of(&sample());
        assert_eq!(counts.with_issues, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.succeeded, 0);
    }
}
