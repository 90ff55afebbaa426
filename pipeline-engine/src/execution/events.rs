// Execution Events
// Ordered progress stream published by the executor while a run is in flight

use crate::parser::models::Status;

use std::time::Duration;
use tokio::sync::mpsc;

pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_name: String,
        total_stages: usize,
    },
    PipelineCompleted {
        pipeline_name: String,
        status: Status,
        duration: Duration,
    },

    StageStarted {
        stage_name: String,
        display_name: Option<String>,
        total_jobs: usize,
    },
    StageCompleted {
        stage_name: String,
        status: Status,
        duration: Duration,
    },
    StageSkipped {
        stage_name: String,
        reason: String,
    },

    JobStarted {
        stage_name: String,
        job_name: String,
        display_name: Option<String>,
        total_steps: usize,
    },
    JobCompleted {
        stage_name: String,
        job_name: String,
        status: Status,
        duration: Duration,
    },
    JobSkipped {
        stage_name: String,
        job_name: String,
        reason: String,
    },

    StepStarted {
        stage_name: String,
        job_name: String,
        step_index: usize,
        display_name: String,
    },
    /// One line of step output; `is_error` marks stderr
    StepOutput {
        stage_name: String,
        job_name: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },
    StepCompleted {
        stage_name: String,
        job_name: String,
        step_index: usize,
        status: Status,
        duration: Duration,
        exit_code: Option<i32>,
    },
    StepSkipped {
        stage_name: String,
        job_name: String,
        step_index: usize,
        reason: String,
    },

    VariableSet {
        stage_name: String,
        job_name: String,
        name: String,
        value: String,
        is_output: bool,
    },
    ArtifactPublished {
        stage_name: String,
        job_name: String,
        artifact: String,
    },
}

impl ExecutionEvent {
    pub fn pipeline_started(name: impl Into<String>, total_stages: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_stages,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, status: Status, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            status,
            duration,
        }
    }

    pub fn stage_started(
        name: impl Into<String>,
        display_name: Option<String>,
        total_jobs: usize,
    ) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            display_name,
            total_jobs,
        }
    }

    pub fn stage_completed(name: impl Into<String>, status: Status, duration: Duration) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
            duration,
        }
    }

    pub fn stage_skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageSkipped {
            stage_name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn job_started(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        display_name: Option<String>,
        total_steps: usize,
    ) -> Self {
        Self::JobStarted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            display_name,
            total_steps,
        }
    }

    pub fn job_completed(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        status: Status,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            status,
            duration,
        }
    }

    pub fn job_skipped(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::JobSkipped {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            reason: reason.into(),
        }
    }

    /// Short display form used by the CLI's live log
    pub fn summary(&self) -> Option<String> {
        match self {
            Self::StageStarted { stage_name, .. } => Some(format!("stage {} started", stage_name)),
            Self::StageCompleted {
                stage_name, status, ..
            } => Some(format!("stage {} {}", stage_name, status)),
            Self::StageSkipped { stage_name, reason } => {
                Some(format!("stage {} skipped: {}", stage_name, reason))
            }
            Self::JobCompleted {
                stage_name,
                job_name,
                status,
                ..
            } => Some(format!("job {}.{} {}", stage_name, job_name, status)),
            Self::StepStarted {
                job_name,
                display_name,
                ..
            } => Some(format!("[{}] {}", job_name, display_name)),
            Self::StepOutput {
                job_name, output, ..
            } => Some(format!("[{}]   {}", job_name, output)),
            _ => None,
        }
    }
}

/// Fire-and-forget sending; a dropped receiver must never fail the run
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel_keeps_order() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::pipeline_started("ci", 2));
        tx.send_event(ExecutionEvent::stage_started("Build", None, 1));
        tx.send_event(ExecutionEvent::stage_completed(
            "Build",
            Status::SucceededWithIssues,
            Duration::from_millis(5),
        ));

        assert!(matches!(rx.recv().await, Some(ExecutionEvent::PipelineStarted { .. })));
        assert!(matches!(rx.recv().await, Some(ExecutionEvent::StageStarted { .. })));
        assert_eq!(
            rx.recv().await,
            Some(ExecutionEvent::StageCompleted {
                stage_name: "Build".to_string(),
                status: Status::SucceededWithIssues,
                duration: Duration::from_millis(5),
            })
        );
    }

    #[test]
    fn test_send_without_receiver() {
        let none: Option<ProgressSender> = None;
        none.send_event(ExecutionEvent::stage_skipped("Docs", "condition was false"));

        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::pipeline_started("ci", 0));
    }

    #[test]
    fn test_summary() {
        let event = ExecutionEvent::job_completed("Analyze", "Lint", Status::Failed, Duration::ZERO);
        assert_eq!(event.summary().as_deref(), Some("job Analyze.Lint Failed"));
        assert!(ExecutionEvent::pipeline_started("ci", 1).summary().is_none());
    }
}
