// Engine errors
// Everything that can stop a pipeline before its first step runs

use crate::execution::GraphError;
use crate::parser::{ParseError, TemplateError, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("pipeline is invalid:\n{}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type EngineResult<T> = Result<T, EngineError>;

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

impl From<Vec<ValidationError>> for EngineError {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TemplateErrorKind;

    #[test]
    fn test_validation_lists_every_error() {
        let err = EngineError::from(vec![
            ValidationError::new("duplicate stage name 'Build'", "stages.Build"),
            ValidationError::new("job has no steps", "stages.Test.jobs.Unit"),
        ]);
        let message = err.to_string();
        assert!(message.contains("duplicate stage name 'Build'"));
        assert!(message.contains("job has no steps"));
    }

    #[test]
    fn test_template_error_is_transparent() {
        let err = EngineError::from(TemplateError {
            message: "template not found".to_string(),
            template_path: Some("templates/build.yml".to_string()),
            kind: TemplateErrorKind::NotFound,
        });
        assert_eq!(
            err.to_string(),
            "template error in 'templates/build.yml': template not found"
        );
    }
}
