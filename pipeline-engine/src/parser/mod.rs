// Parser module
// Pipeline documents: models, parameter binding, template expansion and validation

pub mod binder;
pub mod error;
pub mod loader;
pub mod models;
pub mod template;

pub use binder::{bind_parameters, parse_override};
pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use loader::{normalize_pipeline, PipelineParser, PipelineValidator, DEFAULT_NAME};
pub use models::*;
pub use template::{ExpandedPipeline, TemplateEngine, TemplateError, TemplateErrorKind, TemplateResult};
