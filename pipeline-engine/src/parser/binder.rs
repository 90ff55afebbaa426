// Parameter Binder
// Resolves a template's declared parameters against caller overrides and defaults

use crate::parser::models::{scalar_to_string, Parameter, ParameterType};
use crate::parser::template::{TemplateError, TemplateErrorKind};

use std::collections::BTreeMap;

/// Bind every declared parameter of `template`.
///
/// For each declaration the override wins if present and type-compatible, then the
/// default; a parameter with neither is unbound. Structured types (`object`, `step`,
/// `stepList`, ...) are passed through without inspecting their contents. Overrides that
/// name no declared parameter are rejected.
pub fn bind_parameters(
    declared: &[Parameter],
    overrides: &BTreeMap<String, serde_yaml::Value>,
    template: &str,
) -> Result<BTreeMap<String, serde_yaml::Value>, TemplateError> {
    if let Some(unknown) = overrides
        .keys()
        .find(|name| !declared.iter().any(|p| &p.name == *name))
    {
        return Err(TemplateError::new(
            format!("unexpected parameter '{}'", unknown),
            TemplateErrorKind::UnknownParameter,
        )
        .with_path(template));
    }

    let mut bound = BTreeMap::new();
    for param in declared {
        let raw = match (overrides.get(&param.name), &param.default) {
            (Some(value), _) => value,
            (None, Some(default)) => default,
            (None, None) => {
                return Err(TemplateError::new(
                    format!(
                        "parameter '{}' has no default and no value was supplied",
                        param.name
                    ),
                    TemplateErrorKind::UnboundParameter,
                )
                .with_path(template));
            }
        };

        let value = coerce(param, raw).map_err(|e| e.with_path(template))?;
        check_allowed(param, &value).map_err(|e| e.with_path(template))?;
        bound.insert(param.name.clone(), value);
    }

    Ok(bound)
}

/// Parse a command-line override value. YAML scalars and flow collections are
/// recognized (`false`, `3`, `[a, b]`); anything unparsable stays a plain string.
pub fn parse_override(raw: &str) -> serde_yaml::Value {
    if raw.trim().is_empty() {
        return serde_yaml::Value::String(raw.to_string());
    }
    serde_yaml::from_str(raw).unwrap_or_else(|_| serde_yaml::Value::String(raw.to_string()))
}

fn coerce(param: &Parameter, value: &serde_yaml::Value) -> Result<serde_yaml::Value, TemplateError> {
    use serde_yaml::Value as Yaml;

    let coerced = match (param.param_type, value) {
        (ParameterType::String, v) => scalar_to_string(v).map(Yaml::String),

        (ParameterType::Number, Yaml::Number(_)) => Some(value.clone()),
        (ParameterType::Number, Yaml::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .map(|n| Yaml::Number(n.into())),

        (ParameterType::Boolean, Yaml::Bool(_)) => Some(value.clone()),
        (ParameterType::Boolean, Yaml::String(s)) if s.eq_ignore_ascii_case("true") => {
            Some(Yaml::Bool(true))
        }
        (ParameterType::Boolean, Yaml::String(s)) if s.eq_ignore_ascii_case("false") => {
            Some(Yaml::Bool(false))
        }

        (t, Yaml::Sequence(_)) if t.is_list() => Some(value.clone()),
        (t, Yaml::Null) if t.is_list() => Some(Yaml::Sequence(Vec::new())),

        (ParameterType::Object, _) => Some(value.clone()),
        (ParameterType::Step | ParameterType::Job | ParameterType::Stage, Yaml::Mapping(_)) => {
            Some(value.clone())
        }

        _ => None,
    };

    coerced.ok_or_else(|| {
        TemplateError::new(
            format!(
                "parameter '{}' expects type {}, got {}",
                param.name,
                param.param_type,
                describe(value)
            ),
            TemplateErrorKind::TypeMismatch,
        )
    })
}

fn check_allowed(param: &Parameter, value: &serde_yaml::Value) -> Result<(), TemplateError> {
    let Some(allowed) = &param.values else {
        return Ok(());
    };

    let rendered = scalar_to_string(value);
    let permitted = allowed.iter().any(|candidate| {
        candidate == value || (rendered.is_some() && scalar_to_string(candidate) == rendered)
    });
    if permitted {
        return Ok(());
    }

    let choices: Vec<String> = allowed
        .iter()
        .map(|v| scalar_to_string(v).unwrap_or_else(|| describe(v).to_string()))
        .collect();
    Err(TemplateError::new(
        format!(
            "value '{}' is not allowed for parameter '{}' (allowed: {})",
            rendered.unwrap_or_else(|| describe(value).to_string()),
            param.name,
            choices.join(", ")
        ),
        TemplateErrorKind::InvalidParameterValue,
    ))
}

fn describe(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "boolean",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(yaml: &str) -> Vec<Parameter> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn overrides(yaml: &str) -> BTreeMap<String, serde_yaml::Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_default_used_without_override() {
        let declared = params(
            "- { name: BuildDocs, type: boolean, default: true }\n- { name: Config, default: Release }",
        );
        let bound = bind_parameters(&declared, &BTreeMap::new(), "t.yml").unwrap();
        assert_eq!(bound["BuildDocs"], serde_yaml::Value::Bool(true));
        assert_eq!(bound["Config"], serde_yaml::Value::String("Release".into()));
    }

    #[test]
    fn test_override_wins() {
        let declared = params("- { name: BuildDocs, type: boolean, default: true }");
        let bound = bind_parameters(&declared, &overrides("BuildDocs: false"), "t.yml").unwrap();
        assert_eq!(bound["BuildDocs"], serde_yaml::Value::Bool(false));
    }

    #[test]
    fn test_unbound_parameter() {
        let declared = params("- { name: Target, type: string }");
        let err = bind_parameters(&declared, &BTreeMap::new(), "t.yml").unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::UnboundParameter);
        assert!(err.to_string().contains("Target"));
    }

    #[test]
    fn test_boolean_accepts_string_forms() {
        let declared = params("- { name: Flag, type: boolean, default: false }");
        let bound = bind_parameters(&declared, &overrides("Flag: 'True'"), "t.yml").unwrap();
        assert_eq!(bound["Flag"], serde_yaml::Value::Bool(true));

        let err = bind_parameters(&declared, &overrides("Flag: maybe"), "t.yml").unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::TypeMismatch);
    }

    #[test]
    fn test_number_coercion() {
        let declared = params("- { name: Retries, type: number, default: 1 }");
        let bound = bind_parameters(&declared, &overrides("Retries: '3'"), "t.yml").unwrap();
        assert_eq!(bound["Retries"].as_f64(), Some(3.0));
        assert!(bind_parameters(&declared, &overrides("Retries: [1]"), "t.yml").is_err());
    }

    #[test]
    fn test_string_rejects_list() {
        let declared = params("- { name: Name, type: string, default: x }");
        let err = bind_parameters(&declared, &overrides("Name: [a]"), "t.yml").unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::TypeMismatch);
        let bound = bind_parameters(&declared, &overrides("Name: 42"), "t.yml").unwrap();
        assert_eq!(bound["Name"], serde_yaml::Value::String("42".into()));
    }

    #[test]
    fn test_step_list_passes_through_opaquely() {
        let declared = params("- { name: BeforePublishSteps, type: stepList, default: [] }");
        let extra = overrides("BeforePublishSteps:\n  - script: echo x\n    anything: goes\n");
        let bound = bind_parameters(&declared, &extra, "t.yml").unwrap();
        assert_eq!(bound["BeforePublishSteps"], extra["BeforePublishSteps"]);

        let err = bind_parameters(&declared, &overrides("BeforePublishSteps: nope"), "t.yml")
            .unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::TypeMismatch);
    }

    #[test]
    fn test_allowed_values() {
        let declared = params(
            "- { name: Config, type: string, default: Debug, values: [Debug, Release] }",
        );
        assert!(bind_parameters(&declared, &overrides("Config: Release"), "t.yml").is_ok());
        let err = bind_parameters(&declared, &overrides("Config: Fast"), "t.yml").unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::InvalidParameterValue);
        assert!(err.message.contains("Debug, Release"));
    }

    #[test]
    fn test_unknown_override_rejected() {
        let declared = params("- { name: A, default: x }");
        let err = bind_parameters(&declared, &overrides("B: y"), "t.yml").unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::UnknownParameter);
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(parse_override("false"), serde_yaml::Value::Bool(false));
        assert!(parse_override("[{script: echo hi}]").is_sequence());
        assert_eq!(parse_override("hello world"), serde_yaml::Value::String("hello world".into()));
        assert_eq!(parse_override(""), serde_yaml::Value::String(String::new()));
    }
}
