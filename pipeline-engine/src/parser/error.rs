// Document parse errors
// Location-aware errors for template documents, with source context and fix hints

use std::fmt;

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// A few source lines around the error
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    YamlSyntax,
    /// Wrong shape: missing fields, wrong types
    InvalidSchema,
    Io,
    /// Semantic checks after parsing (missing names, duplicates)
    Validation,
}

impl ParseError {
    pub fn new(message: impl Into<String>, kind: ParseErrorKind) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the source lines surrounding `self.line`
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));
            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column - 1)));
            }
        }

        self.context = context;
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let message = err.to_string();
        let kind = if message.contains("missing field")
            || message.contains("invalid type")
            || message.contains("did not match any variant")
        {
            ParseErrorKind::InvalidSchema
        } else {
            ParseErrorKind::YamlSyntax
        };
        let suggestion = suggest_fix(&message, source, line);

        let mut error = ParseError::new(message, kind)
            .at(line, column)
            .with_source_context(source, 2);
        error.suggestion = suggestion;
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }
        if !self.context.is_empty() {
            write!(f, "\n{}", self.context.trim_end())?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

fn suggest_fix(message: &str, source: &str, line: usize) -> Option<String> {
    if message.contains("did not match any variant of untagged enum StepAction") {
        return Some(
            "each step needs one of: script, bash, pwsh, task, template, publish, download"
                .to_string(),
        );
    }

    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if error_line.starts_with('\t') {
        return Some("YAML indentation must use spaces, not tabs".to_string());
    }

    let typos = [
        ("dependson", "dependsOn"),
        ("displayname", "displayName"),
        ("continueonerror", "continueOnError"),
        ("timeout:", "timeoutInMinutes"),
    ];
    let lower = error_line.to_lowercase();
    typos
        .iter()
        .find(|(typo, correct)| lower.contains(typo) && !error_line.contains(correct))
        .map(|(_, correct)| format!("did you mean '{}'?", correct))
}

pub type ParseResult<T> = Result<T, ParseError>;

/// A semantic problem found in an expanded pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
    /// Location in the document, e.g. `stages.Build.jobs[0]`
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (help: {})", suggestion)?;
        }
        Ok(())
    }
}
