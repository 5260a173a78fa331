//! Diagnostic system for compile-time errors and warnings
//!
//! All lexer, parser, resolver and emitter errors flow through the unified
//! Diagnostic type, ensuring consistent formatting across the pipeline.

use crate::span::{self, Span};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic schema version
pub const DIAG_VERSION: u32 = 1;

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Fatal error that prevents execution
    Error,
    /// Warning that doesn't prevent execution
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
            DiagnosticLevel::Warning => write!(f, "warning"),
        }
    }
}

/// A diagnostic message (error or warning)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Diagnostic schema version
    pub diag_version: u32,
    /// Severity level
    pub level: DiagnosticLevel,
    /// Error code (e.g., "ML3002")
    pub code: String,
    /// Main diagnostic message
    pub message: String,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
    /// Length of error span
    pub length: usize,
    /// Source line string
    pub snippet: String,
    /// Short label for the caret range
    pub label: String,
    /// Additional notes (optional)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
    /// Suggested fix (optional)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub help: Option<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic with code
    pub fn error_with_code(
        code: impl Into<String>,
        message: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            diag_version: DIAG_VERSION,
            level: DiagnosticLevel::Error,
            code: code.into(),
            message: message.into(),
            line: 1,
            column: span.start + 1,
            length: span.end.saturating_sub(span.start),
            snippet: String::new(),
            label: String::new(),
            notes: Vec::new(),
            help: None,
        }
    }

    /// Create a new error diagnostic (uses the generic error code)
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self::error_with_code("ML9999", message, span)
    }

    /// Fill line, column and snippet from the source text
    pub fn with_location(mut self, source: &str, span: Span) -> Self {
        let (line, column) = span::line_column(source, span.start);
        self.line = line;
        self.column = column;
        self.snippet = span::line_snippet(source, line);
        self
    }

    /// Set the line number
    pub fn with_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    /// Set the snippet (source line)
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    /// Set the label (caret description)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Add a note
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Add a help message
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Format as human-readable string
    pub fn to_human_string(&self) -> String {
        let mut output = String::new();

        // Header: error[ML3002]: Undeclared identifier 'x'
        output.push_str(&format!(
            "{}[{}]: {}\n",
            self.level, self.code, self.message
        ));

        // Location: --> 12:9
        output.push_str(&format!("  --> {}:{}\n", self.line, self.column));

        // Snippet with caret
        if !self.snippet.is_empty() {
            output.push_str("   |\n");
            output.push_str(&format!("{:>2} | {}\n", self.line, self.snippet));

            if self.length > 0 && self.column <= self.snippet.len() + 1 {
                let padding = " ".repeat(self.column - 1);
                let carets = "^".repeat(self.length.max(1));
                output.push_str(&format!("   | {}{}", padding, carets));

                if !self.label.is_empty() {
                    output.push_str(&format!(" {}", self.label));
                }
                output.push('\n');
            }
        }

        for note in &self.notes {
            output.push_str(&format!("   = note: {}\n", note));
        }

        if let Some(help) = &self.help {
            output.push_str(&format!("   = help: {}\n", help));
        }

        output
    }

    /// Format as JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Sort diagnostics by level (errors first), then by location
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| {
        match (a.level, b.level) {
            (DiagnosticLevel::Error, DiagnosticLevel::Warning) => std::cmp::Ordering::Less,
            (DiagnosticLevel::Warning, DiagnosticLevel::Error) => std::cmp::Ordering::Greater,
            _ => a.line.cmp(&b.line).then(a.column.cmp(&b.column)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_format() {
        let diag = Diagnostic::error_with_code("ML3002", "Undeclared identifier 'y'", Span::new(8, 9))
            .with_location("var x = y;", Span::new(8, 9))
            .with_label("not found in any scope");
        let text = diag.to_human_string();
        assert!(text.contains("error[ML3002]"));
        assert!(text.contains("var x = y;"));
        assert!(text.contains("^"));
    }

    #[test]
    fn test_json_roundtrip() {
        let diag = Diagnostic::error("boom", Span::new(0, 1));
        let json = diag.to_json_string().unwrap();
        let parsed: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, diag);
    }

    #[test]
    fn test_sorting() {
        let mut diags = vec![
            Diagnostic::error("b", Span::new(0, 1)).with_line(7),
            Diagnostic::error("a", Span::new(0, 1)).with_line(2),
        ];
        sort_diagnostics(&mut diags);
        assert_eq!(diags[0].message, "a");
    }
}
