//! Batched compile-time diagnostics.
//!
//! Compile phases never stop at the first problem: each phase collects every
//! diagnostic it finds and the pipeline aborts after the phase if any of
//! them is an error.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Category of a compile-time problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Malformed document or composition input.
    Validation,
    /// Template or expression names something that does not resolve.
    UndefinedReference,
    /// Same step id with incompatible definitions across layers.
    MergeConflict,
    /// Macro call arguments do not match the macro's parameters.
    MacroArgument,
    /// Cycle or missing dependency.
    Plan,
    /// Advisory only.
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    /// Dotted location, e.g. `steps.build.with.run` or a file path.
    pub location: String,
    pub message: String,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn warning(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: DiagnosticKind::Advisory,
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn validation(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::error(DiagnosticKind::Validation, location, message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}: {}: {}", self.location, self.message)
    }
}

/// Compilation aborted; carries every diagnostic from the failing phase.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{phase} failed with {} error(s):\n{}", errors(.diagnostics).count(), render(.diagnostics))]
pub struct CompileError {
    pub phase: &'static str,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(phase: &'static str, diagnostics: Vec<Diagnostic>) -> Self {
        Self { phase, diagnostics }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        errors(&self.diagnostics)
    }
}

fn errors(diagnostics: &[Diagnostic]) -> impl Iterator<Item = &Diagnostic> {
    diagnostics.iter().filter(|d| d.is_error())
}

fn render(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  - {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collects diagnostics across a phase.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.items.extend(diagnostics);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    /// End a phase: `Err` with everything collected if any error was seen,
    /// otherwise hand the warnings back.
    pub fn finish(self, phase: &'static str) -> Result<Vec<Diagnostic>, CompileError> {
        if self.has_errors() {
            Err(CompileError::new(phase, self.items))
        } else {
            Ok(self.items)
        }
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_collects_everything() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::validation("steps.a", "bad"));
        diags.push(Diagnostic::warning("steps.b", "odd"));
        diags.push(Diagnostic::validation("steps.c", "worse"));

        let err = diags.finish("validation").unwrap_err();
        assert_eq!(err.diagnostics.len(), 3);
        assert_eq!(err.errors().count(), 2);
        let text = err.to_string();
        assert!(text.contains("validation failed with 2 error(s)"));
        assert!(text.contains("steps.a: bad"));
        assert!(text.contains("steps.c: worse"));
    }

    #[test]
    fn test_finish_passes_warnings_through() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning("steps.b", "odd"));
        let warnings = diags.finish("validation").unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
