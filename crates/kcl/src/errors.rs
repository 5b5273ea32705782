//! Diagnostic types shared by the compiler and the evaluator.
//!
//! Every fallible operation in this crate returns a [`KclError`] (aliased as
//! [`KclResult`]). Warnings are collected separately and never abort
//! evaluation; see [`Diagnostics`].

use std::fmt;

use strum::{Display, EnumString};

/// A half-open source span: `(file, line, col)` .. `(end_line, end_col)`.
///
/// Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl Span {
    #[must_use]
    pub fn new(file: impl Into<String>, line: u32, col: u32, end_line: u32, end_col: u32) -> Self {
        Self { file: file.into(), line, col, end_line, end_col }
    }

    /// A span with no useful source location (e.g. synthesized during tests).
    #[must_use]
    pub fn dummy() -> Self {
        Self::new("<unknown>", 0, 0, 0, 0)
    }
}

/// Stable diagnostic codes, one per distinct error kind a caller can match
/// on. `Display` renders the code as its own variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidSyntax,
    IndentationError,
    CompileError,
    TypeErrorCompile,
    IntOverflow,
    FloatOverflow,
    FloatUnderflow,
    IllegalArgumentError,
    IllegalArgumentErrorSyntax,
    CannotFindModule,
    CannotAddMembers,
    ImmutableCompileError,
    IndexSignatureError,
    MultiInheritError,
    CycleInheritError,
    IllegalInheritError,
    RecursionError,
    AttributeError,
    EvaluationError,
    SchemaCheckFailure,
    AssertionError,
    InvalidFormatSpec,
    InvalidDocstring,
    Deprecated,
    DeprecatedWarning,
    UnKnownDecorator,
}

/// A secondary span attached to a diagnostic, e.g. "expected `T` here" pointing
/// at a declaration while the primary span points at the offending use.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SecondarySpan {
    pub span: Span,
    pub message: String,
}

/// A single user-visible error or warning.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KclError {
    pub kind: ErrorKind,
    pub primary: Span,
    pub message: String,
    pub secondary: Vec<SecondarySpan>,
}

impl KclError {
    #[must_use]
    pub fn new(kind: ErrorKind, primary: Span, message: impl Into<String>) -> Self {
        Self { kind, primary, message: message.into(), secondary: Vec::new() }
    }

    #[must_use]
    pub fn with_secondary(mut self, span: Span, message: impl Into<String>) -> Self {
        self.secondary.push(SecondarySpan { span, message: message.into() });
        self
    }
}

impl fmt::Display for KclError {
    /// Renders one line per span followed by a caret underline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_span(f, &self.primary, &self.kind.to_string(), &self.message)?;
        for sec in &self.secondary {
            writeln!(f)?;
            render_span(f, &sec.span, &self.kind.to_string(), &sec.message)?;
        }
        Ok(())
    }
}

fn render_span(f: &mut fmt::Formatter<'_>, span: &Span, code: &str, message: &str) -> fmt::Result {
    writeln!(f, "{}:{}:{}:{code}:{message}", span.file, span.line, span.col)?;
    let indent = " ".repeat(span.col.saturating_sub(1) as usize);
    let width = span.end_col.saturating_sub(span.col).max(1) as usize;
    write!(f, "{indent}{}", "^".repeat(width))
}

impl std::error::Error for KclError {}

pub type KclResult<T> = Result<T, KclError>;

/// Non-fatal diagnostics accumulated during a compile or run: float
/// underflow, non-strict deprecation, docstring inconsistency. They are
/// reported to the caller but never interrupt compilation or evaluation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics {
    warnings: Vec<KclError>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: KclError) {
        self.warnings.push(warning);
    }

    #[must_use]
    pub fn warnings(&self) -> &[KclError] {
        &self.warnings
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_caret_under_span() {
        let err = KclError::new(
            ErrorKind::SchemaCheckFailure,
            Span::new("main.k", 7, 9, 7, 21),
            "age too large",
        );
        let rendered = err.to_string();
        assert!(rendered.contains("main.k:7:9:SchemaCheckFailure:age too large"));
        assert!(rendered.lines().nth(1).unwrap().trim_end() == " ".repeat(8) + &"^".repeat(12));
    }

    #[test]
    fn secondary_spans_render_on_following_lines() {
        let err = KclError::new(ErrorKind::TypeErrorCompile, Span::new("a.k", 1, 1, 1, 2), "expect T")
            .with_secondary(Span::new("a.k", 2, 1, 2, 2), "got U");
        let rendered = err.to_string();
        assert_eq!(rendered.lines().count(), 4);
    }
}
