//! Diagnostic reporting for GraphQL documents.

use crate::span::Span;

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    /// The document cannot be executed.
    Error,
    /// The document is executable but suspicious.
    Warning,
}

/// A label attached to a diagnostic.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

impl Label {
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

/// A diagnostic message.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    /// Stable code, see [`codes`].
    pub code: &'static str,
    /// Short title, suitable for a client-facing error message.
    pub title: String,
    pub labels: Vec<Label>,
}

impl Diagnostic {
    pub fn error(code: &'static str, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            code,
            title: title.into(),
            labels: Vec::new(),
        }
    }

    pub fn warning(code: &'static str, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            ..Self::error(code, title)
        }
    }

    /// Adds a label at a span.
    #[must_use]
    pub fn with_span(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::new(span, message));
        self
    }

    /// Returns the primary span, if any.
    pub fn primary_span(&self) -> Option<Span> {
        self.labels.first().map(|l| l.span)
    }

    /// Renders the message a GraphQL client sees: `Syntax Error: <detail>`.
    pub fn client_message(&self) -> String {
        match self.labels.first() {
            Some(label) if !label.message.is_empty() => {
                format!("Syntax Error: {}", label.message)
            }
            _ => format!("Syntax Error: {}", self.title),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// A collection of diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticBag {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Adds an error diagnostic with one label.
    pub fn error(
        &mut self,
        code: &'static str,
        title: impl Into<String>,
        span: Span,
        message: impl Into<String>,
    ) {
        self.add(Diagnostic::error(code, title).with_span(span, message));
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }
}

impl IntoIterator for DiagnosticBag {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

/// Diagnostic codes.
pub mod codes {
    pub const UNEXPECTED_TOKEN: &str = "E0001";
    pub const UNEXPECTED_EOF: &str = "E0002";
    pub const INVALID_SYNTAX: &str = "E0003";
    pub const UNTERMINATED_STRING: &str = "E0004";
    pub const INVALID_CHARACTER: &str = "E0005";
    pub const INVALID_NUMBER: &str = "E0006";
    pub const INVALID_ESCAPE: &str = "E0007";
    pub const NESTING_TOO_DEEP: &str = "E0008";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_bag() {
        let mut bag = DiagnosticBag::new();
        bag.error(codes::UNEXPECTED_TOKEN, "unexpected token", Span::new(0, 1), "Expected Name, found \"}\".");
        bag.add(Diagnostic::warning(codes::INVALID_SYNTAX, "odd"));

        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_client_message_prefers_label() {
        let diag = Diagnostic::error(codes::UNEXPECTED_EOF, "unexpected end of document")
            .with_span(Span::new(8, 8), "Expected \"}\", found <EOF>.");

        assert_eq!(diag.client_message(), "Syntax Error: Expected \"}\", found <EOF>.");
        assert_eq!(diag.primary_span(), Some(Span::new(8, 8)));
    }

    #[test]
    fn test_client_message_without_label() {
        let diag = Diagnostic::error(codes::INVALID_SYNTAX, "Unexpected character");
        assert_eq!(diag.client_message(), "Syntax Error: Unexpected character");
    }
}
