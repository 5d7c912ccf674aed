pub mod ansi;
pub mod json;
pub mod registry;

use crate::ast::Span;
use crate::compiler::{CompileError, ModuleError};
use crate::lexer::LexError;
use crate::parser::{ParseError, SourceError};
use crate::vm::{Trap, VmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

/// One user-facing report: what went wrong, where, and what to try.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable code, explained by `regwasm --explain <code>`.
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the crate's error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        let mut d = Diagnostic::error(format!("unexpected input '{}'", e.snippet))
            .with_code(e.code)
            .with_span(e.span, "here");
        if !e.suggestion.is_empty() {
            d = d.with_suggestion(e.suggestion.clone());
        }
        d
    }
}

impl From<&ParseError> for Diagnostic {
    fn from(e: &ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

impl From<&SourceError> for Diagnostic {
    fn from(e: &SourceError) -> Self {
        match e {
            SourceError::Lex(e) => e.into(),
            SourceError::Parse(e) => e.into(),
        }
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let d = Diagnostic::error(e.to_string()).with_code(e.code());
        match e {
            CompileError::IfWithoutElseYields => d.with_suggestion("add an `else` arm that leaves a value"),
            CompileError::InconsistentStack { .. } => {
                d.with_suggestion("drop extra values or push the block result before `end`")
            }
            _ => d,
        }
    }
}

impl From<&ModuleError> for Diagnostic {
    fn from(e: &ModuleError) -> Self {
        let mut d = Diagnostic::from(&e.error);
        let what = match &e.name {
            Some(name) => format!("in function `{name}` (index {})", e.function),
            None => format!("in function {}", e.function),
        };
        if e.span.is_unknown() {
            d = d.with_note(what);
        } else {
            d = d.with_span(e.span, what);
        }
        d
    }
}

impl From<&Trap> for Diagnostic {
    fn from(e: &Trap) -> Self {
        let d = Diagnostic::error(format!("trap: {e}")).with_code(e.code());
        match e {
            Trap::GasLimitExceeded { .. } => d.with_suggestion("raise --gas-limit"),
            Trap::StepLimitExceeded { .. } => d.with_suggestion("raise --max-steps"),
            Trap::CallStackExhausted { .. } => d.with_suggestion("raise --max-call-depth or check for runaway recursion"),
            Trap::ValueSlotsExceeded { .. } => d.with_suggestion("raise --max-value-slots"),
            _ => d,
        }
    }
}

impl From<&VmError> for Diagnostic {
    fn from(e: &VmError) -> Self {
        match e {
            VmError::Load(e) => e.into(),
            VmError::Trap(t) => t.into(),
            other => Diagnostic::error(other.to_string()).with_code(other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("bad token").with_span(Span { start: 5, end: 8 }, "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!(d.labels[0].span, Span { start: 5, end: 8 });
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn from_lex_error() {
        let e = LexError {
            code: "RW-L001",
            position: 3,
            span: Span { start: 3, end: 4 },
            snippet: "#".to_string(),
            suggestion: "comments start with ';;'".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("RW-L001"));
        assert!(d.message.contains('#'));
        assert_eq!(d.labels[0].span.start, 3);
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_parse_error() {
        let e = ParseError {
            code: "RW-P003",
            position: 2,
            span: Span { start: 10, end: 15 },
            message: "undefined function `nope`".to_string(),
        };
        let d = Diagnostic::from(&SourceError::Parse(e));
        assert_eq!(d.code, Some("RW-P003"));
        assert_eq!(d.labels[0].span, Span { start: 10, end: 15 });
    }

    #[test]
    fn module_error_points_at_function() {
        let e = ModuleError {
            function: 2,
            name: Some("f".into()),
            span: Span { start: 4, end: 20 },
            error: CompileError::IfWithoutElseYields,
        };
        let d = Diagnostic::from(&VmError::Load(e));
        assert_eq!(d.code, Some("RW-C007"));
        assert!(d.labels[0].message.contains("`f`"));
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn traps_keep_their_code() {
        let d = Diagnostic::from(&VmError::Trap(Trap::DivisionByZero));
        assert_eq!(d.code, Some("RW-T002"));
        assert!(d.message.contains("division by zero"));
        assert!(d.labels.is_empty());

        let d = Diagnostic::from(&VmError::UnknownExport { name: "main".into() });
        assert_eq!(d.code, Some("RW-V003"));
    }
}
