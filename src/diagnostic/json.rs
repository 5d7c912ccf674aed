use serde::Serialize;

use super::{Diagnostic, Label, Severity};
use crate::ast::SourceMap;

#[derive(Serialize)]
struct JsonLabel<'a> {
    start: usize,
    end: usize,
    message: &'a str,
    primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    col: Option<usize>,
}

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: &'a str,
    labels: Vec<JsonLabel<'a>>,
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

fn label<'a>(l: &'a Label, map: Option<&SourceMap>) -> JsonLabel<'a> {
    let position = map.map(|m| m.lookup(l.span.start));
    JsonLabel {
        start: l.span.start,
        end: l.span.end,
        message: &l.message,
        primary: l.is_primary,
        line: position.map(|(line, _)| line),
        col: position.map(|(_, col)| col),
    }
}

/// One diagnostic as a single-line JSON object (`--json`). Labels carry
/// 1-based line and column when the listing is attached.
pub fn render(d: &Diagnostic) -> String {
    let map = d.source.as_deref().map(SourceMap::new);
    let out = JsonDiagnostic {
        severity: match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        },
        code: d.code,
        message: &d.message,
        labels: d.labels.iter().map(|l| label(l, map.as_ref())).collect(),
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
    };
    serde_json::to_string(&out)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"diagnostic could not be serialized"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("trap: unreachable executed").with_code("RW-T001")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["code"], "RW-T001");
        assert_eq!(v["message"], "trap: unreachable executed");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn labels_get_line_and_column_with_source() {
        let d = Diagnostic::error("undefined function `g`")
            .with_span(Span { start: 14, end: 15 }, "here")
            .with_source("memory 1\nfunc g");
        let v = parse_json(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 14);
        assert_eq!(label["primary"], true);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 6);
    }

    #[test]
    fn labels_without_source_have_no_position() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d));
        assert!(v["labels"][0].get("line").is_none());
    }

    #[test]
    fn notes_suggestion_and_severity() {
        let d = Diagnostic::warning("bad")
            .with_note("in function 0")
            .with_secondary_span(Span { start: 0, end: 1 }, "related")
            .with_suggestion("raise --gas-limit");
        let v = parse_json(&render(&d));
        assert_eq!(v["severity"], "warning");
        assert_eq!(v["notes"][0], "in function 0");
        assert_eq!(v["labels"][0]["primary"], false);
        assert_eq!(v["suggestion"], "raise --gas-limit");
    }
}
