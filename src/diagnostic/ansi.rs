use std::fmt::Write;

use super::{Diagnostic, Label, Severity};
use crate::ast::SourceMap;

const BOLD: &str = "1";
const RED: &str = "1;31";
const CYAN: &str = "36";
const DIM: &str = "2";

/// Human-readable diagnostics for a terminal, with an optional source
/// excerpt under the primary label.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, sgr: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{sgr}m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();
        let kind = match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let head = match d.code {
            Some(code) => format!("{kind}[{code}]"),
            None => kind.to_string(),
        };
        let head = match d.severity {
            Severity::Error => self.paint(RED, &head),
            Severity::Warning => self.paint(CYAN, &self.paint(BOLD, &head)),
        };
        let _ = writeln!(out, "{head}: {}", self.paint(BOLD, &d.message));

        if let (Some(label), Some(source)) = (d.labels.iter().find(|l| l.is_primary), d.source.as_deref()) {
            self.excerpt(&mut out, label, source);
        }

        let bullet = self.paint(DIM, "=");
        for label in d.labels.iter().filter(|l| !l.is_primary && !l.message.is_empty()) {
            let _ = writeln!(out, "  {bullet} {}", label.message);
        }
        for note in &d.notes {
            let _ = writeln!(out, "  {bullet} note: {note}");
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {bullet} suggestion: {suggestion}");
        }
        out
    }

    /// `--> line:col`, the offending line and a caret run under the span.
    fn excerpt(&self, out: &mut String, label: &Label, source: &str) {
        let map = SourceMap::new(source);
        let (line, col) = map.lookup(label.span.start);
        let width = line.to_string().len();
        let pad = " ".repeat(width);
        let bar = self.paint(CYAN, "|");

        let _ = writeln!(out, "  {} {line}:{col}", self.paint(CYAN, "-->"));
        let _ = writeln!(out, "{pad} {bar}");
        let number = self.paint(CYAN, &format!("{line:>width$}"));
        let _ = writeln!(out, "{number} {bar} {}", map.line_text(source, line));

        let carets = "^".repeat(label.span.end.saturating_sub(label.span.start).max(1));
        let mut marker = format!("{}{carets}", " ".repeat(col - 1));
        if !label.message.is_empty() {
            marker.push(' ');
            marker.push_str(&label.message);
        }
        let _ = writeln!(out, "{pad} {bar} {}", self.paint(RED, &marker));
        let _ = writeln!(out, "{pad} {bar}");
    }
}
