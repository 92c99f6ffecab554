//! Ariadne-based rendering of error records against source text.
//!
//! Rendering is a presentation concern: the engine's behavior depends only on
//! the [`Error`] record itself. Hosts that want terminal-friendly output call
//! [`render`] with the original source.

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use crate::error::Error;
use crate::span::SourceLines;

/// Error codes raised by the FLASH indentation discipline; their reports
/// include the measured indent of the offending line.
const INDENT_CODES: &[&str] = &["F1014", "F1016", "F1017", "F1021"];

/// Render an error as a labeled, colorless diagnostic string.
pub fn render(error: &Error, source: &str) -> String {
    let config = Config::default().with_color(false);
    let range = error.span.clamped_range(source.len());

    let mut builder = Report::build(ReportKind::Error, range.clone())
        .with_code(error.code)
        .with_message(error.message())
        .with_config(config);
    builder.add_label(
        Label::new(range)
            .with_message(error.message())
            .with_color(Color::Red),
    );

    // Indentation errors also report what the scanner measured.
    if INDENT_CODES.contains(&error.code) {
        let lines = SourceLines::new(source);
        if let Some(indent) = lines.indent_of(error.line) {
            builder.set_help(format!(
                "line {} is indented {indent} units (space = 1, tab = 2)",
                error.line
            ));
        }
    }

    let report = builder.finish();
    let mut buf = Vec::new();
    let cache = Source::from(source);
    report
        .write(cache, &mut buf)
        .expect("failed to write diagnostic");
    String::from_utf8(buf).expect("diagnostic output should be valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    #[test]
    fn render_contains_code_and_message() {
        let source = "foo ??? bar";
        let err = Error::new("S0204", Span::new(4, 7), 1).with_token("???");
        let out = render(&err, source);
        assert!(out.contains("S0204"), "missing code in: {out}");
        assert!(out.contains("Unknown operator: ???"), "missing message in: {out}");
    }

    #[test]
    fn render_handles_span_at_end_of_source() {
        let source = "abc";
        let err = Error::new("S0207", Span::at(3), 1);
        let out = render(&err, source);
        assert!(out.contains("S0207"));
    }

    #[test]
    fn indent_errors_report_the_measured_indent() {
        let source = "InstanceOf: Patient\n* name\n   * given = 'x'\n";
        // The odd indent on line 3.
        let err = Error::new("F1021", Span::new(27, 30), 3);
        let out = render(&err, source);
        assert!(
            out.contains("line 3 is indented 3 units"),
            "missing indent help in: {out}"
        );
    }
}
