use std::ops::Range;

use serde::Serialize;

/// Byte-offset span into source text. Start is inclusive, end is exclusive.
///
/// Spans locate tokens, AST nodes and errors in the original source. Tokens
/// carry their 1-based line separately (FLASH indentation is line-oriented),
/// so full line/column pairs are only derived when a diagnostic is rendered,
/// via [`SourceLines`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    /// Create a new span from byte offsets.
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "span must not end ({end}) before it starts ({start})");
        Self { start, end }
    }

    /// A zero-width span at a single offset: synthesized end-of-input
    /// tokens and whole-expression errors (S0500, F1000) have no text of
    /// their own to cover.
    pub fn at(offset: u32) -> Self {
        Self { start: offset, end: offset }
    }

    /// Whether the span is zero-width.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The span as a byte range fit for a renderer: clamped into a source
    /// of the given length, and widened to at least one byte so that
    /// zero-width spans still point at something.
    pub fn clamped_range(&self, source_len: usize) -> Range<usize> {
        let start = (self.start as usize).min(source_len);
        let end = (self.end as usize).clamp(start, source_len);
        if start == end {
            start..(start + 1).min(source_len)
        } else {
            start..end
        }
    }
}

/// A per-line view of source text: each line's byte span plus its FLASH
/// indentation width (space = 1, tab = 2, summed over the leading run).
///
/// Built once when a diagnostic is rendered; the indent widths let
/// indentation errors report what the scanner actually measured.
#[derive(Debug)]
pub struct SourceLines {
    lines: Vec<LineInfo>,
}

#[derive(Debug, Clone, Copy)]
struct LineInfo {
    span: Span,
    indent: u32,
}

impl SourceLines {
    /// Scan the source into line records.
    pub fn new(source: &str) -> Self {
        let mut lines = Vec::new();
        let mut start = 0u32;
        let mut indent = 0u32;
        let mut in_leading_whitespace = true;
        for (i, byte) in source.bytes().enumerate() {
            match byte {
                b'\n' => {
                    lines.push(LineInfo { span: Span::new(start, i as u32), indent });
                    start = i as u32 + 1;
                    indent = 0;
                    in_leading_whitespace = true;
                }
                b' ' if in_leading_whitespace => indent += 1,
                b'\t' if in_leading_whitespace => indent += 2,
                b'\r' => {}
                _ => in_leading_whitespace = false,
            }
        }
        lines.push(LineInfo {
            span: Span::new(start, source.len() as u32),
            indent,
        });
        Self { lines }
    }

    /// Convert a byte offset to a 1-based (line, column) pair. Column is
    /// measured in bytes from the start of the line.
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        // Insertion point of the first line starting past the offset; the
        // offset's own line is the one before it.
        let insertion = self
            .lines
            .binary_search_by(|info| {
                if info.span.start <= offset {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_err();
        let idx = insertion.saturating_sub(1);
        let info = &self.lines[idx];
        (idx as u32 + 1, offset.saturating_sub(info.span.start) + 1)
    }

    /// The FLASH indentation width of a 1-based line.
    pub fn indent_of(&self, line: u32) -> Option<u32> {
        let idx = line.checked_sub(1)? as usize;
        self.lines.get(idx).map(|info| info.indent)
    }

    /// Number of lines in the source.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_width_spans() {
        assert!(Span::at(3).is_empty());
        assert!(!Span::new(3, 5).is_empty());
    }

    #[test]
    fn clamped_range_stays_renderable() {
        // In bounds.
        assert_eq!(Span::new(1, 4).clamped_range(10), 1..4);
        // Zero-width spans widen to one byte.
        assert_eq!(Span::at(2).clamped_range(10), 2..3);
        // Out-of-bounds spans clamp to the source.
        assert_eq!(Span::new(8, 20).clamped_range(10), 8..10);
        // A zero-width span at the very end cannot widen.
        assert_eq!(Span::at(10).clamped_range(10), 10..10);
    }

    #[test]
    fn line_col_lookup() {
        let lines = SourceLines::new("one\ntwo\nthree");
        assert_eq!(lines.line_count(), 3);
        assert_eq!(lines.line_col(0), (1, 1));
        assert_eq!(lines.line_col(4), (2, 1));
        assert_eq!(lines.line_col(10), (3, 3));
    }

    #[test]
    fn indent_measures_spaces_and_tabs() {
        let lines = SourceLines::new("a\n  * two\n\t* tab\n    $ four");
        assert_eq!(lines.indent_of(1), Some(0));
        assert_eq!(lines.indent_of(2), Some(2));
        // Tabs count double.
        assert_eq!(lines.indent_of(3), Some(2));
        assert_eq!(lines.indent_of(4), Some(4));
        assert_eq!(lines.indent_of(5), None);
    }

    #[test]
    fn indent_stops_at_first_content() {
        let lines = SourceLines::new("  a  b");
        assert_eq!(lines.indent_of(1), Some(2));
    }

    #[test]
    fn empty_source_has_one_empty_line() {
        let lines = SourceLines::new("");
        assert_eq!(lines.line_count(), 1);
        assert_eq!(lines.line_col(0), (1, 1));
        assert_eq!(lines.indent_of(1), Some(0));
    }
}
