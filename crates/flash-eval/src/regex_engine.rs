//! Regex engine abstraction and the default implementation.
//!
//! Hosts may substitute their own engine (the `RegexEngine` compile option);
//! the engine hands back [`CompiledRegex`] values whose matcher the
//! evaluator drives both for `/literal/` match closures and for FLASH
//! primitive format validation. Compiled patterns are cached per
//! compilation in the root frame, keyed by `pattern` + flags; the
//! read-compile-store cycle is idempotent so redundant compilations are
//! harmless.

use regex::Regex;

/// A single match: text, byte offsets and capture groups.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchData {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub groups: Vec<Option<String>>,
}

/// Engine-agnostic matcher interface.
pub trait PatternMatcher {
    /// Find the first match at or after `from`.
    fn find_at(&self, text: &str, from: usize) -> Option<MatchData>;

    /// Whether the whole string matches the pattern (implicit anchoring).
    fn full_match(&self, text: &str) -> bool;
}

/// A compiled regular expression.
pub struct CompiledRegex {
    pub source: String,
    pub flags: String,
    pub matcher: Box<dyn PatternMatcher>,
}

impl std::fmt::Debug for CompiledRegex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

/// Compiles patterns. `flags` is a subset of `im`.
pub trait RegexEngine {
    fn compile(&self, pattern: &str, flags: &str) -> Result<CompiledRegex, String>;
}

/// The default engine backed by the `regex` crate. Flags map to inline
/// `(?i)` / `(?m)` groups.
pub struct DefaultRegexEngine;

struct DefaultMatcher {
    finder: Regex,
    anchored: Regex,
}

impl PatternMatcher for DefaultMatcher {
    fn find_at(&self, text: &str, from: usize) -> Option<MatchData> {
        if from > text.len() {
            return None;
        }
        let caps = self.finder.captures_at(text, from)?;
        let whole = caps.get(0)?;
        let groups = (1..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
        Some(MatchData {
            text: whole.as_str().to_string(),
            start: whole.start(),
            end: whole.end(),
            groups,
        })
    }

    fn full_match(&self, text: &str) -> bool {
        self.anchored.is_match(text)
    }
}

impl RegexEngine for DefaultRegexEngine {
    fn compile(&self, pattern: &str, flags: &str) -> Result<CompiledRegex, String> {
        let mut prefix = String::new();
        if flags.contains('i') {
            prefix.push_str("(?i)");
        }
        if flags.contains('m') {
            prefix.push_str("(?m)");
        }
        let finder = Regex::new(&format!("{prefix}{pattern}"))
            .map_err(|e| e.to_string())?;
        let anchored = Regex::new(&format!("{prefix}^(?:{pattern})$"))
            .map_err(|e| e.to_string())?;
        Ok(CompiledRegex {
            source: pattern.to_string(),
            flags: flags.to_string(),
            matcher: Box::new(DefaultMatcher { finder, anchored }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(pattern: &str, flags: &str) -> CompiledRegex {
        DefaultRegexEngine.compile(pattern, flags).expect("compile failed")
    }

    #[test]
    fn find_at_reports_offsets_and_groups() {
        let re = compile("a(b+)", "");
        let m = re.matcher.find_at("xxabbby", 0).unwrap();
        assert_eq!(m.text, "abbb");
        assert_eq!(m.start, 2);
        assert_eq!(m.end, 6);
        assert_eq!(m.groups, vec![Some("bbb".to_string())]);
        assert!(re.matcher.find_at("xxabbby", 6).is_none());
    }

    #[test]
    fn case_insensitive_flag() {
        let re = compile("abc", "i");
        assert!(re.matcher.find_at("xABCx", 0).is_some());
    }

    #[test]
    fn full_match_is_anchored() {
        let re = compile("-?(0|[1-9][0-9]*)", "");
        assert!(re.matcher.full_match("42"));
        assert!(re.matcher.full_match("-7"));
        assert!(!re.matcher.full_match("042"));
        assert!(!re.matcher.full_match("42x"));
    }
}
