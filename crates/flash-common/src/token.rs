use serde::Serialize;

use crate::span::Span;

/// A token produced by the flash lexer.
///
/// Tokens carry the 1-based line they start on in addition to their byte
/// span: FLASH is indentation-sensitive, so the parser frequently needs to
/// know whether two tokens share a line without consulting a line index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub line: u32,
}

impl Token {
    /// Create a new token.
    pub fn new(kind: TokenKind, span: Span, line: u32) -> Self {
        Self { kind, span, line }
    }

    /// Byte offset where the token starts.
    pub fn position(&self) -> u32 {
        self.span.start
    }

    /// Whether this token is the given operator.
    pub fn is_operator(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Operator(o) if *o == op)
    }

    /// Whether this token ends the stream.
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

/// Every kind of token in the flash language.
///
/// Unlike a purely lossless lexer, token kinds carry their decoded payloads:
/// strings arrive with escapes resolved, numbers parsed, `InstanceOf:` ids
/// and urls accumulated, and indentation widths summed (space = 1, tab = 2).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    /// A name: bare identifier or back-quoted key.
    Name(String),
    /// A variable reference without its leading `$`; `""` is the input itself.
    Variable(String),
    /// An operator drawn from the fixed operator table (`.`, `:=`, `~>`, ...).
    /// Keyword operators `and`/`or`/`in` also arrive here.
    Operator(&'static str),
    /// A numeric literal (IEEE-754 double).
    Number(f64),
    /// A string literal with escapes already decoded.
    Str(String),
    /// A regex literal `/pattern/flags`. Flags are a subset of `im`.
    Regex { pattern: String, flags: String },
    /// `true` or `false`.
    Bool(bool),
    /// `null`.
    Null,
    /// A whole-token url (`http://...`, `https://...`, `urn:...`);
    /// only produced while FLASH mode is active.
    Url(String),
    /// The identifier following `InstanceOf:`.
    InstanceOf(String),
    /// Leading indentation of a line whose first content is `Instance:` or
    /// `InstanceOf:` -- a flash block header.
    BlockIndent(u32),
    /// Leading indentation of a line whose first content is `*` or `$`
    /// while FLASH mode is active -- a flash rule or bind.
    Indent(u32),
    /// End of input.
    Eof,
}

impl TokenKind {
    /// A short rendering of the token for diagnostics (the `{token}` slot
    /// in error message templates).
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Name(n) => n.clone(),
            TokenKind::Variable(v) => format!("${v}"),
            TokenKind::Operator(op) => (*op).to_string(),
            TokenKind::Number(n) => format!("{n}"),
            TokenKind::Str(s) => s.clone(),
            TokenKind::Regex { pattern, flags } => format!("/{pattern}/{flags}"),
            TokenKind::Bool(b) => format!("{b}"),
            TokenKind::Null => "null".to_string(),
            TokenKind::Url(u) => u.clone(),
            TokenKind::InstanceOf(id) => id.clone(),
            TokenKind::BlockIndent(_) => "InstanceOf:".to_string(),
            TokenKind::Indent(_) => "*".to_string(),
            TokenKind::Eof => "(end)".to_string(),
        }
    }
}
