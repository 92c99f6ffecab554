//! Tokenizer for the flash expression language.
//!
//! A pull scanner: the parser requests one token at a time via
//! [`Tokenizer::next_token`], passing `prefix = true` when an operand is
//! expected so that `/` starts a regex literal instead of being division.
//!
//! Beyond the query-language core, the scanner tracks per-line indentation
//! (space = 1, tab = 2) for the FLASH sublanguage: a line whose first content
//! is `Instance:` or `InstanceOf:` is preceded by a `BlockIndent` token, and
//! once FLASH mode is active a line-leading `*` or `$` is preceded by an
//! `Indent` token. FLASH mode also enables whole-token urls and turns the
//! line-leading `*` into the `flashrule` operator.

mod cursor;

use cursor::Cursor;
use flash_common::{Error, Result, Span, Token, TokenKind};

/// Two-character operators, checked before single-character ones.
const DOUBLE_OPERATORS: &[&str] = &[
    ":=", "!=", ">=", "<=", "**", "..", "~>", "??", "?:",
];

/// Single-character operator set.
const SINGLE_OPERATORS: &[(char, &'static str)] = &[
    ('.', "."),
    ('[', "["),
    (']', "]"),
    ('{', "{"),
    ('}', "}"),
    ('(', "("),
    (')', ")"),
    (',', ","),
    ('@', "@"),
    ('#', "#"),
    (';', ";"),
    (':', ":"),
    ('?', "?"),
    ('+', "+"),
    ('-', "-"),
    ('*', "*"),
    ('/', "/"),
    ('%', "%"),
    ('|', "|"),
    ('=', "="),
    ('<', "<"),
    ('>', ">"),
    ('^', "^"),
    ('&', "&"),
    ('!', "!"),
];

/// Whether a character terminates a bare name.
fn is_name_terminator(c: char) -> bool {
    c.is_whitespace()
        || c == '"'
        || c == '\''
        || c == '`'
        || c == '$'
        || SINGLE_OPERATORS.iter().any(|(op, _)| *op == c)
}

/// The flash tokenizer. Produces one token per call, `None` at end of input.
pub struct Tokenizer<'src> {
    cursor: Cursor<'src>,
    source: &'src str,
    /// 1-based line of the next character.
    line: u32,
    /// Accumulated leading indentation of the current line.
    indent: u32,
    /// Whether the current line has produced any content yet.
    line_has_content: bool,
    /// Set once any `Instance:` / `InstanceOf:` has been seen.
    flash_active: bool,
    /// The next `*` is a line-leading flash rule marker.
    pending_flashrule: bool,
}

impl<'src> Tokenizer<'src> {
    /// Create a tokenizer over the given source text.
    pub fn new(source: &'src str) -> Self {
        Self {
            cursor: Cursor::new(source),
            source,
            line: 1,
            indent: 0,
            line_has_content: false,
            flash_active: false,
            pending_flashrule: false,
        }
    }

    /// Convenience for tests: tokenize everything with `prefix = false`.
    ///
    /// Regex literals only lex in prefix position, so this is not suitable
    /// for sources containing them; the parser drives the real prefix flag.
    pub fn tokenize(source: &'src str) -> Result<Vec<Token>> {
        let mut tok = Tokenizer::new(source);
        let mut out = Vec::new();
        while let Some(t) = tok.next_token(false)? {
            out.push(t);
        }
        Ok(out)
    }

    /// Whether FLASH mode has been activated by an `Instance:` or
    /// `InstanceOf:` declaration.
    pub fn flash_active(&self) -> bool {
        self.flash_active
    }

    /// Produce the next token, or `None` at end of input.
    ///
    /// `prefix` is true when the parser expects an operand; it enables
    /// regex literals at `/`.
    pub fn next_token(&mut self, prefix: bool) -> Result<Option<Token>> {
        self.skip_trivia()?;

        let start = self.cursor.pos();
        let Some(c) = self.cursor.peek() else {
            return Ok(None);
        };

        // ── Line-leading FLASH markers ─────────────────────────────────
        if !self.line_has_content {
            if self.cursor.starts_with("InstanceOf:") || self.cursor.starts_with("Instance:") {
                self.flash_active = true;
                self.line_has_content = true;
                return Ok(Some(self.token(TokenKind::BlockIndent(self.indent), start)));
            }
            if self.flash_active && (c == '*' || c == '$') {
                self.line_has_content = true;
                if c == '*' {
                    self.pending_flashrule = true;
                }
                return Ok(Some(self.token(TokenKind::Indent(self.indent), start)));
            }
        }
        self.line_has_content = true;

        // ── FLASH declarations (anywhere in a line) ────────────────────
        if self.cursor.starts_with("InstanceOf:") {
            self.flash_active = true;
            for _ in 0.."InstanceOf:".len() {
                self.cursor.advance();
            }
            self.cursor.eat_while(|ch| ch == ' ' || ch == '\t');
            let id_start = self.cursor.pos();
            self.cursor.eat_while(|ch| !ch.is_whitespace() && ch != ')');
            let id = self.slice(id_start, self.cursor.pos());
            return Ok(Some(self.token(TokenKind::InstanceOf(id), start)));
        }
        if self.cursor.starts_with("Instance:") {
            self.flash_active = true;
            for _ in 0.."Instance:".len() {
                self.cursor.advance();
            }
            return Ok(Some(self.token(TokenKind::Operator("Instance:"), start)));
        }

        // ── Urls (FLASH mode only) ─────────────────────────────────────
        if self.flash_active
            && (self.cursor.starts_with("http://")
                || self.cursor.starts_with("https://")
                || self.cursor.starts_with("urn:"))
        {
            self.cursor.eat_while(|ch| !ch.is_whitespace() && ch != ')');
            let url = self.slice(start, self.cursor.pos());
            return Ok(Some(self.token(TokenKind::Url(url), start)));
        }

        // ── Regex literal (prefix position only) ───────────────────────
        if prefix && c == '/' {
            return self.lex_regex(start).map(Some);
        }

        // ── Flash rule marker ──────────────────────────────────────────
        if c == '*' && self.pending_flashrule {
            self.pending_flashrule = false;
            self.cursor.advance();
            return Ok(Some(self.token(TokenKind::Operator("flashrule"), start)));
        }

        // ── Two-character operators ────────────────────────────────────
        for op in DOUBLE_OPERATORS {
            if self.cursor.starts_with(op) {
                self.cursor.advance();
                self.cursor.advance();
                return Ok(Some(self.token(TokenKind::Operator(op), start)));
            }
        }

        // ── Single-character operators ─────────────────────────────────
        if let Some((_, op)) = SINGLE_OPERATORS.iter().find(|(ch, _)| *ch == c) {
            self.cursor.advance();
            return Ok(Some(self.token(TokenKind::Operator(op), start)));
        }

        // `~` only exists as part of `~>`.
        if c == '~' {
            self.cursor.advance();
            return Err(self.error("S0204", start).with_token("~"));
        }

        // ── Strings ────────────────────────────────────────────────────
        if c == '"' || c == '\'' {
            return self.lex_string(start).map(Some);
        }

        // ── Back-quoted names ──────────────────────────────────────────
        if c == '`' {
            self.cursor.advance();
            let name_start = self.cursor.pos();
            self.cursor.eat_while(|ch| ch != '`');
            if self.cursor.peek().is_none() {
                return Err(self.error("S0105", start));
            }
            let name = self.slice(name_start, self.cursor.pos());
            self.cursor.advance(); // closing backquote
            return Ok(Some(self.token(TokenKind::Name(name), start)));
        }

        // ── Numbers ────────────────────────────────────────────────────
        if c.is_ascii_digit() {
            return self.lex_number(start).map(Some);
        }

        // ── Variables ──────────────────────────────────────────────────
        if c == '$' {
            self.cursor.advance();
            let name_start = self.cursor.pos();
            self.cursor.eat_while(|ch| !is_name_terminator(ch));
            let name = self.slice(name_start, self.cursor.pos());
            return Ok(Some(self.token(TokenKind::Variable(name), start)));
        }

        // ── Names and keyword operators / values ───────────────────────
        self.cursor.eat_while(|ch| !is_name_terminator(ch));
        let name = self.slice(start, self.cursor.pos());
        let kind = match name.as_str() {
            "and" => TokenKind::Operator("and"),
            "or" => TokenKind::Operator("or"),
            "in" => TokenKind::Operator("in"),
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            _ => TokenKind::Name(name),
        };
        Ok(Some(self.token(kind, start)))
    }

    // ── Trivia ─────────────────────────────────────────────────────────

    /// Skip whitespace and comments, maintaining line/indent accounting.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.cursor.peek() {
                Some(' ') => {
                    if !self.line_has_content {
                        self.indent += 1;
                    }
                    self.cursor.advance();
                }
                Some('\t') => {
                    if !self.line_has_content {
                        self.indent += 2;
                    }
                    self.cursor.advance();
                }
                Some('\u{000B}') => {
                    self.cursor.advance();
                }
                Some('\n') => {
                    self.cursor.advance();
                    self.newline();
                }
                Some('\r') => {
                    self.cursor.advance();
                    if self.cursor.peek() == Some('\n') {
                        self.cursor.advance();
                    }
                    self.newline();
                }
                Some('/') if self.cursor.peek2() == Some('*') => {
                    let start = self.cursor.pos();
                    self.cursor.advance();
                    self.cursor.advance();
                    loop {
                        match self.cursor.peek() {
                            None => return Err(self.error("S0106", start)),
                            Some('*') if self.cursor.peek2() == Some('/') => {
                                self.cursor.advance();
                                self.cursor.advance();
                                break;
                            }
                            Some('\n') => {
                                self.cursor.advance();
                                self.newline();
                            }
                            Some(_) => {
                                self.cursor.advance();
                            }
                        }
                    }
                }
                Some('/') if self.cursor.peek2() == Some('/') => {
                    self.cursor.eat_while(|ch| ch != '\n' && ch != '\r');
                }
                _ => return Ok(()),
            }
        }
    }

    fn newline(&mut self) {
        self.line += 1;
        self.indent = 0;
        self.line_has_content = false;
    }

    // ── Literals ───────────────────────────────────────────────────────

    /// Lex a string literal starting at the opening quote.
    fn lex_string(&mut self, start: u32) -> Result<Token> {
        let quote = self.cursor.advance().expect("caller saw the quote");
        let mut value = String::new();
        loop {
            let Some(c) = self.cursor.advance() else {
                return Err(self.error("S0101", start));
            };
            if c == quote {
                return Ok(self.token(TokenKind::Str(value), start));
            }
            match c {
                '\\' => {
                    let Some(esc) = self.cursor.advance() else {
                        return Err(self.error("S0101", start));
                    };
                    match esc {
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        '/' => value.push('/'),
                        'b' => value.push('\u{0008}'),
                        'f' => value.push('\u{000C}'),
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        'u' => {
                            let cp = self.lex_unicode_escape(start)?;
                            value.push(cp);
                        }
                        other => {
                            return Err(self
                                .error("S0103", start)
                                .with_token(other.to_string()));
                        }
                    }
                }
                '\n' => {
                    self.line += 1;
                    value.push('\n');
                }
                other => value.push(other),
            }
        }
    }

    /// Lex the `XXXX` of a `\uXXXX` escape, combining surrogate pairs.
    fn lex_unicode_escape(&mut self, start: u32) -> Result<char> {
        let high = self.lex_hex4(start)?;
        if (0xD800..=0xDBFF).contains(&high) {
            // Expect a low surrogate escape to complete the pair.
            if self.cursor.starts_with("\\u") {
                self.cursor.advance();
                self.cursor.advance();
                let low = self.lex_hex4(start)?;
                if (0xDC00..=0xDFFF).contains(&low) {
                    let cp = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    if let Some(c) = char::from_u32(cp) {
                        return Ok(c);
                    }
                }
            }
            return Err(self.error("S0104", start));
        }
        char::from_u32(high).ok_or_else(|| self.error("S0104", start))
    }

    fn lex_hex4(&mut self, start: u32) -> Result<u32> {
        let mut cp: u32 = 0;
        for _ in 0..4 {
            let Some(c) = self.cursor.advance() else {
                return Err(self.error("S0104", start));
            };
            let Some(digit) = c.to_digit(16) else {
                return Err(self.error("S0104", start));
            };
            cp = cp * 16 + digit;
        }
        Ok(cp)
    }

    /// Lex a number starting at a digit: `(0|[1-9][0-9]*)(\.[0-9]+)?([eE][-+]?[0-9]+)?`.
    fn lex_number(&mut self, start: u32) -> Result<Token> {
        let rest = self.cursor.rest();
        let len = scan_number(rest);
        for _ in 0..len {
            self.cursor.advance();
        }
        let text = self.slice(start, self.cursor.pos());
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(self.token(TokenKind::Number(n), start)),
            _ => Err(self.error("S0102", start).with_token(text)),
        }
    }

    /// Lex a regex literal starting at the opening `/`.
    fn lex_regex(&mut self, start: u32) -> Result<Token> {
        self.cursor.advance(); // opening /
        let pattern_start = self.cursor.pos();
        let mut depth: u32 = 0;
        loop {
            match self.cursor.peek() {
                None => return Err(self.error("S0302", start)),
                Some('/') if depth == 0 => break,
                Some('\\') => {
                    self.cursor.advance();
                    if self.cursor.advance().is_none() {
                        return Err(self.error("S0302", start));
                    }
                }
                Some(c) => {
                    match c {
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' | '}' => depth = depth.saturating_sub(1),
                        '\n' => self.line += 1,
                        _ => {}
                    }
                    self.cursor.advance();
                }
            }
        }
        let pattern = self.slice(pattern_start, self.cursor.pos());
        self.cursor.advance(); // closing /
        if pattern.is_empty() {
            return Err(self.error("S0301", start));
        }
        let flags_start = self.cursor.pos();
        self.cursor.eat_while(|c| c == 'i' || c == 'm');
        let flags = self.slice(flags_start, self.cursor.pos());
        Ok(self.token(TokenKind::Regex { pattern, flags }, start))
    }

    // ── Helpers ────────────────────────────────────────────────────────

    fn slice(&self, start: u32, end: u32) -> String {
        self.source[start as usize..end as usize].to_string()
    }

    fn token(&self, kind: TokenKind, start: u32) -> Token {
        Token::new(kind, Span::new(start, self.cursor.pos()), self.line)
    }

    fn error(&self, code: &'static str, start: u32) -> Error {
        Error::new(code, Span::new(start, self.cursor.pos()), self.line)
    }
}

/// Length in bytes of the leading number in `s`, per the number shape
/// `(0|[1-9][0-9]*)(\.[0-9]+)?([eE][-+]?[0-9]+)?`. `s` starts at a digit.
fn scan_number(s: &str) -> usize {
    let b = s.as_bytes();
    let mut i = 0;

    // Integer part: a lone 0, or a nonzero digit run.
    if b[0] == b'0' {
        i = 1;
    } else {
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
    }

    // Fraction: only if the dot is followed by a digit (otherwise the dot
    // belongs to a path or range operator).
    if i < b.len() && b[i] == b'.' && i + 1 < b.len() && b[i + 1].is_ascii_digit() {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
    }

    // Exponent: only if digits follow the (optionally signed) e.
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            i = j;
            while i < b.len() && b[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    i
}
