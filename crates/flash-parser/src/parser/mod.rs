//! Top-down operator-precedence (Pratt) parser.
//!
//! The parser pulls tokens one at a time from the lexer, telling it whether
//! the next token sits in operand position (`infix = false`, regex literals
//! allowed) or operator position (`infix = true`). Each token kind has a
//! left binding power; operand forms are parsed by [`Parser::nud`] and infix
//! forms by [`Parser::led`], with the core loop in [`Parser::expression`].
//!
//! FLASH headers and rules are recognized here too (see the `flash`
//! submodule); the raw tree they produce is normalized by `process`.

pub(crate) mod flash;

use std::rc::Rc;

use flash_common::{Error, Result, Span, Token, TokenKind};
use flash_lexer::Tokenizer;

use crate::ast::{Node, NodeKind, NodeRef, SortTerm};

/// The parser state: the lexer plus a one-token lookahead.
pub struct Parser<'src> {
    lexer: Tokenizer<'src>,
    current: Token,
    source_len: u32,
    /// Indent of the flash rule currently being parsed, if any. Used to
    /// compute the root level of inline `InstanceOf:` blocks.
    pub(crate) flash_rule_indent: Option<u32>,
}

impl<'src> Parser<'src> {
    /// Create a parser and prime the lookahead.
    pub fn new(source: &'src str) -> Result<Self> {
        let mut lexer = Tokenizer::new(source);
        let source_len = source.len() as u32;
        let current = match lexer.next_token(true)? {
            Some(tok) => tok,
            None => Token::new(TokenKind::Eof, Span::at(source_len), 1),
        };
        Ok(Self {
            lexer,
            current,
            source_len,
            flash_rule_indent: None,
        })
    }

    /// Parse the whole source as a single expression.
    pub fn parse(&mut self) -> Result<NodeRef> {
        let expr = self.expression(0)?;
        if !self.current.is_eof() {
            return Err(self.error_here("S0201").with_token(self.current.kind.describe()));
        }
        Ok(expr)
    }

    /// Whether the lexer has seen any FLASH declaration.
    pub fn contains_flash(&self) -> bool {
        self.lexer.flash_active()
    }

    // ── Token plumbing ─────────────────────────────────────────────────

    /// Move to the next token. `expected` asserts the current token first
    /// (S0202 on mismatch); `infix` tells the lexer whether the next token
    /// is in operator position (no regex literals).
    pub(crate) fn advance(&mut self, expected: Option<&str>, infix: bool) -> Result<()> {
        if let Some(id) = expected {
            if !self.current.is_operator(id) {
                let code = if self.current.is_eof() { "S0203" } else { "S0202" };
                return Err(self
                    .error_here(code)
                    .with_value(id)
                    .with_token(self.current.kind.describe()));
            }
        }
        self.current = match self.lexer.next_token(!infix)? {
            Some(tok) => tok,
            None => Token::new(
                TokenKind::Eof,
                Span::at(self.source_len),
                self.current.line,
            ),
        };
        Ok(())
    }

    /// Left binding power of a token.
    fn lbp(&self, token: &Token) -> u8 {
        match &token.kind {
            TokenKind::Operator(op) => match *op {
                "[" | "(" | "@" | "#" => 80,
                "." => 75,
                "{" => 70,
                "*" | "/" | "%" => 60,
                "+" | "-" | "&" => 50,
                "=" | "<" | ">" | "^" | "!=" | "<=" | ">=" | "~>" | "in" | "??" => 40,
                "and" => 30,
                "or" => 25,
                "?" | "?:" => 20,
                ":=" => 10,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Parse an expression with the given right binding power.
    pub(crate) fn expression(&mut self, rbp: u8) -> Result<NodeRef> {
        let t = self.current.clone();
        self.advance(None, true)?;
        let mut left = self.nud(t)?;
        while rbp < self.lbp(&self.current) {
            let t = self.current.clone();
            self.advance(None, false)?;
            left = self.led(t, left)?;
        }
        Ok(left)
    }

    // ── Null denotations (operand position) ────────────────────────────

    fn nud(&mut self, t: Token) -> Result<NodeRef> {
        let span = t.span;
        let line = t.line;
        let node = |kind| Node::new(kind, span, line).rc();
        match t.kind {
            TokenKind::Number(n) => Ok(node(NodeKind::Number(n))),
            TokenKind::Str(s) => Ok(node(NodeKind::Str(s))),
            TokenKind::Bool(b) => Ok(node(NodeKind::Bool(b))),
            TokenKind::Null => Ok(node(NodeKind::Null)),
            TokenKind::Regex { pattern, flags } => {
                Ok(node(NodeKind::Regex { pattern, flags }))
            }
            TokenKind::Name(n) => Ok(node(NodeKind::Name(n))),
            TokenKind::Variable(v) => Ok(node(NodeKind::Variable(v))),
            // A whole-token url is a string value in expression position.
            TokenKind::Url(u) => Ok(node(NodeKind::Str(u))),
            TokenKind::BlockIndent(indent) => flash::parse_flash_header(self, indent, span, line),
            TokenKind::InstanceOf(id) => {
                // Inline block: `$x := (InstanceOf: ...)`. Rules sit two
                // deeper than the enclosing rule, or at the margin.
                let root = self.flash_rule_indent.map(|i| i + 2).unwrap_or(0);
                flash::parse_flash_body(self, None, id, root, span, line)
            }
            TokenKind::Operator(op) => match op {
                "-" => {
                    let expr = self.expression(70)?;
                    Ok(node(NodeKind::Neg(expr)))
                }
                "*" => Ok(node(NodeKind::Wildcard)),
                "**" => Ok(node(NodeKind::Descendant)),
                "%" => Ok(node(NodeKind::Parent(None))),
                "?" => Ok(node(NodeKind::Placeholder)),
                "(" => self.parse_block(span, line),
                "[" => self.parse_array_constructor(span, line),
                "{" => {
                    let pairs = self.parse_object_pairs()?;
                    Ok(node(NodeKind::ObjectConstructor { pairs }))
                }
                "|" => self.parse_transform(span, line),
                "Instance:" => flash::parse_instance_declaration(self, None, span, line),
                "flashrule" => Err(Error::new("F1009", span, line)),
                _ => Err(Error::new("S0211", span, line).with_token(op)),
            },
            TokenKind::Indent(_) => Err(Error::new("F1009", span, line)),
            TokenKind::Eof => Err(Error::new("S0207", span, line)),
        }
    }

    /// `( expr ; expr ; ... )`
    fn parse_block(&mut self, span: Span, line: u32) -> Result<NodeRef> {
        let mut exprs = Vec::new();
        while !self.current.is_operator(")") {
            exprs.push(self.expression(0)?);
            if self.current.is_operator(";") {
                self.advance(Some(";"), false)?;
            } else {
                break;
            }
        }
        self.advance(Some(")"), true)?;
        Ok(Node::new(NodeKind::Block { exprs }, span, line).rc())
    }

    /// `[ item, item, ... ]` with `item .. item` ranges.
    fn parse_array_constructor(&mut self, span: Span, line: u32) -> Result<NodeRef> {
        let mut items = Vec::new();
        if !self.current.is_operator("]") {
            loop {
                let mut item = self.expression(0)?;
                if self.current.is_operator("..") {
                    let range_span = self.current.span;
                    let range_line = self.current.line;
                    self.advance(Some(".."), false)?;
                    let rhs = self.expression(0)?;
                    item = Node::new(
                        NodeKind::Binary { op: "..", lhs: item, rhs },
                        range_span,
                        range_line,
                    )
                    .rc();
                }
                items.push(item);
                if self.current.is_operator(",") {
                    self.advance(Some(","), false)?;
                } else {
                    break;
                }
            }
        }
        self.advance(Some("]"), true)?;
        Ok(Node::new(NodeKind::ArrayConstructor { items }, span, line).rc())
    }

    /// `key : value, ...` up to and including the closing `}`.
    fn parse_object_pairs(&mut self) -> Result<Vec<(NodeRef, NodeRef)>> {
        let mut pairs = Vec::new();
        if !self.current.is_operator("}") {
            loop {
                let key = self.expression(0)?;
                self.advance(Some(":"), false)?;
                let value = self.expression(0)?;
                pairs.push((key, value));
                if self.current.is_operator(",") {
                    self.advance(Some(","), false)?;
                } else {
                    break;
                }
            }
        }
        self.advance(Some("}"), true)?;
        Ok(pairs)
    }

    /// `| pattern | update [, delete] |`
    fn parse_transform(&mut self, span: Span, line: u32) -> Result<NodeRef> {
        let pattern = self.expression(0)?;
        self.advance(Some("|"), false)?;
        let update = self.expression(0)?;
        let delete = if self.current.is_operator(",") {
            self.advance(Some(","), false)?;
            Some(self.expression(0)?)
        } else {
            None
        };
        self.advance(Some("|"), true)?;
        Ok(Node::new(NodeKind::Transform { pattern, update, delete }, span, line).rc())
    }

    // ── Left denotations (operator position) ───────────────────────────

    fn led(&mut self, t: Token, left: NodeRef) -> Result<NodeRef> {
        let span = t.span;
        let line = t.line;
        let TokenKind::Operator(op) = t.kind else {
            return Err(Error::new("S0201", span, line).with_token(t.kind.describe()));
        };
        let binary = |op: &'static str, lhs: NodeRef, rhs: NodeRef| {
            Node::new(NodeKind::Binary { op, lhs, rhs }, span, line).rc()
        };
        match op {
            "." => {
                let rhs = self.expression(75)?;
                Ok(binary(".", left, rhs))
            }
            "*" | "/" | "%" => {
                let rhs = self.expression(60)?;
                Ok(binary(op_static(op), left, rhs))
            }
            "+" | "-" | "&" => {
                let rhs = self.expression(50)?;
                Ok(binary(op_static(op), left, rhs))
            }
            "=" | "<" | ">" | "!=" | "<=" | ">=" | "in" => {
                let rhs = self.expression(40)?;
                Ok(binary(op_static(op), left, rhs))
            }
            "and" => {
                let rhs = self.expression(30)?;
                Ok(binary("and", left, rhs))
            }
            "or" => {
                let rhs = self.expression(25)?;
                Ok(binary("or", left, rhs))
            }
            "??" => {
                let rhs = self.expression(40)?;
                Ok(Node::new(NodeKind::Coalesce { lhs: left, rhs }, span, line).rc())
            }
            "?:" => {
                let rhs = self.expression(20)?;
                Ok(Node::new(NodeKind::Elvis { lhs: left, rhs }, span, line).rc())
            }
            "~>" => {
                let rhs = self.expression(40)?;
                Ok(binary("~>", left, rhs))
            }
            ":=" => {
                if !matches!(left.kind, NodeKind::Variable(_)) {
                    return Err(Error::new("S0212", span, line));
                }
                let value = self.expression(9)?;
                Ok(Node::new(NodeKind::Bind { var: left, value }, span, line).rc())
            }
            "?" => {
                let then = self.expression(0)?;
                let otherwise = if self.current.is_operator(":") {
                    self.advance(Some(":"), false)?;
                    Some(self.expression(0)?)
                } else {
                    None
                };
                Ok(Node::new(
                    NodeKind::Condition { condition: left, then, otherwise },
                    span,
                    line,
                )
                .rc())
            }
            "(" => self.parse_call_or_lambda(left, span, line),
            "[" => {
                if self.current.is_operator("]") {
                    // Empty predicate: keep the innermost step a singleton
                    // array rather than filtering.
                    let mut left = left;
                    mark_keep_array(&mut left);
                    self.advance(Some("]"), true)?;
                    return Ok(left);
                }
                let rhs = self.expression(0)?;
                self.advance(Some("]"), true)?;
                Ok(binary("[", left, rhs))
            }
            "{" => {
                let pairs = self.parse_object_pairs()?;
                Ok(Node::new(NodeKind::GroupBy { lhs: left, pairs }, span, line).rc())
            }
            "^" => {
                self.advance(Some("("), false)?;
                let mut terms = Vec::new();
                loop {
                    let mut descending = false;
                    if self.current.is_operator("<") {
                        self.advance(Some("<"), false)?;
                    } else if self.current.is_operator(">") {
                        descending = true;
                        self.advance(Some(">"), false)?;
                    }
                    let expression = self.expression(0)?;
                    terms.push(SortTerm { expression, descending });
                    if self.current.is_operator(",") {
                        self.advance(Some(","), false)?;
                    } else {
                        break;
                    }
                }
                self.advance(Some(")"), true)?;
                Ok(Node::new(NodeKind::OrderBy { lhs: left, terms }, span, line).rc())
            }
            "@" | "#" => {
                let rhs = self.expression(80)?;
                if !matches!(rhs.kind, NodeKind::Variable(_)) {
                    return Err(Error::new("S0214", span, line).with_token(op_static(op)));
                }
                Ok(binary(op_static(op), left, rhs))
            }
            other => Err(Error::new("S0204", span, line).with_token(other)),
        }
    }

    /// `left( args )`: a function invocation, or a lambda definition when
    /// the callee is the literal name `function` (or `λ`).
    fn parse_call_or_lambda(&mut self, left: NodeRef, span: Span, line: u32) -> Result<NodeRef> {
        let mut args = Vec::new();
        if !self.current.is_operator(")") {
            loop {
                args.push(self.expression(0)?);
                if self.current.is_operator(",") {
                    self.advance(Some(","), false)?;
                } else {
                    break;
                }
            }
        }
        self.advance(Some(")"), true)?;

        let is_lambda_def =
            matches!(&left.kind, NodeKind::Name(n) if n == "function" || n == "λ");
        if is_lambda_def {
            // Parameters must all be variables.
            let mut params = Vec::new();
            for arg in &args {
                match &arg.kind {
                    NodeKind::Variable(v) => params.push(v.clone()),
                    _ => {
                        return Err(Error::new("S0208", arg.span, arg.line)
                            .with_value(describe_node(arg)));
                    }
                }
            }
            let signature = if self.current.is_operator("<") {
                Some(self.parse_signature_text()?)
            } else {
                None
            };
            self.advance(Some("{"), false)?;
            let body = self.expression(0)?;
            self.advance(Some("}"), true)?;
            return Ok(Node::new(
                NodeKind::Lambda { params, body, signature, thunk: false },
                span,
                line,
            )
            .rc());
        }

        let is_partial = args
            .iter()
            .any(|a| matches!(a.kind, NodeKind::Placeholder));
        Ok(Node::new(
            NodeKind::FunctionCall { procedure: left, args, is_partial },
            span,
            line,
        )
        .rc())
    }

    /// Accumulate the raw text of a `<...>` signature, bracket-balanced.
    /// The current token is the opening `<`.
    fn parse_signature_text(&mut self) -> Result<String> {
        self.advance(Some("<"), true)?;
        let mut depth = 1u32;
        let mut sig = String::from("<");
        loop {
            if self.current.is_eof() {
                return Err(self.error_here("S0203").with_value(">"));
            }
            if self.current.is_operator("<") {
                depth += 1;
            } else if self.current.is_operator(">") {
                depth -= 1;
                if depth == 0 {
                    self.advance(None, true)?;
                    break;
                }
            }
            sig.push_str(&self.current.kind.describe());
            self.advance(None, true)?;
        }
        sig.push('>');
        Ok(sig)
    }

    // ── Helpers ────────────────────────────────────────────────────────

    pub(crate) fn error_here(&self, code: &'static str) -> Error {
        Error::new(code, self.current.span, self.current.line)
    }

    pub(crate) fn current(&self) -> &Token {
        &self.current
    }
}

/// Re-intern an operator string from the fixed table.
fn op_static(op: &str) -> &'static str {
    match op {
        "*" => "*",
        "/" => "/",
        "%" => "%",
        "+" => "+",
        "-" => "-",
        "&" => "&",
        "=" => "=",
        "<" => "<",
        ">" => ">",
        "!=" => "!=",
        "<=" => "<=",
        ">=" => ">=",
        "in" => "in",
        "~>" => "~>",
        "@" => "@",
        "#" => "#",
        _ => unreachable!("not an interned operator: {op}"),
    }
}

/// Walk down a chain of filter binaries and flag the innermost target to
/// keep singleton arrays.
fn mark_keep_array(node: &mut NodeRef) {
    {
        let n = Rc::make_mut(node);
        if let NodeKind::Binary { op: "[", lhs, .. } = &mut n.kind {
            mark_keep_array(lhs);
            return;
        }
        n.keep_array = true;
    }
}

/// A short rendering of a node for diagnostics.
fn describe_node(node: &Node) -> String {
    match &node.kind {
        NodeKind::Name(n) => n.clone(),
        NodeKind::Variable(v) => format!("${v}"),
        NodeKind::Number(n) => format!("{n}"),
        NodeKind::Str(s) => s.clone(),
        NodeKind::Bool(b) => format!("{b}"),
        NodeKind::Null => "null".to_string(),
        other => format!("{other:?}"),
    }
}
