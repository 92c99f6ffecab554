//! FLASH header and rule parsing.
//!
//! FLASH is indentation-sensitive: a block opens with an `Instance:` /
//! `InstanceOf:` header and collects rules from subsequent lines. The lexer
//! reports each header line as a `BlockIndent` token and each rule line as
//! an `Indent` token carrying the line's leading indentation; this module
//! enforces the indent discipline (first-level rules sit at the block root,
//! children advance in steps of two) and rewrites multi-step rule paths
//! into nested single-step rules.

use flash_common::{Error, Result, Span, TokenKind};

use crate::ast::{FlashMeta, FlashStep, Node, NodeKind, NodeRef};

use super::Parser;

/// Parse a flash header introduced by a `BlockIndent` token (already
/// consumed). The current token is `Instance:` or `InstanceOf:`.
pub(crate) fn parse_flash_header(
    p: &mut Parser,
    root: u32,
    span: Span,
    line: u32,
) -> Result<NodeRef> {
    if p.current().is_operator("Instance:") {
        let decl_span = p.current().span;
        let decl_line = p.current().line;
        p.advance(Some("Instance:"), false)?;
        return parse_instance_declaration(p, Some(root), decl_span, decl_line);
    }
    if let TokenKind::InstanceOf(id) = p.current().kind.clone() {
        let id_span = p.current().span;
        let id_line = p.current().line;
        p.advance(None, true)?;
        return parse_flash_body(p, None, id, root, id_span, id_line);
    }
    Err(Error::new("F1010", span, line))
}

/// Parse `Instance: <expr>` and the `InstanceOf:` declaration that must
/// follow it. The `Instance:` operator token has been consumed; `root` is
/// its block indent when it opened a line, `None` for the inline form.
pub(crate) fn parse_instance_declaration(
    p: &mut Parser,
    root: Option<u32>,
    span: Span,
    line: u32,
) -> Result<NodeRef> {
    let instance = p.expression(0)?;

    // The instance expression must be followed by `InstanceOf:` -- either
    // on a later line at the same indent (BlockIndent then InstanceOf), or
    // illegally on the same line / at another indent.
    if let TokenKind::BlockIndent(header_indent) = p.current().kind {
        if let Some(expected) = root {
            if header_indent != expected {
                return Err(p.error_here("F1014"));
            }
        }
        p.advance(None, true)?;
        if p.current().is_operator("Instance:") {
            return Err(p.error_here("F1010"));
        }
        if let TokenKind::InstanceOf(id) = p.current().kind.clone() {
            let id_span = p.current().span;
            let id_line = p.current().line;
            p.advance(None, true)?;
            return parse_flash_body(
                p,
                Some(instance),
                id,
                root.unwrap_or(header_indent),
                id_span,
                id_line,
            );
        }
        return Err(p.error_here("F1010"));
    }
    if matches!(p.current().kind, TokenKind::InstanceOf(_)) {
        // No BlockIndent was emitted, so the declaration did not open a
        // line of its own.
        let code = if p.current().line == line { "F1013" } else { "F1014" };
        return Err(Error::new(code, p.current().span, p.current().line));
    }
    if p.current().line == line && !p.current().is_eof() {
        // Leftover tokens on the declaration's own line: the instance
        // expression must run to the end of it.
        return Err(p.error_here("F1011"));
    }
    Err(Error::new("F1010", span, line))
}

/// Parse the body of a flash block after its `InstanceOf:` identifier has
/// been consumed.
pub(crate) fn parse_flash_body(
    p: &mut Parser,
    instance: Option<NodeRef>,
    id: String,
    root: u32,
    span: Span,
    line: u32,
) -> Result<NodeRef> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(Error::new("F1019", span, line));
    }
    let rules = collect_rules(p, root, root)?;
    let mut node = Node::new(NodeKind::Block { exprs: rules }, span, line);
    node.flash = Some(FlashMeta {
        is_rule: false,
        instanceof_id: id,
        instance,
        step: None,
        full_path: None,
        inline: None,
    });
    Ok(node.rc())
}

/// Collect rules whose indent equals `level`. Dedenting toward the block
/// `root` hands control back to an enclosing level; anything that cannot
/// belong to this block is an error.
fn collect_rules(p: &mut Parser, level: u32, root: u32) -> Result<Vec<NodeRef>> {
    let mut rules = Vec::new();
    loop {
        let TokenKind::Indent(k) = p.current().kind else {
            break;
        };
        if k == level {
            p.advance(None, true)?;
            rules.push(parse_rule_line(p, level, root)?);
            continue;
        }
        if k < root {
            // Descending below the block root hands the line back to the
            // enclosing flash context, when there is one that can take it.
            match p.flash_rule_indent {
                Some(enclosing) if k <= enclosing => break,
                _ => return Err(p.error_here("F1016")),
            }
        }
        if (k.abs_diff(root)) % 2 == 1 {
            return Err(p.error_here("F1021"));
        }
        if k > level {
            return Err(p.error_here("F1017"));
        }
        // root <= k < level: dedent to an ancestor rule level.
        break;
    }
    Ok(rules)
}

/// Parse one rule line after its `Indent` token: either `* <path> [= expr]`
/// (with optional context and nested children) or `$var := expr`.
fn parse_rule_line(p: &mut Parser, level: u32, root: u32) -> Result<NodeRef> {
    let saved_rule_indent = p.flash_rule_indent;
    p.flash_rule_indent = Some(level);
    let result = parse_rule_line_inner(p, level, root);
    p.flash_rule_indent = saved_rule_indent;
    result
}

fn parse_rule_line_inner(p: &mut Parser, level: u32, root: u32) -> Result<NodeRef> {
    // ── Variable binding rule: `$x := expr` ────────────────────────────
    if let TokenKind::Variable(name) = p.current().kind.clone() {
        let var_span = p.current().span;
        let var_line = p.current().line;
        p.advance(None, true)?;
        if p.current().is_operator(".") {
            // Binds assign whole variables, never paths.
            return Err(p.error_here("F1020"));
        }
        if !p.current().is_operator(":=") {
            return Err(p
                .error_here("S0202")
                .with_value(":=")
                .with_token(p.current().kind.describe()));
        }
        p.advance(Some(":="), false)?;
        let value = p.expression(0)?;
        // Rules cannot nest under a binding.
        if let TokenKind::Indent(k) = p.current().kind {
            if k == level + 2 {
                return Err(p.error_here("F1025"));
            }
        }
        let var = Node::new(NodeKind::Variable(name), var_span, var_line).rc();
        return Ok(Node::new(NodeKind::Bind { var, value }, var_span, var_line).rc());
    }

    // ── Flash rule: `* [ (ctx). ] path [= expr]` ───────────────────────
    if !p.current().is_operator("flashrule") {
        return Err(p.error_here("F1018"));
    }
    let rule_span = p.current().span;
    let rule_line = p.current().line;
    p.advance(Some("flashrule"), true)?;

    match &p.current().kind {
        TokenKind::Operator("*") => return Err(p.error_here("F1022")),
        TokenKind::Variable(_) => return Err(p.error_here("F1023")),
        TokenKind::Indent(_) | TokenKind::BlockIndent(_) | TokenKind::Eof => {
            return Err(Error::new("F1024", rule_span, rule_line));
        }
        _ => {}
    }

    // Optional context: `* (ctx).path = X`.
    let context = if p.current().is_operator("(") {
        let ctx_span = p.current().span;
        let ctx_line = p.current().line;
        p.advance(Some("("), false)?;
        let mut exprs = Vec::new();
        while !p.current().is_operator(")") {
            exprs.push(p.expression(0)?);
            if p.current().is_operator(";") {
                p.advance(Some(";"), false)?;
            } else {
                break;
            }
        }
        p.advance(Some(")"), true)?;
        p.advance(Some("."), true)?;
        Some(Node::new(NodeKind::Block { exprs }, ctx_span, ctx_line).rc())
    } else {
        None
    };

    // The flash path: `name[slice][slice2].child...`.
    let steps = parse_flash_path(p)?;

    // Inline expression.
    let inline = if p.current().is_operator("=") {
        let eq_span = p.current().span;
        let eq_line = p.current().line;
        p.advance(Some("="), false)?;
        match p.current().kind {
            TokenKind::Indent(_) | TokenKind::BlockIndent(_) | TokenKind::Eof => {
                return Err(Error::new("F1012", eq_span, eq_line));
            }
            _ => Some(p.expression(0)?),
        }
    } else if p.current().is_operator(":=") {
        return Err(p.error_here("F1020"));
    } else {
        None
    };

    // Nested children two deeper.
    let children = collect_rules(p, level + 2, root)?;

    // Build nested single-step rules from the innermost step outward.
    let mut iter = steps.into_iter().rev();
    let innermost = iter.next().expect("flash path has at least one step");
    let mut node = make_rule(innermost, inline, children, rule_span, rule_line);
    for step in iter {
        node = make_rule(step, None, vec![node], rule_span, rule_line);
    }

    // Contextualize: `(ctx).rule`.
    if let Some(ctx) = context {
        node = Node::new(
            NodeKind::Binary { op: ".", lhs: ctx, rhs: node },
            rule_span,
            rule_line,
        )
        .rc();
    }
    Ok(node)
}

fn make_rule(
    step: FlashStep,
    inline: Option<NodeRef>,
    children: Vec<NodeRef>,
    span: Span,
    line: u32,
) -> NodeRef {
    let mut node = Node::new(NodeKind::Block { exprs: children }, span, line);
    node.flash = Some(FlashMeta {
        is_rule: true,
        // Filled in by the post-processor from the enclosing block.
        instanceof_id: String::new(),
        instance: None,
        step: Some(step),
        full_path: None,
        inline,
    });
    node.rc()
}

/// Parse `name[slice].name[slice]...` into flash steps.
fn parse_flash_path(p: &mut Parser) -> Result<Vec<FlashStep>> {
    let mut steps = Vec::new();
    loop {
        let TokenKind::Name(name) = p.current().kind.clone() else {
            return Err(p
                .error_here("F1028")
                .with_value(p.current().kind.describe()));
        };
        p.advance(None, true)?;

        let mut slices = Vec::new();
        while p.current().is_operator("[") {
            p.advance(Some("["), true)?;
            // Slice names may contain operator characters (`il-id`), so
            // accumulate raw token text up to the closing bracket.
            let mut slice = String::new();
            while !p.current().is_operator("]") {
                if p.current().is_eof() || matches!(p.current().kind, TokenKind::Indent(_)) {
                    return Err(p.error_here("F1028").with_value(slice));
                }
                slice.push_str(&p.current().kind.describe());
                p.advance(None, true)?;
            }
            p.advance(Some("]"), true)?;
            if slice.is_empty() {
                return Err(p.error_here("F1028").with_value(name.clone()));
            }
            slices.push(slice);
        }
        steps.push(FlashStep { name, slices });

        if p.current().is_operator(".") {
            p.advance(Some("."), true)?;
            continue;
        }
        break;
    }
    Ok(steps)
}
