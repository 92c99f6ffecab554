//! The tree-walking evaluator.
//!
//! Every node evaluation is a suspension point: [`evaluate`] returns a
//! boxed local future so that navigator-backed or host-supplied functions
//! can perform I/O mid-expression. After each node the result sequence is
//! normalized (singleton sequences unwrap, empty sequences become
//! undefined) and any predicates or grouping attached to the node are
//! applied.

pub(crate) mod apply;
pub(crate) mod operators;
pub(crate) mod path;

use std::rc::Rc;

use flash_common::{Error, Result};
use flash_parser::ast::{Node, NodeKind, NodeRef};
use futures::future::{join_all, LocalBoxFuture};

use crate::flash;
use crate::frame::{Frame, FrameRef};
use crate::signature;
use crate::value::{ArrayFlags, ArrayValue, FunctionValue, LambdaValue, Value};

/// Evaluate a node against an input and environment.
///
/// This is the single recursion point; every nested evaluation goes
/// through the boxed future it returns.
pub fn evaluate<'a>(
    node: &'a NodeRef,
    input: &'a Value,
    frame: &'a FrameRef,
) -> LocalBoxFuture<'a, Result<Value>> {
    Box::pin(evaluate_inner(node, input, frame))
}

async fn evaluate_inner(node: &NodeRef, input: &Value, frame: &FrameRef) -> Result<Value> {
    let ctx = frame.root_ctx().clone();

    let entry = ctx.entry_hook.borrow().clone();
    if let Some(hook) = entry {
        hook(node, input)?;
    }

    let mut result = dispatch(node, input, frame).await?;

    // Predicates attached to non-path nodes.
    for predicate in &node.predicates {
        result = path::evaluate_filter(predicate, result, frame).await?;
    }

    // Grouping attached to non-path nodes; paths group internally so the
    // tuple stream is still visible to the key expressions.
    if let Some(group) = &node.group {
        if !matches!(node.kind, NodeKind::Path { .. }) {
            result = path::evaluate_group(&group.pairs, group.span, group.line, result, frame)
                .await?;
        }
    }

    let exit = ctx.exit_hook.borrow().clone();
    if let Some(hook) = exit {
        hook(node, &result)?;
    }

    Ok(normalize_sequence(result))
}

/// Unwrap singleton sequences and collapse empty ones to undefined.
pub(crate) fn normalize_sequence(result: Value) -> Value {
    match result {
        Value::Array(a) if a.flags.sequence && !a.flags.keep_singleton => {
            let mut a = a;
            match a.items.len() {
                0 => Value::Undefined,
                1 => a.items.pop().expect("len checked"),
                _ => Value::Array(a),
            }
        }
        other => other,
    }
}

async fn dispatch(node: &NodeRef, input: &Value, frame: &FrameRef) -> Result<Value> {
    match &node.kind {
        // ── Literals ───────────────────────────────────────────────────
        NodeKind::Number(n) => Ok(Value::Number(*n)),
        NodeKind::Str(s) => Ok(Value::String(s.clone())),
        NodeKind::Bool(b) => Ok(Value::Bool(*b)),
        NodeKind::Null => Ok(Value::Null),
        NodeKind::Regex { pattern, flags } => {
            let compiled = frame
                .root_ctx()
                .compiled_regex(pattern, flags, node.span, node.line)?;
            Ok(Value::Function(FunctionValue::Regex(compiled)))
        }

        // ── Leaves ─────────────────────────────────────────────────────
        NodeKind::Name(name) => Ok(lookup_value(input, name)),
        NodeKind::Variable(name) => {
            if name.is_empty() {
                // `$` is the current input, unwrapping the outer wrapper.
                if let Value::Array(a) = input {
                    if a.flags.outer_wrapper {
                        return Ok(a.items.first().cloned().unwrap_or(Value::Undefined));
                    }
                }
                Ok(input.clone())
            } else {
                Ok(frame.lookup(name).unwrap_or(Value::Undefined))
            }
        }
        NodeKind::Wildcard => Ok(evaluate_wildcard(input)),
        NodeKind::Descendant => Ok(evaluate_descendants(input)),
        NodeKind::Parent(slot) => match slot {
            Some(slot) => Ok(frame
                .lookup(&slot.borrow().label)
                .unwrap_or(Value::Undefined)),
            None => Ok(Value::Undefined),
        },
        NodeKind::Placeholder => Ok(Value::Undefined),
        NodeKind::ErrorStub => Err(Error::new("S0500", node.span, node.line)),

        // ── Structure ──────────────────────────────────────────────────
        NodeKind::Path { steps } => path::evaluate_path(node, steps, input, frame).await,
        NodeKind::Sort { terms } => {
            let items = match input {
                Value::Array(a) => a.items.clone(),
                Value::Undefined => Vec::new(),
                other => vec![other.clone()],
            };
            let sorted = path::sort_values(terms, items, frame).await?;
            Ok(Value::sequence(sorted))
        }
        NodeKind::Binary { op, lhs, rhs } => {
            operators::evaluate_binary(node, op, lhs, rhs, input, frame).await
        }
        NodeKind::Neg(expr) => {
            let value = evaluate(expr, input, frame).await?;
            match value {
                Value::Undefined => Ok(Value::Undefined),
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(Error::new("D1002", node.span, node.line)
                    .with_value(other.to_display_string())),
            }
        }

        // ── Constructors ───────────────────────────────────────────────
        NodeKind::ArrayConstructor { items } => {
            // Items evaluate concurrently (any of them may suspend) but
            // assemble in source order.
            let futures: Vec<_> = items
                .iter()
                .map(|item| evaluate(item, input, frame))
                .collect();
            let results = join_all(futures).await;
            let mut out: Vec<Value> = Vec::new();
            for (item_node, res) in items.iter().zip(results) {
                let value = res?;
                if value.is_undefined() {
                    continue;
                }
                if matches!(item_node.kind, NodeKind::ArrayConstructor { .. }) {
                    // Nested explicit arrays stay nested.
                    out.push(value);
                } else {
                    match value {
                        Value::Array(a) => out.extend(a.items),
                        v => out.push(v),
                    }
                }
            }
            Ok(Value::Array(ArrayValue {
                items: out,
                flags: ArrayFlags { cons: true, ..ArrayFlags::default() },
            }))
        }
        NodeKind::ObjectConstructor { pairs } => {
            path::evaluate_group(pairs, node.span, node.line, input.clone(), frame).await
        }

        // ── Control ────────────────────────────────────────────────────
        NodeKind::Block { exprs } => {
            if node.flash.is_some() {
                return flash::evaluate_flash(node, input, frame).await;
            }
            let block_frame = Frame::child(frame);
            let mut result = Value::Undefined;
            for expr in exprs {
                result = evaluate(expr, input, &block_frame).await?;
            }
            Ok(result)
        }
        NodeKind::Bind { var, value } => {
            let NodeKind::Variable(name) = &var.kind else {
                return Err(Error::new("S0212", node.span, node.line));
            };
            let value = evaluate(value, input, frame).await?;
            frame.bind(name.clone(), value.clone());
            Ok(value)
        }
        NodeKind::Condition { condition, then, otherwise } => {
            let cond = evaluate(condition, input, frame).await?;
            if cond.truthy() {
                evaluate(then, input, frame).await
            } else if let Some(otherwise) = otherwise {
                evaluate(otherwise, input, frame).await
            } else {
                Ok(Value::Undefined)
            }
        }
        NodeKind::Coalesce { lhs, rhs } => {
            let left = evaluate(lhs, input, frame).await?;
            if left.is_undefined() {
                evaluate(rhs, input, frame).await
            } else {
                Ok(left)
            }
        }
        NodeKind::Elvis { lhs, rhs } => {
            let left = evaluate(lhs, input, frame).await?;
            if left.truthy() {
                Ok(left)
            } else {
                evaluate(rhs, input, frame).await
            }
        }

        // ── Functions ──────────────────────────────────────────────────
        NodeKind::Lambda { params, body, signature: sig, thunk } => {
            let signature = match sig {
                Some(text) => Some(signature::parse(text, node.span, node.line)?),
                None => None,
            };
            Ok(Value::Function(FunctionValue::Lambda(Rc::new(LambdaValue {
                params: params.clone(),
                body: body.clone(),
                env: frame.clone(),
                input: input.clone(),
                signature,
                thunk: *thunk,
            }))))
        }
        NodeKind::FunctionCall { .. } => apply::evaluate_function_call(node, input, frame).await,
        NodeKind::Apply { lhs, rhs } => {
            apply::evaluate_apply(node, lhs, rhs, input, frame).await
        }
        NodeKind::Transform { pattern, update, delete } => Ok(apply::make_transform(
            pattern.clone(),
            update.clone(),
            delete.clone(),
            frame.clone(),
        )),

        // Raw encodings never survive post-processing.
        NodeKind::GroupBy { .. } | NodeKind::OrderBy { .. } => Err(Error::new(
            "S0206",
            node.span,
            node.line,
        )
        .with_token(kind_label(node))),
    }
}

fn kind_label(node: &Node) -> &'static str {
    match node.kind {
        NodeKind::GroupBy { .. } => "{",
        NodeKind::OrderBy { .. } => "^",
        _ => "?",
    }
}

/// Property lookup: objects by key, arrays map the lookup over their items
/// flattening one level.
pub(crate) fn lookup_value(input: &Value, key: &str) -> Value {
    match input {
        Value::Object(o) => o.get(key).cloned().unwrap_or(Value::Undefined),
        Value::Array(a) => {
            let mut items = Vec::new();
            for item in &a.items {
                match lookup_value(item, key) {
                    Value::Undefined => {}
                    Value::Array(inner) => items.extend(inner.items),
                    v => items.push(v),
                }
            }
            if items.is_empty() {
                Value::Undefined
            } else {
                Value::sequence(items)
            }
        }
        _ => Value::Undefined,
    }
}

/// `*`: the values of the input's own properties, flattening arrays one
/// level.
fn evaluate_wildcard(input: &Value) -> Value {
    let mut items = Vec::new();
    let mut push = |v: &Value| match v {
        Value::Undefined => {}
        Value::Array(a) => {
            for item in &a.items {
                items.push(item.clone());
            }
        }
        other => items.push(other.clone()),
    };
    match input {
        Value::Array(a) if a.flags.outer_wrapper => {
            if let Some(first) = a.items.first() {
                if let Value::Object(o) = first {
                    for v in o.values() {
                        push(v);
                    }
                }
            }
        }
        Value::Object(o) => {
            for v in o.values() {
                push(v);
            }
        }
        Value::Array(a) => {
            for v in &a.items {
                push(v);
            }
        }
        _ => {}
    }
    if items.is_empty() {
        Value::Undefined
    } else {
        Value::sequence(items)
    }
}

/// `**`: the recursive flattening of the input.
fn evaluate_descendants(input: &Value) -> Value {
    fn recurse(value: &Value, out: &mut Vec<Value>) {
        match value {
            Value::Array(a) => {
                for item in &a.items {
                    recurse(item, out);
                }
            }
            Value::Undefined => {}
            other => {
                out.push(other.clone());
                if let Value::Object(o) = other {
                    for v in o.values() {
                        recurse(v, out);
                    }
                }
            }
        }
    }
    if input.is_undefined() {
        return Value::Undefined;
    }
    let mut out = Vec::new();
    recurse(input, &mut out);
    if out.is_empty() {
        Value::Undefined
    } else {
        Value::sequence(out)
    }
}
