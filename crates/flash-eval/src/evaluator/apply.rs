//! Function invocation: calls, partial application, `~>` application and
//! composition, the tail-call trampoline, transform closures and regex
//! match closures.

use std::rc::Rc;

use flash_common::{Error, Result, Span};
use flash_parser::ast::{Node, NodeKind, NodeRef};
use futures::future::LocalBoxFuture;

use super::{evaluate, path};
use crate::frame::{Frame, FrameRef};
use crate::regex_engine::CompiledRegex;
use crate::value::{
    FunctionValue, NativeValue, ObjectValue, PartialArg, PartialValue, Value,
};
use crate::NativeImpl;

/// Evaluate a function call (or partial application) node.
pub(crate) async fn evaluate_function_call(
    node: &NodeRef,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    let NodeKind::FunctionCall { procedure, args, is_partial } = &node.kind else {
        unreachable!("caller dispatched on kind");
    };
    let proc_value = evaluate(procedure, input, frame).await?;
    let name = head_name(procedure).unwrap_or_default();

    if *is_partial {
        if proc_value.is_undefined() {
            if !name.is_empty() && frame.lookup(&name).is_some() {
                return Err(Error::new("T1007", node.span, node.line).with_token(name));
            }
            return Err(Error::new("T1008", node.span, node.line));
        }
        let Value::Function(func) = proc_value else {
            return Err(Error::new("T1008", node.span, node.line));
        };
        let mut partial_args = Vec::with_capacity(args.len());
        for arg in args {
            if matches!(arg.kind, NodeKind::Placeholder) {
                partial_args.push(PartialArg::Placeholder);
            } else {
                partial_args.push(PartialArg::Bound(evaluate(arg, input, frame).await?));
            }
        }
        return Ok(Value::Function(FunctionValue::Partial(Rc::new(PartialValue {
            procedure: func,
            args: partial_args,
        }))));
    }

    if proc_value.is_undefined() && !name.is_empty() && frame.lookup(&name).is_some() {
        return Err(Error::new("T1005", node.span, node.line).with_token(name));
    }

    let mut evaluated = Vec::with_capacity(args.len());
    for arg in args {
        evaluated.push(evaluate(arg, input, frame).await?);
    }
    apply_function(proc_value, evaluated, input.clone(), name, node.span, node.line).await
}

/// Evaluate `lhs ~> rhs`: invocation with a context argument, function
/// composition, or plain application.
pub(crate) async fn evaluate_apply(
    node: &Node,
    lhs: &NodeRef,
    rhs: &NodeRef,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    let lhs_val = evaluate(lhs, input, frame).await?;

    if let NodeKind::FunctionCall { procedure, args, is_partial: false } = &rhs.kind {
        // `x ~> f(a)` invokes f with x prepended.
        let proc_value = evaluate(procedure, input, frame).await?;
        let name = head_name(procedure).unwrap_or_default();
        if proc_value.is_undefined() && !name.is_empty() && frame.lookup(&name).is_some() {
            return Err(Error::new("T1005", node.span, node.line).with_token(name));
        }
        let mut evaluated = vec![lhs_val];
        for arg in args {
            evaluated.push(evaluate(arg, input, frame).await?);
        }
        return apply_function(proc_value, evaluated, input.clone(), name, node.span, node.line)
            .await;
    }

    let func = evaluate(rhs, input, frame).await?;
    if !func.is_function() {
        return Err(Error::new("T2006", node.span, node.line)
            .with_value(func.to_display_string()));
    }

    if lhs_val.is_function() {
        // Both sides are functions: compose them.
        let first = lhs_val;
        let second = func;
        let span = node.span;
        let line = node.line;
        let implementation: NativeImpl = Rc::new(move |args: Vec<Value>| {
            let first = first.clone();
            let second = second.clone();
            Box::pin(async move {
                let mid =
                    apply_function(first, args, Value::Undefined, String::new(), span, line)
                        .await?;
                apply_function(second, vec![mid], Value::Undefined, String::new(), span, line)
                    .await
            })
        });
        return Ok(Value::Function(FunctionValue::Native(Rc::new(NativeValue {
            name: "apply".to_string(),
            signature: None,
            implementation,
        }))));
    }

    apply_function(func, vec![lhs_val], input.clone(), String::new(), node.span, node.line).await
}

/// Apply a function value to evaluated arguments.
///
/// The trampoline lives here: partials unwrap to their procedure, and
/// deferred tail calls (thunks) re-enter the loop instead of growing the
/// stack, until a non-thunk value is produced.
pub(crate) fn apply_function(
    func: Value,
    args: Vec<Value>,
    input: Value,
    name: String,
    span: Span,
    line: u32,
) -> LocalBoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let mut func = func;
        let mut args = args;
        let mut input = input;
        loop {
            match func {
                Value::Function(FunctionValue::Partial(partial)) => {
                    let mut merged = Vec::new();
                    let mut supplied = args.into_iter();
                    for slot in &partial.args {
                        match slot {
                            PartialArg::Bound(v) => merged.push(v.clone()),
                            PartialArg::Placeholder => {
                                merged.push(supplied.next().unwrap_or(Value::Undefined));
                            }
                        }
                    }
                    merged.extend(supplied);
                    func = Value::Function(partial.procedure.clone());
                    args = merged;
                }
                Value::Function(FunctionValue::Lambda(lam)) => {
                    if lam.thunk {
                        // Expand the deferred call and loop.
                        let NodeKind::FunctionCall { procedure, args: arg_nodes, .. } =
                            &lam.body.kind
                        else {
                            return evaluate(&lam.body, &lam.input, &lam.env).await;
                        };
                        let next_proc = evaluate(procedure, &lam.input, &lam.env).await?;
                        let mut next_args = Vec::with_capacity(arg_nodes.len());
                        for arg in arg_nodes {
                            next_args.push(evaluate(arg, &lam.input, &lam.env).await?);
                        }
                        input = lam.input.clone();
                        func = next_proc;
                        args = next_args;
                        continue;
                    }
                    let validated = match &lam.signature {
                        Some(sig) => sig.validate(args, &input, &name, span, line)?,
                        None => args,
                    };
                    let env = Frame::child(&lam.env);
                    for (i, param) in lam.params.iter().enumerate() {
                        env.bind(
                            param.clone(),
                            validated.get(i).cloned().unwrap_or(Value::Undefined),
                        );
                    }
                    let result = evaluate(&lam.body, &lam.input, &env).await?;
                    match result {
                        Value::Function(FunctionValue::Lambda(next)) if next.thunk => {
                            func = Value::Function(FunctionValue::Lambda(next));
                            args = Vec::new();
                        }
                        other => return Ok(other),
                    }
                }
                Value::Function(FunctionValue::Native(native)) => {
                    let validated = match &native.signature {
                        Some(sig) => sig.validate(args, &input, &name, span, line)?,
                        None => args,
                    };
                    return (native.implementation)(validated).await;
                }
                Value::Function(FunctionValue::Regex(regex)) => {
                    let target = args.into_iter().next().unwrap_or(Value::Undefined);
                    return match target {
                        Value::Undefined => Ok(Value::Undefined),
                        Value::String(s) => Ok(regex_match_value(&regex, &s, 0, span, line)),
                        _ => Err(Error::new("T1006", span, line)),
                    };
                }
                _ => return Err(Error::new("T1006", span, line)),
            }
        }
    })
}

/// The name a call site refers to, for `Did you mean $name?` hints.
fn head_name(procedure: &NodeRef) -> Option<String> {
    match &procedure.kind {
        NodeKind::Path { steps } => match &steps.first()?.kind {
            NodeKind::Name(n) => Some(n.clone()),
            _ => None,
        },
        NodeKind::Variable(v) if !v.is_empty() => Some(v.clone()),
        NodeKind::Name(n) => Some(n.clone()),
        _ => None,
    }
}

// ── Regex match closures ───────────────────────────────────────────────

/// Build the match object a regex closure returns: the matched text, its
/// offsets, capture groups and a `next` function. `next` detects matches
/// that would loop forever on a zero-width match and fails with D1004.
pub(crate) fn regex_match_value(
    regex: &Rc<CompiledRegex>,
    text: &str,
    from: usize,
    span: Span,
    line: u32,
) -> Value {
    let Some(m) = regex.matcher.find_at(text, from) else {
        return Value::Undefined;
    };
    let mut obj = ObjectValue::default();
    obj.insert("match".to_string(), Value::String(m.text.clone()));
    obj.insert("start".to_string(), Value::Number(m.start as f64));
    obj.insert("end".to_string(), Value::Number(m.end as f64));
    obj.insert(
        "groups".to_string(),
        Value::array(
            m.groups
                .iter()
                .map(|g| match g {
                    Some(s) => Value::String(s.clone()),
                    None => Value::Null,
                })
                .collect(),
        ),
    );

    let next_regex = regex.clone();
    let next_text = text.to_string();
    let next_from = m.end;
    let implementation: NativeImpl = Rc::new(move |_args: Vec<Value>| {
        let next_regex = next_regex.clone();
        let next_text = next_text.clone();
        Box::pin(async move {
            if next_from >= next_text.len() {
                return Ok(Value::Undefined);
            }
            let next = regex_match_value(&next_regex, &next_text, next_from, span, line);
            if let Value::Object(o) = &next {
                if o.get("match").and_then(|v| v.as_str()) == Some("") {
                    return Err(Error::new("D1004", span, line)
                        .with_value(next_regex.source.clone()));
                }
            }
            Ok(next)
        })
    });
    obj.insert(
        "next".to_string(),
        Value::Function(FunctionValue::Native(Rc::new(NativeValue {
            name: "next".to_string(),
            signature: None,
            implementation,
        }))),
    );
    Value::Object(obj)
}

// ── Transform closures ─────────────────────────────────────────────────

/// Build the function value a `|pattern|update[,delete]|` transform
/// evaluates to. Applying it clones its argument, locates the pattern's
/// matches within the clone, merges the update object into each match and
/// removes the deleted keys.
pub(crate) fn make_transform(
    pattern: NodeRef,
    update: NodeRef,
    delete: Option<NodeRef>,
    frame: FrameRef,
) -> Value {
    let implementation: NativeImpl = Rc::new(move |args: Vec<Value>| {
        let pattern = pattern.clone();
        let update = update.clone();
        let delete = delete.clone();
        let frame = frame.clone();
        Box::pin(async move {
            let source = args.into_iter().next().unwrap_or(Value::Undefined);
            if source.is_undefined() {
                return Ok(Value::Undefined);
            }
            let json = source
                .to_json()
                .ok_or_else(|| Error::new("T2013", pattern.span, pattern.line))?;
            let mut clone = Value::from_json(&json);

            let matches = evaluate(&pattern, &clone, &frame).await?;
            for target in path::as_items(&matches) {
                let update_val = evaluate(&update, &target, &frame).await?;
                let update_obj = match &update_val {
                    Value::Undefined => None,
                    Value::Object(o) => Some(o.clone()),
                    other => {
                        return Err(Error::new("T2011", update.span, update.line)
                            .with_value(other.to_display_string()));
                    }
                };
                let mut delete_keys: Vec<String> = Vec::new();
                if let Some(delete_expr) = &delete {
                    let deleted = evaluate(delete_expr, &target, &frame).await?;
                    match &deleted {
                        Value::Undefined => {}
                        Value::String(s) => delete_keys.push(s.clone()),
                        Value::Array(a) => {
                            for item in &a.items {
                                match item {
                                    Value::String(s) => delete_keys.push(s.clone()),
                                    _ => {
                                        return Err(Error::new(
                                            "T2012",
                                            delete_expr.span,
                                            delete_expr.line,
                                        )
                                        .with_value(deleted.to_display_string()));
                                    }
                                }
                            }
                        }
                        other => {
                            return Err(Error::new(
                                "T2012",
                                delete_expr.span,
                                delete_expr.line,
                            )
                            .with_value(other.to_display_string()));
                        }
                    }
                }
                rewrite(&mut clone, &target, update_obj.as_ref(), &delete_keys);
            }
            Ok(clone)
        })
    });
    Value::Function(FunctionValue::Native(Rc::new(NativeValue {
        name: "transform".to_string(),
        signature: None,
        implementation,
    })))
}

/// Rewrite every object in the tree that matches the target.
fn rewrite(value: &mut Value, target: &Value, update: Option<&ObjectValue>, deletes: &[String]) {
    if value.deep_eq(target) {
        if let Value::Object(o) = value {
            if let Some(u) = update {
                for (k, v) in u {
                    o.insert(k.clone(), v.clone());
                }
            }
            for k in deletes {
                o.shift_remove(k);
            }
        }
        return;
    }
    match value {
        Value::Array(a) => {
            for item in &mut a.items {
                rewrite(item, target, update, deletes);
            }
        }
        Value::Object(o) => {
            for (_, v) in o.iter_mut() {
                rewrite(v, target, update, deletes);
            }
        }
        _ => {}
    }
}
