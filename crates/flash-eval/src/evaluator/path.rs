//! Path evaluation: steps, stages, tuple streams, filters, sorting and
//! grouping.
//!
//! A path executes its steps left to right, evaluating each step once per
//! item of the current sequence and flattening the results one level.
//! When any step binds a focus/index variable or a resolved parent slot,
//! the whole path switches to tuple-stream mode: instead of plain values,
//! binding tuples (`@` plus named bindings) flow across the steps so that
//! later filters, sorts and groupings can see them.

use std::cell::RefCell;
use std::cmp::Ordering;

use flash_common::{Error, Result, Span};
use flash_parser::ast::{Node, NodeKind, NodeRef, SortTerm, Stage};
use indexmap::IndexMap;

use super::evaluate;
use crate::frame::{Frame, FrameRef};
use crate::value::{ArrayFlags, ArrayValue, ObjectValue, Value};

/// Evaluate a path node.
pub(crate) async fn evaluate_path(
    node: &Node,
    steps: &[NodeRef],
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    // The input sequence: an array input fans out per item unless the path
    // starts with a variable reference.
    let mut input_seq: Value = match input {
        Value::Array(_) if !matches!(steps[0].kind, NodeKind::Variable(_)) => input.clone(),
        Value::Undefined => Value::sequence(vec![Value::Undefined]),
        other => Value::sequence(vec![other.clone()]),
    };

    let is_tuple = steps.iter().any(|s| s.tuple);
    let last_index = steps.len() - 1;
    let mut result: Value = Value::sequence(Vec::new());
    let mut tuples: Option<Vec<ObjectValue>> = None;

    for (ii, step) in steps.iter().enumerate() {
        if ii == 0 && step.cons_array {
            // An explicit array constructor as the first step evaluates
            // once against the whole input.
            result = evaluate(step, &input_seq, frame).await?;
            input_seq = result.clone();
            continue;
        }
        if is_tuple {
            let next = evaluate_tuple_step(step, &input_seq, tuples.take(), frame).await?;
            let done = next.is_empty();
            tuples = Some(next);
            if done {
                break;
            }
        } else {
            result = evaluate_step(step, &input_seq, frame, ii == last_index).await?;
            let empty = match &result {
                Value::Undefined => true,
                Value::Array(a) => a.items.is_empty(),
                _ => false,
            };
            if empty {
                result = Value::sequence(Vec::new());
                break;
            }
            input_seq = result.clone();
        }
    }

    let tuples = tuples.unwrap_or_default();
    if is_tuple {
        if node.tuple {
            // This path is itself a binding step of an outer tuple stream.
            result = tuple_stream_value(tuples.clone());
        } else {
            let items: Vec<Value> = tuples
                .iter()
                .filter_map(|t| t.get("@").cloned())
                .filter(|v| !v.is_undefined())
                .collect();
            result = Value::sequence(items);
        }
    }

    if node.keep_singleton_array {
        if let Value::Array(a) = &result {
            if a.flags.cons && !a.flags.sequence {
                result = Value::sequence(vec![result.clone()]);
            }
        }
        if let Value::Array(a) = &mut result {
            a.flags.keep_singleton = true;
        }
    }

    if let Some(group) = &node.group {
        let group_input = if is_tuple {
            tuple_stream_value(tuples)
        } else {
            result
        };
        result = evaluate_group(&group.pairs, group.span, group.line, group_input, frame).await?;
    }

    Ok(result)
}

/// Evaluate one non-tuple step over the input sequence.
async fn evaluate_step(
    step: &NodeRef,
    input: &Value,
    frame: &FrameRef,
    last_step: bool,
) -> Result<Value> {
    if let NodeKind::Sort { terms } = &step.kind {
        let sorted = sort_values(terms, as_items(input), frame).await?;
        let mut result = Value::sequence(sorted);
        for stage in &step.stages {
            if let Stage::Filter(expr) = stage {
                result = evaluate_filter(expr, result, frame).await?;
            }
        }
        return Ok(result);
    }

    let items = as_items(input);
    let mut collected: Vec<Value> = Vec::new();
    for item in &items {
        let mut res = evaluate(step, item, frame).await?;
        for stage in &step.stages {
            if let Stage::Filter(expr) = stage {
                res = evaluate_filter(expr, res, frame).await?;
            }
        }
        if !res.is_undefined() {
            collected.push(res);
        }
    }

    // A lone plain array on the last step keeps its identity.
    if last_step && collected.len() == 1 {
        if let Value::Array(a) = &collected[0] {
            if !a.flags.sequence {
                return Ok(collected.pop().expect("len checked"));
            }
        }
    }

    // Flatten one level; explicit arrays stay nested.
    let mut out: Vec<Value> = Vec::new();
    for res in collected {
        match res {
            Value::Array(a) if !a.flags.cons => out.extend(a.items),
            v => out.push(v),
        }
    }
    Ok(Value::sequence(out))
}

/// Evaluate one step in tuple-stream mode.
async fn evaluate_tuple_step(
    step: &NodeRef,
    input: &Value,
    tuples: Option<Vec<ObjectValue>>,
    frame: &FrameRef,
) -> Result<Vec<ObjectValue>> {
    if let NodeKind::Sort { terms } = &step.kind {
        let result = match tuples {
            Some(tuples) => sort_tuples(terms, tuples, frame).await?,
            None => {
                let sorted = sort_values(terms, as_items(input), frame).await?;
                sorted
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| {
                        let mut tuple = ObjectValue::default();
                        tuple.insert("@".to_string(), v);
                        if let Some(ix) = &step.index_var {
                            tuple.insert(ix.clone(), Value::Number(i as f64));
                        }
                        tuple
                    })
                    .collect()
            }
        };
        return apply_stages(&step.stages, result, frame).await;
    }

    let tuples = match tuples {
        Some(t) => t,
        None => as_items(input)
            .into_iter()
            .filter(|v| !v.is_undefined())
            .map(|v| {
                let mut tuple = ObjectValue::default();
                tuple.insert("@".to_string(), v);
                tuple
            })
            .collect(),
    };

    let mut result: Vec<ObjectValue> = Vec::new();
    for tuple in &tuples {
        let step_frame = frame_from_tuple(frame, tuple);
        let context = tuple.get("@").cloned().unwrap_or(Value::Undefined);
        let res = evaluate(step, &context, &step_frame).await?;
        if res.is_undefined() {
            continue;
        }
        let (items, res_is_tuple_stream) = match res {
            Value::Array(a) => {
                let ts = a.flags.tuple_stream;
                (a.items, ts)
            }
            v => (vec![v], false),
        };
        for (bb, item) in items.into_iter().enumerate() {
            let mut new_tuple = tuple.clone();
            if res_is_tuple_stream {
                if let Value::Object(bindings) = item {
                    for (k, v) in bindings {
                        new_tuple.insert(k, v);
                    }
                }
            } else {
                if let Some(focus) = &step.focus {
                    new_tuple.insert(focus.clone(), item);
                    new_tuple.insert("@".to_string(), context.clone());
                } else {
                    new_tuple.insert("@".to_string(), item);
                }
                if let Some(ix) = &step.index_var {
                    new_tuple.insert(ix.clone(), Value::Number(bb as f64));
                }
                if let Some(ancestor) = &step.ancestor {
                    new_tuple.insert(ancestor.borrow().label.clone(), context.clone());
                }
            }
            result.push(new_tuple);
        }
    }
    apply_stages(&step.stages, result, frame).await
}

/// Apply a step's stages to a tuple stream.
async fn apply_stages(
    stages: &[Stage],
    tuples: Vec<ObjectValue>,
    frame: &FrameRef,
) -> Result<Vec<ObjectValue>> {
    let mut current = tuples;
    for stage in stages {
        match stage {
            Stage::Filter(expr) => {
                let filtered =
                    evaluate_filter(expr, tuple_stream_value(current), frame).await?;
                current = to_tuples(filtered);
            }
            Stage::Index(name) => {
                for (i, tuple) in current.iter_mut().enumerate() {
                    tuple.insert(name.clone(), Value::Number(i as f64));
                }
            }
        }
    }
    Ok(current)
}

/// Apply a predicate to a value. Numeric predicates select by (possibly
/// negative) position; numeric results select by index; anything else
/// filters by truthiness.
pub(crate) async fn evaluate_filter(
    predicate: &NodeRef,
    value: Value,
    frame: &FrameRef,
) -> Result<Value> {
    let is_tuple = matches!(&value, Value::Array(a) if a.flags.tuple_stream);
    let items = as_items(&value);
    let mut out: Vec<Value> = Vec::new();

    if let NodeKind::Number(n) = predicate.kind {
        let mut index = n.floor() as i64;
        if index < 0 {
            index += items.len() as i64;
        }
        if index >= 0 {
            if let Some(item) = items.get(index as usize) {
                match item {
                    Value::Array(a) => out.extend(a.items.clone()),
                    v => out.push(v.clone()),
                }
            }
        }
    } else {
        for (index, item) in items.iter().enumerate() {
            let (context, env) = if is_tuple {
                match item {
                    Value::Object(tuple) => (
                        tuple.get("@").cloned().unwrap_or(Value::Undefined),
                        frame_from_tuple(frame, tuple),
                    ),
                    _ => (item.clone(), frame.clone()),
                }
            } else {
                (item.clone(), frame.clone())
            };
            let res = evaluate(predicate, &context, &env).await?;
            if let Some(selection) = numeric_selection(&res) {
                for n in selection {
                    let mut ix = n.floor() as i64;
                    if ix < 0 {
                        ix += items.len() as i64;
                    }
                    if ix == index as i64 {
                        out.push(item.clone());
                    }
                }
            } else if res.truthy() {
                out.push(item.clone());
            }
        }
    }

    Ok(Value::Array(ArrayValue {
        items: out,
        flags: ArrayFlags {
            sequence: true,
            tuple_stream: is_tuple,
            ..ArrayFlags::default()
        },
    }))
}

/// A numeric predicate result: one number, or an array made only of
/// numbers (including empty, which selects nothing).
fn numeric_selection(res: &Value) -> Option<Vec<f64>> {
    match res {
        Value::Number(n) => Some(vec![*n]),
        Value::Array(a) => {
            let mut nums = Vec::with_capacity(a.items.len());
            for item in &a.items {
                match item {
                    Value::Number(n) => nums.push(*n),
                    _ => return None,
                }
            }
            Some(nums)
        }
        _ => None,
    }
}

// ── Sorting ────────────────────────────────────────────────────────────

/// Sort plain values by the order-by terms. Stable; undefined sorts last;
/// mixed types fail T2007 and non-sortable values fail T2008.
pub(crate) async fn sort_values(
    terms: &[SortTerm],
    items: Vec<Value>,
    frame: &FrameRef,
) -> Result<Vec<Value>> {
    let mut keys: Vec<Vec<Value>> = Vec::with_capacity(items.len());
    for item in &items {
        let mut row = Vec::with_capacity(terms.len());
        for term in terms {
            row.push(evaluate(&term.expression, item, frame).await?);
        }
        keys.push(row);
    }
    sort_with_keys(terms, items, keys)
}

/// Sort binding tuples by the order-by terms evaluated in tuple frames.
async fn sort_tuples(
    terms: &[SortTerm],
    tuples: Vec<ObjectValue>,
    frame: &FrameRef,
) -> Result<Vec<ObjectValue>> {
    let mut keys: Vec<Vec<Value>> = Vec::with_capacity(tuples.len());
    for tuple in &tuples {
        let env = frame_from_tuple(frame, tuple);
        let context = tuple.get("@").cloned().unwrap_or(Value::Undefined);
        let mut row = Vec::with_capacity(terms.len());
        for term in terms {
            row.push(evaluate(&term.expression, &context, &env).await?);
        }
        keys.push(row);
    }
    sort_with_keys(terms, tuples, keys)
}

fn sort_with_keys<T>(terms: &[SortTerm], items: Vec<T>, keys: Vec<Vec<Value>>) -> Result<Vec<T>> {
    let error: RefCell<Option<Error>> = RefCell::new(None);
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        for (t, term) in terms.iter().enumerate() {
            let av = &keys[a][t];
            let bv = &keys[b][t];
            let span = term.expression.span;
            let line = term.expression.line;
            let ord = match (av, bv) {
                (Value::Undefined, Value::Undefined) => Ordering::Equal,
                (Value::Undefined, _) => Ordering::Greater,
                (_, Value::Undefined) => Ordering::Less,
                (Value::Number(x), Value::Number(y)) => {
                    x.partial_cmp(y).unwrap_or(Ordering::Equal)
                }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
                    error.borrow_mut().get_or_insert(
                        Error::new("T2007", span, line)
                            .with_value(av.to_display_string())
                            .with_value2(bv.to_display_string()),
                    );
                    Ordering::Equal
                }
                _ => {
                    error
                        .borrow_mut()
                        .get_or_insert(Error::new("T2008", span, line));
                    Ordering::Equal
                }
            };
            let ord = if term.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    if let Some(err) = error.into_inner() {
        return Err(err);
    }
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| slots[i].take().expect("each index appears once"))
        .collect())
}

// ── Grouping ───────────────────────────────────────────────────────────

/// Evaluate a group expression over a sequence (or tuple stream).
pub(crate) async fn evaluate_group(
    pairs: &[(NodeRef, NodeRef)],
    span: Span,
    line: u32,
    input: Value,
    frame: &FrameRef,
) -> Result<Value> {
    let is_tuple = matches!(&input, Value::Array(a) if a.flags.tuple_stream);
    let items: Vec<Value> = match input {
        Value::Array(a) => a.items,
        Value::Undefined => vec![Value::Undefined],
        v => vec![v],
    };

    struct GroupEntry {
        data: Value,
        expr_index: usize,
    }
    let mut groups: IndexMap<String, GroupEntry> = IndexMap::new();

    for item in &items {
        let (context, env) = if is_tuple {
            match item {
                Value::Object(tuple) => (
                    tuple.get("@").cloned().unwrap_or(Value::Undefined),
                    frame_from_tuple(frame, tuple),
                ),
                _ => (item.clone(), frame.clone()),
            }
        } else {
            (item.clone(), frame.clone())
        };
        for (pair_index, (key_expr, _)) in pairs.iter().enumerate() {
            let key = evaluate(key_expr, &context, &env).await?;
            match key {
                Value::String(k) => {
                    if let Some(entry) = groups.get_mut(&k) {
                        if entry.expr_index != pair_index {
                            return Err(Error::new("D1009", span, line).with_value(k));
                        }
                        let data = std::mem::take(&mut entry.data);
                        entry.data = data.append(item.clone());
                    } else {
                        groups.insert(
                            k,
                            GroupEntry { data: item.clone(), expr_index: pair_index },
                        );
                    }
                }
                Value::Undefined => {}
                other => {
                    return Err(Error::new("T1003", span, line)
                        .with_value(other.to_display_string()));
                }
            }
        }
    }

    let mut result = ObjectValue::default();
    for (key, entry) in groups {
        let (context, env) = if is_tuple {
            let mut tuple = reduce_tuple_stream(&entry.data);
            let context = tuple.shift_remove("@").unwrap_or(Value::Undefined);
            (context, frame_from_tuple(frame, &tuple))
        } else {
            (entry.data, frame.clone())
        };
        let value = evaluate(&pairs[entry.expr_index].1, &context, &env).await?;
        if !value.is_undefined() {
            result.insert(key, value);
        }
    }
    Ok(Value::Object(result))
}

/// Merge a collected group of tuples into one by appending same-key
/// bindings.
fn reduce_tuple_stream(data: &Value) -> ObjectValue {
    match data {
        Value::Object(tuple) => tuple.clone(),
        Value::Array(a) => {
            let mut iter = a.items.iter();
            let mut result = match iter.next() {
                Some(Value::Object(first)) => first.clone(),
                _ => ObjectValue::default(),
            };
            for item in iter {
                if let Value::Object(tuple) = item {
                    for (k, v) in tuple {
                        let existing = result.shift_remove(k).unwrap_or(Value::Undefined);
                        result.insert(k.clone(), existing.append(v.clone()));
                    }
                }
            }
            result
        }
        _ => ObjectValue::default(),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

pub(crate) fn as_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(a) => a.items.clone(),
        Value::Undefined => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Wrap binding tuples into a tuple-stream sequence value.
pub(crate) fn tuple_stream_value(tuples: Vec<ObjectValue>) -> Value {
    Value::Array(ArrayValue {
        items: tuples.into_iter().map(Value::Object).collect(),
        flags: ArrayFlags {
            sequence: true,
            tuple_stream: true,
            ..ArrayFlags::default()
        },
    })
}

fn to_tuples(value: Value) -> Vec<ObjectValue> {
    match value {
        Value::Array(a) => a
            .items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(t) => Some(t),
                _ => None,
            })
            .collect(),
        Value::Object(t) => vec![t],
        _ => Vec::new(),
    }
}

/// A child frame with every tuple binding installed.
pub(crate) fn frame_from_tuple(frame: &FrameRef, tuple: &ObjectValue) -> FrameRef {
    let child = Frame::child(frame);
    for (k, v) in tuple {
        child.bind(k.clone(), v.clone());
    }
    child
}
