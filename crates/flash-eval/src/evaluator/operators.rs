//! Binary operator evaluation.

use flash_common::{Error, Result};
use flash_parser::ast::{Node, NodeRef};

use super::evaluate;
use crate::frame::FrameRef;
use crate::value::{format_number, Value};

/// The maximum number of entries a range may allocate.
const MAX_RANGE_SIZE: f64 = 1e7;

pub(crate) async fn evaluate_binary(
    node: &Node,
    op: &'static str,
    lhs: &NodeRef,
    rhs: &NodeRef,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    match op {
        "+" | "-" | "*" | "/" | "%" => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            evaluate_numeric(node, op, left, right)
        }
        "=" | "!=" => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            if left.is_undefined() || right.is_undefined() {
                return Ok(Value::Bool(false));
            }
            let eq = left.deep_eq(&right);
            Ok(Value::Bool(if op == "=" { eq } else { !eq }))
        }
        "<" | "<=" | ">" | ">=" => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            evaluate_comparison(node, op, left, right)
        }
        "&" => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            let mut s = left.to_display_string();
            s.push_str(&right.to_display_string());
            Ok(Value::String(s))
        }
        "and" => {
            let left = evaluate(lhs, input, frame).await?;
            if !left.truthy() {
                return Ok(Value::Bool(false));
            }
            let right = evaluate(rhs, input, frame).await?;
            Ok(Value::Bool(right.truthy()))
        }
        "or" => {
            let left = evaluate(lhs, input, frame).await?;
            if left.truthy() {
                return Ok(Value::Bool(true));
            }
            let right = evaluate(rhs, input, frame).await?;
            Ok(Value::Bool(right.truthy()))
        }
        "in" => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            if left.is_undefined() || right.is_undefined() {
                return Ok(Value::Bool(false));
            }
            let found = match &right {
                Value::Array(a) => a.items.iter().any(|v| left.deep_eq(v)),
                other => left.deep_eq(other),
            };
            Ok(Value::Bool(found))
        }
        ".." => {
            let left = evaluate(lhs, input, frame).await?;
            let right = evaluate(rhs, input, frame).await?;
            evaluate_range(node, left, right)
        }
        other => Err(Error::new("S0204", node.span, node.line).with_token(other)),
    }
}

fn evaluate_numeric(node: &Node, op: &str, left: Value, right: Value) -> Result<Value> {
    if !left.is_undefined() && left.as_f64().is_none() {
        return Err(Error::new("T2001", node.span, node.line).with_token(op));
    }
    if !right.is_undefined() && right.as_f64().is_none() {
        return Err(Error::new("T2002", node.span, node.line).with_token(op));
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Ok(Value::Undefined);
    };
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a % b,
        _ => unreachable!("checked by caller"),
    };
    if !result.is_finite() {
        return Err(Error::new("D1001", node.span, node.line)
            .with_value(format_number(result)));
    }
    Ok(Value::Number(result))
}

fn evaluate_comparison(node: &Node, op: &str, left: Value, right: Value) -> Result<Value> {
    let comparable = |v: &Value| matches!(v, Value::Number(_) | Value::String(_));
    if !left.is_undefined() && !comparable(&left) {
        return Err(Error::new("T2010", node.span, node.line).with_token(op));
    }
    if !right.is_undefined() && !comparable(&right) {
        return Err(Error::new("T2010", node.span, node.line).with_token(op));
    }
    if left.is_undefined() || right.is_undefined() {
        return Ok(Value::Undefined);
    }
    let ordering = match (&left, &right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(Error::new("T2009", node.span, node.line)
                .with_token(op)
                .with_value(left.to_display_string())
                .with_value2(right.to_display_string()));
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => unreachable!("checked by caller"),
    };
    Ok(Value::Bool(result))
}

fn evaluate_range(node: &Node, left: Value, right: Value) -> Result<Value> {
    if !left.is_undefined() && left.as_integer().is_none() {
        return Err(Error::new("T2003", node.span, node.line));
    }
    if !right.is_undefined() && right.as_integer().is_none() {
        return Err(Error::new("T2004", node.span, node.line));
    }
    let (Some(start), Some(end)) = (left.as_integer(), right.as_integer()) else {
        return Ok(Value::Undefined);
    };
    if start > end {
        return Ok(Value::Undefined);
    }
    let size = (end - start + 1) as f64;
    if size > MAX_RANGE_SIZE {
        return Err(Error::new("D2014", node.span, node.line));
    }
    let items = (start..=end).map(|n| Value::Number(n as f64)).collect();
    Ok(Value::array(items))
}
