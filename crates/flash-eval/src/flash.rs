//! The FLASH sub-evaluator: composes typed resources against the resolved
//! structure model.
//!
//! A FLASH block or rule is a block node carrying flash metadata. Rules
//! evaluate to [`FlashRuleResult`] values (`{key, value, kind}`) that the
//! enclosing block or rule collects by grouping key; composition then walks
//! the element's declared children in order, gathering values from the
//! inline expression first and sub-expression results second, enforcing
//! cardinality and mandatory children, splitting primitives into parallel
//! `name`/`_name` arrays, folding slice-keyed entries into their parent
//! arrays, coercing system scalars against the primitive format regex, and
//! injecting the profile url into `meta.profile` for constrained resources.

use std::rc::Rc;

use flash_common::{Error, Result, Span};
use flash_model::resolver::element_key;
use flash_model::{Derivation, ResolvedElement, StructureDictionaries, StructureKind};
use flash_parser::ast::{FlashMeta, NodeKind, NodeRef};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::evaluator::evaluate;
use crate::frame::{Frame, FrameRef, RootContext};
use crate::value::{format_number, FlashRuleResult, ObjectValue, Value};

/// Sub-expression results grouped by their output key, remembering the
/// order in which each key first contributed.
#[derive(Default)]
struct SubResults {
    groups: IndexMap<String, SubGroup>,
}

struct SubGroup {
    values: Vec<Value>,
    order: usize,
}

impl SubResults {
    fn push(&mut self, key: String, value: Value) {
        let next_order = self.groups.len();
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| SubGroup { values: Vec::new(), order: next_order });
        group.values.push(value);
    }

    fn get(&self, key: &str) -> Option<&SubGroup> {
        self.groups.get(key)
    }
}

/// Entry point: evaluate a flash block or rule node.
pub(crate) async fn evaluate_flash(
    node: &NodeRef,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    let meta = node.flash.as_ref().expect("caller checked flash");
    if meta.is_rule {
        evaluate_rule(node, meta, input, frame).await
    } else {
        evaluate_block(node, meta, input, frame).await
    }
}

// ── Blocks ─────────────────────────────────────────────────────────────

async fn evaluate_block(
    node: &NodeRef,
    meta: &FlashMeta,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    let ctx = frame.root_ctx().clone();
    let dicts = &ctx.dicts;

    let Some(type_meta) = dicts.type_meta.get(&meta.instanceof_id) else {
        return Err(Error::new("F3000", node.span, node.line)
            .with_value(meta.instanceof_id.clone()));
    };
    let children = dicts
        .type_children
        .get(&meta.instanceof_id)
        .cloned()
        .unwrap_or_default();
    let resource_type = matches!(type_meta.kind, StructureKind::Resource)
        .then(|| type_meta.type_code.clone());
    let profile_url = (type_meta.derivation == Some(Derivation::Constraint))
        .then(|| type_meta.url.clone());

    let block_frame = Frame::child(frame);
    let mut sub = SubResults::default();

    // The `Instance:` expression provides the resource id.
    if let Some(instance) = &meta.instance {
        let value = evaluate(instance, input, &block_frame).await?;
        if keep_value(&value) {
            sub.push("id".to_string(), value);
        }
    }

    let NodeKind::Block { exprs } = &node.kind else {
        unreachable!("flash nodes are blocks");
    };
    eval_sub_expressions(exprs, input, &block_frame, &mut sub).await?;

    let composer = Composer {
        dicts,
        ctx: &ctx,
        span: node.span,
        line: node.line,
    };
    let composed = composer.compose(
        &children,
        &Value::Undefined,
        &sub,
        resource_type.as_deref(),
        profile_url.as_deref(),
        &type_meta.type_code,
    )?;

    // A primitive-type instance is its bare value.
    if type_meta.kind == StructureKind::PrimitiveType {
        if let Value::Object(obj) = composed {
            return Ok(obj.get("value").cloned().unwrap_or(Value::Undefined));
        }
        return Ok(Value::Undefined);
    }
    Ok(composed)
}

// ── Rules ──────────────────────────────────────────────────────────────

async fn evaluate_rule(
    node: &NodeRef,
    meta: &FlashMeta,
    input: &Value,
    frame: &FrameRef,
) -> Result<Value> {
    let ctx = frame.root_ctx().clone();
    let dicts = &ctx.dicts;
    let full_path = meta.full_path.as_deref().unwrap_or_default();
    let key = element_key(&meta.instanceof_id, full_path);

    let Some(element) = dicts.element_definitions.get(&key) else {
        return Err(Error::new("F3003", node.span, node.line).with_value(full_path));
    };
    if element.def.is_forbidden() {
        return Err(Error::new("F3008", node.span, node.line).with_value(full_path));
    }
    if element.json_names.len() > 1 {
        return Err(Error::new("F3005", node.span, node.line).with_value(full_path));
    }

    let rule_frame = Frame::child(frame);

    // Inline expression first, in source order.
    let mut inline = Value::Undefined;
    if let Some(inline_expr) = &meta.inline {
        let value = evaluate(inline_expr, input, &rule_frame).await?;
        if keep_value(&value) {
            inline = value;
        }
    }

    let NodeKind::Block { exprs } = &node.kind else {
        unreachable!("flash nodes are blocks");
    };
    let mut sub = SubResults::default();
    eval_sub_expressions(exprs, input, &rule_frame, &mut sub).await?;

    // A fixed value overrides whatever was assigned.
    if let Some(fixed) = &element.fixed_value {
        return Ok(rule_result(element, Value::from_json(fixed)));
    }

    let kind = element
        .kind
        .ok_or_else(|| Error::new("F3004", node.span, node.line).with_value(full_path))?;

    let composer = Composer {
        dicts,
        ctx: &ctx,
        span: node.span,
        line: node.line,
    };

    let value = match kind {
        StructureKind::System => composer.coerce(&inline, element)?,
        StructureKind::PrimitiveType => {
            let children = dicts
                .element_children
                .get(&key)
                .cloned()
                .unwrap_or_default();
            composer.compose_primitive(element, &children, &inline, &sub, full_path)?
        }
        StructureKind::ComplexType | StructureKind::Resource => {
            let children = dicts
                .element_children
                .get(&key)
                .cloned()
                .ok_or_else(|| {
                    Error::new("F3003", node.span, node.line).with_value(full_path)
                })?;
            let composed =
                composer.compose(&children, &inline, &sub, None, None, full_path)?;
            match (&element.pattern_value, composed) {
                (Some(pattern), Value::Object(obj)) => {
                    // The pattern provides a base the user content overlays.
                    let mut merged = match Value::from_json(pattern) {
                        Value::Object(base) => base,
                        _ => ObjectValue::default(),
                    };
                    for (k, v) in obj {
                        merged.insert(k, v);
                    }
                    Value::Object(merged)
                }
                (_, composed) => composed,
            }
        }
    };

    if value.is_undefined() {
        return Ok(Value::Undefined);
    }
    Ok(rule_result(element, value))
}

/// Wrap a composed value as a flash-rule result under the element's
/// grouping key (`name:slice` for slices, the JSON name otherwise).
fn rule_result(element: &ResolvedElement, value: Value) -> Value {
    Value::FlashRule(Rc::new(FlashRuleResult {
        key: element.group_key(),
        value,
        kind: element.kind,
    }))
}

/// Whether an evaluated value is kept: truthy values, plus explicit
/// `false` and `0`. Undefined (and other falsy values) drop the
/// assignment.
fn keep_value(value: &Value) -> bool {
    value.truthy()
        || matches!(value, Value::Bool(false))
        || matches!(value, Value::Number(n) if *n == 0.0)
}

/// Evaluate the sub-expressions of a block/rule in order: binds execute
/// for their side effect, everything else contributes flash-rule results.
async fn eval_sub_expressions(
    exprs: &[NodeRef],
    input: &Value,
    frame: &FrameRef,
    sub: &mut SubResults,
) -> Result<()> {
    for expr in exprs {
        if matches!(expr.kind, NodeKind::Bind { .. }) {
            evaluate(expr, input, frame).await?;
            continue;
        }
        let value = evaluate(expr, input, frame).await?;
        collect_rule_results(value, sub);
    }
    Ok(())
}

fn collect_rule_results(value: Value, sub: &mut SubResults) {
    match value {
        Value::FlashRule(result) => sub.push(result.key.clone(), result.value.clone()),
        Value::Array(a) => {
            for item in a.items {
                collect_rule_results(item, sub);
            }
        }
        _ => {}
    }
}

// ── Composition ────────────────────────────────────────────────────────

struct Composer<'a> {
    dicts: &'a StructureDictionaries,
    ctx: &'a Rc<RootContext>,
    span: Span,
    line: u32,
}

impl<'a> Composer<'a> {
    /// Compose an object from the declared children, the inline result and
    /// the collected sub-expression results.
    fn compose(
        &self,
        children: &[ResolvedElement],
        inline: &Value,
        sub: &SubResults,
        resource_type: Option<&str>,
        profile_url: Option<&str>,
        parent_path: &str,
    ) -> Result<Value> {
        let inline_obj = inline.as_object();
        let mut out = ObjectValue::default();
        // First-contribution order per output key, for slice folding.
        let mut write_order: FxHashMap<String, usize> = FxHashMap::default();

        if let Some(rt) = resource_type {
            out.insert("resourceType".to_string(), Value::string(rt));
        }

        for child in children {
            let is_slice = child.def.slice_name.is_some();
            let group_keys: Vec<String> = if is_slice {
                vec![child.group_key()]
            } else {
                child.json_names.clone()
            };
            for gkey in group_keys {
                let mut values: Vec<Value> = Vec::new();

                // (a) inline result properties, by exact JSON name (plus
                // `_name` primitive siblings). Slices only collect from
                // their own rules.
                if !is_slice {
                    if let Some(io) = inline_obj {
                        let name_val = io.get(&gkey);
                        let sibling_val = if is_primitive(child) {
                            io.get(&format!("_{gkey}"))
                        } else {
                            None
                        };
                        values.extend(pair_inline_values(
                            name_val,
                            sibling_val,
                            child.is_array,
                        ));
                    }
                }

                // (b) sub-expression results at this grouping key.
                let mut order = usize::MAX;
                if let Some(group) = sub.get(&gkey) {
                    order = group.order;
                    for v in &group.values {
                        match v {
                            Value::Array(a) if child.is_array => {
                                values.extend(a.items.clone());
                            }
                            v => values.push(v.clone()),
                        }
                    }
                }

                if values.is_empty() {
                    // Mandatory children synthesize their fixed/pattern
                    // content; everything else is skipped.
                    if child.is_mandatory() && !is_slice {
                        match self.virtual_value(child, 0) {
                            Some(v) => values.push(v),
                            None => continue,
                        }
                    } else {
                        continue;
                    }
                }

                self.write_child(&mut out, &gkey, child, values)?;
                write_order.insert(gkey, order);
            }
        }

        fold_slices(&mut out, &write_order);

        // Whether anything beyond the resource type was composed; injected
        // metadata alone does not make a resource.
        let had_content = out.keys().any(|k| k != "resourceType");

        if let Some(url) = profile_url {
            inject_profile(&mut out, url);
        }

        self.check_mandatory(children, &out, parent_path)?;

        if !had_content {
            return Ok(Value::Undefined);
        }
        Ok(Value::Object(out))
    }

    /// Write one child's collected values into the output, shaping them by
    /// kind and cardinality.
    fn write_child(
        &self,
        out: &mut ObjectValue,
        gkey: &str,
        child: &ResolvedElement,
        values: Vec<Value>,
    ) -> Result<()> {
        match child.kind {
            Some(StructureKind::PrimitiveType) => {
                let parts: Vec<(Value, Option<ObjectValue>)> =
                    values.into_iter().map(split_primitive_item).collect();
                if child.is_array {
                    let any_scalar = parts.iter().any(|(s, _)| !s.is_undefined());
                    let any_sibling = parts.iter().any(|(_, sib)| sib.is_some());
                    if any_scalar {
                        let scalars = parts
                            .iter()
                            .map(|(s, _)| if s.is_undefined() { Value::Null } else { s.clone() })
                            .collect();
                        out.insert(gkey.to_string(), Value::array(scalars));
                    }
                    if any_sibling {
                        let siblings = parts
                            .iter()
                            .map(|(_, sib)| match sib {
                                Some(o) => Value::Object(o.clone()),
                                None => Value::Null,
                            })
                            .collect();
                        out.insert(format!("_{gkey}"), Value::array(siblings));
                    }
                } else {
                    let scalar = parts
                        .iter()
                        .rev()
                        .map(|(s, _)| s)
                        .find(|s| !s.is_undefined())
                        .cloned();
                    let mut sibling = ObjectValue::default();
                    for (_, sib) in &parts {
                        if let Some(o) = sib {
                            for (k, v) in o {
                                sibling.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    if let Some(s) = scalar {
                        out.insert(gkey.to_string(), s);
                    }
                    if !sibling.is_empty() {
                        out.insert(format!("_{gkey}"), Value::Object(sibling));
                    }
                }
            }
            Some(StructureKind::ComplexType) | Some(StructureKind::Resource) => {
                if child.is_array {
                    out.insert(gkey.to_string(), Value::array(values));
                } else {
                    // Scalar complex values shallow-merge.
                    let mut merged = ObjectValue::default();
                    let mut non_object = None;
                    for v in values {
                        match v {
                            Value::Object(o) => {
                                for (k, val) in o {
                                    merged.insert(k, val);
                                }
                            }
                            other => non_object = Some(other),
                        }
                    }
                    if merged.is_empty() {
                        if let Some(v) = non_object {
                            out.insert(gkey.to_string(), v);
                        }
                    } else {
                        out.insert(gkey.to_string(), Value::Object(merged));
                    }
                }
            }
            // System scalars and unresolved polymorphics pass through.
            _ => {
                if child.is_array {
                    out.insert(gkey.to_string(), Value::array(values));
                } else if let Some(last) = values.into_iter().last() {
                    out.insert(gkey.to_string(), last);
                }
            }
        }
        Ok(())
    }

    /// Compose a primitive-kind rule: the inline scalar becomes the value
    /// (coerced against the primitive format), nested rules compose the
    /// sibling object (extensions and friends).
    fn compose_primitive(
        &self,
        element: &ResolvedElement,
        children: &[ResolvedElement],
        inline: &Value,
        sub: &SubResults,
        path: &str,
    ) -> Result<Value> {
        let composed = self.compose(children, inline, sub, None, None, path)?;
        let mut siblings = match composed {
            Value::Object(o) => o,
            _ => ObjectValue::default(),
        };
        let nested_value = siblings.shift_remove("value");

        let scalar = if !matches!(inline, Value::Object(_) | Value::Undefined) {
            self.coerce(inline, element)?
        } else {
            nested_value.unwrap_or(Value::Undefined)
        };

        if siblings.is_empty() {
            return Ok(scalar);
        }
        let mut obj = ObjectValue::default();
        if !scalar.is_undefined() {
            obj.insert("value".to_string(), scalar);
        }
        for (k, v) in siblings {
            obj.insert(k, v);
        }
        Ok(Value::Object(obj))
    }

    // ── Coercion ───────────────────────────────────────────────────────

    /// Coerce an inline result for a system/primitive element, honoring
    /// cardinality: array elements coerce every item, scalar elements take
    /// the last.
    fn coerce(&self, value: &Value, element: &ResolvedElement) -> Result<Value> {
        match value {
            Value::Undefined => Ok(Value::Undefined),
            Value::Array(a) => {
                if element.is_array {
                    let mut out = Vec::with_capacity(a.items.len());
                    for item in &a.items {
                        let coerced = self.coerce_one(item, element)?;
                        if !coerced.is_undefined() {
                            out.push(coerced);
                        }
                    }
                    if out.is_empty() {
                        Ok(Value::Undefined)
                    } else {
                        Ok(Value::array(out))
                    }
                } else {
                    match a.items.last() {
                        Some(last) => self.coerce_one(last, element),
                        None => Ok(Value::Undefined),
                    }
                }
            }
            other => self.coerce_one(other, element),
        }
    }

    /// Coerce one scalar to the element's type code and validate it
    /// against the primitive format regex.
    fn coerce_one(&self, value: &Value, element: &ResolvedElement) -> Result<Value> {
        let type_code = element.type_code.as_deref().ok_or_else(|| {
            Error::new("F3007", self.span, self.line)
                .with_value(element.def.path.clone())
        })?;

        let coerced = match value {
            Value::Bool(_) | Value::Number(_) | Value::String(_) => match type_code {
                "boolean" => {
                    let b = match value {
                        Value::String(s) if s == "false" || s == "FALSE" => false,
                        v => v.truthy(),
                    };
                    Value::Bool(b)
                }
                "decimal" | "integer" | "positiveInt" | "integer64" | "unsignedInt" => {
                    let n = match value {
                        Value::Number(n) => *n,
                        Value::Bool(b) => {
                            if *b {
                                1.0
                            } else {
                                0.0
                            }
                        }
                        Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                            self.format_error(s, type_code)
                        })?,
                        _ => unreachable!("scalar checked above"),
                    };
                    Value::Number(n)
                }
                _ => Value::String(match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => format_number(*n),
                    Value::Bool(b) => b.to_string(),
                    _ => unreachable!("scalar checked above"),
                }),
            },
            _ => return Err(Error::new("F3006", self.span, self.line)),
        };

        if let Some(regex_str) = &element.regex_str {
            // Validate the lexical form the author supplied where one
            // exists (`'007'` fails the integer format even though it
            // parses). Booleans accept any truthy lexical form, so only
            // their coerced rendering is checked.
            let mut rendered = match value {
                Value::String(s) if type_code != "boolean" => s.clone(),
                _ => coerced.to_display_string(),
            };
            if type_code == "date" {
                rendered = rendered.chars().take(10).collect();
            }
            let compiled = self
                .ctx
                .compiled_regex(regex_str, "", self.span, self.line)?;
            if !compiled.matcher.full_match(&rendered) {
                return Err(self.format_error(&rendered, type_code));
            }
        }
        Ok(coerced)
    }

    fn format_error(&self, value: &str, type_code: &str) -> Error {
        Error::new("F3001", self.span, self.line)
            .with_value(value)
            .with_value2(type_code)
    }

    // ── Virtual rules ──────────────────────────────────────────────────

    /// The value a mandatory child takes when nothing was assigned: its
    /// fixed or pattern value, or an object composed recursively from the
    /// fixed/pattern values of its own mandatory children.
    fn virtual_value(&self, child: &ResolvedElement, depth: usize) -> Option<Value> {
        if depth > 16 {
            return None;
        }
        if let Some(fixed) = &child.fixed_value {
            return Some(Value::from_json(fixed));
        }
        if let Some(pattern) = &child.pattern_value {
            return Some(Value::from_json(pattern));
        }
        if matches!(
            child.kind,
            Some(StructureKind::ComplexType) | Some(StructureKind::Resource)
        ) {
            let key = child.flash_path_ref_key.as_ref()?;
            let grandchildren = self.dicts.element_children.get(key)?;
            let mut obj = ObjectValue::default();
            for gc in grandchildren {
                if gc.json_names.len() > 1 {
                    continue;
                }
                let wanted = gc.fixed_value.is_some()
                    || gc.pattern_value.is_some()
                    || gc.is_mandatory();
                if !wanted {
                    continue;
                }
                let Some(v) = self.virtual_value(gc, depth + 1) else {
                    continue;
                };
                let name = gc.json_names.first()?.clone();
                let value = if gc.is_array { Value::array(vec![v]) } else { v };
                obj.insert(name, value);
            }
            if !obj.is_empty() {
                return Some(Value::Object(obj));
            }
        }
        None
    }

    // ── Mandatory enforcement ──────────────────────────────────────────

    /// Every child with `min >= 1` must be present with at least `min`
    /// values.
    fn check_mandatory(
        &self,
        children: &[ResolvedElement],
        out: &ObjectValue,
        parent_path: &str,
    ) -> Result<()> {
        for child in children {
            if !child.is_mandatory() || child.def.slice_name.is_some() {
                continue;
            }
            let min = child.def.min;
            let present = child.json_names.iter().any(|name| match out.get(name) {
                Some(v) if !v.is_undefined() => {
                    if min > 1 {
                        matches!(v, Value::Array(a) if a.items.len() >= min as usize)
                    } else {
                        true
                    }
                }
                _ => false,
            });
            if !present {
                return Err(Error::new("F3002", self.span, self.line)
                    .with_fhir_element(child.def.base_name())
                    .with_fhir_path(parent_path));
            }
        }
        Ok(())
    }
}

// ── Shaping helpers ────────────────────────────────────────────────────

fn is_primitive(child: &ResolvedElement) -> bool {
    matches!(child.kind, Some(StructureKind::PrimitiveType))
}

/// Split a collected primitive item into its scalar part and sibling
/// object (`{value: ..., extension: ...}` shapes carry both).
fn split_primitive_item(value: Value) -> (Value, Option<ObjectValue>) {
    match value {
        Value::Object(mut o) => {
            let scalar = o.shift_remove("value").unwrap_or(Value::Undefined);
            if o.is_empty() {
                (scalar, None)
            } else {
                (scalar, Some(o))
            }
        }
        v => (v, None),
    }
}

/// Zip inline `name` / `_name` entries into combined items so that scalar
/// and sibling parts stay index-aligned.
fn pair_inline_values(
    name_val: Option<&Value>,
    sibling_val: Option<&Value>,
    is_array: bool,
) -> Vec<Value> {
    let scalars: Vec<Value> = match name_val {
        None => Vec::new(),
        Some(Value::Array(a)) if is_array => a.items.clone(),
        Some(v) => vec![v.clone()],
    };
    let siblings: Vec<Value> = match sibling_val {
        None => Vec::new(),
        Some(Value::Array(a)) if is_array => a.items.clone(),
        Some(v) => vec![v.clone()],
    };
    if siblings.is_empty() {
        return scalars;
    }
    let len = scalars.len().max(siblings.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let scalar = scalars.get(i).cloned().unwrap_or(Value::Undefined);
        let sibling = siblings.get(i).cloned();
        let mut obj = ObjectValue::default();
        if !scalar.is_undefined() && !matches!(scalar, Value::Null) {
            obj.insert("value".to_string(), scalar);
        }
        if let Some(Value::Object(sib)) = sibling {
            for (k, v) in sib {
                obj.insert(k, v);
            }
        }
        out.push(Value::Object(obj));
    }
    out
}

/// Fold slice-keyed entries (`name:slice`, `_name:slice`) into their
/// parent keys, ordering contributions by first assignment.
fn fold_slices(out: &mut ObjectValue, write_order: &FxHashMap<String, usize>) {
    let mut bases: Vec<String> = Vec::new();
    for key in out.keys() {
        if let Some(colon) = key.find(':') {
            let base = key[..colon].to_string();
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
    }
    for base in bases {
        let prefix = format!("{base}:");
        let keys: Vec<String> = out
            .keys()
            .filter(|k| *k == &base || k.starts_with(&prefix))
            .cloned()
            .collect();
        let mut contributions: Vec<(usize, Vec<Value>)> = Vec::new();
        for key in keys {
            let order = write_order.get(&key).copied().unwrap_or(usize::MAX);
            let Some(value) = out.shift_remove(&key) else { continue };
            let items = match value {
                Value::Array(a) => a.items,
                v => vec![v],
            };
            contributions.push((order, items));
        }
        contributions.sort_by_key(|(order, _)| *order);
        let mut merged = Vec::new();
        for (_, items) in contributions {
            merged.extend(items);
        }
        out.insert(base, Value::array(merged));
    }
}

/// Ensure `meta.profile` contains the profile url.
fn inject_profile(out: &mut ObjectValue, url: &str) {
    let meta = out
        .entry("meta".to_string())
        .or_insert_with(|| Value::Object(ObjectValue::default()));
    if let Value::Object(m) = meta {
        let profile = m
            .entry("profile".to_string())
            .or_insert_with(|| Value::array(Vec::new()));
        match profile {
            Value::Array(a) => {
                if !a.items.iter().any(|v| v.as_str() == Some(url)) {
                    a.items.push(Value::string(url));
                }
            }
            other => {
                if other.as_str() != Some(url) {
                    let existing = other.clone();
                    *other = Value::array(vec![existing, Value::string(url)]);
                }
            }
        }
    }
}
