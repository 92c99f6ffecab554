//! AST post-processor.
//!
//! Rewrites the raw parse tree into the normalized tree the evaluator
//! consumes: `.` chains become paths with flattened steps, filters and
//! order-by clauses become stages on steps, `@`/`#` become focus/index
//! bindings, `~>` becomes apply, lambda bodies get tail calls wrapped into
//! thunks, `%` parent references are resolved onto ancestor steps via
//! shared slots, and FLASH blocks/rules receive their type identifier and
//! full flash path.

use std::cell::RefCell;
use std::rc::Rc;

use flash_common::{Error, Result};

use crate::ast::{
    FlashMeta, GroupExpr, Node, NodeKind, NodeRef, Slot, SlotRef, SortTerm, Stage,
};

/// Normalize a raw parse tree.
pub fn process_ast(root: &NodeRef) -> Result<NodeRef> {
    let mut processor = Processor {
        ancestor_label: 0,
        ancestry: Vec::new(),
        flash_stack: Vec::new(),
    };
    processor.process(root)
}

struct Processor {
    /// Next parent-slot label number.
    ancestor_label: usize,
    /// All slots allocated during this run, indexed by `Slot::index`.
    ancestry: Vec<SlotRef>,
    /// Stack of (instanceof id, flash path) for the enclosing flash scopes.
    flash_stack: Vec<(String, String)>,
}

impl Processor {
    fn process(&mut self, node: &NodeRef) -> Result<NodeRef> {
        match &node.kind {
            NodeKind::Binary { op, lhs, rhs } => match *op {
                "." => self.process_path(node, lhs, rhs),
                "[" => self.process_filter(node, lhs, rhs),
                "@" => self.process_focus(node, lhs, rhs),
                "#" => self.process_index(node, lhs, rhs),
                "~>" => {
                    let lhs = self.process(lhs)?;
                    let rhs = self.process(rhs)?;
                    let mut result = Node::new(
                        NodeKind::Apply { lhs: lhs.clone(), rhs: rhs.clone() },
                        node.span,
                        node.line,
                    );
                    push_ancestry(&mut result, &lhs);
                    push_ancestry(&mut result, &rhs);
                    Ok(result.rc())
                }
                other => {
                    let lhs = self.process(lhs)?;
                    let rhs = self.process(rhs)?;
                    let mut result = Node::new(
                        NodeKind::Binary { op: other, lhs: lhs.clone(), rhs: rhs.clone() },
                        node.span,
                        node.line,
                    );
                    push_ancestry(&mut result, &lhs);
                    push_ancestry(&mut result, &rhs);
                    Ok(result.rc())
                }
            },
            NodeKind::GroupBy { lhs, pairs } => {
                let mut result = self.process(lhs)?;
                if result.group.is_some() {
                    return Err(Error::new("S0210", node.span, node.line));
                }
                let mut processed = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    processed.push((self.process(k)?, self.process(v)?));
                }
                let n = Rc::make_mut(&mut result);
                n.group = Some(GroupExpr {
                    pairs: processed,
                    span: node.span,
                    line: node.line,
                });
                Ok(result)
            }
            NodeKind::OrderBy { lhs, terms } => self.process_sort(node, lhs, terms),
            NodeKind::Neg(expr) => {
                let inner = self.process(expr)?;
                if let NodeKind::Number(n) = inner.kind {
                    return Ok(Node::new(NodeKind::Number(-n), node.span, node.line).rc());
                }
                let mut result =
                    Node::new(NodeKind::Neg(inner.clone()), node.span, node.line);
                push_ancestry(&mut result, &inner);
                Ok(result.rc())
            }
            NodeKind::ArrayConstructor { items } => {
                let mut result = Node::new(
                    NodeKind::ArrayConstructor { items: Vec::new() },
                    node.span,
                    node.line,
                );
                result.keep_array = node.keep_array;
                let mut processed = Vec::with_capacity(items.len());
                for item in items {
                    let item = self.process(item)?;
                    push_ancestry(&mut result, &item);
                    processed.push(item);
                }
                result.kind = NodeKind::ArrayConstructor { items: processed };
                Ok(result.rc())
            }
            NodeKind::ObjectConstructor { pairs } => {
                let mut result = Node::new(
                    NodeKind::ObjectConstructor { pairs: Vec::new() },
                    node.span,
                    node.line,
                );
                let mut processed = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.process(k)?;
                    push_ancestry(&mut result, &key);
                    let value = self.process(v)?;
                    push_ancestry(&mut result, &value);
                    processed.push((key, value));
                }
                result.kind = NodeKind::ObjectConstructor { pairs: processed };
                Ok(result.rc())
            }
            NodeKind::Block { exprs } => {
                if node.flash.is_some() {
                    return self.process_flash(node, exprs);
                }
                let mut result =
                    Node::new(NodeKind::Block { exprs: Vec::new() }, node.span, node.line);
                let mut processed = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    let part = self.process(expr)?;
                    push_ancestry(&mut result, &part);
                    if part.cons_array
                        || matches!(&part.kind, NodeKind::Path { steps }
                            if steps.first().map(|s| s.cons_array).unwrap_or(false))
                    {
                        result.cons_array = true;
                    }
                    processed.push(part);
                }
                result.kind = NodeKind::Block { exprs: processed };
                Ok(result.rc())
            }
            NodeKind::Bind { var, value } => {
                let var = self.process(var)?;
                let value = self.process(value)?;
                let mut result = Node::new(
                    NodeKind::Bind { var, value: value.clone() },
                    node.span,
                    node.line,
                );
                push_ancestry(&mut result, &value);
                Ok(result.rc())
            }
            NodeKind::Condition { condition, then, otherwise } => {
                let condition = self.process(condition)?;
                let then = self.process(then)?;
                let otherwise = match otherwise {
                    Some(e) => Some(self.process(e)?),
                    None => None,
                };
                let mut result = Node::new(
                    NodeKind::Condition {
                        condition: condition.clone(),
                        then: then.clone(),
                        otherwise: otherwise.clone(),
                    },
                    node.span,
                    node.line,
                );
                push_ancestry(&mut result, &condition);
                push_ancestry(&mut result, &then);
                if let Some(e) = &otherwise {
                    push_ancestry(&mut result, e);
                }
                Ok(result.rc())
            }
            NodeKind::Coalesce { lhs, rhs } => {
                let lhs = self.process(lhs)?;
                let rhs = self.process(rhs)?;
                let mut result = Node::new(
                    NodeKind::Coalesce { lhs: lhs.clone(), rhs: rhs.clone() },
                    node.span,
                    node.line,
                );
                push_ancestry(&mut result, &lhs);
                push_ancestry(&mut result, &rhs);
                Ok(result.rc())
            }
            NodeKind::Elvis { lhs, rhs } => {
                let lhs = self.process(lhs)?;
                let rhs = self.process(rhs)?;
                let mut result = Node::new(
                    NodeKind::Elvis { lhs: lhs.clone(), rhs: rhs.clone() },
                    node.span,
                    node.line,
                );
                push_ancestry(&mut result, &lhs);
                push_ancestry(&mut result, &rhs);
                Ok(result.rc())
            }
            NodeKind::FunctionCall { procedure, args, is_partial } => {
                let procedure = self.process(procedure)?;
                let mut result = Node::new(
                    NodeKind::FunctionCall {
                        procedure: procedure.clone(),
                        args: Vec::new(),
                        is_partial: *is_partial,
                    },
                    node.span,
                    node.line,
                );
                let mut processed = Vec::with_capacity(args.len());
                for arg in args {
                    let arg = self.process(arg)?;
                    push_ancestry(&mut result, &arg);
                    processed.push(arg);
                }
                result.kind = NodeKind::FunctionCall {
                    procedure,
                    args: processed,
                    is_partial: *is_partial,
                };
                Ok(result.rc())
            }
            NodeKind::Lambda { params, body, signature, thunk } => {
                let body = self.process(body)?;
                let body = tail_call_optimize(body);
                Ok(Node::new(
                    NodeKind::Lambda {
                        params: params.clone(),
                        body,
                        signature: signature.clone(),
                        thunk: *thunk,
                    },
                    node.span,
                    node.line,
                )
                .rc())
            }
            NodeKind::Transform { pattern, update, delete } => {
                let pattern = self.process(pattern)?;
                let update = self.process(update)?;
                let delete = match delete {
                    Some(d) => Some(self.process(d)?),
                    None => None,
                };
                Ok(Node::new(
                    NodeKind::Transform { pattern, update, delete },
                    node.span,
                    node.line,
                )
                .rc())
            }
            NodeKind::Parent(_) => {
                let slot = Rc::new(RefCell::new(Slot {
                    label: format!("!{}", self.ancestor_label),
                    level: 1,
                    index: self.ancestry.len(),
                }));
                self.ancestor_label += 1;
                self.ancestry.push(slot.clone());
                Ok(Node::new(NodeKind::Parent(Some(slot)), node.span, node.line).rc())
            }
            NodeKind::Name(_) => {
                // A bare name is a single-step path.
                let mut path = Node::new(
                    NodeKind::Path { steps: vec![node.clone()] },
                    node.span,
                    node.line,
                );
                path.keep_singleton_array = node.keep_array;
                Ok(path.rc())
            }
            // Leaves and already-normalized nodes pass through unchanged.
            _ => Ok(node.clone()),
        }
    }

    // ── Paths ──────────────────────────────────────────────────────────

    fn process_path(&mut self, node: &NodeRef, lhs: &NodeRef, rhs: &NodeRef) -> Result<NodeRef> {
        let lres = self.process(lhs)?;
        let mut keep_singleton = false;
        let mut group = None;
        let mut seeking = Vec::new();
        let mut steps = match &lres.kind {
            NodeKind::Path { steps } => {
                keep_singleton = lres.keep_singleton_array;
                group = lres.group.clone();
                seeking = lres.seeking_parent.clone();
                steps.clone()
            }
            NodeKind::Parent(Some(slot)) => {
                // A path that sets out from `%` asks its container to
                // resolve the slot.
                seeking.push(slot.clone());
                vec![lres]
            }
            _ => vec![lres],
        };

        let rest = self.process(rhs)?;
        match &rest.kind {
            NodeKind::Path { steps: rsteps } => {
                keep_singleton |= rest.keep_singleton_array;
                steps.extend(rsteps.iter().cloned());
            }
            _ => {
                let mut rest = rest;
                if !rest.predicates.is_empty() {
                    // Predicates on a step run as stages after focus binding.
                    let n = Rc::make_mut(&mut rest);
                    let preds = std::mem::take(&mut n.predicates);
                    n.stages = preds.into_iter().map(Stage::Filter).collect();
                }
                steps.push(rest);
            }
        }

        // Literal steps: strings become names, other literals are illegal.
        for step in steps.iter_mut() {
            match &step.kind {
                NodeKind::Number(n) => {
                    return Err(Error::new("S0213", step.span, step.line)
                        .with_value(format!("{n}")));
                }
                NodeKind::Bool(b) => {
                    return Err(Error::new("S0213", step.span, step.line)
                        .with_value(format!("{b}")));
                }
                NodeKind::Null => {
                    return Err(Error::new("S0213", step.span, step.line).with_value("null"));
                }
                NodeKind::Str(_) => {
                    let n = Rc::make_mut(step);
                    if let NodeKind::Str(s) = &n.kind {
                        n.kind = NodeKind::Name(s.clone());
                    }
                }
                _ => {}
            }
        }

        // `a.b[]` flags the raw binary itself.
        if node.keep_array || steps.iter().any(|s| s.keep_array) {
            keep_singleton = true;
        }
        if let Some(first) = steps.first_mut() {
            if matches!(first.kind, NodeKind::ArrayConstructor { .. }) {
                Rc::make_mut(first).cons_array = true;
            }
        }
        if let Some(last) = steps.last_mut() {
            if matches!(last.kind, NodeKind::ArrayConstructor { .. }) {
                Rc::make_mut(last).cons_array = true;
            }
        }

        let mut path = Node::new(NodeKind::Path { steps }, node.span, node.line);
        path.keep_singleton_array = keep_singleton;
        path.group = group;
        path.seeking_parent = seeking;
        let mut path = path.rc();
        self.resolve_ancestry(&mut path);
        Ok(path)
    }

    fn process_filter(&mut self, node: &NodeRef, lhs: &NodeRef, rhs: &NodeRef) -> Result<NodeRef> {
        let mut result = self.process(lhs)?;
        let predicate = self.process(rhs)?;
        let slots = collect_slots(&predicate);

        if matches!(result.kind, NodeKind::Path { .. }) {
            // Attach as a stage on the last step.
            let n = Rc::make_mut(&mut result);
            let NodeKind::Path { steps } = &mut n.kind else { unreachable!() };
            let target = steps.last_mut().expect("paths have at least one step");
            let target_node = Rc::make_mut(target);
            if target_node.group.is_some() {
                return Err(Error::new("S0209", node.span, node.line));
            }
            for slot in slots {
                if slot.borrow().level == 1 {
                    seek_parent(target_node, slot)?;
                } else {
                    slot.borrow_mut().level -= 1;
                    target_node.seeking_parent.push(slot);
                }
            }
            target_node.stages.push(Stage::Filter(predicate));
        } else {
            // Attach as a predicate on the node itself.
            if result.group.is_some() {
                return Err(Error::new("S0209", node.span, node.line));
            }
            Rc::make_mut(&mut result).predicates.push(predicate);
            for slot in slots {
                if slot.borrow().level == 1 {
                    seek_parent_into(&mut result, slot)?;
                } else {
                    slot.borrow_mut().level -= 1;
                    Rc::make_mut(&mut result).seeking_parent.push(slot);
                }
            }
        }
        Ok(result)
    }

    fn process_focus(&mut self, node: &NodeRef, lhs: &NodeRef, rhs: &NodeRef) -> Result<NodeRef> {
        let NodeKind::Variable(var) = &rhs.kind else {
            return Err(Error::new("S0214", node.span, node.line).with_token("@"));
        };
        let mut result = self.process(lhs)?;
        let n = Rc::make_mut(&mut result);
        if let NodeKind::Path { steps } = &mut n.kind {
            let target = Rc::make_mut(steps.last_mut().expect("paths have at least one step"));
            apply_focus(target, var, node)?;
        } else {
            apply_focus(n, var, node)?;
        }
        Ok(result)
    }

    fn process_index(&mut self, node: &NodeRef, lhs: &NodeRef, rhs: &NodeRef) -> Result<NodeRef> {
        let NodeKind::Variable(var) = &rhs.kind else {
            return Err(Error::new("S0214", node.span, node.line).with_token("#"));
        };
        let mut result = self.process(lhs)?;
        let n = Rc::make_mut(&mut result);
        if let NodeKind::Path { steps } = &mut n.kind {
            let target = Rc::make_mut(steps.last_mut().expect("paths have at least one step"));
            apply_index(target, var);
        } else {
            apply_index(n, var);
        }
        Ok(result)
    }

    fn process_sort(
        &mut self,
        node: &NodeRef,
        lhs: &NodeRef,
        terms: &[SortTerm],
    ) -> Result<NodeRef> {
        let lres = self.process(lhs)?;
        let (mut steps, keep_singleton, group, seeking) = match &lres.kind {
            NodeKind::Path { steps } => (
                steps.clone(),
                lres.keep_singleton_array,
                lres.group.clone(),
                lres.seeking_parent.clone(),
            ),
            _ => (vec![lres], false, None, Vec::new()),
        };

        let mut sort_step = Node::new(NodeKind::Sort { terms: Vec::new() }, node.span, node.line);
        let mut processed = Vec::with_capacity(terms.len());
        for term in terms {
            let expression = self.process(&term.expression)?;
            push_ancestry(&mut sort_step, &expression);
            processed.push(SortTerm { expression, descending: term.descending });
        }
        sort_step.kind = NodeKind::Sort { terms: processed };
        steps.push(sort_step.rc());

        let mut path = Node::new(NodeKind::Path { steps }, node.span, node.line);
        path.keep_singleton_array = keep_singleton;
        path.group = group;
        path.seeking_parent = seeking;
        let mut path = path.rc();
        self.resolve_ancestry(&mut path);
        Ok(path)
    }

    // ── Ancestry resolution ────────────────────────────────────────────

    /// Resolve the last step's pending parent slots against the preceding
    /// steps of the path. Slots that run out of steps are promoted to the
    /// path itself to be resolved by an enclosing path.
    fn resolve_ancestry(&mut self, path: &mut NodeRef) {
        let pnode = Rc::make_mut(path);
        let Node { kind, seeking_parent, .. } = pnode;
        let NodeKind::Path { steps } = kind else {
            return;
        };
        let last = steps.last().expect("paths have at least one step");
        let slots = collect_slots(last);

        'slots: for slot in slots {
            let mut index: isize = steps.len() as isize - 2;
            loop {
                if slot.borrow().level == 0 {
                    continue 'slots;
                }
                if index < 0 {
                    seeking_parent.push(slot.clone());
                    continue 'slots;
                }
                let mut step_idx = index as usize;
                index -= 1;
                // Contiguous focus-bound steps count as one ancestor level.
                while index >= 0
                    && steps[step_idx].focus.is_some()
                    && steps[index as usize].focus.is_some()
                {
                    step_idx = index as usize;
                    index -= 1;
                }
                slot.borrow_mut().level -= 1;
                if slot.borrow().level == 0 {
                    mark_ancestor(&mut steps[step_idx], &slot);
                    continue 'slots;
                }
            }
        }
    }

    // ── FLASH normalization ────────────────────────────────────────────

    fn process_flash(&mut self, node: &NodeRef, exprs: &[NodeRef]) -> Result<NodeRef> {
        let meta = node.flash.as_ref().expect("caller checked flash");
        if !meta.is_rule {
            if !valid_instanceof_id(&meta.instanceof_id) {
                return Err(Error::new("F1026", node.span, node.line)
                    .with_value(meta.instanceof_id.clone()));
            }
            let instance = match &meta.instance {
                Some(e) => Some(self.process(e)?),
                None => None,
            };
            self.flash_stack.push((meta.instanceof_id.clone(), String::new()));
            let processed = self.process_all(exprs);
            self.flash_stack.pop();
            let mut result = Node::new(NodeKind::Block { exprs: processed? }, node.span, node.line);
            result.flash = Some(FlashMeta {
                is_rule: false,
                instanceof_id: meta.instanceof_id.clone(),
                instance,
                step: None,
                full_path: None,
                inline: None,
            });
            Ok(result.rc())
        } else {
            let Some((id, parent_path)) = self.flash_stack.last().cloned() else {
                return Err(Error::new("F1009", node.span, node.line));
            };
            let step = meta.step.clone().expect("rules carry their step");
            let rendered = step.render();
            let full_path = if parent_path.is_empty() {
                rendered
            } else {
                format!("{parent_path}.{rendered}")
            };
            let inline = match &meta.inline {
                Some(e) => Some(self.process(e)?),
                None => None,
            };
            self.flash_stack.push((id.clone(), full_path.clone()));
            let processed = self.process_all(exprs);
            self.flash_stack.pop();
            let mut result = Node::new(NodeKind::Block { exprs: processed? }, node.span, node.line);
            result.flash = Some(FlashMeta {
                is_rule: true,
                instanceof_id: id,
                instance: None,
                step: Some(step),
                full_path: Some(full_path),
                inline,
            });
            Ok(result.rc())
        }
    }

    fn process_all(&mut self, exprs: &[NodeRef]) -> Result<Vec<NodeRef>> {
        exprs.iter().map(|e| self.process(e)).collect()
    }
}

/// Bind a focus variable on a step (`@$var`).
fn apply_focus(target: &mut Node, var: &str, node: &NodeRef) -> Result<()> {
    if !target.stages.is_empty() || !target.predicates.is_empty() {
        return Err(Error::new("S0215", node.span, node.line));
    }
    if matches!(target.kind, NodeKind::Sort { .. }) {
        return Err(Error::new("S0216", node.span, node.line));
    }
    target.focus = Some(var.to_string());
    target.tuple = true;
    Ok(())
}

/// Bind an index variable on a step (`#$var`). After predicates the index
/// becomes a stage so it reflects the filtered positions.
fn apply_index(target: &mut Node, var: &str) {
    if target.stages.is_empty() && target.predicates.is_empty() {
        target.index_var = Some(var.to_string());
    } else {
        target.stages.push(Stage::Index(var.to_string()));
    }
    target.tuple = true;
}

// ── Slot helpers ───────────────────────────────────────────────────────

/// The pending parent slots of a node: its seeking list plus, for a parent
/// node itself, its own slot.
fn collect_slots(node: &Node) -> Vec<SlotRef> {
    let mut slots = node.seeking_parent.clone();
    if let NodeKind::Parent(Some(slot)) = &node.kind {
        slots.push(slot.clone());
    }
    slots
}

/// Merge a child's pending parent slots into its container.
fn push_ancestry(target: &mut Node, value: &NodeRef) {
    let slots = collect_slots(value);
    target.seeking_parent.extend(slots);
}

/// Record a resolved slot on its ancestor step. When the step already has
/// an ancestor, the slots are merged by sharing the existing label.
fn mark_ancestor(step: &mut NodeRef, slot: &SlotRef) {
    let n = Rc::make_mut(step);
    if let Some(existing) = &n.ancestor {
        slot.borrow_mut().label = existing.borrow().label.clone();
    }
    n.ancestor = Some(slot.clone());
    n.tuple = true;
}

/// Walk one level of a containing construct looking for the step a slot's
/// parent reference resolves to.
fn seek_parent(node: &mut Node, slot: SlotRef) -> Result<()> {
    match &mut node.kind {
        NodeKind::Name(_) | NodeKind::Wildcard => {
            let level = {
                let mut s = slot.borrow_mut();
                s.level -= 1;
                s.level
            };
            if level == 0 {
                if let Some(existing) = &node.ancestor {
                    slot.borrow_mut().label = existing.borrow().label.clone();
                }
                node.ancestor = Some(slot);
                node.tuple = true;
            }
        }
        NodeKind::Parent(_) => {
            slot.borrow_mut().level += 1;
        }
        NodeKind::Block { exprs } => {
            if let Some(last) = exprs.last_mut() {
                node.tuple = true;
                seek_parent_into(last, slot)?;
            }
        }
        NodeKind::Path { steps } => {
            node.tuple = true;
            let mut idx = steps.len();
            while slot.borrow().level > 0 && idx > 0 {
                idx -= 1;
                seek_parent_into(&mut steps[idx], slot.clone())?;
            }
        }
        _ => {
            return Err(Error::new("S0217", node.span, node.line)
                .with_token(kind_name(&node.kind)));
        }
    }
    Ok(())
}

fn seek_parent_into(node: &mut NodeRef, slot: SlotRef) -> Result<()> {
    seek_parent(Rc::make_mut(node), slot)
}

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Number(_) => "number",
        NodeKind::Str(_) => "string",
        NodeKind::Bool(_) => "value",
        NodeKind::Null => "value",
        NodeKind::Regex { .. } => "regex",
        NodeKind::Name(_) => "name",
        NodeKind::Variable(_) => "variable",
        NodeKind::Wildcard => "wildcard",
        NodeKind::Descendant => "descendant",
        NodeKind::Parent(_) => "parent",
        NodeKind::Placeholder => "operator",
        NodeKind::Binary { .. } => "binary",
        NodeKind::Neg(_) => "unary",
        NodeKind::ArrayConstructor { .. } => "unary",
        NodeKind::ObjectConstructor { .. } => "unary",
        NodeKind::GroupBy { .. } => "binary",
        NodeKind::OrderBy { .. } => "binary",
        NodeKind::Path { .. } => "path",
        NodeKind::Sort { .. } => "sort",
        NodeKind::Bind { .. } => "bind",
        NodeKind::Condition { .. } => "condition",
        NodeKind::Coalesce { .. } => "coalesce",
        NodeKind::Elvis { .. } => "elvis",
        NodeKind::Block { .. } => "block",
        NodeKind::FunctionCall { .. } => "function",
        NodeKind::Lambda { .. } => "lambda",
        NodeKind::Apply { .. } => "apply",
        NodeKind::Transform { .. } => "transform",
        NodeKind::ErrorStub => "error",
    }
}

/// Validate an `InstanceOf:` identifier: a url/urn, a FHIR id, or a
/// computable name.
fn valid_instanceof_id(id: &str) -> bool {
    if id.starts_with("http://") || id.starts_with("https://") || id.starts_with("urn:") {
        return true;
    }
    let is_id = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if is_id {
        return true;
    }
    let starts_alpha = id.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    starts_alpha
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Wrap tail-position function calls in thunks so the evaluator's
/// trampoline can run them without growing the stack.
fn tail_call_optimize(body: NodeRef) -> NodeRef {
    match &body.kind {
        NodeKind::FunctionCall { is_partial: false, .. } if body.predicates.is_empty() => {
            let span = body.span;
            let line = body.line;
            Node::new(
                NodeKind::Lambda {
                    params: Vec::new(),
                    body,
                    signature: None,
                    thunk: true,
                },
                span,
                line,
            )
            .rc()
        }
        NodeKind::Condition { condition, then, otherwise } => {
            let then = tail_call_optimize(then.clone());
            let otherwise = otherwise.clone().map(tail_call_optimize);
            let mut node = Node::new(
                NodeKind::Condition { condition: condition.clone(), then, otherwise },
                body.span,
                body.line,
            );
            node.seeking_parent = body.seeking_parent.clone();
            node.rc()
        }
        NodeKind::Block { exprs } if body.flash.is_none() && !exprs.is_empty() => {
            let mut exprs = exprs.clone();
            let last = exprs.pop().expect("non-empty");
            exprs.push(tail_call_optimize(last));
            let mut node = Node::new(NodeKind::Block { exprs }, body.span, body.line);
            node.seeking_parent = body.seeking_parent.clone();
            node.cons_array = body.cons_array;
            node.rc()
        }
        _ => body,
    }
}
