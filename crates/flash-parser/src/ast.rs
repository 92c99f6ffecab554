//! The abstract syntax tree shared by the parser, the post-processor, the
//! structure resolver and the evaluator.
//!
//! A single [`Node`] type serves both the raw tree emitted by the Pratt
//! parser and the normalized tree produced by the post-processor: raw-only
//! encodings (binary `.`/`[`/`{`/`^`/`@`/`#`/`~>` nodes) are rewritten into
//! their normalized forms (paths with stages, apply, focus/index binds) by
//! `process::process_ast`, after which the tree is immutable.
//!
//! Children are reference-counted so that lambda values can capture their
//! body nodes without cloning subtrees. Parent (`%`) slots use interior
//! mutability: a slot is shared between the `parent` node that allocated it
//! and the ancestor step it resolves to, and slot labels are merged during
//! ancestry resolution.

use std::cell::RefCell;
use std::rc::Rc;

use flash_common::Span;

/// Shared handle to an AST node.
pub type NodeRef = Rc<Node>;

/// Shared, mutable parent-slot record (the `%` operator).
pub type SlotRef = Rc<RefCell<Slot>>;

/// A parent-operator slot: the label keys tuple-stream bindings, the level
/// counts remaining steps up to the ancestor, the index identifies the slot
/// within one post-processing run.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub label: String,
    pub level: u32,
    pub index: usize,
}

/// A filter or index stage attached to a path step.
#[derive(Debug, Clone)]
pub enum Stage {
    Filter(NodeRef),
    Index(String),
}

/// One term of an order-by clause.
#[derive(Debug, Clone)]
pub struct SortTerm {
    pub expression: NodeRef,
    pub descending: bool,
}

/// A grouping expression (`{ key: value, ... }` applied over a sequence).
#[derive(Debug, Clone)]
pub struct GroupExpr {
    pub pairs: Vec<(NodeRef, NodeRef)>,
    pub span: Span,
    pub line: u32,
}

/// FLASH metadata carried by normalized `Block` nodes.
#[derive(Debug, Clone)]
pub struct FlashMeta {
    /// `false` for a flash block (`InstanceOf:` header), `true` for a rule.
    pub is_rule: bool,
    /// The `InstanceOf:` identifier of the enclosing (or own) block.
    pub instanceof_id: String,
    /// Blocks: the `Instance:` expression providing the resource id.
    pub instance: Option<NodeRef>,
    /// Rules: this rule's own step (name plus slice names).
    pub step: Option<FlashStep>,
    /// Rules: the full flash path from the block root, e.g. `name[english].given`.
    pub full_path: Option<String>,
    /// Rules: the inline expression after `=`, if any.
    pub inline: Option<NodeRef>,
}

/// One step of a flash path: a name with optional slice names.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashStep {
    pub name: String,
    pub slices: Vec<String>,
}

impl FlashStep {
    /// Render the step the way reference keys spell it: `name[slice][slice2]`.
    pub fn render(&self) -> String {
        let mut out = self.name.clone();
        for slice in &self.slices {
            out.push('[');
            out.push_str(slice);
            out.push(']');
        }
        out
    }
}

/// The kind-specific payload of an AST node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    // ── Literals ───────────────────────────────────────────────────────
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Regex { pattern: String, flags: String },

    // ── Leaves ─────────────────────────────────────────────────────────
    Name(String),
    Variable(String),
    Wildcard,
    Descendant,
    /// The `%` parent operator; the slot is allocated during post-processing.
    Parent(Option<SlotRef>),
    /// `?` placeholder inside a partial-application argument list.
    Placeholder,

    // ── Composite (raw and normalized) ─────────────────────────────────
    /// Infix operator node. Raw form for `.`/`[`/`{`/`^`/`@`/`#`/`~>` too;
    /// those are rewritten away by the post-processor.
    Binary { op: &'static str, lhs: NodeRef, rhs: NodeRef },
    /// Unary minus.
    Neg(NodeRef),
    /// Array constructor `[ ... ]`.
    ArrayConstructor { items: Vec<NodeRef> },
    /// Object constructor `{ key: value, ... }` in prefix position.
    ObjectConstructor { pairs: Vec<(NodeRef, NodeRef)> },
    /// Raw group-by: `lhs { key: value, ... }`. Normalized into the `group`
    /// field of the lhs node.
    GroupBy { lhs: NodeRef, pairs: Vec<(NodeRef, NodeRef)> },
    /// Raw order-by: `lhs ^ (terms)`. Normalized into a Sort path step.
    OrderBy { lhs: NodeRef, terms: Vec<SortTerm> },
    /// Normalized path of steps.
    Path { steps: Vec<NodeRef> },
    /// Sort step within a path (`^(...)`).
    Sort { terms: Vec<SortTerm> },
    /// Variable binding `$x := expr`.
    Bind { var: NodeRef, value: NodeRef },
    /// Conditional `cond ? then : else`.
    Condition { condition: NodeRef, then: NodeRef, otherwise: Option<NodeRef> },
    /// `lhs ?? rhs` -- rhs only when lhs is undefined.
    Coalesce { lhs: NodeRef, rhs: NodeRef },
    /// `lhs ?: rhs` -- rhs when lhs is falsy.
    Elvis { lhs: NodeRef, rhs: NodeRef },
    /// Parenthesized block of `;`-separated expressions. FLASH blocks and
    /// rules are blocks carrying `flash` metadata.
    Block { exprs: Vec<NodeRef> },
    /// Function or lambda invocation. `is_partial` when any argument is a
    /// placeholder, turning the call into partial application.
    FunctionCall { procedure: NodeRef, args: Vec<NodeRef>, is_partial: bool },
    /// Lambda definition. `thunk` marks deferred tail calls.
    Lambda {
        params: Vec<String>,
        body: NodeRef,
        signature: Option<String>,
        thunk: bool,
    },
    /// Function application `lhs ~> rhs` (normalized).
    Apply { lhs: NodeRef, rhs: NodeRef },
    /// Transform `|pattern|update[,delete]|`.
    Transform { pattern: NodeRef, update: NodeRef, delete: Option<NodeRef> },
    /// Placeholder produced in recover mode where parsing failed. The
    /// evaluator refuses to execute it.
    ErrorStub,
}

/// An AST node: a kind plus source location and the cross-cutting
/// attributes that paths, steps and grouping attach to arbitrary nodes.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub line: u32,

    /// `[]` on a step: keep the result an array even when singleton.
    pub keep_array: bool,
    /// On a path: some step had `keep_array`.
    pub keep_singleton_array: bool,
    /// On an array-constructor step: do not flatten its result into the
    /// surrounding sequence.
    pub cons_array: bool,
    /// Predicates applied to a non-path node after evaluation.
    pub predicates: Vec<NodeRef>,
    /// Stages applied to a path step (filters after focus binding, indexes).
    pub stages: Vec<Stage>,
    /// Grouping applied to this node's result.
    pub group: Option<GroupExpr>,
    /// Focus variable bound at this step (`@$var`).
    pub focus: Option<String>,
    /// Index variable bound at this step (`#$var`).
    pub index_var: Option<String>,
    /// Ancestor slot resolved onto this step (tuple-stream binding target).
    pub ancestor: Option<SlotRef>,
    /// This step emits a tuple stream.
    pub tuple: bool,
    /// Post-processing bookkeeping: parent slots not yet resolved to an
    /// ancestor step.
    pub seeking_parent: Vec<SlotRef>,
    /// FLASH metadata (blocks and rules only).
    pub flash: Option<FlashMeta>,
}

impl Node {
    /// Create a node with no attributes.
    pub fn new(kind: NodeKind, span: Span, line: u32) -> Self {
        Self {
            kind,
            span,
            line,
            keep_array: false,
            keep_singleton_array: false,
            cons_array: false,
            predicates: Vec::new(),
            stages: Vec::new(),
            group: None,
            focus: None,
            index_var: None,
            ancestor: None,
            tuple: false,
            seeking_parent: Vec::new(),
            flash: None,
        }
    }

    /// Wrap into a shared handle.
    pub fn rc(self) -> NodeRef {
        Rc::new(self)
    }

    /// Whether this node is a FLASH block.
    pub fn is_flash_block(&self) -> bool {
        matches!(&self.flash, Some(meta) if !meta.is_rule)
    }

    /// Whether this node is a FLASH rule.
    pub fn is_flash_rule(&self) -> bool {
        matches!(&self.flash, Some(meta) if meta.is_rule)
    }
}

/// Walk an AST depth-first, calling `visit` on every node.
pub fn walk(node: &NodeRef, visit: &mut impl FnMut(&NodeRef)) {
    visit(node);
    let mut each = |n: &NodeRef| walk(n, visit);
    match &node.kind {
        NodeKind::Binary { lhs, rhs, .. } => {
            each(lhs);
            each(rhs);
        }
        NodeKind::Neg(expr) => each(expr),
        NodeKind::ArrayConstructor { items } => items.iter().for_each(|i| walk(i, visit)),
        NodeKind::ObjectConstructor { pairs } => {
            for (k, v) in pairs {
                walk(k, visit);
                walk(v, visit);
            }
        }
        NodeKind::GroupBy { lhs, pairs } => {
            each(lhs);
            for (k, v) in pairs {
                walk(k, visit);
                walk(v, visit);
            }
        }
        NodeKind::OrderBy { lhs, terms } => {
            each(lhs);
            for t in terms {
                walk(&t.expression, visit);
            }
        }
        NodeKind::Path { steps } => steps.iter().for_each(|s| walk(s, visit)),
        NodeKind::Sort { terms } => terms.iter().for_each(|t| walk(&t.expression, visit)),
        NodeKind::Bind { var, value } => {
            each(var);
            each(value);
        }
        NodeKind::Condition { condition, then, otherwise } => {
            each(condition);
            each(then);
            if let Some(e) = otherwise {
                each(e);
            }
        }
        NodeKind::Coalesce { lhs, rhs } | NodeKind::Elvis { lhs, rhs } => {
            each(lhs);
            each(rhs);
        }
        NodeKind::Block { exprs } => exprs.iter().for_each(|e| walk(e, visit)),
        NodeKind::FunctionCall { procedure, args, .. } => {
            each(procedure);
            args.iter().for_each(|a| walk(a, visit));
        }
        NodeKind::Lambda { body, .. } => each(body),
        NodeKind::Apply { lhs, rhs } => {
            each(lhs);
            each(rhs);
        }
        NodeKind::Transform { pattern, update, delete } => {
            each(pattern);
            each(update);
            if let Some(d) = delete {
                each(d);
            }
        }
        _ => {}
    }
    // Cross-cutting attributes also hold expressions.
    for stage in &node.stages {
        if let Stage::Filter(f) = stage {
            walk(f, visit);
        }
    }
    for p in &node.predicates {
        walk(p, visit);
    }
    if let Some(group) = &node.group {
        for (k, v) in &group.pairs {
            walk(k, visit);
            walk(v, visit);
        }
    }
    if let Some(flash) = &node.flash {
        if let Some(instance) = &flash.instance {
            walk(instance, visit);
        }
        if let Some(inline) = &flash.inline {
            walk(inline, visit);
        }
    }
}
