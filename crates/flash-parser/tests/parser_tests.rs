//! Parser and post-processor integration tests.
//!
//! These assert the normalized AST shapes that the evaluator relies on:
//! flattened paths, stage attachment, singleton-array propagation, parent
//! slot resolution, thunk rewriting, and FLASH block/rule normalization.

use flash_parser::ast::{Node, NodeKind, NodeRef, Stage};
use flash_parser::parse;

fn parse_ok(source: &str) -> NodeRef {
    parse(source, false)
        .unwrap_or_else(|e| panic!("parse of {source:?} failed: {e}"))
        .ast
}

fn parse_err(source: &str) -> &'static str {
    parse(source, false)
        .err()
        .unwrap_or_else(|| panic!("parse of {source:?} should fail"))
        .code
}

fn path_steps(node: &NodeRef) -> &[NodeRef] {
    match &node.kind {
        NodeKind::Path { steps } => steps,
        other => panic!("expected path, got {other:?}"),
    }
}

fn step_name(step: &Node) -> &str {
    match &step.kind {
        NodeKind::Name(n) => n,
        other => panic!("expected name step, got {other:?}"),
    }
}

// ── Paths ──────────────────────────────────────────────────────────────

#[test]
fn dot_chains_flatten_into_one_path() {
    let ast = parse_ok("a.b.c.d");
    let steps = path_steps(&ast);
    let names: Vec<&str> = steps.iter().map(|s| step_name(s)).collect();
    assert_eq!(names, ["a", "b", "c", "d"]);
}

#[test]
fn bare_name_becomes_single_step_path() {
    let ast = parse_ok("answer");
    assert_eq!(path_steps(&ast).len(), 1);
}

#[test]
fn string_step_promotes_to_name() {
    let ast = parse_ok("a.\"odd key\"");
    let steps = path_steps(&ast);
    assert_eq!(step_name(&steps[1]), "odd key");
}

#[test]
fn number_step_is_rejected() {
    assert_eq!(parse_err("a.2"), "S0213");
    assert_eq!(parse_err("a.true"), "S0213");
    assert_eq!(parse_err("a.null"), "S0213");
}

#[test]
fn filter_becomes_stage_on_step() {
    let ast = parse_ok("Account.Order[0]");
    let steps = path_steps(&ast);
    assert_eq!(steps[1].stages.len(), 1);
    assert!(matches!(steps[1].stages[0], Stage::Filter(_)));
}

#[test]
fn empty_brackets_keep_singleton_arrays() {
    let ast = parse_ok("a[].b");
    assert!(ast.keep_singleton_array);
    let steps = path_steps(&ast);
    assert!(steps[0].keep_array);
}

#[test]
fn predicate_on_variable_stays_a_predicate() {
    let ast = parse_ok("$x[0]");
    assert!(matches!(ast.kind, NodeKind::Variable(_)));
    assert_eq!(ast.predicates.len(), 1);
}

#[test]
fn order_by_appends_sort_step() {
    let ast = parse_ok("Account.Order^(>price, quantity)");
    let steps = path_steps(&ast);
    let last = steps.last().unwrap();
    match &last.kind {
        NodeKind::Sort { terms } => {
            assert_eq!(terms.len(), 2);
            assert!(terms[0].descending);
            assert!(!terms[1].descending);
        }
        other => panic!("expected sort step, got {other:?}"),
    }
}

#[test]
fn group_attaches_to_the_path() {
    let ast = parse_ok("Account.Order.{ \"p\": price }");
    assert!(ast.group.is_some());
}

#[test]
fn group_after_group_is_rejected() {
    assert_eq!(parse_err("a{\"k\": v}{\"k2\": v}"), "S0210");
}

#[test]
fn predicate_after_group_expression_is_rejected() {
    assert_eq!(parse_err("(a){\"k\": v}[0]"), "S0209");
}

// ── Operators ──────────────────────────────────────────────────────────

#[test]
fn multiplication_binds_tighter_than_addition() {
    let ast = parse_ok("1 + 2 * 3");
    match &ast.kind {
        NodeKind::Binary { op: "+", rhs, .. } => {
            assert!(matches!(rhs.kind, NodeKind::Binary { op: "*", .. }));
        }
        other => panic!("expected +, got {other:?}"),
    }
}

#[test]
fn unary_minus_folds_number_literals() {
    let ast = parse_ok("-42");
    assert!(matches!(ast.kind, NodeKind::Number(n) if n == -42.0));
}

#[test]
fn bind_requires_variable_on_the_left() {
    assert_eq!(parse_err("a := 1"), "S0212");
}

#[test]
fn bind_is_right_associative() {
    let ast = parse_ok("$a := $b := 1");
    match &ast.kind {
        NodeKind::Bind { value, .. } => {
            assert!(matches!(value.kind, NodeKind::Bind { .. }));
        }
        other => panic!("expected bind, got {other:?}"),
    }
}

#[test]
fn apply_normalizes() {
    let ast = parse_ok("$x ~> $f");
    assert!(matches!(ast.kind, NodeKind::Apply { .. }));
}

#[test]
fn conditional_coalesce_and_elvis() {
    assert!(matches!(parse_ok("a ? b : c").kind, NodeKind::Condition { .. }));
    assert!(matches!(parse_ok("a ?? b").kind, NodeKind::Coalesce { .. }));
    assert!(matches!(parse_ok("a ?: b").kind, NodeKind::Elvis { .. }));
}

#[test]
fn focus_and_index_bind_variables_on_steps() {
    let ast = parse_ok("a@$item.b#$pos");
    let steps = path_steps(&ast);
    assert_eq!(steps[0].focus.as_deref(), Some("item"));
    assert_eq!(steps[1].index_var.as_deref(), Some("pos"));
    assert!(steps[0].tuple);
}

#[test]
fn focus_must_bind_a_variable() {
    assert_eq!(parse_err("a@b"), "S0214");
}

#[test]
fn trailing_tokens_are_rejected() {
    assert_eq!(parse_err("1 2"), "S0201");
}

#[test]
fn unexpected_end_is_reported() {
    assert_eq!(parse_err("1 +"), "S0207");
    assert_eq!(parse_err("(1"), "S0203");
}

// ── Lambdas ────────────────────────────────────────────────────────────

#[test]
fn lambda_parses_params_and_signature() {
    let ast = parse_ok("function($x, $y)<nn:n>{ $x + $y }");
    match &ast.kind {
        NodeKind::Lambda { params, signature, thunk, .. } => {
            assert_eq!(params, &["x".to_string(), "y".to_string()]);
            assert_eq!(signature.as_deref(), Some("<nn:n>"));
            assert!(!thunk);
        }
        other => panic!("expected lambda, got {other:?}"),
    }
}

#[test]
fn lambda_params_must_be_variables() {
    assert_eq!(parse_err("function(x){ x }"), "S0208");
}

#[test]
fn tail_calls_become_thunks() {
    let ast = parse_ok("function($n){ $n < 1 ? 0 : $self($n - 1) }");
    let NodeKind::Lambda { body, .. } = &ast.kind else {
        panic!("expected lambda");
    };
    let NodeKind::Condition { otherwise, .. } = &body.kind else {
        panic!("expected conditional body");
    };
    let tail = otherwise.as_ref().unwrap();
    match &tail.kind {
        NodeKind::Lambda { thunk, body, .. } => {
            assert!(*thunk);
            assert!(matches!(body.kind, NodeKind::FunctionCall { .. }));
        }
        other => panic!("expected thunk, got {other:?}"),
    }
}

#[test]
fn partial_application_is_flagged() {
    let ast = parse_ok("$f(1, ?)");
    assert!(matches!(
        ast.kind,
        NodeKind::FunctionCall { is_partial: true, .. }
    ));
}

// ── Parent slots ───────────────────────────────────────────────────────

#[test]
fn parent_resolves_to_ancestor_step() {
    let ast = parse_ok("a.b.%.c");
    let steps = path_steps(&ast);
    // `%` at depth 2 resolves to step `a`.
    assert!(steps[0].ancestor.is_some() || steps[1].ancestor.is_some());
    let parent_step = steps
        .iter()
        .find(|s| matches!(s.kind, NodeKind::Parent(_)))
        .expect("parent step present");
    let NodeKind::Parent(Some(slot)) = &parent_step.kind else {
        panic!("parent slot must be allocated");
    };
    assert_eq!(slot.borrow().level, 0, "slot must be fully resolved");
}

#[test]
fn parent_in_predicate_marks_the_step() {
    let ast = parse_ok("a.b[% = 1]");
    let steps = path_steps(&ast);
    // The predicate's parent reference resolves onto step b then a.
    assert!(steps.iter().any(|s| s.tuple));
}

// ── Recover mode ───────────────────────────────────────────────────────

#[test]
fn recover_mode_collects_the_error() {
    let out = parse("1 +", true).unwrap();
    assert!(!out.ok());
    assert_eq!(out.errors[0].code, "S0207");
    assert!(matches!(out.ast.kind, NodeKind::ErrorStub));
}

// ── FLASH ──────────────────────────────────────────────────────────────

fn flash_rules(block: &NodeRef) -> &[NodeRef] {
    match &block.kind {
        NodeKind::Block { exprs } => exprs,
        other => panic!("expected block, got {other:?}"),
    }
}

#[test]
fn flash_block_normalizes() {
    let src = "InstanceOf: Patient\n* active = true\n";
    let out = parse(src, false).unwrap();
    assert!(out.contains_flash);
    let block = &out.ast;
    assert!(block.is_flash_block());
    let meta = block.flash.as_ref().unwrap();
    assert_eq!(meta.instanceof_id, "Patient");
    let rules = flash_rules(block);
    assert_eq!(rules.len(), 1);
    assert!(rules[0].is_flash_rule());
    let rule_meta = rules[0].flash.as_ref().unwrap();
    assert_eq!(rule_meta.instanceof_id, "Patient");
    assert_eq!(rule_meta.full_path.as_deref(), Some("active"));
    assert!(rule_meta.inline.is_some());
}

#[test]
fn multi_step_rule_paths_nest() {
    let src = "InstanceOf: Patient\n* name.given = 'Jane'\n";
    let block = parse_ok(src);
    let rules = flash_rules(&block);
    assert_eq!(rules.len(), 1);
    let outer = rules[0].flash.as_ref().unwrap();
    assert_eq!(outer.full_path.as_deref(), Some("name"));
    assert!(outer.inline.is_none());
    let inner = &flash_rules(&rules[0])[0];
    let inner_meta = inner.flash.as_ref().unwrap();
    assert_eq!(inner_meta.full_path.as_deref(), Some("name.given"));
    assert!(inner_meta.inline.is_some());
}

#[test]
fn slices_render_into_the_flash_path() {
    let src = "InstanceOf: Patient\n* identifier[il-id].value = '123'\n";
    let block = parse_ok(src);
    let rules = flash_rules(&block);
    let outer = rules[0].flash.as_ref().unwrap();
    assert_eq!(outer.full_path.as_deref(), Some("identifier[il-id]"));
    let inner = &flash_rules(&rules[0])[0];
    assert_eq!(
        inner.flash.as_ref().unwrap().full_path.as_deref(),
        Some("identifier[il-id].value")
    );
}

#[test]
fn nested_rules_by_indentation() {
    let src = "InstanceOf: Patient\n* name\n  * given = 'Jane'\n  * family = 'Doe'\n* active = true\n";
    let block = parse_ok(src);
    let rules = flash_rules(&block);
    assert_eq!(rules.len(), 2);
    let children = flash_rules(&rules[0]);
    assert_eq!(children.len(), 2);
}

#[test]
fn instance_header_is_carried_on_the_block() {
    let src = "Instance: $id\nInstanceOf: Patient\n* active = true\n";
    let block = parse_ok(src);
    let meta = block.flash.as_ref().unwrap();
    assert!(meta.instance.is_some());
}

#[test]
fn variable_binding_rules_are_allowed() {
    // Binds may appear among rules; ordering is preserved.
    let src = "InstanceOf: Patient\n$a := true\n* active = $a\n";
    let block = parse_ok(src);
    let rules = flash_rules(&block);
    assert_eq!(rules.len(), 2);
    assert!(matches!(rules[0].kind, NodeKind::Bind { .. }));
    assert!(rules[1].is_flash_rule());
}

#[test]
fn contextualized_rule_becomes_a_path() {
    let src = "InstanceOf: Patient\n* (telecom_list).telecom = $v\n";
    let block = parse_ok(src);
    let rules = flash_rules(&block);
    let path = &rules[0];
    let steps = path_steps(path);
    assert!(steps.last().unwrap().is_flash_rule());
}

#[test]
fn flash_indent_errors() {
    // Odd indent step.
    assert_eq!(parse_err("InstanceOf: Patient\n* name\n   * given = 'x'\n"), "F1021");
    // Too deep.
    assert_eq!(parse_err("InstanceOf: Patient\n* name\n    * given = 'x'\n"), "F1017");
    // Below the root of a block with no enclosing flash context.
    assert_eq!(
        parse_err("  InstanceOf: Patient\n  * active = true\n* id = '1'\n"),
        "F1016"
    );
    // Instance: must be followed by InstanceOf:.
    assert_eq!(parse_err("Instance: $x\n1 + 1"), "F1010");
    // Leftover tokens on the Instance: line itself.
    assert_eq!(parse_err("Instance: $x 5\nInstanceOf: Patient\n"), "F1011");
    // Same-line Instance/InstanceOf.
    assert_eq!(parse_err("Instance: $x InstanceOf: Patient\n* active = true\n"), "F1013");
    // Mismatched header indents.
    assert_eq!(parse_err("Instance: $x\n  InstanceOf: Patient\n"), "F1014");
}

#[test]
fn flash_rule_errors() {
    assert_eq!(parse_err("InstanceOf: Patient\n* * = 1\n"), "F1022");
    assert_eq!(parse_err("InstanceOf: Patient\n* $x = 1\n"), "F1023");
    assert_eq!(parse_err("InstanceOf: Patient\n*\n"), "F1024");
    assert_eq!(parse_err("InstanceOf: Patient\n* active =\n"), "F1012");
    assert_eq!(parse_err("InstanceOf: Patient\n* active := 1\n"), "F1020");
    assert_eq!(
        parse_err("InstanceOf: Patient\n$x := 1\n  * id = '1'\n"),
        "F1025"
    );
    assert_eq!(parse_err("InstanceOf: !!!\n* active = true\n"), "F1026");
}

#[test]
fn instanceof_id_shapes() {
    // Urls, ids and names are all accepted.
    parse_ok("InstanceOf: http://example.org/fhir/StructureDefinition/x\n* active = true\n");
    parse_ok("InstanceOf: il-core-patient\n* active = true\n");
    parse_ok("InstanceOf: ILCorePatient\n* active = true\n");
}
