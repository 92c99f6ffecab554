//! End-to-end FLASH tests: compiling against a mock structure navigator
//! and composing resources, primitives, slices and mandatory elements.

use std::rc::Rc;

use async_trait::async_trait;
use flash::value::Value;
use flash::{compile, Options};
use flash_model::types::REGEX_EXTENSION_URL;
use flash_model::{
    Derivation, ElementDefinition, ElementType, Extension, NavResult, PackageScope,
    StructureKind, StructureNavigator, TypeMeta,
};
use rustc_hash::FxHashMap;
use serde_json::json;

// ── Mock navigator ─────────────────────────────────────────────────────

#[derive(Default)]
struct MockNavigator {
    types: FxHashMap<String, TypeMeta>,
    elements: FxHashMap<String, ElementDefinition>,
    children: FxHashMap<String, Vec<ElementDefinition>>,
}

impl MockNavigator {
    fn add_type(&mut self, meta: TypeMeta) {
        self.types.insert(meta.name.clone(), meta.clone());
        self.types.insert(meta.url.clone(), meta.clone());
        self.types.insert(meta.type_code.clone(), meta);
    }

    fn add_element(&mut self, type_name: &str, path: &str, def: ElementDefinition) {
        self.elements.insert(format!("{type_name}::{path}"), def);
    }

    fn add_children(&mut self, key: &str, children: Vec<ElementDefinition>) {
        self.children.insert(key.to_string(), children);
    }
}

#[async_trait(?Send)]
impl StructureNavigator for MockNavigator {
    async fn get_metadata(
        &self,
        identifier: &str,
        _scope: Option<&PackageScope>,
    ) -> NavResult<Option<TypeMeta>> {
        Ok(self.types.get(identifier).cloned())
    }

    async fn get_element(
        &self,
        meta: &TypeMeta,
        flash_path: &str,
    ) -> NavResult<Option<ElementDefinition>> {
        Ok(self
            .elements
            .get(&format!("{}::{}", meta.name, flash_path))
            .cloned())
    }

    async fn get_children(
        &self,
        meta: &TypeMeta,
        flash_path: Option<&str>,
    ) -> NavResult<Vec<ElementDefinition>> {
        let key = match flash_path {
            Some(path) => format!("{}::{}", meta.name, path),
            None => meta.name.clone(),
        };
        Ok(self.children.get(&key).cloned().unwrap_or_default())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

const PROFILE_URL: &str = "http://example.org/fhir/StructureDefinition/PatientProfile";

fn meta(name: &str, type_code: &str, kind: StructureKind) -> TypeMeta {
    TypeMeta {
        type_code: type_code.to_string(),
        kind,
        url: format!("http://hl7.org/fhir/StructureDefinition/{name}"),
        name: name.to_string(),
        version: "4.0.1".to_string(),
        derivation: Some(Derivation::Specialization),
        base_definition: None,
        package_id: "hl7.fhir.r4.core".to_string(),
        package_version: "4.0.1".to_string(),
    }
}

fn elem(id: &str, path: &str, min: u32, max: &str, type_code: &str) -> ElementDefinition {
    ElementDefinition {
        id: id.to_string(),
        path: path.to_string(),
        min,
        max: max.to_string(),
        types: vec![ElementType::new(type_code)],
        slice_name: None,
        fixed: None,
        pattern: None,
        content_reference: None,
        definition_url: None,
    }
}

fn system_type(code: &str, regex: &str) -> ElementType {
    let mut t = ElementType::new(code);
    t.extensions.push(Extension {
        url: REGEX_EXTENSION_URL.to_string(),
        value: serde_json::Value::String(regex.to_string()),
    });
    t
}

fn primitive_with_value(nav: &mut MockNavigator, name: &str, system_code: &str, regex: &str) {
    nav.add_type(meta(name, name, StructureKind::PrimitiveType));
    let mut value = elem(&format!("{name}.value"), &format!("{name}.value"), 0, "1", "");
    value.types = vec![system_type(system_code, regex)];
    nav.add_children(name, vec![value.clone()]);
    nav.add_element(name, "value", value);
}

/// Build the full mock model used across these tests.
fn navigator() -> Rc<MockNavigator> {
    let mut nav = MockNavigator::default();

    // Primitives.
    primitive_with_value(
        &mut nav,
        "boolean",
        "http://hl7.org/fhirpath/System.Boolean",
        "true|false",
    );
    primitive_with_value(
        &mut nav,
        "string",
        "http://hl7.org/fhirpath/System.String",
        "[ \\r\\n\\t\\S]+",
    );
    primitive_with_value(
        &mut nav,
        "code",
        "http://hl7.org/fhirpath/System.String",
        "[^\\s]+(\\s[^\\s]+)*",
    );
    primitive_with_value(
        &mut nav,
        "uri",
        "http://hl7.org/fhirpath/System.String",
        "\\S*",
    );
    primitive_with_value(
        &mut nav,
        "integer",
        "http://hl7.org/fhirpath/System.Integer",
        "-?(0|[1-9][0-9]*)",
    );

    // Complex types.
    nav.add_type(meta("HumanName", "HumanName", StructureKind::ComplexType));
    nav.add_type(meta("Identifier", "Identifier", StructureKind::ComplexType));
    nav.add_type(meta("Reference", "Reference", StructureKind::ComplexType));
    nav.add_type(meta("Quantity", "Quantity", StructureKind::ComplexType));

    // The Patient profile (a constraint on Patient).
    let mut profile = meta("PatientProfile", "Patient", StructureKind::Resource);
    profile.url = PROFILE_URL.to_string();
    profile.derivation = Some(Derivation::Constraint);
    nav.add_type(profile);

    let id = {
        let mut e = elem("Patient.id", "Patient.id", 0, "1", "");
        e.types = vec![ElementType::new("http://hl7.org/fhirpath/System.String")];
        e
    };
    let active = elem("Patient.active", "Patient.active", 0, "1", "boolean");
    let name = elem("Patient.name", "Patient.name", 0, "*", "HumanName");
    let identifier = elem("Patient.identifier", "Patient.identifier", 0, "*", "Identifier");
    let slice = {
        let mut e = elem(
            "Patient.identifier:il-id",
            "Patient.identifier",
            0,
            "*",
            "Identifier",
        );
        e.slice_name = Some("il-id".to_string());
        e
    };
    nav.add_children(
        "PatientProfile",
        vec![
            id.clone(),
            active.clone(),
            name.clone(),
            identifier.clone(),
            slice.clone(),
        ],
    );
    nav.add_element("PatientProfile", "id", id);
    nav.add_element("PatientProfile", "active", active);
    nav.add_element("PatientProfile", "name", name);
    nav.add_element("PatientProfile", "identifier", identifier);
    nav.add_element("PatientProfile", "identifier[il-id]", slice);

    let given = elem("HumanName.given", "HumanName.given", 0, "*", "string");
    let family = elem("HumanName.family", "HumanName.family", 0, "1", "string");
    nav.add_children("PatientProfile::name", vec![given.clone(), family.clone()]);
    nav.add_element("PatientProfile", "name.given", given);
    nav.add_element("PatientProfile", "name.family", family);

    // Plain identifier children.
    let ident_system = elem("Identifier.system", "Identifier.system", 0, "1", "uri");
    let ident_value = elem("Identifier.value", "Identifier.value", 0, "1", "string");
    nav.add_children(
        "PatientProfile::identifier",
        vec![ident_system.clone(), ident_value.clone()],
    );
    nav.add_element("PatientProfile", "identifier.value", ident_value.clone());

    // Sliced identifier children: system is mandatory and fixed.
    let mut sliced_system = elem(
        "Patient.identifier:il-id.system",
        "Patient.identifier.system",
        1,
        "1",
        "uri",
    );
    sliced_system.fixed = Some((
        "fixedUri".to_string(),
        json!("http://example.org/ns/patient-id"),
    ));
    nav.add_children(
        "PatientProfile::identifier[il-id]",
        vec![sliced_system.clone(), ident_value.clone()],
    );
    nav.add_element("PatientProfile", "identifier[il-id].system", sliced_system);
    nav.add_element("PatientProfile", "identifier[il-id].value", ident_value);

    // Observation with a mandatory status.
    nav.add_type(meta("Observation", "Observation", StructureKind::Resource));
    let status = elem("Observation.status", "Observation.status", 1, "1", "code");
    let subject = elem("Observation.subject", "Observation.subject", 0, "1", "Reference");
    nav.add_children("Observation", vec![status.clone(), subject.clone()]);
    nav.add_element("Observation", "status", status);
    nav.add_element("Observation", "subject", subject);
    let reference = elem("Reference.reference", "Reference.reference", 0, "1", "string");
    nav.add_children("Observation::subject", vec![reference.clone()]);
    nav.add_element("Observation", "subject.reference", reference);

    Rc::new(nav)
}

fn options() -> Options {
    Options {
        recover: false,
        navigator: Some(navigator()),
        regex_engine: None,
    }
}

async fn run(source: &str, input: serde_json::Value) -> serde_json::Value {
    let expr = compile(source, options())
        .await
        .unwrap_or_else(|e| panic!("compile of {source:?} failed: {e}"));
    let result = expr
        .evaluate(&input, None)
        .await
        .unwrap_or_else(|e| panic!("evaluate of {source:?} failed: {e}"));
    result
        .to_json()
        .unwrap_or_else(|| panic!("evaluate of {source:?} produced no JSON"))
}

async fn run_value(source: &str, input: serde_json::Value) -> Value {
    let expr = compile(source, options())
        .await
        .unwrap_or_else(|e| panic!("compile of {source:?} failed: {e}"));
    expr.evaluate(&input, None)
        .await
        .unwrap_or_else(|e| panic!("evaluate of {source:?} failed: {e}"))
}

async fn run_err(source: &str, input: serde_json::Value) -> flash_common::Error {
    let expr = match compile(source, options()).await {
        Ok(expr) => expr,
        Err(err) => return err,
    };
    expr.evaluate(&input, None)
        .await
        .err()
        .unwrap_or_else(|| panic!("evaluate of {source:?} should fail"))
}

// ── System primitives ──────────────────────────────────────────────────

#[tokio::test]
async fn integer_instance_coerces_strings() {
    let result = run("InstanceOf: integer\n* value = '42'\n", json!(null)).await;
    assert_eq!(result, json!(42.0));
}

#[tokio::test]
async fn integer_format_violations_fail() {
    let err = run_err("InstanceOf: integer\n* value = 'abc'\n", json!(null)).await;
    assert_eq!(err.code, "F3001");
    let err = run_err("InstanceOf: integer\n* value = '007'\n", json!(null)).await;
    assert_eq!(err.code, "F3001");
}

#[tokio::test]
async fn boolean_coercion_rules() {
    let result = run(
        "InstanceOf: PatientProfile\n* active = 'false'\n",
        json!(null),
    )
    .await;
    assert_eq!(result["active"], json!(false));
    let result = run(
        "InstanceOf: PatientProfile\n* active = 'yes'\n",
        json!(null),
    )
    .await;
    assert_eq!(result["active"], json!(true));
}

// ── Resource composition ───────────────────────────────────────────────

#[tokio::test]
async fn profile_resource_with_nested_rules() {
    let src = "InstanceOf: http://example.org/fhir/StructureDefinition/PatientProfile\n\
               * id = 'p1'\n\
               * name.given = 'Jane'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result,
        json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"profile": [PROFILE_URL]},
            "name": [{"given": ["Jane"]}]
        })
    );
}

#[tokio::test]
async fn instance_header_sets_the_id() {
    let src = "Instance: $pid\nInstanceOf: PatientProfile\n* active = true\n";
    let expr = compile(src, options()).await.unwrap();
    expr.assign("pid", json!("p9"));
    let result = expr.evaluate(&json!(null), None).await.unwrap();
    let json = result.to_json().unwrap();
    assert_eq!(json["id"], json!("p9"));
    assert_eq!(json["active"], json!(true));
}

#[tokio::test]
async fn rules_read_the_input_document() {
    let src = "InstanceOf: PatientProfile\n* name\n  * given = first_name\n  * family = last_name\n";
    let input = json!({"first_name": "Ada", "last_name": "Lovelace"});
    let result = run(src, input).await;
    assert_eq!(
        result["name"],
        json!([{"given": ["Ada"], "family": "Lovelace"}])
    );
}

#[tokio::test]
async fn array_elements_accumulate_values() {
    // Values for the same array element accumulate within one rule; each
    // top-level rule on an array element appends its own entry.
    let src = "InstanceOf: PatientProfile\n* name\n  * given = 'Ada'\n  * given = 'Augusta'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(result["name"], json!([{"given": ["Ada", "Augusta"]}]));

    let src = "InstanceOf: PatientProfile\n* name.given = 'Ada'\n* name.given = 'Augusta'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result["name"],
        json!([{"given": ["Ada"]}, {"given": ["Augusta"]}])
    );
}

#[tokio::test]
async fn variable_bindings_inside_blocks() {
    let src = "InstanceOf: PatientProfile\n$given := 'Jane'\n* name.given = $given\n";
    let result = run(src, json!(null)).await;
    assert_eq!(result["name"], json!([{"given": ["Jane"]}]));
}

#[tokio::test]
async fn contextualized_rules_iterate() {
    let src = "InstanceOf: PatientProfile\n* (people).name\n  * given = first\n";
    let input = json!({"people": [{"first": "Ada"}, {"first": "Grace"}]});
    let result = run(src, input).await;
    assert_eq!(
        result["name"],
        json!([{"given": ["Ada"]}, {"given": ["Grace"]}])
    );
}

// ── Undefined vs false ─────────────────────────────────────────────────

#[tokio::test]
async fn false_and_zero_are_kept_but_undefined_drops() {
    let result = run("InstanceOf: PatientProfile\n* active = false\n", json!(null)).await;
    assert_eq!(result["active"], json!(false));

    let result = run(
        "InstanceOf: PatientProfile\n* active = nothing\n* id = 'p1'\n",
        json!({}),
    )
    .await;
    assert!(result.get("active").is_none());
    assert_eq!(result["id"], json!("p1"));
}

#[tokio::test]
async fn empty_composition_is_undefined() {
    let value = run_value(
        "InstanceOf: PatientProfile\n* active = nothing\n",
        json!({}),
    )
    .await;
    assert!(value.is_undefined());
}

// ── Slices ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn slice_folds_with_fixed_system() {
    let src = "InstanceOf: PatientProfile\n* identifier[il-id].value = '123'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result["identifier"],
        json!([{"system": "http://example.org/ns/patient-id", "value": "123"}])
    );
}

#[tokio::test]
async fn plain_sibling_appends_after_the_slice() {
    let src = "InstanceOf: PatientProfile\n\
               * identifier[il-id].value = '123'\n\
               * identifier.value = '456'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result["identifier"],
        json!([
            {"system": "http://example.org/ns/patient-id", "value": "123"},
            {"value": "456"}
        ])
    );
}

// ── Mandatory enforcement ──────────────────────────────────────────────

#[tokio::test]
async fn missing_mandatory_child_fails() {
    let src = "InstanceOf: Observation\n* subject.reference = 'Patient/1'\n";
    let err = run_err(src, json!(null)).await;
    assert_eq!(err.code, "F3002");
    assert_eq!(err.fhir_element.as_deref(), Some("status"));
}

#[tokio::test]
async fn provided_mandatory_child_passes() {
    let src = "InstanceOf: Observation\n* status = 'final'\n* subject.reference = 'Patient/1'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result,
        json!({
            "resourceType": "Observation",
            "status": "final",
            "subject": {"reference": "Patient/1"}
        })
    );
}

// ── Inline objects ─────────────────────────────────────────────────────

#[tokio::test]
async fn inline_objects_contribute_properties() {
    let src = "InstanceOf: PatientProfile\n* name = {'given': ['Mary'], 'family': 'Shelley'}\n";
    let result = run(src, json!(null)).await;
    assert_eq!(
        result["name"],
        json!([{"given": ["Mary"], "family": "Shelley"}])
    );
}

#[tokio::test]
async fn inline_is_collected_before_sub_rules() {
    let src = "InstanceOf: PatientProfile\n* name = {'given': ['Mary']}\n  * given = 'Jane'\n";
    let result = run(src, json!(null)).await;
    assert_eq!(result["name"], json!([{"given": ["Mary", "Jane"]}]));
}

// ── Compile-time structure errors surface ──────────────────────────────

#[tokio::test]
async fn unknown_type_fails_at_compile_time() {
    let err = compile("InstanceOf: Bogus\n* x = 1\n", options())
        .await
        .unwrap_err();
    assert_eq!(err.code, "F2001");
}

#[tokio::test]
async fn unknown_element_fails_at_compile_time() {
    let err = compile("InstanceOf: PatientProfile\n* bogus = 1\n", options())
        .await
        .unwrap_err();
    assert_eq!(err.code, "F2002");
}

#[tokio::test]
async fn recover_mode_collects_structure_errors() {
    let expr = compile(
        "InstanceOf: Bogus\n* x = 1\n",
        Options {
            recover: true,
            navigator: Some(navigator()),
            regex_engine: None,
        },
    )
    .await
    .unwrap();
    assert!(expr.errors().iter().any(|e| e.code == "F2001"));
    let err = expr.evaluate(&json!(null), None).await.unwrap_err();
    assert_eq!(err.code, "S0500");
}
