//! Resolver integration tests against an in-memory mock navigator.

use async_trait::async_trait;
use flash_model::{
    element_key, resolve_structures, Derivation, ElementDefinition, ElementType, Extension,
    NavResult, PackageScope, StructureKind, StructureNavigator, TypeMeta,
};
use flash_model::types::REGEX_EXTENSION_URL;
use flash_parser::parse;
use rustc_hash::FxHashMap;

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
        Ok(self.elements.get(&format!("{}::{}", meta.name, flash_path)).cloned())
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

// ── Fixture helpers ────────────────────────────────────────────────────

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

fn regex_type(code: &str, regex: &str) -> ElementType {
    let mut t = ElementType::new(code);
    t.extensions.push(Extension {
        url: REGEX_EXTENSION_URL.to_string(),
        value: serde_json::Value::String(regex.to_string()),
    });
    t
}

/// A model with Patient (resource), boolean/string primitives and their
/// System-typed value elements.
fn patient_model() -> MockNavigator {
    let mut nav = MockNavigator::default();
    nav.add_type(meta("Patient", "Patient", StructureKind::Resource));
    nav.add_type(meta("boolean", "boolean", StructureKind::PrimitiveType));
    nav.add_type(meta("string", "string", StructureKind::PrimitiveType));
    nav.add_type(meta("HumanName", "HumanName", StructureKind::ComplexType));

    nav.add_element("Patient", "active", elem("Patient.active", "Patient.active", 0, "1", "boolean"));
    nav.add_element("Patient", "name", elem("Patient.name", "Patient.name", 0, "*", "HumanName"));
    nav.add_element(
        "Patient",
        "name.given",
        elem("HumanName.given", "HumanName.given", 0, "*", "string"),
    );
    nav.add_children(
        "Patient",
        vec![
            elem("Patient.active", "Patient.active", 0, "1", "boolean"),
            elem("Patient.name", "Patient.name", 0, "*", "HumanName"),
        ],
    );
    nav.add_children(
        "Patient::name",
        vec![elem("HumanName.given", "HumanName.given", 0, "*", "string")],
    );
    nav.add_children("Patient::active", Vec::new());
    nav.add_children("Patient::name.given", Vec::new());

    // Primitive internals: a System-typed value element carrying the regex.
    let mut bool_value = elem("boolean.value", "boolean.value", 0, "1", "");
    bool_value.types = vec![regex_type(
        "http://hl7.org/fhirpath/System.Boolean",
        "true|false",
    )];
    nav.add_children("boolean", vec![bool_value]);

    let mut string_value = elem("string.value", "string.value", 0, "1", "");
    string_value.types = vec![regex_type(
        "http://hl7.org/fhirpath/System.String",
        "[ \\r\\n\\t\\S]+",
    )];
    nav.add_children("string", vec![string_value]);
    nav
}

async fn resolve(src: &str, nav: &MockNavigator) -> flash_model::StructureDictionaries {
    let ast = parse(src, false).expect("parse failed").ast;
    resolve_structures(&ast, nav, false).await.expect("resolve failed")
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn resolves_type_and_elements() {
    let nav = patient_model();
    let dicts = resolve("InstanceOf: Patient\n* active = true\n", &nav).await;

    assert!(dicts.type_meta.contains_key("Patient"));
    assert_eq!(dicts.type_children["Patient"].len(), 2);

    let active = &dicts.element_definitions[&element_key("Patient", "active")];
    assert_eq!(active.kind, Some(StructureKind::PrimitiveType));
    assert_eq!(active.type_code.as_deref(), Some("boolean"));
    assert_eq!(active.json_names, vec!["active"]);
    assert!(!active.is_array);
    assert_eq!(active.regex_str.as_deref(), Some("true|false"));
}

#[tokio::test]
async fn resolves_nested_rule_paths() {
    let nav = patient_model();
    let dicts = resolve("InstanceOf: Patient\n* name.given = 'Jane'\n", &nav).await;

    let name = &dicts.element_definitions[&element_key("Patient", "name")];
    assert_eq!(name.kind, Some(StructureKind::ComplexType));
    assert!(name.is_array);

    let given = &dicts.element_definitions[&element_key("Patient", "name.given")];
    assert_eq!(given.kind, Some(StructureKind::PrimitiveType));
    assert!(given.is_array);
    assert_eq!(given.regex_str.as_deref(), Some("[ \\r\\n\\t\\S]+"));

    // Children of the intermediate element are resolved too.
    assert!(dicts.element_children.contains_key(&element_key("Patient", "name")));
}

#[tokio::test]
async fn unknown_type_fails_with_f2001() {
    let nav = patient_model();
    let ast = parse("InstanceOf: Nonexistent\n* active = true\n", false).unwrap().ast;
    let err = resolve_structures(&ast, &nav, false).await.unwrap_err();
    assert_eq!(err.code, "F2001");
    assert_eq!(err.value.as_deref(), Some("Nonexistent"));
}

#[tokio::test]
async fn recover_mode_collects_resolution_errors() {
    let nav = patient_model();
    let ast = parse("InstanceOf: Nonexistent\n* active = true\n", false).unwrap().ast;
    let dicts = resolve_structures(&ast, &nav, true).await.unwrap();
    assert_eq!(dicts.errors.len(), 1);
    assert_eq!(dicts.errors[0].code, "F2001");
    assert!(dicts.type_meta.is_empty());
}

#[tokio::test]
async fn unknown_element_fails_with_f2002() {
    let nav = patient_model();
    let ast = parse("InstanceOf: Patient\n* bogus = 1\n", false).unwrap().ast;
    let err = resolve_structures(&ast, &nav, false).await.unwrap_err();
    assert_eq!(err.code, "F2002");
    assert_eq!(err.value.as_deref(), Some("bogus"));
}

#[tokio::test]
async fn forbidden_element_fails_with_f2005() {
    let mut nav = patient_model();
    nav.add_element(
        "Patient",
        "animal",
        elem("Patient.animal", "Patient.animal", 0, "0", "BackboneElement"),
    );
    let ast = parse("InstanceOf: Patient\n* animal = 1\n", false).unwrap().ast;
    let err = resolve_structures(&ast, &nav, false).await.unwrap_err();
    assert_eq!(err.code, "F2005");
}

#[tokio::test]
async fn polymorphic_multi_type_fails_with_f2004() {
    let mut nav = patient_model();
    let mut value = elem("Observation.value[x]", "Observation.value[x]", 0, "1", "Quantity");
    value.types.push(ElementType::new("string"));
    nav.add_type(meta("Observation", "Observation", StructureKind::Resource));
    nav.add_element("Observation", "value", value);
    nav.add_children("Observation", Vec::new());
    let ast = parse("InstanceOf: Observation\n* value = 1\n", false).unwrap().ast;
    let err = resolve_structures(&ast, &nav, false).await.unwrap_err();
    assert_eq!(err.code, "F2004");
    assert_eq!(err.expected.as_deref(), Some("valueQuantity, valueString"));
}

#[tokio::test]
async fn element_without_type_fails_with_f2007() {
    let mut nav = patient_model();
    let mut bad = elem("Patient.broken", "Patient.broken", 0, "1", "x");
    bad.types.clear();
    nav.add_element("Patient", "broken", bad);
    let ast = parse("InstanceOf: Patient\n* broken = 1\n", false).unwrap().ast;
    let err = resolve_structures(&ast, &nav, false).await.unwrap_err();
    assert_eq!(err.code, "F2007");
}

#[tokio::test]
async fn mandatory_complex_children_resolve_transitively() {
    let mut nav = MockNavigator::default();
    nav.add_type(meta("Observation", "Observation", StructureKind::Resource));
    nav.add_type(meta("CodeableConcept", "CodeableConcept", StructureKind::ComplexType));
    nav.add_type(meta("code", "code", StructureKind::PrimitiveType));
    nav.add_children(
        "Observation",
        vec![
            elem("Observation.status", "Observation.status", 1, "1", "code"),
            elem("Observation.code", "Observation.code", 1, "1", "CodeableConcept"),
        ],
    );
    // The mandatory complex child resolves even with no rule mentioning it.
    let mut coding = elem("CodeableConcept.coding", "CodeableConcept.coding", 0, "*", "Coding");
    coding.fixed = Some((
        "fixedCoding".to_string(),
        serde_json::json!({"system": "http://loinc.org"}),
    ));
    nav.add_element(
        "Observation",
        "code",
        elem("Observation.code", "Observation.code", 1, "1", "CodeableConcept"),
    );
    nav.add_children("Observation::code", vec![coding]);
    nav.add_type(meta("Coding", "Coding", StructureKind::ComplexType));
    nav.add_children("code", Vec::new());

    let ast = parse("InstanceOf: Observation\n", false).unwrap().ast;
    let dicts = resolve_structures(&ast, &nav, false).await.unwrap();
    let code = &dicts.element_definitions[&element_key("Observation", "code")];
    assert_eq!(code.kind, Some(StructureKind::ComplexType));
    let children = &dicts.element_children[&element_key("Observation", "code")];
    assert!(children[0].fixed_value.is_some());
}

#[tokio::test]
async fn system_value_element_resolves_with_regex() {
    let mut nav = MockNavigator::default();
    nav.add_type(meta("integer", "integer", StructureKind::PrimitiveType));
    let mut value = elem("integer.value", "integer.value", 0, "1", "");
    value.types = vec![regex_type(
        "http://hl7.org/fhirpath/System.Integer",
        "-?(0|[1-9][0-9]*)",
    )];
    nav.add_element("integer", "value", value.clone());
    nav.add_children("integer", vec![value]);

    let dicts = resolve("InstanceOf: integer\n* value = '42'\n", &nav).await;
    let resolved = &dicts.element_definitions[&element_key("integer", "value")];
    assert_eq!(resolved.kind, Some(StructureKind::System));
    assert_eq!(resolved.type_code.as_deref(), Some("integer"));
    assert_eq!(resolved.regex_str.as_deref(), Some("-?(0|[1-9][0-9]*)"));
}

#[tokio::test]
async fn base_type_metadata_is_cached_under_package_key() {
    let nav = patient_model();
    let dicts = resolve("InstanceOf: Patient\n* active = true\n", &nav).await;
    assert!(dicts
        .base_type_meta
        .contains_key("hl7.fhir.r4.core@4.0.1::boolean"));
}
