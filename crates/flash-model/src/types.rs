//! Structure-model data types.
//!
//! [`TypeMeta`] and [`ElementDefinition`] are what the navigator returns;
//! [`ResolvedElement`] is the enriched form the resolver derives from them
//! and the evaluator consumes. Fixed and pattern values stay as
//! `serde_json::Value` because they are injected verbatim into composed
//! output.

use serde::{Deserialize, Serialize};

/// The url of the standard extension carrying a primitive's regex.
pub const REGEX_EXTENSION_URL: &str = "http://hl7.org/fhir/StructureDefinition/regex";

/// Prefix of system (FHIRPath) type codes.
pub const SYSTEM_TYPE_PREFIX: &str = "http://hl7.org/fhirpath/System.";

/// What a structure definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureKind {
    Resource,
    ComplexType,
    PrimitiveType,
    /// A FHIRPath system type (`System.String` and friends); values are
    /// bare JSON scalars.
    System,
}

/// How a structure definition relates to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Derivation {
    Constraint,
    Specialization,
}

/// Metadata for a resolved type or profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMeta {
    /// The type this structure constrains or specializes, e.g. `Patient`.
    pub type_code: String,
    pub kind: StructureKind,
    pub url: String,
    pub name: String,
    pub version: String,
    pub derivation: Option<Derivation>,
    pub base_definition: Option<String>,
    pub package_id: String,
    pub package_version: String,
}

impl TypeMeta {
    /// The key under which base-type metadata is cached:
    /// `<packageId>@<packageVersion>::<typeCode>`.
    pub fn base_type_key(&self, type_code: &str) -> String {
        format!("{}@{}::{}", self.package_id, self.package_version, type_code)
    }
}

/// An extension on an element type (url plus value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,
    pub value: serde_json::Value,
}

/// One entry of an element's `type` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementType {
    pub code: String,
    pub profiles: Vec<String>,
    pub extensions: Vec<Extension>,
}

impl ElementType {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), profiles: Vec::new(), extensions: Vec::new() }
    }

    /// The regex standard-extension value on this type, if present.
    pub fn regex(&self) -> Option<&str> {
        self.extensions
            .iter()
            .find(|e| e.url == REGEX_EXTENSION_URL)
            .and_then(|e| e.value.as_str())
    }

    /// Whether this is a FHIRPath system type.
    pub fn is_system(&self) -> bool {
        self.code.starts_with(SYSTEM_TYPE_PREFIX)
    }
}

/// An element definition as returned by the navigator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDefinition {
    /// Structure-definition element id, e.g. `Patient.identifier:il-id` or
    /// `Observation.value[x]`.
    pub id: String,
    /// Dotted path without slice names, e.g. `Observation.value[x]`.
    pub path: String,
    pub min: u32,
    /// `"0"`, a number, or `"*"`.
    pub max: String,
    pub types: Vec<ElementType>,
    pub slice_name: Option<String>,
    /// The `fixedX` property: original property name plus value.
    pub fixed: Option<(String, serde_json::Value)>,
    /// The `patternX` property: original property name plus value.
    pub pattern: Option<(String, serde_json::Value)>,
    pub content_reference: Option<String>,
    /// Url of the structure definition this element came from.
    pub definition_url: Option<String>,
}

impl ElementDefinition {
    /// Whether the element is forbidden (`max = "0"`).
    pub fn is_forbidden(&self) -> bool {
        self.max == "0"
    }

    /// Whether the element repeats (`max` above one).
    pub fn is_array(&self) -> bool {
        self.max == "*" || self.max.parse::<u32>().map(|n| n > 1).unwrap_or(false)
    }

    /// Last segment of the element path, e.g. `value[x]`.
    pub fn last_path_segment(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }

    /// Whether the element is a polymorphic choice (`name[x]`).
    pub fn is_polymorphic(&self) -> bool {
        self.last_path_segment().ends_with("[x]")
    }

    /// The base property name with any `[x]` marker stripped.
    pub fn base_name(&self) -> &str {
        let seg = self.last_path_segment();
        seg.strip_suffix("[x]").unwrap_or(seg)
    }

    /// The flash-path segment this element occupies: `b` for `A.b`,
    /// `b[slice]` for `A.b:slice` and `A.b[x]:slice`.
    pub fn flash_segment(&self) -> String {
        match &self.slice_name {
            Some(slice) => format!("{}[{}]", self.base_name(), slice),
            None => self.base_name().to_string(),
        }
    }

    /// The JSON property names this element may occupy: one per type for an
    /// unresolved polymorphic element, the plain name otherwise.
    pub fn json_names(&self) -> Vec<String> {
        if self.is_polymorphic() {
            self.types
                .iter()
                .map(|t| format!("{}{}", self.base_name(), init_cap(&t.code)))
                .collect()
        } else {
            vec![self.base_name().to_string()]
        }
    }
}

/// Uppercase the first character of a type code (`string` -> `String`).
pub fn init_cap(code: &str) -> String {
    let mut chars = code.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// An element definition enriched with the derived attributes the composer
/// needs at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedElement {
    pub def: ElementDefinition,
    /// Kind of the element's (single) type; `None` while polymorphic.
    pub kind: Option<StructureKind>,
    /// The element's (single) type code; `None` while polymorphic.
    pub type_code: Option<String>,
    /// JSON property names; more than one iff the polymorphic choice is
    /// unresolved.
    pub json_names: Vec<String>,
    pub is_array: bool,
    pub fixed_value: Option<serde_json::Value>,
    pub pattern_value: Option<serde_json::Value>,
    /// Primitive format regex, when the structure model declares one.
    pub regex_str: Option<String>,
    /// The `<InstanceOf>::<flashPath>` key this element resolves under.
    pub flash_path_ref_key: Option<String>,
    /// Url of the defining structure definition.
    pub from_definition: Option<String>,
}

impl ResolvedElement {
    /// Whether at least one value is required.
    pub fn is_mandatory(&self) -> bool {
        self.def.min >= 1
    }

    /// Grouping key used while composing: `name:slice` for sliced elements,
    /// the plain JSON name otherwise.
    pub fn group_key(&self) -> String {
        match (&self.def.slice_name, self.json_names.first()) {
            (Some(slice), Some(name)) => format!("{name}:{slice}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(id: &str, path: &str, max: &str) -> ElementDefinition {
        ElementDefinition {
            id: id.to_string(),
            path: path.to_string(),
            min: 0,
            max: max.to_string(),
            types: vec![ElementType::new("string")],
            slice_name: None,
            fixed: None,
            pattern: None,
            content_reference: None,
            definition_url: None,
        }
    }

    #[test]
    fn array_detection_from_max() {
        assert!(elem("a.b", "a.b", "*").is_array());
        assert!(elem("a.b", "a.b", "3").is_array());
        assert!(!elem("a.b", "a.b", "1").is_array());
        assert!(elem("a.b", "a.b", "0").is_forbidden());
    }

    #[test]
    fn polymorphic_names_enumerate_types() {
        let mut e = elem("Observation.value[x]", "Observation.value[x]", "1");
        e.types = vec![ElementType::new("Quantity"), ElementType::new("string")];
        assert!(e.is_polymorphic());
        assert_eq!(e.json_names(), vec!["valueQuantity", "valueString"]);
    }

    #[test]
    fn flash_segment_strips_poly_marker_and_keeps_slices() {
        let mut e = elem("Observation.value[x]:valueQuantity", "Observation.value[x]", "1");
        e.slice_name = Some("valueQuantity".into());
        assert_eq!(e.flash_segment(), "value[valueQuantity]");

        let mut e = elem("Patient.identifier:il-id", "Patient.identifier", "*");
        e.slice_name = Some("il-id".into());
        assert_eq!(e.flash_segment(), "identifier[il-id]");

        let e = elem("Patient.name", "Patient.name", "*");
        assert_eq!(e.flash_segment(), "name");
    }

    #[test]
    fn type_regex_extension_lookup() {
        let mut t = ElementType::new("string");
        t.extensions.push(Extension {
            url: REGEX_EXTENSION_URL.to_string(),
            value: serde_json::Value::String("[ \\r\\n\\t\\S]+".to_string()),
        });
        assert_eq!(t.regex(), Some("[ \\r\\n\\t\\S]+"));
        assert!(ElementType::new("string").regex().is_none());
    }

    #[test]
    fn system_type_detection() {
        assert!(ElementType::new("http://hl7.org/fhirpath/System.String").is_system());
        assert!(!ElementType::new("string").is_system());
    }
}
