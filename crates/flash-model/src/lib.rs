//! Structure-model layer of the flash engine: the data model for type
//! metadata and element definitions, the async navigator contract, and the
//! resolver that binds every FLASH reference in an AST to the model before
//! evaluation begins.

pub mod navigator;
pub mod resolver;
pub mod types;

pub use navigator::{NavResult, NavigatorError, PackageScope, StructureNavigator};
pub use resolver::{element_key, resolve_structures, StructureDictionaries};
pub use types::{
    Derivation, ElementDefinition, ElementType, Extension, ResolvedElement, StructureKind,
    TypeMeta,
};
