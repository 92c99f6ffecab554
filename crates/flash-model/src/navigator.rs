//! The structure-navigator contract.
//!
//! The engine never loads structure definitions itself; a host-supplied
//! navigator answers metadata, element and children queries. All calls are
//! async (navigators typically sit on package caches or remote registries)
//! and fallible; the resolver translates failures into F2xxx error codes.

use std::fmt;

use async_trait::async_trait;

use crate::types::{ElementDefinition, TypeMeta};

/// A navigator-side failure, carried into F2xxx diagnostics as context.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigatorError(pub String);

impl fmt::Display for NavigatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "navigator error: {}", self.0)
    }
}

impl std::error::Error for NavigatorError {}

/// Result alias for navigator calls.
pub type NavResult<T> = std::result::Result<T, NavigatorError>;

/// Package identity used to scope base-type lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageScope {
    pub package_id: String,
    pub package_version: String,
}

/// Resolves identifiers, elements and children against the structure model.
///
/// `get_metadata` accepts a name, id, url or urn. `get_element` addresses an
/// element by flash path (`name[slice].child`). `get_children` returns the
/// ordered children of the type itself (no path) or of one of its elements.
/// Returning `Ok(None)` / an empty list means "not found"; `Err` means the
/// lookup itself failed.
#[async_trait(?Send)]
pub trait StructureNavigator {
    async fn get_metadata(
        &self,
        identifier: &str,
        scope: Option<&PackageScope>,
    ) -> NavResult<Option<TypeMeta>>;

    async fn get_element(
        &self,
        meta: &TypeMeta,
        flash_path: &str,
    ) -> NavResult<Option<ElementDefinition>>;

    async fn get_children(
        &self,
        meta: &TypeMeta,
        flash_path: Option<&str>,
    ) -> NavResult<Vec<ElementDefinition>>;
}
