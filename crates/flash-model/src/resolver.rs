//! The structure-resolution pass.
//!
//! Before evaluation, every FLASH reference in the AST is bound to the
//! structure model: `InstanceOf:` identifiers to type metadata and ordered
//! children, and `<InstanceOf>::<flashPath>` references to enriched element
//! definitions with their own children. Metadata fetches fan out to the
//! navigator in parallel; the resulting dictionaries are deterministic and
//! are bound into the evaluation environment at compile time.
//!
//! Mandatory (`min >= 1`) complex children of anything visited are resolved
//! transitively so that fixed/pattern values nested below them can be
//! injected during composition without further navigator traffic.

use std::collections::VecDeque;

use flash_common::{Error, Result, Span};
use flash_parser::ast::{walk, NodeRef};
use futures::future::join_all;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::navigator::{PackageScope, StructureNavigator};
use crate::types::{
    ElementDefinition, ElementType, ResolvedElement, StructureKind, TypeMeta,
    SYSTEM_TYPE_PREFIX,
};

/// The dictionaries produced by resolution, keyed the way the evaluator
/// looks them up at runtime.
#[derive(Debug, Default)]
pub struct StructureDictionaries {
    /// InstanceOf identifier -> type metadata.
    pub type_meta: FxHashMap<String, TypeMeta>,
    /// InstanceOf identifier -> ordered children of the type.
    pub type_children: FxHashMap<String, Vec<ResolvedElement>>,
    /// `<InstanceOf>::<flashPath>` -> element definition.
    pub element_definitions: FxHashMap<String, ResolvedElement>,
    /// `<InstanceOf>::<flashPath>` -> ordered children of the element.
    pub element_children: FxHashMap<String, Vec<ResolvedElement>>,
    /// `<packageId>@<packageVersion>::<typeCode>` -> base type metadata.
    pub base_type_meta: FxHashMap<String, TypeMeta>,
    /// Errors collected in recover mode; references they concern are
    /// treated as unresolved at evaluation time.
    pub errors: Vec<Error>,
}

/// Dictionary key for an element reference.
pub fn element_key(instanceof_id: &str, flash_path: &str) -> String {
    format!("{instanceof_id}::{flash_path}")
}

/// A FLASH reference collected from the AST.
#[derive(Debug, Clone, PartialEq)]
struct FlashRef {
    instanceof_id: String,
    /// Empty for block (type-level) references.
    flash_path: String,
    span: Span,
    line: u32,
}

/// Resolve every FLASH reference in the AST against the navigator.
///
/// Without `recover`, the first failure is returned as `Err`; with it,
/// failures are collected on the dictionaries and the affected references
/// stay unresolved.
pub async fn resolve_structures(
    ast: &NodeRef,
    navigator: &dyn StructureNavigator,
    recover: bool,
) -> Result<StructureDictionaries> {
    let refs = collect_flash_refs(ast);
    let mut resolver = Resolver {
        nav: navigator,
        dicts: StructureDictionaries::default(),
        recover,
    };
    resolver.run(refs).await?;
    Ok(resolver.dicts)
}

struct Resolver<'a> {
    nav: &'a dyn StructureNavigator,
    dicts: StructureDictionaries,
    recover: bool,
}

impl<'a> Resolver<'a> {
    async fn run(&mut self, refs: Vec<FlashRef>) -> Result<()> {
        // Distinct identifiers, keeping the first reference position for
        // diagnostics.
        let mut ids: Vec<FlashRef> = Vec::new();
        for r in &refs {
            if !ids.iter().any(|i| i.instanceof_id == r.instanceof_id) {
                ids.push(FlashRef { flash_path: String::new(), ..r.clone() });
            }
        }

        // ── Fan out metadata fetches in parallel ───────────────────────
        let nav = self.nav;
        let fetches = ids.iter().map(|r| {
            let id = r.instanceof_id.clone();
            async move { (nav.get_metadata(&id, None).await, id) }
        });
        let results = join_all(fetches).await;
        for ((result, id), r) in results.into_iter().zip(&ids) {
            match result {
                Ok(Some(meta)) => {
                    self.dicts.type_meta.insert(id, meta);
                }
                _ => {
                    let err = Error::new("F2001", r.span, r.line).with_value(id);
                    self.fail(err)?;
                }
            }
        }

        // ── Type children ──────────────────────────────────────────────
        for r in &ids {
            let Some(meta) = self.dicts.type_meta.get(&r.instanceof_id).cloned() else {
                continue;
            };
            match self.nav.get_children(&meta, None).await {
                Ok(children) => {
                    match self.enrich_children(&meta, &r.instanceof_id, None, children, r).await {
                        Ok(enriched) => {
                            self.dicts
                                .type_children
                                .insert(r.instanceof_id.clone(), enriched);
                        }
                        Err(err) => self.fail(err)?,
                    }
                }
                Err(_) => {
                    let err = Error::new("F2006", r.span, r.line)
                        .with_value(r.instanceof_id.clone());
                    self.fail(err)?;
                }
            }
        }

        // ── Element references, including mandatory-child recursion ────
        let mut queue: VecDeque<FlashRef> = refs
            .into_iter()
            .filter(|r| !r.flash_path.is_empty())
            .collect();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        while let Some(r) = queue.pop_front() {
            let key = element_key(&r.instanceof_id, &r.flash_path);
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.resolve_element_ref(&r, &key).await {
                Ok(mandatory_children) => {
                    for path in mandatory_children {
                        queue.push_back(FlashRef {
                            instanceof_id: r.instanceof_id.clone(),
                            flash_path: path,
                            span: r.span,
                            line: r.line,
                        });
                    }
                }
                Err(err) => self.fail(err)?,
            }
        }

        // Mandatory complex children of the types themselves.
        let mut type_queue: VecDeque<FlashRef> = VecDeque::new();
        for r in &ids {
            if let Some(children) = self.dicts.type_children.get(&r.instanceof_id) {
                for child in children {
                    if child.is_mandatory() && is_complex(child) {
                        type_queue.push_back(FlashRef {
                            instanceof_id: r.instanceof_id.clone(),
                            flash_path: child.def.flash_segment(),
                            span: r.span,
                            line: r.line,
                        });
                    }
                }
            }
        }
        while let Some(r) = type_queue.pop_front() {
            let key = element_key(&r.instanceof_id, &r.flash_path);
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.resolve_element_ref(&r, &key).await {
                Ok(mandatory_children) => {
                    for path in mandatory_children {
                        type_queue.push_back(FlashRef {
                            instanceof_id: r.instanceof_id.clone(),
                            flash_path: path,
                            span: r.span,
                            line: r.line,
                        });
                    }
                }
                Err(err) => self.fail(err)?,
            }
        }

        Ok(())
    }

    /// Resolve a single `<id>::<path>` reference. Returns the flash paths
    /// of mandatory complex children still to be resolved.
    async fn resolve_element_ref(&mut self, r: &FlashRef, key: &str) -> Result<Vec<String>> {
        let Some(meta) = self.dicts.type_meta.get(&r.instanceof_id).cloned() else {
            // Type resolution already failed; its error is recorded.
            return Ok(Vec::new());
        };

        let def = match self.nav.get_element(&meta, &r.flash_path).await {
            Ok(Some(def)) => def,
            _ => {
                return Err(Error::new("F2002", r.span, r.line)
                    .with_value(r.flash_path.clone()));
            }
        };
        if def.is_forbidden() {
            return Err(Error::new("F2005", r.span, r.line).with_value(r.flash_path.clone()));
        }
        if def.types.is_empty() {
            return Err(Error::new("F2007", r.span, r.line).with_value(r.flash_path.clone()));
        }
        if def.types.len() > 1 {
            return Err(Error::new("F2004", r.span, r.line)
                .with_value(r.flash_path.clone())
                .with_expected(def.json_names().join(", ")));
        }

        let resolved = self
            .enrich(&meta, def, Some(key.to_string()), r)
            .await?;
        let mut mandatory = Vec::new();

        if resolved.kind != Some(StructureKind::System) {
            let children = match self.nav.get_children(&meta, Some(&r.flash_path)).await {
                Ok(children) => children,
                Err(_) => {
                    return Err(Error::new("F2003", r.span, r.line)
                        .with_value(r.flash_path.clone()));
                }
            };
            let enriched = self
                .enrich_children(&meta, &r.instanceof_id, Some(&r.flash_path), children, r)
                .await?;
            for child in &enriched {
                if child.is_mandatory() && is_complex(child) {
                    mandatory.push(format!("{}.{}", r.flash_path, child.def.flash_segment()));
                }
            }
            self.dicts.element_children.insert(key.to_string(), enriched);
        }

        self.dicts.element_definitions.insert(key.to_string(), resolved);
        Ok(mandatory)
    }

    async fn enrich_children(
        &mut self,
        meta: &TypeMeta,
        instanceof_id: &str,
        parent_path: Option<&str>,
        children: Vec<ElementDefinition>,
        r: &FlashRef,
    ) -> Result<Vec<ResolvedElement>> {
        let mut out = Vec::with_capacity(children.len());
        for def in children {
            let segment = def.flash_segment();
            let path = match parent_path {
                Some(p) => format!("{p}.{segment}"),
                None => segment,
            };
            let key = element_key(instanceof_id, &path);
            out.push(self.enrich(meta, def, Some(key), r).await?);
        }
        Ok(out)
    }

    /// Derive the evaluation-time attributes of an element definition.
    async fn enrich(
        &mut self,
        owner: &TypeMeta,
        def: ElementDefinition,
        ref_key: Option<String>,
        r: &FlashRef,
    ) -> Result<ResolvedElement> {
        let is_array = def.is_array();
        let json_names = def.json_names();
        let fixed_value = def.fixed.as_ref().map(|(_, v)| v.clone());
        let pattern_value = def.pattern.as_ref().map(|(_, v)| v.clone());
        let from_definition = def.definition_url.clone();

        let (kind, type_code, regex_str) = if def.types.len() == 1 {
            let t = def.types[0].clone();
            let kind = self.kind_of(owner, &t, r).await?;
            let type_code = if t.is_system() {
                Some(system_type_code(&t.code))
            } else {
                Some(t.code.clone())
            };
            let regex_str = self.regex_for(owner, &def, kind, &t).await;
            (kind, type_code, regex_str)
        } else {
            (None, None, None)
        };

        Ok(ResolvedElement {
            def,
            kind,
            type_code,
            json_names,
            is_array,
            fixed_value,
            pattern_value,
            regex_str,
            flash_path_ref_key: ref_key,
            from_definition,
        })
    }

    /// The structure kind of an element type, via base-type metadata.
    async fn kind_of(
        &mut self,
        owner: &TypeMeta,
        t: &ElementType,
        r: &FlashRef,
    ) -> Result<Option<StructureKind>> {
        if t.is_system() {
            return Ok(Some(StructureKind::System));
        }
        let key = owner.base_type_key(&t.code);
        if let Some(meta) = self.dicts.base_type_meta.get(&key) {
            return Ok(Some(meta.kind));
        }
        let scope = PackageScope {
            package_id: owner.package_id.clone(),
            package_version: owner.package_version.clone(),
        };
        match self.nav.get_metadata(&t.code, Some(&scope)).await {
            Ok(Some(meta)) => {
                let kind = meta.kind;
                self.dicts.base_type_meta.insert(key, meta);
                Ok(Some(kind))
            }
            _ => Err(Error::new("F2008", r.span, r.line).with_value(t.code.clone())),
        }
    }

    /// The primitive-format regex for an element, when the structure model
    /// declares one. Missing regexes are not an error.
    async fn regex_for(
        &mut self,
        owner: &TypeMeta,
        def: &ElementDefinition,
        kind: Option<StructureKind>,
        t: &ElementType,
    ) -> Option<String> {
        match kind {
            Some(StructureKind::PrimitiveType) => {
                // The regex lives on the `value` child of the primitive type.
                let key = owner.base_type_key(&t.code);
                let meta = self.dicts.base_type_meta.get(&key)?.clone();
                self.value_element_regex(&meta).await
            }
            Some(StructureKind::System) => {
                // The element's own type may carry the extension directly;
                // otherwise read it off the defining structure's value
                // element.
                if let Some(regex) = t.regex() {
                    return Some(regex.to_string());
                }
                let root = def.id.split('.').next().unwrap_or("");
                if root.is_empty() || root == def.id {
                    return None;
                }
                let scope = PackageScope {
                    package_id: owner.package_id.clone(),
                    package_version: owner.package_version.clone(),
                };
                let key = owner.base_type_key(root);
                let meta = match self.dicts.base_type_meta.get(&key) {
                    Some(meta) => meta.clone(),
                    None => match self.nav.get_metadata(root, Some(&scope)).await {
                        Ok(Some(meta)) => {
                            self.dicts.base_type_meta.insert(key, meta.clone());
                            meta
                        }
                        _ => return None,
                    },
                };
                self.value_element_regex(&meta).await
            }
            _ => None,
        }
    }

    /// The regex extension on the `value` element of a type.
    async fn value_element_regex(&mut self, meta: &TypeMeta) -> Option<String> {
        let children = self.nav.get_children(meta, None).await.ok()?;
        let value = children
            .iter()
            .find(|c| c.last_path_segment() == "value")?;
        value
            .types
            .first()
            .and_then(|t| t.regex())
            .map(|s| s.to_string())
    }

    /// Record the error (recover mode) or propagate it.
    fn fail(&mut self, err: Error) -> Result<()> {
        if self.recover {
            self.dicts.errors.push(err);
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Whether a resolved element composes an object (anything that is not a
/// system scalar).
fn is_complex(elem: &ResolvedElement) -> bool {
    matches!(
        elem.kind,
        Some(StructureKind::ComplexType) | Some(StructureKind::Resource)
    )
}

/// `http://hl7.org/fhirpath/System.Integer` -> `integer`.
fn system_type_code(code: &str) -> String {
    let suffix = code.strip_prefix(SYSTEM_TYPE_PREFIX).unwrap_or(code);
    let mut chars = suffix.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Collect every distinct FLASH reference in the AST.
fn collect_flash_refs(ast: &NodeRef) -> Vec<FlashRef> {
    let mut refs = Vec::new();
    walk(ast, &mut |node| {
        let Some(meta) = &node.flash else { return };
        if meta.is_rule {
            if let Some(path) = &meta.full_path {
                refs.push(FlashRef {
                    instanceof_id: meta.instanceof_id.clone(),
                    flash_path: path.clone(),
                    span: node.span,
                    line: node.line,
                });
            }
        } else {
            refs.push(FlashRef {
                instanceof_id: meta.instanceof_id.clone(),
                flash_path: String::new(),
                span: node.span,
                line: node.line,
            });
        }
    });
    let mut distinct: Vec<FlashRef> = Vec::new();
    for r in refs {
        if !distinct
            .iter()
            .any(|d| d.instanceof_id == r.instanceof_id && d.flash_path == r.flash_path)
        {
            distinct.push(r);
        }
    }
    distinct
}
