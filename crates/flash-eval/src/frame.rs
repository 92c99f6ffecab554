//! Evaluation environment frames.
//!
//! Frames form a single-linked chain: lookup walks toward the root, binds
//! only touch the current frame, and a child's bindings shadow its
//! parent's. System-level state (the evaluation timestamp, the resolved
//! structure dictionaries, the regex cache and engine, the host's
//! entry/exit hooks) lives in a shared [`RootContext`] carried as dedicated
//! fields rather than reserved names in the binding map, so user names can
//! never collide with it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use flash_common::{Error, Result, Span};
use flash_model::StructureDictionaries;
use flash_parser::ast::Node;
use rustc_hash::FxHashMap;

use crate::regex_engine::{CompiledRegex, DefaultRegexEngine, RegexEngine};
use crate::value::Value;

/// Host callback invoked on entry/exit of every node evaluation. Hosts
/// enforce wall-clock timeouts or depth ceilings by returning an error
/// (conventionally `U1001`).
pub type EvalHook = Rc<dyn Fn(&Node, &Value) -> Result<()>>;

/// Per-compilation shared state reachable from every frame.
pub struct RootContext {
    /// Millisecond timestamp captured when evaluation starts.
    pub timestamp_millis: Cell<f64>,
    /// Dictionaries produced by the structure resolver.
    pub dicts: StructureDictionaries,
    pub regex_engine: Rc<dyn RegexEngine>,
    regex_cache: RefCell<FxHashMap<String, Rc<CompiledRegex>>>,
    pub entry_hook: RefCell<Option<EvalHook>>,
    pub exit_hook: RefCell<Option<EvalHook>>,
}

impl RootContext {
    pub fn new(dicts: StructureDictionaries, regex_engine: Option<Rc<dyn RegexEngine>>) -> Self {
        Self {
            timestamp_millis: Cell::new(0.0),
            dicts,
            regex_engine: regex_engine.unwrap_or_else(|| Rc::new(DefaultRegexEngine)),
            regex_cache: RefCell::new(FxHashMap::default()),
            entry_hook: RefCell::new(None),
            exit_hook: RefCell::new(None),
        }
    }

    /// Fetch a compiled regex from the cache, compiling and storing on a
    /// miss. Compile failures surface as S0302 at the point of use.
    pub fn compiled_regex(
        &self,
        pattern: &str,
        flags: &str,
        span: Span,
        line: u32,
    ) -> Result<Rc<CompiledRegex>> {
        let key = format!("/{pattern}/{flags}");
        if let Some(hit) = self.regex_cache.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let compiled = self
            .regex_engine
            .compile(pattern, flags)
            .map_err(|_| Error::new("S0302", span, line).with_token(pattern))?;
        let compiled = Rc::new(compiled);
        self.regex_cache
            .borrow_mut()
            .insert(key, compiled.clone());
        Ok(compiled)
    }
}

/// One frame of the environment chain.
pub struct Frame {
    bindings: RefCell<FxHashMap<String, Value>>,
    parent: Option<FrameRef>,
    root: Rc<RootContext>,
}

pub type FrameRef = Rc<Frame>;

impl Frame {
    /// Create a root frame over the shared context.
    pub fn new_root(root: Rc<RootContext>) -> FrameRef {
        Rc::new(Frame {
            bindings: RefCell::new(FxHashMap::default()),
            parent: None,
            root,
        })
    }

    /// Create a child frame; bindings shadow the parent chain.
    pub fn child(parent: &FrameRef) -> FrameRef {
        Rc::new(Frame {
            bindings: RefCell::new(FxHashMap::default()),
            parent: Some(parent.clone()),
            root: parent.root.clone(),
        })
    }

    /// Bind a name in this frame.
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look a name up, walking the chain to the root.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// The shared root context.
    pub fn root_ctx(&self) -> &Rc<RootContext> {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> FrameRef {
        Frame::new_root(Rc::new(RootContext::new(
            StructureDictionaries::default(),
            None,
        )))
    }

    #[test]
    fn child_bindings_shadow_parent() {
        let parent = root();
        parent.bind("x", Value::Number(1.0));
        let child = Frame::child(&parent);
        assert_eq!(child.lookup("x").unwrap().as_f64(), Some(1.0));
        child.bind("x", Value::Number(2.0));
        assert_eq!(child.lookup("x").unwrap().as_f64(), Some(2.0));
        // The parent is untouched.
        assert_eq!(parent.lookup("x").unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn lookup_misses_return_none() {
        assert!(root().lookup("nope").is_none());
    }

    #[test]
    fn regex_cache_is_idempotent() {
        let ctx = RootContext::new(StructureDictionaries::default(), None);
        let a = ctx
            .compiled_regex("a+", "", Span::at(0), 1)
            .expect("compile");
        let b = ctx
            .compiled_regex("a+", "", Span::at(0), 1)
            .expect("cache hit");
        assert!(Rc::ptr_eq(&a, &b));
    }
}
