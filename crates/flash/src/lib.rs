//! Public surface of the flash engine: compile a source string into an
//! [`Expression`], then evaluate it against JSON inputs.
//!
//! ```no_run
//! # async fn demo() -> flash_common::Result<()> {
//! let expr = flash::compile("\"hello \" & $name", flash::Options::default()).await?;
//! expr.assign("name", serde_json::json!("world"));
//! let result = expr.evaluate(&serde_json::json!(null), None).await?;
//! assert_eq!(result.to_json(), Some(serde_json::json!("hello world")));
//! # Ok(())
//! # }
//! ```
//!
//! Sources containing FLASH blocks additionally need a structure navigator
//! ([`Options::navigator`]); the compiler resolves every referenced type
//! and element up front so that evaluation never touches the navigator.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use flash_common::{Error, Result, Span};
use flash_eval::value::{ArrayFlags, ArrayValue, NativeValue};
use flash_eval::{
    evaluate, signature, EvalHook, Frame, FrameRef, FunctionValue, NativeImpl, RegexEngine,
    RootContext, Value,
};
use flash_model::{resolve_structures, StructureDictionaries, StructureNavigator};
use flash_parser::ast::NodeRef;

pub use flash_common::diagnostics;
pub use flash_eval::value;
pub use flash_eval::{DefaultRegexEngine, ObjectValue};
pub use flash_model::{
    Derivation, ElementDefinition, ElementType, Extension, NavResult, NavigatorError,
    PackageScope, ResolvedElement, StructureKind, TypeMeta,
};

/// Compile options.
#[derive(Default)]
pub struct Options {
    /// Accumulate syntax/resolution errors instead of failing fast; the
    /// expression then refuses to evaluate with S0500.
    pub recover: bool,
    /// The structure navigator; required when the source contains FLASH.
    pub navigator: Option<Rc<dyn StructureNavigator>>,
    /// Custom regex engine used in place of the default.
    pub regex_engine: Option<Rc<dyn RegexEngine>>,
}

/// Compile a source string into an executable expression.
pub async fn compile(source: &str, options: Options) -> Result<Expression> {
    let parsed = flash_parser::parse(source, options.recover)?;
    let mut errors = parsed.errors;

    if parsed.contains_flash && options.navigator.is_none() {
        return Err(Error::new("F1000", Span::at(0), 1));
    }

    let dicts = match (&options.navigator, parsed.contains_flash) {
        (Some(navigator), true) => {
            let dicts =
                resolve_structures(&parsed.ast, navigator.as_ref(), options.recover).await?;
            errors.extend(dicts.errors.iter().cloned());
            dicts
        }
        _ => StructureDictionaries::default(),
    };

    let root_ctx = Rc::new(RootContext::new(dicts, options.regex_engine));
    let static_frame = Frame::new_root(root_ctx.clone());

    Ok(Expression {
        ast: parsed.ast,
        errors,
        root_ctx,
        static_frame,
    })
}

/// A compiled expression: the normalized AST plus the static environment
/// holding host bindings, registered functions and resolved structure
/// dictionaries.
pub struct Expression {
    ast: NodeRef,
    errors: Vec<Error>,
    root_ctx: Rc<RootContext>,
    static_frame: FrameRef,
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expression").finish_non_exhaustive()
    }
}

impl Expression {
    /// Evaluate against a JSON input with optional extra bindings.
    ///
    /// Each invocation gets a fresh frame chained onto the static
    /// environment and a fresh timestamp.
    pub async fn evaluate(
        &self,
        input: &serde_json::Value,
        bindings: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Value> {
        if !self.errors.is_empty() {
            return Err(Error::new("S0500", Span::at(0), 1));
        }

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        self.root_ctx.timestamp_millis.set(millis);

        let frame = Frame::child(&self.static_frame);
        if let Some(bindings) = bindings {
            for (name, value) in bindings {
                frame.bind(name.clone(), Value::from_json(value));
            }
        }

        // Array inputs are wrapped so that path expressions see the whole
        // document rather than fanning out over it.
        let input = match Value::from_json(input) {
            Value::Array(a) => Value::Array(ArrayValue {
                items: vec![Value::Array(a)],
                flags: ArrayFlags {
                    sequence: true,
                    outer_wrapper: true,
                    ..ArrayFlags::default()
                },
            }),
            other => other,
        };

        evaluate(&self.ast, &input, &frame).await
    }

    /// Bind a name in the static environment.
    pub fn assign(&self, name: &str, value: serde_json::Value) {
        self.static_frame.bind(name.to_string(), Value::from_json(&value));
    }

    /// Bind an already-constructed engine value (functions included).
    pub fn assign_value(&self, name: &str, value: Value) {
        self.static_frame.bind(name.to_string(), value);
    }

    /// Register a synchronous native function. The signature (e.g.
    /// `"<s-:s>"`) is validated against call arguments at runtime.
    pub fn register_function<F>(
        &self,
        name: &str,
        signature_str: Option<&str>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(Vec<Value>) -> Result<Value> + 'static,
    {
        let implementation: NativeImpl =
            Rc::new(move |args| Box::pin(std::future::ready(f(args))));
        self.register_native(name, signature_str, implementation)
    }

    /// Register a native function whose implementation may suspend.
    pub fn register_native(
        &self,
        name: &str,
        signature_str: Option<&str>,
        implementation: NativeImpl,
    ) -> Result<()> {
        let signature = match signature_str {
            Some(s) => Some(signature::parse(s, Span::at(0), 1)?),
            None => None,
        };
        self.static_frame.bind(
            name.to_string(),
            Value::Function(FunctionValue::Native(Rc::new(NativeValue {
                name: name.to_string(),
                signature,
                implementation,
            }))),
        );
        Ok(())
    }

    /// Install a hook invoked before every node evaluation. Returning an
    /// error (conventionally U1001) aborts evaluation; hosts use this for
    /// timeouts and depth ceilings.
    pub fn set_evaluate_entry_hook(&self, hook: EvalHook) {
        *self.root_ctx.entry_hook.borrow_mut() = Some(hook);
    }

    /// Install a hook invoked after every node evaluation.
    pub fn set_evaluate_exit_hook(&self, hook: EvalHook) {
        *self.root_ctx.exit_hook.borrow_mut() = Some(hook);
    }

    /// The normalized AST.
    pub fn ast(&self) -> &NodeRef {
        &self.ast
    }

    /// Errors accumulated in recover mode.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}
