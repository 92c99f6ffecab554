//! Tree-walking evaluator for the flash expression language.
//!
//! Takes the normalized AST from `flash-parser` plus the dictionaries from
//! `flash-model` and evaluates expressions against a JSON-like input. The
//! FLASH sub-evaluator composes typed resources per the structure model;
//! everything else follows the query-language core semantics: sequences,
//! paths with tuple streams, operators, function application with a
//! tail-call trampoline, and transform/regex closures.

pub mod evaluator;
mod flash;
pub mod frame;
pub mod regex_engine;
pub mod signature;
pub mod value;

use std::rc::Rc;

use futures::future::LocalBoxFuture;

pub use evaluator::evaluate;
pub use frame::{EvalHook, Frame, FrameRef, RootContext};
pub use regex_engine::{CompiledRegex, DefaultRegexEngine, MatchData, PatternMatcher, RegexEngine};
pub use signature::Signature;
pub use value::{
    ArrayFlags, ArrayValue, FlashRuleResult, FunctionValue, LambdaValue, NativeValue,
    ObjectValue, Value,
};

/// Implementation type for host-registered native functions: evaluated
/// arguments in, a future of the result out.
pub type NativeImpl =
    Rc<dyn Fn(Vec<Value>) -> LocalBoxFuture<'static, flash_common::Result<Value>>>;
