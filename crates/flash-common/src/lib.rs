//! Shared leaf types for the flash engine.
//!
//! Everything that more than one pipeline stage needs lives here: byte-offset
//! spans with on-demand line/column conversion, the token vocabulary produced
//! by `flash-lexer`, and the error record that every stage raises. Keeping
//! these in a leaf crate lets the lexer, parser, resolver and evaluator agree
//! on positions and diagnostics without depending on each other.

pub mod diagnostics;
pub mod error;
pub mod span;
pub mod token;

pub use error::{Error, Result};
pub use span::{SourceLines, Span};
pub use token::{Token, TokenKind};
