//! Parser for the flash expression language: a Pratt expression parser that
//! also recognizes the FLASH sublanguage, plus the AST post-processor that
//! produces the normalized tree the evaluator consumes.

pub mod ast;
mod parser;
mod process;

use flash_common::{Error, Result, Span};

use ast::{Node, NodeKind, NodeRef};
pub use parser::Parser;

/// The outcome of parsing: the normalized AST, accumulated errors (recover
/// mode only), and whether any FLASH construct appears.
pub struct ParseOutput {
    pub ast: NodeRef,
    pub errors: Vec<Error>,
    pub contains_flash: bool,
}

impl ParseOutput {
    /// Whether parsing completed without errors.
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse and normalize a source string.
///
/// Without `recover`, the first error is returned as `Err`. With `recover`,
/// the error is recorded on the output and the AST is replaced by an error
/// stub that the evaluator refuses to execute.
pub fn parse(source: &str, recover: bool) -> Result<ParseOutput> {
    match try_parse(source) {
        Ok(output) => Ok(output),
        Err(err) if recover => Ok(ParseOutput {
            ast: Node::new(NodeKind::ErrorStub, Span::at(0), 1).rc(),
            errors: vec![err],
            contains_flash: false,
        }),
        Err(err) => Err(err),
    }
}

fn try_parse(source: &str) -> Result<ParseOutput> {
    let mut parser = Parser::new(source)?;
    let raw = parser.parse()?;
    let contains_flash = parser.contains_flash();
    let ast = process::process_ast(&raw)?;
    Ok(ParseOutput { ast, errors: Vec::new(), contains_flash })
}
