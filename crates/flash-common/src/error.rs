use std::fmt;

use serde::Serialize;

use crate::span::Span;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised anywhere in the pipeline: lexing, parsing, structure
/// resolution or evaluation.
///
/// Errors are data records. The numeric `code` is the contract with callers;
/// the human message is rendered on demand from the shared template table
/// via [`Error::message`]. Optional fields fill the template's `{token}`,
/// `{value}`, `{value2}`, `{expected}` and `{index}` slots; FLASH evaluation
/// errors additionally carry the offending element name and parent path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Error {
    pub code: &'static str,
    pub span: Span,
    /// 1-based source line where the error was raised.
    pub line: u32,
    pub token: Option<String>,
    pub value: Option<String>,
    pub value2: Option<String>,
    pub expected: Option<String>,
    pub index: Option<usize>,
    /// FLASH: the element name involved (e.g. the missing mandatory child).
    pub fhir_element: Option<String>,
    /// FLASH: the flash path of the enclosing element.
    pub fhir_path: Option<String>,
}

impl Error {
    /// Create an error with just a code and location.
    pub fn new(code: &'static str, span: Span, line: u32) -> Self {
        Self {
            code,
            span,
            line,
            token: None,
            value: None,
            value2: None,
            expected: None,
            index: None,
            fhir_element: None,
            fhir_path: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_value2(mut self, value: impl Into<String>) -> Self {
        self.value2 = Some(value.into());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_fhir_element(mut self, element: impl Into<String>) -> Self {
        self.fhir_element = Some(element.into());
        self
    }

    pub fn with_fhir_path(mut self, path: impl Into<String>) -> Self {
        self.fhir_path = Some(path.into());
        self
    }

    /// Byte offset where the error was raised.
    pub fn position(&self) -> u32 {
        self.span.start
    }

    /// Fill in location/token from a raising site if this error does not
    /// already carry them. Errors acquire the position of the outermost
    /// node that re-raises them only when they left the original site
    /// without one.
    pub fn or_position(mut self, span: Span, line: u32) -> Self {
        if self.span.is_empty() && self.span.start == 0 {
            self.span = span;
            self.line = line;
        }
        self
    }

    /// Render the human-readable message for this error from the shared
    /// template table. Unknown codes fall back to the code itself.
    pub fn message(&self) -> String {
        let template = template(self.code).unwrap_or(self.code);
        let mut msg = template.to_string();
        if let Some(t) = &self.token {
            msg = msg.replace("{token}", t);
        }
        if let Some(v) = &self.value {
            msg = msg.replace("{value}", v);
        }
        if let Some(v) = &self.value2 {
            msg = msg.replace("{value2}", v);
        }
        if let Some(e) = &self.expected {
            msg = msg.replace("{expected}", e);
        }
        if let Some(i) = self.index {
            msg = msg.replace("{index}", &i.to_string());
        }
        if let Some(e) = &self.fhir_element {
            msg = msg.replace("{element}", e);
        }
        if let Some(p) = &self.fhir_path {
            msg = msg.replace("{path}", p);
        }
        msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (line {})", self.code, self.message(), self.line)
    }
}

impl std::error::Error for Error {}

/// Message template for an error code, or `None` for unknown codes.
///
/// Templates use `{token}`, `{value}`, `{value2}`, `{expected}`, `{index}`,
/// `{element}` and `{path}` placeholders filled from the error record.
pub fn template(code: &str) -> Option<&'static str> {
    let msg = match code {
        // ── Lexical ────────────────────────────────────────────────────
        "S0101" => "String literal must be terminated by a matching quote",
        "S0102" => "Number out of range: {token}",
        "S0103" => "Unsupported escape sequence: \\{token}",
        "S0104" => "The escape sequence \\u must be followed by 4 hex digits",
        "S0105" => "Quoted property name must be terminated with a backquote (`)",
        "S0106" => "Comment has no closing tag",
        "S0301" => "Empty regular expressions are not allowed",
        "S0302" => "No terminating / in regular expression",

        // ── Syntactic ──────────────────────────────────────────────────
        "S0201" => "Syntax error: {token}",
        "S0202" => "Expected {value}, got {token}",
        "S0203" => "Expected {value} before end of expression",
        "S0204" => "Unknown operator: {token}",
        "S0205" => "Unexpected token: {token}",
        "S0206" => "Unknown expression type: {token}",
        "S0207" => "Unexpected end of expression",
        "S0208" => "Parameter {value} of function definition must be a variable name (start with $)",
        "S0209" => "A predicate cannot follow a grouping expression in a step",
        "S0210" => "Each step can only have one grouping expression",
        "S0211" => "The symbol {token} cannot be used as a unary operator",
        "S0212" => "The left side of := must be a variable name (start with $)",
        "S0213" => "The literal value {value} cannot be used as a step within a path expression",
        "S0214" => "The right side of {token} must be a variable name (start with $)",
        "S0215" => "A context variable binding must precede any predicates on a step",
        "S0216" => "A context variable binding must precede the 'order-by' clause on a step",
        "S0217" => "The object representing the 'parent' cannot be derived from this expression",
        "S0500" => "Attempted to evaluate an expression containing syntax error(s)",

        // ── Evaluation ─────────────────────────────────────────────────
        "D1001" => "Number out of range: {value}",
        "D1002" => "Cannot negate a non-numeric value: {value}",
        "D1004" => "Regular expression matches zero length string",
        "D1009" => "Multiple key definitions evaluate to same key: {value}",
        "D2014" => "The size of the sequence allocated by the range operator (..) must not exceed 1e7 entries",
        "T0410" => "Argument {index} of function {token} does not match function signature",
        "T0411" => "Context value is not a compatible type with argument {index} of function {token}",
        "T0412" => "Argument {index} of function {token} must be an array of {value}",
        "T1003" => "Key in object structure must evaluate to a string; got: {value}",
        "T1005" => "Attempted to invoke a non-function. Did you mean ${token}?",
        "T1006" => "Attempted to invoke a non-function",
        "T1007" => "Attempted to partially apply a non-function. Did you mean ${token}?",
        "T1008" => "Attempted to partially apply a non-function",
        "T2001" => "The left side of the {token} operator must evaluate to a number",
        "T2002" => "The right side of the {token} operator must evaluate to a number",
        "T2003" => "The left side of the range operator (..) must evaluate to an integer",
        "T2004" => "The right side of the range operator (..) must evaluate to an integer",
        "T2006" => "The right side of the function application operator ~> must be a function: {value}",
        "T2007" => "Type mismatch when comparing values {value} and {value2} in order-by clause",
        "T2008" => "The expressions within an order-by clause must evaluate to numeric or string values",
        "T2009" => "The values {value} and {value2} either side of operator {token} must be of the same data type",
        "T2010" => "The expressions either side of operator {token} must evaluate to numeric or string values",
        "T2011" => "The insert/update clause of the transform expression must evaluate to an object: {value}",
        "T2012" => "The delete clause of the transform expression must evaluate to an array of strings: {value}",
        "T2013" => "The transform expression clones the input; the cloned input must be a JSON value",
        "U1001" => "Evaluation was aborted by the host",

        // ── FLASH compile ──────────────────────────────────────────────
        "F1000" => "FLASH blocks require a structure navigator to compile",
        "F1009" => "A flash rule must appear inside a flash block (after InstanceOf:)",
        "F1010" => "An Instance: declaration must be followed by an InstanceOf: declaration",
        "F1011" => "The Instance: expression must be terminated by a newline",
        "F1012" => "Expected an expression after '=' in flash rule",
        "F1013" => "Instance: and InstanceOf: declarations cannot share a line",
        "F1014" => "The InstanceOf: declaration must be indented to the same level as its Instance: declaration",
        "F1016" => "Flash rule is indented below the root level of its block",
        "F1017" => "Flash rule is indented beyond its expected level",
        "F1018" => "Expected a flash rule (*) or variable binding at this indentation",
        "F1019" => "Expected an identifier after InstanceOf:",
        "F1020" => "Cannot assign into a path expression inside a flash rule",
        "F1021" => "Flash rule indentation must advance in steps of two",
        "F1022" => "A flash rule path cannot be a wildcard (*)",
        "F1023" => "A flash rule path cannot start with a variable ($)",
        "F1024" => "Empty flash rule",
        "F1025" => "A flash rule cannot be nested under a variable binding with an inline expression",
        "F1026" => "Invalid InstanceOf identifier: {value}",
        "F1028" => "Invalid flash path: {value}",

        // ── FLASH resolve ──────────────────────────────────────────────
        "F2001" => "Definition of type or profile '{value}' was not found",
        "F2002" => "Element '{value}' was not found in the structure definition",
        "F2003" => "Failed to fetch the children of element '{value}'",
        "F2004" => "Element '{value}' is polymorphic; assign to one of: {expected}",
        "F2005" => "Element '{value}' is forbidden (max cardinality 0)",
        "F2006" => "Failed to fetch the children of type '{value}'",
        "F2007" => "Element '{value}' has no type",
        "F2008" => "Base type metadata for '{value}' was not found",

        // ── FLASH evaluate ─────────────────────────────────────────────
        "F3000" => "Missing resolved definition for flash reference '{value}'",
        "F3001" => "Value '{value}' does not match the pattern for type {value2}",
        "F3002" => "Mandatory element '{element}' is missing under '{path}'",
        "F3003" => "Missing element definition for '{value}'",
        "F3004" => "Element '{value}' has no resolved kind",
        "F3005" => "Cannot assign to unresolved polymorphic element '{value}'",
        "F3006" => "A primitive element can only be assigned a string, number or boolean",
        "F3007" => "Element '{value}' has no type code",
        "F3008" => "Element '{value}' is forbidden here (max cardinality 0)",

        _ => return None,
    };
    Some(msg)
}
