//! Function signature parsing and argument validation.
//!
//! Signatures use the grammar `<` param-spec* `:` return-spec? `>` with
//! type letters `b n s a o f u l j x`, modifiers `?` (optional), `+` (one
//! or more) and `-` (substitute the context value when the argument is
//! missing), and parameterized forms `a<...>` / `f<...>`. Validation
//! coerces the supplied arguments to the declared shapes or fails with
//! T0410/T0411/T0412 keyed to the offending argument position.

use flash_common::{Error, Result, Span};

use crate::value::Value;

/// A declared parameter type.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeSpec {
    Bool,
    Number,
    String,
    /// `a` or `a<inner>`.
    Array(Option<Box<TypeSpec>>),
    Object,
    /// `f`; any inner signature is recorded but not enforced recursively.
    Function,
    Null,
    /// `j`: any JSON value (excludes functions).
    Json,
    /// `x`: anything.
    Any,
}

impl TypeSpec {
    /// Human-readable name used in T0412 diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TypeSpec::Bool => "boolean",
            TypeSpec::Number => "number",
            TypeSpec::String => "string",
            TypeSpec::Array(_) => "array",
            TypeSpec::Object => "object",
            TypeSpec::Function => "function",
            TypeSpec::Null => "null",
            TypeSpec::Json => "json",
            TypeSpec::Any => "any",
        }
    }
}

/// One declared parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub spec: TypeSpec,
    pub optional: bool,
    pub variadic: bool,
    /// `-`: use the evaluation context when the argument is missing.
    pub context: bool,
}

/// A parsed signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub params: Vec<Param>,
    pub source: String,
}

/// Parse a signature string (including the angle brackets).
pub fn parse(sig: &str, span: Span, line: u32) -> Result<Signature> {
    let bad = |tok: char| Error::new("S0201", span, line).with_token(tok.to_string());
    let chars: Vec<char> = sig.chars().collect();
    if chars.first() != Some(&'<') || chars.last() != Some(&'>') {
        return Err(Error::new("S0201", span, line).with_token(sig));
    }
    let mut params = Vec::new();
    let mut i = 1;
    let end = chars.len() - 1;
    while i < end {
        let c = chars[i];
        if c == ':' {
            // Return spec: recorded by the source string only.
            break;
        }
        let spec = match c {
            'b' => TypeSpec::Bool,
            'n' => TypeSpec::Number,
            's' => TypeSpec::String,
            'o' => TypeSpec::Object,
            'l' => TypeSpec::Null,
            'j' => TypeSpec::Json,
            'x' => TypeSpec::Any,
            'u' => TypeSpec::Any,
            'a' | 'f' => {
                let is_array = c == 'a';
                // Optional parameterization.
                let mut inner = None;
                if chars.get(i + 1) == Some(&'<') {
                    let mut depth = 1;
                    let start = i + 2;
                    let mut j = start;
                    while j < end && depth > 0 {
                        match chars[j] {
                            '<' => depth += 1,
                            '>' => depth -= 1,
                            _ => {}
                        }
                        j += 1;
                    }
                    if depth > 0 {
                        return Err(bad('<'));
                    }
                    if is_array {
                        let inner_src: String = chars[start..j - 1].iter().collect();
                        if let Some(first) = inner_src.chars().next() {
                            let nested =
                                parse(&format!("<{first}:>"), span, line)?;
                            inner = nested.params.first().map(|p| Box::new(p.spec.clone()));
                        }
                    }
                    i = j - 1;
                }
                if is_array {
                    TypeSpec::Array(inner)
                } else {
                    TypeSpec::Function
                }
            }
            other => return Err(bad(other)),
        };
        i += 1;
        let mut param = Param { spec, optional: false, variadic: false, context: false };
        while i < end {
            match chars[i] {
                '?' => param.optional = true,
                '+' => param.variadic = true,
                '-' => param.context = true,
                _ => break,
            }
            i += 1;
        }
        params.push(param);
    }
    Ok(Signature { params, source: sig.to_string() })
}

/// Whether a value matches a type spec. Undefined passes any spec so that
/// absent inputs flow through to the function.
fn matches(spec: &TypeSpec, value: &Value) -> bool {
    if value.is_undefined() {
        return true;
    }
    match spec {
        TypeSpec::Any => true,
        TypeSpec::Json => !value.is_function(),
        TypeSpec::Bool => matches!(value, Value::Bool(_)),
        TypeSpec::Number => matches!(value, Value::Number(_)),
        TypeSpec::String => matches!(value, Value::String(_)),
        TypeSpec::Null => matches!(value, Value::Null),
        TypeSpec::Object => matches!(value, Value::Object(_)),
        TypeSpec::Function => value.is_function(),
        TypeSpec::Array(inner) => match value {
            Value::Array(a) => match inner {
                Some(spec) => a.items.iter().all(|v| matches(spec, v)),
                None => true,
            },
            _ => false,
        },
    }
}

impl Signature {
    /// Validate and coerce arguments. `context` fills `-` parameters when
    /// the call site supplied fewer arguments; `fname` labels diagnostics.
    pub fn validate(
        &self,
        args: Vec<Value>,
        context: &Value,
        fname: &str,
        span: Span,
        line: u32,
    ) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        let mut ai = 0;
        for (pi, param) in self.params.iter().enumerate() {
            if ai >= args.len() {
                if param.context {
                    if !matches(&param.spec, context) {
                        return Err(Error::new("T0411", span, line)
                            .with_token(fname)
                            .with_index(pi + 1));
                    }
                    out.push(context.clone());
                    continue;
                }
                if param.optional {
                    continue;
                }
                return Err(Error::new("T0410", span, line)
                    .with_token(fname)
                    .with_index(pi + 1));
            }
            let arg = &args[ai];
            if matches(&param.spec, arg) {
                out.push(arg.clone());
                ai += 1;
                if param.variadic {
                    while ai < args.len() && matches(&param.spec, &args[ai]) {
                        out.push(args[ai].clone());
                        ai += 1;
                    }
                }
                continue;
            }
            // An array parameter accepts a matching single value by
            // wrapping it.
            if let TypeSpec::Array(inner) = &param.spec {
                let inner_ok = inner
                    .as_ref()
                    .map(|spec| matches(spec, arg))
                    .unwrap_or(true);
                if inner_ok && !arg.is_function() {
                    out.push(Value::array(vec![arg.clone()]));
                    ai += 1;
                    continue;
                }
                if matches!(arg, Value::Array(_)) {
                    // An array whose items do not satisfy the item spec.
                    return Err(Error::new("T0412", span, line)
                        .with_token(fname)
                        .with_index(ai + 1)
                        .with_value(
                            inner.as_ref().map(|s| s.name()).unwrap_or("any"),
                        ));
                }
            }
            if param.optional {
                continue;
            }
            return Err(Error::new("T0410", span, line)
                .with_token(fname)
                .with_index(ai + 1));
        }
        if ai < args.len() {
            return Err(Error::new("T0410", span, line)
                .with_token(fname)
                .with_index(ai + 1));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        parse(s, Span::at(0), 1).expect("signature parses")
    }

    fn validate(s: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        sig(s).validate(args, &Value::Undefined, "f", Span::at(0), 1)
    }

    #[test]
    fn parses_letters_and_modifiers() {
        let s = sig("<s-n?:s>");
        assert_eq!(s.params.len(), 2);
        assert!(s.params[0].context);
        assert_eq!(s.params[0].spec, TypeSpec::String);
        assert!(s.params[1].optional);
        assert_eq!(s.params[1].spec, TypeSpec::Number);
    }

    #[test]
    fn parses_parameterized_array() {
        let s = sig("<a<n>:n>");
        assert_eq!(
            s.params[0].spec,
            TypeSpec::Array(Some(Box::new(TypeSpec::Number)))
        );
    }

    #[test]
    fn validates_matching_args() {
        let out = validate("<sn:s>", vec![Value::string("a"), Value::Number(1.0)]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn rejects_wrong_type_with_t0410() {
        let err = validate("<n:n>", vec![Value::string("a")]).unwrap_err();
        assert_eq!(err.code, "T0410");
        assert_eq!(err.index, Some(1));
    }

    #[test]
    fn wraps_single_value_for_array_param() {
        let out = validate("<a<n>:n>", vec![Value::Number(5.0)]).unwrap();
        assert!(matches!(&out[0], Value::Array(a) if a.items.len() == 1));
    }

    #[test]
    fn array_of_wrong_items_is_t0412() {
        let arr = Value::array(vec![Value::string("x")]);
        let err = validate("<a<n>:n>", vec![arr]).unwrap_err();
        assert_eq!(err.code, "T0412");
    }

    #[test]
    fn context_substitution_fills_missing_arg() {
        let s = sig("<s-:s>");
        let out = s
            .validate(vec![], &Value::string("ctx"), "f", Span::at(0), 1)
            .unwrap();
        assert_eq!(out[0].as_str(), Some("ctx"));
    }

    #[test]
    fn context_substitution_type_mismatch_is_t0411() {
        let s = sig("<s-:s>");
        let err = s
            .validate(vec![], &Value::Number(1.0), "f", Span::at(0), 1)
            .unwrap_err();
        assert_eq!(err.code, "T0411");
    }

    #[test]
    fn variadic_consumes_matching_tail() {
        let out = validate(
            "<n+:n>",
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
        )
        .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn extra_args_are_rejected() {
        let err = validate("<n:n>", vec![Value::Number(1.0), Value::Number(2.0)]).unwrap_err();
        assert_eq!(err.code, "T0410");
        assert_eq!(err.index, Some(2));
    }
}
