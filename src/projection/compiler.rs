//! Field-projection compiler (spec.md §4.E).
//!
//! Runs once at stream-factory time. Per-record work afterwards reduces
//! to a dispatch on the classification computed here.

use crate::config::{Config, FieldExpression};
use crate::external::ExpressionBridge;

use super::descriptor::{CompiledExpressionDescriptor, CompiledFieldDescriptor};

fn strip_wrapping(s: &str, open: char, close: char) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && s.starts_with(open) && s.ends_with(close) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn strip_backticks(s: &str) -> &str {
    strip_wrapping(s, '`', '`').unwrap_or(s)
}

fn string_literal_value(spec: &str) -> Option<String> {
    strip_wrapping(spec, '\'', '\'')
        .or_else(|| strip_wrapping(spec, '"', '"'))
        .map(|s| s.to_string())
}

pub fn compile_field(spec: &str) -> CompiledFieldDescriptor {
    let trimmed = spec.trim();

    if trimmed == "*" {
        return CompiledFieldDescriptor {
            field_name: "*".to_string(),
            output_name: "*".to_string(),
            is_select_star: true,
            is_function_call: false,
            has_nested_path: false,
            is_string_literal: false,
            string_literal_value: None,
            alias: None,
        };
    }

    if let Some(value) = string_literal_value(trimmed) {
        return CompiledFieldDescriptor {
            field_name: trimmed.to_string(),
            output_name: trimmed.to_string(),
            is_select_star: false,
            is_function_call: false,
            has_nested_path: false,
            is_string_literal: true,
            string_literal_value: Some(value),
            alias: None,
        };
    }

    let (field_part, alias) = match trimmed.split_once(':') {
        Some((f, a)) => (f.trim(), Some(strip_backticks(a.trim()).to_string())),
        None => (trimmed, None),
    };
    let field_name = strip_backticks(field_part).to_string();

    let is_function_call = field_name.contains('(') && field_name.contains(')');
    let has_nested_path = !is_function_call && field_name.contains('.');

    let output_name = alias.clone().unwrap_or_else(|| field_name.clone());

    CompiledFieldDescriptor {
        field_name,
        output_name,
        is_select_star: false,
        is_function_call,
        has_nested_path,
        is_string_literal: false,
        string_literal_value: None,
        alias,
    }
}

pub fn compile_fields(specs: &[String]) -> Vec<CompiledFieldDescriptor> {
    specs.iter().map(|s| compile_field(s)).collect()
}

pub fn compile_expression_descriptor(
    name: &str,
    expr: &FieldExpression,
    bridge: &dyn ExpressionBridge,
) -> CompiledExpressionDescriptor {
    let mut preprocessed = expr.expression.clone();
    if bridge.contains_is_null_operator(&preprocessed) {
        preprocessed = bridge.preprocess_is_null_expression(&preprocessed);
    }
    if bridge.contains_like_operator(&preprocessed) {
        preprocessed = bridge.preprocess_like_expression(&preprocessed);
    }

    let is_function_call = preprocessed.contains('(') && preprocessed.contains(')');
    let has_nested_path = !is_function_call && preprocessed.contains('.');
    let needs_backtick_rewrite = bridge.contains_backtick_identifiers(&preprocessed);

    let precompiled_expression = if is_function_call {
        None
    } else {
        let final_expr = if needs_backtick_rewrite {
            bridge.preprocess_backtick_identifiers(&preprocessed)
        } else {
            preprocessed.clone()
        };
        bridge.compile_expression(&final_expr).ok()
    };

    let _ = name;
    CompiledExpressionDescriptor {
        original_expr: expr.expression.clone(),
        preprocessed_expr: preprocessed,
        is_function_call,
        has_nested_path,
        precompiled_expression,
        needs_backtick_rewrite,
    }
}

/// Returned as an ordered list (not a map) since the direct-projection
/// path evaluates expressions in a fixed order before simple-fields.
/// `Config::field_expressions` is itself a `BTreeMap`, so iteration order
/// here is the field-expression name's lexicographic order.
pub fn compile_expressions(
    config: &Config,
    bridge: &dyn ExpressionBridge,
) -> Vec<(String, CompiledExpressionDescriptor)> {
    config
        .field_expressions
        .iter()
        .map(|(name, expr)| (name.clone(), compile_expression_descriptor(name, expr, bridge)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_star() {
        let d = compile_field("*");
        assert!(d.is_select_star);
    }

    #[test]
    fn string_literal_single_quoted() {
        let d = compile_field("'hello'");
        assert!(d.is_string_literal);
        assert_eq!(d.string_literal_value.as_deref(), Some("hello"));
    }

    #[test]
    fn string_literal_double_quoted() {
        let d = compile_field("\"hello\"");
        assert!(d.is_string_literal);
        assert_eq!(d.string_literal_value.as_deref(), Some("hello"));
    }

    #[test]
    fn function_call_detected() {
        let d = compile_field("UPPER(name)");
        assert!(d.is_function_call);
        assert!(!d.has_nested_path);
    }

    #[test]
    fn nested_path_detected_only_when_not_a_call() {
        let d = compile_field("device.id");
        assert!(!d.is_function_call);
        assert!(d.has_nested_path);
    }

    #[test]
    fn alias_with_backtick_stripping() {
        let d = compile_field("`my field`:alias");
        assert_eq!(d.field_name, "my field");
        assert_eq!(d.alias.as_deref(), Some("alias"));
        assert_eq!(d.output_name, "alias");
    }

    #[test]
    fn plain_field_output_name_defaults_to_field_name() {
        let d = compile_field("temperature");
        assert_eq!(d.output_name, "temperature");
        assert!(d.alias.is_none());
    }
}
