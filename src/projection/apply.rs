//! Per-record projection (spec.md §4.F step 5, §4.K).
//!
//! Shared by the direct (non-window) processor path and the synchronous
//! query path — both need the identical "evaluate expressions, dispatch
//! simple fields by class, select-star copies what expressions didn't
//! touch" behavior.

use tracing::warn;

use crate::external::{ExpressionBridge, FunctionRegistry};
use crate::value::{Record, Value};

use super::descriptor::{CompiledExpressionDescriptor, CompiledFieldDescriptor};

/// Builds one output record from `record` per the compiled descriptors.
/// Full passthrough (a clone of `record`) when neither expressions nor
/// simple-fields are configured. `registry` is consulted for function-call
/// fields/expressions before falling back to `bridge` (spec.md §6: the
/// function registry is a named lookup the bridge itself doesn't cover).
pub fn project_record(
    record: &Record,
    simple_fields: &[CompiledFieldDescriptor],
    expressions: &[(String, CompiledExpressionDescriptor)],
    bridge: &dyn ExpressionBridge,
    registry: Option<&dyn FunctionRegistry>,
) -> Record {
    if simple_fields.is_empty() && expressions.is_empty() {
        return record.clone();
    }

    let mut result = Record::new();

    for (name, expr) in expressions {
        let value = evaluate_expression(expr, record, bridge, registry);
        result.insert(name.clone(), value);
    }

    for field in simple_fields {
        if field.is_select_star {
            for (k, v) in record {
                if !result.contains_key(k) {
                    result.insert(k.clone(), v.clone());
                }
            }
            continue;
        }

        if field.is_string_literal {
            result.insert(
                field.output_name.clone(),
                Value::String(field.string_literal_value.clone().unwrap_or_default()),
            );
            continue;
        }

        let value = if field.is_function_call {
            call_function(registry, bridge, &field.field_name, record)
        } else if field.has_nested_path {
            Value::get_path(record, &field.field_name)
                .cloned()
                .unwrap_or(Value::Null)
        } else {
            record.get(&field.field_name).cloned().unwrap_or(Value::Null)
        };
        result.insert(field.output_name.clone(), value);
    }

    result
}

fn evaluate_expression(
    expr: &CompiledExpressionDescriptor,
    record: &Record,
    bridge: &dyn ExpressionBridge,
    registry: Option<&dyn FunctionRegistry>,
) -> Value {
    if expr.is_function_call {
        return call_function(registry, bridge, &expr.preprocessed_expr, record);
    }

    if let Some(compiled) = &expr.precompiled_expression {
        return match compiled.evaluate_value_with_null(record) {
            Ok((_, true)) => Value::Null,
            Ok((v, false)) => v,
            Err(e) => {
                warn!(expr = %expr.original_expr, error = %e, "projection expression failed");
                Value::Null
            }
        };
    }

    match bridge.evaluate_expression(&expr.preprocessed_expr, record) {
        Ok(v) => v,
        Err(e) => {
            warn!(expr = %expr.original_expr, error = %e, "projection expression failed");
            Value::Null
        }
    }
}

/// Looks a `name(arg, ...)` call up in the function registry first;
/// falls back to the bridge's own expression evaluation when there is no
/// registry, or the name isn't registered (e.g. it's one of the bridge's
/// own built-ins rather than a user-defined function).
fn call_function(
    registry: Option<&dyn FunctionRegistry>,
    bridge: &dyn ExpressionBridge,
    text: &str,
    record: &Record,
) -> Value {
    if let Some(registry) = registry {
        if let Some((name, arg_str)) = parse_call(text) {
            if let Some(function) = registry.get(name) {
                let args = resolve_args(arg_str, record);
                return match function.execute(record, &args) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(function = name, error = %e, "registered function call failed");
                        Value::Null
                    }
                };
            }
        }
    }

    match bridge.evaluate_expression(text, record) {
        Ok(v) => v,
        Err(e) => {
            warn!(expr = text, error = %e, "projection function call failed");
            Value::Null
        }
    }
}

/// Splits `"name(a, b)"` into `("name", "a, b")`.
fn parse_call(text: &str) -> Option<(&str, &str)> {
    let open = text.find('(')?;
    let text_trimmed = text.trim_end();
    if !text_trimmed.ends_with(')') {
        return None;
    }
    Some((text[..open].trim(), &text_trimmed[open + 1..text_trimmed.len() - 1]))
}

/// Resolves comma-separated call arguments against `record`: quoted
/// literals and numbers evaluate to themselves, everything else is
/// looked up as a field name.
fn resolve_args(arg_str: &str, record: &Record) -> Vec<Value> {
    arg_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|arg| {
            if let Some(inner) = arg.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
                Value::String(inner.to_string())
            } else if let Some(inner) = arg.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                Value::String(inner.to_string())
            } else if let Ok(n) = arg.parse::<f64>() {
                Value::Number(n)
            } else {
                record.get(arg).cloned().unwrap_or(Value::Null)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamSqlResult;
    use crate::external::{Condition, Expression};

    struct UpperBridge;

    struct ConstExpr(f64);
    impl Expression for ConstExpr {
        fn evaluate(&self, _record: &Record) -> f64 {
            self.0
        }
        fn evaluate_value_with_null(&self, _record: &Record) -> StreamSqlResult<(Value, bool)> {
            Ok((Value::Number(self.0), false))
        }
    }

    impl ExpressionBridge for UpperBridge {
        fn compile_condition(&self, _text: &str) -> StreamSqlResult<Box<dyn Condition>> {
            unimplemented!()
        }
        fn compile_expression(&self, _text: &str) -> StreamSqlResult<Box<dyn Expression>> {
            Ok(Box::new(ConstExpr(60.0)))
        }
        fn evaluate_expression(&self, text: &str, record: &Record) -> StreamSqlResult<Value> {
            if text == "UPPER(name)" {
                let name = record.get("name").and_then(|v| v.as_str()).unwrap_or("");
                Ok(Value::String(name.to_uppercase()))
            } else {
                Ok(Value::Null)
            }
        }
        fn preprocess_is_null_expression(&self, text: &str) -> String {
            text.to_string()
        }
        fn preprocess_like_expression(&self, text: &str) -> String {
            text.to_string()
        }
        fn preprocess_backtick_identifiers(&self, text: &str) -> String {
            text.to_string()
        }
        fn contains_is_null_operator(&self, _text: &str) -> bool {
            false
        }
        fn contains_like_operator(&self, _text: &str) -> bool {
            false
        }
        fn contains_backtick_identifiers(&self, _text: &str) -> bool {
            false
        }
    }

    #[test]
    fn select_star_plus_expression_override_matches_scenario_s3() {
        use crate::config::FieldExpression;
        use crate::projection::{compile_expression_descriptor, compile_field};

        let mut record = Record::new();
        record.insert("name".to_string(), Value::String("alice".into()));
        record.insert("age".to_string(), Value::Number(30.0));
        record.insert("status".to_string(), Value::String("active".into()));

        let bridge = UpperBridge;
        let simple_fields = vec![compile_field("*")];
        let expressions = vec![
            (
                "name".to_string(),
                compile_expression_descriptor(
                    "name",
                    &FieldExpression {
                        expression: "UPPER(name)".to_string(),
                        referenced_fields: vec!["name".to_string()],
                    },
                    &bridge,
                ),
            ),
            (
                "age".to_string(),
                compile_expression_descriptor(
                    "age",
                    &FieldExpression {
                        expression: "age * 2".to_string(),
                        referenced_fields: vec!["age".to_string()],
                    },
                    &bridge,
                ),
            ),
        ];

        let result = project_record(&record, &simple_fields, &expressions, &bridge, None);
        assert_eq!(result.get("name"), Some(&Value::String("ALICE".into())));
        assert_eq!(result.get("age"), Some(&Value::Number(60.0)));
        assert_eq!(result.get("status"), Some(&Value::String("active".into())));
    }

    #[test]
    fn full_passthrough_without_fields_or_expressions() {
        let bridge = UpperBridge;
        let mut record = Record::new();
        record.insert("a".to_string(), Value::Number(1.0));
        let result = project_record(&record, &[], &[], &bridge, None);
        assert_eq!(result, record);
    }

    struct DoubleFn;
    impl crate::external::SqlFunction for DoubleFn {
        fn execute(&self, _ctx: &Record, args: &[Value]) -> StreamSqlResult<Value> {
            let n = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(Value::Number(n * 2.0))
        }
    }

    struct OneFunctionRegistry;
    impl FunctionRegistry for OneFunctionRegistry {
        fn get(&self, name: &str) -> Option<&dyn crate::external::SqlFunction> {
            if name == "DOUBLE" {
                Some(&DoubleFn)
            } else {
                None
            }
        }
    }

    #[test]
    fn function_call_resolves_through_registry_before_bridge() {
        use crate::projection::compile_field;

        let mut record = Record::new();
        record.insert("age".to_string(), Value::Number(21.0));

        let bridge = UpperBridge;
        let registry = OneFunctionRegistry;
        let simple_fields = vec![compile_field("DOUBLE(age)")];

        let result = project_record(&record, &simple_fields, &[], &bridge, Some(&registry));
        assert_eq!(result.get("DOUBLE(age)"), Some(&Value::Number(42.0)));
    }

    #[test]
    fn unregistered_function_call_falls_back_to_bridge() {
        use crate::projection::compile_field;

        let mut record = Record::new();
        record.insert("name".to_string(), Value::String("alice".into()));

        let bridge = UpperBridge;
        let registry = OneFunctionRegistry;
        let simple_fields = vec![compile_field("UPPER(name)")];

        let result = project_record(&record, &simple_fields, &[], &bridge, Some(&registry));
        assert_eq!(result.get("UPPER(name)"), Some(&Value::String("ALICE".into())));
    }
}
