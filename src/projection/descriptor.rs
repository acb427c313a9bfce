//! Compiled field / expression descriptors (spec.md §3, §4.E).

use crate::external::Expression;

#[derive(Debug, Clone)]
pub struct CompiledFieldDescriptor {
    pub field_name: String,
    pub output_name: String,
    pub is_select_star: bool,
    pub is_function_call: bool,
    pub has_nested_path: bool,
    pub is_string_literal: bool,
    pub string_literal_value: Option<String>,
    pub alias: Option<String>,
}

pub struct CompiledExpressionDescriptor {
    pub original_expr: String,
    pub preprocessed_expr: String,
    pub is_function_call: bool,
    pub has_nested_path: bool,
    pub precompiled_expression: Option<Box<dyn Expression>>,
    pub needs_backtick_rewrite: bool,
}

impl std::fmt::Debug for CompiledExpressionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpressionDescriptor")
            .field("original_expr", &self.original_expr)
            .field("preprocessed_expr", &self.preprocessed_expr)
            .field("is_function_call", &self.is_function_call)
            .field("has_nested_path", &self.has_nested_path)
            .field("needs_backtick_rewrite", &self.needs_backtick_rewrite)
            .field("precompiled_expression", &self.precompiled_expression.is_some())
            .finish()
    }
}
