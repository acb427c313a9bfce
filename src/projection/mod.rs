//! Field-projection compilation (spec.md §3, §4.E).

pub mod apply;
pub mod compiler;
pub mod descriptor;

pub use apply::project_record;
pub use compiler::{compile_expression_descriptor, compile_expressions, compile_field, compile_fields};
pub use descriptor::{CompiledExpressionDescriptor, CompiledFieldDescriptor};
