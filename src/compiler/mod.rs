pub mod lexer;
pub mod parser;
pub mod plan;

pub use plan::{compile, compile_with_snapshot, CompiledSchema, EntityPlan};
