//! SQL text handling: statement splitting and up/down section extraction

pub mod directive;
pub mod tokenizer;

pub use directive::{Modifier, Modifiers, Section};
pub use tokenizer::{split_statements, StatementTokenizer, Statements};
