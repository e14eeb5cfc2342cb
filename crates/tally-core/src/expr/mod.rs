//! Expression decomposition: infix text in, persisted task DAG out.

mod parser;
mod service;

pub use parser::{DelayTable, ExpressionParseError, TaskGraph, decompose};
pub use service::{SubmitError, submit_expression};
