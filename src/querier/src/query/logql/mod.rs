//! LogQL front end: lexer, parser and AST
//!
//! Only the subset needed for log selection, line processing and simple
//! metric queries is supported.

pub mod ast;
pub mod error;
mod lexer;
pub mod parser;
pub mod types;

pub use ast::{Expr, LogExpr, MetricExpr, PipelineStage};
pub use error::{ParseError, Position};
pub use parser::{ParseOptions, parse};
pub use types::{AggregationOp, BinOp, CmpOp, LabelMatcher, MatcherOp, RangeOp};
