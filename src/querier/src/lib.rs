//! Embedded LogQL engine evaluated directly against live log sources.
//!
//! - [`query::logql`] parses queries;
//! - [`query::engine`] evaluates them through a [`query::engine::Querier`];
//! - [`iterators`] carries records and merges ordered streams;
//! - [`source`] adapts a set of individually readable sources into a querier.

pub mod iterators;
pub mod query;
pub mod source;
