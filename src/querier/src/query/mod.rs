pub mod engine;
pub mod logql;
