pub mod record;

pub use record::{Attrs, Record, Timestamp};
