//! Pull-based iterators used wherever log records flow.
//!
//! An [`Iter`] fills a caller-owned slot on every successful [`Iter::next`]
//! call. `next` returns `false` both at the natural end of the sequence and
//! when reading failed; [`Iter::err`] tells the two apart. Every owner must
//! call [`Iter::close`] exactly once before dropping an iterator, whether or
//! not it was fully consumed.
//!
//! Iterators are single-consumer: none of them is safe for concurrent `next`
//! calls.

use std::fmt;
use std::sync::Arc;

mod merge;

pub use merge::MergeIter;

/// Failure reported by an iterator, either from one source or aggregated
/// from several.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IterError {
    #[error("{0:#}")]
    Source(Arc<anyhow::Error>),
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<IterError>),
}

impl IterError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Source(Arc::new(err.into()))
    }

    /// Bundle several errors into one, flattening nested aggregates.
    ///
    /// Returns `None` when there is nothing to report.
    pub fn aggregate(errors: impl IntoIterator<Item = IterError>) -> Option<Self> {
        let mut all = Vec::new();
        for err in errors {
            match err {
                Self::Aggregate(inner) => all.extend(inner),
                err => all.push(err),
            }
        }
        match all.len() {
            0 => None,
            1 => all.pop(),
            _ => Some(Self::Aggregate(all)),
        }
    }

    /// The individual failures carried by this error.
    pub fn errors(&self) -> &[IterError] {
        match self {
            Self::Aggregate(all) => all,
            single => std::slice::from_ref(single),
        }
    }
}

fn join_errors(errors: &[IterError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Pull-based sequence of `T`.
pub trait Iter<T>: Send {
    /// Fill `item` with the next element, returning `false` at the end of
    /// the sequence or on error.
    fn next(&mut self, item: &mut T) -> bool;

    /// The error that stopped iteration, if any.
    fn err(&self) -> Option<IterError>;

    /// Release the underlying resource.
    fn close(&mut self) -> Result<(), IterError>;
}

impl<T, I> Iter<T> for Box<I>
where
    I: Iter<T> + ?Sized,
{
    fn next(&mut self, item: &mut T) -> bool {
        (**self).next(item)
    }

    fn err(&self) -> Option<IterError> {
        (**self).err()
    }

    fn close(&mut self) -> Result<(), IterError> {
        (**self).close()
    }
}

pub type BoxIter<T> = Box<dyn Iter<T>>;

/// Iterator over an owned vector.
pub struct Slice<T> {
    items: std::vec::IntoIter<T>,
}

pub fn slice<T: Send>(items: Vec<T>) -> Slice<T> {
    Slice {
        items: items.into_iter(),
    }
}

impl<T: Send> Iter<T> for Slice<T> {
    fn next(&mut self, item: &mut T) -> bool {
        match self.items.next() {
            Some(next) => {
                *item = next;
                true
            }
            None => false,
        }
    }

    fn err(&self) -> Option<IterError> {
        None
    }

    fn close(&mut self) -> Result<(), IterError> {
        Ok(())
    }
}

impl<T> fmt::Debug for Slice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("remaining", &self.items.len())
            .finish()
    }
}

/// Iterator that yields nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;

pub fn empty() -> Empty {
    Empty
}

impl<T> Iter<T> for Empty {
    fn next(&mut self, _item: &mut T) -> bool {
        false
    }

    fn err(&self) -> Option<IterError> {
        None
    }

    fn close(&mut self) -> Result<(), IterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_yields_all_items() {
        let mut iter = slice(vec![1, 2, 3]);
        let mut item = 0;
        let mut got = Vec::new();
        while iter.next(&mut item) {
            got.push(item);
        }

        assert_eq!(got, vec![1, 2, 3]);
        assert!(iter.err().is_none());
        assert!(iter.close().is_ok());
    }

    #[test]
    fn test_empty_yields_nothing() {
        let mut iter: BoxIter<String> = Box::new(empty());
        let mut item = String::from("untouched");

        assert!(!iter.next(&mut item));
        assert_eq!(item, "untouched");
        assert!(iter.err().is_none());
    }

    #[test]
    fn test_aggregate_flattens_and_skips_empty() {
        assert!(IterError::aggregate(Vec::new()).is_none());

        let single = IterError::aggregate(vec![IterError::new(anyhow::anyhow!("a"))]).unwrap();
        assert!(matches!(single, IterError::Source(_)));

        let nested = IterError::aggregate(vec![
            IterError::new(anyhow::anyhow!("a")),
            IterError::Aggregate(vec![
                IterError::new(anyhow::anyhow!("b")),
                IterError::new(anyhow::anyhow!("c")),
            ]),
        ])
        .unwrap();
        assert_eq!(nested.errors().len(), 3);
        assert_eq!(nested.to_string(), "a; b; c");
    }

    #[test]
    fn test_source_error_keeps_context_chain() {
        let err = IterError::new(anyhow::anyhow!("connection reset").context("read header"));
        assert_eq!(err.to_string(), "read header: connection reset");
    }
}
