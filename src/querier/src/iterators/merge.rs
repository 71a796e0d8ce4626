use std::cmp::Ordering;
use std::collections::BinaryHeap;

use common::model::Record;

use super::{BoxIter, Iter, IterError};

/// Head record of one source, ordered so that `BinaryHeap` pops the
/// smallest timestamp first.
struct HeapElem {
    source: usize,
    record: Record,
}

impl PartialEq for HeapElem {
    fn eq(&self, other: &Self) -> bool {
        self.record.timestamp == other.record.timestamp
    }
}

impl Eq for HeapElem {}

impl PartialOrd for HeapElem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapElem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.record.timestamp.cmp(&self.record.timestamp)
    }
}

/// Merges several timestamp-ordered iterators into one ordered iterator.
///
/// The heap holds at most one head record per live source and is filled
/// lazily on the first `next` call. Records with equal timestamps from
/// different sources come out in no particular order.
///
/// A failed pull from any source ends the merge for good, even if other
/// sources still have data: once one source is broken the combined order can
/// no longer be trusted.
pub struct MergeIter<I = BoxIter<Record>> {
    iters: Vec<I>,
    heap: BinaryHeap<HeapElem>,
    initialized: bool,
    failed: bool,
    closed: bool,
}

impl<I: Iter<Record>> MergeIter<I> {
    pub fn new(iters: Vec<I>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(iters.len()),
            iters,
            initialized: false,
            failed: false,
            closed: false,
        }
    }

    fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        for (source, iter) in self.iters.iter_mut().enumerate() {
            let mut record = Record::default();
            if iter.next(&mut record) {
                self.heap.push(HeapElem { source, record });
            } else if iter.err().is_some() {
                self.failed = true;
            }
        }
        if self.failed {
            self.heap.clear();
        }
    }
}

impl<I: Iter<Record>> Iter<Record> for MergeIter<I> {
    fn next(&mut self, record: &mut Record) -> bool {
        self.init();
        if self.failed {
            return false;
        }

        let Some(mut head) = self.heap.pop() else {
            return false;
        };
        std::mem::swap(record, &mut head.record);

        // Refill the heap from the source we just took the minimum from.
        let iter = &mut self.iters[head.source];
        if iter.next(&mut head.record) {
            self.heap.push(head);
            true
        } else if iter.err().is_some() {
            self.failed = true;
            self.heap.clear();
            false
        } else {
            true
        }
    }

    fn err(&self) -> Option<IterError> {
        IterError::aggregate(self.iters.iter().filter_map(|iter| iter.err()))
    }

    fn close(&mut self) -> Result<(), IterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.heap.clear();

        let failures: Vec<IterError> = self
            .iters
            .iter_mut()
            .filter_map(|iter| iter.close().err())
            .collect();
        match IterError::aggregate(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
