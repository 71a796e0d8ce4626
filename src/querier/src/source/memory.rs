use async_trait::async_trait;
use common::model::{Attrs, Record, Timestamp};
use tokio_util::sync::CancellationToken;

use super::LogSource;
use crate::iterators::{BoxIter, slice};

/// Log source backed by records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    labels: Attrs,
    records: Vec<Record>,
}

impl MemorySource {
    pub fn new(labels: Attrs, mut records: Vec<Record>) -> Self {
        records.sort_by_key(|r| r.timestamp);
        Self { labels, records }
    }

    pub fn push(&mut self, record: Record) {
        let idx = self
            .records
            .partition_point(|r| r.timestamp <= record.timestamp);
        self.records.insert(idx, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LogSource for MemorySource {
    fn labels(&self) -> &Attrs {
        &self.labels
    }

    async fn open(
        &self,
        cancel: &CancellationToken,
        start: Timestamp,
        end: Timestamp,
    ) -> anyhow::Result<BoxIter<Record>> {
        if cancel.is_cancelled() {
            anyhow::bail!("open cancelled");
        }
        let records = self
            .records
            .iter()
            .filter(|r| start.is_zero() || r.timestamp >= start)
            .filter(|r| end.is_zero() || r.timestamp <= end)
            .cloned()
            .collect();
        Ok(Box::new(slice(records)))
    }
}
