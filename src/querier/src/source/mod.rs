//! Querier over a set of independently readable log sources.
//!
//! Each [`LogSource`] (a container, a file, a remote stream) is identified by
//! a small label set and can open an ordered stream of its records. The
//! [`MultiSourceQuerier`] picks the sources matching a selector, opens them
//! concurrently and merges their streams by timestamp.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::model::{Attrs, Record, Timestamp};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::iterators::{BoxIter, Iter, IterError, MergeIter, empty};
use crate::query::engine::{Querier, QuerierCapabilities, SelectLogsParams, SupportedOps};
use crate::query::logql::LabelMatcher;

mod memory;

pub use memory::MemorySource;

/// A single source of log records.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Labels identifying this source, e.g. `container` or `image`.
    fn labels(&self) -> &Attrs;

    /// Open the records of `[start, end]` in timestamp order. A zero bound
    /// leaves that side of the range open.
    async fn open(
        &self,
        cancel: &CancellationToken,
        start: Timestamp,
        end: Timestamp,
    ) -> anyhow::Result<BoxIter<Record>>;
}

/// Failure to open one of several sources.
///
/// Iterators already opened by other sources were closed before this error
/// was returned; failures of those closes are carried in `close`. The
/// primary failure is rendered inline rather than exposed as the source.
#[derive(Debug, thiserror::Error)]
#[error("{primary:#}{suffix}", suffix = close_suffix(.close))]
pub struct OpenError {
    pub primary: anyhow::Error,
    pub close: Option<IterError>,
}

fn close_suffix(close: &Option<IterError>) -> String {
    match close {
        Some(err) => format!(" (close opened sources: {err})"),
        None => String::new(),
    }
}

fn format_labels(labels: &Attrs) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", pairs.join(", "))
}

/// Querier that evaluates label matchers against source labels.
#[derive(Clone, Default)]
pub struct MultiSourceQuerier {
    sources: Vec<Arc<dyn LogSource>>,
}

impl MultiSourceQuerier {
    pub fn new(sources: Vec<Arc<dyn LogSource>>) -> Self {
        Self { sources }
    }

    pub fn add_source(&mut self, source: Arc<dyn LogSource>) {
        self.sources.push(source);
    }

    fn matching(&self, matchers: &[LabelMatcher]) -> Vec<Arc<dyn LogSource>> {
        self.sources
            .iter()
            .filter(|source| {
                let labels = source.labels();
                matchers.iter().all(|m| {
                    let value = labels.get(&m.label).map(String::as_str).unwrap_or_default();
                    m.matches(value)
                })
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Querier for MultiSourceQuerier {
    /// Every operator is supported on labels declared by any source. Other
    /// labels are left to the engine.
    fn capabilities(&self) -> QuerierCapabilities {
        let keys: BTreeSet<&String> = self
            .sources
            .iter()
            .flat_map(|source| source.labels().keys())
            .collect();
        QuerierCapabilities {
            any_label: SupportedOps::NONE,
            per_label: keys
                .into_iter()
                .map(|key| (key.clone(), SupportedOps::ALL))
                .collect(),
        }
    }

    async fn select_logs(
        &self,
        cancel: &CancellationToken,
        params: SelectLogsParams,
    ) -> anyhow::Result<BoxIter<Record>> {
        let selected = self.matching(&params.matchers);
        log::debug!(
            "{} of {} source(s) match the selector",
            selected.len(),
            self.sources.len()
        );

        match selected.as_slice() {
            [] => Ok(Box::new(empty())),
            [source] => {
                let iter = source
                    .open(cancel, params.start, params.end)
                    .await
                    .map_err(|e| e.context(format!("open source {}", format_labels(source.labels()))))?;
                Ok(Box::new(WithSourceLabels::new(iter, source.labels())))
            }
            _ => {
                let iters = open_all(selected, cancel, params.start, params.end).await?;
                Ok(Box::new(MergeIter::new(iters)))
            }
        }
    }
}

/// Open every source concurrently.
///
/// A failing source does not cancel its peers: all opens run to completion,
/// then every iterator that did open is closed and the first failure (in
/// source order) is returned.
async fn open_all(
    sources: Vec<Arc<dyn LogSource>>,
    cancel: &CancellationToken,
    start: Timestamp,
    end: Timestamp,
) -> Result<Vec<BoxIter<Record>>, OpenError> {
    let mut set = JoinSet::new();
    for (idx, source) in sources.iter().enumerate() {
        let source = Arc::clone(source);
        let cancel = cancel.clone();
        set.spawn(async move {
            let result = source.open(&cancel, start, end).await.map(|iter| {
                Box::new(WithSourceLabels::new(iter, source.labels())) as BoxIter<Record>
            });
            (idx, result)
        });
    }

    let mut opened: Vec<Option<BoxIter<Record>>> = Vec::new();
    opened.resize_with(sources.len(), || None);
    let mut failures: Vec<(usize, anyhow::Error)> = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, Ok(iter))) => opened[idx] = Some(iter),
            Ok((idx, Err(err))) => failures.push((idx, err)),
            Err(join_err) => failures.push((usize::MAX, anyhow::Error::new(join_err))),
        }
    }

    if failures.is_empty() {
        return Ok(opened.into_iter().flatten().collect());
    }

    let close_failures: Vec<IterError> = opened
        .into_iter()
        .flatten()
        .filter_map(|mut iter| iter.close().err())
        .collect();
    let close = IterError::aggregate(close_failures);
    if let Some(err) = &close {
        log::warn!("Failed to close opened sources after open failure: {err}");
    }

    failures.sort_by_key(|(idx, _)| *idx);
    let (idx, err) = failures.swap_remove(0);
    let primary = match sources.get(idx) {
        Some(source) => err.context(format!("open source {}", format_labels(source.labels()))),
        None => err.context("open source task"),
    };
    Err(OpenError { primary, close })
}

/// Adds the source labels to every record as resource attributes.
///
/// Source labels are authoritative: they are the values matchers were
/// pushed down against. A record attribute under the same key, at any level,
/// is moved to `<key>_extracted` so the resolved label set agrees with the
/// source selection.
struct WithSourceLabels {
    iter: BoxIter<Record>,
    labels: Attrs,
}

impl WithSourceLabels {
    fn new(iter: BoxIter<Record>, labels: &Attrs) -> Self {
        Self {
            iter,
            labels: labels.clone(),
        }
    }
}

fn displace(attrs: &mut Attrs, key: &str, source_value: &str) {
    if let Some(value) = attrs.remove(key) {
        if value != source_value {
            attrs.insert(format!("{key}_extracted"), value);
        }
    }
}

impl Iter<Record> for WithSourceLabels {
    fn next(&mut self, record: &mut Record) -> bool {
        if !self.iter.next(record) {
            return false;
        }
        for (key, value) in &self.labels {
            displace(&mut record.attrs, key, value);
            displace(&mut record.scope_attrs, key, value);
            displace(&mut record.resource_attrs, key, value);
            record.resource_attrs.insert(key.clone(), value.clone());
        }
        true
    }

    fn err(&self) -> Option<IterError> {
        self.iter.err()
    }

    fn close(&mut self) -> Result<(), IterError> {
        self.iter.close()
    }
}
