use std::collections::{BTreeMap, HashMap};

use common::model::{Record, Timestamp};
use loki_api::{LogEntry, Stream};
use tokio_util::sync::CancellationToken;

use super::error::EngineError;
use super::label_set::LabelSet;
use super::processor::{Pipeline, Processor};
use super::querier::{Querier, QuerierCapabilities, SelectLogsParams};
use crate::iterators::{BoxIter, IterError};
use crate::query::logql::LabelMatcher;
use crate::query::logql::ast::LogExpr;

/// A log line that passed the local filter and the pipeline.
pub(crate) struct Line {
    pub ts: Timestamp,
    pub line: String,
    pub labels: LabelSet,
}

/// Reads records from a querier iterator and runs them through matchers the
/// querier could not apply and then through the pipeline.
///
/// The underlying iterator must be released with [`LogCursor::close`].
pub(crate) struct LogCursor {
    context: String,
    iter: BoxIter<Record>,
    local: Vec<LabelMatcher>,
    pipeline: Pipeline,
    allow_dots: bool,
    cancel: CancellationToken,
    record: Record,
}

/// Select logs for `expr`, pushing down the matchers `caps` allows.
pub(crate) async fn select<Q: Querier + ?Sized>(
    querier: &Q,
    caps: &QuerierCapabilities,
    cancel: &CancellationToken,
    expr: &LogExpr,
    start: Timestamp,
    end: Timestamp,
    allow_dots: bool,
) -> Result<LogCursor, EngineError> {
    let (pushed, local): (Vec<_>, Vec<_>) = expr
        .selector
        .matchers
        .iter()
        .cloned()
        .partition(|m| caps.supports(&m.label, m.op));
    log::debug!(
        "Selecting logs for {}: {} matcher(s) pushed down, {} applied locally",
        expr.selector,
        pushed.len(),
        local.len()
    );

    let context = format!("select logs {}", expr.selector);
    let params = SelectLogsParams {
        start,
        end,
        matchers: pushed,
    };
    let iter = match querier.select_logs(cancel, params).await {
        Ok(iter) => iter,
        Err(_) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
        Err(err) => return Err(EngineError::wrap(context, err)),
    };

    Ok(LogCursor {
        context,
        iter,
        local,
        pipeline: Pipeline::build(&expr.pipeline, allow_dots),
        allow_dots,
        cancel: cancel.clone(),
        record: Record::default(),
    })
}

impl LogCursor {
    pub fn next_line(&mut self) -> Result<Option<Line>, EngineError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.iter.next(&mut self.record) {
                return match self.iter.err() {
                    Some(err) => Err(EngineError::wrap(self.context.clone(), err)),
                    None => Ok(None),
                };
            }

            let mut labels = LabelSet::from_record(&self.record, self.allow_dots);
            let selected = self
                .local
                .iter()
                .all(|m| m.matches(labels.value_of(&m.label)));
            if !selected {
                continue;
            }

            let ts = self.record.timestamp;
            let body = std::mem::take(&mut self.record.body);
            if let Some(line) = self.pipeline.process(ts, body, &mut labels) {
                return Ok(Some(Line { ts, line, labels }));
            }
        }
    }

    pub fn close(mut self) -> Option<IterError> {
        let closed = self.iter.close();
        if let Err(err) = &closed {
            log::warn!("Failed to close iterator of {}: {err}", self.context);
        }
        closed.err()
    }
}

/// Combine an evaluation result with the outcome of releasing its iterators.
pub(crate) fn finish<T>(
    result: Result<T, EngineError>,
    close: Option<IterError>,
) -> Result<T, EngineError> {
    match (result, close) {
        (Ok(value), None) => Ok(value),
        (Ok(_), Some(close)) => Err(EngineError::Close(close)),
        (Err(err), close) => Err(err.with_close(close)),
    }
}

pub(crate) fn check_series_limit(count: usize, max_series: usize) -> Result<(), EngineError> {
    if max_series > 0 && count > max_series {
        return Err(EngineError::SeriesLimit { limit: max_series });
    }
    Ok(())
}

/// Group lines into streams by label set, in order of first appearance.
///
/// Stops after `limit` lines when a limit is given.
pub(crate) fn collect_streams(
    cursor: &mut LogCursor,
    limit: Option<usize>,
    max_series: usize,
) -> Result<Vec<Stream>, EngineError> {
    let mut index: HashMap<LabelSet, usize> = HashMap::new();
    let mut streams: Vec<Stream> = Vec::new();
    let mut lines = 0usize;

    while limit.is_none_or(|limit| lines < limit) {
        let Some(Line { ts, line, labels }) = cursor.next_line()? else {
            break;
        };
        let idx = match index.get(&labels) {
            Some(idx) => *idx,
            None => {
                check_series_limit(streams.len() + 1, max_series)?;
                index.insert(labels.clone(), streams.len());
                streams.push(Stream {
                    stream: labels.into_map(),
                    values: Vec::new(),
                });
                streams.len() - 1
            }
        };
        streams[idx].values.push(LogEntry {
            t: ts.as_nanos(),
            v: line,
        });
        lines += 1;
    }
    Ok(streams)
}

/// Timestamp and size in bytes of one line of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineSample {
    pub ts: Timestamp,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SeriesSamples {
    pub labels: LabelSet,
    /// Ordered by timestamp
    pub samples: Vec<LineSample>,
}

/// Drain the cursor into per-label-set line samples.
pub(crate) fn collect_samples(
    cursor: &mut LogCursor,
    max_series: usize,
) -> Result<Vec<SeriesSamples>, EngineError> {
    let mut series: BTreeMap<LabelSet, Vec<LineSample>> = BTreeMap::new();
    while let Some(Line { ts, line, labels }) = cursor.next_line()? {
        let sample = LineSample {
            ts,
            bytes: line.len(),
        };
        match series.get_mut(&labels) {
            Some(samples) => samples.push(sample),
            None => {
                check_series_limit(series.len() + 1, max_series)?;
                series.insert(labels, vec![sample]);
            }
        }
    }

    Ok(series
        .into_iter()
        .map(|(labels, mut samples)| {
            samples.sort_by_key(|s| s.ts);
            SeriesSamples { labels, samples }
        })
        .collect())
}
