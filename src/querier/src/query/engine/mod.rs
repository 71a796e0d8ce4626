//! LogQL evaluation engine
//!
//! The engine parses a query, fetches records through a [`Querier`], runs
//! them through the line pipeline and shapes the outcome as a Loki-compatible
//! [`QueryResponseData`]:
//!
//! - log queries produce `streams`;
//! - metric queries with `start == end` produce a `scalar` or `vector`;
//! - metric queries over a range produce a `matrix` with one point per step.

use std::time::Duration;

use common::config::EngineConfig;
use common::model::Timestamp;
use loki_api::QueryResponseData;
use tokio_util::sync::CancellationToken;

use crate::query::logql::{self, Expr, LogExpr, MetricExpr, ParseOptions};

mod error;
mod eval;
mod json;
mod label_set;
mod logs;
mod processor;
mod querier;
mod regexp;

pub use error::EngineError;
pub use eval::MAX_STEPS;
pub use json::JsonExtractor;
pub use label_set::{LabelSet, sanitize_label_name};
pub use processor::{Pipeline, Processor};
pub use querier::{Querier, QuerierCapabilities, SelectLogsParams, SupportedOps};
pub use regexp::RegexpExtractor;

/// Engine settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub parse_options: ParseOptions,
    /// Maximum number of streams or series in a result (0 = unlimited)
    pub max_series: usize,
}

impl From<&EngineConfig> for Options {
    fn from(config: &EngineConfig) -> Self {
        Self {
            parse_options: ParseOptions {
                allow_dots: config.allow_dots,
            },
            max_series: config.max_series,
        }
    }
}

/// Time range and shape of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalParams {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Distance between evaluation instants of a range query
    pub step: Duration,
    /// Maximum number of log lines returned; negative means unlimited
    pub limit: i64,
}

/// Query engine over a [`Querier`]. Holds no state between evaluations.
pub struct Engine<Q> {
    querier: Q,
    opts: Options,
}

impl<Q: Querier> Engine<Q> {
    pub fn new(querier: Q, opts: Options) -> Self {
        Self { querier, opts }
    }

    pub fn querier(&self) -> &Q {
        &self.querier
    }

    /// Evaluate `query` over `params`.
    ///
    /// Cancelling `cancel` aborts evaluation; every iterator opened so far is
    /// closed before the error is returned.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn eval(
        &self,
        cancel: &CancellationToken,
        query: &str,
        params: EvalParams,
    ) -> Result<QueryResponseData, EngineError> {
        let expr = logql::parse(query, self.opts.parse_options)?;
        match expr {
            Expr::Log(log) => self.eval_logs(cancel, &log, params).await,
            Expr::Metric(metric) => self.eval_metric(cancel, &metric, params).await,
        }
    }

    async fn eval_logs(
        &self,
        cancel: &CancellationToken,
        expr: &LogExpr,
        params: EvalParams,
    ) -> Result<QueryResponseData, EngineError> {
        if params.start > params.end {
            return Err(EngineError::InvalidParams(format!(
                "end ({}) is before start ({})",
                params.end, params.start
            )));
        }
        let limit = usize::try_from(params.limit).ok();
        if limit == Some(0) {
            return Ok(QueryResponseData::Streams(Vec::new()));
        }

        let caps = self.querier.capabilities();
        let mut cursor = logs::select(
            &self.querier,
            &caps,
            cancel,
            expr,
            params.start,
            params.end,
            self.opts.parse_options.allow_dots,
        )
        .await?;

        let result = logs::collect_streams(&mut cursor, limit, self.opts.max_series);
        let close = cursor.close();
        let streams = logs::finish(result, close)?;
        log::debug!("Log query returned {} stream(s)", streams.len());
        Ok(QueryResponseData::Streams(streams))
    }

    async fn eval_metric(
        &self,
        cancel: &CancellationToken,
        expr: &MetricExpr,
        params: EvalParams,
    ) -> Result<QueryResponseData, EngineError> {
        let kind = eval::check(expr)?;
        let steps = eval::steps(params.start, params.end, params.step)?;

        let mut ranges = Vec::new();
        eval::range_aggregations(expr, &mut ranges);

        let mut fetched = Vec::with_capacity(ranges.len());
        if !ranges.is_empty() {
            // Read once, even when several selectors are involved.
            let caps = self.querier.capabilities();
            for range in &ranges {
                let mut cursor = logs::select(
                    &self.querier,
                    &caps,
                    cancel,
                    &range.expr,
                    params.start.saturating_sub(range.range),
                    params.end,
                    self.opts.parse_options.allow_dots,
                )
                .await?;
                let result = logs::collect_samples(&mut cursor, self.opts.max_series);
                let close = cursor.close();
                fetched.push(logs::finish(result, close)?);
            }
        }

        let plan = eval::Plan::build(expr, &mut fetched.into_iter());
        let instant = params.start == params.end;
        eval::evaluate(&plan, kind, &steps, instant, self.opts.max_series)
    }
}
