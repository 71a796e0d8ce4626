//! Contract between the engine and the sources it reads logs from

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::model::{Record, Timestamp};
use tokio_util::sync::CancellationToken;

use crate::iterators::BoxIter;
use crate::query::logql::{LabelMatcher, MatcherOp};

/// Set of matcher operators a querier can evaluate itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SupportedOps(u8);

impl SupportedOps {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b1111);

    fn bit(op: MatcherOp) -> u8 {
        match op {
            MatcherOp::Equal => 1,
            MatcherOp::NotEqual => 1 << 1,
            MatcherOp::RegexMatch => 1 << 2,
            MatcherOp::RegexNotMatch => 1 << 3,
        }
    }

    pub fn with(self, op: MatcherOp) -> Self {
        Self(self.0 | Self::bit(op))
    }

    pub fn contains(self, op: MatcherOp) -> bool {
        self.0 & Self::bit(op) != 0
    }
}

impl FromIterator<MatcherOp> for SupportedOps {
    fn from_iter<T: IntoIterator<Item = MatcherOp>>(iter: T) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

/// Describes which label matchers a querier filters internally.
///
/// Matchers that are not supported are applied by the engine to every
/// record the querier returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerierCapabilities {
    /// Operators supported for any label not listed in `per_label`
    pub any_label: SupportedOps,
    pub per_label: HashMap<String, SupportedOps>,
}

impl QuerierCapabilities {
    pub fn supports(&self, label: &str, op: MatcherOp) -> bool {
        self.per_label
            .get(label)
            .copied()
            .unwrap_or(self.any_label)
            .contains(op)
    }
}

/// Parameters of a log selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectLogsParams {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Matchers the querier declared support for
    pub matchers: Vec<LabelMatcher>,
}

/// Source of log records for the engine.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Operators the querier evaluates itself. Read once per evaluation.
    fn capabilities(&self) -> QuerierCapabilities;

    /// Open an iterator over records in `[params.start, params.end]`,
    /// ordered by timestamp.
    async fn select_logs(
        &self,
        cancel: &CancellationToken,
        params: SelectLogsParams,
    ) -> anyhow::Result<BoxIter<Record>>;
}

#[async_trait]
impl<Q: Querier + ?Sized> Querier for Arc<Q> {
    fn capabilities(&self) -> QuerierCapabilities {
        (**self).capabilities()
    }

    async fn select_logs(
        &self,
        cancel: &CancellationToken,
        params: SelectLogsParams,
    ) -> anyhow::Result<BoxIter<Record>> {
        (**self).select_logs(cancel, params).await
    }
}
