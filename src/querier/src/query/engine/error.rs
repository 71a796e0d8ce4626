use crate::iterators::IterError;
use crate::query::logql::ParseError;

/// Errors returned by [`Engine::eval`](super::Engine::eval)
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("syntax error: {0}")]
    Syntax(#[from] ParseError),
    #[error("semantic error: {0}")]
    Semantic(String),
    /// A query source failed; `context` names the failing sub-query.
    #[error("{context}: {error:#}")]
    Source {
        context: String,
        #[source]
        error: anyhow::Error,
    },
    #[error("query cancelled")]
    Cancelled,
    #[error("invalid query parameters: {0}")]
    InvalidParams(String),
    #[error("query returned more than {limit} series")]
    SeriesLimit { limit: usize },
    /// Releasing iterators failed after an otherwise successful evaluation.
    #[error("close iterators: {0}")]
    Close(IterError),
    /// Evaluation failed and releasing iterators failed too.
    #[error("{error} (close iterators: {close})")]
    CloseAfter {
        #[source]
        error: Box<EngineError>,
        close: IterError,
    },
}

impl EngineError {
    pub fn semantic(msg: impl Into<String>) -> Self {
        Self::Semantic(msg.into())
    }

    /// Wrap a source failure with the operation it occurred in.
    pub fn wrap(context: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Self::Source {
            context: context.into(),
            error: error.into(),
        }
    }

    /// Whether re-running the same query can not succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Syntax(_)
            | Self::Semantic(_)
            | Self::InvalidParams(_)
            | Self::SeriesLimit { .. } => true,
            Self::Source { .. } | Self::Cancelled | Self::Close(_) => false,
            Self::CloseAfter { error, .. } => error.is_permanent(),
        }
    }

    /// Attach a close failure, keeping `self` as the primary error.
    pub(crate) fn with_close(self, close: Option<IterError>) -> Self {
        match close {
            Some(close) => Self::CloseAfter {
                error: Box::new(self),
                close,
            },
            None => self,
        }
    }
}
