use common::model::Timestamp;

use super::json::JsonExtractor;
use super::label_set::LabelSet;
use super::regexp::RegexpExtractor;
use crate::query::logql::ast::{LabelPredicate, LineFilter, PipelineStage};

/// A single step of log line processing.
pub trait Processor: Send + Sync {
    /// Transform `line` and `labels`. Returns `None` to drop the line.
    fn process(&self, ts: Timestamp, line: String, labels: &mut LabelSet) -> Option<String>;
}

/// Stages applied left to right; the first stage that drops a line stops
/// the chain.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn build(stages: &[PipelineStage], allow_dots: bool) -> Self {
        let stages = stages
            .iter()
            .map(|stage| -> Box<dyn Processor> {
                match stage {
                    PipelineStage::LineFilter(filter) => Box::new(LineFilterProcessor {
                        filter: filter.clone(),
                    }),
                    PipelineStage::Json => Box::new(JsonExtractor::new(allow_dots)),
                    PipelineStage::Regexp(stage) => {
                        Box::new(RegexpExtractor::new(stage, allow_dots))
                    }
                    PipelineStage::LabelFilter(predicate) => Box::new(LabelFilterProcessor {
                        predicate: predicate.clone(),
                    }),
                }
            })
            .collect();
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Processor for Pipeline {
    fn process(&self, ts: Timestamp, line: String, labels: &mut LabelSet) -> Option<String> {
        self.stages
            .iter()
            .try_fold(line, |line, stage| stage.process(ts, line, labels))
    }
}

struct LineFilterProcessor {
    filter: LineFilter,
}

impl Processor for LineFilterProcessor {
    fn process(&self, _ts: Timestamp, line: String, _labels: &mut LabelSet) -> Option<String> {
        self.filter.matches(&line).then_some(line)
    }
}

struct LabelFilterProcessor {
    predicate: LabelPredicate,
}

impl Processor for LabelFilterProcessor {
    fn process(&self, _ts: Timestamp, line: String, labels: &mut LabelSet) -> Option<String> {
        let keep = match &self.predicate {
            LabelPredicate::Matcher(matcher) => matcher.matches(labels.value_of(&matcher.label)),
            // A missing or non-numeric label never satisfies a comparison.
            LabelPredicate::Number { label, op, value } => labels
                .get(label)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .is_some_and(|v| op.apply(v, *value)),
        };
        keep.then_some(line)
    }
}
