use std::collections::BTreeMap;

use common::model::Timestamp;
use regex::Regex;

use super::label_set::{LabelSet, sanitize_label_name};
use super::processor::Processor;
use crate::query::logql::ast::RegexpStage;

/// Regexp label extractor.
///
/// Every named capture group that participates in the match sets (or
/// overwrites) its label. Groups that did not match leave the label as it
/// was, and lines that do not match pass through unchanged.
pub struct RegexpExtractor {
    re: Regex,
    mapping: BTreeMap<usize, String>,
}

impl RegexpExtractor {
    pub fn new(stage: &RegexpStage, allow_dots: bool) -> Self {
        let mapping = stage
            .mapping
            .iter()
            .filter_map(|(idx, name)| Some((*idx, sanitize_label_name(name, allow_dots)?)))
            .collect();
        Self {
            re: stage.regex.clone(),
            mapping,
        }
    }
}

impl Processor for RegexpExtractor {
    fn process(&self, _ts: Timestamp, line: String, labels: &mut LabelSet) -> Option<String> {
        if let Some(caps) = self.re.captures(&line) {
            for (idx, label) in &self.mapping {
                if let Some(m) = caps.get(*idx) {
                    labels.set(label.clone(), m.as_str());
                }
            }
        }
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(pattern: &str) -> RegexpExtractor {
        let regex = Regex::new(pattern).unwrap();
        let mapping = regex
            .capture_names()
            .enumerate()
            .filter_map(|(idx, name)| name.map(|name| (idx, name.to_string())))
            .collect();
        RegexpExtractor::new(&RegexpStage { regex, mapping }, false)
    }

    #[test]
    fn test_sets_named_labels() {
        let e = extractor(r"(?P<method>[A-Z]+) (?P<path>\S+)");
        let mut labels = LabelSet::new();

        let line = e.process(Timestamp::ZERO, "GET /api/v1/query".to_string(), &mut labels);

        assert_eq!(line.as_deref(), Some("GET /api/v1/query"));
        assert_eq!(labels.get("method"), Some("GET"));
        assert_eq!(labels.get("path"), Some("/api/v1/query"));
    }

    #[test]
    fn test_non_matching_line_passes_unchanged() {
        let e = extractor(r"status=(?P<status>\d+)");
        let mut labels: LabelSet = [("status", "old")].into_iter().collect();

        let line = e.process(Timestamp::ZERO, "no status here".to_string(), &mut labels);

        assert_eq!(line.as_deref(), Some("no status here"));
        assert_eq!(labels.get("status"), Some("old"));
    }

    #[test]
    fn test_unmatched_optional_group_keeps_label() {
        let e = extractor(r"level=(?P<level>\w+)( user=(?P<user>\w+))?");
        let mut labels: LabelSet = [("level", "info"), ("user", "previous")]
            .into_iter()
            .collect();

        e.process(Timestamp::ZERO, "level=warn".to_string(), &mut labels);

        assert_eq!(labels.get("level"), Some("warn"));
        assert_eq!(labels.get("user"), Some("previous"));
    }
}
