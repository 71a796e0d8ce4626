use common::model::Timestamp;
use serde_json::{Map, Value};

use super::label_set::{LabelSet, sanitize_label_name};
use super::processor::Processor;

/// `| json`: flattens a JSON object line into labels.
///
/// Nested keys are joined with `_`. Arrays and nulls are skipped. Lines that
/// are not JSON objects pass through untouched.
pub struct JsonExtractor {
    allow_dots: bool,
}

impl JsonExtractor {
    pub fn new(allow_dots: bool) -> Self {
        Self { allow_dots }
    }

    fn flatten(&self, prefix: &str, object: &Map<String, Value>, labels: &mut LabelSet) {
        for (key, value) in object {
            let Some(key) = sanitize_label_name(key, self.allow_dots) else {
                continue;
            };
            let name = if prefix.is_empty() {
                key
            } else {
                format!("{prefix}_{key}")
            };
            match value {
                Value::String(s) => labels.set(name, s.as_str()),
                Value::Number(n) => labels.set(name, n.to_string()),
                Value::Bool(b) => labels.set(name, b.to_string()),
                Value::Object(nested) => self.flatten(&name, nested, labels),
                Value::Array(_) | Value::Null => {}
            }
        }
    }
}

impl Processor for JsonExtractor {
    fn process(&self, _ts: Timestamp, line: String, labels: &mut LabelSet) -> Option<String> {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&line) {
            self.flatten("", &object, labels);
        }
        Some(line)
    }
}
