use std::collections::BTreeMap;

use common::model::{Attrs, Record};

/// Labels of one log line as seen by the pipeline.
///
/// Built from the record's resource, scope and line attributes (later levels
/// win on conflicting keys) and mutated by pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: &Record, allow_dots: bool) -> Self {
        let mut set = Self::new();
        set.extend_attrs(&record.resource_attrs, allow_dots);
        set.extend_attrs(&record.scope_attrs, allow_dots);
        set.extend_attrs(&record.attrs, allow_dots);
        set
    }

    fn extend_attrs(&mut self, attrs: &Attrs, allow_dots: bool) {
        for (key, value) in attrs {
            if let Some(name) = sanitize_label_name(key, allow_dots) {
                self.0.insert(name, value.clone());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value used when matching: a missing label reads as the empty string.
    pub fn value_of(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|name, _| keep(name));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Turn an attribute key into a valid label name.
///
/// Characters outside `[A-Za-z0-9_]` (plus `.` when `allow_dots` is set)
/// become `_`, and a leading digit gets a `_` prefix. Empty keys have no
/// label name.
pub fn sanitize_label_name(key: &str, allow_dots: bool) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let mut name = String::with_capacity(key.len() + 1);
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        name.push('_');
    }
    name.extend(key.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || (allow_dots && c == '.') {
            c
        } else {
            '_'
        }
    }));
    Some(name)
}
