//! Series identity.
//!
//! A [`LabelSet`] is always sorted by label name. Some remote-write receivers
//! key their series caches on the label list as transmitted, so the same
//! labels in a different order must never be produced.

use std::collections::BTreeMap;
use std::fmt;

use crate::proto;

/// Name of the label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// The full, sorted label set of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<(String, String)>,
}

impl LabelSet {
    /// Build the label set for `metric` with the given prefix and identifying labels.
    ///
    /// A `__name__` entry in `labels` is ignored; the metric name always wins.
    pub fn for_metric(prefix: &str, metric: &str, labels: &BTreeMap<String, String>) -> Self {
        let full_name = format!("{prefix}{metric}");
        let mut sorted: BTreeMap<&str, &str> = labels
            .iter()
            .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        sorted.insert(METRIC_NAME_LABEL, &full_name);

        Self {
            labels: sorted
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// Value of the named label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The prefixed metric name.
    pub fn metric_name(&self) -> &str {
        self.get(METRIC_NAME_LABEL).unwrap_or_default()
    }

    /// Iterate over `(name, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of labels, including `__name__`.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Always `false`; a label set carries at least the metric name.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// PromQL series selector matching exactly this label set.
    pub fn selector(&self) -> String {
        self.to_string()
    }

    /// Labels in remote-write form.
    pub fn to_proto(&self) -> Vec<proto::Label> {
        self.labels
            .iter()
            .map(|(name, value)| proto::Label {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=\"{}\"", name, escape_label_value(value))?;
        }
        f.write_str("}")
    }
}

/// Escape a label value for use inside a double-quoted PromQL string.
fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
