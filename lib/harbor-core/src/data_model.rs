//! Metric records and groups.

use std::{collections::BTreeMap, fmt};

/// A metric field value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// A 64-bit floating point value.
    Float(f64),

    /// A signed 64-bit integer.
    Integer(i64),

    /// An unsigned 64-bit integer.
    UnsignedInteger(u64),

    /// A boolean.
    Boolean(bool),

    /// A string.
    String(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::UnsignedInteger(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A single structured metric record.
///
/// A metric has a name, a set of tags (string key/value pairs), at least one field, and an optional timestamp in
/// nanoseconds since the Unix epoch. Tags and fields are kept sorted by key so that encoding is deterministic.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<u64>,
}

impl Metric {
    /// Creates a new `Metric` with the given name and no tags, fields, or timestamp.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Adds a tag to the metric, replacing any existing tag with the same key.
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.insert_tag(key, value);
        self
    }

    /// Adds a field to the metric, replacing any existing field with the same key.
    pub fn with_field<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp of the metric, in nanoseconds since the Unix epoch.
    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp = Some(timestamp_ns);
        self
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the metric name.
    pub fn set_name<N: Into<String>>(&mut self, name: N) {
        self.name = name.into();
    }

    /// Returns the tags of the metric.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Inserts a tag, replacing any existing tag with the same key.
    pub fn insert_tag<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.tags.insert(key.into(), value.into());
    }

    /// Returns the fields of the metric.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Returns the timestamp of the metric, in nanoseconds since the Unix epoch, if one is set.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Sets the timestamp of the metric, in nanoseconds since the Unix epoch.
    pub fn set_timestamp(&mut self, timestamp_ns: u64) {
        self.timestamp = Some(timestamp_ns);
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.tags {
            write!(f, ",{}={}", key, value)?;
        }
        write!(f, " ({} fields)", self.fields.len())
    }
}

/// An ordered group of metrics parsed from a single message.
///
/// Cloning a group performs a deep copy, so a clone retained for redelivery is unaffected by later changes to the
/// original.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricGroup {
    metrics: Vec<Metric>,
}

impl MetricGroup {
    /// Creates a new `MetricGroup` from the given metrics.
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }

    /// Returns the number of metrics in the group.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns `true` if the group contains no metrics.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Returns an iterator over the metrics in the group.
    pub fn iter(&self) -> std::slice::Iter<'_, Metric> {
        self.metrics.iter()
    }

    /// Returns a mutable iterator over the metrics in the group.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Metric> {
        self.metrics.iter_mut()
    }

    /// Consumes the group, returning the underlying metrics.
    pub fn into_metrics(self) -> Vec<Metric> {
        self.metrics
    }
}

impl From<Vec<Metric>> for MetricGroup {
    fn from(metrics: Vec<Metric>) -> Self {
        Self::new(metrics)
    }
}

impl IntoIterator for MetricGroup {
    type Item = Metric;
    type IntoIter = std::vec::IntoIter<Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.into_iter()
    }
}

impl<'a> IntoIterator for &'a MetricGroup {
    type Item = &'a Metric;
    type IntoIter = std::slice::Iter<'a, Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent() {
        let original = MetricGroup::new(vec![Metric::new("cpu").with_tag("host", "a").with_field("usage", 0.5)]);
        let backup = original.clone();

        let mut mutated = original;
        for metric in mutated.iter_mut() {
            metric.insert_tag("host", "b");
            metric.set_name("mem");
        }

        let metric = backup.iter().next().unwrap();
        assert_eq!(metric.name(), "cpu");
        assert_eq!(metric.tags().get("host").map(String::as_str), Some("a"));
    }

    #[test]
    fn tag_replacement() {
        let metric = Metric::new("cpu").with_tag("host", "a").with_tag("host", "b");
        assert_eq!(metric.tags().len(), 1);
        assert_eq!(metric.tags()["host"], "b");
    }
}
