//! Metric lines in the metrics agent's line format.
//!
//! Format: `measurement[,tag=value...] field=value[,field=value...]`
//! - Measurement names escape commas and spaces.
//! - Tag keys, tag values and field keys escape commas, equals signs and spaces.
//! - Field values are always numeric; non-finite values are written as 0.

use std::fmt;

/// A single metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLine {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, f64)>,
}

impl MetricLine {
    /// Creates a line for `measurement` without tags or fields.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Adds a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Adds a field.
    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.push_field(key, value);
        self
    }

    /// Adds a field in place.
    pub fn push_field(&mut self, key: impl Into<String>, value: f64) {
        self.fields.push((key.into(), value));
    }

    /// Returns the measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Returns the value of a tag.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the fields in insertion order.
    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    /// A line without fields cannot be written.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str, special: &[char]) -> fmt::Result {
    for c in s.chars() {
        if special.contains(&c) {
            write!(f, "\\")?;
        }
        write!(f, "{}", c)?;
    }
    Ok(())
}

const MEASUREMENT_SPECIAL: &[char] = &[',', ' '];
const KEY_SPECIAL: &[char] = &[',', '=', ' '];

impl fmt::Display for MetricLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.measurement, MEASUREMENT_SPECIAL)?;
        for (key, value) in &self.tags {
            write!(f, ",")?;
            write_escaped(f, key, KEY_SPECIAL)?;
            write!(f, "=")?;
            write_escaped(f, value, KEY_SPECIAL)?;
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            write!(f, "{}", if i == 0 { " " } else { "," })?;
            write_escaped(f, key, KEY_SPECIAL)?;
            let value = if value.is_finite() { *value } else { 0.0 };
            write!(f, "={}", value)?;
        }
        Ok(())
    }
}
