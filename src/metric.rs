//! Identity of a measured quantity

use serde::{Deserialize, Serialize};
use std::fmt;

/// How an accumulator treats its extremes at an interval reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Min and max are cumulative since start and survive resets
    Sticky,
    /// Everything restarts at each interval
    #[default]
    Resetting,
}

impl MetricKind {
    pub fn is_sticky(self) -> bool {
        matches!(self, MetricKind::Sticky)
    }
}

/// Stable identity of a metric: name, domain and ordered tags
///
/// Equality and hashing are structural, tag order included, so `{a=1,b=2}` and
/// `{b=2,a=1}` name two different metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricIdentity {
    name: String,
    domain: String,
    tags: Vec<(String, String)>,
}

impl MetricIdentity {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            tags: Vec::new(),
        }
    }

    /// Append a tag, keeping insertion order
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Value of the first tag named `key`
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.name)?;
        if !self.tags.is_empty() {
            f.write_str("{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_equality() {
        let a = MetricIdentity::new("jvm", "heap").with_tag("host", "a");
        let b = MetricIdentity::new("jvm", "heap").with_tag("host", "a");
        let c = MetricIdentity::new("jvm", "heap").with_tag("host", "b");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_tag_order_matters() {
        let ab = MetricIdentity::new("d", "n").with_tag("a", "1").with_tag("b", "2");
        let ba = MetricIdentity::new("d", "n").with_tag("b", "2").with_tag("a", "1");
        assert_ne!(ab, ba);
        assert_eq!(ab.tag("b"), Some("2"));
    }

    #[test]
    fn test_display() {
        let id = MetricIdentity::new("os", "cpu").with_tag("core", "0").with_tag("mode", "user");
        assert_eq!(id.to_string(), "os:cpu{core=0,mode=user}");
        assert_eq!(MetricIdentity::new("os", "uptime").to_string(), "os:uptime");
    }
}
