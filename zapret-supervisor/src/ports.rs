//! Port sets as used by winws `--filter-*` and `--wf-*` flags
//!
//! A port set mixes numeric ports with shell placeholder tokens such as
//! `%GameFilter%`, which the launcher expands at run time. Numeric ports are
//! kept deduplicated and are rendered with consecutive runs collapsed into
//! inclusive `a-b` ranges; placeholders always come after the numbers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Set of ports plus named placeholder tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PortSpec {
    ports: BTreeSet<u16>,
    // Kept sorted so the rendered form does not depend on insertion order
    placeholders: BTreeSet<String>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated list like `80,443,19294-19344,%GameFilter%`
    ///
    /// Ranges expand to their members. `%NAME%` tokens are kept verbatim.
    /// Anything else that is not a valid port is dropped with a warning
    /// instead of failing the whole list.
    pub fn parse(text: &str) -> Self {
        let mut spec = Self::new();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if is_placeholder(part) {
                spec.placeholders.insert(part.to_string());
                continue;
            }
            if let Some((start, end)) = part.split_once('-') {
                match (start.trim().parse::<u16>(), end.trim().parse::<u16>()) {
                    (Ok(start), Ok(end)) if start <= end => spec.ports.extend(start..=end),
                    _ => log::warn!("Ignoring malformed port range '{}'", part),
                }
                continue;
            }
            match part.parse::<u16>() {
                Ok(port) => {
                    spec.ports.insert(port);
                }
                Err(_) => log::warn!("Ignoring malformed port '{}'", part),
            }
        }
        spec
    }

    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            placeholders: BTreeSet::new(),
        }
    }

    pub fn insert_placeholder(&mut self, token: impl Into<String>) {
        self.placeholders.insert(token.into());
    }

    /// Merge another set into this one
    pub fn extend(&mut self, other: &PortSpec) {
        self.ports.extend(other.ports.iter().copied());
        self.placeholders
            .extend(other.placeholders.iter().cloned());
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub fn contains_placeholder(&self, token: &str) -> bool {
        self.placeholders.contains(token)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().copied()
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.placeholders.is_empty()
    }

    /// Numeric members collapsed into `start-end` runs
    fn ranges(&self) -> Vec<(u16, u16)> {
        let mut ranges: Vec<(u16, u16)> = Vec::new();
        for &port in &self.ports {
            match ranges.last_mut() {
                Some((_, end)) if u32::from(*end) + 1 == u32::from(port) => *end = port,
                _ => ranges.push((port, port)),
            }
        }
        ranges
    }
}

/// `%NAME%` shaped shell variable
fn is_placeholder(token: &str) -> bool {
    token.len() > 2 && token.starts_with('%') && token.ends_with('%')
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .ranges()
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect();
        parts.extend(self.placeholders.iter().cloned());
        f.write_str(&parts.join(","))
    }
}

impl FromStr for PortSpec {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for PortSpec {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_ports_collapse() {
        assert_eq!(PortSpec::parse("19294,19295,19296").to_string(), "19294-19296");
    }

    #[test]
    fn test_non_consecutive_ports_stay_bare() {
        let mut spec = PortSpec::parse("80,443,2053");
        spec.extend(&PortSpec::parse("80,443,2053,2083"));
        assert_eq!(spec.to_string(), "80,443,2053,2083");
    }

    #[test]
    fn test_ranges_expand_and_dedup() {
        let spec = PortSpec::parse("50000-50002, 50001,443");
        assert_eq!(spec.ports().collect::<Vec<_>>(), vec![443, 50000, 50001, 50002]);
        assert_eq!(spec.to_string(), "443,50000-50002");
    }

    #[test]
    fn test_placeholders_after_numbers() {
        let spec = PortSpec::parse("%GameFilter%,443,80");
        assert_eq!(spec.to_string(), "80,443,%GameFilter%");
        assert!(spec.contains_placeholder("%GameFilter%"));
    }

    #[test]
    fn test_malformed_tokens_dropped() {
        let spec = PortSpec::parse("80,abc,90-x,70000,100-90,,443");
        assert_eq!(spec.to_string(), "80,443");
    }

    #[test]
    fn test_full_range_renders_compactly() {
        let spec = PortSpec::parse("1024-65535");
        assert_eq!(spec.to_string(), "1024-65535");
        assert!(spec.contains_port(65535));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let spec = PortSpec::parse("443,80");
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"80,443\"");

        let back: PortSpec = serde_json::from_str("\"1-3,%X%\"").unwrap();
        assert_eq!(back.to_string(), "1-3,%X%");
    }
}
