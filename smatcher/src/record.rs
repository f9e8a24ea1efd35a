// Copyright 2024 The sinkhole contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::{MatcherError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// The kind of a filter entry, deciding how its pattern is interpreted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// An exact domain literal.
    #[default]
    Direct,
    /// A `*suffix` expression matching every name ending in the suffix.
    Wildcard,
    /// A raw regular expression source.
    Regex,
}

/// A single filter entry as loaded from a hosts file, a regex list, or a
/// JSON record. Records are immutable once handed to a matcher; removing
/// one means rebuilding the matcher.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Record {
    /// Domain literal, wildcard expression, or regex source.
    #[serde(rename = "domain")]
    pub pattern: String,

    /// How to interpret `pattern`.
    #[serde(rename = "type", default)]
    pub kind: RecordKind,

    /// Address to answer with; only meaningful for local entries.
    #[serde(default)]
    pub ip: Option<IpAddr>,

    /// Free-form list category, e.g. "ads".
    #[serde(default)]
    pub category: Option<String>,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Provenance of the entry (file path or URL).
    #[serde(default)]
    pub source: Option<String>,

    /// Trailing comment from the source line.
    #[serde(default)]
    pub comment: Option<String>,
}

impl Record {
    /// Create a bare record with a pattern and kind.
    pub fn new(pattern: impl Into<String>, kind: RecordKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
            ip: None,
            category: None,
            tags: Vec::new(),
            source: None,
            comment: None,
        }
    }

    /// Attach an answer address, used by local entries.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Translate a wildcard expression into its equivalent anchored regex.
///
/// The expression must contain exactly one `*` and it must be the first
/// character; the remainder is escaped literally and anchored with `$`, so
/// `*domain.tld` becomes `domain\.tld$` and matches any name ending in
/// `domain.tld`.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let suffix = match pattern.strip_prefix('*') {
        Some(s) if !s.contains('*') => s,
        _ => return Err(MatcherError::InvalidWildcard(pattern.into())),
    };

    if suffix.is_empty() {
        return Err(MatcherError::BareWildcard(pattern.into()));
    }

    Regex::new(&format!("{}$", regex::escape(suffix))).map_err(|source| {
        MatcherError::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{wildcard_regex, Record, RecordKind};
    use crate::MatcherError;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn wildcard_translation() {
        let tests = [
            ("*domain.tld", r"domain\.tld$", "test.domain.tld", true),
            (r"*.domain.tld", r"\.domain\.tld$", "test.domain.tld", true),
            ("*domain.tld", r"domain\.tld$", "anytextheredomain.tld", true),
            ("*.tld", r"\.tld$", "test.tld", true),
            ("*doubleclick.net", r"doubleclick\.net$", "doubleclick.org", false),
        ];

        for (wildcard, expected, input, matched) in tests {
            let r = wildcard_regex(wildcard).unwrap();
            assert_eq!(r.as_str(), expected);
            assert_eq!(r.is_match(input), matched, "{} vs {}", wildcard, input);
        }
    }

    #[test]
    fn wildcard_not_leading() {
        match wildcard_regex("d*domain.tld").unwrap_err() {
            MatcherError::InvalidWildcard(p) => assert_eq!(p, "d*domain.tld"),
            e => panic!("not the right error type: {}", e),
        }
    }

    #[test]
    fn wildcard_without_suffix() {
        match wildcard_regex("*").unwrap_err() {
            MatcherError::BareWildcard(_) => (),
            e => panic!("not the right error type: {}", e),
        }
    }

    #[test]
    fn record_from_json() {
        let record: Record = serde_json::from_str(
            r#"{
                "domain": "router.lan",
                "type": "direct",
                "ip": "10.0.0.1",
                "category": "infra",
                "tags": ["lan"],
                "source": "local.json"
            }"#,
        )
        .unwrap();

        assert_eq!(record.pattern, "router.lan");
        assert_eq!(record.kind, RecordKind::Direct);
        assert_eq!(record.ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(record.tags, vec!["lan".to_string()]);
        assert_eq!(record.comment, None);
    }
}
