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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! A hybrid domain matcher used by sinkhole to classify query names against
//! operator-supplied filter lists. Entries come in three kinds: `direct`
//! (exact name), `wildcard` (`*suffix`), and `regex` (raw pattern source).
//! Direct entries are matched through a hash map; wildcard and regex entries
//! compile down to regular expressions evaluated concurrently, one worker per
//! pattern.
//!
//! # Getting Started
//!
//! ```no_run
//! use smatcher::{Matcher, Record, RecordKind};
//!
//! # async fn demo() {
//! let matcher = Matcher::new(vec![Record::new("*doubleclick.net", RecordKind::Wildcard)]).unwrap();
//! assert!(matcher.matches("ad.doubleclick.net").await.is_some());
//! # }
//! ```

mod hybrid;
mod record;

pub use hybrid::Matcher;
pub use record::{wildcard_regex, Record, RecordKind};

use thiserror::Error;

/// MatcherError enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum MatcherError {
    /// The wildcard marker is missing, repeated, or not the first character.
    #[error("invalid wildcard pattern [{0}]")]
    InvalidWildcard(String),

    /// A lone `*` with no domain suffix behind it.
    #[error("wildcard pattern [{0}] has no domain suffix")]
    BareWildcard(String),

    /// The pattern source failed to compile for its declared kind.
    #[error("invalid pattern [{pattern}]: {source}")]
    InvalidPattern {
        /// The offending pattern source.
        pattern: String,
        /// The underlying compilation error.
        source: regex::Error,
    },

    /// Every provided record failed to compile.
    #[error("no valid patterns provided")]
    NoPatterns,
}

pub(crate) type Result<T> = std::result::Result<T, MatcherError>;

/// Lowercase a query name and strip the trailing root dot, the canonical
/// form every list entry is matched against.
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn normalized_names() {
        assert_eq!(normalize("Ads.Example."), "ads.example");
        assert_eq!(normalize("ads.example"), "ads.example");
        assert_eq!(normalize("."), "");
    }
}
