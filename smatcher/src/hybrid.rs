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

use crate::{normalize, wildcard_regex, MatcherError, Record, RecordKind, Result};
use hashbrown::HashMap;
use log::warn;
use regex::Regex;
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// Default bound on a single `matches` call.
pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_secs(1);

struct MatchJob {
    name: Arc<str>,
    hit: oneshot::Sender<Option<Arc<Record>>>,
}

// A handle onto the worker task owning one compiled pattern. Dropping the
// handle closes the job channel and lets the worker exit.
struct PatternHandle {
    jobs: mpsc::UnboundedSender<MatchJob>,
}

impl PatternHandle {
    fn spawn(pattern: Regex, record: Arc<Record>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<MatchJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let matched = pattern.is_match(&job.name);
                // The caller may have returned already; nothing to do then.
                let _ = job.hit.send(matched.then(|| Arc::clone(&record)));
            }
        });
        Self { jobs }
    }
}

/// Classifies names against a record set: a direct map for exact entries
/// and one worker task per compiled wildcard/regex entry.
///
/// `matches` fans a name out to every pattern worker and drains the
/// completions in pattern insertion order, so the earliest-added pattern
/// wins when several overlap. Exact entries always win over patterns.
///
/// Must be created inside a tokio runtime, since construction spawns the
/// pattern workers.
pub struct Matcher {
    direct: RwLock<HashMap<String, Arc<Record>>>,
    patterns: RwLock<Vec<PatternHandle>>,
    timeout: Duration,
}

impl Matcher {
    /// Build a matcher from a record list with the default match timeout.
    ///
    /// Records whose pattern does not parse for their declared kind are
    /// logged and skipped; if nothing valid remains the construction
    /// itself fails.
    pub fn new(records: impl IntoIterator<Item = Record>) -> Result<Self> {
        Self::with_timeout(records, DEFAULT_MATCH_TIMEOUT)
    }

    /// Build a matcher with an explicit per-call timeout.
    pub fn with_timeout(
        records: impl IntoIterator<Item = Record>,
        timeout: Duration,
    ) -> Result<Self> {
        let matcher = Self {
            direct: RwLock::new(HashMap::new()),
            patterns: RwLock::new(Vec::new()),
            timeout,
        };

        let mut valid = 0;
        for record in records {
            match matcher.add(record) {
                Ok(()) => valid += 1,
                Err(e) => warn!("skipping filter record: {}", e),
            }
        }

        if valid == 0 {
            return Err(MatcherError::NoPatterns);
        }
        Ok(matcher)
    }

    /// Insert a single record. Takes the write side of the record locks, so
    /// concurrent `matches` calls observe either the old or the new set.
    pub fn add(&self, record: Record) -> Result<()> {
        match record.kind {
            RecordKind::Direct => {
                let key = normalize(&record.pattern);
                self.direct.write().unwrap().insert(key, Arc::new(record));
            }
            RecordKind::Wildcard => {
                let pattern = wildcard_regex(&record.pattern)?;
                self.patterns
                    .write()
                    .unwrap()
                    .push(PatternHandle::spawn(pattern, Arc::new(record)));
            }
            RecordKind::Regex => {
                let pattern =
                    Regex::new(&record.pattern).map_err(|source| MatcherError::InvalidPattern {
                        pattern: record.pattern.clone(),
                        source,
                    })?;
                self.patterns
                    .write()
                    .unwrap()
                    .push(PatternHandle::spawn(pattern, Arc::new(record)));
            }
        }
        Ok(())
    }

    /// Match a name against the record set, returning the highest-priority
    /// matching record if any.
    pub async fn matches(&self, name: &str) -> Option<Arc<Record>> {
        let name = normalize(name);

        if let Some(record) = self.direct.read().unwrap().get(name.as_str()) {
            return Some(Arc::clone(record));
        }

        let name: Arc<str> = name.into();
        let mut pending = Vec::new();
        {
            let patterns = self.patterns.read().unwrap();
            for handle in patterns.iter() {
                let (hit, completion) = oneshot::channel();
                if handle
                    .jobs
                    .send(MatchJob {
                        name: Arc::clone(&name),
                        hit,
                    })
                    .is_ok()
                {
                    pending.push(completion);
                }
            }
        }

        let drain = async {
            for completion in pending {
                if let Ok(Some(record)) = completion.await {
                    return Some(record);
                }
            }
            None
        };

        match tokio::time::timeout(self.timeout, drain).await {
            Ok(hit) => hit,
            Err(_) => {
                warn!("pattern match timed out for {}", name);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Matcher;
    use crate::{MatcherError, Record, RecordKind};
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[tokio::test]
    async fn direct_match() {
        let matcher = Matcher::new(vec![
            Record::new("router.lan", RecordKind::Direct).with_ip(ip(10, 0, 0, 1))
        ])
        .unwrap();

        let hit = matcher.matches("Router.LAN.").await.unwrap();
        assert_eq!(hit.ip, Some(ip(10, 0, 0, 1)));
        assert!(matcher.matches("printer.lan").await.is_none());
    }

    #[tokio::test]
    async fn wildcard_match() {
        let matcher =
            Matcher::new(vec![Record::new("*doubleclick.net", RecordKind::Wildcard)]).unwrap();

        for name in ["doubleclick.net.", "ad.doubleclick.net.", "mydoubleclick.net."] {
            assert!(matcher.matches(name).await.is_some(), "{}", name);
        }
        assert!(matcher.matches("doubleclick.org.").await.is_none());
    }

    #[tokio::test]
    async fn regex_match() {
        let matcher = Matcher::new(vec![Record::new(
            r"(\.|^)domain\.tld$",
            RecordKind::Regex,
        )])
        .unwrap();

        assert!(matcher.matches("domain.tld").await.is_some());
        assert!(matcher.matches("test2.test.domain.tld").await.is_some());
        assert!(matcher.matches("void.tld").await.is_none());
    }

    #[tokio::test]
    async fn first_pattern_wins() {
        let matcher = Matcher::new(vec![
            Record::new("*ad.example", RecordKind::Wildcard),
            Record::new(r"example$", RecordKind::Regex),
        ])
        .unwrap();

        let hit = matcher.matches("bad.example").await.unwrap();
        assert_eq!(hit.pattern, "*ad.example");
    }

    #[tokio::test]
    async fn invalid_records_are_skipped() {
        let matcher = Matcher::new(vec![
            Record::new("d*omain.tld", RecordKind::Wildcard),
            Record::new("ads.example", RecordKind::Direct),
        ])
        .unwrap();

        assert!(matcher.matches("ads.example").await.is_some());
    }

    #[tokio::test]
    async fn all_invalid_fails_construction() {
        match Matcher::new(vec![
            Record::new("*", RecordKind::Wildcard),
            Record::new("[", RecordKind::Regex),
        ]) {
            Err(MatcherError::NoPatterns) => (),
            Err(e) => panic!("not the right error type: {}", e),
            Ok(_) => panic!("construction should have failed"),
        }
    }

    #[tokio::test]
    async fn add_after_construction() {
        let matcher = Matcher::new(vec![Record::new("seed.example", RecordKind::Direct)]).unwrap();
        matcher
            .add(Record::new("*tracker.example", RecordKind::Wildcard))
            .unwrap();

        assert!(matcher.matches("cdn.tracker.example").await.is_some());
    }
}
