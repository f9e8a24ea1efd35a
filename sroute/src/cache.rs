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

//! The answer cache: a TTL-bound LRU keyed on the wire-form question, plus
//! the pipeline stage that serves hits and installs the single-flight
//! write-back interceptor on misses.

use crate::{
    error::Category,
    pipeline::Intercept,
    request::{with_id, Request, ResponseWriter},
    DEFAULT_TTL,
};
use async_trait::async_trait;
use bytes::Bytes;
use clru::CLruCache;
use domain::base::{iana::Class, Message, Question, Rtype, ToDname};
use log::{debug, info, warn};
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// A cached value together with its creation instant and lifetime.
#[derive(Clone)]
pub struct CacheRecord<T> {
    created: Instant,
    content: T,
    ttl: Duration,
}

impl<T: Clone> CacheRecord<T> {
    /// Wrap a value with the given lifetime.
    pub fn new(content: T, ttl: Duration) -> Self {
        Self {
            created: Instant::now(),
            content,
            ttl,
        }
    }

    /// Clone the value out.
    pub fn get(&self) -> T {
        self.content.clone()
    }

    /// Whether the record is still within its lifetime.
    pub fn validate(&self) -> bool {
        Instant::now().saturating_duration_since(self.created) <= self.ttl
    }
}

/// The question identity a response is cached under:
/// `lower(qname) | qtype | qclass`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    name: String,
    rtype: Rtype,
    class: Class,
}

impl CacheKey {
    /// Build a key from a parsed question.
    pub fn new<N: ToDname>(question: &Question<N>) -> Self {
        Self {
            name: question.qname().to_string().to_lowercase(),
            rtype: question.qtype(),
            class: question.qclass(),
        }
    }

    /// Build a key from a query message. Messages without exactly one
    /// question have no cache identity.
    pub fn from_message(msg: &Message<Bytes>) -> Option<Self> {
        msg.sole_question().ok().map(|q| Self::new(&q))
    }
}

/// A LRU cache for responses, shared by value. Doubles as the cache stage
/// of the pipeline.
#[derive(Clone)]
pub struct Cache {
    cache: Arc<Mutex<CLruCache<CacheKey, CacheRecord<Message<Bytes>>>>>,
}

impl Cache {
    /// Create a cache bounded to `size` entries. The bound is the memory
    /// policy: least-recently-used entries fall out once it is reached.
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            cache: Arc::new(Mutex::new(CLruCache::new(size))),
        }
    }

    /// Fetch an unexpired response. Expired entries are evicted on the way.
    pub fn get(&self, key: &CacheKey) -> Option<Message<Bytes>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some(r) if r.validate() => Some(r.get()),
            Some(_) => {
                debug!("TTL passed for {}, evicting record", key.name);
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    /// Store a response. Its lifetime comes from the first answer record's
    /// TTL, or [`DEFAULT_TTL`] when the answer set is empty.
    pub fn put(&self, key: CacheKey, msg: Message<Bytes>) {
        let ttl = msg
            .answer()
            .ok()
            .and_then(|answer| answer.filter_map(|r| r.ok()).next())
            .map(|r| r.ttl())
            .unwrap_or(DEFAULT_TTL);

        self.cache.lock().unwrap().put(
            key,
            CacheRecord::new(msg, Duration::from_secs(u64::from(ttl))),
        );
    }
}

#[async_trait]
impl Intercept for Cache {
    type In = Request;
    type Out = Request;

    /// Serve the request from cache if possible; otherwise wrap its writer
    /// so the eventual response is cached on the way back to the client.
    /// Queries without exactly one question are refused with NXDOMAIN.
    async fn intercept(&self, mut req: Request) -> Option<Request> {
        let key = match req.key().cloned() {
            Some(key) => key,
            None => {
                if let Err(e) = req.block().await {
                    warn!("[{}] failed to refuse malformed query: {}", Category::Cache, e);
                }
                return None;
            }
        };

        if let Some(cached) = self.get(&key) {
            info!("cache hit for {}", key.name);
            match with_id(&cached, req.msg().header().id()) {
                Ok(reply) => {
                    if let Err(e) = req.respond(&reply).await {
                        warn!("[{}] failed to answer request: {}", Category::Cache, e);
                    }
                }
                Err(e) => warn!("[{}] failed to rebuild cached reply: {}", Category::Cache, e),
            }
            return None;
        }

        let cache = self.clone();
        req.wrap_writer(move |next| {
            Box::new(WriteBack {
                cache,
                key,
                cached: false,
                next,
            })
        });
        Some(req)
    }
}

// The write-back interceptor: caches the first response written for its
// request and forwards every write to the underlying writer. The `cached`
// flag is the once-only guard; a failed cache write never withholds the
// response from the client.
struct WriteBack {
    cache: Cache,
    key: CacheKey,
    cached: bool,
    next: Box<dyn ResponseWriter>,
}

#[async_trait]
impl ResponseWriter for WriteBack {
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        if !self.cached {
            self.cached = true;
            self.cache.put(self.key.clone(), msg.clone());
        }
        self.next.write_msg(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, CacheKey};
    use crate::{
        mock::{self, MockWriter},
        pipeline::Intercept,
        DEFAULT_TTL,
    };
    use domain::base::{iana::Rcode, Rtype};
    use std::num::NonZeroUsize;

    fn cache() -> Cache {
        Cache::new(NonZeroUsize::new(64).unwrap())
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache();
        let query = mock::query("example.com", Rtype::A);
        let key = CacheKey::from_message(&query).unwrap();

        // First pass: a miss that installs the write-back interceptor.
        let (writer, responses) = MockWriter::new();
        let mut req = cache
            .intercept(mock::request(query.clone(), Box::new(writer)))
            .await
            .expect("miss should forward");

        let reply = mock::answer(&query, "example.com", [93, 184, 216, 34], 5);
        req.respond(&reply).await.unwrap();
        assert_eq!(responses.lock().unwrap().len(), 1);

        // Second pass: served from cache, request consumed.
        let query2 = mock::query_with_id("example.com", Rtype::A, 0x4242);
        let (writer, responses) = MockWriter::new();
        let consumed = cache
            .intercept(mock::request(query2, Box::new(writer)))
            .await;
        assert!(consumed.is_none());

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].header().id(), 0x4242);
        assert_eq!(cache.get(&key).unwrap().header().rcode(), Rcode::NoError);
    }

    #[tokio::test]
    async fn write_back_fires_once() {
        use crate::request::ResponseWriter;

        let cache = cache();
        let query = mock::query("once.example", Rtype::A);
        let key = CacheKey::from_message(&query).unwrap();

        let (writer, responses) = MockWriter::new();
        let mut write_back = super::WriteBack {
            cache: cache.clone(),
            key: key.clone(),
            cached: false,
            next: Box::new(writer),
        };

        let first = mock::answer(&query, "once.example", [10, 0, 0, 1], 60);
        let second = mock::answer(&query, "once.example", [10, 0, 0, 2], 60);
        write_back.write_msg(&first).await.unwrap();
        // Later writes still reach the client but never re-cache.
        write_back.write_msg(&second).await.unwrap();

        assert_eq!(responses.lock().unwrap().len(), 2);
        let cached = cache.get(&key).unwrap();
        assert_eq!(cached.as_slice(), first.as_slice());
    }

    #[tokio::test]
    async fn empty_question_is_refused() {
        let cache = cache();
        let (writer, responses) = MockWriter::new();
        let req = mock::request(mock::empty_query(), Box::new(writer));

        assert!(cache.intercept(req).await.is_none());
        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].header().rcode(), Rcode::NXDomain);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = cache();
        let query = mock::query("stale.example", Rtype::A);
        let key = CacheKey::from_message(&query).unwrap();

        // TTL of zero expires immediately.
        let reply = mock::answer(&query, "stale.example", [10, 0, 0, 1], 0);
        cache.put(key.clone(), reply);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn default_ttl_for_empty_answers() {
        let query = mock::query("nothing.example", Rtype::A);
        let reply = crate::request::reply_with_rcode(&query, Rcode::NoError).unwrap();
        let cache = cache();
        let key = CacheKey::from_message(&query).unwrap();
        cache.put(key.clone(), reply);

        let guard = cache.cache.lock().unwrap();
        let record = guard.peek(&key).unwrap();
        assert_eq!(record.ttl, std::time::Duration::from_secs(u64::from(DEFAULT_TTL)));
    }
}
