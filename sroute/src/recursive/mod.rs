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

//! The recursive resolver answers queries by iterative descent from the
//! root zone: resolve the parent's delegation, pick one of its name
//! servers, ask it the original question, and remember every referral and
//! glue record on the way down.

mod hints;

pub use hints::{parse as parse_hints, NAMED_ROOT};

use crate::{
    cache::CacheRecord,
    error::Category,
    pipeline::Intercept,
    request::{with_id, Request},
    upstream::conn::{self, Dialer, ExchangeError, Exchanger},
    DEFAULT_TTL, MAX_LEN,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clru::CLruCache;
use domain::{
    base::{Message, MessageBuilder, ParsedDname, Rtype, ShortBuf},
    rdata::{Aaaa, Cname, Ns, A},
};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

// Bound on the descent, covering both label recursion and CNAME chasing.
const MAX_DEPTH: usize = 16;

const NS_CACHE_SIZE: usize = 4096;
const ADDR_CACHE_SIZE: usize = 4096;

/// Error related to the recursive resolver.
#[derive(Debug, Error)]
pub enum RecursionError {
    /// A referral carried no name server we could select.
    #[error("no name server available for [{0}]")]
    NoNameServer(String),

    /// A name server was selected but no usable address was found for it.
    #[error("no usable address for name server [{0}]")]
    GlueMissing(String),

    /// A CNAME chain pointed back at itself.
    #[error("cname loop detected at [{0}]")]
    Loop(String),

    /// The descent exceeded its depth bound.
    #[error("maximum depth reached while resolving [{0}]")]
    MaxDepth(String),

    /// Neither IPv4 nor IPv6 was enabled.
    #[error("every address family is disabled")]
    NoProtocol,

    /// The root hints could not be parsed.
    #[error("malformed root hints: {0}")]
    Hints(String),

    /// A name could not be parsed into wire form.
    #[error("invalid name [{0}]")]
    Name(String),

    /// A network exchange with a name server failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// A query or answer could not be built.
    #[error(transparent)]
    Build(#[from] ShortBuf),
}

/// The recursive resolver and terminal pipeline stage.
pub struct Recursor {
    roots: Message<Bytes>,
    ns_cache: Arc<Mutex<CLruCache<String, CacheRecord<Message<Bytes>>>>>,
    addr_cache: Arc<Mutex<CLruCache<String, CacheRecord<Vec<IpAddr>>>>>,
    ipv4: bool,
    ipv6: bool,
    timeout: Duration,
    ns_port: u16,
}

impl Recursor {
    /// Create a resolver from root hints (the embedded `named.root` when
    /// `hints` is `None`), filtered to the enabled address families. At
    /// least one family must be enabled.
    pub fn new(hints: Option<&str>, ipv4: bool, ipv6: bool) -> Result<Self, RecursionError> {
        if !ipv4 && !ipv6 {
            return Err(RecursionError::NoProtocol);
        }

        Ok(Self {
            roots: hints::parse(hints.unwrap_or(NAMED_ROOT), ipv4, ipv6)?,
            ns_cache: Arc::new(Mutex::new(CLruCache::new(
                NonZeroUsize::new(NS_CACHE_SIZE).unwrap(),
            ))),
            addr_cache: Arc::new(Mutex::new(CLruCache::new(
                NonZeroUsize::new(ADDR_CACHE_SIZE).unwrap(),
            ))),
            ipv4,
            ipv6,
            timeout: Duration::from_secs(5),
            ns_port: 53,
        })
    }

    /// Override the exchange timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[doc(hidden)]
    pub fn with_ns_port(mut self, port: u16) -> Self {
        self.ns_port = port;
        self
    }

    /// The cached delegation response for a suffix, if any.
    pub fn cached_delegation(&self, suffix: &str) -> Option<Message<Bytes>> {
        let key = canonical(suffix);
        let mut cache = self.ns_cache.lock().unwrap();
        match cache.get(&key) {
            Some(r) if r.validate() => Some(r.get()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    /// The cached glue addresses for a name-server hostname, if any.
    pub fn cached_addrs(&self, host: &str) -> Option<Vec<IpAddr>> {
        let key = canonical(host);
        let mut cache = self.addr_cache.lock().unwrap();
        match cache.get(&key) {
            Some(r) if r.validate() => Some(r.get()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    /// Resolve a question by iterative descent.
    pub async fn resolve(
        &self,
        name: &str,
        qtype: Rtype,
    ) -> Result<Message<Bytes>, RecursionError> {
        self.resolve_inner(canonical(name), qtype, 0).await
    }

    fn resolve_inner(
        &self,
        name: String,
        qtype: Rtype,
        depth: usize,
    ) -> BoxFuture<'_, Result<Message<Bytes>, RecursionError>> {
        async move {
            if depth >= MAX_DEPTH {
                return Err(RecursionError::MaxDepth(name));
            }

            // The root is answered from the hints.
            if name.is_empty() {
                return Ok(self.roots.clone());
            }

            // Glue learned earlier can answer address questions outright.
            if qtype == Rtype::A || qtype == Rtype::Aaaa {
                if let Some(addrs) = self.cached_addrs(&name) {
                    let addrs: Vec<IpAddr> = addrs
                        .into_iter()
                        .filter(|ip| matches_family(qtype, ip))
                        .collect();
                    if !addrs.is_empty() {
                        return synth_addr_answer(&name, qtype, &addrs);
                    }
                }
            }

            if qtype == Rtype::Ns {
                if let Some(delegation) = self.cached_delegation(&name) {
                    debug!("delegation cache hit for {}", name);
                    return Ok(delegation);
                }
            }

            let parent = strip_first_label(&name).to_string();
            let delegation = self.resolve_inner(parent, Rtype::Ns, depth + 1).await?;

            if qtype == Rtype::Ns && delegation.header().aa() {
                return Ok(delegation);
            }

            let target = self.select_ns(&name, &delegation, depth).await?;
            let resp = self.exchange(target, &name, qtype).await?;
            self.harvest(&name, &resp);

            // An SOA with an empty answer is an authoritative NXDOMAIN and
            // goes back verbatim; a CNAME without a record of the wanted
            // type gets chased.
            if qtype != Rtype::Cname && !has_rtype(&resp, qtype) {
                if let Some(alias) = cname_target(&resp, &name) {
                    if alias == name {
                        return Err(RecursionError::Loop(name));
                    }
                    debug!("chasing cname {} -> {}", name, alias);
                    return self.resolve_inner(alias, Rtype::A, depth + 1).await;
                }
            }

            Ok(resp)
        }
        .boxed()
    }

    // Pick one name server from the delegation uniformly at random and
    // come up with an address for it: glue, the address cache, or a fresh
    // descent for the server's own name.
    async fn select_ns(
        &self,
        name: &str,
        delegation: &Message<Bytes>,
        depth: usize,
    ) -> Result<IpAddr, RecursionError> {
        let (servers, _) = delegation_servers(delegation);
        let host = servers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| RecursionError::NoNameServer(name.to_string()))?;

        if let Some((addrs, _)) = glue_records(delegation, self.ipv4, self.ipv6).get(&host) {
            if let Some(ip) = addrs.first() {
                return Ok(*ip);
            }
        }

        if let Some(addrs) = self.cached_addrs(&host) {
            if let Some(ip) = addrs.first() {
                return Ok(*ip);
            }
        }

        let qtype = if self.ipv4 { Rtype::A } else { Rtype::Aaaa };
        let resp = self.resolve_inner(host.clone(), qtype, depth + 1).await?;
        answer_addrs(&resp, self.ipv4, self.ipv6)
            .first()
            .copied()
            .ok_or(RecursionError::GlueMissing(host))
    }

    async fn exchange(
        &self,
        ip: IpAddr,
        name: &str,
        qtype: Rtype,
    ) -> Result<Message<Bytes>, RecursionError> {
        let query = build_query(name, qtype)?;
        let dialer = conn::udp::Udp::new(SocketAddr::new(ip, self.ns_port));
        let socket = dialer.dial().await.map_err(ExchangeError::from)?;
        let resp = tokio::time::timeout(self.timeout, socket.exchange(&query))
            .await
            .map_err(ExchangeError::from)??;
        Ok(resp)
    }

    // Remember what a response taught us: its authority section as the
    // delegation for `name`, expiring at the minimum referral TTL, and any
    // glue addresses keyed by their owner.
    fn harvest(&self, name: &str, resp: &Message<Bytes>) {
        let (servers, ttl) = delegation_servers(resp);
        if !servers.is_empty() {
            debug!("caching delegation for {}", name);
            self.ns_cache.lock().unwrap().put(
                canonical(name),
                CacheRecord::new(resp.clone(), Duration::from_secs(u64::from(ttl))),
            );
        }

        for (owner, (addrs, ttl)) in glue_records(resp, self.ipv4, self.ipv6) {
            self.addr_cache.lock().unwrap().put(
                owner,
                CacheRecord::new(addrs, Duration::from_secs(u64::from(ttl))),
            );
        }
    }
}

#[async_trait]
impl Intercept for Recursor {
    type In = Request;
    type Out = Request;

    /// Terminal stage: resolve and answer, SERVFAIL on resolution failure.
    async fn intercept(&self, mut req: Request) -> Option<Request> {
        let (name, qtype) = match req.msg().sole_question() {
            Ok(q) => (q.qname().to_string(), q.qtype()),
            Err(_) => return None,
        };
        let id = req.msg().header().id();

        match self.resolve(&name, qtype).await {
            Ok(resp) => match with_id(&resp, id) {
                Ok(reply) => {
                    if let Err(e) = req.respond(&reply).await {
                        warn!("[{}] failed to answer request: {}", Category::Recursive, e);
                    }
                }
                Err(e) => warn!("[{}] failed to rebuild response: {}", Category::Recursive, e),
            },
            Err(e) => {
                warn!("[{}] resolution of {} failed: {}", Category::Recursive, name, e);
                if let Err(e) = req.servfail().await {
                    warn!("[{}] failed to answer request: {}", Category::Recursive, e);
                }
            }
        }
        None
    }
}

// Lowercase, no trailing dot; the root becomes the empty string.
fn canonical(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

// The parent of a canonical name; the parent of a top-level label is the
// root (empty string).
fn strip_first_label(name: &str) -> &str {
    match name.find('.') {
        Some(i) => &name[i + 1..],
        None => "",
    }
}

fn matches_family(qtype: Rtype, ip: &IpAddr) -> bool {
    match qtype {
        Rtype::A => ip.is_ipv4(),
        Rtype::Aaaa => ip.is_ipv6(),
        _ => false,
    }
}

fn build_query(name: &str, qtype: Rtype) -> Result<Message<Bytes>, RecursionError> {
    let qname = hints::dname(name)?;
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    builder.header_mut().set_rd(false);
    let mut question = builder.question();
    question.push((&qname, qtype))?;
    Ok(question.into_message())
}

fn synth_addr_answer(
    name: &str,
    qtype: Rtype,
    addrs: &[IpAddr],
) -> Result<Message<Bytes>, RecursionError> {
    let owner = hints::dname(name)?;
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    builder.header_mut().set_qr(true);
    let mut question = builder.question();
    question.push((&owner, qtype))?;

    let mut answer = question.answer();
    for ip in addrs {
        match ip {
            IpAddr::V4(v4) => answer.push((owner.clone(), DEFAULT_TTL, A::new(*v4)))?,
            IpAddr::V6(v6) => answer.push((owner.clone(), DEFAULT_TTL, Aaaa::new(*v6)))?,
        }
    }
    Ok(answer.into_message())
}

// The NS targets in a response's authority section, with the minimum TTL
// seen across them.
fn delegation_servers(msg: &Message<Bytes>) -> (Vec<String>, u32) {
    let mut servers = Vec::new();
    let mut ttl = None;

    if let Ok(section) = msg.authority() {
        for record in section.limit_to::<Ns<ParsedDname<&Bytes>>>() {
            if let Ok(record) = record {
                servers.push(canonical(&record.data().nsdname().to_string()));
                ttl = Some(ttl.map_or(record.ttl(), |t: u32| t.min(record.ttl())));
            }
        }
    }
    (servers, ttl.unwrap_or(DEFAULT_TTL))
}

// Glue addresses in the additional section, grouped by owner, filtered by
// the enabled families. The TTL is the minimum over an owner's records.
fn glue_records(
    msg: &Message<Bytes>,
    ipv4: bool,
    ipv6: bool,
) -> BTreeMap<String, (Vec<IpAddr>, u32)> {
    let mut glue: BTreeMap<String, (Vec<IpAddr>, u32)> = BTreeMap::new();

    let mut insert = |owner: String, ip: IpAddr, ttl: u32| {
        let entry = glue.entry(owner).or_insert_with(|| (Vec::new(), ttl));
        entry.0.push(ip);
        entry.1 = entry.1.min(ttl);
    };

    if ipv4 {
        if let Ok(section) = msg.additional() {
            for record in section.limit_to::<A>() {
                if let Ok(record) = record {
                    insert(
                        canonical(&record.owner().to_string()),
                        IpAddr::V4(record.data().addr()),
                        record.ttl(),
                    );
                }
            }
        }
    }
    if ipv6 {
        if let Ok(section) = msg.additional() {
            for record in section.limit_to::<Aaaa>() {
                if let Ok(record) = record {
                    insert(
                        canonical(&record.owner().to_string()),
                        IpAddr::V6(record.data().addr()),
                        record.ttl(),
                    );
                }
            }
        }
    }
    glue
}

// Addresses of the enabled families in a response's answer section.
fn answer_addrs(msg: &Message<Bytes>, ipv4: bool, ipv6: bool) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    if ipv4 {
        if let Ok(section) = msg.answer() {
            for record in section.limit_to::<A>() {
                if let Ok(record) = record {
                    addrs.push(IpAddr::V4(record.data().addr()));
                }
            }
        }
    }
    if ipv6 {
        if let Ok(section) = msg.answer() {
            for record in section.limit_to::<Aaaa>() {
                if let Ok(record) = record {
                    addrs.push(IpAddr::V6(record.data().addr()));
                }
            }
        }
    }
    addrs
}

fn has_rtype(msg: &Message<Bytes>, qtype: Rtype) -> bool {
    msg.answer()
        .map(|section| {
            section
                .filter_map(|r| r.ok())
                .any(|r| r.rtype() == qtype)
        })
        .unwrap_or(false)
}

// The target of a CNAME in the answer section owned by `name`.
fn cname_target(msg: &Message<Bytes>, name: &str) -> Option<String> {
    let section = msg.answer().ok()?;
    for record in section.limit_to::<Cname<ParsedDname<&Bytes>>>() {
        if let Ok(record) = record {
            if canonical(&record.owner().to_string()) == name {
                return Some(canonical(&record.data().cname().to_string()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{canonical, strip_first_label, RecursionError, Recursor};
    use crate::mock;
    use domain::base::Rtype;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn canonical_names() {
        assert_eq!(canonical("WWW.Example.COM."), "www.example.com");
        assert_eq!(canonical("."), "");
    }

    #[test]
    fn parent_walk() {
        assert_eq!(strip_first_label("www.example.com"), "example.com");
        assert_eq!(strip_first_label("example.com"), "com");
        assert_eq!(strip_first_label("com"), "");
        assert_eq!(strip_first_label(""), "");
    }

    #[test]
    fn both_families_disabled() {
        match Recursor::new(None, false, false) {
            Err(RecursionError::NoProtocol) => (),
            _ => panic!("construction should have failed"),
        }
    }

    #[tokio::test]
    async fn root_question_answers_from_hints() {
        let recursor = Recursor::new(None, true, true).unwrap();
        let resp = recursor.resolve(".", Rtype::Ns).await.unwrap();
        assert!(resp.header_counts().nscount() > 0);
    }

    #[tokio::test]
    async fn harvest_populates_caches() {
        let recursor = Recursor::new(None, true, true).unwrap();
        let referral = mock::referral("example.com", "ns.test", [127, 0, 0, 1], 300);

        recursor.harvest("example.com", &referral);

        assert!(recursor.cached_delegation("example.com.").is_some());
        assert_eq!(
            recursor.cached_addrs("ns.test").unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
        );
    }

    #[tokio::test]
    async fn glue_answers_address_questions() {
        let recursor = Recursor::new(None, true, true).unwrap();
        let referral = mock::referral("example.com", "ns.test", [10, 1, 2, 3], 300);
        recursor.harvest("example.com", &referral);

        let resp = recursor.resolve("ns.test.", Rtype::A).await.unwrap();
        assert_eq!(resp.header_counts().ancount(), 1);
    }

    #[tokio::test]
    async fn descent_from_mock_root() {
        let (addr, server) = mock::zone_server([93, 184, 216, 34]).await;
        tokio::spawn(server);

        let hints = format!(
            ".            518400  NS   ns.test.\nns.test.     518400  A    {}\n",
            addr.ip(),
        );
        let recursor = Recursor::new(Some(&hints), true, false)
            .unwrap()
            .with_ns_port(addr.port())
            .with_timeout(std::time::Duration::from_secs(2));

        let resp = recursor.resolve("www.example.com.", Rtype::A).await.unwrap();
        assert!(resp.header_counts().ancount() > 0);

        // The descent walked com and example.com and remembered both.
        assert!(recursor.cached_delegation("com.").is_some());
        assert!(recursor.cached_delegation("example.com.").is_some());
    }
}
