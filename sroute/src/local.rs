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

//! The local resolver answers A/AAAA queries from operator-configured
//! records. It does not handle blocked or allowed names and it does not
//! cache upstream answers; it is strictly for local records.

use crate::{error::Category, pipeline::Intercept, request::Request, DEFAULT_TTL, MAX_LEN};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::{
    base::{iana::Rcode, Dname, Message, MessageBuilder, Rtype, ShortBuf, ToDname},
    rdata::{Aaaa, A},
};
use log::{debug, warn};
use smatcher::Matcher;
use std::{net::IpAddr, sync::Arc};

/// The local-records stage. On a match with a usable address it answers
/// and ends the pipeline; anything else forwards.
pub struct Local {
    matcher: Arc<Matcher>,
}

impl Local {
    /// Create the stage around a matcher over the local record set.
    pub fn new(matcher: Arc<Matcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl Intercept for Local {
    type In = Request;
    type Out = Request;

    async fn intercept(&self, mut req: Request) -> Option<Request> {
        let (owner, qtype) = match req.msg().sole_question() {
            Ok(q) => (q.qname().to_bytes(), q.qtype()),
            Err(_) => return Some(req),
        };

        // Only address queries can be answered locally.
        if qtype != Rtype::A && qtype != Rtype::Aaaa {
            return Some(req);
        }

        let record = match self.matcher.matches(req.name()).await {
            Some(record) => record,
            None => return Some(req),
        };

        // The record must carry an address of the requested family.
        let ip = match (qtype, record.ip) {
            (Rtype::A, Some(ip @ IpAddr::V4(_))) => ip,
            (Rtype::Aaaa, Some(ip @ IpAddr::V6(_))) => ip,
            _ => return Some(req),
        };

        match local_answer(req.msg(), owner, ip) {
            Ok(reply) => {
                if let Err(e) = req.respond(&reply).await {
                    warn!("[{}] failed to answer request: {}", Category::Local, e);
                }
                debug!(
                    "[{}] answered {} {} from record {}",
                    Category::Local,
                    req.name(),
                    qtype,
                    record.pattern,
                );
            }
            Err(e) => warn!("[{}] failed to build answer: {}", Category::Local, e),
        }
        None
    }
}

// Synthesize an address answer to `query`: question name copied, class IN,
// DEFAULT_TTL.
fn local_answer(
    query: &Message<Bytes>,
    owner: Dname<Bytes>,
    ip: IpAddr,
) -> Result<Message<Bytes>, ShortBuf> {
    let mut answer = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?
        .start_answer(query, Rcode::NoError)?;
    match ip {
        IpAddr::V4(v4) => answer.push((owner, DEFAULT_TTL, A::new(v4)))?,
        IpAddr::V6(v6) => answer.push((owner, DEFAULT_TTL, Aaaa::new(v6)))?,
    }
    Ok(answer.into_message())
}

#[cfg(test)]
mod tests {
    use super::Local;
    use crate::{
        mock::{self, MockWriter},
        pipeline::Intercept,
        DEFAULT_TTL,
    };
    use domain::{base::Rtype, rdata::A};
    use smatcher::{Matcher, Record, RecordKind};
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
    };

    fn stage() -> Local {
        let matcher = Matcher::new(vec![Record::new("router.lan", RecordKind::Direct)
            .with_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))])
        .unwrap();
        Local::new(Arc::new(matcher))
    }

    #[tokio::test]
    async fn answers_matching_a_query() {
        let (writer, responses) = MockWriter::new();
        let req = mock::request(mock::query("router.lan", Rtype::A), Box::new(writer));

        assert!(stage().intercept(req).await.is_none());

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        let answer = responses[0].answer().unwrap();
        let record = answer
            .limit_to::<A>()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(record.data().addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(record.ttl(), DEFAULT_TTL);
        assert_eq!(record.owner().to_string(), "router.lan");
    }

    #[tokio::test]
    async fn forwards_on_miss() {
        let (writer, responses) = MockWriter::new();
        let req = mock::request(mock::query("mismatch.tld", Rtype::A), Box::new(writer));

        assert!(stage().intercept(req).await.is_some());
        assert!(responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forwards_other_qtypes() {
        let (writer, _) = MockWriter::new();
        let req = mock::request(mock::query("router.lan", Rtype::Mx), Box::new(writer));
        assert!(stage().intercept(req).await.is_some());
    }

    #[tokio::test]
    async fn forwards_family_mismatch() {
        let (writer, _) = MockWriter::new();
        let req = mock::request(mock::query("router.lan", Rtype::Aaaa), Box::new(writer));
        assert!(stage().intercept(req).await.is_some());
    }
}
