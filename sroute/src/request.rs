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

//! A [`Request`] encapsulates all of the data for one in-flight query as it
//! moves through the pipeline: the parsed message, the response writer, the
//! cancellation handle, and the transport identities of both ends.

use crate::{cache::CacheKey, error::WriteError, MAX_LEN};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder, ShortBuf};
use log::warn;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// The write half of a client transport. Implementations deliver a single
/// wire-format response; stages never see the socket itself.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Deliver a response message to the client.
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()>;
}

// Placeholder used while the writer is being wrapped; never written to.
struct NullWriter;

#[async_trait]
impl ResponseWriter for NullWriter {
    async fn write_msg(&mut self, _: &Message<Bytes>) -> std::io::Result<()> {
        Ok(())
    }
}

/// A single in-flight query. Created by the [`Adapter`](crate::Adapter),
/// passed by value from stage to stage, and consumed by whichever stage
/// answers or drops it. At most one stage writes a response.
pub struct Request {
    msg: Message<Bytes>,
    writer: Box<dyn ResponseWriter>,
    token: CancellationToken,
    client: SocketAddr,
    server: SocketAddr,
    name: OnceCell<String>,
    key: OnceCell<Option<CacheKey>>,
    responded: bool,
}

impl Request {
    /// Wrap an inbound query into a pipeline value.
    pub fn new(
        msg: Message<Bytes>,
        writer: Box<dyn ResponseWriter>,
        token: CancellationToken,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Self {
        Self {
            msg,
            writer,
            token,
            client,
            server,
            name: OnceCell::new(),
            key: OnceCell::new(),
            responded: false,
        }
    }

    /// The query message.
    pub fn msg(&self) -> &Message<Bytes> {
        &self.msg
    }

    /// The cancellation handle scoped to this request.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Transport address of the client.
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Local address the query arrived on.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// The requested domain in canonical form: lowercase, no trailing dot.
    /// Empty when the message carries no question.
    pub fn name(&self) -> &str {
        self.name.get_or_init(|| {
            self.msg
                .first_question()
                .map(|q| smatcher::normalize(&q.qname().to_string()))
                .unwrap_or_default()
        })
    }

    /// The answer-cache key for this query, present only when the message
    /// carries exactly one question.
    pub fn key(&self) -> Option<&CacheKey> {
        self.key
            .get_or_init(|| CacheKey::from_message(&self.msg))
            .as_ref()
    }

    /// Whether a response has been written for this request.
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Replace the response writer with a wrapped version of itself, used by
    /// the cache to install its write-back interceptor.
    pub fn wrap_writer<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn ResponseWriter>) -> Box<dyn ResponseWriter>,
    {
        let inner = std::mem::replace(&mut self.writer, Box::new(NullWriter));
        self.writer = wrap(inner);
    }

    /// Write a response to the client, unless the request or the process has
    /// been canceled. The first response also cancels the request token so
    /// any concurrent work on this request stops.
    pub async fn respond(&mut self, msg: &Message<Bytes>) -> Result<(), WriteError> {
        if self.responded {
            warn!("duplicate response attempted for {}", self.name());
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(WriteError::Canceled),
            res = self.writer.write_msg(msg) => {
                self.responded = true;
                self.token.cancel();
                res.map_err(WriteError::from)
            }
        }
    }

    /// Send the query to the void: reply NXDOMAIN.
    pub async fn block(&mut self) -> Result<(), WriteError> {
        let reply = reply_with_rcode(&self.msg, Rcode::NXDomain)?;
        self.respond(&reply).await
    }

    /// Reply SERVFAIL, used when resolution failed on our side.
    pub async fn servfail(&mut self) -> Result<(), WriteError> {
        let reply = reply_with_rcode(&self.msg, Rcode::ServFail)?;
        self.respond(&reply).await
    }
}

/// Build an answer-free reply to `query` carrying only an rcode.
pub(crate) fn reply_with_rcode(
    query: &Message<Bytes>,
    rcode: Rcode,
) -> Result<Message<Bytes>, ShortBuf> {
    Ok(
        MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?
            .start_answer(query, rcode)?
            .into_message(),
    )
}

/// Return a copy of `msg` rewritten to carry the given message ID, so a
/// cached or exchanged response matches the query it answers.
pub(crate) fn with_id(msg: &Message<Bytes>, id: u16) -> Result<Message<Bytes>, ShortBuf> {
    let mut copy = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    copy.header_mut().set_id(id);
    Ok(Message::from_octets(copy.into_octets().freeze())?)
}

#[cfg(test)]
mod tests {
    use super::{reply_with_rcode, with_id};
    use crate::mock::{self, MockWriter};
    use domain::base::iana::Rcode;

    #[tokio::test]
    async fn block_writes_nxdomain() {
        let query = mock::query("ads.example", domain::base::Rtype::A);
        let (writer, responses) = MockWriter::new();
        let mut req = mock::request(query, Box::new(writer));

        req.block().await.unwrap();

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].header().rcode(), Rcode::NXDomain);
        assert!(req.responded());
    }

    #[tokio::test]
    async fn canceled_request_never_writes() {
        let query = mock::query("ads.example", domain::base::Rtype::A);
        let (writer, responses) = MockWriter::new();
        let mut req = mock::request(query, Box::new(writer));

        req.token().cancel();
        assert!(req.block().await.is_err());
        assert!(responses.lock().unwrap().is_empty());
    }

    #[test]
    fn rewritten_id() {
        let query = mock::query("example.com", domain::base::Rtype::A);
        let reply = reply_with_rcode(&query, Rcode::NoError).unwrap();
        let reply = with_id(&reply, 0x1234).unwrap();
        assert_eq!(reply.header().id(), 0x1234);
    }
}
