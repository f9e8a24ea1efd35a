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

//! This module is NOT intended to be used by regular users. It is used for
//! mocking purpose only: canned queries and answers, a capturing response
//! writer, a scripted exchanger, and tiny UDP name servers.

use crate::{
    request::{Request, ResponseWriter},
    upstream::conn::{self, Exchanger},
    MAX_LEN,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::{
    base::{iana::Rcode, Dname, Message, MessageBuilder, Rtype},
    rdata::{Ns, A},
};
use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Build a query message with a fixed ID.
pub fn query(name: &str, rtype: Rtype) -> Message<Bytes> {
    query_with_id(name, rtype, 0x2b2b)
}

/// Build a query message with the given ID.
pub fn query_with_id(name: &str, rtype: Rtype, id: u16) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(name.trim_end_matches('.')).unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(true);
    let mut question = builder.question();
    question.push((&name, rtype)).unwrap();
    question.into_message()
}

/// Build a message with no question section at all.
pub fn empty_query() -> Message<Bytes> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_id(0x2b2b);
    builder.question().into_message()
}

/// Build an A answer to `query` owned by `name`.
pub fn answer(query: &Message<Bytes>, name: &str, ip: [u8; 4], ttl: u32) -> Message<Bytes> {
    let owner = Dname::<Bytes>::from_str(name.trim_end_matches('.')).unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .unwrap()
        .start_answer(query, Rcode::NoError)
        .unwrap();
    builder
        .push((owner, ttl, A::new(Ipv4Addr::from(ip))))
        .unwrap();
    builder.into_message()
}

/// Build a referral: NS for `zone` in the authority section, glue for the
/// server in the additional section.
pub fn referral(zone: &str, ns_host: &str, glue: [u8; 4], ttl: u32) -> Message<Bytes> {
    let zone = Dname::<Bytes>::from_str(zone.trim_end_matches('.')).unwrap();
    let ns = Dname::<Bytes>::from_str(ns_host.trim_end_matches('.')).unwrap();

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_qr(true);
    let mut question = builder.question();
    question.push((&zone, Rtype::Ns)).unwrap();

    let mut authority = question.answer().authority();
    authority.push((zone, ttl, Ns::new(ns.clone()))).unwrap();

    let mut additional = authority.additional();
    additional
        .push((ns, ttl, A::new(Ipv4Addr::from(glue))))
        .unwrap();
    additional.into_message()
}

/// Wrap a message into a pipeline request with a fresh token and loopback
/// transport identities.
pub fn request(msg: Message<Bytes>, writer: Box<dyn ResponseWriter>) -> Request {
    Request::new(
        msg,
        writer,
        CancellationToken::new(),
        ([127, 0, 0, 1], 53000).into(),
        ([127, 0, 0, 1], 53).into(),
    )
}

/// A response writer that captures everything written through it.
pub struct MockWriter {
    responses: Arc<Mutex<Vec<Message<Bytes>>>>,
}

impl MockWriter {
    /// Create a writer and the handle its captures can be read through.
    #[allow(clippy::type_complexity)]
    pub fn new() -> (Self, Arc<Mutex<Vec<Message<Bytes>>>>) {
        let responses = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                responses: Arc::clone(&responses),
            },
            responses,
        )
    }
}

#[async_trait]
impl ResponseWriter for MockWriter {
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        self.responses.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// An exchanger that answers every query with a fixed A record, or fails
/// every exchange. Counts its calls.
pub struct MockExchanger {
    ip: Ipv4Addr,
    ttl: u32,
    fail: bool,
    calls: AtomicUsize,
}

impl MockExchanger {
    /// Answer every query with the given address.
    pub fn answering(ip: [u8; 4]) -> Self {
        Self {
            ip: Ipv4Addr::from(ip),
            ttl: 60,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Override the answer TTL.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Fail every exchange with a transport error.
    pub fn failing() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            ttl: 0,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many exchanges have been attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchanger for MockExchanger {
    async fn exchange(&self, msg: &Message<Bytes>) -> conn::Result<Message<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(conn::ExchangeError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock exchange failure",
            )));
        }

        let name = msg
            .sole_question()
            .map(|q| q.qname().to_string())
            .unwrap_or_default();
        Ok(answer(msg, &name, self.ip.octets(), self.ttl))
    }
}

/// Bind a UDP name server on a loopback port that answers every query with
/// a fixed A record. Returns the bound address and the serve future.
pub async fn udp_name_server(ip: [u8; 4]) -> (SocketAddr, impl Future<Output = ()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    let serve = async move {
        let mut buf = vec![0u8; MAX_LEN];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let query = match Message::from_octets(Bytes::copy_from_slice(&buf[..len])) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let name = match query.sole_question() {
                Ok(q) => q.qname().to_string(),
                Err(_) => continue,
            };
            let reply = answer(&query, &name, ip, 60);
            let _ = socket.send_to(reply.as_slice(), peer).await;
        }
    };
    (addr, serve)
}

/// Bind a UDP zone server on a loopback port: NS questions get a referral
/// delegating the zone to the server itself, anything else gets an
/// authoritative A answer. Enough to walk a descent against.
pub async fn zone_server(ip: [u8; 4]) -> (SocketAddr, impl Future<Output = ()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    let serve = async move {
        let mut buf = vec![0u8; MAX_LEN];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let query = match Message::from_octets(Bytes::copy_from_slice(&buf[..len])) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let (name, qtype) = match query.sole_question() {
                Ok(q) => (q.qname().to_string(), q.qtype()),
                Err(_) => continue,
            };

            let reply = if qtype == Rtype::Ns {
                referral_to(&query, &name, "ns.test")
            } else {
                let mut authoritative = answer(&query, &name, ip, 60);
                set_aa(&mut authoritative);
                authoritative.as_slice().to_vec()
            };
            let _ = socket.send_to(&reply, peer).await;
        }
    };
    (addr, serve)
}

// A referral reply to `query` delegating `zone` to `ns_host` with glue
// pointing back at the loopback server.
fn referral_to(query: &Message<Bytes>, zone: &str, ns_host: &str) -> Vec<u8> {
    let zone = Dname::<Bytes>::from_str(zone.trim_end_matches('.')).unwrap();
    let ns = Dname::<Bytes>::from_str(ns_host).unwrap();

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .unwrap()
        .start_answer(query, Rcode::NoError)
        .unwrap();

    let mut authority = builder.authority();
    authority.push((zone, 300u32, Ns::new(ns.clone()))).unwrap();

    let mut additional = authority.additional();
    additional
        .push((ns, 300u32, A::new(Ipv4Addr::LOCALHOST)))
        .unwrap();
    additional.into_message().as_slice().to_vec()
}

fn set_aa(msg: &mut Message<Bytes>) {
    let mut copy = Message::from_octets(BytesMut::from(msg.as_slice())).unwrap();
    copy.header_mut().set_aa(true);
    *msg = Message::from_octets(copy.into_octets().freeze()).unwrap();
}
