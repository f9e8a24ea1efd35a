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

//! End-to-end pipeline behavior: one stage answers each request, blocked
//! names never reach an upstream, and cached answers skip the exchange.

use bytes::Bytes;
use domain::base::{iana::Rcode, Message, Rtype};
use smatcher::{Matcher, Record, RecordKind};
use sroute::{
    mock::{self, MockExchanger, MockWriter},
    Adapter, Block, Cache, Local, Pipeline, Terminal, Upstream, UpstreamAddr,
};
use std::{
    net::{IpAddr, Ipv4Addr},
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

struct Harness {
    token: CancellationToken,
    adapter: Adapter,
    exchanger: Arc<MockExchanger>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn harness() -> Harness {
    let token = CancellationToken::new();

    let local = Matcher::new(vec![
        Record::new("router.lan", RecordKind::Direct).with_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    ])
    .unwrap();
    let allow = Matcher::new(vec![Record::new("good.tracker.example", RecordKind::Direct)]).unwrap();
    let block = Matcher::new(vec![
        Record::new("ads.example", RecordKind::Direct),
        Record::new("*tracker.example", RecordKind::Wildcard),
    ])
    .unwrap();

    let exchanger = Arc::new(MockExchanger::answering([93, 184, 216, 34]).with_ttl(5));
    let upstream = Upstream::with_exchanger(
        "udp://127.0.0.1:5353".parse::<UpstreamAddr>().unwrap(),
        Arc::clone(&exchanger) as _,
    );

    let pipeline = Pipeline::spawn(
        &token,
        Cache::new(NonZeroUsize::new(256).unwrap()),
        Some(Local::new(Arc::new(local))),
        Some(Arc::new(allow)),
        Some(Block::new(Arc::new(block))),
        Terminal::Upstreams(vec![upstream]),
    );

    Harness {
        adapter: Adapter::new(token.clone(), pipeline.inlet(), true),
        token,
        exchanger,
    }
}

async fn ask(harness: &Harness, name: &str, id: u16) -> Message<Bytes> {
    let (writer, responses) = MockWriter::new();
    harness
        .adapter
        .accept(
            mock::query_with_id(name, Rtype::A, id),
            Box::new(writer),
            ([127, 0, 0, 1], 53001).into(),
            ([127, 0, 0, 1], 53).into(),
        )
        .await;
    wait_for(&responses).await
}

async fn wait_for(responses: &Arc<Mutex<Vec<Message<Bytes>>>>) -> Message<Bytes> {
    for _ in 0..200 {
        if let Some(msg) = responses.lock().unwrap().first() {
            return msg.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no response arrived in time");
}

#[tokio::test]
async fn blocked_names_never_reach_upstream() {
    let harness = harness();

    let resp = ask(&harness, "ads.example", 1).await;
    assert_eq!(resp.header().rcode(), Rcode::NXDomain);
    assert_eq!(harness.exchanger.calls(), 0);
}

#[tokio::test]
async fn local_records_answer_directly() {
    let harness = harness();

    let resp = ask(&harness, "router.lan", 2).await;
    assert_eq!(resp.header().rcode(), Rcode::NoError);
    assert_eq!(resp.header_counts().ancount(), 1);
    assert_eq!(harness.exchanger.calls(), 0);
}

#[tokio::test]
async fn allowed_names_bypass_block() {
    let harness = harness();

    // Matches both the allow list and the block wildcard; allow wins by
    // running first.
    let resp = ask(&harness, "good.tracker.example", 3).await;
    assert_eq!(resp.header().rcode(), Rcode::NoError);
    assert_eq!(resp.header_counts().ancount(), 1);
    assert_eq!(harness.exchanger.calls(), 1);
}

#[tokio::test]
async fn unmatched_names_are_forwarded() {
    let harness = harness();

    let resp = ask(&harness, "example.com", 4).await;
    assert_eq!(resp.header().rcode(), Rcode::NoError);
    assert_eq!(resp.header().id(), 4);
    assert_eq!(harness.exchanger.calls(), 1);
}

#[tokio::test]
async fn second_query_is_served_from_cache() {
    let harness = harness();

    let first = ask(&harness, "example.com", 5).await;
    assert_eq!(first.header_counts().ancount(), 1);
    assert_eq!(harness.exchanger.calls(), 1);

    // Within the 5 s TTL: no further exchange happens.
    let second = ask(&harness, "example.com", 6).await;
    assert_eq!(second.header_counts().ancount(), 1);
    assert_eq!(second.header().id(), 6);
    assert_eq!(harness.exchanger.calls(), 1);
}
