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

//! The request adapter bridges a listener and the pipeline: it wraps each
//! inbound query into a [`Request`] with a child cancellation token and an
//! optionally metrics-wrapped writer, then pushes it onto the inlet.

use crate::request::{Request, ResponseWriter};
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use log::{debug, warn};
use std::{net::SocketAddr, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Converts raw listener deliveries into pipeline [`Request`]s.
pub struct Adapter {
    token: CancellationToken,
    inlet: mpsc::Sender<Request>,
    metrics: bool,
}

impl Adapter {
    /// Create an adapter feeding `inlet`, scoped to the process token.
    /// With `metrics` set, every writer is wrapped to log answer timing.
    pub fn new(token: CancellationToken, inlet: mpsc::Sender<Request>, metrics: bool) -> Self {
        Self {
            token,
            inlet,
            metrics,
        }
    }

    /// Wrap one inbound query and hand it to the pipeline. When the process
    /// token has fired the writer is dropped instead, closing the client
    /// connection without an answer.
    pub async fn accept(
        &self,
        msg: Message<Bytes>,
        writer: Box<dyn ResponseWriter>,
        client: SocketAddr,
        server: SocketAddr,
    ) {
        if self.token.is_cancelled() {
            return;
        }

        let writer: Box<dyn ResponseWriter> = if self.metrics {
            Box::new(MetricsWriter::new(writer, &msg))
        } else {
            writer
        };

        let request = Request::new(msg, writer, self.token.child_token(), client, server);

        tokio::select! {
            _ = self.token.cancelled() => (),
            res = self.inlet.send(request) => {
                if res.is_err() {
                    warn!("pipeline inlet closed, dropping query from {}", client);
                }
            }
        }
    }
}

// Decorates a response writer with timing: the span between adapter
// construction and the first write is logged together with the question.
struct MetricsWriter {
    start: Instant,
    name: String,
    qtype: String,
    logged: bool,
    next: Box<dyn ResponseWriter>,
}

impl MetricsWriter {
    fn new(next: Box<dyn ResponseWriter>, msg: &Message<Bytes>) -> Self {
        let (name, qtype) = msg
            .first_question()
            .map(|q| (q.qname().to_string(), q.qtype().to_string()))
            .unwrap_or_default();
        Self {
            start: Instant::now(),
            name,
            qtype,
            logged: false,
            next,
        }
    }
}

#[async_trait]
impl ResponseWriter for MetricsWriter {
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        let res = self.next.write_msg(msg).await;
        if !self.logged {
            self.logged = true;
            debug!(
                "wrote response: name={} type={} answers={} duration={:?}",
                self.name,
                self.qtype,
                msg.header_counts().ancount(),
                self.start.elapsed(),
            );
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::Adapter;
    use crate::mock::{self, MockWriter};
    use domain::base::Rtype;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn addr(port: u16) -> std::net::SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[tokio::test]
    async fn forwards_requests() {
        let token = CancellationToken::new();
        let (inlet, mut rx) = mpsc::channel(1);
        let adapter = Adapter::new(token, inlet, true);

        let (writer, _) = MockWriter::new();
        adapter
            .accept(
                mock::query("example.com", Rtype::A),
                Box::new(writer),
                addr(53000),
                addr(53),
            )
            .await;

        let req = rx.recv().await.unwrap();
        assert_eq!(req.name(), "example.com");
        assert_eq!(req.client(), addr(53000));
        assert_eq!(req.server(), addr(53));
    }

    #[tokio::test]
    async fn canceled_adapter_drops_queries() {
        let token = CancellationToken::new();
        let (inlet, mut rx) = mpsc::channel(1);
        let adapter = Adapter::new(token.clone(), inlet, false);

        token.cancel();
        let (writer, _) = MockWriter::new();
        adapter
            .accept(
                mock::query("example.com", Rtype::A),
                Box::new(writer),
                addr(53000),
                addr(53),
            )
            .await;

        assert!(rx.try_recv().is_err());
    }
}
