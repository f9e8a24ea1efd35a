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

//! The upstream dispatcher: address parsing, per-protocol transports, and
//! the terminal pipeline stage that exchanges a request with one remote
//! resolver and writes the answer back.

mod addr;
pub mod conn;

pub use addr::{Protocol, UpstreamAddr};

use crate::{
    error::Category,
    pipeline::Intercept,
    request::{with_id, Request},
};
use async_trait::async_trait;
use conn::{ConnPool, Exchanger, MAX_POOL_SIZE};
use log::{debug, warn};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Transport-level timeout applied to each exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type Result<T> = std::result::Result<T, UpstreamError>;

/// Error related to the upstream dispatcher.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The address does not follow `[<proto>://]<host>[:<port>]`.
    #[error("invalid address [{0}]")]
    InvalidAddress(String),

    /// A transport or pool failure during an exchange.
    #[error(transparent)]
    Exchange(#[from] conn::ExchangeError),
}

/// A single upstream server behind a pooled transport. As a pipeline stage
/// it is terminal: it either answers the request or drops it.
pub struct Upstream {
    addr: UpstreamAddr,
    handle: Arc<dyn Exchanger>,
}

impl Upstream {
    /// Connect an upstream address to its transport. `extra_ca` carries
    /// optional PEM certificates for `tcp-tls` upstreams.
    pub fn new(
        addr: UpstreamAddr,
        extra_ca: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Self> {
        let handle: Arc<dyn Exchanger> = match addr.proto {
            Protocol::Udp => Arc::new(
                ConnPool::new(conn::udp::Udp::new(addr.addr), MAX_POOL_SIZE, timeout)
                    .map_err(conn::ExchangeError::from)?,
            ),
            Protocol::Tcp => Arc::new(
                ConnPool::new(conn::tcp::Tcp::new(addr.addr), MAX_POOL_SIZE, timeout)
                    .map_err(conn::ExchangeError::from)?,
            ),
            Protocol::Tls => Arc::new(
                ConnPool::new(conn::tls::Tls::new(addr.addr, extra_ca)?, MAX_POOL_SIZE, timeout)
                    .map_err(conn::ExchangeError::from)?,
            ),
        };
        Ok(Self { addr, handle })
    }

    /// Parse and connect a list of upstream addresses.
    pub fn from_addresses<'a, I>(
        addresses: I,
        extra_ca: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<Self>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        addresses
            .into_iter()
            .map(|s| Self::new(s.parse()?, extra_ca, timeout))
            .collect()
    }

    /// Wrap an existing exchanger, mainly for tests and mocks.
    pub fn with_exchanger(addr: UpstreamAddr, handle: Arc<dyn Exchanger>) -> Self {
        Self { addr, handle }
    }

    /// The parsed address of this upstream.
    pub fn addr(&self) -> UpstreamAddr {
        self.addr
    }
}

#[async_trait]
impl Intercept for Upstream {
    type In = Request;
    type Out = Request;

    /// Exchange the request's message with the upstream server and deliver
    /// the response. Failures are logged, never rethrown; there is no
    /// downstream to forward to, so the client is left to time out.
    async fn intercept(&self, mut req: Request) -> Option<Request> {
        let start = std::time::Instant::now();
        let id = req.msg().header().id();

        match self.handle.exchange(req.msg()).await {
            Ok(resp) => {
                debug!(
                    "[{}] exchange with {} completed in {:?}",
                    Category::Upstream,
                    self.addr,
                    start.elapsed(),
                );
                match with_id(&resp, id) {
                    Ok(reply) => {
                        if let Err(e) = req.respond(&reply).await {
                            warn!("[{}] failed to answer request: {}", Category::Upstream, e);
                        }
                    }
                    Err(e) => warn!("[{}] failed to rebuild response: {}", Category::Upstream, e),
                }
            }
            Err(e) => warn!(
                "[{}] exchange with {} failed: {}",
                Category::Upstream,
                self.addr,
                e,
            ),
        }
        None
    }
}
