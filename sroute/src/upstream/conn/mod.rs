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

//! Connection plumbing for the upstream dispatcher: the [`Exchanger`]
//! query contract, the [`Dialer`] connection initiator, and the deadpool
//! wrapper keeping stream connections warm between queries.

pub mod tcp;
pub mod tls;
pub mod udp;

use crate::MAX_LEN;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool::{
    managed::{self, BuildError, Manager, Pool, RecycleError},
    Runtime,
};
use domain::base::{Dname, Message, MessageBuilder, Rtype};
use once_cell::sync::Lazy;
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::{error::Elapsed, timeout},
};

const MAX_ERROR_TOLERANCE: u8 = 2;
const WAIT_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Connections kept per upstream.
pub const MAX_POOL_SIZE: usize = 16;

// Probe query used when testing whether a pooled stream is still usable.
static PROBE_QUERY: Lazy<Message<Bytes>> = Lazy::new(|| {
    let name = Dname::<Bytes>::from_str("example.com").unwrap();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_id(0);
    let mut builder = builder.question();
    builder.push((&name, Rtype::A)).unwrap();
    builder.into_message()
});

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Error related to upstream connections.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Error forwarded from `tokio::time`. This indicates a timeout.
    #[error(transparent)]
    TimeError(#[from] Elapsed),

    /// IO error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Run error from deadpool.
    #[error(transparent)]
    PoolRunError(#[from] managed::PoolError<std::io::Error>),

    /// Build error from deadpool.
    #[error(transparent)]
    PoolBuildError(#[from] BuildError<std::io::Error>),

    /// TLS configuration error.
    #[error(transparent)]
    TlsError(#[from] rustls::Error),

    /// The message did not fit its buffer.
    #[error(transparent)]
    ShortBuf(#[from] domain::base::ShortBuf),
}

/// Something that can exchange a DNS query for a response.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Exchange the message, returning the answer.
    async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>>;

    /// Whether the connection can serve another query.
    async fn reusable(&self) -> managed::RecycleResult<std::io::Error> {
        Ok(())
    }
}

/// A connection initiator for one transport, similar to deadpool's
/// `Manager` but without its recycling boilerplate.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// The connection handed out.
    type Conn: Exchanger;

    /// Open a fresh connection.
    async fn dial(&self) -> std::io::Result<Self::Conn>;

    /// Transport name for logging.
    fn proto(&self) -> &'static str;
}

// Adapts a Dialer into a deadpool Manager, counting consecutive errors per
// connection so a broken stream gets dropped instead of recycled.
pub(crate) struct DialWrapper<T: Dialer>(T);

#[async_trait]
impl<T: Dialer> Manager for DialWrapper<T> {
    type Type = (T::Conn, u8);
    type Error = std::io::Error;

    async fn create(&self) -> std::result::Result<Self::Type, Self::Error> {
        Ok((self.0.dial().await?, 0))
    }

    async fn recycle(&self, conn: &mut Self::Type) -> managed::RecycleResult<Self::Error> {
        conn.0.reusable().await?;
        if conn.1 >= MAX_ERROR_TOLERANCE {
            log::warn!("the number of error(s) encountered exceeded the threshold");
            Err(RecycleError::StaticMessage(
                "the number of error(s) encountered exceeded the threshold",
            ))
        } else {
            Ok(())
        }
    }
}

/// A pool of connections to one upstream, enforcing the transport-level
/// timeout on each exchange.
pub struct ConnPool<T: Dialer> {
    pool: Pool<DialWrapper<T>>,
    timeout: Duration,
}

impl<T: Dialer> ConnPool<T> {
    /// Build a pool around a dialer.
    pub fn new(
        dialer: T,
        max_pool_size: usize,
        timeout: Duration,
    ) -> std::result::Result<Self, BuildError<std::io::Error>> {
        Ok(Self {
            pool: Pool::builder(DialWrapper(dialer))
                .max_size(max_pool_size)
                .wait_timeout(WAIT_TIMEOUT)
                .runtime(Runtime::Tokio1)
                .build()?,
            timeout,
        })
    }
}

#[async_trait]
impl<T: Dialer> Exchanger for ConnPool<T> {
    async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let mut conn = self.pool.get().await?;

        match timeout(self.timeout, conn.0.exchange(msg)).await {
            // Within the timeout, query was successful
            Ok(Ok(m)) => {
                conn.1 = 0;
                Ok(m)
            }
            // Within the timeout, query was unsuccessful
            Ok(Err(e)) => {
                conn.1 += 1;
                Err(e)
            }
            // Timed out
            Err(e) => {
                conn.1 += 1;
                Err(ExchangeError::TimeError(e))
            }
        }
    }
}

// Copy a query with a fresh random ID, the form actually put on the wire.
pub(crate) fn randomize_id(msg: &Message<Bytes>) -> Result<Message<Bytes>> {
    let mut copy = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    copy.header_mut().set_random_id();
    Ok(Message::from_octets(copy.into_octets().freeze())?)
}

// Exchange a query over a stream transport with the RFC 7766 two-byte
// length prefix, skipping garbage until the matching answer arrives.
pub(crate) async fn exchange_framed<S>(stream: &mut S, msg: &Message<Bytes>) -> Result<Message<Bytes>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin + Send,
{
    let msg = randomize_id(msg)?;

    let mut payload = BytesMut::with_capacity(msg.as_slice().len() + 2);
    let len = u16::try_from(msg.as_slice().len())
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "request too long")
        })?
        .to_be_bytes();
    payload.extend_from_slice(&len);
    payload.extend_from_slice(msg.as_slice());

    stream.write_all(&payload).await?;
    stream.flush().await?;

    loop {
        let mut len = [0; 2];
        stream.read_exact(&mut len).await?;
        let len = usize::from(u16::from_be_bytes(len));

        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        stream.read_exact(&mut buf).await?;

        // We ignore garbage since there is a timer on this whole thing.
        let answer = match Message::from_octets(buf.freeze()) {
            Ok(answer) => answer,
            Err(_) => continue,
        };
        if !answer.is_answer(&msg) {
            continue;
        }
        return Ok(answer);
    }
}
