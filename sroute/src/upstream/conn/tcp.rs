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

use super::{exchange_framed, Dialer, Exchanger, Result, PROBE_QUERY};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool::managed::{self, RecycleError};
use domain::base::Message;
use socket2::{Socket, TcpKeepalive};
use std::net::SocketAddr;
use tokio::{net::TcpStream, sync::Mutex};

/// Connection initiator for plain TCP exchanges.
#[derive(Clone)]
pub struct Tcp {
    addr: SocketAddr,
}

impl Tcp {
    /// Create a TCP initiator for the given remote server address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

// Give stream sockets a short keepalive so dead upstream connections are
// noticed between queries.
pub(super) fn with_keepalive(stream: TcpStream) -> std::io::Result<TcpStream> {
    let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(3));
    let socket: Socket = stream.into_std()?.into();
    socket.set_tcp_keepalive(&keepalive)?;
    TcpStream::from_std(socket.into())
}

#[async_trait]
impl Dialer for Tcp {
    type Conn = Mutex<TcpStream>;

    async fn dial(&self) -> std::io::Result<Self::Conn> {
        let stream = TcpStream::connect(self.addr).await?;
        Ok(Mutex::new(with_keepalive(stream)?))
    }

    fn proto(&self) -> &'static str {
        "TCP"
    }
}

#[async_trait]
impl Exchanger for Mutex<TcpStream> {
    async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let mut stream = self.lock().await;
        exchange_framed(&mut *stream, msg).await
    }

    async fn reusable(&self) -> managed::RecycleResult<std::io::Error> {
        // A stream can be writable yet dead for reading; only a full
        // round-trip proves it still works.
        self.exchange(&PROBE_QUERY.clone())
            .await
            .map(|_| ())
            .map_err(|_| RecycleError::StaticMessage("test query failed"))
    }
}
