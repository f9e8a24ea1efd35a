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

use super::{randomize_id, Dialer, Exchanger, Result};
use crate::MAX_LEN;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Connection initiator for UDP exchanges.
#[derive(Clone)]
pub struct Udp {
    addr: SocketAddr,
}

impl Udp {
    /// Create a UDP initiator for the given remote server address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for Udp {
    type Conn = UdpSocket;

    async fn dial(&self) -> std::io::Result<Self::Conn> {
        let socket = UdpSocket::bind(bind_addr(self.addr.is_ipv4())).await?;
        socket.connect(self.addr).await?;
        Ok(socket)
    }

    fn proto(&self) -> &'static str {
        "UDP"
    }
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

#[async_trait]
impl Exchanger for UdpSocket {
    async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let msg = randomize_id(msg)?;
        self.send(msg.as_slice()).await?;

        loop {
            let mut buf = BytesMut::with_capacity(MAX_LEN);
            buf.resize(MAX_LEN, 0);
            let len = self.recv(&mut buf).await?;
            buf.resize(len, 0);

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

    async fn reusable(&self) -> deadpool::managed::RecycleResult<std::io::Error> {
        Ok(())
    }
}
