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

//! The UDP and TCP listeners. Each inbound query is parsed and handed to
//! the adapter on its own task; responses travel back through per-client
//! writers (TCP framing per RFC 7766).

use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use log::{debug, warn};
use sroute::{Adapter, ResponseWriter, MAX_LEN};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

struct UdpWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpWriter {
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        self.socket.send_to(msg.as_slice(), self.peer).await?;
        Ok(())
    }
}

/// Accept queries over UDP until the token fires.
pub async fn serve_udp(socket: Arc<UdpSocket>, adapter: Arc<Adapter>, token: CancellationToken) {
    let server = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("UDP listener has no local address: {}", e);
            return;
        }
    };

    loop {
        let mut buf = vec![0u8; MAX_LEN];
        let (len, peer) = tokio::select! {
            _ = token.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            },
        };
        buf.truncate(len);

        let msg = match Message::from_octets(Bytes::from(buf)) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping unparseable packet from {}: {}", peer, e);
                continue;
            }
        };

        let adapter = Arc::clone(&adapter);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let writer = UdpWriter { socket, peer };
            adapter.accept(msg, Box::new(writer), peer, server).await;
        });
    }
}

struct TcpWriter {
    stream: Arc<Mutex<OwnedWriteHalf>>,
}

#[async_trait]
impl ResponseWriter for TcpWriter {
    async fn write_msg(&mut self, msg: &Message<Bytes>) -> std::io::Result<()> {
        let len = u16::try_from(msg.as_slice().len())
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "response too long")
            })?
            .to_be_bytes();

        let mut stream = self.stream.lock().await;
        stream.write_all(&len).await?;
        stream.write_all(msg.as_slice()).await?;
        stream.flush().await
    }
}

/// Accept TCP connections until the token fires.
pub async fn serve_tcp(listener: TcpListener, adapter: Arc<Adapter>, token: CancellationToken) {
    let server = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("TCP listener has no local address: {}", e);
            return;
        }
    };

    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => return,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    continue;
                }
            },
        };

        let adapter = Arc::clone(&adapter);
        let token = token.clone();
        tokio::spawn(async move {
            serve_tcp_client(stream, peer, server, adapter, token).await;
        });
    }
}

// Read length-prefixed queries off one connection; in-flight responses
// share the write half.
async fn serve_tcp_client(
    stream: TcpStream,
    peer: SocketAddr,
    server: SocketAddr,
    adapter: Arc<Adapter>,
    token: CancellationToken,
) {
    let (mut read, write) = stream.into_split();
    let write = Arc::new(Mutex::new(write));

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            msg = read_framed(&mut read) => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        let writer = TcpWriter {
            stream: Arc::clone(&write),
        };
        adapter.accept(msg, Box::new(writer), peer, server).await;
    }
}

async fn read_framed(read: &mut OwnedReadHalf) -> Option<Message<Bytes>> {
    let mut len = [0u8; 2];
    read.read_exact(&mut len).await.ok()?;
    let len = usize::from(u16::from_be_bytes(len));

    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf).await.ok()?;
    Message::from_octets(Bytes::from(buf)).ok()
}
