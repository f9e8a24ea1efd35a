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

use super::{exchange_framed, tcp::with_keepalive, Dialer, Exchanger, Result, PROBE_QUERY};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool::managed::{self, RecycleError};
use domain::base::Message;
use rustls::{ClientConfig, RootCertStore, ServerName};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Build a TLS client configuration from the system trust store, optionally
/// extended with extra CA certificates in PEM form. TLS 1.3 only.
pub fn client_config(extra_ca: Option<&[u8]>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()? {
        roots.add(&rustls::Certificate(cert.0))?;
    }

    if let Some(pem) = extra_ca {
        for der in rustls_pemfile::certs(&mut &pem[..])? {
            roots.add(&rustls::Certificate(der))?;
        }
    }

    Ok(ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Connection initiator for TLS exchanges.
#[derive(Clone)]
pub struct Tls {
    connector: TlsConnector,
    addr: SocketAddr,
    server_name: ServerName,
}

impl Tls {
    /// Create a TLS initiator for the given remote server address. The
    /// certificate is verified against the server's IP.
    pub fn new(addr: SocketAddr, extra_ca: Option<&[u8]>) -> Result<Self> {
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config(extra_ca)?)),
            addr,
            server_name: ServerName::IpAddress(addr.ip()),
        })
    }
}

#[async_trait]
impl Dialer for Tls {
    type Conn = Mutex<TlsStream<TcpStream>>;

    async fn dial(&self) -> std::io::Result<Self::Conn> {
        let stream = with_keepalive(TcpStream::connect(self.addr).await?)?;
        Ok(Mutex::new(
            self.connector
                .connect(self.server_name.clone(), stream)
                .await?,
        ))
    }

    fn proto(&self) -> &'static str {
        "TLS"
    }
}

#[async_trait]
impl Exchanger for Mutex<TlsStream<TcpStream>> {
    async fn exchange(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let mut stream = self.lock().await;
        exchange_framed(&mut *stream, msg).await
    }

    async fn reusable(&self) -> managed::RecycleResult<std::io::Error> {
        self.exchange(&PROBE_QUERY.clone())
            .await
            .map(|_| ())
            .map_err(|_| RecycleError::StaticMessage("test query failed"))
    }
}
