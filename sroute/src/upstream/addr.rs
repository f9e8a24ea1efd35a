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

//! Upstream server addresses in the canonical `[<proto>://]<host>[:<port>]`
//! form. The host must be an IP literal; hostnames are not accepted, since
//! resolving them would need the very resolver being configured.

use super::UpstreamError;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// Transport used to reach an upstream server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// Plain DNS over UDP.
    Udp,
    /// DNS over TCP (RFC 7766 framing).
    Tcp,
    /// DNS over TLS on TCP.
    Tls,
}

impl FromStr for Protocol {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "tcp-tls" => Ok(Self::Tls),
            _ => Err(UpstreamError::InvalidAddress(s.into())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tcp-tls",
        })
    }
}

/// A parsed upstream address: protocol (default udp), IP literal, and port
/// (default 53).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UpstreamAddr {
    /// Transport to use.
    pub proto: Protocol,
    /// Server socket address.
    pub addr: SocketAddr,
}

impl FromStr for UpstreamAddr {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UpstreamError::InvalidAddress(s.into());

        let (proto, rest) = match s.split_once("://") {
            Some((proto, rest)) => (proto.parse::<Protocol>().map_err(|_| invalid())?, rest),
            None => (Protocol::Udp, s),
        };

        let (host, port) = split_host_port(rest).ok_or_else(invalid)?;
        let ip: IpAddr = host.parse().map_err(|_| invalid())?;
        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(p) if p >= 1 => p,
                _ => return Err(invalid()),
            },
            None => 53,
        };

        Ok(Self {
            proto,
            addr: SocketAddr::new(ip, port),
        })
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.addr)
    }
}

// Split off an optional trailing port. A bare IPv6 literal keeps all of
// its colons; brackets are required to combine one with a port.
fn split_host_port(s: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((host, None)),
            _ => Some((host, Some(tail.strip_prefix(':')?))),
        };
    }

    if s.parse::<IpAddr>().is_ok() {
        return Some((s, None));
    }

    let (host, port) = s.rsplit_once(':')?;
    Some((host, Some(port)))
}

#[cfg(test)]
mod tests {
    use super::{Protocol, UpstreamAddr};
    use crate::upstream::UpstreamError;

    #[test]
    fn valid_addresses() {
        let tests = [
            ("1.1.1.1", Protocol::Udp, "1.1.1.1:53"),
            ("tcp://1.1.1.1", Protocol::Tcp, "1.1.1.1:53"),
            ("tcp://9.9.9.9:53", Protocol::Tcp, "9.9.9.9:53"),
            ("tcp-tls://1.1.1.1:853", Protocol::Tls, "1.1.1.1:853"),
            ("udp://1.1.1.1:5300", Protocol::Udp, "1.1.1.1:5300"),
            (
                "[2606:4700:4700::1111]",
                Protocol::Udp,
                "[2606:4700:4700::1111]:53",
            ),
            (
                "tcp-tls://[2606:4700:4700::1111]:853",
                Protocol::Tls,
                "[2606:4700:4700::1111]:853",
            ),
            ("2606:4700:4700::1111", Protocol::Udp, "[2606:4700:4700::1111]:53"),
        ];

        for (input, proto, addr) in tests {
            let parsed: UpstreamAddr = input.parse().unwrap();
            assert_eq!(parsed.proto, proto, "{}", input);
            assert_eq!(parsed.addr, addr.parse().unwrap(), "{}", input);
        }
    }

    #[test]
    fn invalid_addresses() {
        let tests = [
            "notaproto://1.1.1.1",
            "1.1.1.1:500003",
            "1.1.1.1:0",
            "9892606:4700:4700::1111",
            "dns.example.com",
            "dns.example.com:53",
            "tcp://",
            "",
        ];

        for input in tests {
            match input.parse::<UpstreamAddr>() {
                Err(UpstreamError::InvalidAddress(s)) => assert_eq!(s, input),
                Err(e) => panic!("not the right error type for {}: {}", input, e),
                Ok(a) => panic!("{} should not parse, got {}", input, a),
            }
        }
    }
}
