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

//! Root hints: the bootstrap set of root-server names and addresses,
//! parsed from a `named.root` zone file into the synthetic delegation
//! response that terminates the recursive descent.

use super::RecursionError;
use crate::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::{
    base::{Dname, Message, MessageBuilder, Rtype},
    rdata::{Aaaa, Ns, A},
};
use std::str::FromStr;

/// The well-known root zone hints, embedded so the resolver can bootstrap
/// without any external file.
pub const NAMED_ROOT: &str = include_str!("../../data/named.root");

pub(super) fn dname(name: &str) -> Result<Dname<Bytes>, RecursionError> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(Dname::root_bytes());
    }
    Dname::from_str(trimmed).map_err(|_| RecursionError::Name(name.into()))
}

/// Parse a `named.root` zone text into a delegation response: NS records in
/// the authority section, glue addresses of the enabled families in the
/// additional section.
pub fn parse(text: &str, ipv4: bool, ipv6: bool) -> Result<Message<Bytes>, RecursionError> {
    let mut servers = Vec::new();
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for line in text.lines() {
        let line = match line.find(';') {
            Some(i) => &line[..i],
            None => line,
        };
        let mut cols = line.split_whitespace();
        let (owner, ttl) = match (cols.next(), cols.next()) {
            (Some(owner), Some(ttl)) => (owner, ttl),
            _ => continue,
        };
        let ttl: u32 = ttl
            .parse()
            .map_err(|_| RecursionError::Hints(format!("bad ttl in line [{}]", line.trim())))?;

        // An optional class column sits between the TTL and the type.
        let rtype = match cols.next() {
            Some("IN") => cols.next(),
            other => other,
        };
        let rdata = cols.next();

        match (rtype, rdata) {
            (Some("NS"), Some(target)) => servers.push((dname(owner)?, ttl, dname(target)?)),
            (Some("A"), Some(addr)) if ipv4 => {
                let addr = addr
                    .parse()
                    .map_err(|_| RecursionError::Hints(format!("bad A address [{}]", addr)))?;
                v4.push((dname(owner)?, ttl, A::new(addr)));
            }
            (Some("AAAA"), Some(addr)) if ipv6 => {
                let addr = addr
                    .parse()
                    .map_err(|_| RecursionError::Hints(format!("bad AAAA address [{}]", addr)))?;
                v6.push((dname(owner)?, ttl, Aaaa::new(addr)));
            }
            _ => continue,
        }
    }

    if servers.is_empty() {
        return Err(RecursionError::Hints("no NS records".into()));
    }
    if v4.is_empty() && v6.is_empty() {
        return Err(RecursionError::Hints("no glue addresses".into()));
    }

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    builder.header_mut().set_qr(true);
    let mut question = builder.question();
    question.push((Dname::root_bytes(), Rtype::Ns))?;

    let mut authority = question.answer().authority();
    for (owner, ttl, ns) in servers {
        authority.push((owner, ttl, Ns::new(ns)))?;
    }

    let mut additional = authority.additional();
    for (owner, ttl, a) in v4 {
        additional.push((owner, ttl, a))?;
    }
    for (owner, ttl, aaaa) in v6 {
        additional.push((owner, ttl, aaaa))?;
    }

    Ok(additional.into_message())
}
