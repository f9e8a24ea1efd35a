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

#![deny(unsafe_code)]
// Documentation
//! This is the core library for sinkhole. It implements the per-request
//! interceptor pipeline (cache, local, allow, block, upstream or recursive
//! terminal), the TTL-bound answer cache with its write-back interceptor,
//! the upstream dispatcher for UDP/TCP/TCP-TLS servers, and the iterative
//! resolver that walks the DNS hierarchy from the root hints.

pub mod adapter;
pub mod allow;
pub mod block;
pub mod cache;
pub mod error;
pub mod local;
#[doc(hidden)]
pub mod mock;
pub mod pipeline;
pub mod recursive;
pub mod request;
pub mod upstream;

pub use self::{
    adapter::Adapter,
    allow::Allow,
    block::Block,
    cache::Cache,
    error::{Category, SinkError},
    local::Local,
    pipeline::{Intercept, Pipeline, Scaler, Terminal},
    recursive::Recursor,
    request::{Request, ResponseWriter},
    upstream::{Protocol, Upstream, UpstreamAddr},
};

/// TTL applied when a record or referral carries none of its own, seconds.
pub const DEFAULT_TTL: u32 = 3600;

/// Size for wire-format message buffers, the EDNS-safe UDP payload limit.
pub const MAX_LEN: usize = 1232;
