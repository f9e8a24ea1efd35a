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

//! This module provides the universal error type used in the library. The
//! error types use `thiserror`.

pub use crate::{recursive::RecursionError, upstream::UpstreamError};

use std::fmt;
use thiserror::Error;

/// SinkError enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Error from matcher construction.
    #[error(transparent)]
    Matcher(#[from] smatcher::MatcherError),

    /// Error related to upstream servers.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Error related to the recursive resolver.
    #[error(transparent)]
    Recursion(#[from] RecursionError),

    /// Error while writing a response back to a client.
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Failure to deliver a response to the client.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The reply message could not be built.
    #[error("failed to build response: {0}")]
    Build(#[from] domain::base::ShortBuf),

    /// The underlying transport write failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The request was canceled before the write completed.
    #[error("request canceled")]
    Canceled,
}

/// The pipeline stage a failure is attributed to, attached to every log
/// line so failures can be routed in observability.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    /// The local record resolver.
    Local,
    /// The allow-list bypass.
    Allow,
    /// The block-list sink.
    Block,
    /// The answer cache.
    Cache,
    /// The upstream dispatcher.
    Upstream,
    /// The recursive resolver.
    Recursive,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Cache => "cache",
            Self::Upstream => "upstream",
            Self::Recursive => "recursive",
        })
    }
}
