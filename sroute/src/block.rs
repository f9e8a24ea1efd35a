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

//! The block stage: names on the block list are answered with NXDOMAIN and
//! never reach an upstream.

use crate::{error::Category, pipeline::Intercept, request::Request};
use async_trait::async_trait;
use log::{info, warn};
use smatcher::Matcher;
use std::sync::Arc;

/// The block-list stage.
pub struct Block {
    matcher: Arc<Matcher>,
}

impl Block {
    /// Create the stage around a matcher over the block lists.
    pub fn new(matcher: Arc<Matcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl Intercept for Block {
    type In = Request;
    type Out = Request;

    async fn intercept(&self, mut req: Request) -> Option<Request> {
        let record = match self.matcher.matches(req.name()).await {
            Some(record) => record,
            // No match, continue to the next resolver.
            None => return Some(req),
        };

        info!(
            "blocked {} via record {} (source: {})",
            req.name(),
            record.pattern,
            record.source.as_deref().unwrap_or("-"),
        );

        if let Err(e) = req.block().await {
            warn!("[{}] failed to answer request: {}", Category::Block, e);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::Block;
    use crate::{
        mock::{self, MockWriter},
        pipeline::Intercept,
    };
    use domain::base::{iana::Rcode, Rtype};
    use smatcher::{Matcher, Record, RecordKind};
    use std::sync::Arc;

    fn stage() -> Block {
        let matcher = Matcher::new(vec![
            Record::new("ads.example", RecordKind::Direct),
            Record::new("*doubleclick.net", RecordKind::Wildcard),
        ])
        .unwrap();
        Block::new(Arc::new(matcher))
    }

    async fn rcode_for(name: &str) -> Option<Rcode> {
        let (writer, responses) = MockWriter::new();
        let req = mock::request(mock::query(name, Rtype::A), Box::new(writer));

        match stage().intercept(req).await {
            None => {
                let responses = responses.lock().unwrap();
                assert_eq!(responses.len(), 1);
                Some(responses[0].header().rcode())
            }
            Some(_) => None,
        }
    }

    #[tokio::test]
    async fn direct_block_returns_nxdomain() {
        assert_eq!(rcode_for("ads.example").await, Some(Rcode::NXDomain));
    }

    #[tokio::test]
    async fn wildcard_block_covers_subdomains() {
        for name in ["doubleclick.net", "ad.doubleclick.net", "mydoubleclick.net"] {
            assert_eq!(rcode_for(name).await, Some(Rcode::NXDomain), "{}", name);
        }
        // Different suffix is forwarded, not blocked.
        assert_eq!(rcode_for("doubleclick.org").await, None);
    }
}
