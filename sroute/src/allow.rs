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

//! The allow stage: names on the allow list bypass the block list entirely
//! and go straight to the terminal resolver. The bypass is pure policy; it
//! applies to every record kind, whether or not an address is set.

use crate::{pipeline::Intercept, request::Request};
use async_trait::async_trait;
use log::{debug, warn};
use smatcher::Matcher;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The allow-list stage. Holds the write side of the terminal inlet so
/// matched requests can skip the stages in between.
pub struct Allow {
    matcher: Arc<Matcher>,
    upstream: mpsc::Sender<Request>,
    token: CancellationToken,
}

impl Allow {
    /// Create the stage around a matcher and the terminal inlet. `token`
    /// is the process token; a canceled process abandons pending sends.
    pub fn new(
        matcher: Arc<Matcher>,
        upstream: mpsc::Sender<Request>,
        token: CancellationToken,
    ) -> Self {
        Self {
            matcher,
            upstream,
            token,
        }
    }
}

#[async_trait]
impl Intercept for Allow {
    type In = Request;
    type Out = Request;

    async fn intercept(&self, req: Request) -> Option<Request> {
        let record = match self.matcher.matches(req.name()).await {
            Some(record) => record,
            // No match, continue to the next resolver.
            None => return Some(req),
        };

        debug!("allowing {} via record {}", req.name(), record.pattern);

        // Matched: hand off to the terminal, respecting its back-pressure
        // unless the request or the process goes away first.
        let canceled = req.token().clone();
        tokio::select! {
            _ = self.token.cancelled() => (),
            _ = canceled.cancelled() => (),
            res = self.upstream.send(req) => {
                if res.is_err() {
                    warn!("terminal inlet closed, dropping allowed request");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::Allow;
    use crate::{
        mock::{self, MockWriter},
        pipeline::Intercept,
    };
    use domain::base::Rtype;
    use smatcher::{Matcher, Record, RecordKind};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn stage(tx: mpsc::Sender<crate::Request>) -> Allow {
        let matcher =
            Matcher::new(vec![Record::new("*good.example", RecordKind::Wildcard)]).unwrap();
        Allow::new(Arc::new(matcher), tx, CancellationToken::new())
    }

    #[tokio::test]
    async fn matched_requests_bypass() {
        let (tx, mut rx) = mpsc::channel(1);
        let allow = stage(tx);

        let (writer, _) = MockWriter::new();
        let req = mock::request(mock::query("cdn.good.example", Rtype::A), Box::new(writer));

        assert!(allow.intercept(req).await.is_none());
        assert_eq!(rx.recv().await.unwrap().name(), "cdn.good.example");
    }

    #[tokio::test]
    async fn unmatched_requests_forward() {
        let (tx, mut rx) = mpsc::channel(1);
        let allow = stage(tx);

        let (writer, _) = MockWriter::new();
        let req = mock::request(mock::query("bad.example", Rtype::A), Box::new(writer));

        assert!(allow.intercept(req).await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
