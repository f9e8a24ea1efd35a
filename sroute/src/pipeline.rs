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

//! The interceptor pipeline: the [`Intercept`] stage contract, the elastic
//! [`Scaler`] worker pool each stage runs behind, the round-robin fan-out,
//! and the [`Pipeline`] assembly wiring the stages together.

use crate::{allow::Allow, cache::Cache, request::Request, Block, Local, Recursor, Upstream};
use async_trait::async_trait;
use log::debug;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// How long a spare worker waits for work before terminating.
pub const DEFAULT_IDLE_LIFE: Duration = Duration::from_millis(100);

/// Minimum delay before an additional worker is spawned under load.
pub const DEFAULT_SPAWN_WAIT: Duration = Duration::from_millis(1);

// Stages hand values to each other through capacity-one channels, the
// closest tokio gets to a rendezvous handoff.
const STAGE_CAPACITY: usize = 1;

/// A pipeline stage. Returning `Some` forwards the value to the next
/// stage; returning `None` terminates the pipeline for that value, either
/// because the stage answered it or because it was dropped.
#[async_trait]
pub trait Intercept: Send + Sync + 'static {
    /// The value consumed by the stage.
    type In: Send + 'static;
    /// The value the stage forwards.
    type Out: Send + 'static;

    /// Process one value.
    async fn intercept(&self, input: Self::In) -> Option<Self::Out>;
}

/// An elastic worker pool running one stage. Workers are spawned when a
/// handoff cannot be placed within the spawn-wait and exit after sitting
/// idle for the idle-life, so the pool breathes with the load. No ordering
/// is preserved between values.
pub struct Scaler<I: Intercept> {
    stage: Arc<I>,
    life: Duration,
    wait: Duration,
}

impl<I: Intercept> Scaler<I> {
    /// Wrap a stage with the default knobs.
    pub fn new(stage: I) -> Self {
        Self::with_knobs(stage, DEFAULT_IDLE_LIFE, DEFAULT_SPAWN_WAIT)
    }

    /// Wrap a stage with explicit idle-life and spawn-wait.
    pub fn with_knobs(stage: I, life: Duration, wait: Duration) -> Self {
        Self {
            stage: Arc::new(stage),
            life,
            wait,
        }
    }

    /// Run the pool between an input and an output channel until the input
    /// closes or the token fires.
    pub fn spawn(
        self,
        mut input: mpsc::Receiver<I::In>,
        output: mpsc::Sender<I::Out>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (work_tx, work_rx) = mpsc::channel::<I::In>(STAGE_CAPACITY);
            let work_rx = Arc::new(Mutex::new(work_rx));
            let workers = Arc::new(AtomicUsize::new(0));

            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = input.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };

                // An empty pool cannot drain the handoff buffer.
                if workers.load(Ordering::Acquire) == 0 {
                    spawn_worker(
                        Arc::clone(&self.stage),
                        Arc::clone(&work_rx),
                        Arc::clone(&workers),
                        output.clone(),
                        self.life,
                        token.clone(),
                    );
                }

                // Hand off to an idle worker; grow the pool when none picks
                // the value up within the spawn-wait.
                match work_tx.send_timeout(item, self.wait).await {
                    Ok(()) => (),
                    Err(SendTimeoutError::Timeout(item)) => {
                        spawn_worker(
                            Arc::clone(&self.stage),
                            Arc::clone(&work_rx),
                            Arc::clone(&workers),
                            output.clone(),
                            self.life,
                            token.clone(),
                        );
                        if work_tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(SendTimeoutError::Closed(_)) => break,
                }
            }
            // Dropping work_tx drains the remaining workers.
        })
    }
}

// Decrements the pool count however the worker exits.
struct WorkerGuard(Arc<AtomicUsize>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

fn spawn_worker<I: Intercept>(
    stage: Arc<I>,
    work: Arc<Mutex<mpsc::Receiver<I::In>>>,
    workers: Arc<AtomicUsize>,
    output: mpsc::Sender<I::Out>,
    life: Duration,
    token: CancellationToken,
) {
    workers.fetch_add(1, Ordering::Release);
    let guard = WorkerGuard(workers);

    tokio::spawn(async move {
        let _guard = guard;
        loop {
            // Workers race for the shared receiver; one that gets neither
            // the lock nor a value within its idle-life retires.
            let next = async { work.lock().await.recv().await };
            let item = tokio::select! {
                _ = token.cancelled() => return,
                item = tokio::time::timeout(life, next) => match item {
                    Ok(Some(item)) => item,
                    Ok(None) => return,
                    // Idled out; drain anything that landed in the buffer
                    // while the timer fired, then retire.
                    Err(_) => match work.try_lock().ok().and_then(|mut rx| rx.try_recv().ok()) {
                        Some(item) => item,
                        None => return,
                    },
                },
            };

            if let Some(out) = stage.intercept(item).await {
                if output.send(out).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// Distribute values round-robin across a set of channels. Exactly one
/// target receives each value.
pub fn fan_out<T: Send + 'static>(
    mut input: mpsc::Receiver<T>,
    outputs: Vec<mpsc::Sender<T>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if outputs.is_empty() {
            return;
        }
        let mut next = 0usize;
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = input.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let target = &outputs[next % outputs.len()];
            next = next.wrapping_add(1);
            tokio::select! {
                _ = token.cancelled() => break,
                res = target.send(item) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// The terminal of the pipeline: either a set of upstream servers fanned
/// out round-robin, or the recursive resolver.
pub enum Terminal {
    /// Exchange with one of the configured upstream servers.
    Upstreams(Vec<Upstream>),
    /// Resolve by walking the hierarchy from the root hints.
    Recursive(Recursor),
}

/// The assembled stage graph. Feed [`Request`]s into the inlet (usually
/// through an [`Adapter`](crate::Adapter)); each one is answered by exactly
/// one stage or dropped.
pub struct Pipeline {
    inlet: mpsc::Sender<Request>,
}

impl Pipeline {
    /// Wire up cache → local → allow → block → terminal, each stage behind
    /// its own scaler, and start the whole thing. Stages other than cache
    /// and terminal are optional.
    pub fn spawn(
        token: &CancellationToken,
        cache: Cache,
        local: Option<Local>,
        allow: Option<Arc<smatcher::Matcher>>,
        block: Option<Block>,
        terminal: Terminal,
    ) -> Self {
        // Terminal stages forward nothing; their output channel is closed
        // from the start.
        let (sink_tx, _) = mpsc::channel::<Request>(STAGE_CAPACITY);

        let (terminal_tx, terminal_rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
        match terminal {
            Terminal::Upstreams(upstreams) => {
                let mut inlets = Vec::with_capacity(upstreams.len());
                for upstream in upstreams {
                    let (tx, rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
                    Scaler::new(upstream).spawn(rx, sink_tx.clone(), token.clone());
                    inlets.push(tx);
                }
                fan_out(terminal_rx, inlets, token.clone());
            }
            Terminal::Recursive(recursor) => {
                Scaler::new(recursor).spawn(terminal_rx, sink_tx.clone(), token.clone());
            }
        }

        let mut entry = terminal_tx.clone();

        if let Some(block) = block {
            let (tx, rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
            Scaler::new(block).spawn(rx, entry, token.clone());
            entry = tx;
        }

        if let Some(matcher) = allow {
            // Allow short-circuits matched requests straight into the
            // terminal inlet, skipping block.
            let stage = Allow::new(matcher, terminal_tx.clone(), token.clone());
            let (tx, rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
            Scaler::new(stage).spawn(rx, entry, token.clone());
            entry = tx;
        }

        if let Some(local) = local {
            let (tx, rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
            Scaler::new(local).spawn(rx, entry, token.clone());
            entry = tx;
        }

        let (tx, rx) = mpsc::channel::<Request>(STAGE_CAPACITY);
        Scaler::new(cache).spawn(rx, entry, token.clone());

        debug!("pipeline assembled");
        Self { inlet: tx }
    }

    /// The channel requests enter the pipeline through.
    pub fn inlet(&self) -> mpsc::Sender<Request> {
        self.inlet.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{fan_out, Intercept, Scaler};
    use async_trait::async_trait;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Doubler;

    #[async_trait]
    impl Intercept for Doubler {
        type In = u64;
        type Out = u64;

        async fn intercept(&self, input: u64) -> Option<u64> {
            // Odd values are dropped from the pipeline.
            (input % 2 == 0).then_some(input * 2)
        }
    }

    #[tokio::test]
    async fn scaler_applies_and_drops() {
        let token = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        Scaler::new(Doubler).spawn(in_rx, out_tx, token.clone());

        for v in 0u64..8 {
            in_tx.send(v).await.unwrap();
        }
        drop(in_tx);

        let mut seen = Vec::new();
        while let Some(v) = out_rx.recv().await {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 4, 8, 12]);
        token.cancel();
    }

    struct Tally(Arc<AtomicUsize>);

    #[async_trait]
    impl Intercept for Tally {
        type In = ();
        type Out = ();

        async fn intercept(&self, _: ()) -> Option<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            None
        }
    }

    #[tokio::test]
    async fn scaler_grows_under_load() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);

        Scaler::new(Tally(Arc::clone(&count))).spawn(in_rx, out_tx, token.clone());

        // Slow stage, burst of work: the pool has to add workers to keep
        // accepting the handoffs.
        for _ in 0..6 {
            in_tx.send(()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 6);
        token.cancel();
    }

    #[tokio::test]
    async fn fan_out_round_robins() {
        let token = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(1);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);

        fan_out(in_rx, vec![a_tx, b_tx], token.clone());

        for v in 0u64..4 {
            in_tx.send(v).await.unwrap();
        }
        drop(in_tx);

        assert_eq!(a_rx.recv().await, Some(0));
        assert_eq!(a_rx.recv().await, Some(2));
        assert_eq!(b_rx.recv().await, Some(1));
        assert_eq!(b_rx.recv().await, Some(3));
        token.cancel();
    }
}
