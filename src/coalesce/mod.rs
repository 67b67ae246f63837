//! Request coalescing: many concurrent single-row calls become one bulk call
//!
//! Callers submit a request with a one-shot reply slot. A single owning loop
//! collects requests until the batch is full or a short timer since its first
//! request fires, then hands the live requests to a [`BatchHandler`] in one
//! call and answers every request from the result.

pub mod failures;
pub mod ownership;

pub use failures::{FailureOutcome, FailureTracker, FailureUpdate};
pub use ownership::OwnershipVerifier;

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Executes one flushed batch.
///
/// On success the returned vector must hold one response per request, in
/// request order. An error fails every request of the batch.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn name(&self) -> &'static str;

    async fn handle(&self, batch: &[Self::Request]) -> EngineResult<Vec<Self::Response>>;
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Time from the first request of an open batch until it is flushed
    pub flush_interval: Duration,
    /// Flush as soon as this many requests are waiting
    pub max_batch: usize,
    /// Capacity of the inbound request channel
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(25),
            max_batch: 200,
            channel_capacity: 4096,
        }
    }
}

struct Pending<Req, Resp> {
    request: Req,
    ctx: CancellationToken,
    reply: oneshot::Sender<EngineResult<Resp>>,
}

impl<Req, Resp> Pending<Req, Resp> {
    fn is_abandoned(&self) -> bool {
        self.ctx.is_cancelled() || self.reply.is_closed()
    }
}

/// Handle used to submit requests to a running coalescer
pub struct Coalescer<H: BatchHandler> {
    tx: mpsc::Sender<Pending<H::Request, H::Response>>,
}

impl<H: BatchHandler> Clone for Coalescer<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<H: BatchHandler> Coalescer<H> {
    /// Start the owning loop. It stops when `shutdown` is cancelled or every
    /// handle has been dropped, flushing what it already holds.
    pub fn spawn(handler: H, config: BatchConfig, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task = tokio::spawn(run_loop(handler, config, rx, shutdown));
        (Self { tx }, task)
    }

    /// Submit one request and wait for its batch to be answered.
    ///
    /// Returns `EngineError::Cancelled` promptly if `ctx` is cancelled first;
    /// the request is then left out of the bulk call if it was not yet flushed.
    pub async fn submit(&self, ctx: &CancellationToken, request: H::Request) -> EngineResult<H::Response> {
        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            request,
            ctx: ctx.clone(),
            reply,
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            sent = self.tx.send(pending) => sent.map_err(|_| EngineError::CoalescerClosed)?,
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(EngineError::Cancelled),
            answer = rx => answer.map_err(|_| EngineError::CoalescerClosed)?,
        }
    }
}

async fn run_loop<H: BatchHandler>(
    handler: H,
    config: BatchConfig,
    mut rx: mpsc::Receiver<Pending<H::Request, H::Response>>,
    shutdown: CancellationToken,
) {
    let max_batch = config.max_batch.max(1);
    debug!(coalescer = handler.name(), "coalescer started");
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(p) => p,
                None => break,
            },
        };
        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);

        let deadline = tokio::time::sleep(config.flush_interval);
        tokio::pin!(deadline);
        let mut closed = false;
        while batch.len() < max_batch {
            tokio::select! {
                biased;
                _ = &mut deadline => break,
                msg = rx.recv() => match msg {
                    Some(p) => batch.push(p),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        flush(&handler, batch).await;
        if closed {
            break;
        }
    }

    // answer anything still queued rather than dropping the reply slots
    rx.close();
    let mut rest = Vec::new();
    while let Ok(p) = rx.try_recv() {
        rest.push(p);
    }
    for chunk in chunks_of(rest, max_batch) {
        flush(&handler, chunk).await;
    }
    debug!(coalescer = handler.name(), "coalescer stopped");
}

fn chunks_of<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::new();
    while !items.is_empty() {
        let tail = items.split_off(items.len().min(size));
        out.push(items);
        items = tail;
    }
    out
}

async fn flush<H: BatchHandler>(handler: &H, batch: Vec<Pending<H::Request, H::Response>>) {
    let (abandoned, live): (Vec<_>, Vec<_>) = batch.into_iter().partition(|p| p.is_abandoned());
    for p in abandoned {
        let _ = p.reply.send(Err(EngineError::Cancelled));
    }
    if live.is_empty() {
        return;
    }

    let (requests, replies): (Vec<_>, Vec<_>) = live.into_iter().map(|p| (p.request, p.reply)).unzip();
    match handler.handle(&requests).await {
        Ok(responses) if responses.len() == replies.len() => {
            for (reply, response) in replies.into_iter().zip(responses) {
                let _ = reply.send(Ok(response));
            }
        }
        Ok(responses) => {
            let message = format!(
                "{} returned {} responses for {} requests",
                handler.name(),
                responses.len(),
                replies.len()
            );
            warn!(coalescer = handler.name(), "{message}");
            for reply in replies {
                let _ = reply.send(Err(EngineError::BatchFailed(message.clone())));
            }
        }
        Err(e) => {
            warn!(coalescer = handler.name(), size = replies.len(), error = %e, "batch failed");
            let message = e.to_string();
            for reply in replies {
                let _ = reply.send(Err(EngineError::BatchFailed(message.clone())));
            }
        }
    }
}
