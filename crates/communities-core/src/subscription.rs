//! Cancellable drain of a query stream into a bounded outbound queue.
//!
//! Each subscription gets one task. The task owns the only sender of its
//! queue, so the queue closes exactly once: when the task returns, whatever
//! the reason.

use futures_util::StreamExt;
use nostr_sdk::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::EventStream;

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// How a drain task ended, with the number of events it handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The backend stream ended.
    Exhausted { sent: usize },
    /// The owning request was cancelled.
    Cancelled { sent: usize },
    /// The backend stream failed; events already sent stand.
    Failed { sent: usize, error: String },
    /// The consumer dropped its receiver.
    Disconnected { sent: usize },
}

/// Receiving half of a running drain task.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
    handle: JoinHandle<DrainOutcome>,
}

impl Subscription {
    /// Start draining `stream` into a queue of `capacity` slots.
    pub fn spawn(stream: EventStream, cancel: CancellationToken, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(stream, tx, cancel));
        Self { rx, handle }
    }

    /// Next event, or `None` once the task has ended and the queue is empty.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Stop receiving and wait for the task's outcome.
    pub async fn finish(self) -> DrainOutcome {
        let Self { rx, handle } = self;
        drop(rx);
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => DrainOutcome::Failed {
                sent: 0,
                error: format!("drain task aborted: {e}"),
            },
        }
    }
}

async fn drain(
    mut stream: EventStream,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> DrainOutcome {
    let mut sent = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DrainOutcome::Cancelled { sent },
            next = stream.next() => next,
        };

        let event = match next {
            None => {
                debug!(sent, "query stream exhausted");
                return DrainOutcome::Exhausted { sent };
            }
            Some(Err(e)) => {
                warn!(sent, "query stream failed: {e:#}");
                return DrainOutcome::Failed { sent, error: e.to_string() };
            }
            Some(Ok(event)) => event,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return DrainOutcome::Cancelled { sent },
            res = tx.send(event) => {
                if res.is_err() {
                    return DrainOutcome::Disconnected { sent };
                }
                sent += 1;
            }
        }
    }
}
