//! Bounded streaming pipe between one producer and one consumer.
//!
//! The pipe carries transformed chunks from a provider adapter's upstream
//! body reader to the downstream SSE writer. It is a bounded queue: when
//! the buffer is full the producer blocks until the consumer drains a slot,
//! the pipe is cancelled, or the pipe is closed.
//!
//! Close happens at most once. The first `close()` caller performs the
//! teardown — waiting up to [`CLOSE_DRAIN_DEADLINE`] for the consumer to
//! drain buffered items — and every later caller observes the same
//! [`CloseOutcome`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default buffer capacity for pipes created by adapters.
pub const DEFAULT_CAPACITY: usize = 64;

/// How long `close()` waits for the consumer to drain buffered chunks.
pub const CLOSE_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Why a pipe write was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    /// The pipe was closed; the producer must abandon further writes.
    #[error("pipe closed")]
    Closed,

    /// The pipe's cancellation token fired.
    #[error("pipe cancelled")]
    Cancelled,
}

/// Terminal result of closing a pipe. All `close()` callers see the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The consumer drained every buffered chunk before the deadline.
    Drained,

    /// Buffered chunks were still pending when the drain deadline expired.
    TimedOut,

    /// The pipe was already cancelled when close began.
    Cancelled,
}

/// A bounded single-producer single-consumer chunk pipe.
///
/// Multiple pipes per process are fine; a single pipe must only ever have
/// one producer task and one consumer task.
pub struct StreamPipe<T> {
    capacity: usize,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    outcome: OnceCell<CloseOutcome>,
    finished_tx: watch::Sender<bool>,
}

impl<T: Send + 'static> StreamPipe<T> {
    /// Create a pipe with the given buffer capacity (must be non-zero).
    pub fn new(capacity: usize) -> Self {
        Self::with_cancellation(capacity, CancellationToken::new())
    }

    /// Create a pipe tied to an existing cancellation token, so cancelling
    /// the request context unblocks both ends of the pipe.
    pub fn with_cancellation(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (finished_tx, _) = watch::channel(false);
        Self {
            capacity: capacity.max(1),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            cancel,
            closed: AtomicBool::new(false),
            outcome: OnceCell::new(),
            finished_tx,
        }
    }

    /// The configured buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A clone of the pipe's cancellation token, for producer tasks that
    /// need to select against it while reading the upstream body.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the pipe, unblocking producer and consumer at their next
    /// interaction.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether close has begun. Terminal: never flips back.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue one chunk, blocking while the buffer is full.
    ///
    /// Fails without blocking once the pipe is closed or cancelled.
    pub async fn send(&self, item: T) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed);
        }
        if self.cancel.is_cancelled() {
            return Err(PipeError::Cancelled);
        }
        let tx = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone().ok_or(PipeError::Closed)?
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipeError::Cancelled),
            res = tx.send(item) => res.map_err(|_| PipeError::Closed),
        }
    }

    /// Dequeue the next chunk in producer emission order.
    ///
    /// Returns `None` once the pipe is closed and drained, or cancelled.
    /// Buffered chunks are preferred over the cancellation signal so a
    /// close can still drain.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = self.cancel.cancelled() => None,
        };
        if item.is_none() {
            // Consumer has observed end-of-stream; let close() return.
            // send_replace works even while no close() is subscribed.
            self.finished_tx.send_replace(true);
        }
        item
    }

    /// Close the pipe. Idempotent: the first caller tears down (drops the
    /// sender, waits up to [`CLOSE_DRAIN_DEADLINE`] for the consumer to
    /// drain, then cancels); every caller gets the same outcome.
    pub async fn close(&self) -> CloseOutcome {
        *self
            .outcome
            .get_or_init(|| async {
                let was_cancelled = self.cancel.is_cancelled();
                self.closed.store(true, Ordering::Release);

                // Probe emptiness before dropping the sender: an idle pipe
                // closes immediately without waiting on a consumer.
                let empty = {
                    let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
                    let empty = guard
                        .as_ref()
                        .is_none_or(|tx| tx.capacity() == tx.max_capacity());
                    *guard = None;
                    empty
                };

                if was_cancelled {
                    self.cancel.cancel();
                    return CloseOutcome::Cancelled;
                }
                if empty {
                    self.cancel.cancel();
                    return CloseOutcome::Drained;
                }

                let mut finished_rx = self.finished_tx.subscribe();
                let drained = tokio::time::timeout(CLOSE_DRAIN_DEADLINE, async {
                    while !*finished_rx.borrow_and_update() {
                        if finished_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .is_ok();

                self.cancel.cancel();
                if drained {
                    CloseOutcome::Drained
                } else {
                    debug!("pipe close drain deadline expired with chunks pending");
                    CloseOutcome::TimedOut
                }
            })
            .await
    }
}
