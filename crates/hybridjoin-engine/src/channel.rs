//! Bounded inter-stage channels and one-shot completion signals.
//!
//! Stages run on blocking threads, so the channel wraps a tokio `mpsc` with a
//! synchronous surface: [`StageSender::put`] blocks while the channel is full
//! (backpressure), and [`StageReceiver::get_timeout`] polls with short
//! cooperative sleeps so the consumer can re-check completion in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

const POLL_SLICE: Duration = Duration::from_millis(1);

/// Raised by [`StageSender::put`] when the receiving stage has gone away.
#[derive(Debug, thiserror::Error)]
#[error("downstream stage closed its input channel")]
pub struct ChannelClosed;

/// Outcome of a non-blocking or timed receive.
#[derive(Debug)]
pub enum Received<T> {
    Item(T),
    /// Nothing buffered right now; senders still exist.
    Empty,
    /// Nothing buffered and every sender has been dropped.
    Closed,
}

/// Create a bounded channel holding at most `capacity` items.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (StageSender<T>, StageReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StageSender { tx }, StageReceiver { rx })
}

/// Producer half. Cheap to clone.
#[derive(Debug)]
pub struct StageSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StageSender<T> {
    /// Enqueue `item`, blocking the calling thread while the channel is full.
    ///
    /// Must not be called from inside an async context.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelClosed`] if the receiver has been dropped.
    pub fn put(&self, item: T) -> Result<(), ChannelClosed> {
        self.tx.blocking_send(item).map_err(|_| ChannelClosed)
    }

    /// Items currently buffered.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer half, owned by exactly one stage.
#[derive(Debug)]
pub struct StageReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> StageReceiver<T> {
    /// Take the oldest buffered item without blocking.
    pub fn try_get(&mut self) -> Received<T> {
        match self.rx.try_recv() {
            Ok(item) => Received::Item(item),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Take the oldest item, waiting at most `timeout` for one to arrive.
    pub fn get_timeout(&mut self, timeout: Duration) -> Received<T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_get() {
                Received::Empty => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Received::Empty;
                    }
                    std::thread::sleep(POLL_SLICE.min(deadline - now));
                }
                other => return other,
            }
        }
    }

    /// Items currently buffered.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.rx.max_capacity()
    }
}

/// Create a linked one-shot completion pair.
#[must_use]
pub fn completion() -> (CompletionNotifier, CompletionSignal) {
    let flag = Arc::new(AtomicBool::new(false));
    (
        CompletionNotifier {
            flag: Some(Arc::clone(&flag)),
        },
        CompletionSignal { flag },
    )
}

/// Write side of a completion signal. There is exactly one per signal; it
/// fires when [`notify`](Self::notify) is called or when it is dropped,
/// whichever comes first, so an upstream failure still releases downstream.
#[derive(Debug)]
pub struct CompletionNotifier {
    flag: Option<Arc<AtomicBool>>,
}

impl CompletionNotifier {
    pub fn notify(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Read side of a completion signal. Idempotent; may be cloned freely.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    flag: Arc<AtomicBool>,
}

impl CompletionSignal {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
