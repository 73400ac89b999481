//! Bounded multi-producer, multi-consumer FIFO queue.
//!
//! Both hand-off points of the pipeline (raw lines to workers, spans to the
//! exporter) use this queue. Producers block in [`BoundedQueue::push`] while
//! the queue is full, which is how backpressure travels upstream. Consumers
//! poll with [`BoundedQueue::pop_timeout`] so they can look at a shutdown flag
//! between waits.
//!
//! Built on a tokio `mpsc` channel whose receiver sits behind an async mutex:
//! the channel provides the capacity bound and FIFO order, the mutex lets any
//! number of consumers share the receiving end.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};

/// Returned by [`BoundedQueue::push`] when the receiving side is gone. Carries
/// the rejected item back to the caller.
#[derive(Debug, Error)]
#[error("queue closed")]
pub struct QueueClosed<T>(pub T);

/// A cloneable handle to a bounded FIFO queue.
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T: Send> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items, clamped to what a
    /// bounded channel supports.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.clamp(1, Semaphore::MAX_PERMITS));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueues an item, waiting for room while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        self.tx.send(item).await.map_err(|e| QueueClosed(e.0))
    }

    /// Dequeues the oldest item, waiting at most `timeout` for one to arrive.
    ///
    /// Returns `None` if the wait elapsed with the queue still empty.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue holds.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
