//! Bounded delivery queue between collectors and the sender.
//!
//! Many producers ([`MetricSink`], one clone per collector unit) and exactly
//! one consumer ([`QueueReceiver`], owned by the sender). Puts never block:
//! when the queue is full the newest line is rejected and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metric::MetricLine;

/// Default queue capacity (lines).
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Constructor for the producer/consumer pair.
#[derive(Debug)]
pub struct DeliveryQueue;

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` lines.
    ///
    /// A capacity of zero is raised to one.
    pub fn bounded(capacity: usize) -> (MetricSink, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            MetricSink {
                tx,
                dropped: Arc::clone(&dropped),
            },
            QueueReceiver { rx, dropped },
        )
    }
}

// =============================================================================
// Producer side
// =============================================================================

/// Non-blocking write handle handed to collectors.
///
/// Uses `try_send`: the capacity check and the insert are a single atomic
/// step inside the channel, so concurrent producers can never overfill it.
#[derive(Clone)]
pub struct MetricSink {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for MetricSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSink")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl MetricSink {
    /// Enqueue one raw line. Returns false if the line was dropped.
    pub fn put(&self, line: impl Into<String>) -> bool {
        match self.tx.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(line)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(line = %line, "Delivery queue full, dropping line");
                false
            }
            Err(TrySendError::Closed(line)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(line = %line, "Delivery queue closed, dropping line");
                false
            }
        }
    }

    /// Enqueue a formatted [`MetricLine`].
    pub fn emit(&self, line: &MetricLine) -> bool {
        self.put(line.to_string())
    }

    /// Lines currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued lines.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Total lines rejected since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Single-consumer end of the queue.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<String>,
    dropped: Arc<AtomicU64>,
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next line.
    ///
    /// Returns `None` on timeout or once every producer is gone and the
    /// queue is empty.
    pub async fn get(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take the next line if one is queued.
    pub fn try_get(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Lines currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Returns true once every producer handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    /// Total lines rejected by producers.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_until_full_then_reject() {
        let (sink, _rx) = DeliveryQueue::bounded(3);

        for i in 0..3 {
            assert!(sink.put(format!("m {i} 1")));
            assert!(sink.len() <= sink.capacity());
        }
        assert_eq!(sink.len(), 3);

        for expected_dropped in 1..=5 {
            assert!(!sink.put("overflow 1 1"));
            assert_eq!(sink.dropped(), expected_dropped);
            assert_eq!(sink.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_fifo_order_for_accepted_items() {
        let (sink, mut rx) = DeliveryQueue::bounded(2);
        assert!(sink.put("a 1 1"));
        assert!(sink.put("b 1 1"));
        assert!(!sink.put("c 1 1"));

        assert_eq!(rx.get(Duration::from_millis(10)).await.as_deref(), Some("a 1 1"));
        assert_eq!(rx.try_get().as_deref(), Some("b 1 1"));
        assert_eq!(rx.try_get(), None);
        assert_eq!(rx.dropped(), 1);

        // Space freed by the consumer is usable again.
        assert!(sink.put("d 1 1"));
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_times_out_on_empty_queue() {
        let (_sink, mut rx) = DeliveryQueue::bounded(4);
        let start = tokio::time::Instant::now();
        assert_eq!(rx.get(Duration::from_secs(5)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!rx.is_closed());
    }

    #[tokio::test]
    async fn test_closed_when_all_producers_dropped() {
        let (sink, mut rx) = DeliveryQueue::bounded(4);
        sink.put("a 1 1");
        drop(sink);
        assert_eq!(rx.try_get().as_deref(), Some("a 1 1"));
        assert!(rx.is_closed());
        assert_eq!(rx.get(Duration::from_secs(1)).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_respect_capacity() {
        const CAPACITY: usize = 100;
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 50;

        let (sink, rx) = DeliveryQueue::bounded(CAPACITY);
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let mut accepted = 0;
                    for i in 0..PER_PRODUCER {
                        if sink.put(format!("p{p} {i} 1")) {
                            accepted += 1;
                        }
                        assert!(sink.len() <= CAPACITY);
                    }
                    accepted
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            accepted += handle.await.unwrap();
        }

        assert_eq!(accepted, CAPACITY);
        assert_eq!(rx.len(), CAPACITY);
        assert_eq!(
            sink.dropped() as usize,
            PRODUCERS * PER_PRODUCER - CAPACITY
        );
    }
}
