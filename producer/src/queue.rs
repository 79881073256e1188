//! Bounded hand-off between the capture loop and the stream sender.
//!
//! Producers never block: when the queue is full the *new* item is dropped,
//! so the sender is never more than `capacity` items behind the camera.

use facestream_common::record::MeasurementRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 2;

/// A payload travelling from the capture loop to the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferItem {
    Record(MeasurementRecord),
    /// JPEG-encoded snapshot.
    Image(Vec<u8>),
}

impl TransferItem {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferItem::Record(_) => "record",
            TransferItem::Image(_) => "image",
        }
    }
}

pub struct TransferQueue {
    items: Mutex<VecDeque<TransferItem>>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TransferQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns `false` and discards `item` when full.
    pub fn try_put(&self, item: TransferItem) -> bool {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                drop(items);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            items.push_back(item);
        }
        self.available.notify_one();
        true
    }

    pub fn try_take(&self) -> Option<TransferItem> {
        self.lock().pop_front()
    }

    /// Dequeue the oldest item, waiting at most `timeout` for one to arrive.
    pub async fn take(&self, timeout: Duration) -> Option<TransferItem> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_take() {
                return Some(item);
            }
            // A permit left by an earlier put can wake us with nothing queued,
            // hence the loop.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_take();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items rejected by `try_put` since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TransferItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn image(tag: u8) -> TransferItem {
        TransferItem::Image(vec![tag])
    }

    #[test]
    fn full_queue_drops_newest_and_keeps_contents() {
        let queue = TransferQueue::default();
        assert!(queue.try_put(image(1)));
        assert!(queue.try_put(image(2)));
        assert!(!queue.try_put(image(3)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_take(), Some(image(1)));
        assert_eq!(queue.try_take(), Some(image(2)));
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = TransferQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.try_put(image(1)));
        assert_eq!(queue.len(), 1);
        assert!(!queue.try_put(image(2)));
    }

    #[test]
    fn capacity_frees_up_after_take() {
        let queue = TransferQueue::with_capacity(1);
        assert!(queue.try_put(image(1)));
        assert!(!queue.try_put(image(2)));
        queue.try_take();
        assert!(queue.try_put(image(3)));
        assert_eq!(queue.try_take(), Some(image(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn take_times_out_when_empty() {
        let queue = TransferQueue::default();
        let start = Instant::now();
        assert_eq!(queue.take(Duration::from_millis(100)).await, None);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn take_wakes_when_another_thread_puts() {
        let queue = Arc::new(TransferQueue::default());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.try_put(image(7))
        });

        let item = queue.take(Duration::from_secs(5)).await;
        assert_eq!(item, Some(image(7)));
        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn stale_permit_does_not_return_phantom_item() {
        let queue = TransferQueue::default();
        assert!(queue.try_put(image(1)));
        assert_eq!(queue.try_take(), Some(image(1)));
        // The permit from the put above is still stored.
        assert_eq!(queue.take(Duration::from_millis(10)).await, None);
    }
}
