//! A bounded, sequence-ordered segment container.

use std::collections::{BTreeMap, VecDeque};
use std::pin::pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::segment::Segment;

/// Capacity of every per-session segment buffer.
pub const SEGMENT_BUFFER_CAPACITY: usize = 4096;

/// Error returned when inserting into a closed [`SegmentBuffer`].
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("segment buffer is closed")]
pub struct BufferClosed;

/// A bounded multiset of segments ordered by sequence number.
///
/// This is the synchronization primitive at the heart of the session:
/// insertion suspends while the buffer is full, minimum-removal suspends
/// while it is empty, and closing the buffer wakes every suspended task so
/// that teardown never strands a waiter. Segments with equal sequence
/// numbers are kept in arrival order, though nothing depends on that.
#[derive(Debug)]
pub struct SegmentBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Wakes producers when capacity frees up or the buffer closes.
    insertable: Notify,
    /// Wakes consumers when a segment arrives or the buffer closes.
    removable: Notify,
}

#[derive(Debug)]
struct Inner {
    segments: BTreeMap<u32, VecDeque<Segment>>,
    len: usize,
    closed: bool,
}

impl Inner {
    fn pop_min(&mut self) -> Option<Segment> {
        let mut entry = self.segments.first_entry()?;
        let segment = entry.get_mut().pop_front()?;
        if entry.get().is_empty() {
            entry.remove();
        }
        self.len -= 1;
        Some(segment)
    }
}

impl SegmentBuffer {
    /// Creates a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(SEGMENT_BUFFER_CAPACITY)
    }

    /// Creates a buffer holding at most `capacity` segments.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "segment buffer capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                segments: BTreeMap::new(),
                len: 0,
                closed: false,
            }),
            capacity,
            insertable: Notify::new(),
            removable: Notify::new(),
        }
    }

    /// Inserts a segment, suspending while the buffer is full. Fails only
    /// if the buffer is closed.
    pub async fn insert(&self, segment: Segment) -> Result<(), BufferClosed> {
        let mut segment = Some(segment);
        loop {
            let mut notified = pin!(self.insertable.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return Err(BufferClosed);
                }
                if inner.len < self.capacity {
                    let segment = segment.take().expect("segment inserted twice");
                    inner
                        .segments
                        .entry(segment.seq())
                        .or_default()
                        .push_back(segment);
                    inner.len += 1;
                    drop(inner);
                    self.removable.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Removes and returns the segment with the lowest sequence number, or
    /// `None` if the buffer is empty.
    pub fn delete_min(&self) -> Option<Segment> {
        let segment = self.inner.lock().unwrap().pop_min()?;
        self.insertable.notify_waiters();
        Some(segment)
    }

    /// Removes and returns the segment with the lowest sequence number,
    /// suspending while the buffer is empty. `None` signals that the buffer
    /// is closed; any segments still buffered at close are drained first.
    pub async fn delete_min_blocking(&self) -> Option<Segment> {
        loop {
            let mut notified = pin!(self.removable.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(segment) = inner.pop_min() {
                    drop(inner);
                    self.insertable.notify_waiters();
                    return Some(segment);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Removes and returns the minimum segment iff `pred` holds for it.
    /// The inspection and the removal are a single atomic step.
    pub fn delete_min_if(&self, pred: impl FnOnce(&Segment) -> bool) -> Option<Segment> {
        let segment = {
            let mut inner = self.inner.lock().unwrap();
            let minimum = inner.segments.first_key_value()?.1.front()?;
            if !pred(minimum) {
                return None;
            }
            inner.pop_min()?
        };
        self.insertable.notify_waiters();
        Some(segment)
    }

    /// Free capacity, as advertised to the peer in the window field.
    pub fn remaining(&self) -> usize {
        self.capacity - self.inner.lock().unwrap().len
    }

    /// The number of buffered segments.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    /// Whether the buffer holds no segments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the buffer and wakes every suspended task. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.insertable.notify_waiters();
        self.removable.notify_waiters();
    }

    /// Whether the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Returns clones of every segment due for (re)transmission: segments
    /// never handed to the underlay, and segments whose last transmission
    /// is older than `rto`. Stamps the transmit bookkeeping of everything
    /// returned. The segments stay buffered until acknowledged.
    pub(crate) fn collect_due(&self, rto: Duration) -> Vec<Segment> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for segments in inner.segments.values_mut() {
            for segment in segments.iter_mut() {
                let send = match segment.last_tx {
                    None => true,
                    Some(at) => now.duration_since(at) >= rto,
                };
                if send {
                    segment.last_tx = Some(now);
                    segment.tx_count += 1;
                    due.push(segment.clone());
                }
            }
        }
        due
    }
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::segment::ProtocolKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn segment(seq: u32) -> Segment {
        Segment::data(
            ProtocolKind::DataClientToServer,
            1,
            seq,
            0,
            0,
            0,
            Message::new(b"x"),
        )
    }

    #[tokio::test]
    async fn orders_by_sequence() {
        let buffer = SegmentBuffer::new();
        for seq in [3, 1, 2] {
            buffer.insert(segment(seq)).await.unwrap();
        }
        let order: Vec<u32> = std::iter::from_fn(|| buffer.delete_min().map(|s| s.seq())).collect();
        assert_eq!(order, [1, 2, 3]);
        assert!(buffer.delete_min().is_none());
    }

    #[tokio::test]
    async fn duplicate_keys_are_kept() {
        let buffer = SegmentBuffer::new();
        buffer.insert(segment(5)).await.unwrap();
        buffer.insert(segment(5)).await.unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.delete_min().unwrap().seq(), 5);
        assert_eq!(buffer.delete_min().unwrap().seq(), 5);
    }

    #[tokio::test]
    async fn remaining_tracks_occupancy() {
        let buffer = SegmentBuffer::with_capacity(4);
        assert_eq!(buffer.remaining(), 4);
        buffer.insert(segment(0)).await.unwrap();
        assert_eq!(buffer.remaining(), 3);
        buffer.delete_min();
        assert_eq!(buffer.remaining(), 4);
    }

    #[tokio::test]
    async fn delete_min_if_is_conditional() {
        let buffer = SegmentBuffer::new();
        buffer.insert(segment(4)).await.unwrap();
        assert!(buffer.delete_min_if(|s| s.seq() < 4).is_none());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.delete_min_if(|s| s.seq() < 5).unwrap().seq(), 4);
        assert!(buffer.delete_min_if(|_| true).is_none());
    }

    #[tokio::test]
    async fn insert_blocks_until_capacity() {
        let buffer = Arc::new(SegmentBuffer::with_capacity(1));
        buffer.insert(segment(0)).await.unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.insert(segment(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(buffer.delete_min().unwrap().seq(), 0);
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.delete_min().unwrap().seq(), 1);
    }

    #[tokio::test]
    async fn delete_min_blocking_waits_for_insert() {
        let buffer = Arc::new(SegmentBuffer::new());
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.delete_min_blocking().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        buffer.insert(segment(9)).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap().seq(), 9);
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let buffer = Arc::new(SegmentBuffer::new());
        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.delete_min_blocking().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(consumer.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_drains_before_signaling_death() {
        let buffer = SegmentBuffer::new();
        buffer.insert(segment(1)).await.unwrap();
        buffer.close();
        assert_eq!(buffer.delete_min_blocking().await.unwrap().seq(), 1);
        assert!(buffer.delete_min_blocking().await.is_none());
    }

    #[tokio::test]
    async fn insert_into_closed_buffer_fails() {
        let buffer = SegmentBuffer::new();
        buffer.close();
        assert_eq!(buffer.insert(segment(0)).await, Err(BufferClosed));
    }

    #[tokio::test]
    async fn collect_due_stamps_and_repeats_after_rto() {
        let buffer = SegmentBuffer::new();
        buffer.insert(segment(0)).await.unwrap();
        buffer.insert(segment(1)).await.unwrap();

        let first = buffer.collect_due(Duration::from_secs(60));
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|s| s.tx_count == 1));

        // Nothing is due again before the timeout elapses.
        assert!(buffer.collect_due(Duration::from_secs(60)).is_empty());

        let again = buffer.collect_due(Duration::ZERO);
        assert_eq!(again.len(), 2);
        assert!(again.iter().all(|s| s.tx_count == 2));
    }
}
