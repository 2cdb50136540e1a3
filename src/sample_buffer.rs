//! Fixed-capacity ring shared by a producer and one consumer.
//!
//! This is the server side of a continuous channel: the device fill loop
//! appends records, a read request drains a contiguous prefix. When the
//! ring is full the oldest unread record is discarded so the newest data
//! survives, and the discard is counted. Each drain reports the count
//! accumulated since the previous drain in the same critical section that
//! moves the records out, so loss is always reported together with the
//! first records delivered after it.
//!
//! Records are not tagged with their index. The ring keeps the index of
//! the next record to be appended; the index of the oldest buffered record
//! follows from it, which keeps the delivered sequence gapless by
//! construction.

use crate::cancel_token::{CancelToken, CANCEL_POLL_INTERVAL};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer capacity must be at least one record")]
    ZeroCapacity,
}

/// Why a drain returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// At least one record was available.
    Data,
    /// The caller's token fired; records holds whatever was buffered.
    Cancelled,
    /// The buffer was closed; records holds whatever was still buffered.
    Closed,
    /// Nothing arrived within the wait.
    TimedOut,
}

/// Records moved out of the ring by one drain.
#[derive(Debug)]
pub struct Drained<T> {
    /// Index of `records[0]`, or of the next record to be appended when
    /// `records` is empty.
    pub first_index: u64,
    pub records: Vec<T>,
    /// Records discarded by overflow since the previous drain.
    pub dropped: u64,
    /// Occupancy before the drain, as a fraction of capacity.
    pub fullness: f64,
    pub outcome: DrainOutcome,
}

#[derive(Debug)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
    next_index: u64,
    overflow: u64,
    closed: bool,
}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, record: T) -> bool {
        let capacity = self.capacity();
        let mut discarded = false;
        if self.len == capacity {
            self.slots[self.head] = None;
            self.head = (self.head + 1) % capacity;
            self.len -= 1;
            self.overflow += 1;
            discarded = true;
        }
        let tail = (self.head + self.len) % capacity;
        self.slots[tail] = Some(record);
        self.len += 1;
        self.next_index += 1;
        discarded
    }

    fn drain(&mut self, max: usize, outcome: DrainOutcome) -> Drained<T> {
        let capacity = self.capacity();
        let fullness = self.len as f64 / capacity as f64;
        let first_index = self.next_index - self.len as u64;
        let take = max.min(self.len);

        let mut records = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(record) = self.slots[self.head].take() {
                records.push(record);
            }
            self.head = (self.head + 1) % capacity;
        }
        self.len -= take;

        Drained {
            first_index,
            records,
            dropped: std::mem::take(&mut self.overflow),
            fullness,
            outcome,
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

/// Ring buffer with drop-oldest overflow and a blocking drain.
#[derive(Debug)]
pub struct ContinuousSampleBuffer<T> {
    ring: Mutex<Ring<T>>,
    ready: Condvar,
}

impl<T> ContinuousSampleBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                len: 0,
                next_index: 0,
                overflow: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fullness(&self) -> f64 {
        let ring = self.ring.lock();
        ring.len as f64 / ring.capacity() as f64
    }

    /// Index the next appended record will get.
    pub fn next_index(&self) -> u64 {
        self.ring.lock().next_index
    }

    /// Appends one record, discarding the oldest if full.
    ///
    /// Returns `true` when a record was discarded.
    pub fn append(&self, record: T) -> bool {
        let discarded = self.ring.lock().push(record);
        self.ready.notify_all();
        discarded
    }

    /// Appends every record, returning how many old records were discarded.
    pub fn extend<I: IntoIterator<Item = T>>(&self, records: I) -> u64 {
        let discarded = {
            let mut ring = self.ring.lock();
            records
                .into_iter()
                .map(|record| u64::from(ring.push(record)))
                .sum()
        };
        self.ready.notify_all();
        discarded
    }

    /// Moves out up to `max` records without waiting.
    pub fn try_drain(&self, max: usize) -> Drained<T> {
        let mut ring = self.ring.lock();
        let outcome = if ring.closed {
            DrainOutcome::Closed
        } else {
            DrainOutcome::Data
        };
        ring.drain(max, outcome)
    }

    /// Waits until a record is available, then moves out up to `max`.
    ///
    /// Returns early with the currently buffered records (possibly none)
    /// when `cancel` fires or the buffer is closed, and with nothing when
    /// `timeout` elapses. The token is checked every
    /// [`CANCEL_POLL_INTERVAL`].
    pub fn drain_blocking(
        &self,
        max: usize,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Drained<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.ring.lock();
        loop {
            if ring.closed {
                return ring.drain(max, DrainOutcome::Closed);
            }
            if cancel.is_cancelled() {
                return ring.drain(max, DrainOutcome::Cancelled);
            }
            if ring.len > 0 {
                return ring.drain(max, DrainOutcome::Data);
            }
            let mut slice = CANCEL_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return ring.drain(0, DrainOutcome::TimedOut);
                }
                slice = slice.min(deadline - now);
            }
            self.ready.wait_for(&mut ring, slice);
        }
    }

    /// Discards every unread record. The index sequence keeps counting.
    pub fn flush(&self) {
        self.ring.lock().clear();
    }

    /// Wakes every waiter so it can re-check its token.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }

    /// Stops the buffer; pending and future drains return `Closed`.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    /// Returns to the freshly created state: empty, indices restarting at
    /// zero, no overflow pending, open.
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.clear();
        ring.next_index = 0;
        ring.overflow = 0;
        ring.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(ContinuousSampleBuffer::<u32>::new(0).is_err());
    }

    #[test]
    fn test_drain_prefix_in_order() {
        let buffer = ContinuousSampleBuffer::new(8).unwrap();
        buffer.extend(0..5u32);
        let first = buffer.try_drain(3);
        assert_eq!(first.records, vec![0, 1, 2]);
        assert_eq!(first.first_index, 0);
        assert_eq!(first.dropped, 0);
        assert!((first.fullness - 5.0 / 8.0).abs() < f64::EPSILON);

        let second = buffer.try_drain(10);
        assert_eq!(second.records, vec![3, 4]);
        assert_eq!(second.first_index, 3);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts_exact_excess() {
        let buffer = ContinuousSampleBuffer::new(4096).unwrap();
        let discarded = buffer.extend(0..5000u32);
        assert_eq!(discarded, 904);

        let drained = buffer.try_drain(10_000);
        assert_eq!(drained.records.len(), 4096);
        assert_eq!(drained.dropped, 904);
        assert_eq!(drained.first_index, 904);
        assert_eq!(drained.records[0], 904);
        assert_eq!(drained.records[4095], 4999);
        assert!((drained.fullness - 1.0).abs() < f64::EPSILON);

        // the count resets after being reported
        buffer.append(5000);
        let next = buffer.try_drain(10);
        assert_eq!(next.dropped, 0);
        assert_eq!(next.first_index, 5000);
    }

    #[test]
    fn test_indices_gapless_across_wraparound() {
        let buffer = ContinuousSampleBuffer::new(3).unwrap();
        let mut expected = 0u64;
        for round in 0..10u32 {
            buffer.extend([round * 2, round * 2 + 1]);
            let drained = buffer.try_drain(2);
            assert_eq!(drained.first_index, expected);
            assert_eq!(drained.dropped, 0);
            expected += drained.records.len() as u64;
        }
        assert_eq!(expected, 20);
    }

    #[test]
    fn test_blocking_drain_times_out_empty() {
        let buffer = ContinuousSampleBuffer::<u8>::new(4).unwrap();
        let drained =
            buffer.drain_blocking(4, Some(Duration::from_millis(20)), &CancelToken::new());
        assert_eq!(drained.outcome, DrainOutcome::TimedOut);
        assert!(drained.records.is_empty());
    }

    #[test]
    fn test_blocking_drain_wakes_on_append() {
        let buffer = Arc::new(ContinuousSampleBuffer::new(4).unwrap());
        let producer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.append(7u8);
        });
        let drained = buffer.drain_blocking(4, Some(Duration::from_secs(5)), &CancelToken::new());
        handle.join().unwrap();
        assert_eq!(drained.outcome, DrainOutcome::Data);
        assert_eq!(drained.records, vec![7]);
    }

    #[test]
    fn test_cancel_unblocks_quickly_with_nothing() {
        let buffer = Arc::new(ContinuousSampleBuffer::<u8>::new(4).unwrap());
        let token = CancelToken::new();
        let canceller = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let drained = buffer.drain_blocking(4, None, &token);
        handle.join().unwrap();
        assert_eq!(drained.outcome, DrainOutcome::Cancelled);
        assert!(drained.records.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_close_returns_remaining_records() {
        let buffer = ContinuousSampleBuffer::new(4).unwrap();
        buffer.extend([1u8, 2]);
        buffer.close();
        let drained = buffer.drain_blocking(4, None, &CancelToken::new());
        assert_eq!(drained.outcome, DrainOutcome::Closed);
        assert_eq!(drained.records, vec![1, 2]);
    }

    #[test]
    fn test_flush_keeps_index_counting() {
        let buffer = ContinuousSampleBuffer::new(4).unwrap();
        buffer.extend([1u8, 2, 3]);
        buffer.flush();
        assert!(buffer.is_empty());
        buffer.append(4);
        let drained = buffer.try_drain(4);
        assert_eq!(drained.first_index, 3);
        assert_eq!(drained.records, vec![4]);
    }

    #[test]
    fn test_reset_starts_over() {
        let buffer = ContinuousSampleBuffer::new(2).unwrap();
        buffer.extend([1u8, 2, 3]);
        buffer.close();
        buffer.reset();
        assert!(!buffer.is_closed());
        buffer.append(9);
        let drained = buffer.try_drain(4);
        assert_eq!(drained.first_index, 0);
        assert_eq!(drained.dropped, 0);
        assert_eq!(drained.outcome, DrainOutcome::Data);
    }
}
