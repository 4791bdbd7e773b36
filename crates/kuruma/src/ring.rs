//! Fixed-capacity NAL ring buffer
//!
//! Single-producer (capture worker), single-consumer (downstream reader)
//! queue with drop-oldest semantics: for a live video link, newer frames
//! supersede older ones, and unbounded growth during a consumer stall would
//! defeat the latency goal. Fixed capacity bounds worst-case memory.

use std::sync::Mutex;

use crate::nal::{NalRecord, MAX_NAL_SIZE};

/// Number of slots in the ring.
pub const RING_CAPACITY: usize = 8;

struct RingInner {
    slots: Vec<Option<NalRecord>>,
    write_index: usize,
    read_index: usize,
    count: usize,
}

impl RingInner {
    fn new() -> Self {
        Self {
            slots: (0..RING_CAPACITY).map(|_| None).collect(),
            write_index: 0,
            read_index: 0,
            count: 0,
        }
    }
}

/// Bounded NAL queue shared between the capture worker and the consumer.
pub struct NalRing {
    inner: Mutex<RingInner>,
}

impl NalRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner::new()),
        }
    }

    /// Store `record`, evicting the oldest entry when the ring is full.
    ///
    /// Returns false for empty or oversize records, which are not stored.
    pub fn write(&self, record: NalRecord) -> bool {
        if record.data.is_empty() || record.data.len() > MAX_NAL_SIZE {
            return false;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.count == RING_CAPACITY {
            inner.read_index = (inner.read_index + 1) % RING_CAPACITY;
            inner.count -= 1;
        }
        let write_index = inner.write_index;
        inner.slots[write_index] = Some(record);
        inner.write_index = (write_index + 1) % RING_CAPACITY;
        inner.count += 1;
        true
    }

    /// Take the oldest record, or `None` when the ring is empty.
    pub fn read(&self) -> Option<NalRecord> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.count == 0 {
            return None;
        }
        let read_index = inner.read_index;
        let record = inner.slots[read_index].take();
        inner.read_index = (read_index + 1) % RING_CAPACITY;
        inner.count -= 1;
        record
    }

    /// Drop all buffered records and reset the indices.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.write_index = 0;
        inner.read_index = 0;
        inner.count = 0;
        for slot in inner.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NalRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn record(tag: u8) -> NalRecord {
        // P-slice payload carrying a recognizable tag byte.
        let data = Bytes::from(vec![0x00, 0x00, 0x00, 0x01, 0x41, tag]);
        NalRecord::from_annexb(data, tag as u64).unwrap()
    }

    fn tag_of(record: &NalRecord) -> u8 {
        record.data[5]
    }

    #[test]
    fn empty_ring_reads_none() {
        let ring = NalRing::new();
        assert!(ring.read().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn write_then_read_preserves_order() {
        let ring = NalRing::new();
        for tag in 0..5 {
            assert!(ring.write(record(tag)));
        }
        assert_eq!(ring.len(), 5);
        for tag in 0..5 {
            assert_eq!(tag_of(&ring.read().unwrap()), tag);
        }
        assert!(ring.read().is_none());
    }

    #[test]
    fn full_ring_evicts_oldest() {
        // Write 10 records into 8 slots, then drain: the two oldest are
        // gone and the most recent 8 come out in order.
        let ring = NalRing::new();
        for tag in 0..10 {
            assert!(ring.write(record(tag)));
        }
        assert_eq!(ring.len(), RING_CAPACITY);

        let drained: Vec<u8> = std::iter::from_fn(|| ring.read().map(|r| tag_of(&r))).collect();
        assert_eq!(drained, vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn rejects_empty_and_oversize_records() {
        let ring = NalRing::new();

        let mut empty = record(0);
        empty.data = Bytes::new();
        assert!(!ring.write(empty));

        let mut oversize = record(0);
        oversize.data = Bytes::from(vec![0u8; MAX_NAL_SIZE + 1]);
        assert!(!ring.write(oversize));

        assert!(ring.is_empty());
    }

    #[test]
    fn clear_empties_and_is_idempotent() {
        let ring = NalRing::new();
        for tag in 0..4 {
            ring.write(record(tag));
        }
        ring.clear();
        assert!(ring.read().is_none());
        // Clearing an already-empty ring is a no-op.
        ring.clear();
        assert!(ring.is_empty());

        // Indices reset: the ring fills and drains normally afterwards.
        for tag in 0..3 {
            ring.write(record(tag));
        }
        assert_eq!(tag_of(&ring.read().unwrap()), 0);
    }

    #[test]
    fn interleaved_reads_and_writes() {
        let ring = NalRing::new();
        // A 1:1 interleave never fills the ring, so nothing is dropped and
        // the indices wrap cleanly past the capacity.
        for tag in 0..16 {
            ring.write(record(tag));
            assert_eq!(tag_of(&ring.read().unwrap()), tag);
        }
        assert!(ring.is_empty());

        // A writer burst with no reader keeps only the newest CAPACITY.
        for tag in 16..32 {
            ring.write(record(tag));
        }
        let drained: Vec<u8> = std::iter::from_fn(|| ring.read().map(|r| tag_of(&r))).collect();
        assert_eq!(drained, vec![24, 25, 26, 27, 28, 29, 30, 31]);
    }

    #[test]
    fn mutex_guarded_counter_is_exact() {
        // Sanity check of the locking discipline the ring relies on:
        // four threads, ten thousand increments each.
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock().unwrap() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 40_000);
    }

    #[test]
    fn concurrent_writers_never_exceed_capacity() {
        let ring = Arc::new(NalRing::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for tag in 0..1_000 {
                    ring.write(record(tag as u8));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        let drained: Vec<NalRecord> = std::iter::from_fn(|| ring.read()).collect();
        assert_eq!(drained.len(), RING_CAPACITY);
    }
}
