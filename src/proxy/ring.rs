//! SPSC ring of sample buffers between the proxy worker and the engine.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::SampleBuffer;

/// Default number of buffer slots per ring.
pub const DEFAULT_SLOTS: usize = 32;

/// Which way data travels through a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    /// Proxy worker produces (fills from a source), engine consumes.
    Read,
    /// Engine produces, proxy worker consumes (drains to a sink).
    Write,
}

/// A single-producer/single-consumer ring of pre-allocated sample buffers.
///
/// Each slot holds one period. The producer fills the slot in place via
/// [`writable_slot`](Self::writable_slot) and publishes it with
/// [`advance_write`](Self::advance_write); the consumer reads via
/// [`readable_slot`](Self::readable_slot) and releases with
/// [`advance_read`](Self::advance_read). Indices are monotonic counters;
/// advances store with `Release` and observations load with `Acquire`, so a
/// published slot's contents are visible to the consumer before the index
/// moves.
///
/// # SPSC contract
///
/// Exactly one thread may call the producer methods and exactly one thread
/// the consumer methods at any time. For a `Read` ring the proxy worker is
/// the producer and the engine the consumer; for a `Write` ring the roles
/// swap. [`flush`](Self::flush) breaks the in-place rule and must only be
/// called while neither side is active (the engine is stopped between
/// ticks and the worker idle).
pub struct ProxyRing {
    slots: Vec<UnsafeCell<SampleBuffer>>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    finished: AtomicBool,
    direction: RingDirection,
}

// One producer and one consumer touch disjoint slots: a slot is writable
// only while `write_pos - read_pos < capacity` and readable only while
// `write_pos - read_pos > 0`, and the Release/Acquire pairing on the index
// counters orders the slot accesses.
unsafe impl Sync for ProxyRing {}

impl ProxyRing {
    /// Creates a ring of `slots` buffers of the given shape.
    pub fn new(
        direction: RingDirection,
        slots: usize,
        channels: usize,
        frames: usize,
        sample_rate: u32,
    ) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots)
                .map(|_| UnsafeCell::new(SampleBuffer::new(channels, frames, sample_rate)))
                .collect(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            direction,
        }
    }

    /// The data direction of this ring.
    pub fn direction(&self) -> RingDirection {
        self.direction
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn occupancy(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Slots the producer may still fill.
    pub fn write_space(&self) -> usize {
        self.capacity() - self.occupancy()
    }

    /// Slots the consumer may still drain.
    pub fn read_space(&self) -> usize {
        self.occupancy()
    }

    /// The next slot to fill.
    ///
    /// Producer-side only; the caller must have observed `write_space() > 0`.
    #[allow(clippy::mut_from_ref)]
    pub fn writable_slot(&self) -> &mut SampleBuffer {
        debug_assert!(self.write_space() > 0, "ring overrun");
        let pos = self.write_pos.load(Ordering::Relaxed);
        let index = pos % self.slots.len();
        // Sole producer, and the slot is outside the readable window.
        unsafe { &mut *self.slots[index].get() }
    }

    /// Publishes the slot filled via `writable_slot`.
    pub fn advance_write(&self) {
        let pos = self.write_pos.load(Ordering::Relaxed);
        self.write_pos.store(pos.wrapping_add(1), Ordering::Release);
    }

    /// The next slot to drain.
    ///
    /// Consumer-side only; the caller must have observed `read_space() > 0`.
    pub fn readable_slot(&self) -> &SampleBuffer {
        debug_assert!(self.read_space() > 0, "ring underrun");
        let pos = self.read_pos.load(Ordering::Relaxed);
        let index = pos % self.slots.len();
        // Sole consumer, and the slot is inside the readable window.
        unsafe { &*self.slots[index].get() }
    }

    /// Releases the slot obtained via `readable_slot`.
    pub fn advance_read(&self) {
        let pos = self.read_pos.load(Ordering::Relaxed);
        self.read_pos.store(pos.wrapping_add(1), Ordering::Release);
    }

    /// Marks the stream behind this ring exhausted. The producer stops
    /// after this; already-published slots remain readable.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether the producing side has marked the stream exhausted.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Discards all queued slots and clears the finished flag.
    ///
    /// Used on seek. Both indices are reset, so this must only run while
    /// neither the producer nor the consumer is touching the ring.
    pub fn flush(&self) {
        self.read_pos.store(0, Ordering::SeqCst);
        self.write_pos.store(0, Ordering::SeqCst);
        self.finished.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn test_ring(slots: usize) -> Arc<ProxyRing> {
        Arc::new(ProxyRing::new(RingDirection::Read, slots, 1, 4, 44100))
    }

    #[test]
    fn test_empty_and_full_accounting() {
        let ring = test_ring(4);
        assert_eq!(ring.write_space(), 4);
        assert_eq!(ring.read_space(), 0);

        for _ in 0..4 {
            ring.writable_slot().channel_mut(0).fill(0.0);
            ring.advance_write();
        }
        assert_eq!(ring.write_space(), 0);
        assert_eq!(ring.read_space(), 4);

        ring.advance_read();
        assert_eq!(ring.write_space(), 1);
        assert_eq!(ring.read_space(), 3);
    }

    #[test]
    fn test_slot_contents_survive_round_trip() {
        let ring = test_ring(2);
        ring.writable_slot().channel_mut(0).fill(0.75);
        ring.writable_slot().set_frames(3);
        ring.advance_write();

        let slot = ring.readable_slot();
        assert_eq!(slot.frames(), 3);
        assert!(slot.channel(0).iter().all(|&s| s == 0.75));
        ring.advance_read();
    }

    #[test]
    fn test_finished_flag() {
        let ring = test_ring(2);
        assert!(!ring.is_finished());
        ring.mark_finished();
        assert!(ring.is_finished());
        ring.flush();
        assert!(!ring.is_finished());
    }

    #[test]
    fn test_flush_resets_indices() {
        let ring = test_ring(4);
        for _ in 0..3 {
            ring.advance_write();
        }
        ring.advance_read();
        ring.flush();
        assert_eq!(ring.read_space(), 0);
        assert_eq!(ring.write_space(), 4);
    }

    // Producer and consumer on separate threads: the consumer must observe
    // exactly the produced sequence, in order, regardless of interleaving.
    #[test]
    fn test_spsc_sequence_integrity() {
        const COUNT: usize = 10_000;
        let ring = test_ring(8);

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for value in 0..COUNT {
                    while ring.write_space() == 0 {
                        thread::yield_now();
                    }
                    let slot = ring.writable_slot();
                    slot.set_frames(4);
                    slot.channel_mut(0).fill(value as f32);
                    ring.advance_write();
                }
                ring.mark_finished();
            })
        };

        let mut seen = Vec::with_capacity(COUNT);
        loop {
            if ring.read_space() > 0 {
                seen.push(ring.readable_slot().channel(0)[0] as usize);
                ring.advance_read();
            } else if ring.is_finished() {
                break;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert_eq!(seen.len(), COUNT);
        for (expected, actual) in seen.iter().enumerate() {
            assert_eq!(*actual, expected);
        }
    }
}
