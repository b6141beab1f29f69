//! Lock-free SPSC ring of fixed-size frames
//!
//! Bridges the decode thread (producer) and the renderer (consumer) without
//! blocking either side. One frame is `bars` consecutive f32 values; frames
//! are published and consumed whole.
//!
//! Index protocol: `head` is the next slot the producer writes, `tail` the
//! next slot the consumer reads, both stored already wrapped to the
//! power-of-two capacity. `head == tail` means empty; the producer never
//! advances `head` onto `tail`, so full is detected before writing and the
//! incoming frame is dropped, never a buffered one. The producer publishes a
//! slot with a release store of `head` after writing its contents; the
//! consumer's acquire load of `head` therefore never observes a partially
//! written frame. Symmetrically, `tail` is released by the consumer and
//! acquired by the producer's full-check, so a slot is never overwritten
//! while it is still being read.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome of a non-blocking pop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopResult {
    /// A frame was copied into the caller's buffer
    Popped,
    /// Nothing buffered; the caller's buffer is untouched
    Empty,
}

struct FrameRing {
    /// `capacity * bars` values, slot-addressed through head/tail
    slots: Box<[UnsafeCell<f32>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    mask: usize,
    bars: usize,
}

// SAFETY: slot access is mediated by the head/tail protocol documented
// above. The producer writes only the unpublished slot at `head`; the
// consumer reads only slots the producer has released. `frame_ring_pair` is
// the sole constructor and hands out exactly one producer and one consumer,
// so the single-producer/single-consumer discipline is enforced by
// ownership.
unsafe impl Sync for FrameRing {}

impl FrameRing {
    fn slot_count(&self) -> usize {
        self.mask + 1
    }
}

/// Create a connected producer/consumer pair.
///
/// `capacity_hint` is clamped to at least 2 and rounded up to the next power
/// of two, keeping index wraparound a bitmask instead of a modulo. One slot
/// always stays open to tell full from empty, so a capacity of 2 still
/// buffers one whole frame.
pub fn frame_ring_pair(capacity_hint: usize, bars: usize) -> (FrameProducer, FrameConsumer) {
    assert!(bars > 0, "frames must carry at least one bar");
    let capacity = capacity_hint.max(2).next_power_of_two();
    let ring = Arc::new(FrameRing {
        slots: (0..capacity * bars).map(|_| UnsafeCell::new(0.0)).collect(),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        mask: capacity - 1,
        bars,
    });
    (
        FrameProducer {
            ring: Arc::clone(&ring),
        },
        FrameConsumer { ring },
    )
}

/// Producer half; owned by the decode thread
pub struct FrameProducer {
    ring: Arc<FrameRing>,
}

impl FrameProducer {
    /// Publish one frame without blocking.
    ///
    /// Returns false when the buffer is full: the incoming frame is
    /// discarded and the buffered frames keep their order. `frame` must hold
    /// exactly `bars` values.
    pub fn try_publish(&mut self, frame: &[f32]) -> bool {
        let ring = &*self.ring;
        assert_eq!(
            frame.len(),
            ring.bars,
            "published frame length must equal bars-per-frame"
        );

        let head = ring.head.load(Ordering::Relaxed);
        let next = (head + 1) & ring.mask;
        if next == ring.tail.load(Ordering::Acquire) {
            return false;
        }

        let base = head * ring.bars;
        for (offset, &value) in frame.iter().enumerate() {
            // SAFETY: slot `head` is unpublished, so the consumer cannot be
            // reading it; we are the only producer.
            unsafe { *ring.slots[base + offset].get() = value };
        }
        ring.head.store(next, Ordering::Release);
        true
    }

    /// Effective slot capacity after rounding
    pub fn capacity(&self) -> usize {
        self.ring.slot_count()
    }

    pub fn bars(&self) -> usize {
        self.ring.bars
    }
}

/// Consumer half; owned by the polling renderer side
pub struct FrameConsumer {
    ring: Arc<FrameRing>,
}

impl FrameConsumer {
    /// Copy the oldest buffered frame into `out` without blocking.
    ///
    /// `out` must hold at least `bars` values; only the first `bars` entries
    /// are written. Never allocates.
    pub fn try_pop(&mut self, out: &mut [f32]) -> PopResult {
        let ring = &*self.ring;
        assert!(
            out.len() >= ring.bars,
            "pop buffer must hold at least bars-per-frame values"
        );

        let tail = ring.tail.load(Ordering::Relaxed);
        if tail == ring.head.load(Ordering::Acquire) {
            return PopResult::Empty;
        }

        let base = tail * ring.bars;
        for (offset, value) in out[..ring.bars].iter_mut().enumerate() {
            // SAFETY: the acquire load of `head` ordered this read after the
            // producer's writes to the slot, and the producer will not reuse
            // it until `tail` is released past it below.
            unsafe { *value = *ring.slots[base + offset].get() };
        }
        ring.tail.store((tail + 1) & ring.mask, Ordering::Release);
        PopResult::Popped
    }

    /// Frames currently buffered
    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        ring.head
            .load(Ordering::Acquire)
            .wrapping_sub(ring.tail.load(Ordering::Relaxed))
            & ring.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective slot capacity after rounding
    pub fn capacity(&self) -> usize {
        self.ring.slot_count()
    }

    pub fn bars(&self) -> usize {
        self.ring.bars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounding() {
        for (hint, expected) in [(0, 2), (1, 2), (2, 2), (3, 4), (5, 8), (16, 16), (17, 32)] {
            let (producer, _consumer) = frame_ring_pair(hint, 4);
            assert_eq!(producer.capacity(), expected, "hint {}", hint);
        }
    }

    #[test]
    fn test_pop_empty() {
        let (_producer, mut consumer) = frame_ring_pair(4, 2);
        let mut out = [0.0; 2];
        assert_eq!(consumer.try_pop(&mut out), PopResult::Empty);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_publish_then_pop() {
        let (mut producer, mut consumer) = frame_ring_pair(4, 3);
        assert!(producer.try_publish(&[0.1, 0.2, 0.3]));
        assert_eq!(consumer.len(), 1);

        let mut out = [0.0; 3];
        assert_eq!(consumer.try_pop(&mut out), PopResult::Popped);
        assert_eq!(out, [0.1, 0.2, 0.3]);
        assert_eq!(consumer.try_pop(&mut out), PopResult::Empty);
    }

    #[test]
    fn test_full_drops_incoming_and_preserves_buffered() {
        // Capacity 4 means 3 usable slots
        let (mut producer, mut consumer) = frame_ring_pair(4, 1);
        assert!(producer.try_publish(&[0.1]));
        assert!(producer.try_publish(&[0.2]));
        assert!(producer.try_publish(&[0.3]));

        // Full: the new frame is the one that goes missing
        assert!(!producer.try_publish(&[0.9]));
        assert!(!producer.try_publish(&[0.9]));
        assert_eq!(consumer.len(), 3);

        let mut out = [0.0; 1];
        for expected in [0.1, 0.2, 0.3] {
            assert_eq!(consumer.try_pop(&mut out), PopResult::Popped);
            assert_eq!(out[0], expected);
        }
        assert_eq!(consumer.try_pop(&mut out), PopResult::Empty);
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let (mut producer, mut consumer) = frame_ring_pair(4, 1);
        let mut out = [0.0; 1];
        // Cycle well past the capacity so head and tail wrap several times
        for round in 0..20 {
            let value = round as f32 / 20.0;
            assert!(producer.try_publish(&[value]));
            assert_eq!(consumer.try_pop(&mut out), PopResult::Popped);
            assert_eq!(out[0], value);
        }
    }

    #[test]
    fn test_threaded_producer_consumer_preserves_order() {
        const FRAMES: usize = 10_000;

        let (mut producer, mut consumer) = frame_ring_pair(8, 2);
        let handle = std::thread::spawn(move || {
            for seq in 0..FRAMES {
                let frame = [seq as f32, (FRAMES - seq) as f32];
                // Spin until published so the test sees every frame exactly once
                while !producer.try_publish(&frame) {
                    std::hint::spin_loop();
                }
            }
        });

        let mut out = [0.0; 2];
        let mut next = 0usize;
        while next < FRAMES {
            if consumer.try_pop(&mut out) == PopResult::Popped {
                assert_eq!(out[0], next as f32, "frames reordered or duplicated");
                assert_eq!(out[1], (FRAMES - next) as f32, "frame torn");
                next += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        assert_eq!(consumer.try_pop(&mut out), PopResult::Empty);
        handle.join().unwrap();
    }
}
