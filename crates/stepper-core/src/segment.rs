//! The segment ring buffer and block data pool.
//!
//! A [`SegmentBuffer`] is the single shared object between the foreground
//! segment preparer and the step interrupt. [`SegmentBuffer::split`] hands
//! out exactly one [`SegmentProducer`] and one [`SegmentConsumer`]; the
//! producer stages segments and block data, the consumer executes them.
//!
//! ## Safety
//!
//! - The ring is single-producer single-consumer. The producer owns `head`,
//!   the consumer owns `tail`. A slot is written only while it is outside
//!   the published window `[tail, head)`, and published with a release
//!   store so the payload is visible before the index moves; the consumer
//!   pairs it with an acquire load.
//! - The consumer holds the tail slot (via [`SegmentConsumer::peek`]) for
//!   as long as the segment is executing and only then calls
//!   [`SegmentConsumer::finish`]. Because at most `SEGMENT_BUFFER_SIZE - 1`
//!   segments are ever live and block entries are allocated round-robin
//!   from a pool of the same size, a newly staged block entry can never
//!   overwrite one that a live segment still references. That structural
//!   argument is what makes [`SegmentConsumer::block`] safe and is the
//!   contract behind the `unsafe` on [`SegmentProducer::store_block`].
//!
//! ## Performance
//!
//! The consumer side runs inside the step interrupt: `peek`, `finish`, and
//! `block` are a handful of loads and one store, with no locks and no
//! allocation.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{BLOCK_POOL_SIZE, N_AXIS, SEGMENT_BUFFER_SIZE};

/// Bresenham stepping data for one planner block, shared by every segment
/// sliced from that block. Step counts arrive pre-multiplied by
/// `2^MAX_AMASS_LEVEL` so segments can divide them for smoothing without
/// truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct StepperBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    /// One bit per axis, set for negative travel.
    pub direction_bits: u8,
    /// Spindle PWM must track the realtime feed rate over this block.
    pub is_pwm_rate_adjusted: bool,
}

impl StepperBlock {
    pub const EMPTY: Self = Self {
        steps: [0; N_AXIS],
        step_event_count: 0,
        direction_bits: 0,
        is_pwm_rate_adjusted: false,
    };
}

/// A constant-rate slice of a block, ready to execute pulse for pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    /// Pulses to deliver, in smoothed ticks.
    pub n_step: u16,
    /// Timer reload for this segment's tick rate.
    pub cycles_per_tick: u16,
    /// Index of the owning entry in the block pool.
    pub st_block_index: u8,
    /// Smoothing level: per-tick increments are the block counts shifted
    /// right by this amount.
    pub amass_level: u8,
    /// Spindle PWM to apply when this segment begins.
    pub spindle_pwm: u16,
    /// Pulses are emitted but the position counters must not advance.
    pub backlash_motion: bool,
}

impl Segment {
    pub const EMPTY: Self = Self {
        n_step: 0,
        cycles_per_tick: 0,
        st_block_index: 0,
        amass_level: 0,
        spindle_pwm: 0,
        backlash_motion: false,
    };
}

/// Fused segment ring and block pool. Construct one (typically `static`),
/// then [`split`](Self::split) it into the two endpoint handles.
pub struct SegmentBuffer {
    segments: [UnsafeCell<Segment>; SEGMENT_BUFFER_SIZE],
    blocks: [UnsafeCell<StepperBlock>; BLOCK_POOL_SIZE],
    /// Next slot the producer will fill.
    head: AtomicUsize,
    /// Slot being executed / next to execute.
    tail: AtomicUsize,
}

// The interior cells are only reached through the producer/consumer
// protocol documented above.
unsafe impl Sync for SegmentBuffer {}

impl SegmentBuffer {
    pub const fn new() -> Self {
        const SEG: UnsafeCell<Segment> = UnsafeCell::new(Segment::EMPTY);
        const BLK: UnsafeCell<StepperBlock> = UnsafeCell::new(StepperBlock::EMPTY);
        Self {
            segments: [SEG; SEGMENT_BUFFER_SIZE],
            blocks: [BLK; BLOCK_POOL_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Split into the producer and consumer endpoints. The `&mut` receiver
    /// guarantees no other handles exist at that point.
    pub fn split(&mut self) -> (SegmentProducer<'_>, SegmentConsumer<'_>) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        (SegmentProducer { buffer: self }, SegmentConsumer { buffer: self })
    }
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn next_index(index: usize) -> usize {
    if index + 1 == SEGMENT_BUFFER_SIZE {
        0
    } else {
        index + 1
    }
}

/// Advance a block-pool index, wrapping at the pool size.
#[inline]
pub fn next_block_index(index: u8) -> u8 {
    if index as usize + 1 == BLOCK_POOL_SIZE {
        0
    } else {
        index + 1
    }
}

/// Foreground endpoint: stages block data and publishes segments.
pub struct SegmentProducer<'a> {
    buffer: &'a SegmentBuffer,
}

impl SegmentProducer<'_> {
    pub fn is_full(&self) -> bool {
        let head = self.buffer.head.load(Ordering::Relaxed);
        next_index(head) == self.buffer.tail.load(Ordering::Acquire)
    }

    /// Publish a segment. Returns the segment back on a full ring.
    pub fn push(&mut self, segment: Segment) -> Result<(), Segment> {
        let head = self.buffer.head.load(Ordering::Relaxed);
        let next = next_index(head);
        if next == self.buffer.tail.load(Ordering::Acquire) {
            return Err(segment);
        }
        // SAFETY: `head` is outside the published window, so the consumer
        // does not read this slot until the release store below.
        unsafe { *self.buffer.segments[head].get() = segment };
        self.buffer.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Stage the block data a following segment will reference.
    ///
    /// # Safety
    ///
    /// No segment referencing `index` may be live — neither queued in the
    /// ring nor still executing. Allocating indices with
    /// [`next_block_index`] and only when loading a fresh planner block
    /// upholds this, because the pool holds one more entry than the maximum
    /// number of distinct blocks the ring can reference.
    pub unsafe fn store_block(&mut self, index: usize, block: StepperBlock) {
        *self.buffer.blocks[index].get() = block;
    }
}

/// Interrupt endpoint: reads segments in FIFO order and retires them.
pub struct SegmentConsumer<'a> {
    buffer: &'a SegmentBuffer,
}

impl SegmentConsumer<'_> {
    pub fn is_empty(&self) -> bool {
        self.buffer.head.load(Ordering::Acquire) == self.buffer.tail.load(Ordering::Relaxed)
    }

    /// The segment at the tail, without retiring it. The slot stays
    /// occupied (and its block entry protected) until [`finish`] is called.
    ///
    /// [`finish`]: Self::finish
    pub fn peek(&self) -> Option<Segment> {
        let tail = self.buffer.tail.load(Ordering::Relaxed);
        if tail == self.buffer.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the slot is inside the published window; the producer
        // does not rewrite it until `tail` moves past it.
        Some(unsafe { *self.buffer.segments[tail].get() })
    }

    /// Retire the tail segment after its last pulse, freeing the slot for
    /// the producer. Must follow a successful [`peek`](Self::peek).
    pub fn finish(&mut self) {
        let tail = self.buffer.tail.load(Ordering::Relaxed);
        debug_assert!(tail != self.buffer.head.load(Ordering::Acquire));
        self.buffer.tail.store(next_index(tail), Ordering::Release);
    }

    /// Copy out the block data referenced by a segment.
    pub fn block(&self, index: u8) -> StepperBlock {
        // SAFETY: the producer only rewrites a pool entry once no live
        // segment references it; a consumer holding a segment that names
        // `index` therefore never races this read.
        unsafe { *self.buffer.blocks[index as usize].get() }
    }
}

/// Drop every queued segment. Only call while the execution engine is
/// stopped; both endpoints are required precisely so no interrupt can be
/// concurrently inside the ring.
pub fn clear_segment_buffer(producer: &mut SegmentProducer<'_>, consumer: &mut SegmentConsumer<'_>) {
    debug_assert!(core::ptr::eq(producer.buffer, consumer.buffer));
    producer.buffer.head.store(0, Ordering::SeqCst);
    consumer.buffer.tail.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(n: u16) -> Segment {
        Segment {
            n_step: n,
            cycles_per_tick: 1000,
            ..Segment::EMPTY
        }
    }

    #[test]
    fn segments_come_out_in_fifo_order() {
        let mut buffer = SegmentBuffer::new();
        let (mut producer, mut consumer) = buffer.split();

        for n in 1..=4 {
            producer.push(segment(n)).unwrap();
        }
        for n in 1..=4 {
            assert_eq!(consumer.peek().unwrap().n_step, n);
            consumer.finish();
        }
        assert!(consumer.peek().is_none());
    }

    #[test]
    fn ring_keeps_one_slot_open() {
        let mut buffer = SegmentBuffer::new();
        let (mut producer, mut consumer) = buffer.split();

        for n in 0..(SEGMENT_BUFFER_SIZE - 1) as u16 {
            assert!(!producer.is_full());
            producer.push(segment(n + 1)).unwrap();
        }
        assert!(producer.is_full());
        assert!(producer.push(segment(99)).is_err());

        // Retiring one segment reopens exactly one slot.
        consumer.peek().unwrap();
        consumer.finish();
        assert!(!producer.is_full());
        producer.push(segment(99)).unwrap();
        assert!(producer.is_full());
    }

    #[test]
    fn block_pool_roundtrip() {
        let mut buffer = SegmentBuffer::new();
        let (mut producer, consumer) = buffer.split();

        let block = StepperBlock {
            steps: [800, 24, 0],
            step_event_count: 800,
            direction_bits: 0b010,
            is_pwm_rate_adjusted: true,
        };
        unsafe { producer.store_block(2, block) };
        assert_eq!(consumer.block(2), block);
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut buffer = SegmentBuffer::new();
        let (mut producer, mut consumer) = buffer.split();
        producer.push(segment(1)).unwrap();
        producer.push(segment(2)).unwrap();
        clear_segment_buffer(&mut producer, &mut consumer);
        assert!(consumer.is_empty());
        assert!(!producer.is_full());
    }

    #[test]
    fn block_indices_wrap_at_pool_size() {
        let mut index = 0u8;
        for _ in 0..BLOCK_POOL_SIZE {
            index = next_block_index(index);
        }
        assert_eq!(index, 0);
    }
}
