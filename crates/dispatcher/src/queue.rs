//! Per-subscriber priority queue (`spec.md §4.D`/`§8` properties 8/9,
//! scenario S6).
//!
//! Frames are kept sorted by `(priority ascending, sequence ascending)` so
//! the lowest-priority, oldest frame is always at the front — exactly the
//! eviction candidate — and the highest-priority, oldest frame is always
//! the first item of the trailing same-priority run, found with a single
//! `partition_point`. `max_num_msg` is capped at 100 by `ServiceConfig`
//! validation, so the `Vec`-shifting insert/remove here stays cheap.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::Frame;

struct QueuedFrame {
    seq: u64,
    frame: Frame,
}

/// What happened to a frame passed to [`SubscriberQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Room existed; the frame was queued as-is.
    Enqueued,
    /// The queue was full; an older, lower-priority frame was evicted to
    /// make room for this one.
    EnqueuedAfterEviction,
    /// The queue was full and this frame was itself the lowest priority
    /// present (or tied for lowest) — dropped without enqueueing.
    Dropped,
}

pub struct SubscriberQueue {
    cap: usize,
    items: Vec<QueuedFrame>,
    next_seq: u64,
    overflow_count: AtomicU64,
}

impl SubscriberQueue {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: Vec::new(),
            next_seq: 0,
            overflow_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Index of the first item whose priority is `>= priority`, i.e. where
    /// a new item of that priority should be inserted to keep the
    /// ascending-priority, ascending-sequence order (ties go after
    /// existing same-priority items, preserving FIFO).
    fn insertion_index(&self, priority: u8) -> usize {
        self.items.partition_point(|q| q.frame.header.priority < priority)
    }

    pub fn enqueue(&mut self, frame: Frame) -> EnqueueOutcome {
        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = frame.header.priority;

        if self.items.len() < self.cap {
            let idx = self.insertion_index(priority);
            self.items.insert(idx, QueuedFrame { seq, frame });
            return EnqueueOutcome::Enqueued;
        }

        let lowest_priority = self.items[0].frame.header.priority;
        if priority <= lowest_priority {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Dropped;
        }

        self.items.remove(0);
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        let idx = self.insertion_index(priority);
        self.items.insert(idx, QueuedFrame { seq, frame });
        EnqueueOutcome::EnqueuedAfterEviction
    }

    /// Pop the next frame to deliver: highest priority, then oldest
    /// within that priority class (`spec.md §8` property 8).
    pub fn drain_next(&mut self) -> Option<Frame> {
        let max_priority = self.items.last()?.frame.header.priority;
        let idx = self.items.partition_point(|q| q.frame.header.priority < max_priority);
        Some(self.items.remove(idx).frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(priority: u8) -> Frame {
        Frame::new(1, priority, 0, Vec::new())
    }

    #[test]
    fn s6_overflow_eviction_and_priority_drain() {
        let mut q = SubscriberQueue::new(2);
        const LOW: u8 = 1;
        const HIGH: u8 = 9;

        assert_eq!(q.enqueue(frame(LOW)), EnqueueOutcome::Enqueued);
        assert_eq!(q.enqueue(frame(LOW)), EnqueueOutcome::Enqueued);
        assert_eq!(q.enqueue(frame(HIGH)), EnqueueOutcome::EnqueuedAfterEviction);

        assert_eq!(q.drain_next().unwrap().header.priority, HIGH);
        assert_eq!(q.drain_next().unwrap().header.priority, LOW);
        assert!(q.drain_next().is_none());
        assert_eq!(q.overflow_count(), 1);
    }

    #[test]
    fn arriving_lowest_priority_when_full_is_dropped_not_evicted() {
        let mut q = SubscriberQueue::new(2);
        q.enqueue(frame(5));
        q.enqueue(frame(5));
        assert_eq!(q.enqueue(frame(3)), EnqueueOutcome::Dropped);
        assert_eq!(q.len(), 2);
        assert_eq!(q.overflow_count(), 1);
    }

    #[test]
    fn fifo_within_priority_class() {
        let mut q = SubscriberQueue::new(10);
        for i in 0..4 {
            q.enqueue(Frame::new(1, 5, i, Vec::new()));
        }
        for i in 0..4 {
            assert_eq!(q.drain_next().unwrap().header.source_tag, i);
        }
    }
}
