//! Bounded per-connection send queue
//!
//! The tick loop pushes encoded frames here and never waits; a writer task
//! drains the queue into the socket. The queue never holds more than its
//! capacity:
//! - A snapshot (full sync, broker view) supersedes every queued snapshot
//!   and delta
//! - When a slow consumer lets the queue fill up, the oldest delta is
//!   discarded and the connection is flagged for a full resync on the next
//!   tick
//! - Membership frames are dropped only when nothing else is queued, and
//!   a resync follows unless the incoming frame is itself a snapshot

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Complete state; replaces anything older that it covers
    Snapshot,
    /// Membership change
    Control,
    Delta,
}

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<(FrameKind, Frame)>,
    closed: bool,
    resync: bool,
    dropped_deltas: u64,
    dropped_control: u64,
}

#[derive(Debug, Clone)]
pub struct OutboundQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queues a frame without blocking. Returns false if the frame was not
    /// queued, either because the queue is closed or because it was a delta
    /// arriving at a full queue with no older delta to make room.
    pub fn push(&self, kind: FrameKind, frame: Frame) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }

            if kind == FrameKind::Snapshot {
                inner.frames.retain(|(queued, _)| *queued == FrameKind::Control);
            }

            if inner.frames.len() >= self.capacity {
                let victim = oldest(&inner.frames, FrameKind::Delta)
                    .or_else(|| oldest(&inner.frames, FrameKind::Snapshot));
                match victim {
                    Some(index) => {
                        inner.frames.remove(index);
                        inner.dropped_deltas += 1;
                        inner.resync = true;
                    }
                    None if kind == FrameKind::Delta => {
                        inner.dropped_deltas += 1;
                        inner.resync = true;
                        return false;
                    }
                    None => {
                        inner.frames.pop_front();
                        inner.dropped_control += 1;
                        if kind != FrameKind::Snapshot {
                            inner.resync = true;
                        }
                    }
                }
            }

            inner.frames.push_back((kind, frame));
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next frame. Returns `None` once the queue is closed
    /// and drained.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some((_, frame)) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Clears the resync flag, returning whether it was set.
    pub fn take_resync(&self) -> bool {
        std::mem::take(&mut self.inner.lock().resync)
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_deltas(&self) -> u64 {
        self.inner.lock().dropped_deltas
    }

    pub fn dropped_control(&self) -> u64 {
        self.inner.lock().dropped_control
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn oldest(frames: &VecDeque<(FrameKind, Frame)>, kind: FrameKind) -> Option<usize> {
    frames.iter().position(|(queued, _)| *queued == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq};

    fn frame(byte: u8) -> Frame {
        Arc::new(vec![byte])
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        assert!(queue.push(FrameKind::Control, frame(1)));
        assert!(queue.push(FrameKind::Delta, frame(2)));

        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), Some(frame(1)));
        drop(next);
        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), Some(frame(2)));
    }

    #[test]
    fn test_next_wakes_on_push() {
        let queue = OutboundQueue::new(4);
        let mut next = task::spawn(queue.next());

        assert_pending!(next.poll());
        queue.push(FrameKind::Delta, frame(7));
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(frame(7)));
    }

    #[test]
    fn test_full_queue_drops_oldest_delta() {
        let queue = OutboundQueue::new(3);
        queue.push(FrameKind::Control, frame(1));
        queue.push(FrameKind::Delta, frame(2));
        queue.push(FrameKind::Delta, frame(3));

        assert!(queue.push(FrameKind::Delta, frame(4)));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_deltas(), 1);
        assert!(queue.take_resync());
        assert!(!queue.take_resync());

        let mut drained = Vec::new();
        for _ in 0..3 {
            let mut next = task::spawn(queue.next());
            if let Some(frame) = assert_ready!(next.poll()) {
                drained.push(frame[0]);
            }
        }
        assert_eq!(drained, vec![1, 3, 4]);
    }

    #[test]
    fn test_delta_rejected_when_only_control_queued() {
        let queue = OutboundQueue::new(2);
        queue.push(FrameKind::Control, frame(1));
        queue.push(FrameKind::Control, frame(2));

        assert!(!queue.push(FrameKind::Delta, frame(3)));
        assert_eq!(queue.len(), 2);
        assert!(queue.take_resync());
    }

    #[test]
    fn test_control_overflow_stays_bounded() {
        let queue = OutboundQueue::new(2);
        queue.push(FrameKind::Control, frame(1));
        queue.push(FrameKind::Control, frame(2));

        assert!(queue.push(FrameKind::Control, frame(3)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_control(), 1);
        assert!(queue.take_resync());

        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), Some(frame(2)));
    }

    #[test]
    fn test_snapshot_supersedes_queued_state() {
        let queue = OutboundQueue::new(4);
        queue.push(FrameKind::Snapshot, frame(1));
        queue.push(FrameKind::Delta, frame(2));
        queue.push(FrameKind::Control, frame(3));
        queue.push(FrameKind::Delta, frame(4));

        assert!(queue.push(FrameKind::Snapshot, frame(5)));
        assert_eq!(queue.len(), 2);
        assert!(!queue.take_resync());

        let mut drained = Vec::new();
        for _ in 0..2 {
            let mut next = task::spawn(queue.next());
            if let Some(frame) = assert_ready!(next.poll()) {
                drained.push(frame[0]);
            }
        }
        assert_eq!(drained, vec![3, 5]);
    }

    #[test]
    fn test_snapshot_into_full_control_queue_needs_no_resync() {
        let queue = OutboundQueue::new(1);
        queue.push(FrameKind::Control, frame(1));

        assert!(queue.push(FrameKind::Snapshot, frame(2)));
        assert_eq!(queue.len(), 1);
        assert!(!queue.take_resync());
    }

    #[test]
    fn test_never_drained_queue_stays_within_capacity() {
        let queue = OutboundQueue::new(3);
        for i in 0..200u8 {
            let kind = match i % 4 {
                0 => FrameKind::Snapshot,
                1 => FrameKind::Control,
                _ => FrameKind::Delta,
            };
            queue.push(kind, frame(i));
            assert!(queue.len() <= queue.capacity());
        }
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(2);
        queue.push(FrameKind::Control, frame(1));
        queue.close();

        assert!(!queue.push(FrameKind::Control, frame(2)));
        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), Some(frame(1)));
        drop(next);
        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), None);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let queue = OutboundQueue::new(2);
        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());

        queue.close();
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), None);
    }
}
