//! Thread-safe, insertion-ordered frame queues: the receiver's reassembly
//! queue and the sender's reliable-control queue share the same shape, just
//! different timeout policies.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::frame::Frame;

/// An ordered list of frames keyed by `frame_id`, serialized by a single
/// lock. `push` retains the frame (clones the `Arc`); `pop_head` hands
/// ownership to the caller without adjusting the count; `remove` releases
/// the queue's retain.
pub struct FrameQueue {
    entries: Mutex<VecDeque<Frame>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_tail(&self, frame: Frame) {
        self.entries.lock().unwrap().push_back(frame);
    }

    pub fn pop_head(&self) -> Option<Frame> {
        self.entries.lock().unwrap().pop_front()
    }

    /// Linear scan for a frame by id; returns a retained clone so the
    /// caller can inspect/mutate it without racing a concurrent `remove`.
    pub fn find_by_frame_id(&self, frame_id: u16) -> Option<Frame> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.lock().frame_id == frame_id)
            .cloned()
    }

    /// Removes the frame with `frame_id`, releasing the queue's retain.
    pub fn remove(&self, frame_id: u16) -> Option<Frame> {
        let mut entries = self.entries.lock().unwrap();
        let idx = entries.iter().position(|f| f.lock().frame_id == frame_id)?;
        entries.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the queue and releases every frame whose `first_recv_ms` is
    /// older than `now_ms - timeout_ms`, returning the reaped frames so the
    /// caller can count them (e.g. as incomplete).
    pub fn reap_timeouts(&self, now_ms: u64, timeout_ms: u64) -> Vec<Frame> {
        let mut entries = self.entries.lock().unwrap();
        let cutoff = now_ms.saturating_sub(timeout_ms);
        let mut reaped = Vec::new();
        entries.retain(|f| {
            let expired = f.lock().first_recv_ms < cutoff;
            if expired {
                reaped.push(f.clone());
            }
            !expired
        });
        reaped
    }

    /// Walks the queue and releases every frame whose `send_time_ms` is
    /// older than `now_ms - timeout_ms` AND whose `retrans_count` has
    /// reached `max_retrans` — the sender's reliable-control drop rule.
    pub fn drop_exhausted(&self, max_retrans: u32) -> Vec<Frame> {
        let mut entries = self.entries.lock().unwrap();
        let mut dropped = Vec::new();
        entries.retain(|f| {
            let exhausted = f.lock().retrans_count >= max_retrans;
            if exhausted {
                dropped.push(f.clone());
            }
            !exhausted
        });
        dropped
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::frame_pool::FramePool;

    fn frame_with_id(pool: &FramePool, id: u16) -> Frame {
        let frame = pool.acquire().unwrap();
        frame.lock().frame_id = id;
        frame
    }

    #[test]
    fn push_find_remove() {
        let pool = FramePool::new(64, 4);
        let queue = FrameQueue::new();
        queue.push_tail(frame_with_id(&pool, 1));
        queue.push_tail(frame_with_id(&pool, 2));

        assert!(queue.find_by_frame_id(2).is_some());
        assert!(queue.find_by_frame_id(3).is_none());

        let removed = queue.remove(1).unwrap();
        assert_eq!(removed.lock().frame_id, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_head_is_fifo_and_leaves_refcount_alone() {
        let pool = FramePool::new(64, 4);
        let queue = FrameQueue::new();
        queue.push_tail(frame_with_id(&pool, 1));
        queue.push_tail(frame_with_id(&pool, 2));

        let first = queue.pop_head().unwrap();
        assert_eq!(first.lock().frame_id, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reap_timeouts_evicts_old_entries() {
        let pool = FramePool::new(64, 4);
        let queue = FrameQueue::new();
        let frame = frame_with_id(&pool, 1);
        frame.lock().first_recv_ms = 0;
        queue.push_tail(frame);

        let reaped = queue.reap_timeouts(200, 100);
        assert_eq!(reaped.len(), 1);
        assert!(queue.is_empty());
    }
}
