//! The frame object: a reusable, reference-counted buffer shared between a
//! pool, a queue, and the caller.
//!
//! A `Frame` is a thin `Arc` handle. Reference counting is exactly Rust's
//! own `Arc` strong count — no hand-rolled atomic retain/release is needed,
//! since `Arc`'s last-drop already fires `Drop` on the contents; that impl
//! is where the buffer (and any slab-allocated retransmit state) returns to
//! its pool.

use std::sync::{Arc, Mutex, Weak};

use crate::core::FrameType;
use crate::pool::frame_pool::FramePoolShared;
use crate::pool::slab::{FragDescriptor, SlabPool};

/// Lifecycle state of a frame object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLifecycle {
    /// Sitting free in a pool.
    Free,
    /// Receiver-side: fragments are still arriving.
    Receiving,
    /// Receiver-side: every fragment has arrived.
    Complete,
    /// Sender-side: emitted, awaiting ACK (protected frames only).
    Sending,
}

/// A fixed-size bitmap tracking which fragment indices have been received.
#[derive(Debug, Clone)]
pub struct FragBitmap {
    bits: Vec<bool>,
}

impl FragBitmap {
    pub fn new(total_frags: u16) -> Self {
        Self {
            bits: vec![false; total_frags as usize],
        }
    }

    /// Marks `index` received. Returns `true` if this is the first time
    /// this index was marked; marking an already-set index is a no-op that
    /// the caller counts as a duplicate.
    pub fn mark(&mut self, index: u16) -> bool {
        let slot = &mut self.bits[index as usize];
        if *slot {
            false
        } else {
            *slot = true;
            true
        }
    }

    pub fn is_set(&self, index: u16) -> bool {
        self.bits[index as usize]
    }

    pub fn total(&self) -> usize {
        self.bits.len()
    }
}

/// The mutable contents of a frame object, guarded by a single lock.
///
/// Reassembly state (receiver) and retransmit state (sender) are mutually
/// exclusive — a frame is either being received or being sent, never both.
pub struct FrameState {
    pub frame_id: u16,
    pub frame_type: Option<FrameType>,
    pub total_frags: u16,
    pub recv_frags: u16,
    /// Filled bytes; `data.capacity()` is the pool's fixed buffer size.
    pub data: Vec<u8>,
    pub reassembly: Option<FragBitmap>,
    pub retransmit: Option<Vec<FragDescriptor>>,
    pub first_recv_ms: u64,
    pub last_recv_ms: u64,
    pub send_time_ms: u64,
    pub retrans_count: u32,
    pub lifecycle: FrameLifecycle,
}

impl FrameState {
    fn fresh(data: Vec<u8>) -> Self {
        Self {
            frame_id: 0,
            frame_type: None,
            total_frags: 1,
            recv_frags: 0,
            data,
            reassembly: None,
            retransmit: None,
            first_recv_ms: 0,
            last_recv_ms: 0,
            send_time_ms: 0,
            retrans_count: 0,
            lifecycle: FrameLifecycle::Free,
        }
    }
}

struct FrameInner {
    pool: Weak<FramePoolShared>,
    slab: Weak<SlabPool>,
    state: Mutex<FrameState>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        let data = std::mem::take(&mut state.data);
        let retransmit = state.retransmit.take();
        state.reassembly = None;
        state.lifecycle = FrameLifecycle::Free;
        state.recv_frags = 0;
        state.retrans_count = 0;
        drop(state);

        if let Some(pool) = self.pool.upgrade() {
            pool.release_buffer(data);
        }
        if let Some(descriptors) = retransmit {
            if let Some(slab) = self.slab.upgrade() {
                slab.release(descriptors);
            }
        }
    }
}

/// A reference-counted handle to a pooled frame buffer.
///
/// Cloning a `Frame` retains it: it bumps the underlying `Arc` strong
/// count. Dropping the last clone returns the buffer (and any retransmit
/// descriptors) to their pools.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    pub(crate) fn new(data: Vec<u8>, pool: Weak<FramePoolShared>, slab: Weak<SlabPool>) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                pool,
                slab,
                state: Mutex::new(FrameState::fresh(data)),
            }),
        }
    }

    /// Current strong reference count. Debug/test use only.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FrameState> {
        self.inner.state.lock().unwrap()
    }

    /// Identity equality: same underlying allocation.
    pub fn is_same(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Frame")
            .field("frame_id", &state.frame_id)
            .field("frame_type", &state.frame_type)
            .field("total_frags", &state.total_frags)
            .field("recv_frags", &state.recv_frags)
            .field("lifecycle", &state.lifecycle)
            .field("refcount", &self.refcount())
            .finish()
    }
}
