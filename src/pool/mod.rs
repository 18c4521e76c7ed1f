//! Memory pools backing the allocation-free hot path: fixed-capacity frame
//! buffers and fragment-descriptor slabs.

pub mod frame_pool;
pub mod slab;

pub use frame_pool::{FramePool, PoolStats};
pub use slab::{FragDescriptor, SlabPool};
