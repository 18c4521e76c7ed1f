//! Bidirectional real-time video transport over UDP with selective ARQ.
//!
//! Key frames (I/SPS/PPS) and reliable control (USER) data are protected by
//! per-fragment retransmission; predicted frames (P) and audio (A) are
//! fire-and-forget. [`transmitter::Transmitter`] is the server-side
//! endpoint that streams media to one client; [`receiver::Receiver`] is the
//! client-side endpoint that reassembles it.

pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod frame;
pub mod hooks;
pub mod net;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod runtime;
pub mod stats;
pub mod transmitter;

pub use config::Config;
pub use core::{FrameType, HEADER_SIZE, MAX_FRAGMENTS};
pub use error::{Error, Result};
pub use frame::Frame;
pub use hooks::{MediaEventKind, OnConnect, OnData, OnFrame, OnMedia};
pub use receiver::{Receiver, RxState};
pub use stats::{Stats, StatsSnapshot};
pub use transmitter::{Transmitter, TxState};
