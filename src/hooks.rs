//! Callback types invoked from the polling thread.
//!
//! The C original passes function pointers plus an opaque `userdata`; Rust
//! captures the equivalent state in a boxed closure instead. Hooks are
//! called from the poll loop and must not block or panic — a panic
//! crossing a hook boundary would unwind through code the transport needs
//! to keep running, so hooks return nothing and any error handling is the
//! caller's problem.

use crate::core::FrameType;

/// Delivers a completed media frame. `bytes` is valid only for the
/// duration of the call.
pub type OnFrame = Box<dyn FnMut(&[u8], FrameType) + Send>;

/// Delivers a USER control payload, tagged with its originating frame type
/// (always `FrameType::User`).
pub type OnData = Box<dyn FnMut(FrameType, &[u8]) + Send>;

/// Media-producer control event kind, delivered to the transmitter's
/// `on_media` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEventKind {
    Start,
    Stop,
    Disconnect,
}

/// Delivers START/STOP/DISCONNECT notifications on the transmitter side.
/// `url` is `Some` only for a well-formed `Start` payload.
pub type OnMedia = Box<dyn FnMut(MediaEventKind, Option<&str>) + Send>;

/// Delivers receiver connection transitions.
pub type OnConnect = Box<dyn FnMut(bool) + Send>;
