//! Counters and the derived-stats snapshot exposed by the control surface.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::FrameType;

/// A point-in-time snapshot of an endpoint's counters, plus the derived
/// ratios the original C stats structs carry (`current_bitrate`,
/// `avg_frame_size`, `retrans_rate`/`loss_rate`) — cheap to compute from
/// the raw counters at snapshot time rather than tracked as extra atomics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub total_frames: u64,
    pub total_i_frames: u64,
    pub total_p_frames: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub retrans_packets: u64,
    pub lost_packets: u64,
    pub dup_packets: u64,
    pub incomplete_frames: u64,
    pub current_bitrate_bps: f64,
    pub avg_frame_size: f64,
    pub retrans_rate: f64,
    pub loss_rate: f64,
}

/// Atomic counters for one TX or RX endpoint. Every packet sent/received
/// updates these; `snapshot` is the only place ratios get computed.
#[derive(Debug)]
pub struct Stats {
    total_frames: AtomicU64,
    total_i_frames: AtomicU64,
    total_p_frames: AtomicU64,
    total_packets: AtomicU64,
    total_bytes: AtomicU64,
    retrans_packets: AtomicU64,
    lost_packets: AtomicU64,
    dup_packets: AtomicU64,
    incomplete_frames: AtomicU64,
    created_ms: u64,
}

impl Stats {
    pub fn new(created_ms: u64) -> Self {
        Self {
            total_frames: AtomicU64::new(0),
            total_i_frames: AtomicU64::new(0),
            total_p_frames: AtomicU64::new(0),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            retrans_packets: AtomicU64::new(0),
            lost_packets: AtomicU64::new(0),
            dup_packets: AtomicU64::new(0),
            incomplete_frames: AtomicU64::new(0),
            created_ms,
        }
    }

    pub fn record_packet(&self, payload_bytes: usize) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame(&self, frame_type: FrameType) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        match frame_type {
            FrameType::I => {
                self.total_i_frames.fetch_add(1, Ordering::Relaxed);
            }
            FrameType::P => {
                self.total_p_frames.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_retrans(&self) {
        self.retrans_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, n: u64) {
        self.lost_packets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dup(&self) {
        self.dup_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incomplete(&self) {
        self.incomplete_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64) -> StatsSnapshot {
        let total_frames = self.total_frames.load(Ordering::Relaxed);
        let total_packets = self.total_packets.load(Ordering::Relaxed);
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let retrans_packets = self.retrans_packets.load(Ordering::Relaxed);
        let lost_packets = self.lost_packets.load(Ordering::Relaxed);

        let elapsed_s = (now_ms.saturating_sub(self.created_ms)).max(1) as f64 / 1000.0;

        StatsSnapshot {
            total_frames,
            total_i_frames: self.total_i_frames.load(Ordering::Relaxed),
            total_p_frames: self.total_p_frames.load(Ordering::Relaxed),
            total_packets,
            total_bytes,
            retrans_packets,
            lost_packets,
            dup_packets: self.dup_packets.load(Ordering::Relaxed),
            incomplete_frames: self.incomplete_frames.load(Ordering::Relaxed),
            current_bitrate_bps: (total_bytes as f64 * 8.0) / elapsed_s,
            avg_frame_size: if total_frames > 0 {
                total_bytes as f64 / total_frames as f64
            } else {
                0.0
            },
            retrans_rate: if total_packets > 0 {
                retrans_packets as f64 / total_packets as f64
            } else {
                0.0
            },
            loss_rate: if total_packets > 0 {
                lost_packets as f64 / (total_packets + lost_packets) as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_fields_compute_from_counters() {
        let stats = Stats::new(0);
        stats.record_packet(1000);
        stats.record_packet(1000);
        stats.record_frame(FrameType::I);
        stats.record_retrans();
        stats.record_lost(1);

        let snap = stats.snapshot(1000);
        assert_eq!(snap.total_bytes, 2000);
        assert_eq!(snap.avg_frame_size, 2000.0);
        assert!((snap.current_bitrate_bps - 16000.0).abs() < 1e-6);
        assert!((snap.retrans_rate - 0.5).abs() < 1e-6);
        assert!(snap.loss_rate > 0.0);
    }

    #[test]
    fn empty_stats_have_zero_derived_fields() {
        let stats = Stats::new(0);
        let snap = stats.snapshot(1000);
        assert_eq!(snap.avg_frame_size, 0.0);
        assert_eq!(snap.retrans_rate, 0.0);
        assert_eq!(snap.loss_rate, 0.0);
    }
}
