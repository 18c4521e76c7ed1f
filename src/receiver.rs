//! Receiver state machine: client-side handshake, media reassembly with
//! per-fragment ACK for I frames, reliable control, heartbeat emission and
//! liveness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::packet::{self, PacketHeader, FLAG_LAST_FRAG, FLAG_RETRANS};
use crate::core::FrameType;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameLifecycle, FragBitmap};
use crate::hooks::{OnConnect, OnData, OnFrame};
use crate::net::UdpTransport;
use crate::pool::FramePool;
use crate::queue::FrameQueue;
use crate::stats::{Stats, StatsSnapshot};

/// Fixed handshake deadline; unlike the timeout/retry knobs this is not
/// caller-configurable.
const HANDSHAKE_DEADLINE_MS: u64 = 5_000;

/// Receiver connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    Connecting,
    Connected,
    Closing,
}

/// Client-side endpoint: connects to one server, reassembles the incoming
/// media stream, and exchanges a reliable control channel.
pub struct Receiver {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    socket: UdpTransport,

    media_pool: FramePool,
    control_pool: FramePool,
    reassembly_queue: FrameQueue,
    reliable_queue: FrameQueue,

    state: Mutex<RxState>,
    server_addr: Mutex<Option<SocketAddr>>,
    handshake_start_ms: AtomicU64,

    last_recv_seq: Mutex<Option<u32>>,
    last_i_frame: Mutex<Option<Frame>>,

    local_seq: AtomicU32,
    next_frame_id: std::sync::atomic::AtomicU16,
    last_heartbeat_emit_ms: AtomicU64,
    last_heartbeat_ack_ms: AtomicU64,

    stats: Stats,
    on_frame: Mutex<Option<OnFrame>>,
    on_data: Mutex<Option<OnData>>,
    on_connect: Mutex<Option<OnConnect>>,
}

impl Receiver {
    /// Binds the local socket and constructs a fresh, disconnected
    /// receiver. Call [`Receiver::connect`] to start the handshake.
    pub fn new(
        bind_addr: SocketAddr,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        on_frame: Option<OnFrame>,
        on_data: Option<OnData>,
        on_connect: Option<OnConnect>,
    ) -> Result<Self> {
        let socket = UdpTransport::bind(bind_addr, config.socket_buf_bytes(), config.drop_rate())?;
        let now = clock.now_ms();

        Ok(Self {
            config,
            clock,
            socket,
            media_pool: FramePool::media(),
            control_pool: FramePool::control(),
            reassembly_queue: FrameQueue::new(),
            reliable_queue: FrameQueue::new(),
            state: Mutex::new(RxState::Idle),
            server_addr: Mutex::new(None),
            handshake_start_ms: AtomicU64::new(0),
            last_recv_seq: Mutex::new(None),
            last_i_frame: Mutex::new(None),
            local_seq: AtomicU32::new(0),
            next_frame_id: std::sync::atomic::AtomicU16::new(1),
            last_heartbeat_emit_ms: AtomicU64::new(now),
            last_heartbeat_ack_ms: AtomicU64::new(now),
            stats: Stats::new(now),
            on_frame: Mutex::new(on_frame),
            on_data: Mutex::new(on_data),
            on_connect: Mutex::new(on_connect),
        })
    }

    pub fn state(&self) -> RxState {
        *self.state.lock().unwrap()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.clock.now_ms())
    }

    fn next_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn next_frame_id(&self) -> u16 {
        loop {
            let id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    fn send_raw(&self, addr: SocketAddr, frame_id: u16, frame_type: FrameType, frag_index: u16, retrans: bool) -> Result<()> {
        let mut flags = FLAG_LAST_FRAG;
        if retrans {
            flags |= FLAG_RETRANS;
        }
        let header = PacketHeader {
            seq_num: self.next_seq(),
            frame_id,
            frame_type,
            flags,
            frag_index,
            total_frags: 1,
            payload_size: 0,
        };
        let mut buf = Vec::new();
        packet::encode(&header, &[], &mut buf)?;
        self.socket.send_to(&buf, addr)?;
        self.stats.record_packet(0);
        Ok(())
    }

    /// Begins the three-way handshake against `server_addr`.
    pub fn connect(&self, server_addr: SocketAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != RxState::Idle {
            return Err(Error::NotReady);
        }
        *self.server_addr.lock().unwrap() = Some(server_addr);
        *state = RxState::Connecting;
        let now = self.clock.now_ms();
        self.handshake_start_ms.store(now, Ordering::SeqCst);
        drop(state);
        self.send_raw(server_addr, 0, FrameType::Connect, 0, false)
    }

    /// Sends a reliable control (USER) frame, at most 128 bytes.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.state() != RxState::Connected {
            return Err(Error::NotReady);
        }
        if bytes.len() > crate::pool::frame_pool::CONTROL_FRAME_CAPACITY {
            return Err(Error::InvalidParam);
        }
        let addr = self.server_addr.lock().unwrap().ok_or(Error::Disconnected)?;
        let frame_id = self.next_frame_id();
        let now = self.clock.now_ms();

        let frame = self.control_pool.acquire()?;
        {
            let mut state = frame.lock();
            state.frame_id = frame_id;
            state.frame_type = Some(FrameType::User);
            state.total_frags = 1;
            state.data = bytes.to_vec();
            state.send_time_ms = now;
            state.retrans_count = 0;
            state.lifecycle = FrameLifecycle::Sending;
        }

        let header = PacketHeader {
            seq_num: self.next_seq(),
            frame_id,
            frame_type: FrameType::User,
            flags: FLAG_LAST_FRAG,
            frag_index: 0,
            total_frags: 1,
            payload_size: bytes.len() as u16,
        };
        let mut buf = Vec::new();
        packet::encode(&header, bytes, &mut buf)?;
        self.socket.send_to(&buf, addr)?;
        self.stats.record_packet(bytes.len());

        self.reliable_queue.push_tail(frame);
        Ok(())
    }

    /// Notifies the media producer that the client wants to start the
    /// stream, carrying a zero-terminated ASCII URL of at most 99 bytes
    /// plus terminator.
    pub fn start(&self, url: &str) -> Result<()> {
        if self.state() != RxState::Connected {
            return Err(Error::NotReady);
        }
        if !url.is_ascii() || url.len() > 99 {
            return Err(Error::InvalidParam);
        }
        let addr = self.server_addr.lock().unwrap().ok_or(Error::Disconnected)?;
        let mut payload = url.as_bytes().to_vec();
        payload.push(0);
        let header = PacketHeader {
            seq_num: self.next_seq(),
            frame_id: 0,
            frame_type: FrameType::Start,
            flags: FLAG_LAST_FRAG,
            frag_index: 0,
            total_frags: 1,
            payload_size: payload.len() as u16,
        };
        let mut buf = Vec::new();
        packet::encode(&header, &payload, &mut buf)?;
        self.socket.send_to(&buf, addr)?;
        self.stats.record_packet(payload.len());
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if self.state() != RxState::Connected {
            return Err(Error::NotReady);
        }
        let addr = self.server_addr.lock().unwrap().ok_or(Error::Disconnected)?;
        self.send_raw(addr, 0, FrameType::Stop, 0, false)
    }

    /// Drives the socket and every timer; call repeatedly from a dedicated
    /// polling thread. Returns `Error::Timeout` if the handshake deadline
    /// passes, or `Error::Disconnected` once this side's own heartbeats go
    /// unacknowledged for too long — a liveness mirror of the transmitter's
    /// rule, applied symmetrically on the receiver.
    pub fn poll(&self, timeout: Duration) -> Result<()> {
        if self.socket.wait_readable(timeout)? {
            let mut buf = vec![0u8; self.config.mtu()];
            if let Some((n, addr)) = self.socket.recv_from(&mut buf)? {
                self.handle_datagram(&buf[..n], addr);
            }
        }

        let now = self.clock.now_ms();
        match self.state() {
            RxState::Connecting => {
                let start = self.handshake_start_ms.load(Ordering::SeqCst);
                if now.saturating_sub(start) >= HANDSHAKE_DEADLINE_MS {
                    log::warn!("handshake deadline exceeded, returning to idle");
                    *self.state.lock().unwrap() = RxState::Idle;
                    *self.server_addr.lock().unwrap() = None;
                    return Err(Error::Timeout);
                }
            }
            RxState::Connected => {
                self.tick_reassembly_timeouts(now);
                self.tick_reliable_queue(now)?;
                self.tick_heartbeat_emit(now)?;
                if now.saturating_sub(self.last_heartbeat_ack_ms.load(Ordering::SeqCst))
                    >= self.config.heartbeat_liveness_ms()
                {
                    log::warn!("server heartbeat liveness exceeded, dropping session");
                    *self.state.lock().unwrap() = RxState::Idle;
                    *self.server_addr.lock().unwrap() = None;
                    if let Some(cb) = self.on_connect.lock().unwrap().as_mut() {
                        cb(false);
                    }
                    return Err(Error::Disconnected);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        let (header, payload) = match packet::decode(datagram, self.config.max_payload()) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("dropping malformed packet from {addr}: {e}");
                return;
            }
        };
        self.stats.record_packet(payload.len());
        self.track_loss(header.seq_num);

        match header.frame_type {
            FrameType::Connected => self.on_connected(addr),
            FrameType::Ack => self.on_ack(&header),
            FrameType::Disconnect => self.on_disconnect(),
            FrameType::User => self.on_user(&header, payload, addr),
            t if t.is_media() => self.on_media_fragment(&header, payload, addr),
            _ => {}
        }
    }

    fn track_loss(&self, seq: u32) {
        let mut last = self.last_recv_seq.lock().unwrap();
        if let Some(prev) = *last {
            if seq > prev + 1 {
                self.stats.record_lost((seq - prev - 1) as u64);
            }
        }
        *last = Some(seq);
    }

    fn on_connected(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        match *state {
            RxState::Connecting => {
                *state = RxState::Connected;
                log::info!("handshake complete, session established with {addr}");
                let now = self.clock.now_ms();
                self.last_heartbeat_ack_ms.store(now, Ordering::SeqCst);
                self.last_heartbeat_emit_ms.store(now, Ordering::SeqCst);
                drop(state);
                let _ = self.send_raw(addr, 0, FrameType::Ack, 0, false);
                if let Some(cb) = self.on_connect.lock().unwrap().as_mut() {
                    cb(true);
                }
            }
            RxState::Connected => {
                drop(state);
                let _ = self.send_raw(addr, 0, FrameType::Ack, 0, false);
            }
            _ => {}
        }
    }

    fn on_ack(&self, header: &PacketHeader) {
        if header.frame_id == 0 {
            if self.state() == RxState::Connected {
                self.last_heartbeat_ack_ms
                    .store(self.clock.now_ms(), Ordering::SeqCst);
            }
            return;
        }
        self.reliable_queue.remove(header.frame_id);
    }

    fn on_disconnect(&self) {
        log::info!("server disconnected");
        *self.state.lock().unwrap() = RxState::Idle;
        *self.server_addr.lock().unwrap() = None;
        if let Some(cb) = self.on_connect.lock().unwrap().as_mut() {
            cb(false);
        }
    }

    fn on_user(&self, header: &PacketHeader, payload: &[u8], addr: SocketAddr) {
        let _ = self.send_raw(addr, header.frame_id, FrameType::Ack, 0, false);
        if let Some(cb) = self.on_data.lock().unwrap().as_mut() {
            cb(FrameType::User, payload);
        }
    }

    fn on_media_fragment(&self, header: &PacketHeader, payload: &[u8], addr: SocketAddr) {
        let now = self.clock.now_ms();
        let max_payload = self.config.max_payload();

        let frame = match self.reassembly_queue.find_by_frame_id(header.frame_id) {
            Some(f) => f,
            None => {
                let f = match self.media_pool.acquire() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                {
                    let mut state = f.lock();
                    state.frame_id = header.frame_id;
                    state.frame_type = Some(header.frame_type);
                    state.total_frags = header.total_frags;
                    state.recv_frags = 0;
                    state.reassembly = Some(FragBitmap::new(header.total_frags));
                    state.first_recv_ms = now;
                    state.lifecycle = FrameLifecycle::Receiving;
                }
                self.reassembly_queue.push_tail(f.clone());
                f
            }
        };

        let complete = {
            let mut state = frame.lock();
            let is_new = match state.reassembly.as_mut() {
                Some(bitmap) => bitmap.mark(header.frag_index),
                None => false,
            };
            if !is_new {
                self.stats.record_dup();
            } else {
                let offset = header.frag_index as usize * max_payload;
                let needed = offset + payload.len();
                if needed > self.media_pool.data_capacity() {
                    log::warn!(
                        "dropping fragment {} of frame {}: offset {} exceeds frame buffer capacity {}",
                        header.frag_index,
                        header.frame_id,
                        needed,
                        self.media_pool.data_capacity()
                    );
                    return;
                }
                if state.data.len() < needed {
                    state.data.resize(needed, 0);
                }
                state.data[offset..needed].copy_from_slice(payload);
                state.recv_frags += 1;
                state.last_recv_ms = now;
            }
            state
                .reassembly
                .as_ref()
                .map(|b| state.recv_frags as usize == b.total())
                .unwrap_or(false)
        };

        if header.frame_type == FrameType::I {
            let _ = self.send_raw(addr, header.frame_id, FrameType::Ack, header.frag_index, false);
        }

        if complete {
            self.reassembly_queue.remove(header.frame_id);
            self.stats.record_frame(header.frame_type);
            if header.frame_type == FrameType::I {
                *self.last_i_frame.lock().unwrap() = Some(frame.clone());
            }
            let state = frame.lock();
            if let Some(cb) = self.on_frame.lock().unwrap().as_mut() {
                cb(&state.data, header.frame_type);
            }
        }
    }

    fn tick_reassembly_timeouts(&self, now: u64) {
        let reaped = self.reassembly_queue.reap_timeouts(now, self.config.frame_timeout_ms());
        if !reaped.is_empty() {
            log::debug!("reaped {} incomplete frame(s) on reassembly timeout", reaped.len());
        }
        for _ in reaped {
            self.stats.record_incomplete();
        }
    }

    fn tick_reliable_queue(&self, now: u64) -> Result<()> {
        let addr = match *self.server_addr.lock().unwrap() {
            Some(a) => a,
            None => return Ok(()),
        };
        let dropped = self.reliable_queue.drop_exhausted(self.config.data_max_retrans());
        if !dropped.is_empty() {
            log::warn!(
                "dropped {} reliable control frame(s) after exhausting retries",
                dropped.len()
            );
        }

        let mut due = Vec::new();
        while let Some(frame) = self.reliable_queue.pop_head() {
            let ready = {
                let state = frame.lock();
                now.saturating_sub(state.send_time_ms) >= self.config.data_retrans_timeout_ms()
            };
            if ready {
                due.push(frame);
            } else {
                self.reliable_queue.push_tail(frame);
            }
        }

        for frame in due {
            let (frame_id, payload) = {
                let mut state = frame.lock();
                state.retrans_count += 1;
                state.send_time_ms = now;
                (state.frame_id, state.data.clone())
            };
            let header = PacketHeader {
                seq_num: self.next_seq(),
                frame_id,
                frame_type: FrameType::User,
                flags: FLAG_LAST_FRAG | FLAG_RETRANS,
                frag_index: 0,
                total_frags: 1,
                payload_size: payload.len() as u16,
            };
            let mut buf = Vec::new();
            packet::encode(&header, &payload, &mut buf)?;
            self.socket.send_to(&buf, addr)?;
            log::debug!("retransmitted control frame {frame_id}");
            self.stats.record_packet(payload.len());
            self.stats.record_retrans();
            self.reliable_queue.push_tail(frame);
        }
        Ok(())
    }

    fn tick_heartbeat_emit(&self, now: u64) -> Result<()> {
        let addr = match *self.server_addr.lock().unwrap() {
            Some(a) => a,
            None => return Ok(()),
        };
        let last = self.last_heartbeat_emit_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last) >= self.config.heartbeat_interval_ms() {
            self.last_heartbeat_emit_ms.store(now, Ordering::SeqCst);
            self.send_raw(addr, 0, FrameType::Heartbeat, 0, false)?;
        }
        Ok(())
    }

    /// Best-effort graceful shutdown: emits DISCONNECT, transitions to
    /// `Idle`, invokes the connection hook with `connected=false`.
    pub fn close(&self) {
        log::info!("closing receiver");
        if let Some(addr) = *self.server_addr.lock().unwrap() {
            let _ = self.send_raw(addr, 0, FrameType::Disconnect, 0, false);
        }
        while self.reliable_queue.pop_head().is_some() {}
        while self.reassembly_queue.pop_head().is_some() {}
        *self.last_i_frame.lock().unwrap() = None;
        *self.state.lock().unwrap() = RxState::Idle;
        *self.server_addr.lock().unwrap() = None;
        if let Some(cb) = self.on_connect.lock().unwrap().as_mut() {
            cb(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::UdpSocket;

    fn make_receiver() -> Receiver {
        let (rx, _clock) = make_receiver_with_clock();
        rx
    }

    fn make_receiver_with_clock() -> (Receiver, Arc<ManualClock>) {
        let config = Arc::new(Config::default());
        let clock = Arc::new(ManualClock::new());
        let rx = Receiver::new(
            "127.0.0.1:0".parse().unwrap(),
            config,
            clock.clone(),
            None,
            None,
            None,
        )
        .unwrap();
        (rx, clock)
    }

    fn send_header(socket: &UdpSocket, to: SocketAddr, frame_type: FrameType, frame_id: u16, frag_index: u16) {
        let header = PacketHeader {
            seq_num: 0,
            frame_id,
            frame_type,
            flags: FLAG_LAST_FRAG,
            frag_index,
            total_frags: 1,
            payload_size: 0,
        };
        let mut buf = Vec::new();
        packet::encode(&header, &[], &mut buf).unwrap();
        socket.send_to(&buf, to).unwrap();
    }

    #[test]
    fn starts_idle() {
        let rx = make_receiver();
        assert_eq!(rx.state(), RxState::Idle);
    }

    #[test]
    fn connect_requires_idle() {
        let rx = make_receiver();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        rx.connect(addr).unwrap();
        assert_eq!(rx.state(), RxState::Connecting);
        assert_eq!(rx.connect(addr).unwrap_err(), Error::NotReady);
    }

    #[test]
    fn send_requires_connected() {
        let rx = make_receiver();
        assert_eq!(rx.send(b"hi").unwrap_err(), Error::NotReady);
    }

    #[test]
    fn handshake_completes_with_synthetic_server() {
        let rx = make_receiver();
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_addr = server.local_addr().unwrap();

        rx.connect(server_addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, rx_addr) = server.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::Connect);

        send_header(&server, rx_addr, FrameType::Connected, 0, 0);
        rx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(rx.state(), RxState::Connected);

        let (n, _) = server.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::Ack);
    }

    #[test]
    fn key_frame_fragment_is_acked_and_delivered() {
        let rx = make_receiver();
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_addr = server.local_addr().unwrap();

        rx.connect(server_addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, rx_addr) = server.recv_from(&mut buf).unwrap();
        packet::decode(&buf[..n], 64).unwrap();
        send_header(&server, rx_addr, FrameType::Connected, 0, 0);
        rx.poll(Duration::from_millis(200)).unwrap();
        server.recv_from(&mut buf).unwrap(); // ACK for CONNECTED
        assert_eq!(rx.state(), RxState::Connected);

        let delivered = Arc::new(Mutex::new(None));
        let delivered_cb = delivered.clone();
        *rx.on_frame.lock().unwrap() = Some(Box::new(move |data, frame_type| {
            *delivered_cb.lock().unwrap() = Some((data.to_vec(), frame_type));
        }));

        let payload = b"keyframe-bytes";
        let header = PacketHeader {
            seq_num: 1,
            frame_id: 7,
            frame_type: FrameType::I,
            flags: FLAG_LAST_FRAG,
            frag_index: 0,
            total_frags: 1,
            payload_size: payload.len() as u16,
        };
        let mut out = Vec::new();
        packet::encode(&header, payload, &mut out).unwrap();
        server.send_to(&out, rx_addr).unwrap();

        rx.poll(Duration::from_millis(200)).unwrap();

        let (n, _) = server.recv_from(&mut buf).unwrap();
        let (ack_header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(ack_header.frame_type, FrameType::Ack);
        assert_eq!(ack_header.frame_id, 7);

        let got = delivered.lock().unwrap().take().unwrap();
        assert_eq!(got.0, payload);
        assert_eq!(got.1, FrameType::I);
    }

    #[test]
    fn heartbeat_liveness_trips_disconnect() {
        let (rx, clock) = make_receiver_with_clock();
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_addr = server.local_addr().unwrap();

        rx.connect(server_addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, rx_addr) = server.recv_from(&mut buf).unwrap();
        packet::decode(&buf[..n], 64).unwrap();
        send_header(&server, rx_addr, FrameType::Connected, 0, 0);
        rx.poll(Duration::from_millis(200)).unwrap();
        server.recv_from(&mut buf).unwrap(); // ACK for CONNECTED
        assert_eq!(rx.state(), RxState::Connected);

        clock.advance(rx.config.heartbeat_liveness_ms() + 1);
        let err = rx.poll(Duration::from_millis(0)).unwrap_err();
        assert_eq!(err, Error::Disconnected);
        assert_eq!(rx.state(), RxState::Idle);
    }
}
