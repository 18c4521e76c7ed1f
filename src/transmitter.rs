//! Transmitter state machine: listen, three-way handshake, media send with
//! per-fragment ARQ for key frames, reliable control, heartbeat liveness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::packet::{self, PacketHeader, FLAG_LAST_FRAG, FLAG_RETRANS};
use crate::core::FrameType;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameLifecycle};
use crate::hooks::{MediaEventKind, OnData, OnMedia};
use crate::net::UdpTransport;
use crate::pool::{FramePool, SlabPool};
use crate::queue::FrameQueue;
use crate::stats::{Stats, StatsSnapshot};

/// Transmitter connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Listening,
    AwaitingConnect,
    Connected,
    Closing,
}

struct HandshakeTimer {
    retrans_count: AtomicU32,
    send_time_ms: AtomicU64,
}

/// Server-side endpoint: listens, accepts one client, streams media to it,
/// and exchanges a reliable control channel.
pub struct Transmitter {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    socket: UdpTransport,

    media_pool: FramePool,
    control_pool: FramePool,
    slab: Arc<SlabPool>,
    reliable_queue: FrameQueue,

    state: Mutex<TxState>,
    peer_addr: Mutex<Option<SocketAddr>>,
    handshake: HandshakeTimer,

    local_seq: AtomicU32,
    next_frame_id: AtomicU16,
    last_heartbeat_ms: AtomicU64,
    key_frame_slot: Mutex<Option<Frame>>,

    stats: Stats,
    on_data: Mutex<Option<OnData>>,
    on_media: Mutex<Option<OnMedia>>,
}

impl Transmitter {
    /// Binds the listening socket and constructs a fresh, disconnected
    /// transmitter.
    pub fn listen(
        bind_addr: SocketAddr,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        on_data: Option<OnData>,
        on_media: Option<OnMedia>,
    ) -> Result<Self> {
        let socket = UdpTransport::bind(bind_addr, config.socket_buf_bytes(), config.drop_rate())?;
        let now = clock.now_ms();
        let slab = Arc::new(SlabPool::new());
        let media_pool = FramePool::media().with_slab(&slab);

        Ok(Self {
            config,
            clock,
            socket,
            media_pool,
            control_pool: FramePool::control(),
            slab,
            reliable_queue: FrameQueue::new(),
            state: Mutex::new(TxState::Listening),
            peer_addr: Mutex::new(None),
            handshake: HandshakeTimer {
                retrans_count: AtomicU32::new(0),
                send_time_ms: AtomicU64::new(0),
            },
            local_seq: AtomicU32::new(0),
            next_frame_id: AtomicU16::new(1),
            last_heartbeat_ms: AtomicU64::new(now),
            key_frame_slot: Mutex::new(None),
            stats: Stats::new(now),
            on_data: Mutex::new(on_data),
            on_media: Mutex::new(on_media),
        })
    }

    pub fn state(&self) -> TxState {
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
            // wrapped past u16::MAX back through 0; 0 is reserved, take the
            // very next value instead.
        }
    }

    fn send_control(&self, addr: SocketAddr, frame_id: u16, frame_type: FrameType, retrans: bool) -> Result<()> {
        let mut flags = FLAG_LAST_FRAG;
        if retrans {
            flags |= FLAG_RETRANS;
        }
        let header = PacketHeader {
            seq_num: self.next_seq(),
            frame_id,
            frame_type,
            flags,
            frag_index: 0,
            total_frags: 1,
            payload_size: 0,
        };
        let mut buf = Vec::new();
        packet::encode(&header, &[], &mut buf)?;
        self.socket.send_to(&buf, addr)?;
        self.stats.record_packet(0);
        Ok(())
    }

    /// Allocates a media buffer from the appropriate pool, ready to be
    /// filled by the caller before [`Transmitter::send_media`].
    pub fn alloc_media_frame(&self, frame_type: FrameType, size: usize) -> Result<Frame> {
        if size > crate::pool::frame_pool::MEDIA_FRAME_CAPACITY {
            return Err(Error::FrameInvalid);
        }
        let frame = self.media_pool.acquire()?;
        {
            let mut state = frame.lock();
            state.frame_type = Some(frame_type);
            state.data.resize(size, 0);
            state.lifecycle = FrameLifecycle::Sending;
        }
        Ok(frame)
    }

    /// Fragments and emits a media frame. I/SPS/PPS frames are registered
    /// for per-fragment ARQ and replace the cached key-frame slot; P/A
    /// frames are fire-and-forget.
    pub fn send_media(&self, frame: Frame) -> Result<()> {
        if self.state() != TxState::Connected {
            return Err(Error::NotReady);
        }
        let addr = self.peer_addr.lock().unwrap().ok_or(Error::Disconnected)?;

        let frame_id = self.next_frame_id();
        let max_payload = self.config.max_payload();
        let frame_type = frame.lock().frame_type.ok_or(Error::FrameInvalid)?;
        let total_size = frame.lock().data.len();
        let total_frags = total_size.div_ceil(max_payload).max(1);
        if total_frags > packet::MAX_FRAGMENTS {
            return Err(Error::Overflow);
        }

        {
            let mut state = frame.lock();
            state.frame_id = frame_id;
            state.total_frags = total_frags as u16;
        }

        let protected = frame_type.is_key_frame();
        let now = self.clock.now_ms();

        if protected {
            let mut descriptors = self.slab.acquire(total_frags)?;
            for (i, d) in descriptors.iter_mut().enumerate() {
                d.frag_index = i as u16;
                d.send_time_ms = now;
                d.retrans_count = 0;
                d.acked = false;
            }
            frame.lock().retransmit = Some(descriptors);
        }

        for i in 0..total_frags {
            let start = i * max_payload;
            let end = (start + max_payload).min(total_size);
            let (payload, seq) = {
                let state = frame.lock();
                (state.data[start..end].to_vec(), self.next_seq())
            };
            if protected {
                if let Some(descs) = frame.lock().retransmit.as_mut() {
                    descs[i].seq_num = seq;
                }
            }
            let mut flags = 0u8;
            if i == total_frags - 1 {
                flags |= FLAG_LAST_FRAG;
            }
            let header = PacketHeader {
                seq_num: seq,
                frame_id,
                frame_type,
                flags,
                frag_index: i as u16,
                total_frags: total_frags as u16,
                payload_size: payload.len() as u16,
            };
            let mut buf = Vec::new();
            packet::encode(&header, &payload, &mut buf)?;
            self.socket.send_to(&buf, addr)?;
            self.stats.record_packet(payload.len());
        }
        self.stats.record_frame(frame_type);

        if protected {
            let mut slot = self.key_frame_slot.lock().unwrap();
            *slot = Some(frame);
        }
        Ok(())
    }

    /// Sends a reliable control (USER) frame, at most 128 bytes.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.state() != TxState::Connected {
            return Err(Error::NotReady);
        }
        if bytes.len() > crate::pool::frame_pool::CONTROL_FRAME_CAPACITY {
            return Err(Error::InvalidParam);
        }
        let addr = self.peer_addr.lock().unwrap().ok_or(Error::Disconnected)?;
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

    /// Blocks until a client completes the three-way handshake or `timeout`
    /// elapses, whichever comes first. Returns `Error::Timeout` on
    /// exhaustion. A no-op returning immediately if already connected.
    pub fn accept(&self, timeout: Duration) -> Result<()> {
        let deadline = self.clock.now_ms() + timeout.as_millis() as u64;
        loop {
            if self.state() == TxState::Connected {
                return Ok(());
            }
            let now = self.clock.now_ms();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let remaining = Duration::from_millis(deadline - now);
            if self.socket.wait_readable(remaining)? {
                let mut buf = vec![0u8; self.config.mtu()];
                if let Some((n, addr)) = self.socket.recv_from(&mut buf)? {
                    self.handle_datagram(&buf[..n], addr);
                }
            }
            if self.state() == TxState::AwaitingConnect {
                self.tick_handshake(self.clock.now_ms());
            }
        }
    }

    /// Drives the socket and every timer; call repeatedly from a dedicated
    /// polling thread.
    pub fn poll(&self, timeout: Duration) -> Result<()> {
        if self.socket.wait_readable(timeout)? {
            let mut buf = vec![0u8; self.config.mtu()];
            if let Some((n, addr)) = self.socket.recv_from(&mut buf)? {
                self.handle_datagram(&buf[..n], addr);
            }
        }

        let now = self.clock.now_ms();
        match self.state() {
            TxState::AwaitingConnect => self.tick_handshake(now),
            TxState::Connected => {
                self.tick_key_frame_retrans(now);
                self.tick_reliable_queue(now);
                self.tick_liveness(now);
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

        match header.frame_type {
            FrameType::Connect => self.on_connect(addr),
            FrameType::Ack => self.on_ack(&header),
            FrameType::Disconnect => self.on_disconnect(addr),
            FrameType::Heartbeat => self.on_heartbeat(addr),
            FrameType::Start => self.on_start(payload),
            FrameType::Stop => self.on_stop(),
            FrameType::User => self.on_user(addr, &header, payload),
            _ => {} // media frame_types never arrive at the transmitter
        }
    }

    fn on_connect(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        match *state {
            TxState::Listening => {
                log::info!("accepted CONNECT from {addr}");
                *self.peer_addr.lock().unwrap() = Some(addr);
                *state = TxState::AwaitingConnect;
                self.handshake.retrans_count.store(0, Ordering::SeqCst);
                self.handshake
                    .send_time_ms
                    .store(self.clock.now_ms(), Ordering::SeqCst);
                drop(state);
                let _ = self.send_control(addr, 0, FrameType::Connected, false);
            }
            TxState::Connected => {
                // idempotent: re-emit CONNECTED without touching session state
                drop(state);
                let _ = self.send_control(addr, 0, FrameType::Connected, false);
            }
            _ => {}
        }
    }

    fn on_ack(&self, header: &PacketHeader) {
        if header.frame_id == 0 {
            let mut state = self.state.lock().unwrap();
            if *state == TxState::AwaitingConnect {
                *state = TxState::Connected;
                log::info!("handshake complete, session established");
                self.last_heartbeat_ms
                    .store(self.clock.now_ms(), Ordering::SeqCst);
            } else if *state == TxState::Connected {
                self.last_heartbeat_ms
                    .store(self.clock.now_ms(), Ordering::SeqCst);
            }
            return;
        }

        if self.reliable_queue.remove(header.frame_id).is_some() {
            return;
        }

        let slot = self.key_frame_slot.lock().unwrap().clone();
        if let Some(frame) = slot {
            let mut state = frame.lock();
            if state.frame_id == header.frame_id {
                if let Some(descs) = state.retransmit.as_mut() {
                    if let Some(d) = descs.iter_mut().find(|d| d.frag_index == header.frag_index) {
                        d.acked = true;
                    }
                }
            }
        }
    }

    fn on_disconnect(&self, addr: SocketAddr) {
        log::info!("peer {addr} disconnected");
        let _ = self.send_control(addr, 0, FrameType::Ack, false);
        *self.state.lock().unwrap() = TxState::Listening;
        *self.peer_addr.lock().unwrap() = None;
        if let Some(cb) = self.on_media.lock().unwrap().as_mut() {
            cb(MediaEventKind::Disconnect, None);
        }
    }

    fn on_heartbeat(&self, addr: SocketAddr) {
        let _ = self.send_control(addr, 0, FrameType::Ack, false);
        self.last_heartbeat_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
    }

    fn on_start(&self, payload: &[u8]) {
        let url = parse_start_url(payload);
        if let Some(cb) = self.on_media.lock().unwrap().as_mut() {
            cb(MediaEventKind::Start, url.as_deref());
        }
    }

    fn on_stop(&self) {
        if let Some(cb) = self.on_media.lock().unwrap().as_mut() {
            cb(MediaEventKind::Stop, None);
        }
    }

    fn on_user(&self, addr: SocketAddr, header: &PacketHeader, payload: &[u8]) {
        let _ = self.send_control(addr, header.frame_id, FrameType::Ack, false);
        if let Some(cb) = self.on_data.lock().unwrap().as_mut() {
            cb(FrameType::User, payload);
        }
    }

    fn tick_handshake(&self, now: u64) {
        let addr = match *self.peer_addr.lock().unwrap() {
            Some(a) => a,
            None => return,
        };
        let send_time = self.handshake.send_time_ms.load(Ordering::SeqCst);
        if now < send_time + self.config.connect_timeout_ms() {
            return;
        }
        let count = self.handshake.retrans_count.load(Ordering::SeqCst);
        if count >= self.config.connect_max_retrans() {
            log::warn!("handshake with {addr} exhausted retries, returning to listening");
            *self.state.lock().unwrap() = TxState::Listening;
            *self.peer_addr.lock().unwrap() = None;
            return;
        }
        self.handshake.retrans_count.fetch_add(1, Ordering::SeqCst);
        self.handshake.send_time_ms.store(now, Ordering::SeqCst);
        log::debug!("retransmitting CONNECTED to {addr} (attempt {})", count + 1);
        let _ = self.send_control(addr, 0, FrameType::Connected, true);
    }

    fn tick_key_frame_retrans(&self, now: u64) {
        let addr = match *self.peer_addr.lock().unwrap() {
            Some(a) => a,
            None => return,
        };
        let slot = self.key_frame_slot.lock().unwrap().clone();
        let frame = match slot {
            Some(f) => f,
            None => return,
        };

        let (frame_id, frame_type, total_frags, to_retransmit) = {
            let state = frame.lock();
            let frame_type = match state.frame_type {
                Some(t) => t,
                None => return,
            };
            let mut due = Vec::new();
            if let Some(descs) = &state.retransmit {
                for d in descs {
                    if d.acked {
                        continue;
                    }
                    if d.retrans_count >= self.config.max_retrans() {
                        log::warn!(
                            "key frame {} fragment {} abandoned after {} retransmits",
                            state.frame_id,
                            d.frag_index,
                            d.retrans_count
                        );
                        continue; // abandoned below under the write lock
                    }
                    if now.saturating_sub(d.send_time_ms) >= self.config.retrans_timeout_ms() {
                        due.push(d.frag_index);
                    }
                }
            }
            (state.frame_id, frame_type, state.total_frags, due)
        };

        {
            let mut state = frame.lock();
            if let Some(descs) = state.retransmit.as_mut() {
                for d in descs.iter_mut() {
                    if !d.acked && d.retrans_count >= self.config.max_retrans() {
                        d.acked = true; // abandoned, counted as dropped
                    }
                }
            }
        }

        for frag_index in to_retransmit {
            let max_payload = self.config.max_payload();
            let payload = {
                let state = frame.lock();
                let start = frag_index as usize * max_payload;
                let end = (start + max_payload).min(state.data.len());
                state.data[start..end].to_vec()
            };
            let seq = self.next_seq();
            {
                let mut state = frame.lock();
                if let Some(descs) = state.retransmit.as_mut() {
                    if let Some(d) = descs.get_mut(frag_index as usize) {
                        d.retrans_count += 1;
                        d.send_time_ms = now;
                        d.seq_num = seq;
                    }
                }
            }
            let mut flags = FLAG_RETRANS;
            if frag_index as u16 == total_frags - 1 {
                flags |= FLAG_LAST_FRAG;
            }
            let header = PacketHeader {
                seq_num: seq,
                frame_id,
                frame_type,
                flags,
                frag_index,
                total_frags,
                payload_size: payload.len() as u16,
            };
            let mut buf = Vec::new();
            if packet::encode(&header, &payload, &mut buf).is_ok() && self.socket.send_to(&buf, addr).is_ok() {
                log::debug!("retransmitted key frame {frame_id} fragment {frag_index}");
                self.stats.record_packet(payload.len());
                self.stats.record_retrans();
            }
        }
    }

    fn tick_reliable_queue(&self, now: u64) {
        let addr = match *self.peer_addr.lock().unwrap() {
            Some(a) => a,
            None => return,
        };
        let dropped = self.reliable_queue.drop_exhausted(self.config.data_max_retrans());
        if !dropped.is_empty() {
            log::warn!(
                "dropped {} reliable control frame(s) after exhausting retries",
                dropped.len()
            );
        }

        // Re-walk remaining entries for ones due to retransmit. FrameQueue
        // doesn't expose random access, so pop/push through the list once.
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
            if packet::encode(&header, &payload, &mut buf).is_ok() && self.socket.send_to(&buf, addr).is_ok() {
                log::debug!("retransmitted control frame {frame_id}");
                self.stats.record_packet(payload.len());
                self.stats.record_retrans();
            }
            self.reliable_queue.push_tail(frame);
        }
    }

    fn tick_liveness(&self, now: u64) {
        let last = self.last_heartbeat_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last) >= self.config.heartbeat_liveness_ms() {
            log::warn!("peer heartbeat liveness exceeded, dropping session");
            *self.state.lock().unwrap() = TxState::Listening;
            *self.peer_addr.lock().unwrap() = None;
            *self.key_frame_slot.lock().unwrap() = None;
        }
    }

    /// Best-effort graceful shutdown: emits DISCONNECT, drops pending
    /// reliable frames, returns to `Closing`.
    pub fn close(&self) {
        log::info!("closing transmitter");
        if let Some(addr) = *self.peer_addr.lock().unwrap() {
            let _ = self.send_control(addr, 0, FrameType::Disconnect, false);
        }
        while self.reliable_queue.pop_head().is_some() {}
        *self.state.lock().unwrap() = TxState::Closing;
    }
}

/// Parses a START payload: a zero-terminated ASCII URL, at most 100 bytes
/// including the terminator. An unterminated or malformed payload yields
/// `None`.
fn parse_start_url(payload: &[u8]) -> Option<String> {
    if payload.is_empty() || payload.len() > 100 {
        return None;
    }
    let nul_pos = match payload.iter().position(|&b| b == 0) {
        Some(p) => p,
        None => {
            log::warn!("START payload missing NUL terminator, delivering null URL");
            return None;
        }
    };
    let s = std::str::from_utf8(&payload[..nul_pos]).ok()?;
    if s.is_empty() || !s.is_ascii() {
        return None;
    }
    Some(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::UdpSocket;

    #[test]
    fn start_url_requires_terminator() {
        assert_eq!(parse_start_url(b"no terminator"), None);
    }

    #[test]
    fn start_url_parses_valid_payload() {
        let mut payload = b"rtsp://example/stream".to_vec();
        payload.push(0);
        assert_eq!(
            parse_start_url(&payload).as_deref(),
            Some("rtsp://example/stream")
        );
    }

    #[test]
    fn start_url_rejects_empty() {
        assert_eq!(parse_start_url(&[0]), None);
    }

    fn make_tx() -> Transmitter {
        let (tx, _clock) = make_tx_with_clock();
        tx
    }

    fn make_tx_with_clock() -> (Transmitter, Arc<ManualClock>) {
        let config = Arc::new(Config::default());
        let clock = Arc::new(ManualClock::new());
        let tx = Transmitter::listen(
            "127.0.0.1:0".parse().unwrap(),
            config,
            clock.clone(),
            None,
            None,
        )
        .unwrap();
        (tx, clock)
    }

    fn recv_blocking(socket: &UdpSocket, buf: &mut [u8]) -> (usize, SocketAddr) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match socket.recv_from(buf) {
                Ok(v) => return v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "timed out waiting for datagram");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("recv_from failed: {e}"),
            }
        }
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
    fn handshake_completes_with_synthetic_peer() {
        let tx = make_tx();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::AwaitingConnect);

        let mut buf = [0u8; 64];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::Connected);

        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Connected);
        assert_eq!(*tx.peer_addr.lock().unwrap(), Some(peer_addr));
    }

    #[test]
    fn key_frame_fragment_is_retransmitted_until_acked() {
        let (tx, clock) = make_tx_with_clock();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        let mut buf = [0u8; 64];
        peer.recv_from(&mut buf).unwrap(); // CONNECTED
        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Connected);

        let frame = tx.alloc_media_frame(FrameType::I, 10).unwrap();
        tx.send_media(frame).unwrap();
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::I);
        assert!(!header.is_retrans());

        // No ACK arrives; advance the clock past the fragment retransmit
        // timeout and expect the transmitter to resend it unprompted.
        clock.advance(tx.config.retrans_timeout_ms() + 1);
        tx.poll(Duration::from_millis(0)).unwrap();
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::I);
        assert!(header.is_retrans());
    }

    #[test]
    fn key_frame_selective_retransmission_covers_multi_fragment_path() {
        let (tx, clock) = make_tx_with_clock();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        let mut buf = [0u8; 2048];
        peer.recv_from(&mut buf).unwrap(); // CONNECTED
        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Connected);

        // Large enough to split into exactly 10 fragments at the default MTU.
        let max_payload = tx.config.max_payload();
        let size = max_payload * 9 + 100;
        let frame = tx.alloc_media_frame(FrameType::I, size).unwrap();
        tx.send_media(frame).unwrap();

        let mut frame_id = 0u16;
        for _ in 0..10 {
            let (n, _) = peer.recv_from(&mut buf).unwrap();
            let (header, _) = packet::decode(&buf[..n], max_payload).unwrap();
            assert_eq!(header.frame_type, FrameType::I);
            assert_eq!(header.total_frags, 10);
            assert!(!header.is_retrans());
            frame_id = header.frame_id;
            if header.frag_index != 3 {
                send_header(&peer, tx_addr, FrameType::Ack, frame_id, header.frag_index);
            }
        }
        tx.poll(Duration::from_millis(0)).unwrap(); // drain the ACKs

        clock.advance(tx.config.retrans_timeout_ms() + 1);
        tx.poll(Duration::from_millis(0)).unwrap();

        let (n, _) = peer.recv_from(&mut buf).unwrap();
        let (header, _) = packet::decode(&buf[..n], max_payload).unwrap();
        assert_eq!(header.frame_type, FrameType::I);
        assert_eq!(header.frame_id, frame_id);
        assert_eq!(header.frag_index, 3);
        assert!(header.is_retrans());

        // Only the withheld fragment comes back.
        assert_eq!(
            peer.recv_from(&mut buf).unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn p_frame_fragment_is_never_retransmitted() {
        let (tx, clock) = make_tx_with_clock();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        let mut buf = [0u8; 2048];
        peer.recv_from(&mut buf).unwrap(); // CONNECTED
        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Connected);

        // Same multi-fragment size as the I-frame case, but P frames are
        // fire-and-forget: none of these fragments carry retransmit state.
        let max_payload = tx.config.max_payload();
        let size = max_payload * 9 + 100;
        let frame = tx.alloc_media_frame(FrameType::P, size).unwrap();
        tx.send_media(frame).unwrap();

        for i in 0..10 {
            let (n, _) = peer.recv_from(&mut buf).unwrap();
            let (header, _) = packet::decode(&buf[..n], max_payload).unwrap();
            assert_eq!(header.frame_type, FrameType::P);
            assert_eq!(header.frag_index, i);
            assert!(!header.is_retrans());
        }

        // Simulate fragment 3 being lost in transit: no ACK is ever sent for
        // any fragment. Advance well past the retransmit timeout and confirm
        // nothing is resent.
        clock.advance(tx.config.retrans_timeout_ms() + 1);
        tx.poll(Duration::from_millis(0)).unwrap();
        assert_eq!(
            peer.recv_from(&mut buf).unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn accept_blocks_until_handshake_completes() {
        let tx = make_tx();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);

        let handle = std::thread::spawn(move || tx.accept(Duration::from_millis(2000)));

        let mut buf = [0u8; 64];
        let (n, _) = recv_blocking(&peer, &mut buf);
        let (header, _) = packet::decode(&buf[..n], 64).unwrap();
        assert_eq!(header.frame_type, FrameType::Connected);
        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn accept_times_out_without_a_peer() {
        let config = Arc::new(Config::default());
        let clock = Arc::new(crate::clock::SystemClock::new());
        let tx = Transmitter::listen("127.0.0.1:0".parse().unwrap(), config, clock, None, None).unwrap();
        assert_eq!(
            tx.accept(Duration::from_millis(20)).unwrap_err(),
            Error::Timeout
        );
    }

    #[test]
    fn disconnect_returns_transmitter_to_listening() {
        let tx = make_tx();
        let tx_addr = tx.socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();

        send_header(&peer, tx_addr, FrameType::Connect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        let mut buf = [0u8; 64];
        peer.recv_from(&mut buf).unwrap(); // CONNECTED
        send_header(&peer, tx_addr, FrameType::Ack, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Connected);

        send_header(&peer, tx_addr, FrameType::Disconnect, 0, 0);
        tx.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(tx.state(), TxState::Listening);
        assert!(tx.peer_addr.lock().unwrap().is_none());
    }
}
