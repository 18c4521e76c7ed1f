//! Configuration for transmitter and receiver endpoints.

/// Default MTU in bytes. Payload capacity is `MTU - HEADER_SIZE`.
pub const DEFAULT_MTU: usize = 1400;

/// Default send/receive socket buffer size, in bytes.
pub const DEFAULT_SOCKET_BUF_BYTES: usize = 2 * 1024 * 1024;

/// Default key-frame fragment retransmission timeout, in milliseconds.
pub const DEFAULT_RETRANS_TIMEOUT_MS: u64 = 5;
/// Default maximum retransmissions for a key-frame fragment.
pub const DEFAULT_MAX_RETRANS: u32 = 3;

/// Default reliable-control frame retransmission timeout, in milliseconds.
pub const DEFAULT_DATA_RETRANS_TIMEOUT_MS: u64 = 30;
/// Default maximum retransmissions for a reliable-control frame.
pub const DEFAULT_DATA_MAX_RETRANS: u32 = 3;

/// Default handshake retransmission timeout, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 100;
/// Default maximum handshake retransmissions.
pub const DEFAULT_CONNECT_MAX_RETRANS: u32 = 3;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
/// Default number of consecutive missed heartbeats before the session is
/// considered dead.
pub const DEFAULT_HEARTBEAT_MAX_MISS: u32 = 3;

/// Default reassembly timeout for an incomplete frame, in milliseconds.
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 100;

/// Minimum usable MTU: the wire header alone is [`crate::core::packet::HEADER_SIZE`]
/// bytes, so anything at or below that cannot carry payload.
pub const MIN_MTU: usize = crate::core::packet::HEADER_SIZE + 1;

/// Shared configuration for a transmitter or receiver endpoint.
///
/// Built once via [`Config::builder`] and shared as `Arc<Config>` between
/// the state machine and its polling thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    mtu: usize,
    socket_buf_bytes: usize,
    retrans_timeout_ms: u64,
    max_retrans: u32,
    data_retrans_timeout_ms: u64,
    data_max_retrans: u32,
    connect_timeout_ms: u64,
    connect_max_retrans: u32,
    heartbeat_interval_ms: u64,
    heartbeat_max_miss: u32,
    frame_timeout_ms: u64,
    /// Debug-only packet drop probability, in `[0.0, 1.0]`. Only consulted
    /// when the crate is built with the `chaos` feature.
    drop_rate_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            socket_buf_bytes: DEFAULT_SOCKET_BUF_BYTES,
            retrans_timeout_ms: DEFAULT_RETRANS_TIMEOUT_MS,
            max_retrans: DEFAULT_MAX_RETRANS,
            data_retrans_timeout_ms: DEFAULT_DATA_RETRANS_TIMEOUT_MS,
            data_max_retrans: DEFAULT_DATA_MAX_RETRANS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            connect_max_retrans: DEFAULT_CONNECT_MAX_RETRANS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_max_miss: DEFAULT_HEARTBEAT_MAX_MISS,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            drop_rate_bits: 0,
        }
    }
}

impl Config {
    /// Starts building a `Config` from defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Self::default())
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Maximum payload bytes carried in a single fragment, given the MTU.
    pub fn max_payload(&self) -> usize {
        self.mtu - crate::core::packet::HEADER_SIZE
    }

    pub fn socket_buf_bytes(&self) -> usize {
        self.socket_buf_bytes
    }

    pub fn retrans_timeout_ms(&self) -> u64 {
        self.retrans_timeout_ms
    }

    pub fn max_retrans(&self) -> u32 {
        self.max_retrans
    }

    pub fn data_retrans_timeout_ms(&self) -> u64 {
        self.data_retrans_timeout_ms
    }

    pub fn data_max_retrans(&self) -> u32 {
        self.data_max_retrans
    }

    pub fn connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms
    }

    pub fn connect_max_retrans(&self) -> u32 {
        self.connect_max_retrans
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    pub fn heartbeat_max_miss(&self) -> u32 {
        self.heartbeat_max_miss
    }

    /// Milliseconds of silence before a session is declared dead.
    pub fn heartbeat_liveness_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.heartbeat_max_miss as u64
    }

    pub fn frame_timeout_ms(&self) -> u64 {
        self.frame_timeout_ms
    }

    pub fn drop_rate(&self) -> f32 {
        f32::from_bits(self.drop_rate_bits)
    }
}

/// Chainable builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.0.mtu = mtu;
        self
    }

    pub fn socket_buf_bytes(mut self, bytes: usize) -> Self {
        self.0.socket_buf_bytes = bytes;
        self
    }

    pub fn retrans_timeout_ms(mut self, ms: u64) -> Self {
        self.0.retrans_timeout_ms = ms;
        self
    }

    pub fn max_retrans(mut self, n: u32) -> Self {
        self.0.max_retrans = n;
        self
    }

    pub fn data_retrans_timeout_ms(mut self, ms: u64) -> Self {
        self.0.data_retrans_timeout_ms = ms;
        self
    }

    pub fn data_max_retrans(mut self, n: u32) -> Self {
        self.0.data_max_retrans = n;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.0.connect_timeout_ms = ms;
        self
    }

    pub fn connect_max_retrans(mut self, n: u32) -> Self {
        self.0.connect_max_retrans = n;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.0.heartbeat_interval_ms = ms;
        self
    }

    pub fn heartbeat_max_miss(mut self, n: u32) -> Self {
        self.0.heartbeat_max_miss = n;
        self
    }

    pub fn frame_timeout_ms(mut self, ms: u64) -> Self {
        self.0.frame_timeout_ms = ms;
        self
    }

    /// Sets the debug-mode packet drop probability. No effect unless the
    /// crate is built with the `chaos` feature.
    pub fn drop_rate(mut self, rate: f32) -> Self {
        self.0.drop_rate_bits = rate.clamp(0.0, 1.0).to_bits();
        self
    }

    /// Finalizes the configuration. Rejects an MTU too small to carry the
    /// wire header.
    pub fn build(self) -> crate::error::Result<Config> {
        if self.0.mtu < MIN_MTU {
            return Err(crate::error::Error::InvalidParam);
        }
        Ok(self.0)
    }
}
