//! Wire packet header codec.
//!
//! The header is serialized big-endian. Every field keeps the width the
//! protocol assigns it (`frag_index`/`total_frags` must reach 512, so they
//! stay `u16`); the on-wire size is the sum of those fields, [`HEADER_SIZE`].

use crate::error::{Error, Result};

use super::checksum::Crc16Ccitt;

/// Size in bytes of the fixed wire header.
pub const HEADER_SIZE: usize = 16;

/// Maximum fragments permitted in a single frame.
pub const MAX_FRAGMENTS: usize = 512;

/// `LAST_FRAG` flag bit: this is the final fragment of its frame.
pub const FLAG_LAST_FRAG: u8 = 1 << 0;
/// `RETRANS` flag bit: this fragment is a retransmission.
pub const FLAG_RETRANS: u8 = 1 << 1;

/// Media and control frame types carried in the `frame_type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Key frame (intra-coded video).
    I = 1,
    /// Predicted frame.
    P = 2,
    /// Sequence parameter set.
    Sps = 3,
    /// Picture parameter set.
    Pps = 4,
    /// Audio frame.
    A = 5,
    /// Connection request (client -> server).
    Connect = 0x10,
    /// Connection accepted (server -> client).
    Connected = 0x11,
    /// Session teardown.
    Disconnect = 0x12,
    /// Acknowledgment.
    Ack = 0x13,
    /// Liveness probe.
    Heartbeat = 0x14,
    /// Reliable application control payload.
    User = 0x15,
    /// Media-producer start control.
    Start = 0x16,
    /// Media-producer stop control.
    Stop = 0x17,
}

impl FrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::I),
            2 => Some(Self::P),
            3 => Some(Self::Sps),
            4 => Some(Self::Pps),
            5 => Some(Self::A),
            0x10 => Some(Self::Connect),
            0x11 => Some(Self::Connected),
            0x12 => Some(Self::Disconnect),
            0x13 => Some(Self::Ack),
            0x14 => Some(Self::Heartbeat),
            0x15 => Some(Self::User),
            0x16 => Some(Self::Start),
            0x17 => Some(Self::Stop),
            _ => None,
        }
    }

    /// Key frame types protected by per-fragment ARQ (I, SPS, PPS).
    pub const fn is_key_frame(&self) -> bool {
        matches!(self, Self::I | Self::Sps | Self::Pps)
    }

    /// Media types delivered to the frame sink (I, P, SPS, PPS, A).
    pub const fn is_media(&self) -> bool {
        matches!(self, Self::I | Self::P | Self::Sps | Self::Pps | Self::A)
    }

    pub const fn is_control(&self) -> bool {
        !self.is_media()
    }
}

/// The fixed wire header, decoded into host-native fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq_num: u32,
    pub frame_id: u16,
    pub frame_type: FrameType,
    pub flags: u8,
    pub frag_index: u16,
    pub total_frags: u16,
    pub payload_size: u16,
}

impl PacketHeader {
    pub fn is_last_frag(&self) -> bool {
        self.flags & FLAG_LAST_FRAG != 0
    }

    pub fn is_retrans(&self) -> bool {
        self.flags & FLAG_RETRANS != 0
    }

    pub fn set_last_frag(&mut self, last: bool) {
        if last {
            self.flags |= FLAG_LAST_FRAG;
        } else {
            self.flags &= !FLAG_LAST_FRAG;
        }
    }

    pub fn set_retrans(&mut self, retrans: bool) {
        if retrans {
            self.flags |= FLAG_RETRANS;
        } else {
            self.flags &= !FLAG_RETRANS;
        }
    }
}

/// Serializes `header` and `payload` into a single wire-format datagram.
///
/// The checksum is computed with the checksum field zeroed, then written
/// back in network byte order at the tail of the header.
pub fn encode(header: &PacketHeader, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::PacketTooLarge);
    }
    out.clear();
    out.reserve(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.seq_num.to_be_bytes());
    out.extend_from_slice(&header.frame_id.to_be_bytes());
    out.push(header.frame_type as u8);
    out.push(header.flags);
    out.extend_from_slice(&header.frag_index.to_be_bytes());
    out.extend_from_slice(&header.total_frags.to_be_bytes());
    out.extend_from_slice(&header.payload_size.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(payload);

    let crc = Crc16Ccitt::compute_slices(&[&out[..HEADER_SIZE - 2], payload]);
    out[HEADER_SIZE - 2..HEADER_SIZE].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Parses and validates a received datagram: rejects `total_frags == 0`,
/// `frag_index >= total_frags`, an oversized payload, an undefined
/// `frame_type`, or a checksum mismatch.
pub fn decode(datagram: &[u8], max_payload: usize) -> Result<(PacketHeader, &[u8])> {
    if datagram.len() < HEADER_SIZE {
        return Err(Error::PacketInvalid);
    }

    let seq_num = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
    let frame_id = u16::from_be_bytes(datagram[4..6].try_into().unwrap());
    let frame_type_raw = datagram[6];
    let flags = datagram[7];
    let frag_index = u16::from_be_bytes(datagram[8..10].try_into().unwrap());
    let total_frags = u16::from_be_bytes(datagram[10..12].try_into().unwrap());
    let payload_size = u16::from_be_bytes(datagram[12..14].try_into().unwrap());
    let checksum = u16::from_be_bytes(datagram[14..16].try_into().unwrap());

    let payload = &datagram[HEADER_SIZE..];
    if payload.len() != payload_size as usize {
        return Err(Error::PacketInvalid);
    }
    if total_frags == 0 {
        return Err(Error::PacketInvalid);
    }
    if frag_index >= total_frags {
        return Err(Error::PacketInvalid);
    }
    if payload_size as usize > max_payload {
        return Err(Error::PacketTooLarge);
    }
    let frame_type = FrameType::from_u8(frame_type_raw).ok_or(Error::PacketInvalid)?;

    let mut zeroed_header = [0u8; HEADER_SIZE];
    zeroed_header.copy_from_slice(&datagram[..HEADER_SIZE]);
    zeroed_header[HEADER_SIZE - 2..HEADER_SIZE].copy_from_slice(&[0, 0]);
    if Crc16Ccitt::compute_slices(&[&zeroed_header, payload]) != checksum {
        return Err(Error::Checksum);
    }

    Ok((
        PacketHeader {
            seq_num,
            frame_id,
            frame_type,
            flags,
            frag_index,
            total_frags,
            payload_size,
        },
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        PacketHeader {
            seq_num: 42,
            frame_id: 7,
            frame_type: FrameType::I,
            flags: FLAG_LAST_FRAG,
            frag_index: 2,
            total_frags: 3,
            payload_size: 5,
        }
    }

    #[test]
    fn round_trip() {
        let header = sample_header();
        let payload = b"hello";
        let mut buf = Vec::new();
        encode(&header, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let (decoded, decoded_payload) = decode(&buf, 1386).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn rejects_zero_total_frags() {
        let mut header = sample_header();
        header.total_frags = 0;
        let mut buf = Vec::new();
        encode(&header, b"x", &mut buf).unwrap();
        assert_eq!(decode(&buf, 1386).unwrap_err(), Error::PacketInvalid);
    }

    #[test]
    fn rejects_frag_index_past_total() {
        let mut header = sample_header();
        header.frag_index = 5;
        header.total_frags = 3;
        let mut buf = Vec::new();
        encode(&header, b"x", &mut buf).unwrap();
        assert_eq!(decode(&buf, 1386).unwrap_err(), Error::PacketInvalid);
    }

    #[test]
    fn rejects_oversized_payload() {
        let header = sample_header();
        let mut buf = Vec::new();
        encode(&header, b"0123456789", &mut buf).unwrap();
        assert_eq!(decode(&buf, 4).unwrap_err(), Error::PacketTooLarge);
    }

    #[test]
    fn rejects_undefined_frame_type() {
        let header = sample_header();
        let mut buf = Vec::new();
        encode(&header, b"x", &mut buf).unwrap();
        buf[6] = 0xEE;
        assert_eq!(decode(&buf, 1386).unwrap_err(), Error::PacketInvalid);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let header = sample_header();
        let mut buf = Vec::new();
        encode(&header, b"hello", &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert_eq!(decode(&buf, 1386).unwrap_err(), Error::Checksum);
    }

    #[test]
    fn flags_helpers() {
        let mut header = sample_header();
        header.flags = 0;
        assert!(!header.is_last_frag());
        assert!(!header.is_retrans());
        header.set_last_frag(true);
        header.set_retrans(true);
        assert!(header.is_last_frag());
        assert!(header.is_retrans());
        header.set_last_frag(false);
        assert!(!header.is_last_frag());
        assert!(header.is_retrans());
    }
}
