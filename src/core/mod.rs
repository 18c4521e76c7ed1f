//! Wire-level building blocks: packet header codec and checksum.

pub mod checksum;
pub mod packet;

pub use checksum::Crc16Ccitt;
pub use packet::{decode, encode, FrameType, PacketHeader, FLAG_LAST_FRAG, FLAG_RETRANS, HEADER_SIZE, MAX_FRAGMENTS};
