//! Frame header encoding/decoding
//!
//! The frame format uses a 6-byte header:
//! - channel id + flags: 2 bytes (u16, big-endian; bit 15 set = command
//!   frame, bits 0..14 = channel id)
//! - payload_length: 4 bytes (u32, big-endian, max 64 KiB)

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::ChannelId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 6;

/// Maximum payload size (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 65536;

const COMMAND_FLAG: u16 = 0x8000;

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// Whether the payload is a command (true) or data (false)
    pub command: bool,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(channel: ChannelId, command: bool, payload_length: u32) -> Self {
        Self {
            channel,
            command,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        let mut id = self.channel.as_u16();
        if self.command {
            id |= COMMAND_FLAG;
        }
        dst.put_u16(id);
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }

        let raw = src.get_u16();
        let payload_length = src.get_u32();

        Some(Self {
            channel: ChannelId::new(raw),
            command: raw & COMMAND_FLAG != 0,
            payload_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(ChannelId::new(42), true, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = FrameHeader::new(ChannelId::new(1), true, 7);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        // bit 15 of the first u16 is the command flag
        assert_eq!(&buf[..], &[0x80, 0x01, 0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn test_data_frame_layout() {
        let header = FrameHeader::new(ChannelId::new(0x7FFF), false, 0);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(&buf[..], &[0x7F, 0xFF, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 5][..]);
        assert!(FrameHeader::decode(&mut buf).is_none());
        // nothing consumed on a short read
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(ChannelId::new(1), false, MAX_PAYLOAD_SIZE as u32);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }
}
