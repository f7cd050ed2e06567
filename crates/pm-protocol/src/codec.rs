//! Tokio codec for framed protocol messages

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// Whether the payload is a command
    pub command: bool,
    /// The payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a command frame
    pub fn command(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            command: true,
            payload: payload.into(),
        }
    }

    /// Create a data frame
    pub fn data(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            command: false,
            payload: payload.into(),
        }
    }

    /// Create the zero-length data frame that terminates a channel phase
    pub fn end_of_stream(channel: ChannelId) -> Self {
        Self::data(channel, Bytes::new())
    }

    /// Whether this frame is a channel-phase terminator
    pub fn is_end_of_stream(&self) -> bool {
        !self.command && self.payload.is_empty()
    }

    /// Split `payload` into data frames of at most `max_payload` bytes,
    /// followed by the zero-length terminator frame.
    pub fn chunk_data(channel: ChannelId, payload: &[u8], max_payload: usize) -> Vec<Frame> {
        let mut frames: Vec<Frame> = payload
            .chunks(max_payload)
            .map(|chunk| Frame::data(channel, Bytes::copy_from_slice(chunk)))
            .collect();
        frames.push(Frame::end_of_stream(channel));
        frames
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src) {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Check payload length
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        // Check if we have enough data for the payload
        if src.len() < payload_len {
            // Save header and wait for more data
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            channel: header.channel,
            command: header.command,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(frame.channel, frame.command, payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec::new();

        let frame = Frame::command(ChannelId::new(1), &b"GET /run HTTP/1.1\r\n\r\n"[..]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_bytes_roundtrip() {
        // encode(decode(bytes)) must reproduce the input for valid frames
        let wire: &[u8] = &[0x80, 0x02, 0x00, 0x00, 0x00, 0x03, b'f', b'o', b'o'];

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(wire);
        let frame = codec.decode(&mut buf).unwrap().unwrap();

        let mut out = BytesMut::new();
        codec.encode(frame, &mut out).unwrap();
        assert_eq!(&out[..], wire);
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::data(ChannelId::new(9), &b"payload"[..]);

        let mut full_buf = BytesMut::new();
        codec.encode(frame.clone(), &mut full_buf).unwrap();

        // Header split across reads
        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, payload still missing
        partial.extend_from_slice(&full_buf.split_to(2));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut codec = FrameCodec::new();

        // length field of 70000 exceeds the 64 KiB cap
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x01]);
        buf.extend_from_slice(&70000u32.to_be_bytes());

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 70000, .. })
        ));
    }

    #[test]
    fn test_codec_multiple_frames_interleaved_channels() {
        let mut codec = FrameCodec::new();

        let frames = vec![
            Frame::data(ChannelId::new(1), &b"aa"[..]),
            Frame::data(ChannelId::new(2), &b"bb"[..]),
            Frame::end_of_stream(ChannelId::new(1)),
            Frame::end_of_stream(ChannelId::new(2)),
        ];

        let mut buf = BytesMut::new();
        for f in &frames {
            codec.encode(f.clone(), &mut buf).unwrap();
        }

        for expected in &frames {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_end_of_stream() {
        let eos = Frame::end_of_stream(ChannelId::new(3));
        assert!(eos.is_end_of_stream());
        assert!(!Frame::data(ChannelId::new(3), &b"x"[..]).is_end_of_stream());
        assert!(!Frame::command(ChannelId::new(3), Bytes::new()).is_end_of_stream());
    }

    #[test]
    fn test_chunk_data_boundaries() {
        let payload = vec![7u8; 10];

        // exact multiple: two full chunks plus terminator
        let frames = Frame::chunk_data(ChannelId::new(5), &payload, 5);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), 5);
        assert_eq!(frames[1].payload.len(), 5);
        assert!(frames[2].is_end_of_stream());

        // remainder chunk
        let frames = Frame::chunk_data(ChannelId::new(5), &payload, 4);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].payload.len(), 2);
        assert!(frames[3].is_end_of_stream());

        // empty payload still terminates the channel
        let frames = Frame::chunk_data(ChannelId::new(5), &[], 4);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_of_stream());

        // concatenation of the chunks reproduces the payload
        let frames = Frame::chunk_data(ChannelId::new(5), &payload, 3);
        let rebuilt: Vec<u8> = frames
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect();
        assert_eq!(rebuilt, payload);
    }
}
