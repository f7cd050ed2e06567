//! pm-protocol: Wire protocol for the broker reverse connection
//!
//! This crate defines the binary frame format spoken between the agent
//! and the collection broker over the reverse TLS tunnel, together with
//! the HTTP-like command payloads carried inside command frames.

pub mod channel;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;

pub use channel::ChannelId;
pub use codec::{Frame, FrameCodec};
pub use command::{encode_response_head, parse_command, CommandRequest};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
