//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Command payload is not a well-formed request head
    #[error("Invalid command payload: {0}")]
    InvalidCommand(String),

    /// Data frame received for a channel with no request in progress
    #[error("Data frame for unknown channel {0}")]
    UnknownChannel(u16),

    /// Command frame received while a request body was still in progress
    #[error("Command frame interrupted request in progress on channel {0}")]
    CommandMidRequest(u16),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
