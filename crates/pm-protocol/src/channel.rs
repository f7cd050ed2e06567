//! Channel identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a logical stream over the reverse connection
///
/// Channel IDs occupy the low 15 bits of the frame header; bit 15 is the
/// command flag and never part of the ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(u16);

impl ChannelId {
    /// Largest representable channel ID
    pub const MAX: u16 = 0x7FFF;

    /// Channel reserved for the introduction and broker control commands
    pub const CONTROL: ChannelId = ChannelId(0);

    /// Create a new channel ID, masking to 15 bits
    pub fn new(id: u16) -> Self {
        Self(id & Self::MAX)
    }

    /// Get the raw ID value
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u16> for ChannelId {
    fn from(id: u16) -> Self {
        Self::new(id)
    }
}
