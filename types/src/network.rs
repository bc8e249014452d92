//! Network identifier.

use serde::{Deserialize, Serialize};

/// Identifies which Strand network a node is connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkId {
    /// The production network.
    Live,
    /// The public test network.
    Test,
    /// Local development network.
    Dev,
}

impl NetworkId {
    /// The byte that follows the magic in every message header.
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Live => b'L',
            Self::Test => b'T',
            Self::Dev => b'D',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'L' => Some(Self::Live),
            b'T' => Some(Self::Test),
            b'D' => Some(Self::Dev),
            _ => None,
        }
    }

    /// Default port for this network.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Live => 7075,
            Self::Test => 17075,
            Self::Dev => 27075,
        }
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
            Self::Dev => "dev",
        }
    }
}
