//! The 8-byte header that precedes every wire message.
//!
//! Layout: magic, network byte, version_max, version_using, version_min,
//! message type, extensions (u16, big-endian).

use strand_types::NetworkId;

use crate::MessageError;

/// Leading byte of every Strand message.
pub const MAGIC: u8 = b'S';

/// Highest protocol version this node speaks.
pub const VERSION_MAX: u8 = 2;
/// Version this node uses by default.
pub const VERSION_USING: u8 = 2;
/// Oldest version this node still accepts.
pub const VERSION_MIN: u8 = 1;

pub const HEADER_LEN: usize = 8;

/// Wire discriminant for each message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Keepalive = 2,
    Publish = 3,
    ConfirmReq = 4,
    ConfirmAck = 5,
    BulkPull = 6,
    BulkPush = 7,
    FrontierReq = 8,
    NodeIdHandshake = 10,
    BulkPullAccount = 11,
    TelemetryReq = 12,
    TelemetryAck = 13,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            2 => Some(Self::Keepalive),
            3 => Some(Self::Publish),
            4 => Some(Self::ConfirmReq),
            5 => Some(Self::ConfirmAck),
            6 => Some(Self::BulkPull),
            7 => Some(Self::BulkPush),
            8 => Some(Self::FrontierReq),
            10 => Some(Self::NodeIdHandshake),
            11 => Some(Self::BulkPullAccount),
            12 => Some(Self::TelemetryReq),
            13 => Some(Self::TelemetryAck),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub network: NetworkId,
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub extensions: u16,
}

impl MessageHeader {
    pub fn new(network: NetworkId, message_type: MessageType) -> Self {
        Self {
            network,
            version_max: VERSION_MAX,
            version_using: VERSION_USING,
            version_min: VERSION_MIN,
            message_type,
            extensions: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let ext = self.extensions.to_be_bytes();
        [
            MAGIC,
            self.network.as_byte(),
            self.version_max,
            self.version_using,
            self.version_min,
            self.message_type as u8,
            ext[0],
            ext[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Truncated);
        }
        if bytes[0] != MAGIC {
            return Err(MessageError::BadMagic(bytes[0]));
        }
        let network = NetworkId::from_byte(bytes[1]).ok_or(MessageError::BadNetwork(bytes[1]))?;
        let message_type =
            MessageType::from_byte(bytes[5]).ok_or(MessageError::UnknownType(bytes[5]))?;
        Ok(Self {
            network,
            version_max: bytes[2],
            version_using: bytes[3],
            version_min: bytes[4],
            message_type,
            extensions: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader::new(NetworkId::Dev, MessageType::Publish);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = MessageHeader::new(NetworkId::Dev, MessageType::Keepalive).to_bytes();
        bytes[0] = b'X';
        assert_eq!(
            MessageHeader::from_bytes(&bytes),
            Err(MessageError::BadMagic(b'X'))
        );
    }

    #[test]
    fn rejects_unknown_network_and_type() {
        let mut bytes = MessageHeader::new(NetworkId::Dev, MessageType::Keepalive).to_bytes();
        bytes[1] = 0xFF;
        assert_eq!(
            MessageHeader::from_bytes(&bytes),
            Err(MessageError::BadNetwork(0xFF))
        );

        let mut bytes = MessageHeader::new(NetworkId::Dev, MessageType::Keepalive).to_bytes();
        bytes[5] = 0xEE;
        assert_eq!(
            MessageHeader::from_bytes(&bytes),
            Err(MessageError::UnknownType(0xEE))
        );
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(
            MessageHeader::from_bytes(&[MAGIC, b'D', 2]),
            Err(MessageError::Truncated)
        );
    }

    #[test]
    fn extensions_are_big_endian() {
        let mut header = MessageHeader::new(NetworkId::Dev, MessageType::BulkPull);
        header.extensions = 0x0102;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[6..], &[0x01, 0x02]);
    }
}
