//! Wire messages exchanged between Strand nodes.
//!
//! Every frame is the fixed [`header`] followed by a bincode payload. A
//! frame that fails to decode yields a typed error so the channel can count
//! and drop it without tearing down the connection.

pub mod header;

use serde::{Deserialize, Serialize};
use strand_ledger::Block;
use strand_types::{Account, Amount, BlockHash, Endpoint, HashOrAccount, NetworkId, Root, Signature};
use thiserror::Error;

pub use header::{MessageHeader, MessageType, HEADER_LEN};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),

    #[error("unknown network byte {0:#04x}")]
    BadNetwork(u8),

    #[error("message for wrong network")]
    NetworkMismatch,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("frame shorter than the header")]
    Truncated,

    #[error("payload failed to decode: {0}")]
    Payload(String),
}

/// A vote for a set of block hashes, as carried by `confirm_ack`. The core
/// does not aggregate votes; it only moves them between the wire and the
/// external voting subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: Account,
    pub timestamp: u64,
    pub hashes: Vec<BlockHash>,
    pub signature: Signature,
}

/// Node statistics exchanged via telemetry messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub block_count: u64,
    pub cemented_count: u64,
    pub unchecked_count: u64,
    pub account_count: u64,
    pub peer_count: u32,
    pub protocol_version: u8,
    pub uptime_seconds: u64,
    pub genesis_hash: BlockHash,
    pub timestamp: u64,
}

/// How `bulk_pull_account` should shape its response stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkPullAccountFlags {
    /// Stream `{send_hash, amount}` pairs.
    #[default]
    PendingHashAndAmount,
    /// Stream only the source accounts of pending sends.
    PendingAddressOnly,
    /// Stream `{send_hash, amount, source_account}` triples.
    PendingHashAmountAndAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Peer-list gossip.
    Keepalive { peers: Vec<Endpoint> },
    /// A freshly minted block flooded to the network.
    Publish { block: Block },
    /// Request votes on the given roots.
    ConfirmReq { roots: Vec<(BlockHash, Root)> },
    /// A vote relayed from the voting subsystem.
    ConfirmAck { vote: Vote },
    /// Pull a chain segment: from `start` (hash or account head) toward
    /// `end`, at most `count` blocks when non-zero.
    BulkPull {
        start: HashOrAccount,
        end: BlockHash,
        count: u32,
    },
    /// Pull the pending (receivable) entries of one account.
    BulkPullAccount {
        account: Account,
        minimum_amount: Amount,
        flags: BulkPullAccountFlags,
    },
    /// Announces a stream of blocks pushed by the remote.
    BulkPush,
    /// Walk the frontier table from `start`, skipping entries older than
    /// `age` seconds, emitting at most `count`.
    FrontierReq {
        start: Account,
        age: u32,
        count: u32,
    },
    /// Mutual identity proof; see the channel layer for the state machine.
    NodeIdHandshake {
        query: Option<[u8; 32]>,
        response: Option<HandshakeResponse>,
    },
    TelemetryReq,
    TelemetryAck { data: TelemetryData },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_id: Account,
    pub signature: Signature,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keepalive { .. } => MessageType::Keepalive,
            Message::Publish { .. } => MessageType::Publish,
            Message::ConfirmReq { .. } => MessageType::ConfirmReq,
            Message::ConfirmAck { .. } => MessageType::ConfirmAck,
            Message::BulkPull { .. } => MessageType::BulkPull,
            Message::BulkPullAccount { .. } => MessageType::BulkPullAccount,
            Message::BulkPush => MessageType::BulkPush,
            Message::FrontierReq { .. } => MessageType::FrontierReq,
            Message::NodeIdHandshake { .. } => MessageType::NodeIdHandshake,
            Message::TelemetryReq => MessageType::TelemetryReq,
            Message::TelemetryAck { .. } => MessageType::TelemetryAck,
        }
    }
}

/// Frame a message for the given network.
pub fn encode(message: &Message, network: NetworkId) -> Result<Vec<u8>, MessageError> {
    let header = MessageHeader::new(network, message.message_type());
    let mut out = header.to_bytes().to_vec();
    let payload =
        bincode::serialize(message).map_err(|e| MessageError::Payload(e.to_string()))?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse a frame received on `network`. The header's declared type must
/// match the payload's variant.
pub fn decode(bytes: &[u8], network: NetworkId) -> Result<Message, MessageError> {
    let header = MessageHeader::from_bytes(bytes)?;
    if header.network != network {
        return Err(MessageError::NetworkMismatch);
    }
    let message: Message = bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| MessageError::Payload(e.to_string()))?;
    if message.message_type() != header.message_type {
        return Err(MessageError::Payload(format!(
            "header claims {:?}, payload is {:?}",
            header.message_type,
            message.message_type()
        )));
    }
    Ok(message)
}
