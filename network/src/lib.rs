//! Peer networking: per-peer channels over a datagram and a stream path,
//! the mutual identity handshake, and the shared datagram buffer ring.
//!
//! Decoded messages are routed by the node; this crate owns everything up
//! to (and including) the point where a frame is attributed to a live,
//! identity-verified peer.

pub mod buffer_ring;
pub mod channel;
pub mod channel_table;
pub mod error;
pub mod handshake;
pub mod transport;

pub use buffer_ring::{BufferRing, MessageBuffer};
pub use channel::{Channel, ChannelDescriptor, ChannelMode, ChannelState, Transport};
pub use channel_table::ChannelTable;
pub use error::NetworkError;
pub use handshake::{CookieJar, HandshakeFsm, HandshakeState};
pub use transport::{DatagramTransport, StreamTransport};
