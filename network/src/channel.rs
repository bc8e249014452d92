//! Per-peer channels.
//!
//! A channel couples a peer endpoint with a send path. The descriptor
//! (endpoint + node id) is immutable once the handshake completes;
//! everything mutable sits behind an interior lock so observers can hold
//! `Weak` handles and upgrade on use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use strand_messages::MessageType;
use strand_types::{Account, Endpoint};

use crate::NetworkError;

/// Immutable identity of a live channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub endpoint: Endpoint,
    pub node_id: Account,
}

/// Which transport a channel rides on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Fire-and-forget; loss shows up only in the overflow counter.
    Datagram,
    /// Ordered and framed, with socket-level backpressure.
    Stream,
}

/// Lifecycle of a channel relative to the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Only `node_id_handshake` traffic is accepted.
    Handshaking,
    Live,
    Closed,
}

/// The send half a channel delegates to. Implementations wrap a socket;
/// tests substitute a capture buffer.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), NetworkError>;
    fn mode(&self) -> ChannelMode;
}

struct ChannelInfo {
    state: ChannelState,
    node_id: Option<Account>,
    last_activity: Instant,
    verified_at: Option<Instant>,
}

pub struct Channel {
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    info: Mutex<ChannelInfo>,
    sent: AtomicU64,
}

impl Channel {
    pub fn new(endpoint: Endpoint, transport: Box<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            info: Mutex::new(ChannelInfo {
                state: ChannelState::Handshaking,
                node_id: None,
                last_activity: Instant::now(),
                verified_at: None,
            }),
            sent: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn mode(&self) -> ChannelMode {
        self.transport.mode()
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn node_id(&self) -> Option<Account> {
        self.lock().node_id
    }

    /// When the peer's identity last verified, for conflict resolution
    /// between endpoints claiming one node id.
    pub fn verified_at(&self) -> Option<Instant> {
        self.lock().verified_at
    }

    /// The immutable descriptor; `None` until live.
    pub fn descriptor(&self) -> Option<ChannelDescriptor> {
        let info = self.lock();
        match (info.state, info.node_id) {
            (ChannelState::Live, Some(node_id)) => Some(ChannelDescriptor {
                endpoint: self.endpoint,
                node_id,
            }),
            _ => None,
        }
    }

    /// Whether a message of this type may be processed on this channel.
    /// Until the handshake completes, only handshake traffic passes.
    pub fn accepts(&self, message_type: MessageType) -> bool {
        match self.lock().state {
            ChannelState::Live => true,
            ChannelState::Handshaking => message_type == MessageType::NodeIdHandshake,
            ChannelState::Closed => false,
        }
    }

    /// Promote to live once the handshake verified `node_id`.
    pub fn set_live(&self, node_id: Account) {
        let mut info = self.lock();
        info.state = ChannelState::Live;
        info.node_id = Some(node_id);
        info.verified_at = Some(Instant::now());
        info.last_activity = Instant::now();
    }

    pub fn close(&self) {
        self.lock().state = ChannelState::Closed;
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        if self.state() == ChannelState::Closed {
            return Err(NetworkError::Closed);
        }
        self.transport.send(frame)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.mark_activity();
        Ok(())
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Record inbound or outbound progress for idle accounting.
    pub fn mark_activity(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelInfo> {
        self.info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
