//! TCP-backed bootstrap connections.
//!
//! Pull clients run on the attempt's own thread, so the sockets here are
//! blocking `std::net` streams with read/write timeouts; the async side
//! of the wire (the serving loop) lives in the peer service. Frames are
//! length-prefixed (u32, big-endian) and bulk streams end with an empty
//! frame.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use strand_ledger::Block;
use strand_messages::{encode, BulkPullAccountFlags, Message};
use strand_types::{Account, Amount, BlockHash, NetworkId};

use crate::bootstrap::server::PendingEntry;
use crate::bootstrap::{ConnectionPool, PullConnection, PullError, PullInfo};

/// Longest frame accepted from a bootstrap peer.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}

/// One bootstrap pull connection over a dedicated stream.
pub struct TcpPullConnection {
    stream: Mutex<TcpStream>,
    network: NetworkId,
}

impl TcpPullConnection {
    pub fn connect(
        peer: SocketAddr,
        network: NetworkId,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&peer, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Mutex::new(stream),
            network,
        })
    }

    fn lock_stream(&self) -> std::sync::MutexGuard<'_, TcpStream> {
        self.stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PullConnection for TcpPullConnection {
    fn bulk_pull(
        &self,
        pull: &PullInfo,
        on_block: &mut dyn FnMut(Block) -> bool,
    ) -> Result<u64, PullError> {
        let request = Message::BulkPull {
            start: pull.account_or_head,
            end: pull.end,
            count: pull.count,
        };
        let frame = encode(&request, self.network).map_err(|_| PullError::BadResponse)?;
        let mut stream = self.lock_stream();
        write_frame(&mut stream, &frame).map_err(|_| PullError::Network)?;

        let mut delivered = 0u64;
        loop {
            let frame = read_frame(&mut stream).map_err(|_| PullError::Network)?;
            if frame.is_empty() {
                break;
            }
            let block: Block =
                bincode::deserialize(&frame).map_err(|_| PullError::BadResponse)?;
            delivered += 1;
            if on_block(block) {
                // The attempt asked to drop this pull; the stream is
                // abandoned mid-response, so the connection is not reused.
                break;
            }
        }
        Ok(delivered)
    }

    fn bulk_pull_account(
        &self,
        account: &Account,
        minimum: Amount,
        on_pending: &mut dyn FnMut(BlockHash, Amount),
    ) -> Result<u64, PullError> {
        let request = Message::BulkPullAccount {
            account: *account,
            minimum_amount: minimum,
            flags: BulkPullAccountFlags::PendingHashAndAmount,
        };
        let frame = encode(&request, self.network).map_err(|_| PullError::BadResponse)?;
        let mut stream = self.lock_stream();
        write_frame(&mut stream, &frame).map_err(|_| PullError::Network)?;

        // Frontier summary first, then one frame per pending entry.
        let summary = read_frame(&mut stream).map_err(|_| PullError::Network)?;
        let _: (BlockHash, Amount) =
            bincode::deserialize(&summary).map_err(|_| PullError::BadResponse)?;

        let mut delivered = 0u64;
        loop {
            let frame = read_frame(&mut stream).map_err(|_| PullError::Network)?;
            if frame.is_empty() {
                break;
            }
            let entry: PendingEntry =
                bincode::deserialize(&frame).map_err(|_| PullError::BadResponse)?;
            match entry {
                PendingEntry::HashAndAmount { send_hash, amount }
                | PendingEntry::HashAmountAndAddress {
                    send_hash, amount, ..
                } => {
                    delivered += 1;
                    on_pending(send_hash, amount);
                }
                PendingEntry::AddressOnly { .. } => {}
            }
        }
        Ok(delivered)
    }
}

/// Dials bootstrap peers round-robin; every pull gets a fresh stream, so
/// an abandoned mid-response connection never poisons the next pull.
pub struct BootstrapConnections {
    peers: Vec<SocketAddr>,
    network: NetworkId,
    timeout: Duration,
    next: AtomicUsize,
}

impl BootstrapConnections {
    pub fn new(peers: Vec<SocketAddr>, network: NetworkId, timeout: Duration) -> Self {
        Self {
            peers,
            network,
            timeout,
            next: AtomicUsize::new(0),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl ConnectionPool for BootstrapConnections {
    fn connection(&self, _timeout: Duration) -> Option<std::sync::Arc<dyn PullConnection>> {
        if self.peers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        match TcpPullConnection::connect(self.peers[index], self.network, self.timeout) {
            Ok(connection) => Some(std::sync::Arc::new(connection)),
            Err(e) => {
                tracing::debug!(peer = %self.peers[index], "bootstrap dial failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn frame_helpers_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            write_frame(&mut stream, b"alpha").unwrap();
            write_frame(&mut stream, b"").unwrap();
            write_frame(&mut stream, b"omega").unwrap();
        });

        let (mut server, _) = listener.accept().unwrap();
        assert_eq!(read_frame(&mut server).unwrap(), b"alpha");
        assert_eq!(read_frame(&mut server).unwrap(), b"");
        assert_eq!(read_frame(&mut server).unwrap(), b"omega");
        writer.join().unwrap();
    }

    #[test]
    fn oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
            stream.write_all(&huge).unwrap();
        });

        let (mut server, _) = listener.accept().unwrap();
        assert!(read_frame(&mut server).is_err());
        writer.join().unwrap();
    }

    #[test]
    fn empty_pool_has_no_connections() {
        let pool = BootstrapConnections::new(vec![], NetworkId::Dev, Duration::from_secs(1));
        assert_eq!(pool.peer_count(), 0);
        assert!(pool.connection(Duration::from_secs(1)).is_none());
    }
}
