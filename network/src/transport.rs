//! Socket-backed transports.
//!
//! The datagram path writes straight to a UDP socket and drops on a full
//! kernel buffer; the stream path is a bounded queue drained by a writer
//! task, so senders feel socket backpressure as [`NetworkError::Backpressure`].
//! Stream frames are length-prefixed (u32, big-endian).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::channel::{ChannelMode, Transport};
use crate::NetworkError;

/// Longest frame accepted on the stream path.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl DatagramTransport {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }
}

impl Transport for DatagramTransport {
    fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        match self.socket.try_send_to(frame, self.target) {
            Ok(_) => Ok(()),
            // Fire-and-forget: a full kernel buffer drops the datagram.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mode(&self) -> ChannelMode {
        ChannelMode::Datagram
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    tx: mpsc::Sender<Vec<u8>>,
}

impl StreamTransport {
    /// Queue a frame, waiting for space. The async path for streamed
    /// bootstrap responses, where the sender can afford to be
    /// backpressured instead of dropping.
    pub async fn send_queued(&self, frame: Vec<u8>) -> Result<(), NetworkError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| NetworkError::Closed)
    }
}

impl Transport for StreamTransport {
    fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        match self.tx.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NetworkError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetworkError::Closed),
        }
    }

    fn mode(&self) -> ChannelMode {
        ChannelMode::Stream
    }
}

/// Spawn the writer task draining frames onto `write_half`.
pub fn spawn_stream_writer(mut write_half: OwnedWriteHalf, queue_depth: usize) -> StreamTransport {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let len = (frame.len() as u32).to_be_bytes();
            if write_half.write_all(&len).await.is_err() {
                break;
            }
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    StreamTransport { tx }
}

/// Read one length-prefixed frame; `Ok(None)` on clean EOF.
pub async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>, NetworkError> {
    let mut len_bytes = [0u8; 4];
    match read_half.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        )));
    }
    let mut frame = vec![0u8; len];
    read_half.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
