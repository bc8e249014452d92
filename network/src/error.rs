//! Network error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send buffer full")]
    Backpressure,

    #[error("channel is closed")]
    Closed,

    #[error("handshake violation: {0}")]
    Handshake(&'static str),

    #[error("message rejected before handshake completion")]
    NotLive,
}
