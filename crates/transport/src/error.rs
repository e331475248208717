use std::io;

use thiserror::Error;
use wyre_crypto::ecies::EciesError;
use wyre_crypto::{KeyError, SignatureError};

/// Error type for transport failures.
///
/// Authentication and decode errors are terminal: the cipher streams are
/// desynchronized afterwards, so the connection must be closed and redialed,
/// never retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A frame or decompressed payload exceeds the 24-bit size field.
    #[error("message length >= 16MB")]
    MessageTooLarge,
    #[error("bad header MAC")]
    BadHeaderMac,
    #[error("bad frame MAC")]
    BadFrameMac,
    #[error("invalid message code: {0}")]
    InvalidCode(alloy_rlp::Error),
    #[error("invalid handshake message: {0}")]
    InvalidHandshake(alloy_rlp::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Ecies(#[from] EciesError),
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
    /// `read`/`write` was called before `handshake` completed.
    #[error("no handshake has been performed on this connection")]
    HandshakeRequired,
    /// The multiplexed connection has been closed.
    #[error("connection closed")]
    Closed,
    /// The multiplexed connection has no physical streams to write to.
    #[error("no streams attached to the multiplexed connection")]
    NoStreams,
}
