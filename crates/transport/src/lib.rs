//! Peer-to-peer transport: an authenticated key exchange followed by an
//! encrypted, MACed message stream.
//!
//! [`Conn`] wraps anything implementing [`Transport`] and speaks the same
//! protocol over all of them. Plain byte streams (TCP, in-memory duplexes)
//! get the classic framing: AES-CTR encrypted frames, each authenticated
//! header-first by a pair of running MAC states seeded during the handshake.
//! A [`MuxConn`] bundles several streams of a substrate that already
//! encrypts and authenticates, in which case frames travel in plaintext and
//! fan out round-robin across the streams.

use tokio::io::{AsyncRead, AsyncWrite};

pub use crate::config::ConnConfig;
pub use crate::conn::Conn;
pub use crate::error::Error;
pub use crate::handshake::Secrets;
pub use crate::mux::{MuxConn, MuxSession, DEFAULT_QUEUE_CAPACITY};
pub use crate::session::{MAX_FRAME_SIZE, MIN_SIZE_TO_COMPRESS};

mod buffer;
mod config;
mod conn;
mod error;
mod handshake;
mod mac;
mod mux;
mod session;

/// An ordered, reliable byte stream a [`Conn`] can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// The multiplexed framing session, for transports whose substrate
    /// already encrypts and authenticates. Called once, right after the
    /// handshake; returning `None` selects the encrypting frame codec.
    fn mux_session(&mut self) -> Option<MuxSession> {
        None
    }
}

impl Transport for tokio::net::TcpStream {}

impl Transport for tokio::io::DuplexStream {}
