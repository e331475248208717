use core::fmt;
use std::io;
use std::time::Duration;

use alloy_rlp::Decodable;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::error;
use wyre_crypto::{PublicKey, SecretKey};

use crate::config::ConnConfig;
use crate::error::Error;
use crate::handshake::{HandshakeState, Secrets};
use crate::session::{
    ClassicSession, Session, FLAG_COMPRESSED, FLAG_PLAIN, MAX_FRAME_SIZE, MIN_SIZE_TO_COMPRESS,
};
use crate::Transport;

/// An authenticated, message-oriented connection over some transport.
///
/// A connection starts out knowing nothing but the transport and, when
/// dialing, the remote end's public key; [`handshake`](Self::handshake)
/// negotiates the session secrets and selects the framing. All message I/O
/// before that fails with [`Error::HandshakeRequired`].
pub struct Conn<T> {
    io: T,
    dial_dest: Option<PublicKey>,
    session: Option<Session>,
    snappy: Option<SnappyCodec>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<T: Transport> Conn<T> {
    /// Wraps `io`. `dial_dest` is the remote end's public key when we are
    /// the dialer and `None` when we are the listener.
    #[must_use]
    pub fn new(io: T, dial_dest: Option<PublicKey>) -> Self {
        Self::with_config(io, dial_dest, ConnConfig::default())
    }

    #[must_use]
    pub fn with_config(io: T, dial_dest: Option<PublicKey>, config: ConnConfig) -> Self {
        let mut conn = Self {
            io,
            dial_dest,
            session: None,
            snappy: None,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        };
        conn.set_snappy(config.snappy);
        conn
    }

    /// Enables or disables snappy compression of message payloads.
    pub fn set_snappy(&mut self, enabled: bool) {
        self.snappy = enabled.then(SnappyCodec::new);
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Sets both the read and the write deadline.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
    }

    /// Runs the key exchange, as initiator when a dial destination was given
    /// and as recipient otherwise, and returns the remote end's
    /// authenticated public key. The framing is selected here: transports
    /// that expose a multiplexed session get plaintext framing, raw byte
    /// streams get the encrypting session.
    ///
    /// # Panics
    ///
    /// Panics if the connection already completed a handshake.
    pub async fn handshake(&mut self, secret: &SecretKey) -> Result<PublicKey, Error> {
        assert!(self.session.is_none(), "can't handshake twice");

        let mut state = HandshakeState::default();
        let result = match &self.dial_dest {
            Some(remote) => state.run_initiator(&mut self.io, secret, remote).await,
            None => state.run_recipient(&mut self.io, secret).await,
        };
        let secrets = match result {
            Ok(secrets) => secrets,
            Err(err) => {
                error!(%err, "handshake failed");
                return Err(err);
            }
        };
        let remote = secrets.remote;

        match self.io.mux_session() {
            Some(session) => self.session = Some(Session::Mux(session)),
            None => {
                let (rbuf, wbuf) = state.into_buffers();
                let mut session = Box::new(ClassicSession::new(secrets));
                session.init(rbuf, wbuf);
                self.session = Some(Session::Classic(session));
            }
        }
        Ok(remote)
    }

    /// Installs externally derived secrets instead of running the
    /// handshake. Intended for testing the frame layer in isolation.
    ///
    /// # Panics
    ///
    /// Panics if the connection already completed a handshake.
    pub fn init_with_secrets(&mut self, secrets: Secrets) {
        assert!(self.session.is_none(), "can't handshake twice");
        self.session = Some(Session::Classic(Box::new(ClassicSession::new(secrets))));
    }

    /// Reads one message: its code, its payload and the number of payload
    /// bytes that crossed the wire (which differs from the payload length
    /// when the remote end compressed).
    ///
    /// Any error is terminal for the connection.
    pub async fn read(&mut self) -> Result<(u64, Bytes, usize), Error> {
        let read_timeout = self.read_timeout;
        let session = self.session.as_mut().ok_or(Error::HandshakeRequired)?;

        let incoming = session.read_frame(&mut self.io);
        let (frame, flag) = match read_timeout {
            Some(limit) => time::timeout(limit, incoming)
                .await
                .map_err(|_| Error::Timeout)??,
            None => incoming.await?,
        };

        let mut rest: &[u8] = &frame;
        let code = u64::decode(&mut rest).map_err(Error::InvalidCode)?;
        let mut data = frame.slice(frame.len() - rest.len()..);
        let wire_size = data.len();

        if flag == FLAG_COMPRESSED {
            if let Some(codec) = &mut self.snappy {
                data = codec.decompress(&data)?;
            }
        }
        Ok((code, data, wire_size))
    }

    /// Writes one message and returns the number of payload bytes put on
    /// the wire, after compression if it applied.
    pub async fn write(&mut self, code: u64, data: &[u8]) -> Result<u32, Error> {
        if self.session.is_none() {
            return Err(Error::HandshakeRequired);
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let mut flag = FLAG_PLAIN;
        let mut compressed = Vec::new();
        let mut payload = data;
        if let Some(codec) = &mut self.snappy {
            if data.len() > MIN_SIZE_TO_COMPRESS {
                compressed = codec.compress(data)?;
                payload = &compressed;
                flag = FLAG_COMPRESSED;
            }
        }
        let wire_size = payload.len() as u32;

        let write_timeout = self.write_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::HandshakeRequired);
        };
        let outgoing = session.write_frame(&mut self.io, code, flag, payload);
        match write_timeout {
            Some(limit) => time::timeout(limit, outgoing)
                .await
                .map_err(|_| Error::Timeout)??,
            None => outgoing.await?,
        }
        Ok(wire_size)
    }

    /// Shuts the underlying transport down.
    pub async fn close(mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

impl<T> fmt::Debug for Conn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("dial_dest", &self.dial_dest)
            .field("handshaken", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

struct SnappyCodec {
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
}

impl SnappyCodec {
    fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
        }
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(self.encoder.compress_vec(data)?)
    }

    /// Checks the advertised decompressed size before inflating, so a tiny
    /// frame can't expand past the protocol's message size limit.
    fn decompress(&mut self, data: &[u8]) -> Result<Bytes, Error> {
        if snap::raw::decompress_len(data)? > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge);
        }
        Ok(self.decoder.decompress_vec(data)?.into())
    }
}

#[cfg(test)]
mod tests {
    use eyre::Result;
    use rand::thread_rng;
    use tokio::io::{duplex, DuplexStream};
    use wyre_crypto::sha3::{Digest, Keccak256};
    use wyre_crypto::SecretKey;

    use super::*;

    fn mirrored_secrets() -> (Secrets, Secrets) {
        let mut hash_a = Keccak256::new();
        hash_a.update(b"egress of a");
        let mut hash_b = Keccak256::new();
        hash_b.update(b"egress of b");

        let remote = SecretKey::random(&mut thread_rng()).public_key();
        let left = Secrets {
            aes: [0x42; 32],
            mac: [0x0a; 32],
            egress_mac: hash_a.clone(),
            ingress_mac: hash_b.clone(),
            remote,
        };
        let right = Secrets {
            aes: [0x42; 32],
            mac: [0x0a; 32],
            egress_mac: hash_b,
            ingress_mac: hash_a,
            remote,
        };
        (left, right)
    }

    fn framed_pair() -> (Conn<DuplexStream>, Conn<DuplexStream>) {
        let (left_secrets, right_secrets) = mirrored_secrets();
        let (io_l, io_r) = duplex(1 << 24);
        let mut left = Conn::new(io_l, None);
        left.init_with_secrets(left_secrets);
        let mut right = Conn::new(io_r, None);
        right.init_with_secrets(right_secrets);
        (left, right)
    }

    #[tokio::test]
    async fn test_read_before_handshake_fails() {
        let (io, _peer) = duplex(64);
        let mut conn = Conn::new(io, None);
        assert!(matches!(conn.read().await, Err(Error::HandshakeRequired)));
        assert!(matches!(
            conn.write(1, b"data").await,
            Err(Error::HandshakeRequired)
        ));
    }

    #[tokio::test]
    async fn test_decompression_bomb_is_rejected() -> Result<()> {
        let (mut sender, mut receiver) = framed_pair();
        sender.set_snappy(true);
        receiver.set_snappy(true);

        // 16MB of zeros compresses to well under a frame, but the receiver
        // must reject it by its advertised decompressed size
        let bomb = vec![0; MAX_FRAME_SIZE + 10];
        let wire_size = sender.write(0x01, &bomb).await;
        assert!(matches!(wire_size, Err(Error::MessageTooLarge)));

        // send the same payload behind the sender's size check
        let compressed = snap::raw::Encoder::new().compress_vec(&bomb)?;
        let Some(Session::Classic(session)) = sender.session.as_mut() else {
            panic!("classic session expected");
        };
        session
            .write_frame(&mut sender.io, 0x01, FLAG_COMPRESSED, &compressed)
            .await?;

        let err = receiver.read().await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_fires() {
        let (mut conn, _peer) = framed_pair();
        conn.set_read_timeout(Some(Duration::from_millis(50)));

        let err = conn.read().await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
