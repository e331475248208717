use core::fmt;

use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use bytes::Bytes;
use rand::{thread_rng, Rng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use wyre_crypto::sha3::{Digest, Keccak256};
use wyre_crypto::{self as crypto, ecies, keccak256, PublicKey, SecretKey};

use crate::buffer::{ReadBuf, WriteBuf};
use crate::error::Error;

/// Protocol version carried in the handshake messages.
const VERSION: u64 = 4;

const NONCE_LEN: usize = 32;

/// Connection secrets negotiated during the handshake.
///
/// The Keccak states are the seeded MAC accumulators, mirror images of the
/// remote end's: our egress state matches their ingress state and vice versa.
pub struct Secrets {
    pub aes: [u8; 32],
    pub mac: [u8; 32],
    pub egress_mac: Keccak256,
    pub ingress_mac: Keccak256,
    /// The remote end's static public key, authenticated by the handshake.
    pub remote: PublicKey,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// In-progress handshake. Accumulates the nonces, ephemeral keys and sealed
/// packets both sides contribute, then derives [`Secrets`] from them.
#[derive(Default)]
pub(crate) struct HandshakeState {
    initiator: bool,
    remote: Option<PublicKey>,
    init_nonce: [u8; NONCE_LEN],
    resp_nonce: [u8; NONCE_LEN],
    ephemeral_key: Option<SecretKey>,
    remote_ephemeral: Option<PublicKey>,
    rbuf: ReadBuf,
    wbuf: WriteBuf,
}

impl HandshakeState {
    /// Dialer side: send the auth message, consume the ack.
    pub(crate) async fn run_initiator<T>(
        &mut self,
        io: &mut T,
        secret: &SecretKey,
        remote: &PublicKey,
    ) -> Result<Secrets, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.initiator = true;
        self.remote = Some(*remote);

        let auth = self.make_auth_msg(secret)?;
        let auth_packet = self.seal_eip8(&auth)?;
        io.write_all(&auth_packet).await?;

        let (ack, ack_packet): (AuthAck, _) = self.read_msg(io, secret).await?;
        self.handle_auth_ack(&ack)?;

        self.derive_secrets(&auth_packet, &ack_packet)
    }

    /// Listener side: consume the auth message, send the ack.
    pub(crate) async fn run_recipient<T>(
        &mut self,
        io: &mut T,
        secret: &SecretKey,
    ) -> Result<Secrets, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (auth, auth_packet): (AuthMsg, _) = self.read_msg(io, secret).await?;
        self.handle_auth_msg(&auth, secret)?;

        let ack = self.make_auth_ack();
        let ack_packet = self.seal_eip8(&ack)?;
        io.write_all(&ack_packet).await?;

        self.derive_secrets(&auth_packet, &ack_packet)
    }

    /// Hands the scratch buffers over to whoever frames the connection next.
    pub(crate) fn into_buffers(self) -> (ReadBuf, WriteBuf) {
        (self.rbuf, self.wbuf)
    }

    fn make_auth_msg(&mut self, secret: &SecretKey) -> Result<AuthMsg, Error> {
        let mut rng = thread_rng();
        rng.fill_bytes(&mut self.init_nonce);
        let ephemeral = SecretKey::random(&mut rng);

        // sign static-shared-secret ^ nonce with the ephemeral key, proving
        // possession of the static key while committing to the ephemeral one
        let token = crypto::ecdh_x(secret, &self.remote()?);
        let signed = xor(&token, &self.init_nonce);
        let signature = crypto::sign_recoverable(&ephemeral, &signed)?;

        let msg = AuthMsg {
            signature,
            initiator_public: crypto::export_public_key(&secret.public_key()),
            nonce: self.init_nonce,
            version: VERSION,
        };
        self.ephemeral_key = Some(ephemeral);
        Ok(msg)
    }

    fn handle_auth_msg(&mut self, msg: &AuthMsg, secret: &SecretKey) -> Result<(), Error> {
        let remote = crypto::import_public_key(&msg.initiator_public)?;
        self.init_nonce = msg.nonce;
        self.remote = Some(remote);

        if self.ephemeral_key.is_none() {
            self.ephemeral_key = Some(SecretKey::random(&mut thread_rng()));
        }

        // recover the initiator's ephemeral key from the signature
        let token = crypto::ecdh_x(secret, &remote);
        let signed = xor(&token, &self.init_nonce);
        self.remote_ephemeral = Some(crypto::recover(&signed, &msg.signature)?);
        Ok(())
    }

    fn make_auth_ack(&mut self) -> AuthAck {
        thread_rng().fill_bytes(&mut self.resp_nonce);

        let ephemeral = self
            .ephemeral_key
            .as_ref()
            .expect("ephemeral key generated on auth receipt");
        AuthAck {
            ephemeral_public: crypto::export_public_key(&ephemeral.public_key()),
            nonce: self.resp_nonce,
            version: VERSION,
        }
    }

    fn handle_auth_ack(&mut self, msg: &AuthAck) -> Result<(), Error> {
        self.resp_nonce = msg.nonce;
        self.remote_ephemeral = Some(crypto::import_public_key(&msg.ephemeral_public)?);
        Ok(())
    }

    /// RLP-encodes `msg`, pads it so the message type can't be inferred from
    /// the length, encrypts it to the remote key and prefixes the size. The
    /// size prefix is authenticated as the ECIES shared MAC data.
    fn seal_eip8<M: Encodable>(&mut self, msg: &M) -> Result<Vec<u8>, Error> {
        self.wbuf.reset();
        msg.encode(&mut self.wbuf.data);

        let mut rng = thread_rng();
        let _ = self.wbuf.append_zero(rng.gen_range(100..200));

        let prefix = ((self.wbuf.data.len() + ecies::OVERHEAD) as u16).to_be_bytes();

        let remote = self.remote()?;
        let mut packet = Vec::with_capacity(2 + self.wbuf.data.len() + ecies::OVERHEAD);
        packet.extend_from_slice(&prefix);
        packet.extend_from_slice(&ecies::encrypt(&mut rng, &remote, &self.wbuf.data, &prefix));
        Ok(packet)
    }

    /// Reads one size-prefixed sealed message, decrypts and decodes it.
    /// Returns the decoded message along with the raw packet, which feeds
    /// into the MAC seeds.
    async fn read_msg<T, M>(&mut self, io: &mut T, secret: &SecretKey) -> Result<(M, Bytes), Error>
    where
        T: AsyncRead + Unpin,
        M: Decodable,
    {
        self.rbuf.reset();

        let prefix = self.rbuf.read_from(io, 2).await?;
        let size = u16::from_be_bytes([self.rbuf.data[0], self.rbuf.data[1]]);
        let packet = self.rbuf.read_from(io, size as usize).await?;

        let plaintext = ecies::decrypt(secret, &self.rbuf.data[packet], &self.rbuf.data[prefix])?;
        let msg = M::decode(&mut plaintext.as_slice()).map_err(Error::InvalidHandshake)?;
        Ok((msg, Bytes::copy_from_slice(&self.rbuf.data)))
    }

    fn derive_secrets(&self, auth_packet: &[u8], ack_packet: &[u8]) -> Result<Secrets, Error> {
        let ephemeral = self
            .ephemeral_key
            .as_ref()
            .expect("ephemeral key set before secrets derivation");
        let remote_ephemeral = self
            .remote_ephemeral
            .as_ref()
            .expect("remote ephemeral key set before secrets derivation");

        let ecdhe = crypto::ecdh_x(ephemeral, remote_ephemeral);
        let shared = keccak256(&[&ecdhe, &keccak256(&[&self.resp_nonce, &self.init_nonce])]);
        let aes = keccak256(&[&ecdhe, &shared]);
        let mac = keccak256(&[&ecdhe, &aes]);

        // each MAC state is seeded with the key XORed with the *other* end's
        // nonce plus the other end's packet, making the two sides mirrors
        let mut mac1 = Keccak256::new();
        mac1.update(xor(&mac, &self.resp_nonce));
        mac1.update(auth_packet);
        let mut mac2 = Keccak256::new();
        mac2.update(xor(&mac, &self.init_nonce));
        mac2.update(ack_packet);

        let (egress_mac, ingress_mac) = if self.initiator {
            (mac1, mac2)
        } else {
            (mac2, mac1)
        };

        Ok(Secrets {
            aes,
            mac,
            egress_mac,
            ingress_mac,
            remote: self.remote()?,
        })
    }

    fn remote(&self) -> Result<PublicKey, Error> {
        self.remote.ok_or(Error::HandshakeRequired)
    }
}

fn xor(one: &[u8; 32], other: &[u8; 32]) -> [u8; 32] {
    let mut out = [0; 32];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = one[index] ^ other[index];
    }
    out
}

/// Initiator's handshake message.
struct AuthMsg {
    signature: [u8; crypto::SIGNATURE_LEN],
    initiator_public: [u8; crypto::PUBLIC_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    version: u64,
}

/// Recipient's handshake reply.
struct AuthAck {
    ephemeral_public: [u8; crypto::PUBLIC_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    version: u64,
}

impl Encodable for AuthMsg {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.signature.length()
            + self.initiator_public.length()
            + self.nonce.length()
            + self.version.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.signature.encode(out);
        self.initiator_public.encode(out);
        self.nonce.encode(out);
        self.version.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.signature.length()
            + self.initiator_public.length()
            + self.nonce.length()
            + self.version.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for AuthMsg {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_header(buf)?;
        let decoded = Self {
            signature: Decodable::decode(&mut payload)?,
            initiator_public: Decodable::decode(&mut payload)?,
            nonce: Decodable::decode(&mut payload)?,
            version: u64::decode(&mut payload)?,
        };
        Ok(decoded)
    }
}

impl Encodable for AuthAck {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length =
            self.ephemeral_public.length() + self.nonce.length() + self.version.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.ephemeral_public.encode(out);
        self.nonce.encode(out);
        self.version.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length =
            self.ephemeral_public.length() + self.nonce.length() + self.version.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for AuthAck {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_header(buf)?;
        let decoded = Self {
            ephemeral_public: Decodable::decode(&mut payload)?,
            nonce: Decodable::decode(&mut payload)?,
            version: u64::decode(&mut payload)?,
        };
        Ok(decoded)
    }
}

/// Decodes a list header and returns its payload, advancing `buf` past the
/// whole list. Callers decode the fields they know from the payload and
/// ignore the rest; trailing elements added by future protocol versions must
/// not break older decoders.
fn decode_list_header<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<&'a [u8]> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let payload = &buf[..header.payload_length];
    *buf = &buf[header.payload_length..];
    Ok(payload)
}
