use core::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use alloy_rlp::Encodable;
use bytes::Bytes;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::buffer::{ReadBuf, WriteBuf};
use crate::error::Error;
use crate::handshake::Secrets;
use crate::mac::{FrameMac, MAC_LEN};
use crate::mux::MuxSession;

/// Largest message the 24-bit frame size field can describe.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Messages above this size get compressed when snappy is enabled.
pub const MIN_SIZE_TO_COMPRESS: usize = 512;

/// Compression flag values carried in header byte 3.
pub(crate) const FLAG_PLAIN: u8 = 0x00;
pub(crate) const FLAG_COMPRESSED: u8 = 0xFF;

/// Filler for header bytes 4..7, a leftover of the legacy header layout.
pub(crate) const ZERO_HEADER: [u8; 3] = [0xC2, 0x80, 0x80];

pub(crate) const HEADER_LEN: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Framing state selected once per connection at handshake time: encrypted
/// and authenticated frames over a raw byte stream, or plaintext frames over
/// a substrate that already provides both.
pub(crate) enum Session {
    Classic(Box<ClassicSession>),
    Mux(MuxSession),
}

impl Session {
    pub(crate) async fn write_frame<T>(
        &mut self,
        io: &mut T,
        code: u64,
        flag: u8,
        data: &[u8],
    ) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Self::Classic(session) => session.write_frame(io, code, flag, data).await,
            Self::Mux(session) => session.write_frame(code, flag, data).await,
        }
    }

    pub(crate) async fn read_frame<T>(&mut self, io: &mut T) -> Result<(Bytes, u8), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Self::Classic(session) => session.read_frame(io).await,
            Self::Mux(session) => session.read_frame().await,
        }
    }
}

/// The encrypted, MACed frame codec used over raw byte streams.
///
/// Frames are AES-256-CTR encrypted with a zero IV (the key is unique per
/// connection) and authenticated header-first with [`FrameMac`], so a
/// corrupted header is rejected before its size field is trusted.
pub(crate) struct ClassicSession {
    enc: Aes256Ctr,
    dec: Aes256Ctr,
    egress_mac: FrameMac,
    ingress_mac: FrameMac,
    rbuf: ReadBuf,
    wbuf: WriteBuf,
}

impl ClassicSession {
    pub(crate) fn new(secrets: Secrets) -> Self {
        let iv = [0; 16];
        Self {
            enc: Aes256Ctr::new(&secrets.aes.into(), &iv.into()),
            dec: Aes256Ctr::new(&secrets.aes.into(), &iv.into()),
            egress_mac: FrameMac::new(&secrets.mac, secrets.egress_mac),
            ingress_mac: FrameMac::new(&secrets.mac, secrets.ingress_mac),
            rbuf: ReadBuf::default(),
            wbuf: WriteBuf::default(),
        }
    }

    /// Adopts the handshake's scratch buffers so their capacity carries over.
    pub(crate) fn init(&mut self, rbuf: ReadBuf, wbuf: WriteBuf) {
        self.rbuf = rbuf;
        self.wbuf = wbuf;
    }

    pub(crate) async fn write_frame<T>(
        &mut self,
        io: &mut T,
        code: u64,
        flag: u8,
        data: &[u8],
    ) -> Result<(), Error>
    where
        T: AsyncWrite + Unpin,
    {
        self.wbuf.reset();

        let frame_size = code.length() + data.len();
        if frame_size > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let header = self.wbuf.append_zero(HEADER_LEN);
        write_header(&mut self.wbuf.data[header.clone()], frame_size as u32, flag);
        self.enc.apply_keystream(&mut self.wbuf.data[header.clone()]);
        let header_mac = self.egress_mac.compute_header(&self.wbuf.data[header]);
        self.wbuf.extend(&header_mac);

        let body = self.wbuf.data.len();
        code.encode(&mut self.wbuf.data);
        self.wbuf.extend(data);
        let _ = self.wbuf.append_zero(padded_len(frame_size) - frame_size);
        self.enc.apply_keystream(&mut self.wbuf.data[body..]);
        let frame_mac = self.egress_mac.compute_frame(&self.wbuf.data[body..]);
        self.wbuf.extend(&frame_mac);

        io.write_all(&self.wbuf.data).await?;
        Ok(())
    }

    pub(crate) async fn read_frame<T>(&mut self, io: &mut T) -> Result<(Bytes, u8), Error>
    where
        T: AsyncRead + Unpin,
    {
        self.rbuf.reset();

        let _ = self.rbuf.read_from(io, HEADER_LEN + MAC_LEN).await?;
        let want = self.ingress_mac.compute_header(&self.rbuf.data[..HEADER_LEN]);
        if !mac_equal(&want, &self.rbuf.data[HEADER_LEN..HEADER_LEN + MAC_LEN]) {
            return Err(Error::BadHeaderMac);
        }

        self.dec.apply_keystream(&mut self.rbuf.data[..HEADER_LEN]);
        let frame_size = read_uint24(&self.rbuf.data[..HEADER_LEN]) as usize;
        let flag = self.rbuf.data[3];

        let body = self.rbuf.read_from(io, padded_len(frame_size)).await?;
        let mac = self.rbuf.read_from(io, MAC_LEN).await?;
        let want = self.ingress_mac.compute_frame(&self.rbuf.data[body.clone()]);
        if !mac_equal(&want, &self.rbuf.data[mac]) {
            return Err(Error::BadFrameMac);
        }

        self.dec.apply_keystream(&mut self.rbuf.data[body.clone()]);
        let frame = Bytes::copy_from_slice(&self.rbuf.data[body.start..body.start + frame_size]);
        Ok((frame, flag))
    }
}

impl fmt::Debug for ClassicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicSession").finish_non_exhaustive()
    }
}

/// Fills in a 16-byte frame header: 24-bit big-endian size, flag byte and
/// the legacy filler.
pub(crate) fn write_header(header: &mut [u8], frame_size: u32, flag: u8) {
    put_uint24(frame_size, header);
    header[3] = flag;
    header[4..7].copy_from_slice(&ZERO_HEADER);
}

pub(crate) fn put_uint24(value: u32, out: &mut [u8]) {
    out[0] = (value >> 16) as u8;
    out[1] = (value >> 8) as u8;
    out[2] = value as u8;
}

pub(crate) fn read_uint24(header: &[u8]) -> u32 {
    u32::from(header[2]) | u32::from(header[1]) << 8 | u32::from(header[0]) << 16
}

/// Rounds `size` up to the next multiple of the cipher block size.
pub(crate) fn padded_len(size: usize) -> usize {
    match size % 16 {
        0 => size,
        rem => size + 16 - rem,
    }
}

fn mac_equal(want: &[u8], got: &[u8]) -> bool {
    want.len() == got.len() && bool::from(want.ct_eq(got))
}
