use std::io;
use std::ops::Range;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Growable input buffer. Frames are assembled in place across multiple
/// reads; callers get back the range of what each read appended, so the
/// allocation survives from one frame to the next.
#[derive(Debug, Default)]
pub(crate) struct ReadBuf {
    pub(crate) data: Vec<u8>,
}

impl ReadBuf {
    /// Empties the buffer, keeping its capacity.
    pub(crate) fn reset(&mut self) {
        self.data.clear();
    }

    /// Reads exactly `n` more bytes into the buffer and returns the range
    /// they occupy.
    pub(crate) async fn read_from<R>(
        &mut self,
        reader: &mut R,
        n: usize,
    ) -> io::Result<Range<usize>>
    where
        R: AsyncRead + Unpin,
    {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        let _ = reader.read_exact(&mut self.data[start..]).await?;
        Ok(start..self.data.len())
    }
}

/// Growable output buffer, the write-side counterpart of [`ReadBuf`].
#[derive(Debug, Default)]
pub(crate) struct WriteBuf {
    pub(crate) data: Vec<u8>,
}

impl WriteBuf {
    pub(crate) fn reset(&mut self) {
        self.data.clear();
    }

    /// Appends `n` zero bytes and returns the range they occupy, to be
    /// filled in afterwards.
    pub(crate) fn append_zero(&mut self, n: usize) -> Range<usize> {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        start..self.data.len()
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}
