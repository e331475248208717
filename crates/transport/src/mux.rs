use core::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use alloy_rlp::Encodable;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::buffer::ReadBuf;
use crate::error::Error;
use crate::session::{padded_len, read_uint24, write_header, HEADER_LEN, MAX_FRAME_SIZE};
use crate::Transport;

/// Default capacity of the inbound and per-stream outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 400;

/// One frame crossing a pump boundary: the flag byte from the header and the
/// unpadded body.
#[derive(Debug)]
struct Message {
    flag: u8,
    data: Bytes,
}

/// A connection multiplexed over several physical streams of a substrate
/// that already encrypts and authenticates them.
///
/// Frames go out round-robin across the streams and arrive on one shared
/// inbound queue, so ordering holds per stream but not across streams.
/// Streams are buffered until [`start_pumps`](Self::start_pumps); until then
/// the `AsyncRead`/`AsyncWrite` impls expose the first stream raw, which is
/// how the handshake travels before frame boundaries exist.
///
/// Cloning is shallow: clones share the streams and queues.
pub struct MuxConn<S> {
    shared: Arc<MuxShared>,
    streams: Arc<Mutex<StreamSet<S>>>,
}

struct MuxShared {
    writers: Mutex<WriterSet>,
    inbound_tx: mpsc::Sender<io::Result<Message>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<io::Result<Message>>>>,
    cancel: CancellationToken,
    capacity: usize,
}

struct StreamSet<S> {
    pending: Vec<S>,
    started: bool,
}

/// Outbound queue senders, one per running write pump.
struct WriterSet {
    senders: Vec<mpsc::Sender<Bytes>>,
    cursor: usize,
}

impl WriterSet {
    /// Round-robin pick. The cursor always stays below `senders.len()`.
    fn select(&mut self) -> Option<mpsc::Sender<Bytes>> {
        if self.senders.is_empty() {
            return None;
        }
        let sender = self.senders[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.senders.len();
        Some(sender)
    }

    /// Drops a sender whose write pump has exited, so the rotation stops
    /// routing frames to it.
    fn evict(&mut self, dead: &mpsc::Sender<Bytes>) {
        let Some(index) = self.senders.iter().position(|s| s.same_channel(dead)) else {
            return;
        };
        let _ = self.senders.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.senders.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.senders.len();
        }
    }
}

impl<S> MuxConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        Self {
            shared: Arc::new(MuxShared {
                writers: Mutex::new(WriterSet {
                    senders: Vec::new(),
                    cursor: 0,
                }),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                cancel: CancellationToken::new(),
                capacity,
            }),
            streams: Arc::new(Mutex::new(StreamSet {
                pending: Vec::new(),
                started: false,
            })),
        }
    }

    /// Attaches a physical stream. Before the pumps start the stream is
    /// buffered; afterwards its pump pair is spawned immediately, so late
    /// joiners take part in the round-robin right away.
    pub fn add_stream(&self, stream: S) {
        let mut set = self.streams.lock();
        if set.started {
            self.spawn_pumps(stream);
        } else {
            set.pending.push(stream);
        }
    }

    /// Spawns the reader/writer pump pair for every stream attached so far.
    /// One-shot: later calls are no-ops, `add_stream` takes over from here.
    pub fn start_pumps(&self) {
        let mut set = self.streams.lock();
        if set.started {
            return;
        }
        for stream in set.pending.drain(..) {
            self.spawn_pumps(stream);
        }
        set.started = true;
    }

    /// Stops all pumps and drops any stream still buffered. Idempotent:
    /// closing an already-closed connection does nothing.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.streams.lock().pending.clear();
    }

    fn spawn_pumps(&self, stream: S) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        self.shared.writers.lock().senders.push(sender);

        drop(tokio::spawn(read_pump(
            read_half,
            self.shared.inbound_tx.clone(),
            self.shared.cancel.clone(),
        )));
        drop(tokio::spawn(write_pump(
            write_half,
            receiver,
            self.shared.cancel.clone(),
        )));
    }
}

impl<S> Default for MuxConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for MuxConn<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            streams: Arc::clone(&self.streams),
        }
    }
}

impl<S> fmt::Debug for MuxConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConn").finish_non_exhaustive()
    }
}

impl<S> Transport for MuxConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn mux_session(&mut self) -> Option<MuxSession> {
        self.start_pumps();
        let inbound = self
            .shared
            .inbound_rx
            .lock()
            .take()
            .expect("multiplexed session taken once per connection");
        Some(MuxSession {
            shared: Arc::clone(&self.shared),
            inbound,
        })
    }
}

// Raw access to the first attached stream, used for the handshake before the
// pumps take the streams over.

impl<S> AsyncRead for MuxConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut set = self.streams.lock();
        match set.pending.first_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(no_handshake_stream())),
        }
    }
}

impl<S> AsyncWrite for MuxConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut set = self.streams.lock();
        match set.pending.first_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(no_handshake_stream())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut set = self.streams.lock();
        match set.pending.first_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut set = self.streams.lock();
        match set.pending.first_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn no_handshake_stream() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "no stream attached for raw handshake I/O",
    )
}

/// The framing half of a multiplexed connection, detached from the stream
/// set once the handshake is done. Frames are plaintext: the substrate
/// already encrypts and authenticates, so the header carries only the size
/// and flag and there are no MACs.
pub struct MuxSession {
    shared: Arc<MuxShared>,
    inbound: mpsc::Receiver<io::Result<Message>>,
}

impl MuxSession {
    pub(crate) async fn write_frame(&mut self, code: u64, flag: u8, data: &[u8]) -> Result<(), Error> {
        let frame_size = code.length() + data.len();
        if frame_size > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge);
        }

        let padded = padded_len(frame_size);
        let mut frame = BytesMut::with_capacity(HEADER_LEN + padded);
        frame.resize(HEADER_LEN, 0);
        write_header(&mut frame[..HEADER_LEN], frame_size as u32, flag);
        code.encode(&mut frame);
        frame.extend_from_slice(data);
        frame.resize(HEADER_LEN + padded, 0);
        let frame = frame.freeze();

        // a failed send means that stream's write pump is gone; evict it
        // from the rotation and hand the frame to the next stream
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(Error::Closed);
            }
            let sender = self.shared.writers.lock().select().ok_or(Error::NoStreams)?;
            if sender.send(frame.clone()).await.is_ok() {
                return Ok(());
            }
            self.shared.writers.lock().evict(&sender);
        }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<(Bytes, u8), Error> {
        tokio::select! {
            () = self.shared.cancel.cancelled() => Err(Error::Closed),
            next = self.inbound.recv() => match next {
                Some(Ok(message)) => Ok((message.data, message.flag)),
                Some(Err(err)) => Err(err.into()),
                None => Err(Error::Closed),
            }
        }
    }
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession").finish_non_exhaustive()
    }
}

async fn read_pump<S>(
    mut stream: ReadHalf<S>,
    inbound: mpsc::Sender<io::Result<Message>>,
    cancel: CancellationToken,
) where
    S: AsyncRead + Send,
{
    let mut rbuf = ReadBuf::default();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("connection closed, exiting read pump");
                return;
            }
            next = read_raw_frame(&mut stream, &mut rbuf) => match next {
                Ok(message) => {
                    if inbound.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
                // transient errors retry on the same stream
                Err(err) if is_transient(&err) => {}
                Err(err) => {
                    error!(%err, "read frame failed");
                    let _ = inbound.send(Err(err)).await;
                    return;
                }
            }
        }
    }
}

async fn write_pump<S>(
    mut stream: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    S: AsyncWrite + Send,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("connection closed, exiting write pump");
                return;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                if let Err(err) = stream.write_all(&frame).await {
                    // a failed stream ends its own pump only
                    error!(%err, "write frame failed");
                    return;
                }
            }
        }
    }
}

async fn read_raw_frame<R>(stream: &mut R, rbuf: &mut ReadBuf) -> io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    rbuf.reset();

    let header = rbuf.read_from(stream, HEADER_LEN).await?;
    let frame_size = read_uint24(&rbuf.data[header.clone()]) as usize;
    let flag = rbuf.data[header.start + 3];

    let body = rbuf.read_from(stream, padded_len(frame_size)).await?;
    Ok(Message {
        flag,
        data: Bytes::copy_from_slice(&rbuf.data[body.start..body.start + frame_size]),
    })
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
