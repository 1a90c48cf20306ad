//! Stream multiplexer over a single byte stream.
//!
//! Framing follows smux: every frame is an 8-byte header followed by up to
//! 65535 bytes of data.
//!
//! ```text
//! [ver: u8][cmd: u8][len: u16 LE][stream id: u32 LE][data: len bytes]
//! ```
//!
//! `SYN` opens a stream, `PSH` carries data, `FIN` half-closes it. The
//! dialing side allocates odd stream ids and the accepting side even ones,
//! so both ends can open streams without coordination.
//!
//! Each session runs two tasks: a reader that routes inbound frames to
//! per-stream queues, and a writer that drains a bounded frame queue into
//! the socket. A full queue back-pressures writers, which is what lets
//! callers put a deadline on a write.
//!
//! Shutting a stream down completes only once the writer has put its `FIN`
//! on the socket, so everything written before it has left the session.
//! Streams the remote opened before hanging up can still be accepted; a
//! local close releases pending accepts immediately.

use crate::error::WireError;
use crate::transport::{MuxConnection, MuxStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::debug;

const VERSION: u8 = 1;
const HEADER_SIZE: usize = 8;

/// Largest data chunk carried by one frame.
pub const MAX_FRAME_DATA: usize = u16::MAX as usize;

const FRAME_QUEUE: usize = 128;
const STREAM_QUEUE: usize = 64;
const ACCEPT_BACKLOG: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Syn = 0,
    Fin = 1,
    Psh = 2,
    Nop = 3,
}

impl Command {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Command::Syn),
            1 => Some(Command::Fin),
            2 => Some(Command::Psh),
            3 => Some(Command::Nop),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Frame {
    cmd: Command,
    stream_id: u32,
    data: Bytes,
    /// Signalled once the frame is on the socket.
    written: Option<oneshot::Sender<()>>,
}

impl Frame {
    fn control(cmd: Command, stream_id: u32) -> Self {
        Self {
            cmd,
            stream_id,
            data: Bytes::new(),
            written: None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.push(VERSION);
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

async fn read_mux_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported mux version {}", header[0]),
        ));
    }
    let cmd = Command::from_u8(header[1]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown mux command {}", header[1]),
        )
    })?;
    let len = u16::from_le_bytes([header[2], header[3]]) as usize;
    let stream_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Frame {
        cmd,
        stream_id,
        data: Bytes::from(data),
        written: None,
    })
}

/// Which end of the underlying byte stream this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dialer; allocates odd stream ids.
    Client,
    /// Acceptor; allocates even stream ids.
    Server,
}

type StreamTable = Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>;

fn lock_table(table: &StreamTable) -> MutexGuard<'_, HashMap<u32, mpsc::Sender<Bytes>>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// A multiplexed session over one byte stream.
pub struct MuxSession {
    remote_addr: String,
    next_id: AtomicU32,
    frames: mpsc::Sender<Frame>,
    streams: StreamTable,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxedStream>>,
    /// Local close or write failure.
    shutdown: CancellationToken,
    /// The remote hung up or sent garbage.
    remote_gone: CancellationToken,
}

impl MuxSession {
    /// Wrap `io` and start the reader and writer tasks.
    pub fn new<S>(io: S, mode: Mode, remote_addr: String) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let remote_gone = CancellationToken::new();

        tokio::spawn(write_loop(writer, frames_rx, shutdown.clone()));
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&streams),
            frames_tx.clone(),
            incoming_tx,
            shutdown.clone(),
            remote_gone.clone(),
        ));

        let first_id = match mode {
            Mode::Client => 1,
            Mode::Server => 2,
        };

        Arc::new(Self {
            remote_addr,
            next_id: AtomicU32::new(first_id),
            frames: frames_tx,
            streams,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            shutdown,
            remote_gone,
        })
    }

    /// Open a new outbound stream.
    ///
    /// Fails with `StreamIdsExhausted` once this side's id space is used up.
    pub async fn open(&self) -> Result<MuxedStream, WireError> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .map_err(|_| WireError::StreamIdsExhausted)?;
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        lock_table(&self.streams).insert(id, tx);
        let stream = MuxedStream::new(id, rx, self.frames.clone(), Arc::clone(&self.streams));

        self.frames
            .send(Frame::control(Command::Syn, id))
            .await
            .map_err(|_| WireError::ConnectionClosed)?;
        Ok(stream)
    }

    /// Wait for the next inbound stream.
    ///
    /// After a local close nothing more is handed out, even streams already
    /// queued. After a remote hang-up the queued streams are drained first.
    pub async fn accept(&self) -> Result<MuxedStream, WireError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(WireError::ConnectionClosed),
            stream = incoming.recv() => stream.ok_or(WireError::ConnectionClosed),
        }
    }

    /// Number of streams currently open on this session.
    pub fn stream_count(&self) -> usize {
        lock_table(&self.streams).len()
    }
}

#[async_trait]
impl MuxConnection for MuxSession {
    async fn accept_stream(&self) -> Result<Box<dyn MuxStream>, WireError> {
        Ok(Box::new(self.accept().await?))
    }

    async fn open_stream(&self) -> Result<Box<dyn MuxStream>, WireError> {
        Ok(Box::new(self.open().await?))
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.remote_gone.is_cancelled()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    // Frames queued before a close still go out, unless the socket is full.
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let bytes = frame.to_bytes();
        let result = tokio::select! {
            biased;
            result = write_and_flush(&mut writer, &bytes, frame.written.is_some()) => result,
            _ = shutdown.cancelled() => break,
        };
        if let Err(e) = result {
            debug!(error = %e, "mux: write failed");
            break;
        }
        if let Some(written) = frame.written {
            let _ = written.send(());
        }
    }
    shutdown.cancel();
    let _ = writer.shutdown().await;
}

async fn write_and_flush<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    flush: bool,
) -> io::Result<()> {
    writer.write_all(bytes).await?;
    if flush {
        writer.flush().await?;
    }
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    streams: StreamTable,
    frames: mpsc::Sender<Frame>,
    incoming: mpsc::Sender<MuxedStream>,
    shutdown: CancellationToken,
    remote_gone: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_mux_frame(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "mux: read loop ended");
                    break;
                }
            },
        };

        match frame.cmd {
            Command::Syn => {
                let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                {
                    let mut table = lock_table(&streams);
                    if table.contains_key(&frame.stream_id) {
                        continue;
                    }
                    table.insert(frame.stream_id, tx);
                }
                let stream =
                    MuxedStream::new(frame.stream_id, rx, frames.clone(), Arc::clone(&streams));
                let delivered = tokio::select! {
                    _ = shutdown.cancelled() => false,
                    sent = incoming.send(stream) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Command::Psh => {
                let queue = lock_table(&streams).get(&frame.stream_id).cloned();
                if let Some(queue) = queue {
                    let delivered = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = queue.send(frame.data) => sent.is_ok(),
                    };
                    if !delivered {
                        lock_table(&streams).remove(&frame.stream_id);
                    }
                }
            }
            Command::Fin => {
                lock_table(&streams).remove(&frame.stream_id);
            }
            Command::Nop => {}
        }
    }
    remote_gone.cancel();
    lock_table(&streams).clear();
}

/// One logical stream of a [`MuxSession`].
///
/// Reads return EOF once the remote half-closes the stream or the session
/// ends. `shutdown` resolves once the `FIN` is on the socket. Dropping the
/// stream sends `FIN` if `shutdown` was never called.
pub struct MuxedStream {
    id: u32,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: PollSender<Frame>,
    control: mpsc::Sender<Frame>,
    streams: StreamTable,
    fin_sent: bool,
    fin_written: Option<oneshot::Receiver<()>>,
}

impl MuxedStream {
    fn new(
        id: u32,
        inbound: mpsc::Receiver<Bytes>,
        frames: mpsc::Sender<Frame>,
        streams: StreamTable,
    ) -> Self {
        Self {
            id,
            inbound,
            pending: Bytes::new(),
            outbound: PollSender::new(frames.clone()),
            control: frames,
            streams,
            fin_sent: false,
            fin_written: None,
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed")
}

impl MuxStream for MuxedStream {
    fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        let chunk = this.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after stream shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(MAX_FRAME_DATA);
        this.outbound
            .send_item(Frame {
                cmd: Command::Psh,
                stream_id: this.id,
                data: Bytes::copy_from_slice(&buf[..n]),
                written: None,
            })
            .map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.fin_sent {
            ready!(this.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
            let (written_tx, written_rx) = oneshot::channel();
            let mut fin = Frame::control(Command::Fin, this.id);
            fin.written = Some(written_tx);
            this.outbound.send_item(fin).map_err(|_| broken_pipe())?;
            this.fin_sent = true;
            this.fin_written = Some(written_rx);
        }
        if let Some(written) = this.fin_written.as_mut() {
            let result = ready!(Pin::new(written).poll(cx));
            this.fin_written = None;
            result.map_err(|_| broken_pipe())?;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxedStream {
    fn drop(&mut self) {
        lock_table(&self.streams).remove(&self.id);
        if !self.fin_sent {
            let _ = self.control.try_send(Frame::control(Command::Fin, self.id));
        }
    }
}
