//! Line-oriented stream that is either plaintext or TLS.
//!
//! The stream is split into an independently locked read side and write
//! side so a pending read never blocks a send. The mode is an explicit
//! state machine:
//!
//! ```text
//! Plain ──detach_plain──▶ Upgrading ──install_tls──▶ Tls
//!   │                         │                       │
//!   └────────────release──────┴───────────────────────┴──▶ Released
//! ```
//!
//! There is no path back from `Tls` to `Plain`. A failed upgrade leaves the
//! stream in `Upgrading`, where every read and write fails.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_rustls::TlsStream;

/// Default upper bound on a single received line, terminator included.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Errors raised by [`DualModeStream`].
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("line contains an embedded newline")]
    EmbeddedNewline,

    #[error("stream is already upgraded to TLS")]
    AlreadyUpgraded,

    #[error("stream is not waiting for a TLS upgrade")]
    NotDetached,

    #[error("{0} bytes of plaintext arrived ahead of the TLS upgrade")]
    PendingPlaintext(usize),

    #[error("stream is unavailable during TLS upgrade")]
    Upgrading,

    #[error("stream has been released")]
    Released,
}

/// Transport mode of a [`DualModeStream`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Plain = 0,
    Upgrading = 1,
    Tls = 2,
    Released = 3,
}

impl From<u8> for StreamMode {
    fn from(val: u8) -> Self {
        match val {
            0 => StreamMode::Plain,
            1 => StreamMode::Upgrading,
            2 => StreamMode::Tls,
            _ => StreamMode::Released,
        }
    }
}

enum ReadSide {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<ReadHalf<TlsStream<TcpStream>>>),
    Detached,
    Released,
}

enum WriteSide {
    Plain(OwnedWriteHalf),
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Detached,
    Released,
}

/// One logical line reader/writer over a socket.
pub struct DualModeStream {
    reader: Mutex<ReadSide>,
    writer: Mutex<WriteSide>,
    mode: AtomicU8,
    max_line_bytes: usize,
}

impl DualModeStream {
    pub fn new(stream: TcpStream, max_line_bytes: usize) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(ReadSide::Plain(BufReader::new(read))),
            writer: Mutex::new(WriteSide::Plain(write)),
            mode: AtomicU8::new(StreamMode::Plain as u8),
            max_line_bytes,
        }
    }

    pub fn mode(&self) -> StreamMode {
        StreamMode::from(self.mode.load(Ordering::Acquire))
    }

    pub fn is_upgraded(&self) -> bool {
        self.mode() == StreamMode::Tls
    }

    /// Read one line with the terminator stripped. `None` means EOF.
    ///
    /// Not cancel-safe: dropping the future mid-line loses the partial line.
    pub async fn read_line(&self) -> Result<Option<String>, StreamError> {
        let mut reader = self.reader.lock().await;
        match &mut *reader {
            ReadSide::Plain(r) => read_limited(r, self.max_line_bytes).await,
            ReadSide::Tls(r) => read_limited(r, self.max_line_bytes).await,
            ReadSide::Detached => Err(StreamError::Upgrading),
            ReadSide::Released => Err(StreamError::Released),
        }
    }

    /// Write one line and flush it before returning.
    pub async fn write_line(&self, line: &str) -> Result<(), StreamError> {
        self.writer().await.write_line(line).await
    }

    /// Exclusive access to the write side, held until the guard drops.
    pub(crate) async fn writer(&self) -> LineWriter<'_> {
        LineWriter(self.writer.lock().await)
    }

    /// Send the transport shutdown (FIN, or close_notify under TLS).
    pub async fn shutdown(&self) -> Result<(), StreamError> {
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            WriteSide::Plain(w) => w.shutdown().await?,
            WriteSide::Tls(w) => w.shutdown().await?,
            WriteSide::Detached | WriteSide::Released => {}
        }
        Ok(())
    }

    /// Drop both halves, closing the socket.
    pub async fn release(&self) {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        *reader = ReadSide::Released;
        *writer = WriteSide::Released;
        self.mode.store(StreamMode::Released as u8, Ordering::Release);
    }

    /// Take the plaintext socket back out for a TLS handshake.
    ///
    /// Fails if bytes beyond the last line read are already buffered, since
    /// they would otherwise be lost or misread as TLS records.
    pub(crate) async fn detach_plain(&self) -> Result<TcpStream, StreamError> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;

        let read = std::mem::replace(&mut *reader, ReadSide::Detached);
        let write = std::mem::replace(&mut *writer, WriteSide::Detached);

        match (read, write) {
            (ReadSide::Plain(r), WriteSide::Plain(w)) => {
                let buffered = r.buffer().len();
                if buffered > 0 {
                    *reader = ReadSide::Plain(r);
                    *writer = WriteSide::Plain(w);
                    return Err(StreamError::PendingPlaintext(buffered));
                }
                let stream = r
                    .into_inner()
                    .reunite(w)
                    .map_err(|e| StreamError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
                self.mode.store(StreamMode::Upgrading as u8, Ordering::Release);
                Ok(stream)
            }
            (read, write) => {
                let err = match (&read, &write) {
                    (ReadSide::Tls(_), _) => StreamError::AlreadyUpgraded,
                    (ReadSide::Released, _) | (_, WriteSide::Released) => StreamError::Released,
                    _ => StreamError::Upgrading,
                };
                *reader = read;
                *writer = write;
                Err(err)
            }
        }
    }

    /// Route all further reads and writes through `tls`.
    pub(crate) async fn install_tls(&self, tls: TlsStream<TcpStream>) -> Result<(), StreamError> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;

        match (&*reader, &*writer) {
            (ReadSide::Detached, WriteSide::Detached) => {}
            (ReadSide::Released, _) | (_, WriteSide::Released) => return Err(StreamError::Released),
            _ => return Err(StreamError::NotDetached),
        }

        let (read, write) = tokio::io::split(tls);
        *reader = ReadSide::Tls(BufReader::new(read));
        *writer = WriteSide::Tls(write);
        self.mode.store(StreamMode::Tls as u8, Ordering::Release);
        Ok(())
    }
}

/// Locked write side of a [`DualModeStream`].
pub(crate) struct LineWriter<'a>(MutexGuard<'a, WriteSide>);

impl LineWriter<'_> {
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<(), StreamError> {
        if line.contains('\n') {
            return Err(StreamError::EmbeddedNewline);
        }

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        match &mut *self.0 {
            WriteSide::Plain(w) => write_frame(w, &frame).await,
            WriteSide::Tls(w) => write_frame(w, &frame).await,
            WriteSide::Detached => Err(StreamError::Upgrading),
            WriteSide::Released => Err(StreamError::Released),
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_limited<R>(reader: &mut R, limit: usize) -> Result<Option<String>, StreamError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_line(&mut line)
        .await?;

    if read == 0 {
        return Ok(None);
    }

    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    } else if read > limit {
        return Err(StreamError::LineTooLong { limit });
    }

    Ok(Some(line))
}
