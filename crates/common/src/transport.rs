//! Local channel transport over a Unix domain socket.
//!
//! A rendezvous name maps to `<runtime_dir>/<name>.sock` and a sibling
//! `<name>.lock`. Binding is arbitrated by a non-blocking `flock` on the lock
//! file: exactly one process can hold it, and the kernel drops it when the
//! holder dies, so a crashed primary never leaves the endpoint wedged.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::protocol::{decode, encode, DecodeError, Message, MAX_FRAME_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid rendezvous name '{0}'")]
    InvalidName(String),
    #[error("address in use: {}", .0.display())]
    AddressInUse(PathBuf),
    #[error("connection refused: {}", .0.display())]
    ConnectionRefused(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Filesystem location of a rendezvous name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    socket_path: PathBuf,
    lock_path: PathBuf,
}

impl Endpoint {
    pub fn new(runtime_dir: &Path, name: &str) -> Result<Self, TransportError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !name.starts_with('.');
        if !valid {
            return Err(TransportError::InvalidName(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            socket_path: runtime_dir.join(format!("{}.sock", name)),
            lock_path: runtime_dir.join(format!("{}.lock", name)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Bound endpoint. Holds the rendezvous lock for as long as it lives.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    endpoint: Endpoint,
    _lock: File,
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Connection::new(stream))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Still holding the lock here, so nobody else can have re-bound yet.
        let _ = fs::remove_file(&self.endpoint.socket_path);
    }
}

/// Claim the endpoint. Fails with [`TransportError::AddressInUse`] when any
/// other process (or another listener in this one) holds it.
pub fn try_bind(endpoint: &Endpoint) -> Result<Listener, TransportError> {
    if let Some(parent) = endpoint.lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&endpoint.lock_path)?;

    if let Err(err) = lock.try_lock_exclusive() {
        if err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        {
            return Err(TransportError::AddressInUse(endpoint.socket_path.clone()));
        }
        return Err(err.into());
    }

    // Lock holder owns the socket path; anything left there is stale.
    match fs::remove_file(&endpoint.socket_path) {
        Ok(()) => debug!(
            socket = %endpoint.socket_path.display(),
            "Removed stale rendezvous socket"
        ),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let inner = match UnixListener::bind(&endpoint.socket_path) {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            return Err(TransportError::AddressInUse(endpoint.socket_path.clone()))
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Listener {
        inner,
        endpoint: endpoint.clone(),
        _lock: lock,
    })
}

/// Open a connection to whoever holds the endpoint.
pub async fn connect(endpoint: &Endpoint) -> Result<Connection, TransportError> {
    match UnixStream::connect(&endpoint.socket_path).await {
        Ok(stream) => Ok(Connection::new(stream)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            Err(TransportError::ConnectionRefused(
                endpoint.socket_path.clone(),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

/// Bidirectional framed connection.
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<Option<Message>, FrameError> {
        self.reader.next_message().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[derive(Debug)]
pub struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(half),
            buf: Vec::with_capacity(512),
        }
    }

    /// Next message, or `None` on a clean EOF between frames.
    pub async fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            self.buf.clear();
            let limit = (MAX_FRAME_BYTES + 1) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') {
                if self.buf.len() > MAX_FRAME_BYTES {
                    return Err(DecodeError::TooLong.into());
                }
                // EOF in the middle of a frame.
                return Err(DecodeError::Truncated.into());
            }
            if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Ok(Some(decode(&self.buf)?));
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self { inner: half }
    }

    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.inner.write_all(&encode(msg)).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
