//! Line-oriented transport to a daemon over a unix socket or TCP.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::protocol::{Request, Response};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// Where a daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse `unix://path` or `tcp://host:port`. A bare path without a
    /// scheme is treated as a unix socket for older registries.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ClientError::InvalidAddress("address cannot be empty".into()));
        }
        if let Some(path) = address.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(ClientError::InvalidAddress(address.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(host) = address.strip_prefix(TCP_SCHEME) {
            if host.is_empty() {
                return Err(ClientError::InvalidAddress(address.to_string()));
            }
            return Ok(Endpoint::Tcp(host.to_string()));
        }
        if address.contains("://") {
            return Err(ClientError::InvalidAddress(format!(
                "unsupported scheme in {address}"
            )));
        }
        Ok(Endpoint::Unix(PathBuf::from(address)))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            Endpoint::Tcp(host) => write!(f, "{TCP_SCHEME}{host}"),
        }
    }
}

/// Either socket kind behind one `AsyncRead + AsyncWrite` type.
pub enum DaemonStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl DaemonStream {
    async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(DaemonStream::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Endpoint::Tcp(host) => Ok(DaemonStream::Tcp(TcpStream::connect(host.as_str()).await?)),
        }
    }
}

impl AsyncRead for DaemonStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            DaemonStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DaemonStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            DaemonStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_flush(cx),
            DaemonStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            DaemonStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Reads newline-terminated lines, refusing to buffer more than `limit`
/// bytes for one line.
///
/// An oversized line is consumed up to its newline and reported as
/// [`ClientError::LineTooLong`], so the next call starts on a fresh line.
pub struct LineReader<R> {
    inner: R,
    limit: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            limit,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let mut overflow = false;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if overflow {
                    return Err(ClientError::LineTooLong { limit: self.limit });
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };
            if !overflow {
                if self.buf.len() + chunk.len() > self.limit {
                    overflow = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }
            self.inner.consume(consumed);
            if done {
                break;
            }
        }
        if overflow {
            return Err(ClientError::LineTooLong { limit: self.limit });
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Remaining time before `deadline`, or `default` when the caller set none.
pub fn effective_timeout(deadline: Option<Instant>, default: Duration) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => default,
    }
}

/// One open connection to a daemon.
pub struct Connection {
    endpoint: Endpoint,
    reader: LineReader<BufReader<ReadHalf<DaemonStream>>>,
    writer: WriteHalf<DaemonStream>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect and, for network endpoints with a token, authenticate.
    pub async fn open(
        endpoint: &Endpoint,
        auth_token: &str,
        connect_timeout: Duration,
        max_line: usize,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, DaemonStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    address: endpoint.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ClientError::Timeout(connect_timeout)),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Connection {
            endpoint: endpoint.clone(),
            reader: LineReader::new(BufReader::new(read_half), max_line),
            writer: write_half,
        };

        let token = auth_token.trim();
        if endpoint.is_network() && !token.is_empty() {
            conn.authenticate(token, connect_timeout).await?;
        }
        debug!(endpoint = %conn.endpoint, "daemon connection open");
        Ok(conn)
    }

    async fn authenticate(&mut self, token: &str, limit: Duration) -> Result<()> {
        self.send_line(&format!("AUTH {token}\n")).await?;
        match self.read_line_within(limit).await? {
            Some(reply) if reply.trim() == "OK" => Ok(()),
            Some(reply) => {
                let _ = self.writer.shutdown().await;
                Err(ClientError::Auth(reply.trim().to_string()))
            }
            None => Err(ClientError::Auth("connection closed during handshake".into())),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let line = request.to_line()?;
        self.send_line(&line).await
    }

    pub async fn read_line(&mut self) -> Result<Option<String>> {
        self.reader.next_line().await
    }

    pub async fn read_line_within(&mut self, limit: Duration) -> Result<Option<String>> {
        match timeout(limit, self.reader.next_line()).await {
            Ok(line) => line,
            Err(_) => Err(ClientError::Timeout(limit)),
        }
    }

    /// Send one request and decode exactly one response line.
    pub async fn round_trip(&mut self, request: &Request, limit: Duration) -> Result<Response> {
        self.send(request).await?;
        match self.read_line_within(limit).await? {
            Some(line) if !line.trim().is_empty() => Response::parse(line.trim()),
            _ => Err(ClientError::NoResponse),
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
