//! Pluggable delivery mechanisms used by [`Subscriber`](crate::Subscriber)s.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::reader::Line;

/// Delivers lines to their final destination.
///
/// Each [`Subscriber`](crate::Subscriber) owns its connector exclusively, so
/// implementations take `&mut self` and need no internal locking. A connector
/// that wants retries implements them inside `send`.
pub trait Connector: Send {
    /// Delivers one line.
    fn send(&mut self, line: &Line) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Releases resources. Called exactly once, after the last `send`.
    fn close(&mut self) -> impl Future<Output = Result<(), ConnectorError>> + Send;
}

/// Accepts and discards every line.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopConnector;

impl Connector for NoopConnector {
    async fn send(&mut self, _line: &Line) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Forwards lines into an in-process channel.
///
/// Closing the connector closes the channel, so the receiving side observes
/// the end of the stream.
#[derive(Debug)]
pub struct ChannelConnector {
    sender: Option<mpsc::UnboundedSender<Line>>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Line>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (ChannelConnector { sender: Some(tx) }, rx)
    }
}

impl Connector for ChannelConnector {
    async fn send(&mut self, line: &Line) -> Result<(), ConnectorError> {
        let sender = self.sender.as_ref().ok_or(ConnectorError::Closed)?;

        sender
            .send(line.clone())
            .map_err(|_| ConnectorError::Closed)
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.sender.take();
        Ok(())
    }
}

/// Writes each line, newline terminated, to an [`AsyncWrite`].
///
/// Covers files, standard output and TCP peers.
pub struct WriterConnector<W> {
    writer: W,
    with_source: bool,
    closed: bool,
}

/// A [`WriterConnector`] sending newline-delimited lines to a TCP peer.
pub type TcpConnector = WriterConnector<TcpStream>;

impl<W> fmt::Debug for WriterConnector<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterConnector")
            .field("with_source", &self.with_source)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<W> WriterConnector<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        WriterConnector {
            writer,
            with_source: false,
            closed: false,
        }
    }

    /// Prefixes every line with its source path and `": "`.
    pub fn with_source(mut self) -> Self {
        self.with_source = true;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterConnector<BufWriter<File>> {
    /// Appends lines to the file at `path`, creating it if needed.
    pub async fn append_to(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(WriterConnector::new(BufWriter::new(file)))
    }
}

impl WriterConnector<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        WriterConnector::new(tokio::io::stdout())
    }
}

impl TcpConnector {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(WriterConnector::new(stream))
    }
}

impl<W> Connector for WriterConnector<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, line: &Line) -> Result<(), ConnectorError> {
        if self.closed {
            return Err(ConnectorError::Closed);
        }

        let mut buf = Vec::with_capacity(line.line().len() + 1);
        if self.with_source {
            buf.extend_from_slice(line.source().to_string_lossy().as_bytes());
            buf.extend_from_slice(b": ");
        }
        buf.extend_from_slice(line.line().as_bytes());
        buf.push(b'\n');

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.writer.flush().await?;
        self.writer.shutdown().await?;

        Ok(())
    }
}
