//! SLIP-framed byte streams: a serial device opened as a file, or TCP.

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::BytesMut;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use super::{FrameProcessor, Transceiver};
use crate::codec::packet::Packet;
use crate::framing::SlipCodec;
use crate::framing::slip::slip_encode;
use crate::{GdsError, Result};

/// Where the byte stream comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamSource {
    /// Serial device. Line settings (baud, 8N1) are configured outside the
    /// process, e.g. with `stty`; `baud` is recorded for logs.
    Serial { device: PathBuf, baud: u32 },
    Tcp { addr: SocketAddr },
}

impl std::fmt::Display for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSource::Serial { device, baud } => write!(f, "{}@{baud}", device.display()),
            StreamSource::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

/// Anything we can read frames from and write frames to.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

struct Io {
    reader: FramedRead<ReadHalf<Box<dyn ByteStream>>, SlipCodec>,
    writer: WriteHalf<Box<dyn ByteStream>>,
}

/// SLIP over a byte stream, with optional inner layers (e.g. IP/UDP).
pub struct StreamTransceiver {
    name: String,
    source: StreamSource,
    processor: FrameProcessor,
    io: Option<Io>,
}

impl StreamTransceiver {
    pub fn new(name: impl Into<String>, source: StreamSource, processor: FrameProcessor) -> Self {
        Self { name: name.into(), source, processor, io: None }
    }

    /// Wraps an already-open stream. `begin()` is not needed afterwards,
    /// and `restart()` reopens `source`.
    pub fn from_stream(
        name: impl Into<String>,
        source: StreamSource,
        processor: FrameProcessor,
        stream: impl ByteStream,
    ) -> Self {
        let mut xcvr = Self::new(name, source, processor);
        xcvr.attach(Box::new(stream));
        xcvr
    }

    fn attach(&mut self, stream: Box<dyn ByteStream>) {
        let (read, writer) = tokio::io::split(stream);
        self.io = Some(Io { reader: FramedRead::new(read, SlipCodec::new()), writer });
    }

    async fn open(source: &StreamSource) -> Result<Box<dyn ByteStream>> {
        match source {
            StreamSource::Serial { device, .. } => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(device)
                    .await
                    .map_err(|e| GdsError::connection_lost_with_source(format!("open {}", device.display()), Box::new(e)))?;
                Ok(Box::new(file))
            }
            StreamSource::Tcp { addr } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| GdsError::connection_lost_with_source(format!("connect {addr}"), Box::new(e)))?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait::async_trait]
impl Transceiver for StreamTransceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&mut self) -> Result<()> {
        let stream = Self::open(&self.source).await?;
        self.attach(stream);
        info!(layers = ?self.processor.chain().names(), "{} reading SLIP frames from {}", self.name, self.source);
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<Packet>> {
        let io = self.io.as_mut().ok_or_else(|| GdsError::connection_lost("transceiver not started"))?;
        let next = io.reader.next().await;
        let mut frames = match next {
            Some(Ok(frame)) => vec![frame],
            Some(Err(e)) => return Err(GdsError::connection_lost_with_source("stream read failed", Box::new(e))),
            None => {
                self.io = None;
                return Err(GdsError::connection_lost(format!("{} closed", self.source)));
            }
        };
        // Drain whatever else is already buffered.
        while let Some(Some(Ok(frame))) = io.reader.next().now_or_never() {
            frames.push(frame);
        }
        debug!(frames = frames.len(), "{} read", self.name);
        Ok(self.processor.process_all(frames))
    }

    async fn restart(&mut self) -> Result<()> {
        warn!("Restarting {} on {}", self.name, self.source);
        self.io = None;
        self.begin().await
    }

    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
        let inner = self.processor.wrap(bytes)?;
        let mut out = BytesMut::new();
        slip_encode(&inner, &mut out);
        let io = self.io.as_mut().ok_or_else(|| GdsError::connection_lost("transceiver not started"))?;
        io.writer
            .write_all(&out)
            .await
            .map_err(|e| GdsError::connection_lost_with_source("stream write failed", Box::new(e)))?;
        io.writer.flush().await?;
        debug!(len = out.len(), "{} sent", self.name);
        Ok(())
    }
}
