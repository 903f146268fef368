//! Transceivers: where downlinked packets come from and uplinked bytes go.
//!
//! Byte transceivers ([`StreamTransceiver`], [`UdpTransceiver`],
//! [`PcapTransceiver`]) produce raw frames, strip their framing layers and hand each frame to the
//! [`PacketDispatcher`]. Record transceivers ([`ReplayTransceiver`]) work from
//! YAMCS-style parameter records instead of bytes.
//!
//! A [`Transceiver`] is owned by exactly one task, usually the one
//! [`driver::TransceiverDriver::spawn`] starts.

pub mod driver;
pub mod params;
pub mod pcap;
pub mod replay;
pub mod stream;
pub mod udp;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::Result;
use crate::codec::packet::{Packet, PacketDispatcher};
use crate::framing::EndecChain;
use crate::logging::hexdump;
use crate::types::{DataPathway, DataSource, DownlinkTimes};

pub use driver::{DriverChannels, TransceiverDriver};
pub use params::{ParamValue, ParameterMap, ParameterRecord};
pub use pcap::{PcapOptions, PcapTransceiver};
pub use replay::{ReplayOptions, ReplayTransceiver};
pub use stream::{StreamSource, StreamTransceiver};
pub use udp::UdpTransceiver;

/// A source of downlinked packets and a sink for uplinked bytes.
#[async_trait::async_trait]
pub trait Transceiver: Send + 'static {
    fn name(&self) -> &str;

    /// Opens the underlying transport.
    async fn begin(&mut self) -> Result<()>;

    /// Waits for and returns the next packet(s).
    ///
    /// A lost transport is reported as [`crate::GdsError::Connection`]; the
    /// caller decides whether to `restart()`.
    async fn read(&mut self) -> Result<Vec<Packet>>;

    /// Drops and reopens the transport.
    async fn restart(&mut self) -> Result<()>;

    /// Sends one uplink packet, applying this transceiver's framing.
    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()>;
}

#[async_trait::async_trait]
impl Transceiver for Box<dyn Transceiver> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn begin(&mut self) -> Result<()> {
        (**self).begin().await
    }

    async fn read(&mut self) -> Result<Vec<Packet>> {
        (**self).read().await
    }

    async fn restart(&mut self) -> Result<()> {
        (**self).restart().await
    }

    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send_byte_packet(bytes).await
    }
}

/// Turns raw frames into packets: strips inner framing layers, then
/// dispatches.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    chain: Arc<EndecChain>,
    dispatcher: Arc<PacketDispatcher>,
    pathway: DataPathway,
    source: DataSource,
}

impl FrameProcessor {
    pub fn new(chain: EndecChain, dispatcher: Arc<PacketDispatcher>, pathway: DataPathway, source: DataSource) -> Self {
        Self { chain: Arc::new(chain), dispatcher, pathway, source }
    }

    pub fn chain(&self) -> &EndecChain {
        &self.chain
    }

    /// Decodes one frame. A frame whose framing layers fail is dropped.
    pub fn process(&self, frame: &[u8]) -> Option<Packet> {
        let inner = match self.chain.decode(frame) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(bytes = %hexdump(frame), "Dropping frame: {e}");
                return None;
            }
        };
        let times = DownlinkTimes { pmcc_rx: Some(Utc::now()), ..DownlinkTimes::default() };
        let packet = self.dispatcher.decode(&inner, self.pathway, self.source, &times);
        debug!("{packet}");
        Some(packet)
    }

    pub fn process_all<I, B>(&self, frames: I) -> Vec<Packet>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        frames.into_iter().filter_map(|f| self.process(f.as_ref())).collect()
    }

    /// Applies the inner framing layers to an uplink packet.
    pub fn wrap(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.chain.encode(bytes)
    }
}
