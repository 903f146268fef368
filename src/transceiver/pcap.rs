//! Plays back UDP traffic captured in a pcap or pcapng file.
//!
//! Every captured UDP datagram is one frame: the link, IPv4 and UDP headers
//! are stripped and the payload goes through the [`FrameProcessor`] like a
//! frame off any other link. Frames are released one per `period_ms`; a
//! reader that falls behind gets every frame it missed at once.

use std::path::PathBuf;

use pcap_file::DataLink;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tracing::{debug, error, info, trace, warn};

use super::{FrameProcessor, Transceiver};
use crate::codec::packet::Packet;
use crate::framing::parse_datagram;
use crate::{GdsError, Result};

/// How long a finished, non-looping playback idles per read.
const IDLE_AT_END: Duration = Duration::from_secs(5);
const MIN_PERIOD: Duration = Duration::from_millis(1);
const PCAPNG_MAGIC: [u8; 4] = [0x0A, 0x0D, 0x0D, 0x0A];

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcapOptions {
    pub path: PathBuf,
    /// Only keep datagrams sent to this UDP port.
    pub filter_port: Option<u16>,
    /// Datagrams to skip from the start of the capture.
    pub skip: usize,
    /// Bytes to drop from the front of every payload.
    pub deadspace: usize,
    /// Time between released frames.
    pub period_ms: u64,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
}

impl Default for PcapOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("capture.pcap"),
            filter_port: None,
            skip: 0,
            deadspace: 0,
            period_ms: 100,
            loop_playback: false,
        }
    }
}

/// Why captured records were left out, for the load summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub records: usize,
    pub not_udp: usize,
    pub skipped: usize,
    pub wrong_port: usize,
    pub empty: usize,
}

/// Link-layer payload of one captured record, when it carries IPv4.
fn ip_packet(link: DataLink, record: &[u8]) -> Option<&[u8]> {
    let be16 = |at: usize| record.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    match link {
        DataLink::ETHERNET => match be16(12)? {
            ETHERTYPE_IPV4 => record.get(14..),
            ETHERTYPE_VLAN if be16(16)? == ETHERTYPE_IPV4 => record.get(18..),
            _ => None,
        },
        DataLink::LINUX_SLL if be16(14)? == ETHERTYPE_IPV4 => record.get(16..),
        DataLink::NULL => record.get(4..),
        DataLink::RAW | DataLink::IPV4 => Some(record),
        _ => None,
    }
}

fn capture_error(e: impl std::fmt::Display) -> GdsError {
    GdsError::framing("pcap", e.to_string())
}

/// Calls `f` with every packet record in a pcap or pcapng capture.
fn for_each_record(capture: &[u8], mut f: impl FnMut(DataLink, &[u8])) -> Result<()> {
    if capture.starts_with(&PCAPNG_MAGIC) {
        let mut reader = PcapNgReader::new(capture).map_err(capture_error)?;
        let mut interfaces = Vec::new();
        while let Some(block) = reader.next_block() {
            match block.map_err(capture_error)? {
                Block::InterfaceDescription(idb) => interfaces.push(idb.linktype),
                Block::EnhancedPacket(epb) => match interfaces.get(epb.interface_id as usize) {
                    Some(&link) => f(link, &epb.data),
                    None => warn!(interface = epb.interface_id, "packet on an undescribed interface"),
                },
                Block::SimplePacket(spb) => {
                    if let Some(&link) = interfaces.first() {
                        f(link, &spb.data);
                    }
                }
                _ => {}
            }
        }
    } else {
        let mut reader = PcapReader::new(capture).map_err(capture_error)?;
        let link = reader.header().datalink;
        while let Some(packet) = reader.next_packet() {
            f(link, &packet.map_err(capture_error)?.data);
        }
    }
    Ok(())
}

/// Pulls the UDP payloads `opts` selects out of a capture, in capture order.
pub fn extract_frames(capture: &[u8], opts: &PcapOptions) -> Result<(Vec<Vec<u8>>, ExtractStats)> {
    let mut stats = ExtractStats::default();
    let mut frames = Vec::new();
    let mut udp_seen = 0;
    for_each_record(capture, |link, record| {
        stats.records += 1;
        let Some(datagram) = ip_packet(link, record).and_then(|ip| parse_datagram(ip).ok()) else {
            stats.not_udp += 1;
            return;
        };
        udp_seen += 1;
        if udp_seen <= opts.skip {
            stats.skipped += 1;
            return;
        }
        if opts.filter_port.is_some_and(|port| port != datagram.dst.port()) {
            stats.wrong_port += 1;
            return;
        }
        match datagram.payload.get(opts.deadspace..) {
            Some(payload) if !payload.is_empty() => frames.push(payload.to_vec()),
            _ => stats.empty += 1,
        }
    })?;
    Ok((frames, stats))
}

pub struct PcapTransceiver {
    name: String,
    opts: PcapOptions,
    processor: FrameProcessor,
    frames: Option<Vec<Vec<u8>>>,
    head: usize,
    last_release: Instant,
}

impl PcapTransceiver {
    pub fn new(name: impl Into<String>, opts: PcapOptions, processor: FrameProcessor) -> Self {
        Self { name: name.into(), opts, processor, frames: None, head: 0, last_release: Instant::now() }
    }

    /// Plays frames already in memory. `begin()` reloads from `opts.path`.
    pub fn with_frames(name: impl Into<String>, opts: PcapOptions, processor: FrameProcessor, frames: Vec<Vec<u8>>) -> Self {
        let mut xcvr = Self::new(name, opts, processor);
        xcvr.frames = Some(frames);
        xcvr.rewind();
        xcvr
    }

    pub fn remaining(&self) -> usize {
        self.frames.as_ref().map_or(0, |f| f.len().saturating_sub(self.head))
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.opts.period_ms).max(MIN_PERIOD)
    }

    /// Back to the first frame, with the first one due immediately.
    fn rewind(&mut self) {
        self.head = 0;
        let now = Instant::now();
        self.last_release = now.checked_sub(self.period()).unwrap_or(now);
    }
}

#[async_trait::async_trait]
impl Transceiver for PcapTransceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&mut self) -> Result<()> {
        let path = &self.opts.path;
        let capture = tokio::fs::read(path).await.map_err(|e| GdsError::io_error(path, e))?;
        let (frames, stats) = extract_frames(&capture, &self.opts)?;
        if frames.is_empty() {
            error!(?stats, "no usable datagrams in {}", path.display());
        } else {
            info!(
                ?stats,
                layers = ?self.processor.chain().names(),
                "{} playing {} frames from {} every {}ms (loop: {})",
                self.name,
                frames.len(),
                path.display(),
                self.period().as_millis(),
                self.opts.loop_playback
            );
        }
        self.frames = Some(frames);
        self.rewind();
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<Packet>> {
        let total = match &self.frames {
            Some(frames) if !frames.is_empty() => frames.len(),
            Some(_) => {
                sleep(IDLE_AT_END).await;
                return Ok(Vec::new());
            }
            None => return Err(GdsError::connection_lost("pcap not loaded")),
        };

        if self.head >= total {
            if !self.opts.loop_playback {
                trace!("{} reached the end of its capture", self.name);
                sleep(IDLE_AT_END).await;
                return Ok(Vec::new());
            }
            debug!("{} looping its capture", self.name);
            self.rewind();
        }

        let period = self.period();
        sleep_until(self.last_release + period).await;
        let now = Instant::now();
        let periods = (now - self.last_release).as_nanos() / period.as_nanos();
        let count = usize::try_from(periods).unwrap_or(usize::MAX).max(1);
        let end = self.head.saturating_add(count).min(total);

        let Some(frames) = &self.frames else { return Ok(Vec::new()) };
        let packets = self.processor.process_all(&frames[self.head..end]);
        trace!(count = end - self.head, "{} released frames", self.name);
        self.head = end;
        self.last_release = now;
        Ok(packets)
    }

    async fn restart(&mut self) -> Result<()> {
        self.rewind();
        Ok(())
    }

    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("{} is a recording and can't uplink, dropping {} bytes", self.name, bytes.len());
        Ok(())
    }
}
