//! One frame per UDP datagram.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{FrameProcessor, Transceiver};
use crate::codec::packet::Packet;
use crate::{GdsError, Result};

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpTransceiver {
    name: String,
    bind: SocketAddr,
    /// Uplink target. Learned from the first datagram when not configured.
    peer: Option<SocketAddr>,
    processor: FrameProcessor,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpTransceiver {
    pub fn new(name: impl Into<String>, bind: SocketAddr, peer: Option<SocketAddr>, processor: FrameProcessor) -> Self {
        Self { name: name.into(), bind, peer, processor, socket: None, buf: vec![0; MAX_DATAGRAM] }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait::async_trait]
impl Transceiver for UdpTransceiver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .map_err(|e| GdsError::connection_lost_with_source(format!("bind {}", self.bind), Box::new(e)))?;
        info!(layers = ?self.processor.chain().names(), "{} listening on {}", self.name, self.bind);
        self.socket = Some(socket);
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<Packet>> {
        let socket = self.socket.as_ref().ok_or_else(|| GdsError::connection_lost("transceiver not started"))?;
        let (len, from) = socket
            .recv_from(&mut self.buf)
            .await
            .map_err(|e| GdsError::connection_lost_with_source("recv failed", Box::new(e)))?;
        if self.peer.is_none() {
            debug!("{} uplink peer is now {from}", self.name);
            self.peer = Some(from);
        }
        Ok(self.processor.process(&self.buf[..len]).into_iter().collect())
    }

    async fn restart(&mut self) -> Result<()> {
        self.socket = None;
        self.begin().await
    }

    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(peer) = self.peer else {
            warn!("{} has no uplink peer yet, dropping {} bytes", self.name, bytes.len());
            return Ok(());
        };
        let socket = self.socket.as_ref().ok_or_else(|| GdsError::connection_lost("transceiver not started"))?;
        let datagram = self.processor.wrap(bytes)?;
        socket
            .send_to(&datagram, peer)
            .await
            .map_err(|e| GdsError::connection_lost_with_source(format!("send to {peer}"), Box::new(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::PacketDispatcher;
    use crate::framing::EndecChain;
    use crate::test_utils::fixtures;
    use crate::types::{DataPathway, DataSource};
    use std::sync::Arc;

    #[tokio::test]
    async fn datagram_roundtrip() {
        let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(fixtures::standards())));
        let processor =
            FrameProcessor::new(EndecChain::default(), dispatcher.clone(), DataPathway::Wireless, DataSource::UdpDirect);
        let mut xcvr = UdpTransceiver::new("wifi", "127.0.0.1:0".parse().unwrap(), None, processor);
        xcvr.begin().await.unwrap();
        let addr = xcvr.local_addr().unwrap();

        let rover = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = fixtures::common_packet(&dispatcher, 8, &[fixtures::telemetry(4)]);
        rover.send_to(&frame, addr).await.unwrap();

        let packets = xcvr.read().await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pathway, DataPathway::Wireless);

        xcvr.send_byte_packet(b"cmd").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = rover.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"cmd");
    }

    #[tokio::test]
    async fn send_without_peer_is_dropped() {
        let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(fixtures::standards())));
        let processor = FrameProcessor::new(EndecChain::default(), dispatcher, DataPathway::Wireless, DataSource::UdpDirect);
        let mut xcvr = UdpTransceiver::new("wifi", "127.0.0.1:0".parse().unwrap(), None, processor);
        xcvr.begin().await.unwrap();
        assert!(xcvr.send_byte_packet(b"x").await.is_ok());
    }
}
