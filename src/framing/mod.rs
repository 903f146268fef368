//! Framing layers that sit between a byte transport and the packet codecs.
//!
//! Each layer implements [`Endec`]. A transceiver holds an ordered
//! [`EndecChain`]: encoding applies the layers innermost first, decoding
//! strips them outermost first.

pub mod ipudp;
pub mod slip;

use serde::{Deserialize, Serialize};

use crate::Result;

pub use ipudp::{Datagram, IpUdp, IpUdpConfig, parse_datagram};
pub use slip::{Slip, SlipCodec, SlipDecoder};

/// One reversible framing layer.
pub trait Endec: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identity layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Endec for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Configurable layer selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndecKind {
    Slip,
    IpUdp(IpUdpConfig),
    Passthrough,
}

impl EndecKind {
    pub fn build(&self) -> Box<dyn Endec> {
        match self {
            EndecKind::Slip => Box::new(Slip),
            EndecKind::IpUdp(cfg) => Box::new(IpUdp::new(cfg.clone())),
            EndecKind::Passthrough => Box::new(Passthrough),
        }
    }
}

/// Layers listed outermost first, as they appear on the wire.
#[derive(Debug, Default)]
pub struct EndecChain {
    layers: Vec<Box<dyn Endec>>,
}

impl EndecChain {
    pub fn new(layers: Vec<Box<dyn Endec>>) -> Self {
        Self { layers }
    }

    pub fn from_kinds(kinds: &[EndecKind]) -> Self {
        Self::new(kinds.iter().map(EndecKind::build).collect())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for layer in self.layers.iter().rev() {
            out = layer.encode(&out)?;
        }
        Ok(out)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for layer in &self.layers {
            out = layer.decode(&out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_strips_outermost_first() {
        let chain = EndecChain::from_kinds(&[EndecKind::Slip, EndecKind::IpUdp(IpUdpConfig::default())]);
        assert_eq!(chain.names(), vec!["slip", "ip_udp"]);
        let wire = chain.encode(b"\xC0payload").unwrap();
        assert_eq!(wire.first(), Some(&slip::END));
        assert_eq!(chain.decode(&wire).unwrap(), b"\xC0payload");
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = EndecChain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.decode(b"abc").unwrap(), b"abc");
        assert_eq!(Passthrough.encode(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn kinds_parse_from_yaml() {
        let kinds: Vec<EndecKind> = serde_yaml_ng::from_str("- kind: slip\n- kind: ip_udp\n  dst_port: 9000\n").unwrap();
        let EndecKind::IpUdp(cfg) = &kinds[1] else { panic!("expected ip_udp") };
        assert_eq!(cfg.dst_port, 9000);
        assert_eq!(cfg.src_port, IpUdpConfig::default().src_port);
    }
}
