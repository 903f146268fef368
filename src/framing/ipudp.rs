//! Minimal IPv4 + UDP wrapping, for links where the rover's network stack
//! headers travel inside the serial framing.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Endec;
use crate::{GdsError, Result};

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const PROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpUdpConfig {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for IpUdpConfig {
    fn default() -> Self {
        Self {
            src_addr: Ipv4Addr::new(192, 168, 1, 2),
            dst_addr: Ipv4Addr::new(192, 168, 150, 3),
            src_port: 8080,
            dst_port: 42000,
        }
    }
}

/// RFC 1071 ones' complement sum over big-endian 16-bit words.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|w| u32::from(u16::from_be_bytes([w[0], w.get(1).copied().unwrap_or(0)])))
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Default)]
pub struct IpUdp {
    config: IpUdpConfig,
}

impl IpUdp {
    pub fn new(config: IpUdpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IpUdpConfig {
        &self.config
    }
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

impl Endec for IpUdp {
    fn name(&self) -> &'static str {
        "ip_udp"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let udp_len = UDP_HEADER_LEN + data.len();
        let total_len = IPV4_HEADER_LEN + udp_len;
        let total_len = u16::try_from(total_len)
            .map_err(|_| GdsError::framing("ip_udp", format!("{} bytes won't fit one datagram", data.len())))?;

        let mut out = BytesMut::with_capacity(total_len.into());
        out.put_u8(0x45);
        out.put_u8(0);
        out.put_u16(total_len);
        out.put_u16(0); // identification
        out.put_u16(0); // flags + fragment offset
        out.put_u8(DEFAULT_TTL);
        out.put_u8(PROTO_UDP);
        out.put_u16(0);
        out.put_slice(&self.config.src_addr.octets());
        out.put_slice(&self.config.dst_addr.octets());
        let checksum = ipv4_checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());

        out.put_u16(self.config.src_port);
        out.put_u16(self.config.dst_port);
        out.put_u16(udp_len as u16);
        out.put_u16(0); // UDP checksum unused
        out.put_slice(data);
        Ok(out.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        parse_datagram(data).map(|d| d.payload.to_vec())
    }
}

/// A UDP datagram found inside an IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: &'a [u8],
}

/// Parses an IPv4 packet carrying UDP. Bytes past the IP total length are
/// ignored; a bad header checksum is only logged.
pub fn parse_datagram(data: &[u8]) -> Result<Datagram<'_>> {
    let err = |details: String| GdsError::framing("ip_udp", details);
    if data.len() < IPV4_HEADER_LEN + UDP_HEADER_LEN {
        return Err(err(format!("{} bytes is too short for IPv4+UDP", data.len())));
    }
    let version = data[0] >> 4;
    let ihl = usize::from(data[0] & 0x0F) * 4;
    if version != 4 || ihl < IPV4_HEADER_LEN {
        return Err(err(format!("bad version/IHL byte {:#04x}", data[0])));
    }
    let total_len = usize::from(be16(data, 2));
    if total_len > data.len() || total_len < ihl + UDP_HEADER_LEN {
        return Err(err(format!("total length {total_len} vs {} received", data.len())));
    }
    if data[9] != PROTO_UDP {
        return Err(err(format!("protocol {} is not UDP", data[9])));
    }
    if ipv4_checksum(&data[..ihl]) != 0 {
        debug!("IPv4 header checksum mismatch");
    }

    let addr = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
    let udp = &data[ihl..total_len];
    let udp_len = usize::from(be16(udp, 4));
    if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
        return Err(err(format!("UDP length {udp_len} vs {} available", udp.len())));
    }
    Ok(Datagram {
        src: SocketAddrV4::new(addr(12), be16(udp, 0)),
        dst: SocketAddrV4::new(addr(16), be16(udp, 2)),
        payload: &udp[UDP_HEADER_LEN..udp_len],
    })
}
