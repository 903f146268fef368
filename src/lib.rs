//! Downlink pipeline for the Iris lunar rover ground data system.
//!
//! Bytes come off a serial line, a UDP socket or a YAMCS archive, get
//! unframed (SLIP, IP/UDP), decoded into typed packets and payloads against
//! the data standards, enriched with derived MetaField payloads, and
//! published on a topic-addressed IPC bus. File blocks on the bus are
//! reassembled into images.
//!
//! # Pipeline
//!
//! ```text
//! Transceiver ─► framing ─► PacketDispatcher ─► IPC(DL_PACKETS)
//!     ─► MetaEngine ─► IPC(DL_PAYLOADS) ─► FileBlockAssembler ─► exports
//! ```
//!
//! Each stage runs in its own process (see the `iris-xcvr`, `iris-meta` and
//! `iris-imager` binaries); within a process everything runs on a
//! single-threaded tokio runtime.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use iris_gds::codec::PacketDispatcher;
//! use iris_gds::standards::{DataStandards, prebuilt};
//! use iris_gds::types::{DataPathway, DataSource, DownlinkTimes};
//!
//! # fn main() -> iris_gds::Result<()> {
//! let standards = Arc::new(DataStandards::new(prebuilt::modules())?);
//! let dispatcher = PacketDispatcher::new(standards);
//! let packet = dispatcher.decode(&[0xAA; 16], DataPathway::Wired, DataSource::SerialDirect, &DownlinkTimes::default());
//! assert_eq!(packet.kind.name(), "UnsupportedPacket");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
mod error;
pub mod files;
pub mod framing;
pub mod ipc;
pub mod logging;
pub mod meta;
pub mod retry;
pub mod standards;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transceiver;
pub mod types;

pub use error::*;
