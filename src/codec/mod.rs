//! Wire codecs: scalar data, payload magics, payloads and packets.

pub mod data;
pub mod magic;
pub mod packet;
pub mod payload;

pub use magic::Magic;
pub use packet::{Packet, PacketCodec, PacketDispatcher, PacketKind};
pub use payload::{
    CommandPayload, EventPayload, FileBlockPayload, FileMetadata, FileType, Payload, PayloadCollection, PayloadMeta,
    TelemetryPayload,
};
