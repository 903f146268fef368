//! Typed payloads and the VLP codec.
//!
//! A common packet's VLP is a run of `(magic, body)` entries. Bodies carry
//! no length of their own; their size follows from the schema (telemetry
//! datatypes, event argument lists) or from an inline length (file blocks).
//! A body that can't be resolved therefore ends decoding of the VLP: the
//! payloads before it are kept and the packet is flagged.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::data::{WireCursor, decode_value, encode_value};
use super::magic::Magic;
use crate::standards::{Arg, DataStandards, opcode};
use crate::types::{DataPathway, DataSource, DownlinkTimes, Value};
use crate::{GdsError, Result};

/// Where a payload came from and when it was seen along the way.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub source: DataSource,
    pub pathway: DataPathway,
    pub downlink_times: DownlinkTimes,
    /// VLP entry bytes the payload was decoded from, magic included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl PayloadMeta {
    /// Metadata for a payload computed on the ground.
    pub fn generated(downlink_times: DownlinkTimes) -> Self {
        Self {
            source: DataSource::Generated,
            pathway: DataPathway::None,
            downlink_times,
            raw: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Full 16-bit module ID (`0x0200`), not the wire byte.
    pub module_id: u16,
    pub channel_id: u8,
    /// Rover-side timestamp in milliseconds.
    pub timestamp: u32,
    pub data: Value,
    pub meta: PayloadMeta,
}

impl TelemetryPayload {
    pub fn opcode(&self) -> u16 {
        opcode(self.module_id, self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub module_id: u16,
    pub event_id: u8,
    pub timestamp: u32,
    pub args: Vec<Value>,
    pub meta: PayloadMeta,
}

impl EventPayload {
    pub fn opcode(&self) -> u16 {
        opcode(self.module_id, self.event_id)
    }
}

/// Response to a command, echoed back under the magic it arrived under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub module_id: u16,
    pub command_id: u8,
    pub timestamp: u32,
    pub args: Vec<Value>,
    pub magic: Magic,
    pub meta: PayloadMeta,
}

impl CommandPayload {
    pub fn opcode(&self) -> u16 {
        opcode(self.module_id, self.command_id)
    }
}

/// Kind of file a file group reassembles into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Image,
    Uwb,
    Other(u8),
}

impl FileType {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x01 => FileType::Image,
            0x0F => FileType::Uwb,
            other => FileType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FileType::Image => 0x01,
            FileType::Uwb => 0x0F,
            FileType::Other(other) => other,
        }
    }
}

/// Per-line metadata carried by block 0 of every line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub callback_id: u16,
    pub timestamp_ms: u32,
    pub file_type: FileType,
    pub camera_num: u8,
    pub total_lines: u16,
    pub sensor_mode: u8,
}

impl FileMetadata {
    pub const SIZE: usize = 11;

    fn read(cursor: &mut WireCursor<'_>) -> Result<Self> {
        Ok(Self {
            callback_id: cursor.read()?,
            timestamp_ms: cursor.read()?,
            file_type: FileType::from_u8(cursor.read()?),
            camera_num: cursor.read()?,
            total_lines: cursor.read()?,
            sensor_mode: cursor.read()?,
        })
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u16(self.callback_id);
        out.put_u32(self.timestamp_ms);
        out.put_u8(self.file_type.to_u8());
        out.put_u8(self.camera_num);
        out.put_u16(self.total_lines);
        out.put_u8(self.sensor_mode);
    }
}

/// One block of one line of a file group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBlockPayload {
    pub file_group_id: u16,
    pub total_blocks: u16,
    /// 1-based; 0 is the line's metadata block.
    pub block_number: u16,
    pub line_number: u16,
    pub is_metadata: bool,
    pub data: Vec<u8>,
    pub possible_corruption: bool,
    pub file_metadata: Option<FileMetadata>,
    pub meta: PayloadMeta,
}

impl FileBlockPayload {
    const HEADER_SIZE: usize = 9;
    const FLAG_METADATA: u8 = 0x01;

    /// A data block. `block_number` must be at least 1.
    pub fn data_block(file_group_id: u16, line_number: u16, block_number: u16, total_blocks: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_group_id,
            total_blocks,
            block_number,
            line_number,
            is_metadata: block_number == 0,
            data: data.into(),
            possible_corruption: false,
            file_metadata: None,
            meta: PayloadMeta::default(),
        }
    }

    /// The metadata block (block 0) of a line.
    pub fn metadata_block(file_group_id: u16, line_number: u16, total_blocks: u16, metadata: FileMetadata) -> Self {
        Self {
            file_group_id,
            total_blocks,
            block_number: 0,
            line_number,
            is_metadata: true,
            data: Vec::new(),
            possible_corruption: false,
            file_metadata: Some(metadata),
            meta: PayloadMeta::default(),
        }
    }
}

/// Any payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Telemetry(TelemetryPayload),
    Event(EventPayload),
    Command(CommandPayload),
    FileBlock(FileBlockPayload),
}

impl Payload {
    pub fn meta(&self) -> &PayloadMeta {
        match self {
            Payload::Telemetry(p) => &p.meta,
            Payload::Event(p) => &p.meta,
            Payload::Command(p) => &p.meta,
            Payload::FileBlock(p) => &p.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut PayloadMeta {
        match self {
            Payload::Telemetry(p) => &mut p.meta,
            Payload::Event(p) => &mut p.meta,
            Payload::Command(p) => &mut p.meta,
            Payload::FileBlock(p) => &mut p.meta,
        }
    }

    pub fn downlink_times(&self) -> &DownlinkTimes {
        &self.meta().downlink_times
    }

    pub fn magic(&self) -> Magic {
        match self {
            Payload::Telemetry(_) => Magic::Telemetry,
            Payload::Event(_) => Magic::Event,
            Payload::Command(p) => p.magic,
            Payload::FileBlock(_) => Magic::FileBlock,
        }
    }

    /// Stamps packet-level metadata onto the payload.
    ///
    /// Downlink times are only overwritten where `times` has a value.
    pub fn stamp(&mut self, pathway: DataPathway, source: DataSource, times: &DownlinkTimes) {
        let meta = self.meta_mut();
        meta.pathway = pathway;
        meta.source = source;
        let dt = &mut meta.downlink_times;
        dt.scet_est = times.scet_est.or(dt.scet_est);
        dt.lander_rx = times.lander_rx.or(dt.lander_rx);
        dt.amcc_rx = times.amcc_rx.or(dt.amcc_rx);
        dt.pmcc_rx = times.pmcc_rx.or(dt.pmcc_rx);
    }

    /// Fully qualified `<Module>_<Entry>` name of a telemetry or event payload.
    pub fn qualified_name(&self, standards: &DataStandards) -> Option<String> {
        let (module, entry) = match self {
            Payload::Telemetry(p) => {
                let ch = standards.channel(p.opcode())?;
                (standards.module(ch.module), ch.name.as_str())
            }
            Payload::Event(p) => {
                let ev = standards.event(p.opcode())?;
                (standards.module(ev.module), ev.name.as_str())
            }
            _ => return None,
        };
        Some(format!("{}_{}", module.name, entry))
    }

    /// Appends this payload as a VLP entry, magic included.
    pub fn encode(&self, standards: &DataStandards, out: &mut BytesMut) -> Result<()> {
        out.put_u32(self.magic().code());
        match self {
            Payload::Telemetry(p) => {
                let ch = standards.channel(p.opcode()).ok_or_else(|| unknown_entry("channel", p.opcode()))?;
                put_header(out, p.module_id, p.channel_id, p.timestamp);
                encode_value(&p.data, ch.datatype, &ch.enum_members, out)
            }
            Payload::Event(p) => {
                let ev = standards.event(p.opcode()).ok_or_else(|| unknown_entry("event", p.opcode()))?;
                put_header(out, p.module_id, p.event_id, p.timestamp);
                encode_args(&p.args, &ev.args, out)
            }
            Payload::Command(p) => {
                let cmd = standards.command(p.opcode()).ok_or_else(|| unknown_entry("command", p.opcode()))?;
                put_header(out, p.module_id, p.command_id, p.timestamp);
                encode_args(&p.args, &cmd.args, out)
            }
            Payload::FileBlock(p) => {
                out.put_u16(p.file_group_id);
                out.put_u16(p.total_blocks);
                out.put_u16(p.block_number);
                out.put_u16(p.line_number);
                out.put_u8(if p.is_metadata { FileBlockPayload::FLAG_METADATA } else { 0 });
                match (&p.file_metadata, p.is_metadata) {
                    (Some(metadata), true) => metadata.write(out),
                    (None, true) => {
                        return Err(GdsError::ValueRange {
                            data_type: "file block".into(),
                            details: "metadata block without file metadata".into(),
                        });
                    }
                    (_, false) => {
                        let len = u16::try_from(p.data.len()).map_err(|_| GdsError::ValueRange {
                            data_type: "file block".into(),
                            details: format!("{} data bytes exceed u16", p.data.len()),
                        })?;
                        out.put_u16(len);
                        out.put_slice(&p.data);
                    }
                }
                Ok(())
            }
        }
    }
}

fn unknown_entry(kind: &str, opcode: u16) -> GdsError {
    GdsError::schema("payload", format!("no {kind} with opcode {opcode:#06x}"))
}

fn put_header(out: &mut BytesMut, module_id: u16, entry_id: u8, timestamp: u32) {
    out.put_u8((module_id >> 8) as u8);
    out.put_u8(entry_id);
    out.put_u32(timestamp);
}

fn encode_args(values: &[Value], args: &[Arg], out: &mut BytesMut) -> Result<()> {
    if values.len() != args.len() {
        return Err(GdsError::ValueRange {
            data_type: "args".into(),
            details: format!("expected {} args, got {}", args.len(), values.len()),
        });
    }
    for (value, arg) in values.iter().zip(args) {
        encode_value(value, arg.datatype, &arg.enum_members, out)?;
    }
    Ok(())
}

fn decode_args(cursor: &mut WireCursor<'_>, args: &[Arg]) -> Result<Vec<Value>> {
    args.iter()
        .map(|arg| decode_value(cursor, arg.datatype, &arg.enum_members))
        .collect()
}

/// Reads `(module byte, entry id, timestamp)` and returns the full module ID.
fn read_header(cursor: &mut WireCursor<'_>) -> Result<(u16, u8, u32)> {
    let module: u8 = cursor.read()?;
    Ok(((module as u16) << 8, cursor.read()?, cursor.read()?))
}

fn decode_body(magic: Magic, cursor: &mut WireCursor<'_>, standards: &DataStandards) -> Result<Payload> {
    let start = cursor.position();
    match magic {
        Magic::Telemetry => {
            let (module_id, channel_id, timestamp) = read_header(cursor)?;
            let op = opcode(module_id, channel_id);
            let ch = standards
                .channel(op)
                .ok_or_else(|| GdsError::payload_decoding(start, format!("no channel with opcode {op:#06x}")))?;
            let data = decode_value(cursor, ch.datatype, &ch.enum_members)?;
            Ok(Payload::Telemetry(TelemetryPayload {
                module_id,
                channel_id,
                timestamp,
                data,
                meta: PayloadMeta::default(),
            }))
        }
        Magic::Event => {
            let (module_id, event_id, timestamp) = read_header(cursor)?;
            let op = opcode(module_id, event_id);
            let ev = standards
                .event(op)
                .ok_or_else(|| GdsError::payload_decoding(start, format!("no event with opcode {op:#06x}")))?;
            let args = decode_args(cursor, &ev.args)?;
            Ok(Payload::Event(EventPayload { module_id, event_id, timestamp, args, meta: PayloadMeta::default() }))
        }
        Magic::Command => {
            let (module_id, command_id, timestamp) = read_header(cursor)?;
            let op = opcode(module_id, command_id);
            let cmd = standards
                .command(op)
                .ok_or_else(|| GdsError::payload_decoding(start, format!("no command with opcode {op:#06x}")))?;
            let args = decode_args(cursor, &cmd.args)?;
            Ok(Payload::Command(CommandPayload {
                module_id,
                command_id,
                timestamp,
                args,
                magic,
                meta: PayloadMeta::default(),
            }))
        }
        Magic::FileBlock => decode_file_block(cursor).map(Payload::FileBlock),
    }
}

fn decode_file_block(cursor: &mut WireCursor<'_>) -> Result<FileBlockPayload> {
    let start = cursor.position();
    if cursor.remaining() < FileBlockPayload::HEADER_SIZE {
        return Err(GdsError::payload_decoding(start, "truncated file block header"));
    }
    let file_group_id: u16 = cursor.read()?;
    let total_blocks: u16 = cursor.read()?;
    let block_number: u16 = cursor.read()?;
    let line_number: u16 = cursor.read()?;
    let flags: u8 = cursor.read()?;

    let flagged_metadata = flags & FileBlockPayload::FLAG_METADATA != 0;
    let is_metadata = block_number == 0;
    let mut possible_corruption = flagged_metadata != is_metadata;
    if total_blocks > 0 && block_number > total_blocks {
        possible_corruption = true;
    }

    let mut block = FileBlockPayload {
        file_group_id,
        total_blocks,
        block_number,
        line_number,
        is_metadata,
        data: Vec::new(),
        possible_corruption,
        file_metadata: None,
        meta: PayloadMeta::default(),
    };

    if is_metadata {
        if cursor.remaining() < FileMetadata::SIZE {
            block.possible_corruption = true;
            block.data = cursor.rest().to_vec();
        } else {
            block.file_metadata = Some(FileMetadata::read(cursor)?);
        }
    } else {
        let declared = if cursor.remaining() >= 2 { cursor.read::<u16>()? as usize } else { 0 };
        if declared > cursor.remaining() {
            block.possible_corruption = true;
            block.data = cursor.rest().to_vec();
        } else {
            block.data = cursor.take(declared)?.to_vec();
        }
    }

    if block.possible_corruption {
        warn!(
            file_group_id,
            line_number, block_number, total_blocks, "File block failed consistency checks"
        );
    }
    Ok(block)
}

/// Result of decoding a VLP.
#[derive(Debug, Default)]
pub struct VlpDecode {
    pub payloads: Vec<Payload>,
    /// Why decoding stopped early, if it did.
    pub corruption: Option<GdsError>,
}

/// Decodes every entry of a VLP, keeping what precedes the first bad entry.
pub fn decode_vlp(vlp: &[u8], standards: &DataStandards) -> VlpDecode {
    let mut cursor = WireCursor::new(vlp);
    let mut out = VlpDecode::default();
    while !cursor.is_empty() {
        let entry_start = cursor.position();
        let magic = match cursor.read::<u32>() {
            Ok(code) => match Magic::from_code(code) {
                Some(magic) => magic,
                None => {
                    out.corruption = Some(GdsError::payload_decoding(
                        entry_start,
                        format!("unknown magic {code:#010x}"),
                    ));
                    break;
                }
            },
            Err(e) => {
                out.corruption = Some(e);
                break;
            }
        };
        match decode_body(magic, &mut cursor, standards) {
            Ok(mut payload) => {
                payload.meta_mut().raw = Some(vlp[entry_start..cursor.position()].to_vec());
                let corrupt_block = matches!(&payload, Payload::FileBlock(b) if b.possible_corruption);
                out.payloads.push(payload);
                if corrupt_block && out.corruption.is_none() {
                    out.corruption = Some(GdsError::payload_decoding(
                        entry_start,
                        "file block failed consistency checks",
                    ));
                }
            }
            Err(e) => {
                out.corruption = Some(e);
                break;
            }
        }
    }
    out
}

/// Encodes payloads back-to-back as a VLP.
pub fn encode_vlp<'a>(payloads: impl IntoIterator<Item = &'a Payload>, standards: &DataStandards) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    for payload in payloads {
        payload.encode(standards, &mut out)?;
    }
    Ok(out)
}

/// Heterogeneous, order-preserving set of payloads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadCollection {
    payloads: Vec<Payload>,
}

impl PayloadCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Payload> {
        self.payloads.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Payload> {
        self.payloads.iter_mut()
    }

    pub fn telemetry(&self) -> impl Iterator<Item = &TelemetryPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Telemetry(t) => Some(t),
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &EventPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Event(e) => Some(e),
            _ => None,
        })
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Command(c) => Some(c),
            _ => None,
        })
    }

    pub fn file_blocks(&self) -> impl Iterator<Item = &FileBlockPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::FileBlock(b) => Some(b),
            _ => None,
        })
    }
}

impl Extend<Payload> for PayloadCollection {
    fn extend<T: IntoIterator<Item = Payload>>(&mut self, iter: T) {
        self.payloads.extend(iter);
    }
}

impl FromIterator<Payload> for PayloadCollection {
    fn from_iter<T: IntoIterator<Item = Payload>>(iter: T) -> Self {
        Self { payloads: iter.into_iter().collect() }
    }
}

impl IntoIterator for PayloadCollection {
    type Item = Payload;
    type IntoIter = std::vec::IntoIter<Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.payloads.into_iter()
    }
}

impl<'a> IntoIterator for &'a PayloadCollection {
    type Item = &'a Payload;
    type IntoIter = std::slice::Iter<'a, Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.payloads.iter()
    }
}
