//! Data standards: the static schema of modules, channels, events and commands.
//!
//! The schema is stored as a flat arena. Modules, channels, events and commands
//! each live in their own table and refer to each other through typed indices,
//! never through references. Payloads only ever carry wire IDs (opcodes), so
//! nothing from the arena crosses a process boundary.
//!
//! Standards are built once at startup (from YAML plus the prebuilt modules,
//! plus any meta modules) and then shared read-only behind an `Arc`.
//!
//! ## File format
//!
//! ```yaml
//! modules:
//!   - name: Imu
//!     id: 0x0200
//!     telemetry:
//!       - { id: 3, name: XAcc, datatype: u8 }
//!       - id: 4
//!         name: Mode
//!         datatype: enum<u8>
//!         enum: [{ name: IDLE, value: 0 }, { name: ACTIVE, value: 1 }]
//!     events:
//!       - id: 0
//!         name: Booted
//!         severity: ACTIVITY_HI
//!         format_string: "Booted after %d resets"
//!         args: [{ name: resets, datatype: u16 }]
//! ```

pub mod prebuilt;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::types::DataType;
use crate::{GdsError, Result};

/// Index of a module in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIdx(u32);
/// Index of a telemetry channel in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelIdx(u32);
/// Index of an event in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventIdx(u32);
/// Index of a command in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandIdx(u32);

/// Builds the 16-bit opcode of an entry.
///
/// Module IDs occupy the high byte (`0xFB00`), entry IDs the low byte.
pub const fn opcode(module_id: u16, entry_id: u8) -> u16 {
    (module_id & 0xFF00) | entry_id as u16
}

/// Named value of an enum channel or argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl EnumMember {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self { name: name.into(), value, comment: None }
    }
}

/// Event severity as used by the flight software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Diagnostic,
    #[default]
    ActivityLo,
    ActivityHi,
    Command,
    WarningLo,
    WarningHi,
    Fatal,
}

/// Argument of an event or command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub name: String,
    pub datatype: DataType,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_members: Vec<EnumMember>,
}

impl Arg {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self { name: name.into(), datatype, enum_members: Vec::new() }
    }
}

/// Serialized form of a telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDef {
    pub id: u8,
    pub name: String,
    pub datatype: DataType,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_members: Vec<EnumMember>,
}

impl ChannelDef {
    pub fn new(id: u8, name: impl Into<String>, datatype: DataType) -> Self {
        Self { id, name: name.into(), datatype, enum_members: Vec::new() }
    }

    pub fn with_enum(mut self, members: Vec<EnumMember>) -> Self {
        self.enum_members = members;
        self
    }
}

/// Serialized form of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDef {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub format_string: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

/// Serialized form of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDef {
    pub id: u8,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

/// Serialized form of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    pub id: u16,
    #[serde(default)]
    pub telemetry: Vec<ChannelDef>,
    #[serde(default)]
    pub events: Vec<EventDef>,
    #[serde(default)]
    pub commands: Vec<CommandDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StandardsFile {
    #[serde(default)]
    modules: Vec<ModuleDef>,
}

/// A module in the arena.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: u16,
    pub name: String,
    channels: Vec<ChannelIdx>,
    events: Vec<EventIdx>,
    commands: Vec<CommandIdx>,
}

impl Module {
    /// High byte of the module ID, as transmitted in opcodes.
    pub const fn wire_id(&self) -> u8 {
        (self.id >> 8) as u8
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryChannel {
    pub module: ModuleIdx,
    pub id: u8,
    pub name: String,
    pub datatype: DataType,
    pub enum_members: Vec<EnumMember>,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub module: ModuleIdx,
    pub id: u8,
    pub name: String,
    pub severity: Severity,
    pub format_string: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub module: ModuleIdx,
    pub id: u8,
    pub name: String,
    pub args: Vec<Arg>,
}

/// Validated, immutable schema arena.
#[derive(Debug, Clone, Default)]
pub struct DataStandards {
    modules: Vec<Module>,
    channels: Vec<TelemetryChannel>,
    events: Vec<Event>,
    commands: Vec<Command>,
    module_by_id: HashMap<u16, ModuleIdx>,
    module_by_name: HashMap<String, ModuleIdx>,
    channel_by_opcode: HashMap<u16, ChannelIdx>,
    event_by_opcode: HashMap<u16, EventIdx>,
    command_by_opcode: HashMap<u16, CommandIdx>,
    defs: Vec<ModuleDef>,
}

impl DataStandards {
    /// Builds and validates standards from module definitions.
    pub fn new(modules: Vec<ModuleDef>) -> Result<Self> {
        let mut standards = Self::default();
        for def in modules {
            standards.insert(def)?;
        }
        debug!(
            modules = standards.modules.len(),
            channels = standards.channels.len(),
            events = standards.events.len(),
            "Data standards built"
        );
        Ok(standards)
    }

    /// Parses standards from YAML text and adds the prebuilt modules.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: StandardsFile = serde_yaml_ng::from_str(yaml).map_err(|e| {
            GdsError::schema("data standards YAML", e.to_string())
        })?;
        let mut modules = file.modules;
        modules.extend(prebuilt::modules());
        Self::new(modules)
    }

    /// Loads standards from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| GdsError::io_error(path, e))?;
        let standards = Self::from_yaml_str(&yaml)?;
        info!(
            "Loaded data standards from {}: {} modules, {} channels, {} events, {} commands",
            path.display(),
            standards.modules.len(),
            standards.channels.len(),
            standards.events.len(),
            standards.commands.len()
        );
        Ok(standards)
    }

    /// Returns a new arena with extra modules added (used for meta modules).
    pub fn with_modules(&self, extra: impl IntoIterator<Item = ModuleDef>) -> Result<Self> {
        let mut defs = self.defs.clone();
        defs.extend(extra);
        Self::new(defs)
    }

    fn insert(&mut self, def: ModuleDef) -> Result<()> {
        validate_module(&def)?;
        if self.module_by_id.contains_key(&def.id) {
            return Err(GdsError::schema(
                "module",
                format!("duplicate module id {:#06x} ({})", def.id, def.name),
            ));
        }
        if self.module_by_name.contains_key(&def.name) {
            return Err(GdsError::schema("module", format!("duplicate module name '{}'", def.name)));
        }

        let midx = ModuleIdx(self.modules.len() as u32);
        let mut module = Module {
            id: def.id,
            name: def.name.clone(),
            channels: Vec::with_capacity(def.telemetry.len()),
            events: Vec::with_capacity(def.events.len()),
            commands: Vec::with_capacity(def.commands.len()),
        };

        for ch in &def.telemetry {
            let idx = ChannelIdx(self.channels.len() as u32);
            self.channels.push(TelemetryChannel {
                module: midx,
                id: ch.id,
                name: ch.name.clone(),
                datatype: ch.datatype,
                enum_members: ch.enum_members.clone(),
            });
            self.channel_by_opcode.insert(opcode(def.id, ch.id), idx);
            module.channels.push(idx);
        }
        for ev in &def.events {
            let idx = EventIdx(self.events.len() as u32);
            self.events.push(Event {
                module: midx,
                id: ev.id,
                name: ev.name.clone(),
                severity: ev.severity,
                format_string: ev.format_string.clone(),
                args: ev.args.clone(),
            });
            self.event_by_opcode.insert(opcode(def.id, ev.id), idx);
            module.events.push(idx);
        }
        for cmd in &def.commands {
            let idx = CommandIdx(self.commands.len() as u32);
            self.commands.push(Command {
                module: midx,
                id: cmd.id,
                name: cmd.name.clone(),
                args: cmd.args.clone(),
            });
            self.command_by_opcode.insert(opcode(def.id, cmd.id), idx);
            module.commands.push(idx);
        }

        self.module_by_id.insert(def.id, midx);
        self.module_by_name.insert(def.name.clone(), midx);
        self.modules.push(module);
        self.defs.push(def);
        Ok(())
    }

    pub fn module(&self, idx: ModuleIdx) -> &Module {
        &self.modules[idx.0 as usize]
    }

    pub fn module_by_id(&self, id: u16) -> Option<&Module> {
        self.module_by_id.get(&id).map(|idx| self.module(*idx))
    }

    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        self.module_by_name.get(name).map(|idx| self.module(*idx))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    /// Looks up a channel by opcode (case-sensitive, exact).
    pub fn channel(&self, opcode: u16) -> Option<&TelemetryChannel> {
        self.channel_by_opcode.get(&opcode).map(|idx| &self.channels[idx.0 as usize])
    }

    pub fn event(&self, opcode: u16) -> Option<&Event> {
        self.event_by_opcode.get(&opcode).map(|idx| &self.events[idx.0 as usize])
    }

    pub fn command(&self, opcode: u16) -> Option<&Command> {
        self.command_by_opcode.get(&opcode).map(|idx| &self.commands[idx.0 as usize])
    }

    pub fn channels_of<'a>(&'a self, module: &'a Module) -> impl Iterator<Item = &'a TelemetryChannel> {
        module.channels.iter().map(|idx| &self.channels[idx.0 as usize])
    }

    pub fn events_of<'a>(&'a self, module: &'a Module) -> impl Iterator<Item = &'a Event> {
        module.events.iter().map(|idx| &self.events[idx.0 as usize])
    }

    pub fn commands_of<'a>(&'a self, module: &'a Module) -> impl Iterator<Item = &'a Command> {
        module.commands.iter().map(|idx| &self.commands[idx.0 as usize])
    }

    pub fn channel_by_name(&self, module: &str, channel: &str) -> Option<&TelemetryChannel> {
        let module = self.module_by_name(module)?;
        self.channels_of(module).find(|c| c.name == channel)
    }

    pub fn event_by_name(&self, module: &str, event: &str) -> Option<&Event> {
        let module = self.module_by_name(module)?;
        self.events_of(module).find(|e| e.name == event)
    }

    /// Opcode of a channel.
    pub fn channel_opcode(&self, channel: &TelemetryChannel) -> u16 {
        opcode(self.module(channel.module).id, channel.id)
    }

    pub fn event_opcode(&self, event: &Event) -> u16 {
        opcode(self.module(event.module).id, event.id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Checks a single module definition for internal consistency.
fn validate_module(def: &ModuleDef) -> Result<()> {
    let ctx = || format!("module '{}'", def.name);
    if def.id & 0x00FF != 0 {
        return Err(GdsError::schema(
            ctx(),
            format!("module id {:#06x} must leave the low byte free for entry ids", def.id),
        ));
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for ch in &def.telemetry {
        if !ids.insert(ch.id) || !names.insert(ch.name.as_str()) {
            return Err(GdsError::schema(ctx(), format!("duplicate channel {} '{}'", ch.id, ch.name)));
        }
        validate_enum(&ch.name, ch.datatype, &ch.enum_members)?;
    }

    ids.clear();
    names.clear();
    for ev in &def.events {
        if !ids.insert(ev.id) || !names.insert(ev.name.as_str()) {
            return Err(GdsError::schema(ctx(), format!("duplicate event {} '{}'", ev.id, ev.name)));
        }
        for arg in &ev.args {
            validate_enum(&arg.name, arg.datatype, &arg.enum_members)?;
        }
    }

    ids.clear();
    names.clear();
    for cmd in &def.commands {
        if !ids.insert(cmd.id) || !names.insert(cmd.name.as_str()) {
            return Err(GdsError::schema(ctx(), format!("duplicate command {} '{}'", cmd.id, cmd.name)));
        }
        for arg in &cmd.args {
            validate_enum(&arg.name, arg.datatype, &arg.enum_members)?;
        }
    }
    Ok(())
}

fn validate_enum(owner: &str, datatype: DataType, members: &[EnumMember]) -> Result<()> {
    match (datatype.is_enum(), members.is_empty()) {
        (true, true) => {
            return Err(GdsError::schema(owner, "enum datatype without members"));
        }
        (false, false) => {
            return Err(GdsError::schema(owner, "enum members on a non-enum datatype"));
        }
        _ => {}
    }

    let mut names = HashSet::new();
    let mut values = HashSet::new();
    for member in members {
        if !is_upper_snake(&member.name) {
            return Err(GdsError::schema(
                owner,
                format!("enum member '{}' is not UPPER_SNAKE", member.name),
            ));
        }
        if !names.insert(member.name.as_str()) || !values.insert(member.value) {
            return Err(GdsError::schema(
                owner,
                format!("duplicate enum member '{}' = {}", member.name, member.value),
            ));
        }
    }
    Ok(())
}

fn is_upper_snake(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Formats a free-form name (e.g. `"Service active"`) as an UPPER_SNAKE constant.
pub fn standardize_constant_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_lower = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_uppercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarType;

    const YAML: &str = r#"
modules:
  - name: Imu
    id: 0x0200
    telemetry:
      - { id: 3, name: XAcc, datatype: u8 }
      - id: 4
        name: Mode
        datatype: enum<u8>
        enum: [{ name: IDLE, value: 0 }, { name: ACTIVE, value: 1 }]
    events:
      - id: 0
        name: Booted
        severity: ACTIVITY_HI
        format_string: "Booted after %d resets"
        args: [{ name: resets, datatype: u16 }]
"#;

    #[test]
    fn loads_yaml_and_prebuilts() {
        let standards = DataStandards::from_yaml_str(YAML).unwrap();
        let ch = standards.channel(0x0203).expect("XAcc");
        assert_eq!(ch.name, "XAcc");
        assert_eq!(ch.datatype, DataType::Scalar(ScalarType::U8));
        assert_eq!(standards.module(ch.module).name, "Imu");
        assert_eq!(standards.channel_opcode(ch), 0x0203);
        assert!(standards.module_by_name(prebuilt::WATCHDOG_HEARTBEAT).is_some());

        let ev = standards.event_by_name("Imu", "Booted").unwrap();
        assert_eq!(ev.severity, Severity::ActivityHi);
        assert_eq!(standards.event_opcode(ev), 0x0200);
    }

    #[test]
    fn lookups_are_case_sensitive() {
        let standards = DataStandards::from_yaml_str(YAML).unwrap();
        assert!(standards.channel_by_name("Imu", "XAcc").is_some());
        assert!(standards.channel_by_name("imu", "XAcc").is_none());
        assert!(standards.channel_by_name("Imu", "xacc").is_none());
    }

    #[test]
    fn rejects_duplicates_and_bad_enums() {
        let dup = vec![ModuleDef {
            name: "A".into(),
            id: 0x0100,
            telemetry: vec![
                ChannelDef::new(1, "X", DataType::Scalar(ScalarType::U8)),
                ChannelDef::new(1, "Y", DataType::Scalar(ScalarType::U8)),
            ],
            events: vec![],
            commands: vec![],
        }];
        assert!(DataStandards::new(dup).is_err());

        let bad_enum = vec![ModuleDef {
            name: "A".into(),
            id: 0x0100,
            telemetry: vec![
                ChannelDef::new(1, "X", DataType::Enum(ScalarType::U8))
                    .with_enum(vec![EnumMember::new("lower", 0)]),
            ],
            events: vec![],
            commands: vec![],
        }];
        assert!(DataStandards::new(bad_enum).is_err());

        let low_byte = vec![ModuleDef {
            name: "A".into(),
            id: 0x0101,
            telemetry: vec![],
            events: vec![],
            commands: vec![],
        }];
        assert!(DataStandards::new(low_byte).is_err());
    }

    #[test]
    fn with_modules_keeps_existing_entries() {
        let base = DataStandards::from_yaml_str(YAML).unwrap();
        let extended = base
            .with_modules([ModuleDef {
                name: "MetaModExtra".into(),
                id: 0x3100,
                telemetry: vec![ChannelDef::new(0, "Avg", DataType::Scalar(ScalarType::F64))],
                events: vec![],
                commands: vec![],
            }])
            .unwrap();
        assert!(extended.channel(0x0203).is_some());
        assert!(extended.channel(0x3100).is_some());
        assert!(base.channel(0x3100).is_none());
    }

    #[test]
    fn constant_names_are_standardized() {
        assert_eq!(standardize_constant_name("Service active"), "SERVICE_ACTIVE");
        assert_eq!(standardize_constant_name("deactivating"), "DEACTIVATING");
        assert_eq!(standardize_constant_name("CruisePhase-2"), "CRUISE_PHASE_2");
    }
}
