//! A named group of derived fields that behaves like a flight module.

use std::time::Instant;

use tracing::{debug, error};

use super::field::{Calculation, MetaField, MetaFieldState, MetaProto, MetaValue, UpdateBehavior};
use crate::codec::payload::{EventPayload, Payload, PayloadMeta, TelemetryPayload};
use crate::standards::ModuleDef;
use crate::types::{DownlinkStage, DownlinkTimes};
use crate::{GdsError, Result};

/// Prefix of every meta module's name in the standards.
pub const NAME_PREFIX: &str = "MetaMod";

/// Most channels, and separately most events, one module may hold.
pub const MAX_FIELDS: usize = 0xFF;

#[derive(Debug)]
struct Slot {
    field: Box<dyn MetaField>,
    state: MetaFieldState,
}

impl Slot {
    /// Runs the trigger logic for one ingested payload.
    fn step(&mut self, name: Option<&str>, payload: &Payload, now: Instant) -> Option<Calculation> {
        let spec = self.field.spec();
        if let Some(name) = name {
            self.state.absorb(name, payload);
        }
        if !self.state.has_min_values(spec.min_values) {
            return None;
        }
        let ready = match spec.update_behavior {
            UpdateBehavior::Any => self.state.received_count() > 0,
            UpdateBehavior::All => self.state.received_count() == spec.watching.len(),
            UpdateBehavior::TimeOnly => true,
        };
        if !ready {
            return None;
        }
        if let Some(interval) = spec.min_interval
            && self.state.since_last_emit(now) < interval
        {
            return None;
        }

        let deprecated = spec.deprecated;
        let result = self.field.calculate(&self.state);
        self.state.mark_emitted(now);
        match result {
            Ok(_) if deprecated => {
                debug!(field = self.field.spec().proto.name(), "deprecated field computed, not emitting");
                None
            }
            Ok(calc) => Some(calc),
            Err(e) => {
                error!(field = self.field.spec().proto.name(), "meta field calculation failed: {e}");
                None
            }
        }
    }
}

/// Derived channels and events published under one module ID.
#[derive(Debug)]
pub struct MetaModule {
    name: String,
    id: u16,
    channels: Vec<Slot>,
    events: Vec<Slot>,
}

impl MetaModule {
    /// Builds a module from its fields. Channel and event IDs follow
    /// declaration order within each kind.
    pub fn new(name: &str, id: u16, fields: Vec<Box<dyn MetaField>>) -> Result<Self> {
        let name = format!("{NAME_PREFIX}{name}");
        let now = Instant::now();
        let (mut channels, mut events) = (Vec::new(), Vec::new());
        for field in fields {
            field.spec().validate()?;
            let state = MetaFieldState::new(field.spec(), now);
            let slot = Slot { field, state };
            match slot.field.spec().proto {
                MetaProto::Channel(_) => channels.push(slot),
                MetaProto::Event(_) => events.push(slot),
            }
        }
        if channels.len() > MAX_FIELDS || events.len() > MAX_FIELDS {
            return Err(GdsError::schema(&name, format!("more than {MAX_FIELDS} entries of one kind")));
        }
        Ok(Self { name, id: id & 0xFF00, channels, events })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Schema entry to register alongside the flight modules.
    pub fn module_def(&self) -> ModuleDef {
        let telemetry = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.field.spec().proto {
                MetaProto::Channel(c) => Some(crate::standards::ChannelDef { id: i as u8, ..c.clone() }),
                MetaProto::Event(_) => None,
            })
            .collect();
        let events = self
            .events
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.field.spec().proto {
                MetaProto::Event(e) => Some(crate::standards::EventDef { id: i as u8, ..e.clone() }),
                MetaProto::Channel(_) => None,
            })
            .collect();
        ModuleDef { name: self.name.clone(), id: self.id, telemetry, events, commands: Vec::new() }
    }

    /// Feeds one payload, known by `name` in the standards, to every field.
    pub fn process(&mut self, name: Option<&str>, payload: &Payload) -> Vec<Payload> {
        self.process_at(name, payload, Instant::now())
    }

    pub fn process_at(&mut self, name: Option<&str>, payload: &Payload, now: Instant) -> Vec<Payload> {
        let mut out = Vec::new();
        for (i, slot) in self.channels.iter_mut().enumerate() {
            if let Some(calc) = slot.step(name, payload, now) {
                out.extend(build_payload(self.id, i as u8, calc));
            }
        }
        for (i, slot) in self.events.iter_mut().enumerate() {
            if let Some(calc) = slot.step(name, payload, now) {
                out.extend(build_payload(self.id, i as u8, calc));
            }
        }
        out
    }

    /// Clears every field's caches and trigger state.
    pub fn reset(&mut self) {
        let now = Instant::now();
        for slot in self.channels.iter_mut().chain(self.events.iter_mut()) {
            slot.state.reset(now);
        }
    }
}

fn build_payload(module_id: u16, entry: u8, calc: Calculation) -> Option<Payload> {
    let meta = PayloadMeta::generated(downlink_times_from(&calc.factors));
    let payload = match calc.value? {
        MetaValue::Telemetry(data) => {
            Payload::Telemetry(TelemetryPayload { module_id, channel_id: entry, timestamp: 0, data, meta })
        }
        MetaValue::Event(args) => Payload::Event(EventPayload { module_id, event_id: entry, timestamp: 0, args, meta }),
    };
    Some(payload)
}

/// Picks the downlink times of a derived payload from its factors.
///
/// The most upstream stage any factor carries decides; the factor with the
/// newest time at that stage donates all its times.
pub fn downlink_times_from(factors: &[Payload]) -> DownlinkTimes {
    for stage in DownlinkStage::PREFERENCE {
        let newest = factors
            .iter()
            .filter_map(|p| p.downlink_times().get(stage).map(|t| (t, p)))
            .max_by_key(|(t, _)| *t);
        if let Some((_, payload)) = newest {
            return *payload.downlink_times();
        }
    }
    DownlinkTimes::generated_now()
}
