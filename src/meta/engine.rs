//! Runs payloads through every meta module and feeds the results back in.

use std::sync::Arc;

use tracing::{error, trace};

use super::module::MetaModule;
use crate::Result;
use crate::codec::packet::Packet;
use crate::codec::payload::Payload;
use crate::standards::DataStandards;

/// Rounds of re-feeding derived payloads before a chain is cut.
pub const MAX_DEPTH: usize = 10;

#[derive(Debug)]
pub struct MetaEngine {
    standards: Arc<DataStandards>,
    modules: Vec<MetaModule>,
}

impl MetaEngine {
    /// Registers `modules` on top of `base` so derived payloads resolve by name.
    pub fn new(base: &DataStandards, modules: Vec<MetaModule>) -> Result<Self> {
        let standards = base.with_modules(modules.iter().map(MetaModule::module_def))?;
        Ok(Self { standards: Arc::new(standards), modules })
    }

    /// Standards extended with every meta module.
    pub fn standards(&self) -> &Arc<DataStandards> {
        &self.standards
    }

    pub fn modules(&self) -> &[MetaModule] {
        &self.modules
    }

    pub fn process_packet(&mut self, packet: &Packet) -> Vec<Payload> {
        let inputs: Vec<Payload> = packet.payloads.iter().cloned().collect();
        self.process(inputs)
    }

    /// Returns every payload derivable from `payloads`, in generation order.
    pub fn process(&mut self, payloads: Vec<Payload>) -> Vec<Payload> {
        let mut generated = Vec::new();
        let mut frontier: Vec<Payload> =
            payloads.into_iter().filter(|p| matches!(p, Payload::Telemetry(_) | Payload::Event(_))).collect();

        for depth in 0..=MAX_DEPTH {
            if frontier.is_empty() {
                break;
            }
            if depth == MAX_DEPTH {
                error!(
                    pending = frontier.len(),
                    "meta derivation still producing after {MAX_DEPTH} rounds, possible cyclic dependency"
                );
                break;
            }
            let mut next = Vec::new();
            for payload in &frontier {
                let name = payload.qualified_name(&self.standards);
                for module in &mut self.modules {
                    next.extend(module.process(name.as_deref(), payload));
                }
            }
            trace!(depth, derived = next.len(), "meta round");
            generated.extend(next.iter().cloned());
            frontier = next;
        }
        generated
    }

    pub fn reset_all(&mut self) {
        for module in &mut self.modules {
            module.reset();
        }
    }
}
