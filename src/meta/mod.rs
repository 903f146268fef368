//! Derived ("meta") telemetry.
//!
//! A [`MetaField`] watches named channels and events, caches their recent
//! payloads in a [`MetaFieldState`] and computes a new channel value or event
//! when its [`UpdateBehavior`] says so. Fields are grouped into
//! [`MetaModule`]s which register in the standards like flight modules, so
//! derived payloads encode, decode and feed other fields by name.
//! [`MetaEngine`] drives all modules and re-feeds what they produce.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use iris_gds::meta::{MetaEngine, MetaModuleConfig};
//! use iris_gds::standards::DataStandards;
//!
//! # fn main() -> iris_gds::Result<()> {
//! let base = DataStandards::load("standards.yaml")?;
//! let config: MetaModuleConfig = serde_yaml_ng::from_str(
//!     "{name: Power, id: 0xE100, fields: [{kind: linear, name: CurrentMa, input: Power_Current, scale: 1000.0}]}",
//! )
//! .map_err(|e| iris_gds::GdsError::config(e.to_string()))?;
//! let mut engine = MetaEngine::new(&base, vec![config.build()?])?;
//! let derived = engine.process(Vec::new());
//! assert!(derived.is_empty());
//! # Ok(())
//! # }
//! ```

mod engine;
mod field;
mod fields;
mod module;

pub use engine::{MAX_DEPTH, MetaEngine};
pub use field::{
    Calculation, MetaField, MetaFieldSpec, MetaFieldState, MetaProto, MetaValue, PayloadFilter, UpdateBehavior,
};
pub use fields::{FieldConfig, Latency, Linear, MetaModuleConfig, Threshold, TimeWeightedAverage, TriggerConfig};
pub use module::{MAX_FIELDS, MetaModule, NAME_PREFIX, downlink_times_from};
