//! Stock derived fields, buildable from YAML.
//!
//! ```yaml
//! name: Power
//! id: 0xE100
//! fields:
//!   - kind: time_weighted_average
//!     name: VoltageAvg
//!     watching: [Power_Voltage]
//!     last_n: 10
//!     trigger: { cache_depth: 10 }
//!   - kind: threshold
//!     name: Overcurrent
//!     input: Power_Current
//!     above: 2.5
//! ```

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::field::{Calculation, MetaField, MetaFieldSpec, MetaFieldState, MetaProto, UpdateBehavior};
use super::module::MetaModule;
use crate::codec::payload::Payload;
use crate::standards::{Arg, ChannelDef, EventDef, Severity};
use crate::types::{DataType, DownlinkStage, ScalarType, Value};
use crate::{GdsError, Result};

const F64: DataType = DataType::Scalar(ScalarType::F64);

/// Trigger settings shared by every stock field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub cache_depth: Option<usize>,
    pub min_values: Option<usize>,
    pub update_behavior: UpdateBehavior,
    pub min_interval_ms: Option<u64>,
    pub deprecated: bool,
}

impl TriggerConfig {
    fn apply(&self, mut spec: MetaFieldSpec) -> MetaFieldSpec {
        if let Some(depth) = self.cache_depth {
            spec = spec.cache_depth(depth);
        }
        if let Some(n) = self.min_values {
            spec = spec.min_values(n);
        }
        if let Some(ms) = self.min_interval_ms {
            spec = spec.min_interval(Duration::from_millis(ms));
        }
        spec = spec.update_behavior(self.update_behavior);
        if self.deprecated { spec.deprecated() } else { spec }
    }
}

fn default_scale() -> f64 {
    1.0
}

/// Declarative description of one stock field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldConfig {
    /// Time-weighted mean of numeric inputs.
    TimeWeightedAverage {
        name: String,
        watching: Vec<String>,
        #[serde(default)]
        last_n: Option<usize>,
        #[serde(default)]
        window_secs: Option<f64>,
        #[serde(default)]
        trigger: TriggerConfig,
    },
    /// `scale * x + offset` of a channel, or of one event argument.
    Linear {
        name: String,
        input: String,
        /// Event argument index; channels ignore it.
        #[serde(default)]
        arg: Option<usize>,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default)]
        trigger: TriggerConfig,
    },
    /// Seconds between two downlink stages of the newest input.
    Latency {
        name: String,
        watching: Vec<String>,
        from: DownlinkStage,
        to: DownlinkStage,
        #[serde(default)]
        trigger: TriggerConfig,
    },
    /// Event raised when a channel rises above a level.
    Threshold {
        name: String,
        input: String,
        above: f64,
        #[serde(default)]
        trigger: TriggerConfig,
    },
}

impl FieldConfig {
    pub fn build(&self) -> Result<Box<dyn MetaField>> {
        let channel = |name: &str| MetaProto::Channel(ChannelDef::new(0, name, F64));
        Ok(match self {
            FieldConfig::TimeWeightedAverage { name, watching, last_n, window_secs, trigger } => {
                let window = window_secs
                    .map(|s| TimeDelta::try_milliseconds((s * 1000.0) as i64).ok_or_else(|| bad(name, "window too large")))
                    .transpose()?;
                Box::new(TimeWeightedAverage {
                    spec: trigger.apply(MetaFieldSpec::new(channel(name), watching.iter().cloned())),
                    last_n: *last_n,
                    window,
                })
            }
            FieldConfig::Linear { name, input, arg, scale, offset, trigger } => Box::new(Linear {
                spec: trigger.apply(MetaFieldSpec::new(channel(name), [input.clone()])),
                input: input.clone(),
                arg: *arg,
                scale: *scale,
                offset: *offset,
            }),
            FieldConfig::Latency { name, watching, from, to, trigger } => Box::new(Latency {
                spec: trigger.apply(MetaFieldSpec::new(channel(name), watching.iter().cloned())),
                from: *from,
                to: *to,
            }),
            FieldConfig::Threshold { name, input, above, trigger } => {
                let proto = MetaProto::Event(EventDef {
                    id: 0,
                    name: name.clone(),
                    severity: Severity::WarningHi,
                    format_string: format!("{input} rose above {above}: {{}}"),
                    args: vec![Arg::new("value", F64)],
                });
                Box::new(Threshold {
                    spec: trigger.apply(MetaFieldSpec::new(proto, [input.clone()])),
                    input: input.clone(),
                    above: *above,
                    tripped: false,
                })
            }
        })
    }
}

fn bad(field: &str, details: &str) -> GdsError {
    GdsError::MetaField { field: field.to_string(), details: details.to_string() }
}

/// One meta module as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaModuleConfig {
    pub name: String,
    pub id: u16,
    pub fields: Vec<FieldConfig>,
}

impl MetaModuleConfig {
    pub fn build(&self) -> Result<MetaModule> {
        let fields = self.fields.iter().map(FieldConfig::build).collect::<Result<Vec<_>>>()?;
        MetaModule::new(&self.name, self.id, fields)
    }
}

fn numeric(payload: &Payload, arg: Option<usize>) -> Option<f64> {
    match payload {
        Payload::Telemetry(t) => t.data.as_f64(),
        Payload::Event(e) => e.args.get(arg?)?.as_f64(),
        _ => None,
    }
}

#[derive(Debug)]
pub struct TimeWeightedAverage {
    spec: MetaFieldSpec,
    last_n: Option<usize>,
    window: Option<TimeDelta>,
}

impl MetaField for TimeWeightedAverage {
    fn spec(&self) -> &MetaFieldSpec {
        &self.spec
    }

    fn calculate(&mut self, state: &MetaFieldState) -> Result<Calculation> {
        Ok(match state.time_weighted_average(self.last_n, self.window, None, None) {
            Some((avg, factors)) => Calculation::telemetry(Value::F64(avg), factors),
            None => Calculation::none(),
        })
    }
}

#[derive(Debug)]
pub struct Linear {
    spec: MetaFieldSpec,
    input: String,
    arg: Option<usize>,
    scale: f64,
    offset: f64,
}

impl MetaField for Linear {
    fn spec(&self) -> &MetaFieldSpec {
        &self.spec
    }

    fn calculate(&mut self, state: &MetaFieldState) -> Result<Calculation> {
        let Some(latest) = state.get_latest(&self.input) else { return Ok(Calculation::none()) };
        let x = numeric(latest, self.arg)
            .ok_or_else(|| bad(self.spec.proto.name(), &format!("{} is not numeric", self.input)))?;
        Ok(Calculation::telemetry(Value::F64(self.scale * x + self.offset), vec![latest.clone()]))
    }
}

#[derive(Debug)]
pub struct Latency {
    spec: MetaFieldSpec,
    from: DownlinkStage,
    to: DownlinkStage,
}

impl MetaField for Latency {
    fn spec(&self) -> &MetaFieldSpec {
        &self.spec
    }

    fn calculate(&mut self, state: &MetaFieldState) -> Result<Calculation> {
        let Some(newest) = state.get_recent_across(1, None, None).pop() else { return Ok(Calculation::none()) };
        let times = newest.downlink_times();
        let (Some(a), Some(b)) = (times.get(self.from), times.get(self.to)) else {
            return Ok(Calculation::none());
        };
        let secs = (b - a).num_microseconds().map_or(f64::NAN, |us| us as f64 / 1e6);
        Ok(Calculation::telemetry(Value::F64(secs), vec![newest.clone()]))
    }
}

/// Fires once per upward crossing; re-arms when the input drops back.
#[derive(Debug)]
pub struct Threshold {
    spec: MetaFieldSpec,
    input: String,
    above: f64,
    tripped: bool,
}

impl MetaField for Threshold {
    fn spec(&self) -> &MetaFieldSpec {
        &self.spec
    }

    fn calculate(&mut self, state: &MetaFieldState) -> Result<Calculation> {
        let Some(latest) = state.get_latest(&self.input) else { return Ok(Calculation::none()) };
        let Some(x) = numeric(latest, None) else { return Ok(Calculation::none()) };
        let was = std::mem::replace(&mut self.tripped, x > self.above);
        if self.tripped && !was {
            return Ok(Calculation::event(vec![Value::F64(x)], vec![latest.clone()]));
        }
        Ok(Calculation::none())
    }
}
