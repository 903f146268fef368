//! A single derived channel or event and the cache it computes from.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::payload::Payload;
use crate::standards::{ChannelDef, EventDef};
use crate::types::Value;
use crate::{GdsError, Result};

/// When a field recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateBehavior {
    /// Any watched input arrived since the last emission.
    #[default]
    Any,
    /// Every watched input arrived since the last emission.
    All,
    /// Only the minimum interval gates emission.
    TimeOnly,
}

/// Schema prototype of a field. Its `id` is ignored; the owning module
/// assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaProto {
    Channel(ChannelDef),
    Event(EventDef),
}

impl MetaProto {
    pub fn name(&self) -> &str {
        match self {
            MetaProto::Channel(c) => &c.name,
            MetaProto::Event(e) => &e.name,
        }
    }
}

/// Static declaration of a field.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaFieldSpec {
    pub proto: MetaProto,
    /// `<Module>_<Channel|Event>` names this derives from.
    pub watching: Vec<String>,
    pub cache_depth: usize,
    pub min_values: usize,
    pub update_behavior: UpdateBehavior,
    pub min_interval: Option<Duration>,
    pub deprecated: bool,
}

impl MetaFieldSpec {
    pub fn new(proto: MetaProto, watching: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            proto,
            watching: watching.into_iter().map(Into::into).collect(),
            cache_depth: 1,
            min_values: 1,
            update_behavior: UpdateBehavior::Any,
            min_interval: None,
            deprecated: false,
        }
    }

    pub fn cache_depth(mut self, depth: usize) -> Self {
        self.cache_depth = depth;
        self
    }

    pub fn min_values(mut self, n: usize) -> Self {
        self.min_values = n;
        self
    }

    pub fn update_behavior(mut self, behavior: UpdateBehavior) -> Self {
        self.update_behavior = behavior;
        self
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let err = |details: &str| GdsError::MetaField { field: self.proto.name().to_string(), details: details.to_string() };
        if self.update_behavior == UpdateBehavior::TimeOnly && self.min_interval.is_none() {
            return Err(err("TIME_ONLY requires a min_interval"));
        }
        if self.watching.is_empty() {
            return Err(err("watches nothing"));
        }
        if self.cache_depth == 0 || self.min_values > self.cache_depth {
            return Err(err("min_values must fit within a non-zero cache_depth"));
        }
        Ok(())
    }
}

/// What `calculate` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Telemetry(Value),
    /// Event arguments, in declaration order.
    Event(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Calculation {
    /// `None` suppresses emission this time.
    pub value: Option<MetaValue>,
    /// Inputs the value was materially derived from.
    pub factors: Vec<Payload>,
}

impl Calculation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn telemetry(value: Value, factors: Vec<Payload>) -> Self {
        Self { value: Some(MetaValue::Telemetry(value)), factors }
    }

    pub fn event(args: Vec<Value>, factors: Vec<Payload>) -> Self {
        Self { value: Some(MetaValue::Event(args)), factors }
    }
}

/// Behaviour of a derived field.
pub trait MetaField: Send + std::fmt::Debug {
    fn spec(&self) -> &MetaFieldSpec;

    /// Computes the field from the cache. Only called once the field is ready.
    fn calculate(&mut self, state: &MetaFieldState) -> Result<Calculation>;
}

fn estimated_time(payload: &Payload) -> Option<DateTime<Utc>> {
    payload.downlink_times().best_estimate()
}

/// Filter applied by the cross-field queries.
pub type PayloadFilter<'a> = &'a dyn Fn(&Payload) -> bool;

/// Caches and trigger bookkeeping of one field.
#[derive(Debug, Clone)]
pub struct MetaFieldState {
    watching: Vec<String>,
    cache_depth: usize,
    /// Newest first.
    caches: HashMap<String, VecDeque<Payload>>,
    received: HashSet<String>,
    last_emit: Instant,
}

impl MetaFieldState {
    pub fn new(spec: &MetaFieldSpec, now: Instant) -> Self {
        let mut state = Self {
            watching: spec.watching.clone(),
            cache_depth: spec.cache_depth,
            caches: HashMap::new(),
            received: HashSet::new(),
            last_emit: now,
        };
        state.reset(now);
        state
    }

    pub fn reset(&mut self, now: Instant) {
        self.caches = self
            .watching
            .iter()
            .map(|name| (name.clone(), VecDeque::with_capacity(self.cache_depth)))
            .collect();
        self.received.clear();
        self.last_emit = now;
    }

    /// Caches `payload` under `name` if it is watched. Returns whether it was.
    pub fn absorb(&mut self, name: &str, payload: &Payload) -> bool {
        let Some(cache) = self.caches.get_mut(name) else { return false };
        cache.push_front(payload.clone());
        cache.truncate(self.cache_depth);
        self.received.insert(name.to_string());
        true
    }

    pub fn has_min_values(&self, min_values: usize) -> bool {
        self.caches.values().all(|c| c.len() >= min_values)
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn since_last_emit(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_emit)
    }

    pub(crate) fn mark_emitted(&mut self, now: Instant) {
        self.received.clear();
        self.last_emit = now;
    }

    /// Newest payload of a watched field.
    pub fn get_latest(&self, name: &str) -> Option<&Payload> {
        self.caches.get(name)?.front()
    }

    /// Up to `n` newest payloads of a watched field, newest first.
    pub fn get_recent(&self, name: &str, n: usize) -> Vec<&Payload> {
        self.caches.get(name).map(|c| c.iter().take(n).collect()).unwrap_or_default()
    }

    /// Up to `n` newest payloads across all watched fields, oldest first.
    ///
    /// Payloads without any downlink time are skipped. `time_window` keeps
    /// only those within that span of the newest.
    pub fn get_recent_across(
        &self,
        n: usize,
        time_window: Option<TimeDelta>,
        filter: Option<PayloadFilter<'_>>,
    ) -> Vec<&Payload> {
        let mut timed: Vec<(DateTime<Utc>, &Payload)> = self
            .caches
            .values()
            .flatten()
            .filter(|p| filter.is_none_or(|f| f(p)))
            .filter_map(|p| estimated_time(p).map(|t| (t, p)))
            .collect();
        timed.sort_by_key(|(t, _)| *t);
        if let (Some(window), Some((newest, _))) = (time_window, timed.last()) {
            let cutoff = *newest - window;
            timed.retain(|(t, _)| *t >= cutoff);
        }
        let skip = timed.len().saturating_sub(n);
        timed.into_iter().skip(skip).map(|(_, p)| p).collect()
    }

    /// Time-weighted mean of the numeric telemetry among the `n` most recent
    /// payloads (all cached when `None`).
    ///
    /// Samples are ordered by estimated event time and integrated with the
    /// trapezoidal rule, so each sample weighs half the gap to each neighbour.
    /// `extra_weights` scales each sample's weight. Returns the mean and the
    /// samples used.
    pub fn time_weighted_average(
        &self,
        n: Option<usize>,
        time_window: Option<TimeDelta>,
        filter: Option<PayloadFilter<'_>>,
        extra_weights: Option<&dyn Fn(&Payload) -> f64>,
    ) -> Option<(f64, Vec<Payload>)> {
        let numeric = |p: &Payload| match p {
            Payload::Telemetry(t) => t.data.as_f64().is_some() && filter.is_none_or(|f| f(p)),
            _ => false,
        };
        let samples = self.get_recent_across(n.unwrap_or(usize::MAX), time_window, Some(&numeric));
        let points: Vec<(f64, f64, f64)> = samples
            .iter()
            .filter_map(|p| {
                let Payload::Telemetry(t) = p else { return None };
                let time = estimated_time(p)?;
                let secs = time.timestamp_micros() as f64 / 1e6;
                let extra = extra_weights.map_or(1.0, |w| w(p));
                Some((secs, t.data.as_f64()?, extra))
            })
            .collect();

        let (first, last) = (points.first()?, points.last()?);
        let span = last.0 - first.0;
        let weights: Vec<f64> = (0..points.len())
            .map(|i| {
                if span <= 0.0 {
                    return 1.0;
                }
                let before = if i > 0 { points[i].0 - points[i - 1].0 } else { 0.0 };
                let after = if i + 1 < points.len() { points[i + 1].0 - points[i].0 } else { 0.0 };
                (before + after) / 2.0
            })
            .collect();

        let (mut num, mut den) = (0.0, 0.0);
        for ((_, value, extra), w) in points.iter().zip(&weights) {
            num += value * w * extra;
            den += w * extra;
        }
        if den <= 0.0 {
            return None;
        }
        Some((num / den, samples.into_iter().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload::{PayloadMeta, TelemetryPayload};
    use crate::types::{DataType, DownlinkTimes, ScalarType};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 7, 18, 0).unwrap()
    }

    fn sample(channel_id: u8, secs: i64, value: f64) -> Payload {
        Payload::Telemetry(TelemetryPayload {
            module_id: 0x0300,
            channel_id,
            timestamp: 0,
            data: Value::F64(value),
            meta: PayloadMeta {
                downlink_times: DownlinkTimes { scet_est: Some(t0() + TimeDelta::seconds(secs)), ..Default::default() },
                ..Default::default()
            },
        })
    }

    fn spec() -> MetaFieldSpec {
        MetaFieldSpec::new(
            MetaProto::Channel(ChannelDef::new(0, "Avg", DataType::Scalar(ScalarType::F64))),
            ["Power_Voltage", "Power_Current"],
        )
        .cache_depth(10)
    }

    #[test]
    fn weighted_average_of_staggered_samples() {
        let mut state = MetaFieldState::new(&spec(), Instant::now());
        state.absorb("Power_Voltage", &sample(0, 0, 10.0));
        state.absorb("Power_Current", &sample(1, 1, 20.0));
        state.absorb("Power_Voltage", &sample(0, 2, 30.0));
        let (avg, used) = state.time_weighted_average(Some(3), None, None, None).unwrap();
        assert!((avg - 20.0).abs() < 1e-9);
        assert_eq!(used.len(), 3);

        // Uneven spacing pulls toward the longer-held sample.
        state.absorb("Power_Current", &sample(1, 10, 0.0));
        let (avg, _) = state.time_weighted_average(Some(2), None, None, None).unwrap();
        assert!((avg - 15.0).abs() < 1e-9);
    }

    #[test]
    fn recent_across_windows_and_orders() {
        let mut state = MetaFieldState::new(&spec(), Instant::now());
        for (i, secs) in [5, 1, 9, 3].into_iter().enumerate() {
            let name = if i % 2 == 0 { "Power_Voltage" } else { "Power_Current" };
            state.absorb(name, &sample(0, secs, secs as f64));
        }
        let times: Vec<f64> = state
            .get_recent_across(3, None, None)
            .iter()
            .filter_map(|p| match p {
                Payload::Telemetry(t) => t.data.as_f64(),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![3.0, 5.0, 9.0]);
        assert_eq!(state.get_recent_across(10, Some(TimeDelta::seconds(4)), None).len(), 2);
    }

    #[test]
    fn cache_is_bounded_newest_first() {
        let mut state = MetaFieldState::new(&spec().cache_depth(2), Instant::now());
        for secs in 0..5 {
            state.absorb("Power_Voltage", &sample(0, secs, secs as f64));
        }
        let recent = state.get_recent("Power_Voltage", 5);
        assert_eq!(recent.len(), 2);
        assert_eq!(state.get_latest("Power_Voltage"), Some(&sample(0, 4, 4.0)));
        assert!(!state.absorb("Imu_XAcc", &sample(0, 0, 0.0)));
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate().is_ok());
        assert!(spec().update_behavior(UpdateBehavior::TimeOnly).validate().is_err());
        assert!(spec().update_behavior(UpdateBehavior::TimeOnly).min_interval(Duration::from_secs(1)).validate().is_ok());
        assert!(spec().cache_depth(1).min_values(2).validate().is_err());
    }
}
