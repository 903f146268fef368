//! Replays a recorded parameter archive in (scaled) real time.
//!
//! The archive is a JSON-lines file of [`ParameterRecord`]s. Records are
//! sorted by generation time and released once the replay clock passes them.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, trace, warn};

use super::params::{ParameterMap, ParameterRecord, records_to_packets};
use super::Transceiver;
use crate::codec::packet::{Packet, PacketDispatcher};
use crate::{GdsError, Result};

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

/// How long a finished, non-looping replay idles per read.
const IDLE_AT_END: Duration = Duration::from_secs(5);
/// Lead-in kept before the first Iris record when jumping.
const JUMP_LEAD_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    pub path: PathBuf,
    /// Archive seconds played per wall-clock second.
    pub speed: f64,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub start_time_utc: Option<DateTime<Utc>>,
    pub end_time_utc: Option<DateTime<Utc>>,
    /// Start shortly before Iris first shows up in the archive.
    pub jump_to_iris: bool,
    /// Treat reception as having happened at generation time.
    pub rx_is_generation_time: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("archive.jsonl"),
            speed: 1.0,
            loop_playback: true,
            start_time_utc: None,
            end_time_utc: None,
            jump_to_iris: true,
            rx_is_generation_time: true,
        }
    }
}

/// Parses JSON-lines records. Blank lines are skipped.
pub fn parse_records(text: &str) -> Result<Vec<ParameterRecord>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| GdsError::Serialization {
                class: "ParameterRecord".to_string(),
                details: format!("line {}: {e}", n + 1),
            })
        })
        .collect()
}

/// Sorts and windows records according to `opts`.
pub fn prepare_records(mut records: Vec<ParameterRecord>, opts: &ReplayOptions, map: &ParameterMap) -> Vec<ParameterRecord> {
    records.sort_by_key(|r| r.generation_time);
    records.retain(|r| {
        opts.start_time_utc.is_none_or(|start| r.generation_time >= start)
            && opts.end_time_utc.is_none_or(|end| r.generation_time <= end)
    });
    if opts.jump_to_iris {
        match records.iter().find(|r| map.is_iris_activity(r)) {
            Some(first) => {
                let from = first.generation_time - TimeDelta::seconds(JUMP_LEAD_SECS);
                records.retain(|r| r.generation_time >= from);
            }
            None => warn!("Iris never appears in the replay window, playing from the start"),
        }
    }
    if opts.rx_is_generation_time {
        for r in &mut records {
            r.reception_time = r.generation_time;
        }
    }
    records
}

pub struct ReplayTransceiver {
    opts: ReplayOptions,
    map: ParameterMap,
    dispatcher: Arc<PacketDispatcher>,
    records: Option<Vec<ParameterRecord>>,
    next: usize,
    start_world: Instant,
    start_arch: DateTime<Utc>,
}

impl ReplayTransceiver {
    pub fn new(mut opts: ReplayOptions, map: ParameterMap, dispatcher: Arc<PacketDispatcher>) -> Self {
        opts.speed = opts.speed.clamp(MIN_SPEED, MAX_SPEED);
        Self {
            opts,
            map,
            dispatcher,
            records: None,
            next: 0,
            start_world: Instant::now(),
            start_arch: Utc::now(),
        }
    }

    /// Replays records already in memory. `begin()` reloads from `opts.path`.
    pub fn with_records(opts: ReplayOptions, map: ParameterMap, dispatcher: Arc<PacketDispatcher>, records: Vec<ParameterRecord>) -> Self {
        let mut xcvr = Self::new(opts, map, dispatcher);
        xcvr.records = Some(prepare_records(records, &xcvr.opts, &xcvr.map));
        xcvr.reset_timing();
        xcvr
    }

    pub fn speed(&self) -> f64 {
        self.opts.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        // Rebase so the archive clock doesn't jump.
        let now = self.archive_now();
        self.opts.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        self.start_world = Instant::now();
        self.start_arch = now;
        debug!("Replay speed set to {}x", self.opts.speed);
    }

    pub fn remaining(&self) -> usize {
        self.records.as_ref().map_or(0, |r| r.len().saturating_sub(self.next))
    }

    fn reset_timing(&mut self) {
        self.next = 0;
        self.start_world = Instant::now();
        self.start_arch = self
            .records
            .as_ref()
            .and_then(|r| r.first())
            .map_or_else(Utc::now, |r| r.generation_time);
    }

    fn archive_now(&self) -> DateTime<Utc> {
        let elapsed = self.start_world.elapsed().mul_f64(self.opts.speed);
        TimeDelta::from_std(elapsed)
            .ok()
            .and_then(|d| self.start_arch.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait::async_trait]
impl Transceiver for ReplayTransceiver {
    fn name(&self) -> &str {
        "replay"
    }

    async fn begin(&mut self) -> Result<()> {
        let path = &self.opts.path;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| GdsError::io_error(path, e))?;
        let records = prepare_records(parse_records(&text)?, &self.opts, &self.map);
        info!(
            "Replaying {} records from {} at {}x (loop: {})",
            records.len(),
            path.display(),
            self.opts.speed,
            self.opts.loop_playback
        );
        self.records = Some(records);
        self.reset_timing();
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<Packet>> {
        let total = match &self.records {
            Some(records) if !records.is_empty() => records.len(),
            Some(_) => {
                sleep(IDLE_AT_END).await;
                return Ok(Vec::new());
            }
            None => return Err(GdsError::connection_lost("replay not started")),
        };

        if self.next >= total {
            if !self.opts.loop_playback {
                trace!("Replay finished");
                sleep(IDLE_AT_END).await;
                return Ok(Vec::new());
            }
            debug!("Looping replay");
            self.reset_timing();
        }

        let Some(records) = &self.records else { return Ok(Vec::new()) };
        let next_time = records[self.next].generation_time;
        let ahead = next_time - self.archive_now();
        if let Ok(ahead) = ahead.to_std() {
            if !ahead.is_zero() {
                sleep(ahead.div_f64(self.opts.speed) + Duration::from_millis(1)).await;
            }
        }

        let now = self.archive_now();
        let end = records[self.next..]
            .iter()
            .position(|r| r.generation_time > now)
            .map_or(total, |i| self.next + i);
        let batch = &records[self.next..end];
        trace!(count = batch.len(), "Releasing replay records up to {now}");
        let packets = records_to_packets(batch, &self.map, &self.dispatcher);
        self.next = end;
        Ok(packets)
    }

    async fn restart(&mut self) -> Result<()> {
        self.reset_timing();
        Ok(())
    }

    async fn send_byte_packet(&mut self, bytes: &[u8]) -> Result<()> {
        debug!("Replay can't uplink, dropping {} bytes", bytes.len());
        Ok(())
    }
}
