//! Downlink metadata carried by every payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical path a packet took off the rover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataPathway {
    Wired,
    Wireless,
    #[default]
    None,
}

/// Where the ground received a packet from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Yamcs,
    Pcap,
    UdpDirect,
    SerialDirect,
    /// Computed on the ground.
    Generated,
    #[default]
    None,
}

/// Stage of the downlink pipe a timestamp was taken at, ordered upstream first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkStage {
    ScetEst,
    LanderRx,
    AmccRx,
    PmccRx,
}

impl DownlinkStage {
    /// Preference order when choosing which stage to compare payloads by.
    pub const PREFERENCE: [DownlinkStage; 4] = [
        DownlinkStage::ScetEst,
        DownlinkStage::LanderRx,
        DownlinkStage::AmccRx,
        DownlinkStage::PmccRx,
    ];
}

/// Timestamps a payload acquires as it moves down the pipe. All UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownlinkTimes {
    /// Best estimate of when the event happened on the rover.
    pub scet_est: Option<DateTime<Utc>>,
    pub lander_rx: Option<DateTime<Utc>>,
    /// Mission-ops relay receive time.
    pub amcc_rx: Option<DateTime<Utc>>,
    /// Our receive time.
    pub pmcc_rx: Option<DateTime<Utc>>,
}

impl DownlinkTimes {
    /// Times stamped for a payload generated on the ground right now.
    pub fn generated_now() -> Self {
        let now = Utc::now();
        Self { scet_est: Some(now), pmcc_rx: Some(now), ..Self::default() }
    }

    pub fn get(&self, stage: DownlinkStage) -> Option<DateTime<Utc>> {
        match stage {
            DownlinkStage::ScetEst => self.scet_est,
            DownlinkStage::LanderRx => self.lander_rx,
            DownlinkStage::AmccRx => self.amcc_rx,
            DownlinkStage::PmccRx => self.pmcc_rx,
        }
    }

    /// Number of stages populated.
    pub fn populated(&self) -> usize {
        DownlinkStage::PREFERENCE.iter().filter(|s| self.get(**s).is_some()).count()
    }

    /// Earliest-stage timestamp available, used as the best event time estimate.
    pub fn best_estimate(&self) -> Option<DateTime<Utc>> {
        DownlinkStage::PREFERENCE.iter().find_map(|s| self.get(*s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn best_estimate_prefers_upstream_stages() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 8, 7, 18, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(3);
        let times = DownlinkTimes { amcc_rx: Some(t1), lander_rx: Some(t0), ..Default::default() };
        assert_eq!(times.best_estimate(), Some(t0));
        assert_eq!(times.populated(), 2);
        assert_eq!(DownlinkTimes::default().best_estimate(), None);
    }

    #[test]
    fn enums_serialize_screaming_snake() {
        assert_eq!(serde_json::to_string(&DataSource::UdpDirect).unwrap(), "\"UDP_DIRECT\"");
        assert_eq!(serde_json::to_string(&DataPathway::Wireless).unwrap(), "\"WIRELESS\"");
    }
}
