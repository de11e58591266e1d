//! Bitrate caps derived from observed network conditions.
//!
//! Everything here is a pure function of its inputs; the only state is the
//! last value handed to a connection so callers can skip no-op updates.

use serde::{Deserialize, Serialize};

use super::LinkStats;

/// RTT above which audio is favoured over video.
const HIGH_RTT_MS: f64 = 300.0;
/// Share of the measured downlink a single peer may claim.
const DOWNLINK_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateRange {
    pub min: u32,
    pub ideal: u32,
    pub max: u32,
}

impl BitrateRange {
    const fn new(min: u32, ideal: u32, max: u32) -> Self {
        Self { min, ideal, max }
    }

    fn normalized(self) -> Self {
        let max = self.max;
        let min = self.min.min(max);
        let ideal = self.ideal.clamp(min, max);
        Self { min, ideal, max }
    }

    fn capped(self, cap: u32) -> Self {
        Self {
            min: self.min.min(cap),
            ideal: self.ideal.min(cap),
            max: self.max.min(cap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLimit {
    pub max: u32,
}

/// Per-connection caps in kbps. Recomputed as a fresh value and swapped in
/// whole; never edited in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSettings {
    pub audio: BitrateRange,
    pub video: BitrateRange,
    pub data: DataLimit,
    pub adaptive_bitrate: bool,
    pub prioritize_audio: bool,
    pub save_network_data: bool,
    pub turn_relay_only: bool,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        BandwidthPolicy::compute(&NetworkConditions::default(), false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "4g")]
    Cellular4g,
}

impl EffectiveType {
    /// Network Information API classification.
    pub fn classify(rtt_ms: Option<f64>, downlink_mbps: Option<f64>) -> Self {
        let rtt = rtt_ms.unwrap_or(0.0);
        let below = |limit: f64| downlink_mbps.is_some_and(|mbps| mbps < limit);
        if rtt >= 2000.0 || below(0.05) {
            EffectiveType::Slow2g
        } else if rtt >= 1400.0 || below(0.07) {
            EffectiveType::Cellular2g
        } else if rtt >= 270.0 || below(0.7) {
            EffectiveType::Cellular3g
        } else {
            EffectiveType::Cellular4g
        }
    }

    fn base_tier(self) -> (BitrateRange, BitrateRange, DataLimit) {
        match self {
            EffectiveType::Slow2g => (
                BitrateRange::new(6, 12, 16),
                BitrateRange::new(0, 0, 0),
                DataLimit { max: 16 },
            ),
            EffectiveType::Cellular2g => (
                BitrateRange::new(8, 16, 24),
                BitrateRange::new(0, 50, 100),
                DataLimit { max: 50 },
            ),
            EffectiveType::Cellular3g => (
                BitrateRange::new(16, 32, 48),
                BitrateRange::new(100, 300, 500),
                DataLimit { max: 500 },
            ),
            EffectiveType::Cellular4g => (
                BitrateRange::new(32, 64, 128),
                BitrateRange::new(300, 1_500, 2_500),
                DataLimit { max: 4_000 },
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    pub effective_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub save_data: bool,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            effective_type: EffectiveType::Cellular4g,
            downlink_mbps: None,
            rtt_ms: None,
            save_data: false,
        }
    }
}

impl NetworkConditions {
    pub fn from_stats(stats: &LinkStats, save_data: bool) -> Self {
        let downlink_mbps = stats
            .available_outgoing_kbps
            .filter(|kbps| *kbps > 0.0)
            .map(|kbps| kbps / 1_000.0);
        Self {
            effective_type: EffectiveType::classify(stats.rtt_ms, downlink_mbps),
            downlink_mbps,
            rtt_ms: stats.rtt_ms,
            save_data,
        }
    }
}

#[derive(Debug, Default)]
pub struct BandwidthPolicy {
    last_applied: Option<BandwidthSettings>,
}

impl BandwidthPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(conditions: &NetworkConditions, turn_relay_only: bool) -> BandwidthSettings {
        let (mut audio, mut video, mut data) = conditions.effective_type.base_tier();
        let mut prioritize_audio = false;

        if let Some(mbps) = conditions.downlink_mbps.filter(|mbps| *mbps > 0.0) {
            let budget = (mbps * 1_000.0 * DOWNLINK_SHARE) as u32;
            audio = audio.capped(budget);
            video = video.capped(budget.saturating_sub(audio.max));
            data.max = data.max.min(budget.max(1));
        }

        if conditions.rtt_ms.is_some_and(|rtt| rtt > HIGH_RTT_MS) {
            prioritize_audio = true;
            video.ideal /= 2;
        }

        if conditions.save_data {
            video.ideal /= 2;
            video.max /= 2;
            data.max = (data.max / 2).max(1);
        }

        BandwidthSettings {
            audio: audio.normalized(),
            video: video.normalized(),
            data,
            adaptive_bitrate: true,
            prioritize_audio,
            save_network_data: conditions.save_data,
            turn_relay_only,
        }
    }

    /// Returns the new settings only when they differ from what was last
    /// applied.
    pub fn recompute(
        &mut self,
        conditions: &NetworkConditions,
        turn_relay_only: bool,
    ) -> Option<BandwidthSettings> {
        let next = Self::compute(conditions, turn_relay_only);
        if self.last_applied == Some(next) {
            return None;
        }
        self.last_applied = Some(next);
        Some(next)
    }

    pub fn last_applied(&self) -> Option<BandwidthSettings> {
        self.last_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(rtt: Option<f64>, downlink: Option<f64>, save_data: bool) -> NetworkConditions {
        NetworkConditions {
            effective_type: EffectiveType::classify(rtt, downlink),
            downlink_mbps: downlink,
            rtt_ms: rtt,
            save_data,
        }
    }

    fn assert_ordered(settings: &BandwidthSettings) {
        for range in [settings.audio, settings.video] {
            assert!(range.min <= range.ideal && range.ideal <= range.max, "{range:?}");
        }
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(EffectiveType::classify(Some(2_100.0), None), EffectiveType::Slow2g);
        assert_eq!(EffectiveType::classify(Some(50.0), Some(0.04)), EffectiveType::Slow2g);
        assert_eq!(EffectiveType::classify(Some(1_500.0), None), EffectiveType::Cellular2g);
        assert_eq!(EffectiveType::classify(Some(300.0), Some(10.0)), EffectiveType::Cellular3g);
        assert_eq!(EffectiveType::classify(Some(40.0), Some(10.0)), EffectiveType::Cellular4g);
        assert_eq!(EffectiveType::classify(None, None), EffectiveType::Cellular4g);
    }

    #[test]
    fn fast_link_gets_full_tier() {
        let settings = BandwidthPolicy::compute(&conditions(Some(30.0), Some(50.0), false), false);
        assert_eq!(settings.video.max, 2_500);
        assert_eq!(settings.data.max, 4_000);
        assert!(!settings.prioritize_audio);
        assert_ordered(&settings);
    }

    #[test]
    fn narrow_downlink_clamps_every_range() {
        let settings = BandwidthPolicy::compute(&conditions(Some(100.0), Some(1.0), false), true);
        assert!(settings.audio.max + settings.video.max <= 800);
        assert!(settings.data.max <= 800);
        assert!(settings.turn_relay_only);
        assert_ordered(&settings);
    }

    #[test]
    fn high_rtt_and_save_data_reduce_video() {
        let baseline = BandwidthPolicy::compute(&conditions(Some(280.0), None, false), false);
        let constrained = BandwidthPolicy::compute(&conditions(Some(400.0), None, true), false);
        assert!(constrained.prioritize_audio);
        assert!(constrained.save_network_data);
        assert!(constrained.video.ideal < baseline.video.ideal);
        assert!(constrained.data.max < baseline.data.max);
        assert_ordered(&constrained);
    }

    #[test]
    fn slow_links_drop_video_entirely() {
        let settings = BandwidthPolicy::compute(&conditions(Some(2_500.0), None, false), false);
        assert_eq!(settings.video, BitrateRange::new(0, 0, 0));
        assert!(settings.audio.max > 0);
    }

    #[test]
    fn recompute_skips_unchanged_settings() {
        let mut policy = BandwidthPolicy::new();
        let fast = conditions(Some(30.0), Some(50.0), false);
        assert!(policy.recompute(&fast, false).is_some());
        assert!(policy.recompute(&fast, false).is_none());
        let slow = conditions(Some(1_500.0), None, false);
        let changed = policy.recompute(&slow, false).unwrap();
        assert_eq!(policy.last_applied(), Some(changed));
    }

    #[test]
    fn stats_feed_classification() {
        let stats = LinkStats {
            rtt_ms: Some(500.0),
            available_outgoing_kbps: Some(2_000.0),
            ..LinkStats::default()
        };
        let conditions = NetworkConditions::from_stats(&stats, false);
        assert_eq!(conditions.effective_type, EffectiveType::Cellular3g);
        assert_eq!(conditions.downlink_mbps, Some(2.0));
    }
}
