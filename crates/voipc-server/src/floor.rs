//! Screen-share admission against a per-channel bandwidth budget.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

pub const MAX_CONCURRENT_SHARES: usize = 3;
pub const BANDWIDTH_BUDGET_MBPS: f64 = 15.0;
pub const MAX_SHARE_DURATION: Duration = Duration::from_secs(4 * 3600);

/// Quality tiers in descending bitrate priority: the first one whose bitrate
/// fits the remaining budget is granted.
pub const QUALITY_TIERS: &[(&str, f64)] = &[
    ("1080p60", 5.0),
    ("1080p30", 3.5),
    ("720p60", 2.5),
    ("720p30", 1.5),
    ("480p30", 0.8),
];

fn bitrate_of(quality: &str) -> f64 {
    QUALITY_TIERS
        .iter()
        .find(|(q, _)| *q == quality)
        .map(|(_, bitrate)| *bitrate)
        .unwrap_or(QUALITY_TIERS.last().unwrap().1)
}

fn lowest_tier_bitrate() -> f64 {
    QUALITY_TIERS.last().unwrap().1
}

#[derive(Debug, Clone)]
pub struct ScreenShare {
    pub client_id: String,
    pub username: String,
    pub quality: String,
    pub estimated_bitrate_mbps: f64,
    pub started_at: Instant,
}

#[derive(Debug, Clone)]
pub enum FloorDecision {
    Granted { quality: String, bitrate_mbps: f64 },
    Denied { reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub used_mbps: f64,
    pub budget_mbps: f64,
    pub remaining_mbps: f64,
    pub count: usize,
    pub shares: Vec<ScreenShare>,
}

#[derive(Default)]
pub struct FloorController {
    channels: DashMap<String, Vec<ScreenShare>>,
}

impl FloorController {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire_locked(shares: &mut Vec<ScreenShare>) {
        shares.retain(|s| s.started_at.elapsed() < MAX_SHARE_DURATION);
    }

    pub fn request(
        &self,
        channel: &str,
        client_id: &str,
        username: &str,
        desired_quality: &str,
    ) -> FloorDecision {
        let mut shares = self.channels.entry(channel.to_string()).or_default();
        Self::expire_locked(&mut shares);

        if shares.len() >= MAX_CONCURRENT_SHARES {
            return FloorDecision::Denied {
                reason: "maximum reached",
            };
        }

        let used: f64 = shares.iter().map(|s| s.estimated_bitrate_mbps).sum();
        let remaining = BANDWIDTH_BUDGET_MBPS - used;
        if remaining <= lowest_tier_bitrate() {
            return FloorDecision::Denied {
                reason: "budget exhausted",
            };
        }

        let desired_bitrate = bitrate_of(desired_quality);
        let (quality, bitrate) = if desired_bitrate <= remaining {
            (desired_quality.to_string(), desired_bitrate)
        } else {
            QUALITY_TIERS
                .iter()
                .find(|(_, bitrate)| *bitrate <= remaining)
                .map(|(q, b)| (q.to_string(), *b))
                .unwrap_or_else(|| {
                    let (q, b) = QUALITY_TIERS.last().unwrap();
                    (q.to_string(), *b)
                })
        };

        shares.push(ScreenShare {
            client_id: client_id.to_string(),
            username: username.to_string(),
            quality: quality.clone(),
            estimated_bitrate_mbps: bitrate,
            started_at: Instant::now(),
        });

        FloorDecision::Granted {
            quality,
            bitrate_mbps: bitrate,
        }
    }

    pub fn register_stop(&self, channel: &str, client_id: &str) {
        if let Some(mut shares) = self.channels.get_mut(channel) {
            shares.retain(|s| s.client_id != client_id);
        }
    }

    pub fn channel_stats(&self, channel: &str) -> ChannelStats {
        let shares = match self.channels.get_mut(channel) {
            Some(mut shares) => {
                Self::expire_locked(&mut shares);
                shares.clone()
            }
            None => Vec::new(),
        };
        let used: f64 = shares.iter().map(|s| s.estimated_bitrate_mbps).sum();
        ChannelStats {
            used_mbps: used,
            budget_mbps: BANDWIDTH_BUDGET_MBPS,
            remaining_mbps: BANDWIDTH_BUDGET_MBPS - used,
            count: shares.len(),
            shares,
        }
    }
}
