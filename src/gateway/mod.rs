//! # Gateway Reliability Scoring Module
//!
//! Decides whether a packet is trustworthy evidence that a gateway actually
//! heard the originating node, and maintains the per-(node, gateway)
//! observation counters that evidence feeds.
//!
//! Naive gateway detection ("this radio uplinked a packet for that node")
//! produces roughly an order of magnitude more false positives than true
//! gateways, because most uplinked packets were relayed over several hops.
//! The filter below only admits receptions that the hop counters or the
//! signal strength can corroborate, and the tiered retention windows let
//! spurious single hits age out within a day while repeatedly-confirmed
//! gateways persist for a week.

use crate::config::GatewayConfig;
use crate::packet::{ts_seconds, Packet};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Classification of one admissible reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// Zero hops consumed: the gateway heard the node itself.
    Direct,
    /// Hops were consumed, but the RSSI independently corroborates proximity.
    Partial,
}

/// Running reliability record for one (node, gateway) pair.
///
/// The score is a pure function of this observation's own counters; no
/// cross-node comparison enters into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayObservation {
    pub hit_count: u64,
    pub direct_hit_count: u64,
    pub partial_hit_count: u64,
    /// Running mean over the hits that carried an RSSI reading.
    #[serde(default)]
    pub average_rssi: f32,
    #[serde(default)]
    pub rssi_sample_count: u64,
    /// 0-100, recomputed on every update.
    pub reliability_score: u32,
    #[serde(with = "ts_seconds")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub last_seen: DateTime<Utc>,
}

impl GatewayObservation {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            hit_count: 0,
            direct_hit_count: 0,
            partial_hit_count: 0,
            average_rssi: 0.0,
            rssi_sample_count: 0,
            reliability_score: 0,
            first_seen: at,
            last_seen: at,
        }
    }

    /// Fold one admitted reception into the counters and recompute the score.
    pub fn record(&mut self, hit: HitKind, rssi: Option<f32>, at: DateTime<Utc>, policy: &GatewayConfig) {
        self.hit_count += 1;
        match hit {
            HitKind::Direct => self.direct_hit_count += 1,
            HitKind::Partial => self.partial_hit_count += 1,
        }
        if let Some(rssi) = rssi {
            let n = self.rssi_sample_count as f32;
            self.average_rssi = (self.average_rssi * n + rssi) / (n + 1.0);
            self.rssi_sample_count += 1;
        }
        self.reliability_score = score(self.direct_hit_count, self.partial_hit_count, policy);
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Retention tier: 1 is most trusted.
    pub fn tier(&self) -> u8 {
        match self.reliability_score {
            s if s >= 70 => 1,
            s if s >= 50 => 2,
            _ => 3,
        }
    }

    /// How long this observation is kept after its last hit. The asymmetry
    /// is what suppresses false-positive gateways.
    pub fn retention_window(&self) -> Duration {
        match self.tier() {
            1 => Duration::days(7),
            2 => Duration::days(3),
            _ => Duration::days(1),
        }
    }
}

fn score(direct: u64, partial: u64, policy: &GatewayConfig) -> u32 {
    let raw = direct.saturating_mul(policy.direct_hit_weight as u64)
        + partial.saturating_mul(policy.partial_hit_weight as u64);
    raw.min(100) as u32
}

/// Apply the admission filter to one packet.
///
/// Returns `None` when the packet must not update any score:
/// - RSSI present but below the noise floor;
/// - `hop_start` never populated, unless the gateway is the source itself
///   (a radio reporting its own uplink is zero-hop by definition);
/// - hops consumed without RSSI corroboration;
/// - hop counters that claim more budget remaining than the packet started
///   with (corrupt, not usable as evidence).
pub fn classify(packet: &Packet, policy: &GatewayConfig) -> Option<HitKind> {
    let gateway = packet.gateway.as_deref()?;

    if let Some(rssi) = packet.rssi {
        if rssi < policy.strong_signal_floor_dbm {
            return None;
        }
    }

    if gateway == packet.source {
        return Some(HitKind::Direct);
    }

    let hop_start = packet.hop_start?;
    if hop_start < packet.hop_limit {
        return None;
    }

    if hop_start == packet.hop_limit {
        Some(HitKind::Direct)
    } else if packet.rssi.is_some() {
        Some(HitKind::Partial)
    } else {
        None
    }
}
