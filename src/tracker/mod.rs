//! # Node State Store
//!
//! The central shared-mutable-state object: one [`NodeState`] per observed
//! node, holding identity, live telemetry, bounded position/packet history,
//! per-gateway reliability observations, and geofence state.
//!
//! ## Features
//!
//! - **Ingestion**: every normalized packet updates exactly one node entry
//! - **Ordered position history**: timestamp-deduplicated, insertion-sorted,
//!   ring-capped; retransmits and out-of-order arrivals both land correctly
//! - **Retention**: aged pruning that never removes a node's most recent
//!   packet or position, so a long-silent node still proves it existed
//! - **Queries**: read-side accessors copy under the lock and hand out owned
//!   data; no internal mutable structure escapes
//! - **Config reload**: the special-node table can be swapped at runtime
//!   without discarding accumulated history
//!
//! ## Concurrency
//!
//! All access serializes through one `Mutex` (see [`SharedTracker`]). Node
//! counts are small (tens to low hundreds); correctness under concurrent
//! read-during-write matters here, contention does not. Nothing holds the
//! lock across I/O: persistence takes a snapshot copy under the lock and
//! writes it after release.

pub mod movement;

use crate::config::{GatewayConfig, SpecialNodeConfig, TrackerConfig};
use crate::gateway::{self, GatewayObservation};
use crate::logutil::escape_log;
use crate::packet::{ts_seconds, Packet, PacketPayload};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Shared handle to the store. One exclusive lock guards all mutation.
pub type SharedTracker = Arc<Mutex<NodeTracker>>;

/// A geographic point, used for configured origins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// One entry of a node's position history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<i32>,
}

/// Live state for one node. Created on first packet, mutated on every
/// subsequent one, never explicitly destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(with = "ts_seconds")]
    pub first_seen: DateTime<Utc>,
    /// Timestamp of the newest packet of any kind.
    #[serde(with = "ts_seconds")]
    pub last_seen: DateTime<Utc>,
    /// Timestamp of the newest position fix.
    #[serde(default, with = "ts_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub last_position_update: Option<DateTime<Utc>>,
    /// Current (newest) fix; `None` until the first one arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f32>,
    /// Set from configuration, not from the mesh.
    #[serde(default)]
    pub is_special: bool,
    /// Home position; only present for special nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<GeoPoint>,
    /// Ascending by timestamp, deduplicated by timestamp, ring-capped.
    #[serde(default, deserialize_with = "lenient_seq")]
    pub position_history: VecDeque<PositionFix>,
    /// Arrival-ordered. FIFO-capped for special nodes, retention-pruned
    /// for everyone else.
    #[serde(default, rename = "packets", deserialize_with = "lenient_seq")]
    pub packet_history: VecDeque<Packet>,
    /// Sticky until the node re-enters its geofence radius.
    #[serde(default)]
    pub moved_far: bool,
    #[serde(default, with = "ts_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub last_alert_time: Option<DateTime<Utc>>,
    /// Reliability observations for the gateways that uplinked this node,
    /// keyed by gateway id.
    #[serde(default, deserialize_with = "lenient_map")]
    pub gateways: HashMap<String, GatewayObservation>,
}

impl NodeState {
    pub fn new(node_id: String, first_seen: DateTime<Utc>) -> Self {
        Self {
            node_id,
            long_name: None,
            short_name: None,
            hardware_model: None,
            first_seen,
            last_seen: first_seen,
            last_position_update: None,
            position: None,
            battery_percent: None,
            voltage: None,
            channel_utilization: None,
            is_special: false,
            origin: None,
            position_history: VecDeque::new(),
            packet_history: VecDeque::new(),
            moved_far: false,
            last_alert_time: None,
            gateways: HashMap::new(),
        }
    }

    /// Best available human-readable name.
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .unwrap_or(&self.node_id)
    }

    /// Insert a fix at its sorted slot. Returns false on a timestamp
    /// duplicate (retransmits carry the identical timestamp).
    fn insert_position(&mut self, fix: PositionFix, cap: usize) -> bool {
        match self
            .position_history
            .binary_search_by(|entry| entry.timestamp.cmp(&fix.timestamp))
        {
            Ok(_) => false,
            Err(idx) => {
                self.position_history.insert(idx, fix);
                while self.position_history.len() > cap {
                    self.position_history.pop_front();
                }
                true
            }
        }
    }
}

/// What an ingest call changed; drives save scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub node_created: bool,
    /// Any externally visible field changed; a persistence save is warranted.
    pub state_changed: bool,
    /// A new position entered the history (not a duplicate retransmit).
    pub position_recorded: bool,
}

/// Counts removed by one retention pass, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub packets_removed: usize,
    pub positions_removed: usize,
    pub gateways_removed: usize,
}

impl RetentionStats {
    pub fn total(&self) -> usize {
        self.packets_removed + self.positions_removed + self.gateways_removed
    }
}

/// The store itself. Wrap in [`SharedTracker`] for concurrent use.
pub struct NodeTracker {
    nodes: HashMap<String, NodeState>,
    limits: TrackerConfig,
    gateway_policy: GatewayConfig,
    special: HashMap<String, SpecialNodeConfig>,
}

impl NodeTracker {
    pub fn new(
        limits: TrackerConfig,
        gateway_policy: GatewayConfig,
        special: HashMap<String, SpecialNodeConfig>,
    ) -> Self {
        Self {
            nodes: HashMap::new(),
            limits,
            gateway_policy,
            special,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replace in-memory state with a loaded snapshot, then re-annotate from
    /// the current special-node table (origins may have changed while down).
    pub fn restore(&mut self, nodes: HashMap<String, NodeState>) {
        self.nodes = nodes;
        let special = self.special.clone();
        self.apply_special(&special);
    }

    /// Fold one packet into the store.
    pub fn ingest(&mut self, packet: &Packet) -> UpdateResult {
        let mut result = UpdateResult::default();

        let special = &self.special;
        let created = &mut result.node_created;
        let state = self
            .nodes
            .entry(packet.source.clone())
            .or_insert_with(|| {
                *created = true;
                debug!("tracking new node {}", packet.source);
                let mut state = NodeState::new(packet.source.clone(), packet.rx_time);
                if let Some(cfg) = special.get(&packet.source) {
                    state.is_special = true;
                    state.origin = Some(GeoPoint {
                        latitude: cfg.origin_lat,
                        longitude: cfg.origin_lon,
                    });
                    // Configured name stands in until NodeInfo supplies one.
                    state.long_name = cfg.name.clone();
                }
                state
            });

        if packet.rx_time > state.last_seen {
            state.last_seen = packet.rx_time;
            result.state_changed = true;
        }

        match &packet.payload {
            Some(PacketPayload::Position(pos)) => {
                let fix = PositionFix {
                    timestamp: packet.rx_time,
                    lat: pos.latitude,
                    lon: pos.longitude,
                    alt: pos.altitude,
                };
                if state.insert_position(fix, self.limits.max_position_history) {
                    result.position_recorded = true;
                    result.state_changed = true;
                    let newest = state
                        .position_history
                        .back()
                        .map(|entry| entry.timestamp == fix.timestamp)
                        .unwrap_or(false);
                    if newest {
                        state.position = Some(fix);
                        state.last_position_update = Some(fix.timestamp);
                    }
                }
            }
            Some(PacketPayload::Telemetry(telemetry)) => {
                if telemetry.battery_percent.is_some()
                    && state.battery_percent != telemetry.battery_percent
                {
                    state.battery_percent = telemetry.battery_percent;
                    result.state_changed = true;
                }
                if telemetry.voltage.is_some() && state.voltage != telemetry.voltage {
                    state.voltage = telemetry.voltage;
                    result.state_changed = true;
                }
                if telemetry.channel_utilization.is_some()
                    && state.channel_utilization != telemetry.channel_utilization
                {
                    state.channel_utilization = telemetry.channel_utilization;
                    result.state_changed = true;
                }
            }
            Some(PacketPayload::NodeInfo(info)) => {
                if info.long_name.is_some() && state.long_name != info.long_name {
                    debug!(
                        "node {} is now \"{}\"",
                        state.node_id,
                        escape_log(info.long_name.as_deref().unwrap_or(""))
                    );
                    state.long_name = info.long_name.clone();
                    result.state_changed = true;
                }
                if info.short_name.is_some() && state.short_name != info.short_name {
                    state.short_name = info.short_name.clone();
                    result.state_changed = true;
                }
                if info.hardware_model.is_some() && state.hardware_model != info.hardware_model {
                    state.hardware_model = info.hardware_model.clone();
                    result.state_changed = true;
                }
            }
            None => {}
        }

        // Every packet enters the per-node history; the cap only applies to
        // special nodes, everyone else is pruned by retention.
        state.packet_history.push_back(packet.clone());
        if state.is_special {
            while state.packet_history.len() > self.limits.special_packet_history {
                state.packet_history.pop_front();
            }
        }
        result.state_changed = true;

        result
    }

    /// Record gateway-heard evidence for a packet that passed the admission
    /// filter. Returns whether an observation was updated.
    ///
    /// Call after [`ingest`](Self::ingest) so the node entry exists.
    pub fn record_gateway_evidence(&mut self, packet: &Packet) -> bool {
        let hit = match gateway::classify(packet, &self.gateway_policy) {
            Some(hit) => hit,
            None => return false,
        };
        let gateway_id = match packet.gateway.as_ref() {
            Some(id) => id.clone(),
            None => return false,
        };
        let state = match self.nodes.get_mut(&packet.source) {
            Some(state) => state,
            None => return false,
        };
        let obs = state
            .gateways
            .entry(gateway_id)
            .or_insert_with(|| GatewayObservation::new(packet.rx_time));
        obs.record(hit, packet.rssi, packet.rx_time, &self.gateway_policy);
        true
    }

    /// Run the movement state machine for one node, typically right after a
    /// position ingest. Returns an alert when one is due.
    pub fn evaluate_movement(
        &mut self,
        node_id: &str,
        detector: &movement::MovementDetector,
        now: DateTime<Utc>,
    ) -> Option<movement::MovementAlert> {
        let state = self.nodes.get_mut(node_id)?;
        detector.evaluate(state, now)
    }

    /// Prune history older than `cutoff` and gateway observations past their
    /// tier window (measured from `now`). The most recent packet and the most
    /// recent position of each node always survive, even when stale:
    /// liveness over data hygiene.
    pub fn apply_retention(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> RetentionStats {
        let mut stats = RetentionStats::default();

        for state in self.nodes.values_mut() {
            stats.packets_removed += prune_deque(&mut state.packet_history, cutoff, |p| p.rx_time);
            stats.positions_removed +=
                prune_deque(&mut state.position_history, cutoff, |p| p.timestamp);

            let before = state.gateways.len();
            state
                .gateways
                .retain(|_, obs| now - obs.last_seen <= obs.retention_window());
            stats.gateways_removed += before - state.gateways.len();
        }

        stats
    }

    /// Read-only deep copy of every node. Callers get owned data; nothing
    /// here can alias internal state.
    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.nodes.clone()
    }

    /// Ordered position history for one node, optionally bounded below.
    pub fn node_history(&self, node_id: &str, since: Option<DateTime<Utc>>) -> Vec<PositionFix> {
        let state = match self.nodes.get(node_id) {
            Some(state) => state,
            None => return Vec::new(),
        };
        state
            .position_history
            .iter()
            .filter(|fix| since.map(|s| fix.timestamp >= s).unwrap_or(true))
            .copied()
            .collect()
    }

    /// Most recent packets, newest first, for one node or across all nodes.
    pub fn recent_packets(&self, node_id: Option<&str>, limit: usize) -> Vec<Packet> {
        let mut packets: Vec<Packet> = match node_id {
            Some(id) => self
                .nodes
                .get(id)
                .map(|state| state.packet_history.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .nodes
                .values()
                .flat_map(|state| state.packet_history.iter().cloned())
                .collect(),
        };
        packets.sort_by(|a, b| b.rx_time.cmp(&a.rx_time));
        packets.truncate(limit);
        packets
    }

    /// Swap in a new special-node table and recompute derived per-node
    /// fields. History is untouched. Returns how many nodes changed.
    pub fn reload_special_nodes(&mut self, special: HashMap<String, SpecialNodeConfig>) -> usize {
        self.special = special;
        let table = self.special.clone();
        self.apply_special(&table)
    }

    fn apply_special(&mut self, table: &HashMap<String, SpecialNodeConfig>) -> usize {
        let mut changed = 0;
        for (id, state) in self.nodes.iter_mut() {
            let (is_special, origin) = match table.get(id) {
                Some(cfg) => (
                    true,
                    Some(GeoPoint {
                        latitude: cfg.origin_lat,
                        longitude: cfg.origin_lon,
                    }),
                ),
                None => (false, None),
            };
            if state.is_special != is_special || state.origin != origin {
                state.is_special = is_special;
                state.origin = origin;
                if !is_special {
                    state.moved_far = false;
                }
                if state.long_name.is_none() {
                    if let Some(cfg) = table.get(id) {
                        state.long_name = cfg.name.clone();
                    }
                }
                changed += 1;
            }
        }
        changed
    }
}

/// Remove entries older than `cutoff`, always keeping the newest entry.
fn prune_deque<T, F>(deque: &mut VecDeque<T>, cutoff: DateTime<Utc>, time_of: F) -> usize
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let newest = match deque.iter().map(&time_of).max() {
        Some(t) => t,
        None => return 0,
    };
    let before = deque.len();
    let mut kept_newest = false;
    deque.retain(|entry| {
        let t = time_of(entry);
        if t >= cutoff {
            true
        } else if t == newest && !kept_newest {
            kept_newest = true;
            true
        } else {
            false
        }
    });
    before - deque.len()
}

/// Deserialize a history array entry-by-entry, dropping unreadable entries
/// (bad timestamps, truncated rows) instead of failing the whole document.
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<VecDeque<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw: Vec<Value> = Vec::deserialize(deserializer)?;
    let mut out = VecDeque::with_capacity(raw.len());
    let mut skipped = 0usize;
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => out.push_back(entry),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("skipped {} unreadable history entries", skipped);
    }
    Ok(out)
}

/// Map-valued counterpart of [`lenient_seq`].
fn lenient_map<'de, D, T>(deserializer: D) -> Result<HashMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    let mut skipped = 0usize;
    for (key, value) in raw {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => {
                out.insert(key, entry);
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("skipped {} unreadable map entries", skipped);
    }
    Ok(out)
}

/// `Option<DateTime<Utc>>` as optional float epoch seconds.
mod ts_seconds_opt {
    use crate::packet::ts_seconds;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => ts_seconds::serialize(dt, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "ts_seconds")] DateTime<Utc>);
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}
