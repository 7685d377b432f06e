//! # Tracker Server - Ingestion Event Loop
//!
//! Wires the components together: consumes `(topic, payload)` pairs
//! delivered by the transport, normalizes them, feeds the node state store,
//! runs gateway scoring and movement detection, and drives the throttled
//! persistence tick.
//!
//! ## Event Sources
//!
//! The main loop multiplexes three sources with `tokio::select!`:
//!
//! - the raw message channel (any transport task can hold a sender)
//! - a one-second housekeeping tick that runs the save throttle
//! - `ctrl_c`, which breaks the loop for a graceful shutdown
//!
//! ## Locking Discipline
//!
//! One mutex guards the store. Packet handling locks, mutates, unlocks;
//! persistence locks only long enough to prune and copy, then writes the
//! copy to disk with the lock released. Ingestion never blocks on the disk:
//! a slow save just delays the next one.

use crate::config::{Config, SpecialNodeConfig};
use crate::metrics;
use crate::packet;
use crate::persist::{SaveThrottle, StateStore};
use crate::tracker::movement::{MovementAlert, MovementDetector};
use crate::tracker::{NodeTracker, SharedTracker};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One message as delivered by the transport: the topic it arrived on and
/// its already-deserialized JSON body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Value,
}

/// The ingestion core. Owns the store, the persistence manager, and the
/// channels that connect them to the outside.
pub struct TrackerServer {
    config: Config,
    tracker: SharedTracker,
    store: StateStore,
    throttle: SaveThrottle,
    detector: MovementDetector,
    raw_tx: mpsc::UnboundedSender<RawMessage>,
    raw_rx: Option<mpsc::UnboundedReceiver<RawMessage>>,
    alert_tx: mpsc::UnboundedSender<MovementAlert>,
    alert_rx: Option<mpsc::UnboundedReceiver<MovementAlert>>,
}

impl TrackerServer {
    /// Build the server: take the instance lock, load the last snapshot,
    /// and restore the store from it.
    pub fn new(config: Config) -> Result<Self> {
        let store = StateStore::new(&config.storage.data_dir, &config.storage.state_file)?;

        let mut tracker = NodeTracker::new(
            config.tracker.clone(),
            config.gateway.clone(),
            config.special_nodes.clone(),
        );
        tracker.restore(store.load());
        if tracker.node_count() > 0 {
            info!("restored {} nodes from disk", tracker.node_count());
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();

        Ok(Self {
            throttle: SaveThrottle::new(Duration::from_secs(config.storage.save_interval_secs)),
            detector: MovementDetector::new(config.movement.clone()),
            tracker: Arc::new(Mutex::new(tracker)),
            store,
            config,
            raw_tx,
            raw_rx: Some(raw_rx),
            alert_tx,
            alert_rx: Some(alert_rx),
        })
    }

    /// Sender half of the ingestion channel. Clone one per transport task.
    pub fn message_sender(&self) -> mpsc::UnboundedSender<RawMessage> {
        self.raw_tx.clone()
    }

    /// Hand the movement alert stream to its consumer. Until this is taken,
    /// alerts are logged but not queued anywhere.
    pub fn take_alert_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<MovementAlert>> {
        self.alert_rx.take()
    }

    /// Shared handle to the store, for read-side consumers (API layer).
    pub fn tracker(&self) -> SharedTracker {
        Arc::clone(&self.tracker)
    }

    /// Apply an updated special-node table to the running store without
    /// discarding history. Returns how many nodes changed.
    pub fn reload_special_nodes(&self, special: HashMap<String, SpecialNodeConfig>) -> usize {
        let changed = self
            .tracker
            .lock()
            .expect("tracker mutex poisoned")
            .reload_special_nodes(special);
        if changed > 0 {
            info!("special-node reload touched {} nodes", changed);
        }
        changed
    }

    /// Run until shutdown. Blocks on the event loop; on ctrl_c (or the
    /// transport channel closing) a final save is forced before returning.
    pub async fn run(&mut self) -> Result<()> {
        let mut raw_rx = self
            .raw_rx
            .take()
            .ok_or_else(|| anyhow!("server already running"))?;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "tracker running (save window {}s, retention {} days)",
            self.config.storage.save_interval_secs, self.config.tracker.retention_days
        );

        loop {
            tokio::select! {
                msg = raw_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_raw(msg),
                        None => {
                            warn!("transport channel closed");
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    self.persist_if_due(false);
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown()
    }

    /// Normalize and apply one delivered message. Malformed input is logged
    /// and dropped here; it never reaches the store.
    fn handle_raw(&mut self, msg: RawMessage) {
        let packet = match packet::normalize(&msg.topic, &msg.payload) {
            Ok(packet) => packet,
            Err(e) => {
                metrics::inc_packets_malformed();
                debug!("dropping malformed packet on {}: {}", msg.topic, e);
                return;
            }
        };

        let now = Utc::now();
        let mut alert = None;
        {
            let mut tracker = self.tracker.lock().expect("tracker mutex poisoned");
            let result = tracker.ingest(&packet);

            if tracker.record_gateway_evidence(&packet) {
                metrics::inc_gateway_hits_recorded();
            } else if packet.gateway.is_some() {
                metrics::inc_gateway_evidence_rejected();
            }

            if result.position_recorded {
                alert = tracker.evaluate_movement(&packet.source, &self.detector, now);
            }
            if result.state_changed {
                self.throttle.mark_dirty();
            }
        }
        metrics::inc_packets_ingested();

        if let Some(alert) = alert {
            metrics::inc_alerts_emitted();
            warn!(
                "node {} ({}) is {:.0} m from its origin",
                alert.node_id,
                crate::logutil::escape_log(&alert.display_name),
                alert.distance_meters
            );
            // Only queue when a consumer has attached; otherwise the channel
            // would grow without bound.
            if self.alert_rx.is_none() && self.alert_tx.send(alert).is_err() {
                debug!("alert consumer dropped its receiver");
            }
        }
    }

    /// Run the retention-then-save sequence when the throttle allows it.
    fn persist_if_due(&mut self, force: bool) {
        if !self.throttle.should_save(force) {
            return;
        }

        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(self.config.tracker.retention_days);
        let (snapshot, stats) = {
            let mut tracker = self.tracker.lock().expect("tracker mutex poisoned");
            let stats = tracker.apply_retention(cutoff, now);
            (tracker.snapshot(), stats)
        };

        if stats.total() > 0 {
            info!(
                "retention removed {} packets, {} positions, {} gateway observations",
                stats.packets_removed, stats.positions_removed, stats.gateways_removed
            );
        }

        // Lock released; the write happens against the copy.
        match self.store.save(&snapshot) {
            Ok(()) => {
                metrics::inc_saves_completed();
                self.throttle.saved();
                debug!("saved {} nodes to {}", snapshot.len(), self.store.state_path().display());
            }
            Err(e) => {
                metrics::inc_saves_failed();
                error!("state save failed: {} (keeping state, will retry)", e);
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.persist_if_due(true);
        info!("tracker shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_str().unwrap().to_string();
        config.logging.file = None;
        config
    }

    fn raw_position(from: u64, secs: f64) -> RawMessage {
        RawMessage {
            topic: "msh/US/2/json/LongFast/!0000beef".to_string(),
            payload: json!({
                "from": from,
                "timestamp": secs,
                "type": "position",
                "hop_start": 3,
                "hop_limit": 3,
                "rssi": -85,
                "payload": {"latitude": 45.0, "longitude": -122.0}
            }),
        }
    }

    #[tokio::test]
    async fn ingests_and_persists_through_the_public_surface() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = TrackerServer::new(test_config(&dir)).unwrap();

        server.handle_raw(raw_position(0x1001, 1_700_000_000.0));
        server.handle_raw(raw_position(0x1001, 1_700_000_060.0));
        server.handle_raw(RawMessage {
            topic: "t".to_string(),
            payload: json!({"garbage": true}),
        });

        {
            let tracker = server.tracker();
            let tracker = tracker.lock().unwrap();
            assert_eq!(tracker.node_count(), 1);
            assert_eq!(tracker.node_history("!00001001", None).len(), 2);
        }

        // Force the save path and reload from disk through a fresh store.
        server.persist_if_due(true);
        drop(server);

        let mut reopened = TrackerServer::new(test_config(&dir)).unwrap();
        {
            let tracker = reopened.tracker();
            let tracker = tracker.lock().unwrap();
            assert_eq!(tracker.node_count(), 1);
            let state_map = tracker.snapshot();
            let state = state_map.get("!00001001").unwrap();
            assert_eq!(state.position_history.len(), 2);
            assert_eq!(
                state.gateways.get("!0000beef").unwrap().direct_hit_count,
                2
            );
        }
        assert!(reopened.take_alert_receiver().is_some());
    }

    #[tokio::test]
    async fn movement_alert_reaches_the_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.special_nodes.insert(
            "!00001001".to_string(),
            crate::config::SpecialNodeConfig {
                name: None,
                origin_lat: 45.0,
                origin_lon: -122.0,
            },
        );
        let mut server = TrackerServer::new(config).unwrap();
        let mut alerts = server.take_alert_receiver().unwrap();

        // At origin: no alert.
        server.handle_raw(raw_position(0x1001, 1_700_000_000.0));
        // 0.01 degrees north is about 1.1 km out.
        server.handle_raw(RawMessage {
            topic: "t".to_string(),
            payload: json!({
                "from": 0x1001,
                "timestamp": 1_700_000_060.0,
                "type": "position",
                "payload": {"latitude": 45.01, "longitude": -122.0}
            }),
        });

        let alert = alerts.try_recv().expect("alert queued");
        assert_eq!(alert.node_id, "!00001001");
        assert!(alert.distance_meters > 1_000.0);
        assert!(alerts.try_recv().is_err());
    }
}
