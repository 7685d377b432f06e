//! # Meshwatch - Live Node Tracker for Meshtastic Networks
//!
//! Meshwatch ingests the telemetry stream a Meshtastic mesh publishes over
//! MQTT and maintains a live, queryable model of every node it has heard
//! and every gateway that relayed for them. Bounded, aged history is
//! persisted so a restart resumes from where the stream left off.
//!
//! ## Features
//!
//! - **Packet Normalization**: camelCase and snake_case wire spellings both
//!   decode into one canonical, strongly typed packet record.
//! - **Node Tracking**: per-node identity, battery, position history
//!   (timestamp-deduplicated and ordered), and packet history.
//! - **Gateway Reliability Scoring**: hop-counter and RSSI evidence filters
//!   separate gateways that actually hear a node from multi-hop relays.
//! - **Geofence Alerts**: haversine distance against a configured origin
//!   with a latched, cooldown-gated movement state machine.
//! - **Throttled Persistence**: coalesced atomic snapshot writes with aged
//!   retention; crash-safe via temp-file-then-rename.
//! - **Async Design**: one Tokio event loop, one state lock, no I/O under
//!   the lock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshwatch::config::Config;
//! use meshwatch::server::TrackerServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = TrackerServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`packet`] - Wire payload normalization into canonical packets
//! - [`tracker`] - The node state store and movement detection
//! - [`gateway`] - Per-(node, gateway) reliability scoring
//! - [`persist`] - Durable snapshots, retention driving, save throttle
//! - [`server`] - The ingestion event loop tying it all together
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MQTT Feeder    │ ← transport (feature "mqtt")
//! └─────────────────┘
//!          │ (topic, json)
//! ┌─────────────────┐
//! │ Tracker Server  │ ← normalize, ingest, score, detect
//! └─────────────────┘
//!          │ snapshot under lock
//! ┌─────────────────┐
//! │  State Store    │ ← throttled atomic JSON snapshots
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod packet;
pub mod persist;
pub mod server;
pub mod tracker;
#[cfg(feature = "mqtt")]
pub mod transport;
