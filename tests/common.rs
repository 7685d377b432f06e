//! Test utilities & fixtures shared by the integration tests.

use meshwatch::config::Config;
use meshwatch::packet::{normalize, Packet};
use serde_json::{json, Value};

/// Default topic the simulated gateway publishes under.
#[allow(dead_code)]
pub const TOPIC: &str = "msh/US/2/json/LongFast/!0000beef";

/// Build a config rooted in a temp dir so tests never collide on disk.
#[allow(dead_code)]
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_str().unwrap().to_string();
    config.logging.file = None;
    config
}

/// Raw position message the way the JSON bridge emits it.
#[allow(dead_code)]
pub fn raw_position(from: u64, secs: f64, lat: f64, lon: f64) -> Value {
    json!({
        "from": from,
        "timestamp": secs,
        "type": "position",
        "hop_start": 3,
        "hop_limit": 3,
        "rssi": -85,
        "payload": {"latitude": lat, "longitude": lon}
    })
}

/// Normalized position packet, panicking on malformed fixtures.
#[allow(dead_code)]
pub fn position_packet(from: u64, secs: f64, lat: f64, lon: f64) -> Packet {
    normalize(TOPIC, &raw_position(from, secs, lat, lon)).expect("fixture packet")
}
