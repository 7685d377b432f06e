//! Hot reload of the special-node table: origins move, history stays.

mod common;

use common::{raw_position, test_config, TOPIC};
use meshwatch::config::SpecialNodeConfig;
use meshwatch::server::TrackerServer;
use std::collections::HashMap;

fn shed_at(lat: f64, lon: f64) -> SpecialNodeConfig {
    SpecialNodeConfig {
        name: Some("Shed".to_string()),
        origin_lat: lat,
        origin_lon: lon,
    }
}

#[tokio::test]
async fn reload_updates_live_nodes_without_dropping_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config
        .special_nodes
        .insert("!00000042".to_string(), shed_at(45.0, -122.0));
    let server = TrackerServer::new(config).unwrap();

    // Ingest through the shared handle, as the running loop would.
    {
        let tracker = server.tracker();
        let mut tracker = tracker.lock().unwrap();
        for i in 0..4 {
            let raw = raw_position(0x42, 1_700_000_000.0 + i as f64 * 60.0, 45.0, -122.0);
            let packet = meshwatch::packet::normalize(TOPIC, &raw).unwrap();
            tracker.ingest(&packet);
        }
    }

    // The origin moves; everything accumulated stays.
    let mut replacement = HashMap::new();
    replacement.insert("!00000042".to_string(), shed_at(46.5, -120.25));
    assert_eq!(server.reload_special_nodes(replacement), 1);

    {
        let tracker = server.tracker();
        let tracker = tracker.lock().unwrap();
        let nodes = tracker.snapshot();
        let state = nodes.get("!00000042").unwrap();
        assert!(state.is_special);
        let origin = state.origin.unwrap();
        assert!((origin.latitude - 46.5).abs() < 1e-9);
        assert!((origin.longitude + 120.25).abs() < 1e-9);
        assert_eq!(state.long_name.as_deref(), Some("Shed"));
        assert_eq!(state.position_history.len(), 4);
    }

    // Demoting the node clears its geofence state, nothing else.
    assert_eq!(server.reload_special_nodes(HashMap::new()), 1);
    let tracker = server.tracker();
    let tracker = tracker.lock().unwrap();
    let nodes = tracker.snapshot();
    let state = nodes.get("!00000042").unwrap();
    assert!(!state.is_special);
    assert!(state.origin.is_none());
    assert!(!state.moved_far);
    assert_eq!(state.position_history.len(), 4);
}

#[tokio::test]
async fn unseen_special_nodes_apply_on_first_contact() {
    let dir = tempfile::tempdir().unwrap();
    let server = TrackerServer::new(test_config(&dir)).unwrap();

    // Table arrives before the node has ever been heard.
    let mut table = HashMap::new();
    table.insert("!00000099".to_string(), shed_at(45.0, -122.0));
    assert_eq!(server.reload_special_nodes(table), 0);

    let tracker = server.tracker();
    let mut tracker = tracker.lock().unwrap();
    let raw = raw_position(0x99, 1_700_000_000.0, 45.0, -122.0);
    let packet = meshwatch::packet::normalize(TOPIC, &raw).unwrap();
    tracker.ingest(&packet);

    let nodes = tracker.snapshot();
    let state = nodes.get("!00000099").unwrap();
    assert!(state.is_special);
    assert!(state.origin.is_some());
}
