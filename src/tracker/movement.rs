//! Geofence and movement detection for nodes with a configured home origin.
//!
//! Distances are great-circle (haversine). The thresholds involved are tens
//! of meters, and longitude scaling is latitude-dependent, so a planar
//! approximation would misfire at higher latitudes.
//!
//! Per node this is a two-state machine, {Inside, Outside}: the first
//! Inside→Outside transition raises one alert and latches `moved_far`;
//! further alerts for a continuing excursion are gated by a cooldown;
//! Outside→Inside resets the latch silently, with no "returned" alert.

use crate::config::MovementConfig;
use crate::tracker::{GeoPoint, NodeState, PositionFix};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Event emitted when a geofenced node leaves its origin radius.
///
/// Delivery (email, push, whatever) belongs to the consumer on the other
/// end of the alert channel; this record carries everything it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementAlert {
    pub id: Uuid,
    pub node_id: String,
    pub display_name: String,
    pub distance_meters: f64,
    pub position: PositionFix,
    pub origin: GeoPoint,
    #[serde(with = "crate::packet::ts_seconds")]
    pub at: DateTime<Utc>,
}

/// Stateless policy holder; all per-node detection state lives on [`NodeState`].
#[derive(Debug, Clone)]
pub struct MovementDetector {
    config: MovementConfig,
}

impl MovementDetector {
    pub fn new(config: MovementConfig) -> Self {
        Self { config }
    }

    /// Run the state machine for one node against its current position.
    ///
    /// Returns an alert exactly when one should be delivered. Mutates
    /// `moved_far` and `last_alert_time` on the node.
    pub fn evaluate(&self, state: &mut NodeState, now: DateTime<Utc>) -> Option<MovementAlert> {
        let origin = state.origin?;
        let fix = state.position?;
        let here = GeoPoint {
            latitude: fix.lat,
            longitude: fix.lon,
        };
        let distance = haversine_meters(&origin, &here);

        if distance <= self.config.threshold_meters {
            // Back inside the fence: reset silently.
            state.moved_far = false;
            return None;
        }

        let cooldown = Duration::minutes(self.config.alert_cooldown_minutes);
        let alert_due = if !state.moved_far {
            true
        } else {
            // Still outside; re-alert only once the cooldown has elapsed.
            state
                .last_alert_time
                .map(|last| now - last >= cooldown)
                .unwrap_or(true)
        };

        state.moved_far = true;
        if !alert_due {
            return None;
        }

        state.last_alert_time = Some(now);
        Some(MovementAlert {
            id: Uuid::new_v4(),
            node_id: state.node_id.clone(),
            display_name: state.display_name().to_string(),
            distance_meters: distance,
            position: fix,
            origin,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // One degree of latitude under the haversine sphere radius.
    const METERS_PER_DEGREE_LAT: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn node_at(origin: GeoPoint, lat: f64, lon: f64) -> NodeState {
        let mut state = NodeState::new("!00000042".to_string(), at(0));
        state.is_special = true;
        state.origin = Some(origin);
        state.position = Some(PositionFix {
            timestamp: at(0),
            lat,
            lon,
            alt: None,
        });
        state
    }

    fn detector() -> MovementDetector {
        MovementDetector::new(MovementConfig::default())
    }

    #[test]
    fn haversine_matches_known_distances() {
        let origin = GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        };
        let north_1deg = GeoPoint {
            latitude: 46.0,
            longitude: -122.0,
        };
        let d = haversine_meters(&origin, &north_1deg);
        assert!((d - METERS_PER_DEGREE_LAT).abs() < 1.0, "got {}", d);

        // Longitude degrees shrink with latitude; at 60N a degree of
        // longitude is about half a degree of latitude.
        let origin_60 = GeoPoint {
            latitude: 60.0,
            longitude: 10.0,
        };
        let east_1deg = GeoPoint {
            latitude: 60.0,
            longitude: 11.0,
        };
        let d = haversine_meters(&origin_60, &east_1deg);
        assert!((d - METERS_PER_DEGREE_LAT / 2.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn at_origin_never_alerts() {
        let origin = GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        };
        let mut state = node_at(origin, 45.0, -122.0);
        assert!(detector().evaluate(&mut state, at(10)).is_none());
        assert!(!state.moved_far);
    }

    #[test]
    fn crossing_threshold_alerts_once_and_latches() {
        let origin = GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        };
        let d = detector();

        // 51 m north of origin (threshold is 50 m).
        let mut state = node_at(origin, 45.0 + 51.0 / METERS_PER_DEGREE_LAT, -122.0);
        let alert = d.evaluate(&mut state, at(10)).expect("first crossing alerts");
        assert!(state.moved_far);
        assert!(alert.distance_meters > 50.0 && alert.distance_meters < 52.0);
        assert_eq!(alert.node_id, "!00000042");
        assert_eq!(state.last_alert_time, Some(at(10)));

        // Still outside moments later: latched, no second alert.
        assert!(d.evaluate(&mut state, at(20)).is_none());

        // Back to 10 m away: silent reset.
        state.position = Some(PositionFix {
            timestamp: at(30),
            lat: 45.0 + 10.0 / METERS_PER_DEGREE_LAT,
            lon: -122.0,
            alt: None,
        });
        assert!(d.evaluate(&mut state, at(30)).is_none());
        assert!(!state.moved_far);
    }

    #[test]
    fn continuing_excursion_realerts_after_cooldown() {
        let origin = GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        };
        let d = detector();
        let mut state = node_at(origin, 45.0 + 80.0 / METERS_PER_DEGREE_LAT, -122.0);

        assert!(d.evaluate(&mut state, at(0)).is_some());
        // Inside the 60 min cooldown window.
        assert!(d.evaluate(&mut state, at(30 * 60)).is_none());
        // Cooldown elapsed, excursion continues: one repeat alert.
        let repeat = d.evaluate(&mut state, at(60 * 60)).expect("repeat alert");
        assert!(repeat.distance_meters > 50.0);
        assert_eq!(state.last_alert_time, Some(at(60 * 60)));
        // And the window restarts.
        assert!(d.evaluate(&mut state, at(61 * 60)).is_none());
    }

    #[test]
    fn new_excursion_after_return_alerts_again() {
        let origin = GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        };
        let d = detector();
        let mut state = node_at(origin, 45.0 + 60.0 / METERS_PER_DEGREE_LAT, -122.0);

        assert!(d.evaluate(&mut state, at(0)).is_some());

        state.position = Some(PositionFix {
            timestamp: at(10),
            lat: 45.0,
            lon: -122.0,
            alt: None,
        });
        assert!(d.evaluate(&mut state, at(10)).is_none());
        assert!(!state.moved_far);

        state.position = Some(PositionFix {
            timestamp: at(20),
            lat: 45.0 + 60.0 / METERS_PER_DEGREE_LAT,
            lon: -122.0,
            alt: None,
        });
        // moved_far latched false→true again: fresh excursion, fresh alert,
        // regardless of the cooldown from the previous one.
        assert!(d.evaluate(&mut state, at(20)).is_some());
    }

    #[test]
    fn nodes_without_origin_or_fix_are_ignored() {
        let mut state = NodeState::new("!00000001".to_string(), at(0));
        assert!(detector().evaluate(&mut state, at(0)).is_none());

        state.origin = Some(GeoPoint {
            latitude: 45.0,
            longitude: -122.0,
        });
        assert!(detector().evaluate(&mut state, at(0)).is_none());
    }
}
