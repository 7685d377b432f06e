//! # Packet Normalization Module
//!
//! This module converts heterogeneous JSON payloads delivered by the
//! publish/subscribe transport into the canonical [`Packet`] record that the
//! rest of the system consumes. Everything past this boundary is strongly
//! typed.
//!
//! ## Features
//!
//! - **Field-name normalization**: every wire field is accepted under both
//!   its camelCase and snake_case spelling. Upstream firmware and bridge
//!   versions disagree on the convention, and silently dropping one spelling
//!   has caused data loss before, so both are first-class here and covered
//!   by tests.
//! - **Canonical node ids**: numeric ids and `!hex` strings normalize to the
//!   same `!xxxxxxxx` form.
//! - **Tolerant timestamps**: float epoch seconds, integer epoch seconds,
//!   and RFC 3339 strings are all accepted.
//! - **Unknown kinds survive**: a packet type this version does not know maps
//!   to [`PacketKind::Other`] rather than being rejected, so `last_seen`
//!   tracking keeps working across firmware upgrades.
//!
//! Normalization is a pure function of its input; it never touches shared
//! state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical packet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Position,
    Telemetry,
    NodeInfo,
    MapReport,
    Other,
}

/// Kind-specific decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketPayload {
    Position(PositionPayload),
    Telemetry(TelemetryPayload),
    NodeInfo(NodeInfoPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
}

/// One received mesh packet in canonical form. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Originating node, canonical `!xxxxxxxx` form.
    pub source: String,
    /// Receive time, microsecond precision. Retransmits of the same packet
    /// carry the same wire timestamp and therefore compare equal here.
    #[serde(with = "ts_seconds")]
    pub rx_time: DateTime<Utc>,
    pub kind: PacketKind,
    /// Remaining hop budget at the receiving radio. Zero when the sender
    /// omitted the field.
    #[serde(default)]
    pub hop_limit: u32,
    /// Hop budget the packet started with. `None` means the sender never
    /// populated it, which is distinct from zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    /// Node id of the radio that uplinked this packet. May equal `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PacketPayload>,
}

/// Normalization failures. Malformed packets are logged and dropped at the
/// boundary; they never reach the state store.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("missing or invalid source node id")]
    MissingSource,

    #[error("missing or invalid receive timestamp")]
    MissingTimestamp,

    #[error("missing or invalid packet type")]
    MissingKind,
}

/// Serialize `DateTime<Utc>` as float epoch seconds (the wire convention),
/// accepting either float seconds or an RFC 3339 string on the way back in.
pub mod ts_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(dt.timestamp_micros() as f64 / 1e6)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => super::datetime_from_epoch(secs)
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range")),
            Repr::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Convert float epoch seconds to a UTC timestamp at microsecond precision.
pub fn datetime_from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1e6).round() as i64)
}

/// Canonicalize a node id from whatever the wire carried.
///
/// Numeric ids become `!%08x`; `!hex` strings are lowercased; bare decimal
/// strings are treated as numeric ids.
pub fn canonical_node_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| format!("!{:08x}", v)),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Some(hex) = s.strip_prefix('!') {
                if hex.is_empty() {
                    return None;
                }
                Some(format!("!{}", hex.to_ascii_lowercase()))
            } else if let Ok(v) = s.parse::<u64>() {
                Some(format!("!{:08x}", v))
            } else {
                Some(format!("!{}", s.to_ascii_lowercase()))
            }
        }
        _ => None,
    }
}

/// Look a field up under any of its accepted spellings, skipping JSON nulls.
fn field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let map = obj.as_object()?;
    names.iter().find_map(|n| map.get(*n)).filter(|v| !v.is_null())
}

fn f32_field(obj: &Value, names: &[&str]) -> Option<f32> {
    field(obj, names)?.as_f64().map(|v| v as f32)
}

fn u32_field(obj: &Value, names: &[&str]) -> Option<u32> {
    field(obj, names)?.as_u64().map(|v| v as u32)
}

fn string_field(obj: &Value, names: &[&str]) -> Option<String> {
    let s = field(obj, names)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => datetime_from_epoch(n.as_f64()?),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn parse_kind(value: &Value) -> Option<PacketKind> {
    let text = value.as_str()?.trim().to_ascii_lowercase();
    if text.is_empty() {
        return None;
    }
    Some(match text.as_str() {
        "position" => PacketKind::Position,
        "telemetry" => PacketKind::Telemetry,
        "nodeinfo" | "node_info" => PacketKind::NodeInfo,
        "mapreport" | "map_report" => PacketKind::MapReport,
        _ => PacketKind::Other,
    })
}

fn parse_position(payload: &Value) -> Option<PositionPayload> {
    // Integer microdegree fields win over pre-scaled floats when both exist.
    let latitude = field(payload, &["latitudeI", "latitude_i"])
        .and_then(|v| v.as_i64())
        .map(|v| v as f64 * 1e-7)
        .or_else(|| field(payload, &["latitude", "lat"]).and_then(|v| v.as_f64()))?;
    let longitude = field(payload, &["longitudeI", "longitude_i"])
        .and_then(|v| v.as_i64())
        .map(|v| v as f64 * 1e-7)
        .or_else(|| field(payload, &["longitude", "lon"]).and_then(|v| v.as_f64()))?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }

    let altitude = field(payload, &["altitude", "alt"])
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    Some(PositionPayload {
        latitude,
        longitude,
        altitude,
    })
}

fn parse_telemetry(payload: &Value) -> TelemetryPayload {
    TelemetryPayload {
        battery_percent: f32_field(payload, &["batteryLevel", "battery_level", "battery"]),
        voltage: f32_field(payload, &["voltage"]),
        channel_utilization: f32_field(payload, &["channelUtilization", "channel_utilization"]),
    }
}

fn parse_node_info(payload: &Value) -> NodeInfoPayload {
    NodeInfoPayload {
        long_name: string_field(payload, &["longname", "longName", "long_name"]),
        short_name: string_field(payload, &["shortname", "shortName", "short_name"]),
        hardware_model: string_field(payload, &["hardware", "hwModel", "hw_model"]),
    }
}

/// Normalize one raw decoded transport message into a [`Packet`].
///
/// `topic` is the transport topic the message arrived on; when the message
/// body carries no gateway id, a trailing `!hex` topic segment is used as a
/// fallback (the uplinking radio publishes under its own id).
pub fn normalize(topic: &str, raw: &Value) -> Result<Packet, PacketError> {
    let source = field(raw, &["from", "fromId", "from_id"])
        .and_then(canonical_node_id)
        .ok_or(PacketError::MissingSource)?;

    let rx_time = field(raw, &["timestamp", "rxTime", "rx_time", "time"])
        .and_then(parse_timestamp)
        .ok_or(PacketError::MissingTimestamp)?;

    let kind = field(raw, &["type"])
        .and_then(parse_kind)
        .ok_or(PacketError::MissingKind)?;

    let gateway = field(raw, &["gatewayId", "gateway_id", "sender"])
        .and_then(canonical_node_id)
        .or_else(|| gateway_from_topic(topic));

    let payload_obj = field(raw, &["payload", "decoded"]);
    let payload = match (kind, payload_obj) {
        (PacketKind::Position, Some(p)) => parse_position(p).map(PacketPayload::Position),
        (PacketKind::Telemetry, Some(p)) => Some(PacketPayload::Telemetry(parse_telemetry(p))),
        (PacketKind::NodeInfo, Some(p)) => Some(PacketPayload::NodeInfo(parse_node_info(p))),
        _ => None,
    };

    Ok(Packet {
        source,
        rx_time,
        kind,
        hop_limit: u32_field(raw, &["hopLimit", "hop_limit"]).unwrap_or(0),
        hop_start: u32_field(raw, &["hopStart", "hop_start"]),
        rssi: f32_field(raw, &["rxRssi", "rx_rssi", "rssi"]),
        snr: f32_field(raw, &["rxSnr", "rx_snr", "snr"]),
        gateway,
        payload,
    })
}

fn gateway_from_topic(topic: &str) -> Option<String> {
    let tail = topic.rsplit('/').next()?;
    if tail.starts_with('!') {
        canonical_node_id(&Value::String(tail.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position_raw() -> Value {
        json!({
            "from": 0xa1b2c3d4u64,
            "timestamp": 1_700_000_000.25,
            "type": "position",
            "hop_limit": 3,
            "hop_start": 3,
            "rssi": -92,
            "snr": 6.25,
            "sender": "!FEEDF00D",
            "payload": {"latitude_i": 455231000, "longitude_i": -1226765000, "altitude": 48}
        })
    }

    #[test]
    fn normalizes_snake_case_position() {
        let packet = normalize("msh/US/2/json/LongFast/!feedf00d", &position_raw()).unwrap();
        assert_eq!(packet.source, "!a1b2c3d4");
        assert_eq!(packet.kind, PacketKind::Position);
        assert_eq!(packet.hop_limit, 3);
        assert_eq!(packet.hop_start, Some(3));
        assert_eq!(packet.gateway.as_deref(), Some("!feedf00d"));
        match packet.payload {
            Some(PacketPayload::Position(ref pos)) => {
                assert!((pos.latitude - 45.5231).abs() < 1e-6);
                assert!((pos.longitude + 122.6765).abs() < 1e-6);
                assert_eq!(pos.altitude, Some(48));
            }
            ref other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn camel_and_snake_spellings_normalize_identically() {
        let camel = json!({
            "from": 1001,
            "rxTime": 1_700_000_000,
            "type": "telemetry",
            "hopLimit": 5,
            "hopStart": 7,
            "rxRssi": -101,
            "rxSnr": -3.5,
            "gatewayId": "!00000001",
            "payload": {"batteryLevel": 87.0, "channelUtilization": 12.5}
        });
        let snake = json!({
            "from": 1001,
            "rx_time": 1_700_000_000,
            "type": "telemetry",
            "hop_limit": 5,
            "hop_start": 7,
            "rx_rssi": -101,
            "rx_snr": -3.5,
            "gateway_id": "!00000001",
            "payload": {"battery_level": 87.0, "channel_utilization": 12.5}
        });
        let a = normalize("t", &camel).unwrap();
        let b = normalize("t", &snake).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hop_start, Some(7));
        assert_eq!(a.rssi, Some(-101.0));
        match a.payload {
            Some(PacketPayload::Telemetry(ref t)) => {
                assert_eq!(t.battery_percent, Some(87.0));
                assert_eq!(t.channel_utilization, Some(12.5));
                assert_eq!(t.voltage, None);
            }
            ref other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn missing_mandatory_fields_are_malformed() {
        let no_source = json!({"timestamp": 1_700_000_000, "type": "position"});
        assert!(matches!(
            normalize("t", &no_source),
            Err(PacketError::MissingSource)
        ));

        let no_time = json!({"from": 1, "type": "position"});
        assert!(matches!(
            normalize("t", &no_time),
            Err(PacketError::MissingTimestamp)
        ));

        let bad_kind = json!({"from": 1, "timestamp": 1_700_000_000, "type": 7});
        assert!(matches!(
            normalize("t", &bad_kind),
            Err(PacketError::MissingKind)
        ));
    }

    #[test]
    fn unknown_kind_is_preserved_as_other() {
        let raw = json!({"from": 1, "timestamp": 1_700_000_000, "type": "neighborinfo"});
        let packet = normalize("t", &raw).unwrap();
        assert_eq!(packet.kind, PacketKind::Other);
        assert!(packet.payload.is_none());
    }

    #[test]
    fn node_id_forms_canonicalize() {
        assert_eq!(
            canonical_node_id(&json!(0xdeadbeefu64)).unwrap(),
            "!deadbeef"
        );
        assert_eq!(canonical_node_id(&json!("!DEADBEEF")).unwrap(), "!deadbeef");
        assert_eq!(
            canonical_node_id(&json!("3735928559")).unwrap(),
            "!deadbeef"
        );
        assert_eq!(canonical_node_id(&json!("")), None);
        assert_eq!(canonical_node_id(&json!(true)), None);
    }

    #[test]
    fn timestamp_accepts_rfc3339() {
        let raw = json!({
            "from": 1,
            "timestamp": "2023-11-14T22:13:20Z",
            "type": "nodeinfo",
            "payload": {"longname": "Base Camp", "shortname": "BC"}
        });
        let packet = normalize("t", &raw).unwrap();
        assert_eq!(packet.rx_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn gateway_falls_back_to_topic_tail() {
        let raw = json!({"from": 9, "timestamp": 1_700_000_000, "type": "position"});
        let packet = normalize("msh/US/2/json/LongFast/!C0FFEE42", &raw).unwrap();
        assert_eq!(packet.gateway.as_deref(), Some("!c0ffee42"));

        let packet = normalize("msh/US/2/json/LongFast", &raw).unwrap();
        assert_eq!(packet.gateway, None);
    }

    #[test]
    fn duplicate_float_timestamps_compare_equal() {
        let a = normalize("t", &position_raw()).unwrap();
        let b = normalize("t", &position_raw()).unwrap();
        assert_eq!(a.rx_time, b.rx_time);
    }

    #[test]
    fn out_of_range_coordinates_drop_the_fix() {
        let raw = json!({
            "from": 9,
            "timestamp": 1_700_000_000,
            "type": "position",
            "payload": {"latitude": 91.2, "longitude": 10.0}
        });
        let packet = normalize("t", &raw).unwrap();
        assert_eq!(packet.kind, PacketKind::Position);
        assert!(packet.payload.is_none());
    }

    #[test]
    fn packet_serde_round_trip() {
        let packet = normalize("t", &position_raw()).unwrap();
        let text = serde_json::to_string(&packet).unwrap();
        let back: Packet = serde_json::from_str(&text).unwrap();
        assert_eq!(packet, back);
    }
}
