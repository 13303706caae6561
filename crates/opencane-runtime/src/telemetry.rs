//! Telemetry normalization.
//!
//! Devices report telemetry under whatever key names their firmware grew up
//! with. This flattens the common aliases into one stable schema so storage
//! and the dialogue context see consistent shapes.

use serde_json::{json, Map, Value};

use opencane_protocol::envelope::now_ms;

pub const TELEMETRY_SCHEMA_VERSION: &str = "opencane.telemetry.v1";

/// Normalize a raw telemetry payload. Returns an empty map when nothing
/// recognizable was extracted.
pub fn normalize_telemetry_payload(payload: &Map<String, Value>, ts_ms: u64) -> Map<String, Value> {
    let mut output = Map::new();
    output.insert("schema_version".into(), json!(TELEMETRY_SCHEMA_VERSION));
    output.insert(
        "ts_ms".into(),
        json!(if ts_ms > 0 { ts_ms } else { now_ms() }),
    );

    let blocks: [(&str, Map<String, Value>); 5] = [
        ("battery", extract_battery(payload)),
        ("network", extract_network(payload)),
        ("location", extract_location(payload)),
        ("motion", extract_motion(payload)),
        ("system", extract_system(payload)),
    ];
    for (name, block) in blocks {
        if !block.is_empty() {
            output.insert(name.into(), Value::Object(block));
        }
    }

    if output.len() <= 2 {
        return Map::new();
    }
    output
}

fn extract_battery(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(percent) = first_f64(data, &["battery_percent", "battery", "bat", "soc"]) {
        out.insert("percent".into(), json!(percent.clamp(0.0, 100.0)));
    }
    if let Some(mv) = first_i64(data, &["battery_voltage_mv", "vbat_mv"]) {
        if mv > 0 {
            out.insert("voltage_mv".into(), json!(mv));
        }
    }
    if let Some(charging) = first_bool(data, &["charging", "is_charging", "charge"]) {
        out.insert("charging".into(), json!(charging));
    }
    out
}

fn extract_network(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(rssi) = first_f64(data, &["rssi", "rssi_dbm"]) {
        out.insert("rssi_dbm".into(), json!(rssi));
    }
    if let Some(rsrp) = first_f64(data, &["rsrp", "rsrp_dbm"]) {
        out.insert("rsrp_dbm".into(), json!(rsrp));
    }
    if let Some(snr) = first_f64(data, &["snr", "snr_db"]) {
        out.insert("snr_db".into(), json!(snr));
    }
    if let Some(level) = first_i64(data, &["signal_level"]) {
        out.insert("signal_level".into(), json!(level));
    }
    if let Some(kind) = first_str(data, &["network_type", "net_type", "rat"]) {
        out.insert("network_type".into(), json!(kind));
    }
    out
}

fn extract_location(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let lat = first_f64(data, &["lat", "latitude"]);
    let lon = first_f64(data, &["lon", "lng", "longitude"]);
    if let (Some(lat), Some(lon)) = (lat, lon) {
        out.insert("lat".into(), json!(lat));
        out.insert("lon".into(), json!(lon));
    }
    if let Some(acc) = first_f64(data, &["accuracy_m", "gps_accuracy", "location_accuracy"]) {
        if acc >= 0.0 {
            out.insert("accuracy_m".into(), json!(acc));
        }
    }
    out
}

fn extract_motion(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(heading) = first_f64(data, &["heading_deg", "heading", "yaw"]) {
        out.insert("heading_deg".into(), json!(heading.rem_euclid(360.0)));
    }
    if let Some(speed) = first_f64(data, &["speed_mps", "speed"]) {
        if speed >= 0.0 {
            out.insert("speed_mps".into(), json!(speed));
        }
    }
    if let Some(moving) = first_bool(data, &["moving", "is_moving"]) {
        out.insert("moving".into(), json!(moving));
    }
    if let Some(steps) = first_i64(data, &["step_count", "steps"]) {
        if steps >= 0 {
            out.insert("step_count".into(), json!(steps));
        }
    }
    out
}

fn extract_system(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(temp) = first_f64(data, &["temperature_c", "temp_c", "cpu_temp"]) {
        out.insert("temperature_c".into(), json!(temp));
    }
    if let Some(cpu) = first_f64(data, &["cpu_percent", "cpu_usage"]) {
        out.insert("cpu_percent".into(), json!(cpu.clamp(0.0, 100.0)));
    }
    if let Some(mem) = first_f64(data, &["memory_percent", "mem_percent", "memory_usage"]) {
        out.insert("memory_percent".into(), json!(mem.clamp(0.0, 100.0)));
    }
    out
}

fn first_f64(data: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| to_f64(data.get(*k)?))
}

fn first_i64(data: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = data.get(*k)?;
        v.as_i64().or_else(|| v.as_str()?.trim().parse().ok())
    })
}

fn first_bool(data: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| to_bool(data.get(*k)?))
}

fn first_str(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        let text = data.get(*k)?.as_str()?.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

fn to_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str()?.trim().parse().ok())
        .filter(|n| n.is_finite())
}

fn to_bool(value: &Value) -> Option<bool> {
    if let Some(b) = value.as_bool() {
        return Some(b);
    }
    match value.as_str()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn normalizes_common_aliases() {
        let raw = map(json!({
            "bat": 87.5,
            "rssi": -71,
            "lat": 31.2304,
            "lng": 121.4737,
            "heading": 450.0,
            "cpu_usage": "42.5",
        }));
        let out = normalize_telemetry_payload(&raw, 1_000);
        assert_eq!(out["schema_version"], json!(TELEMETRY_SCHEMA_VERSION));
        assert_eq!(out["battery"]["percent"], json!(87.5));
        assert_eq!(out["network"]["rssi_dbm"], json!(-71.0));
        assert_eq!(out["location"]["lat"], json!(31.2304));
        assert_eq!(out["motion"]["heading_deg"], json!(90.0));
        assert_eq!(out["system"]["cpu_percent"], json!(42.5));
    }

    #[test]
    fn unrecognized_payload_yields_empty() {
        let raw = map(json!({"firmware_blob": "xyz"}));
        assert!(normalize_telemetry_payload(&raw, 0).is_empty());
    }

    #[test]
    fn battery_percent_is_clamped() {
        let raw = map(json!({"battery_percent": 130}));
        let out = normalize_telemetry_payload(&raw, 1);
        assert_eq!(out["battery"]["percent"], json!(100.0));
    }

    #[test]
    fn string_booleans_parse() {
        let raw = map(json!({"charging": "yes", "moving": "0"}));
        let out = normalize_telemetry_payload(&raw, 1);
        assert_eq!(out["battery"]["charging"], json!(true));
        assert_eq!(out["motion"]["moving"], json!(false));
    }
}
