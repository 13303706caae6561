//! Runtime metrics and the observability payload served over the control API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Map, Value};

use opencane_protocol::envelope::now_ms;

/// Counters the dispatcher and pipelines feed. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    events_total: AtomicU64,
    commands_total: AtomicU64,
    duplicates_total: AtomicU64,
    voice_turn_total: AtomicU64,
    voice_turn_failed: AtomicU64,
    voice_latency_ms_total: AtomicU64,
    stt_latency_ms_total: AtomicU64,
    events_by_type: Mutex<HashMap<String, u64>>,
    commands_by_type: Mutex<HashMap<String, u64>>,
}

impl RuntimeMetrics {
    pub fn record_event(&self, event_type: &str) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        *self
            .events_by_type
            .lock()
            .unwrap()
            .entry(event_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_command(&self, command_type: &str) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        *self
            .commands_by_type
            .lock()
            .unwrap()
            .entry(command_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_voice_turn(&self, success: bool, total_latency_ms: u64, stt_latency_ms: u64) {
        self.voice_turn_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.voice_turn_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.voice_latency_ms_total
            .fetch_add(total_latency_ms, Ordering::Relaxed);
        self.stt_latency_ms_total
            .fetch_add(stt_latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let turns = self.voice_turn_total.load(Ordering::Relaxed);
        out.insert("events_total".into(), json!(self.events_total.load(Ordering::Relaxed)));
        out.insert(
            "commands_total".into(),
            json!(self.commands_total.load(Ordering::Relaxed)),
        );
        out.insert(
            "duplicates_total".into(),
            json!(self.duplicates_total.load(Ordering::Relaxed)),
        );
        out.insert("voice_turn_total".into(), json!(turns));
        out.insert(
            "voice_turn_failed".into(),
            json!(self.voice_turn_failed.load(Ordering::Relaxed)),
        );
        out.insert(
            "voice_latency_ms_avg".into(),
            json!(if turns > 0 {
                self.voice_latency_ms_total.load(Ordering::Relaxed) as f64 / turns as f64
            } else {
                0.0
            }),
        );
        out.insert(
            "stt_latency_ms_avg".into(),
            json!(if turns > 0 {
                self.stt_latency_ms_total.load(Ordering::Relaxed) as f64 / turns as f64
            } else {
                0.0
            }),
        );
        out.insert(
            "events_by_type".into(),
            json!(self.events_by_type.lock().unwrap().clone()),
        );
        out.insert(
            "commands_by_type".into(),
            json!(self.commands_by_type.lock().unwrap().clone()),
        );
        out
    }
}

/// Alert thresholds applied to the live rates.
#[derive(Debug, Clone)]
pub struct ObservabilityThresholds {
    pub task_failure_rate_max: f64,
    pub safety_downgrade_rate_max: f64,
    pub device_offline_rate_max: f64,
    pub ingest_queue_utilization_max: f64,
    pub min_task_total_for_alert: u64,
    pub min_safety_applied_for_alert: u64,
}

impl Default for ObservabilityThresholds {
    fn default() -> Self {
        Self {
            task_failure_rate_max: 0.5,
            safety_downgrade_rate_max: 0.5,
            device_offline_rate_max: 0.9,
            ingest_queue_utilization_max: 0.9,
            min_task_total_for_alert: 10,
            min_safety_applied_for_alert: 10,
        }
    }
}

fn get_u64(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn get_f64(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Derive rates + alerts from one runtime status snapshot.
pub fn observability_payload(
    runtime_status: &Value,
    thresholds: &ObservabilityThresholds,
) -> Value {
    let digital = runtime_status.get("digital_task").cloned().unwrap_or(Value::Null);
    let task_total = get_u64(&digital, "total");
    let task_failures = get_u64(&digital, "failed")
        + get_u64(&digital, "timeout")
        + get_u64(&digital, "canceled");
    let task_failure_rate = if task_total > 0 {
        task_failures as f64 / task_total as f64
    } else {
        0.0
    };

    let safety = runtime_status.get("safety").cloned().unwrap_or(Value::Null);
    let safety_applied = get_u64(&safety, "applied");
    let safety_downgraded = get_u64(&safety, "downgraded");
    let safety_downgrade_rate = if safety_applied > 0 {
        safety_downgraded as f64 / safety_applied as f64
    } else {
        0.0
    };

    let devices = runtime_status
        .get("devices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let devices_total = devices.len() as u64;
    let devices_offline = devices
        .iter()
        .filter(|d| {
            matches!(
                d.get("state").and_then(Value::as_str),
                Some("closing") | Some("offline")
            )
        })
        .count() as u64;
    let device_offline_rate = if devices_total > 0 {
        devices_offline as f64 / devices_total as f64
    } else {
        0.0
    };

    let ingest = runtime_status.get("ingest_queue").cloned().unwrap_or(Value::Null);
    let ingest_utilization = get_f64(&ingest, "utilization");

    let mut alerts: Vec<Value> = Vec::new();
    if task_total >= thresholds.min_task_total_for_alert
        && task_failure_rate > thresholds.task_failure_rate_max
    {
        alerts.push(json!({
            "kind": "task_failure_rate",
            "value": task_failure_rate,
            "threshold": thresholds.task_failure_rate_max,
        }));
    }
    if safety_applied >= thresholds.min_safety_applied_for_alert
        && safety_downgrade_rate > thresholds.safety_downgrade_rate_max
    {
        alerts.push(json!({
            "kind": "safety_downgrade_rate",
            "value": safety_downgrade_rate,
            "threshold": thresholds.safety_downgrade_rate_max,
        }));
    }
    if devices_total > 0 && device_offline_rate > thresholds.device_offline_rate_max {
        alerts.push(json!({
            "kind": "device_offline_rate",
            "value": device_offline_rate,
            "threshold": thresholds.device_offline_rate_max,
        }));
    }
    if ingest_utilization > thresholds.ingest_queue_utilization_max {
        alerts.push(json!({
            "kind": "ingest_queue_utilization",
            "value": ingest_utilization,
            "threshold": thresholds.ingest_queue_utilization_max,
        }));
    }

    json!({
        "ts": now_ms(),
        "healthy": alerts.is_empty(),
        "alerts": alerts,
        "rates": {
            "task_failure_rate": task_failure_rate,
            "safety_downgrade_rate": safety_downgrade_rate,
            "device_offline_rate": device_offline_rate,
            "ingest_queue_utilization": ingest_utilization,
        },
        "totals": {
            "tasks": task_total,
            "task_failures": task_failures,
            "safety_applied": safety_applied,
            "safety_downgraded": safety_downgraded,
            "devices": devices_total,
            "devices_offline": devices_offline,
        },
    })
}

/// Bucket persisted samples into fixed windows for the trend endpoint.
pub fn bucket_history(samples: &[(u64, Value)], bucket_ms: u64) -> Vec<Value> {
    if samples.is_empty() {
        return vec![];
    }
    let bucket_ms = bucket_ms.max(1_000);
    let mut buckets: Vec<(u64, Vec<&Value>)> = Vec::new();
    for (ts, payload) in samples {
        let slot = ts / bucket_ms * bucket_ms;
        match buckets.last_mut() {
            Some((last_slot, entries)) if *last_slot == slot => entries.push(payload),
            _ => buckets.push((slot, vec![payload])),
        }
    }
    buckets
        .into_iter()
        .map(|(slot, entries)| {
            let count = entries.len() as f64;
            let healthy = entries
                .iter()
                .filter(|e| e.get("healthy").and_then(Value::as_bool).unwrap_or(false))
                .count() as f64;
            let avg = |key: &str| {
                entries
                    .iter()
                    .map(|e| get_f64(e.get("rates").unwrap_or(&Value::Null), key))
                    .sum::<f64>()
                    / count
            };
            json!({
                "ts": slot,
                "samples": entries.len(),
                "healthy_ratio": healthy / count,
                "task_failure_rate": avg("task_failure_rate"),
                "safety_downgrade_rate": avg("safety_downgrade_rate"),
                "ingest_queue_utilization": avg("ingest_queue_utilization"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_counts() {
        let metrics = RuntimeMetrics::default();
        metrics.record_event("hello");
        metrics.record_event("audio_chunk");
        metrics.record_event("audio_chunk");
        metrics.record_command("ack");
        metrics.record_duplicate();
        metrics.record_voice_turn(true, 800, 150);
        metrics.record_voice_turn(false, 400, 100);

        let snap = metrics.snapshot();
        assert_eq!(snap["events_total"], json!(3));
        assert_eq!(snap["duplicates_total"], json!(1));
        assert_eq!(snap["voice_turn_failed"], json!(1));
        assert_eq!(snap["events_by_type"]["audio_chunk"], json!(2));
        assert_eq!(snap["voice_latency_ms_avg"], json!(600.0));
    }

    #[test]
    fn alerts_fire_above_thresholds() {
        let status = json!({
            "digital_task": {"total": 20, "failed": 15, "timeout": 0, "canceled": 0},
            "safety": {"applied": 5, "downgraded": 5},
            "devices": [{"state": "ready"}],
            "ingest_queue": {"utilization": 0.95},
        });
        let payload = observability_payload(&status, &ObservabilityThresholds::default());
        assert_eq!(payload["healthy"], json!(false));
        let kinds: Vec<&str> = payload["alerts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["kind"].as_str().unwrap())
            .collect();
        // Safety is below its minimum sample size; the other two fire.
        assert!(kinds.contains(&"task_failure_rate"));
        assert!(kinds.contains(&"ingest_queue_utilization"));
        assert!(!kinds.contains(&"safety_downgrade_rate"));
    }

    #[test]
    fn quiet_runtime_is_healthy() {
        let payload = observability_payload(&json!({}), &ObservabilityThresholds::default());
        assert_eq!(payload["healthy"], json!(true));
        assert!(payload["alerts"].as_array().unwrap().is_empty());
    }

    #[test]
    fn history_buckets_average_rates() {
        let sample = |ts: u64, rate: f64, healthy: bool| {
            (
                ts,
                json!({"healthy": healthy, "rates": {"task_failure_rate": rate,
                       "safety_downgrade_rate": 0.0, "ingest_queue_utilization": 0.0}}),
            )
        };
        let samples = vec![
            sample(1_000, 0.2, true),
            sample(2_000, 0.4, false),
            sample(61_000, 0.6, true),
        ];
        let buckets = bucket_history(&samples, 60_000);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["samples"], json!(2));
        assert!((buckets[0]["task_failure_rate"].as_f64().unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(buckets[1]["healthy_ratio"], json!(1.0));
    }
}
