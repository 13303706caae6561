//! Control API security: bearer auth, per-key rate limiting, and optional
//! nonce+timestamp replay protection for write requests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use opencane_protocol::envelope::now_ms;

/// Accepts second- or millisecond-precision timestamps.
pub fn parse_timestamp_ms(value: &str) -> Option<u64> {
    let parsed: u64 = value.trim().parse().ok()?;
    if parsed == 0 {
        return None;
    }
    Some(if parsed < 10_000_000_000 { parsed * 1000 } else { parsed })
}

/// Sliding-window per-key request limiter.
pub struct RequestRateLimiter {
    limit: usize,
    window_ms: u64,
    hits: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl RequestRateLimiter {
    pub fn new(requests_per_minute: usize, burst: usize) -> Self {
        Self {
            limit: requests_per_minute.max(1) + burst,
            window_ms: 60_000,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let key = if key.trim().is_empty() { "unknown" } else { key };
        let now = now_ms();
        let cutoff = now.saturating_sub(self.window_ms);
        let mut hits = self.hits.lock().unwrap();
        let bucket = hits.entry(key.to_string()).or_default();
        while bucket.front().is_some_and(|ts| *ts < cutoff) {
            bucket.pop_front();
        }
        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push_back(now);
        // Keep the map from growing forever.
        if hits.len() > 10_000 {
            hits.retain(|_, bucket| bucket.back().is_some_and(|ts| *ts >= cutoff));
        }
        true
    }
}

/// Nonce + timestamp validator for write requests.
pub struct RequestReplayProtector {
    window_ms: u64,
    max_entries: usize,
    seen: Mutex<HashMap<String, u64>>,
}

impl RequestReplayProtector {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window_ms: window_seconds.max(10) * 1000,
            max_entries: 20_000,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn validate(&self, key: &str, nonce: &str, timestamp_ms: u64) -> Result<(), &'static str> {
        if nonce.trim().is_empty() {
            return Err("missing_nonce");
        }
        let now = now_ms();
        if now.abs_diff(timestamp_ms) > self.window_ms {
            return Err("stale_timestamp");
        }
        let replay_key = format!("{key}:{nonce}");
        let cutoff = now.saturating_sub(self.window_ms);
        let mut seen = self.seen.lock().unwrap();
        if seen.get(&replay_key).is_some_and(|ts| *ts >= cutoff) {
            return Err("replayed_nonce");
        }
        seen.insert(replay_key, now);
        if seen.len() > self.max_entries {
            seen.retain(|_, ts| *ts >= cutoff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parsing_accepts_seconds_and_millis() {
        assert_eq!(parse_timestamp_ms("1700000000"), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp_ms("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp_ms("abc"), None);
        assert_eq!(parse_timestamp_ms("0"), None);
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = RequestRateLimiter::new(2, 1);
        assert!(limiter.allow("client"));
        assert!(limiter.allow("client"));
        assert!(limiter.allow("client"));
        assert!(!limiter.allow("client"));
        // Distinct keys have distinct budgets.
        assert!(limiter.allow("other"));
    }

    #[test]
    fn replay_protector_rejects_reuse_and_stale() {
        let protector = RequestReplayProtector::new(300);
        let now = now_ms();
        assert!(protector.validate("k", "n1", now).is_ok());
        assert_eq!(protector.validate("k", "n1", now), Err("replayed_nonce"));
        // Same nonce under a different key is fine.
        assert!(protector.validate("k2", "n1", now).is_ok());
        assert_eq!(protector.validate("k", "", now), Err("missing_nonce"));
        assert_eq!(
            protector.validate("k", "n2", now.saturating_sub(10_000_000)),
            Err("stale_timestamp")
        );
    }
}
