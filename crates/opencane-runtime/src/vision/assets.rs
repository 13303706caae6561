//! File-based image asset store with size-bounded retention.
//!
//! Layout: `{root}/{session}/{yyyymmdd}/{ts}-{hash}.{ext}`, addressed as
//! `asset://` URIs. Only metadata goes to SQLite; bytes live here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

pub const URI_PREFIX: &str = "asset://";

fn safe_segment(value: &str, fallback: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches(['-', '_']).to_string();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "bin",
    }
}

/// Days since epoch rendered as `yyyymmdd` (UTC, civil-from-days).
fn day_stamp(ts_ms: u64) -> String {
    let days = (ts_ms / 86_400_000) as i64;
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}{month:02}{day:02}")
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u32, d as u32)
}

pub struct ImageAssetStore {
    root: PathBuf,
    max_files: usize,
    cleanup_interval: usize,
    writes_since_cleanup: std::sync::atomic::AtomicUsize,
}

impl ImageAssetStore {
    pub fn new(root: impl Into<PathBuf>, max_files: usize, cleanup_interval: usize) -> Self {
        Self {
            root: root.into(),
            max_files: max_files.max(1),
            cleanup_interval: cleanup_interval.max(1),
            writes_since_cleanup: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Write the bytes (idempotent per hash) and return the asset URI.
    pub fn persist(
        &self,
        session_id: &str,
        bytes: &[u8],
        mime: &str,
        hash: &str,
        ts_ms: u64,
    ) -> anyhow::Result<String> {
        let session = safe_segment(session_id, "unknown-session");
        let file_name = format!(
            "{ts_ms}-{}.{}",
            safe_segment(hash, "hash").chars().take(24).collect::<String>(),
            ext_for_mime(mime)
        );
        let rel = Path::new(&session).join(day_stamp(ts_ms)).join(&file_name);
        let full = self.root.join(&rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create asset dir {}", parent.display()))?;
        }
        if !full.exists() {
            let tmp = full.with_extension("tmp");
            std::fs::write(&tmp, bytes)
                .with_context(|| format!("failed to write asset {}", tmp.display()))?;
            std::fs::rename(&tmp, &full)?;
        }

        use std::sync::atomic::Ordering;
        let writes = self.writes_since_cleanup.fetch_add(1, Ordering::Relaxed) + 1;
        if writes >= self.cleanup_interval {
            self.writes_since_cleanup.store(0, Ordering::Relaxed);
            self.cleanup();
        }
        Ok(format!("{URI_PREFIX}{}", rel.to_string_lossy().replace('\\', "/")))
    }

    pub fn resolve_uri(&self, uri: &str) -> Option<PathBuf> {
        let rel = uri.strip_prefix(URI_PREFIX)?;
        Some(self.root.join(rel))
    }

    /// Delete oldest files past the retention cap.
    pub fn cleanup(&self) -> usize {
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        collect_files(&self.root, &mut files);
        if files.len() <= self.max_files {
            return 0;
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        let overflow = files.len() - self.max_files;
        let mut deleted = 0;
        for (_, path) in files.into_iter().take(overflow) {
            if std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
        debug!(deleted, "asset retention cleanup");
        deleted
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(std::time::SystemTime, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            out.push((mtime, path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_is_idempotent_and_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageAssetStore::new(dir.path(), 100, 100);
        let uri = store
            .persist("s1", b"img-bytes", "image/jpeg", "cafe01", 1_700_000_000_000)
            .unwrap();
        assert!(uri.starts_with(URI_PREFIX));
        assert!(uri.contains("s1/"));
        assert!(uri.ends_with(".jpg"));

        let path = store.resolve_uri(&uri).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"img-bytes");

        // Same hash + ts writes once.
        let uri2 = store
            .persist("s1", b"img-bytes", "image/jpeg", "cafe01", 1_700_000_000_000)
            .unwrap();
        assert_eq!(uri, uri2);
    }

    #[test]
    fn day_stamp_is_utc_calendar() {
        // 2023-11-14T22:13:20Z
        assert_eq!(day_stamp(1_700_000_000_000), "20231114");
        assert_eq!(day_stamp(0), "19700101");
    }

    #[test]
    fn unsafe_segments_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageAssetStore::new(dir.path(), 100, 100);
        let uri = store
            .persist("../../etc", b"x", "image/png", "h#1", 1_000)
            .unwrap();
        assert!(!uri.contains(".."));
    }

    #[test]
    fn retention_deletes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageAssetStore::new(dir.path(), 2, 1);
        for i in 0..4u64 {
            store
                .persist("s1", &[i as u8], "image/png", &format!("h{i}"), 1_000 + i)
                .unwrap();
        }
        let mut files = Vec::new();
        collect_files(dir.path(), &mut files);
        assert!(files.len() <= 3);
    }
}
