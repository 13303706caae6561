//! Capture-side audio handling: jitter reordering, VAD gating with pre-roll,
//! text-chunk merging, and transcript finalization.
//!
//! One capture exists per session between `listen_start` and `listen_stop`.
//! Audio frames arrive out of order over the cellular link; the jitter stage
//! restores contiguous runs and only then feeds the VAD stage, so voiced
//! bookkeeping never sees reordered input.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::providers::TranscriptionProvider;
use crate::session::SessionKey;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Jitter reorder window, in packets.
    pub jitter_window: usize,
    /// Pre-roll retained before the first voiced frame.
    pub prebuffer_ms: u64,
    /// Trailing silence that closes a speech chunk.
    pub hangover_ms: u64,
    /// Nominal duration of one device frame; converts the ms knobs to frames.
    pub frame_ms: u64,
    /// Per-capture byte budget. Overflow drops the oldest accepted frames.
    pub max_capture_bytes: usize,
    /// Minimum character growth before a new partial is worth emitting.
    pub partial_min_growth: usize,
    /// Timeout for one transcription call.
    pub transcribe_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            jitter_window: 32,
            prebuffer_ms: 200,
            hangover_ms: 360,
            frame_ms: 60,
            max_capture_bytes: 8 * 1024 * 1024,
            partial_min_growth: 3,
            transcribe_timeout_ms: 15_000,
        }
    }
}

impl AudioConfig {
    fn prebuffer_frames(&self) -> usize {
        (self.prebuffer_ms.div_ceil(self.frame_ms.max(1))) as usize
    }

    fn hangover_frames(&self) -> usize {
        (self.hangover_ms.div_ceil(self.frame_ms.max(1))).max(1) as usize
    }
}

#[derive(Debug, Clone)]
struct Packet {
    seq: u32,
    ts: u64,
    bytes: Vec<u8>,
    voiced: Option<bool>,
}

#[derive(Debug, Default)]
struct Capture {
    started: bool,
    // Jitter stage.
    pending: BTreeMap<u32, Packet>,
    next_expected: Option<u32>,
    // VAD stage.
    vad_active: bool,
    silence_run: usize,
    speech_frames: usize,
    prebuffer: VecDeque<Packet>,
    // Accepted, ordered output.
    accepted: VecDeque<Packet>,
    total_bytes: usize,
    // Counters.
    late_dropped: u64,
    overflow_dropped: u64,
    // Transcript text pieces keyed by arrival order.
    text_chunks: BTreeMap<i64, String>,
    seq_start: Option<u32>,
    seq_end: u32,
}

/// Result of closing one capture.
#[derive(Debug, Clone, Default)]
pub struct FinalizedSegment {
    pub transcript: String,
    pub vad_accepted: bool,
    /// Set when the transcription provider failed; the caller records a
    /// `voice_turn_failure` telemetry event and keeps the session usable.
    pub transcription_failed: bool,
    pub seq_start: u32,
    pub seq_end: u32,
    pub accepted_frames: usize,
    pub late_dropped: u64,
    pub overflow_dropped: u64,
}

pub struct AudioPipeline {
    config: AudioConfig,
    captures: Mutex<HashMap<SessionKey, Capture>>,
    transcriber: Option<Arc<dyn TranscriptionProvider>>,
}

impl AudioPipeline {
    pub fn new(config: AudioConfig, transcriber: Option<Arc<dyn TranscriptionProvider>>) -> Self {
        Self {
            config,
            captures: Mutex::new(HashMap::new()),
            transcriber,
        }
    }

    /// Open (or reset) the capture for one session.
    pub fn start_capture(&self, key: &SessionKey) {
        let mut captures = self.captures.lock().unwrap();
        let capture = captures.entry(key.clone()).or_default();
        *capture = Capture {
            started: true,
            ..Capture::default()
        };
    }

    pub fn reset_capture(&self, key: &SessionKey) {
        self.captures.lock().unwrap().remove(key);
    }

    /// Ingest one `audio_chunk` payload. Returns the current composed partial
    /// transcript when it changed enough to be worth emitting.
    pub fn append_chunk(
        &self,
        key: &SessionKey,
        event_seq: i64,
        payload: &Map<String, Value>,
    ) -> Option<String> {
        let mut captures = self.captures.lock().unwrap();
        let capture = captures.entry(key.clone()).or_default();
        capture.started = true;

        let order = resolve_order(payload, event_seq);
        let before_len = compose_text(&capture.text_chunks).len();

        if let Some(piece) = payload
            .get("text")
            .or_else(|| payload.get("transcript"))
            .and_then(Value::as_str)
        {
            let piece = piece.trim();
            if !piece.is_empty() {
                capture.text_chunks.insert(order, piece.to_string());
            }
        }

        if let Some(b64) = payload
            .get("audio_b64")
            .or_else(|| payload.get("audio"))
            .and_then(Value::as_str)
        {
            match base64::engine::general_purpose::STANDARD.decode(b64) {
                Ok(bytes) if !bytes.is_empty() => {
                    let packet = Packet {
                        seq: order.max(0) as u32,
                        ts: payload.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
                        bytes,
                        voiced: resolve_speech_flag(payload),
                    };
                    self.insert_packet(capture, packet);
                }
                Ok(_) => {}
                Err(_) => debug!("invalid base64 audio payload ignored"),
            }
        }

        let partial = compose_text(&capture.text_chunks);
        if partial.is_empty() || partial.len() < before_len + self.config.partial_min_growth {
            return None;
        }
        Some(partial)
    }

    /// Jitter insert + contiguous flush into the VAD stage.
    fn insert_packet(&self, capture: &mut Capture, packet: Packet) {
        if let Some(expected) = capture.next_expected {
            if packet.seq < expected {
                capture.late_dropped += 1;
                return;
            }
        }
        if capture.pending.contains_key(&packet.seq) {
            return;
        }
        capture.pending.insert(packet.seq, packet);
        self.flush_contiguous(capture);
    }

    fn flush_contiguous(&self, capture: &mut Capture) {
        loop {
            let expected = match capture.next_expected {
                Some(e) => e,
                None => match capture.pending.keys().next().copied() {
                    Some(first) => {
                        capture.next_expected = Some(first);
                        first
                    }
                    None => return,
                },
            };
            if let Some(packet) = capture.pending.remove(&expected) {
                capture.next_expected = Some(expected + 1);
                self.vad_accept(capture, packet);
                continue;
            }
            // Window exceeded: skip the gap and emit what remains.
            if capture.pending.len() > self.config.jitter_window {
                let next = *capture.pending.keys().next().unwrap();
                debug!(from = expected, to = next, "jitter window exceeded, skipping gap");
                capture.next_expected = Some(next);
                continue;
            }
            return;
        }
    }

    /// Frame-granular VAD with pre-roll. Frames without a hint count as
    /// voiced, matching devices that do not run local VAD.
    fn vad_accept(&self, capture: &mut Capture, packet: Packet) {
        let voiced = packet.voiced.unwrap_or(true);
        if voiced {
            capture.vad_active = true;
            capture.silence_run = 0;
            capture.speech_frames += 1;
            // The pre-roll preserves the lead-in before this first voiced frame.
            while let Some(buffered) = capture.prebuffer.pop_front() {
                self.accept(capture, buffered);
            }
            self.accept(capture, packet);
            return;
        }

        if capture.vad_active {
            capture.silence_run += 1;
            self.accept(capture, packet);
            if capture.silence_run >= self.config.hangover_frames() {
                capture.vad_active = false;
            }
            return;
        }

        // Silence before any speech: keep a bounded pre-roll.
        let limit = self.config.prebuffer_frames();
        if limit == 0 {
            return;
        }
        capture.prebuffer.push_back(packet);
        while capture.prebuffer.len() > limit {
            capture.prebuffer.pop_front();
        }
    }

    fn accept(&self, capture: &mut Capture, packet: Packet) {
        capture.seq_start.get_or_insert(packet.seq);
        capture.seq_end = capture.seq_end.max(packet.seq);
        capture.total_bytes += packet.bytes.len();
        capture.accepted.push_back(packet);
        while capture.total_bytes > self.config.max_capture_bytes {
            if let Some(dropped) = capture.accepted.pop_front() {
                capture.total_bytes -= dropped.bytes.len();
                capture.overflow_dropped += 1;
            } else {
                break;
            }
        }
    }

    /// Close the capture and produce the transcript: explicit payload text
    /// wins verbatim, then composed text chunks, then the transcription
    /// provider over the concatenated voiced audio.
    pub async fn finalize_capture(
        &self,
        key: &SessionKey,
        payload: &Map<String, Value>,
    ) -> FinalizedSegment {
        if let Some(explicit) = payload
            .get("transcript")
            .or_else(|| payload.get("text"))
            .and_then(Value::as_str)
        {
            let explicit = explicit.trim();
            if !explicit.is_empty() {
                self.reset_capture(key);
                return FinalizedSegment {
                    transcript: explicit.to_string(),
                    vad_accepted: true,
                    ..Default::default()
                };
            }
        }

        let mut capture = match self.captures.lock().unwrap().remove(key) {
            Some(c) if c.started => c,
            _ => return FinalizedSegment::default(),
        };

        // Drain whatever the jitter stage still holds, in order.
        let leftover: Vec<Packet> = std::mem::take(&mut capture.pending).into_values().collect();
        for packet in leftover {
            self.vad_accept(&mut capture, packet);
        }
        while let Some(buffered) = capture.prebuffer.pop_front() {
            // Never voiced: only useful when speech was detected at all.
            if capture.speech_frames > 0 {
                self.accept(&mut capture, buffered);
            }
        }

        let mut segment = FinalizedSegment {
            vad_accepted: capture.speech_frames > 0,
            seq_start: capture.seq_start.unwrap_or(0),
            seq_end: capture.seq_end,
            accepted_frames: capture.accepted.len(),
            late_dropped: capture.late_dropped,
            overflow_dropped: capture.overflow_dropped,
            ..Default::default()
        };

        let composed = compose_text(&capture.text_chunks);
        if !composed.is_empty() {
            segment.transcript = composed;
            return segment;
        }

        let audio: Vec<u8> = capture
            .accepted
            .iter()
            .flat_map(|p| p.bytes.iter().copied())
            .collect();
        if audio.is_empty() {
            return segment;
        }
        let Some(transcriber) = &self.transcriber else {
            return segment;
        };

        let timeout = Duration::from_millis(self.config.transcribe_timeout_ms);
        match tokio::time::timeout(timeout, transcriber.transcribe(&audio, "audio/opus")).await {
            Ok(Ok((text, _confidence))) => {
                segment.transcript = text.trim().to_string();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "audio transcription failed");
                segment.transcription_failed = true;
            }
            Err(_) => {
                warn!(timeout_ms = self.config.transcribe_timeout_ms, "audio transcription timed out");
                segment.transcription_failed = true;
            }
        }
        segment
    }

}

fn resolve_order(payload: &Map<String, Value>, event_seq: i64) -> i64 {
    for field in ["chunk_index", "frame_index", "index", "order"] {
        if let Some(value) = payload.get(field).and_then(Value::as_i64) {
            if value >= 0 {
                return value;
            }
        }
    }
    event_seq.max(0)
}

fn resolve_speech_flag(payload: &Map<String, Value>) -> Option<bool> {
    for field in ["is_speech", "speech", "vad", "voice"] {
        if let Some(value) = payload.get(field) {
            if let Some(b) = value.as_bool() {
                return Some(b);
            }
            if let Some(n) = value.as_i64() {
                return Some(n != 0);
            }
        }
    }
    // A text piece implies the device heard speech.
    if payload
        .get("text")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.trim().is_empty())
    {
        return Some(true);
    }
    None
}

fn compose_text(chunks: &BTreeMap<i64, String>) -> String {
    chunks
        .values()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn key() -> SessionKey {
        ("dev-1".into(), "s1".into())
    }

    fn audio_payload(seq: i64, bytes: &[u8], voiced: Option<bool>) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(
            "audio_b64".into(),
            json!(base64::engine::general_purpose::STANDARD.encode(bytes)),
        );
        if let Some(v) = voiced {
            payload.insert("is_speech".into(), json!(v));
        }
        payload.insert("index".into(), json!(seq));
        payload
    }

    struct FixedTranscriber(String);

    #[async_trait]
    impl TranscriptionProvider for FixedTranscriber {
        async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<(String, f64), RuntimeError> {
            Ok((self.0.clone(), 0.92))
        }
    }

    struct FailingTranscriber;

    #[async_trait]
    impl TranscriptionProvider for FailingTranscriber {
        async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<(String, f64), RuntimeError> {
            Err(RuntimeError::Provider("stt backend unavailable".into()))
        }
    }

    fn pipeline(transcriber: Option<Arc<dyn TranscriptionProvider>>) -> AudioPipeline {
        AudioPipeline::new(AudioConfig::default(), transcriber)
    }

    #[tokio::test]
    async fn explicit_transcript_wins_verbatim() {
        let p = pipeline(Some(Arc::new(FixedTranscriber("ignored".into()))));
        p.start_capture(&key());
        let mut stop = Map::new();
        stop.insert("transcript".into(), json!("what is ahead"));
        let segment = p.finalize_capture(&key(), &stop).await;
        assert_eq!(segment.transcript, "what is ahead");
        assert!(!segment.transcription_failed);
    }

    #[tokio::test]
    async fn reordered_packets_within_window_come_out_ordered() {
        let p = pipeline(Some(Arc::new(FixedTranscriber("ok".into()))));
        let k = key();
        p.start_capture(&k);
        for seq in [3i64, 1, 2, 5, 4] {
            p.append_chunk(&k, seq, &audio_payload(seq, &[seq as u8], Some(true)));
        }
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert_eq!(segment.accepted_frames, 5);
        assert_eq!(segment.seq_start, 1);
        assert_eq!(segment.seq_end, 5);
        assert_eq!(segment.transcript, "ok");
    }

    #[tokio::test]
    async fn gap_beyond_window_is_skipped() {
        let mut config = AudioConfig::default();
        config.jitter_window = 4;
        let p = AudioPipeline::new(config, None);
        let k = key();
        p.start_capture(&k);
        p.append_chunk(&k, 1, &audio_payload(1, &[1], Some(true)));
        // seq 2 never arrives; push enough to overflow the window.
        for seq in 3i64..=8 {
            p.append_chunk(&k, seq, &audio_payload(seq, &[seq as u8], Some(true)));
        }
        let segment = p.finalize_capture(&k, &Map::new()).await;
        // 1 plus 3..=8: the gap at 2 was skipped, nothing stalled.
        assert_eq!(segment.accepted_frames, 7);
    }

    #[tokio::test]
    async fn late_packet_behind_frontier_is_dropped_and_counted() {
        let p = pipeline(None);
        let k = key();
        p.start_capture(&k);
        for seq in 1i64..=3 {
            p.append_chunk(&k, seq, &audio_payload(seq, &[seq as u8], Some(true)));
        }
        p.append_chunk(&k, 1, &audio_payload(1, &[9], Some(true)));
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert_eq!(segment.accepted_frames, 3);
        assert_eq!(segment.late_dropped, 1);
    }

    #[tokio::test]
    async fn prebuffer_preserves_leadin_before_first_voiced_frame() {
        let p = pipeline(None);
        let k = key();
        p.start_capture(&k);
        // Ten silent frames, then speech: only the pre-roll tail survives.
        for seq in 1i64..=10 {
            p.append_chunk(&k, seq, &audio_payload(seq, &[0], Some(false)));
        }
        p.append_chunk(&k, 11, &audio_payload(11, &[1], Some(true)));
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert!(segment.vad_accepted);
        // prebuffer = ceil(200/60) = 4 silent frames + 1 voiced.
        assert_eq!(segment.accepted_frames, 5);
    }

    #[tokio::test]
    async fn silence_only_capture_is_not_vad_accepted() {
        let p = pipeline(None);
        let k = key();
        p.start_capture(&k);
        for seq in 1i64..=6 {
            p.append_chunk(&k, seq, &audio_payload(seq, &[0], Some(false)));
        }
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert!(!segment.vad_accepted);
        assert_eq!(segment.accepted_frames, 0);
    }

    #[tokio::test]
    async fn text_chunks_merge_in_order_and_emit_partials() {
        let p = pipeline(None);
        let k = key();
        p.start_capture(&k);
        let mut first = Map::new();
        first.insert("text".into(), json!("what is"));
        first.insert("index".into(), json!(1));
        assert_eq!(p.append_chunk(&k, 1, &first).as_deref(), Some("what is"));

        let mut second = Map::new();
        second.insert("text".into(), json!("ahead"));
        second.insert("index".into(), json!(2));
        assert_eq!(p.append_chunk(&k, 2, &second).as_deref(), Some("what is ahead"));

        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert_eq!(segment.transcript, "what is ahead");
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_empty_transcript() {
        let p = pipeline(Some(Arc::new(FailingTranscriber)));
        let k = key();
        p.start_capture(&k);
        p.append_chunk(&k, 1, &audio_payload(1, &[1, 2, 3], Some(true)));
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert!(segment.transcript.is_empty());
        assert!(segment.transcription_failed);
    }

    #[tokio::test]
    async fn capture_byte_budget_drops_oldest() {
        let mut config = AudioConfig::default();
        config.max_capture_bytes = 8;
        let p = AudioPipeline::new(config, None);
        let k = key();
        p.start_capture(&k);
        for seq in 1i64..=5 {
            p.append_chunk(&k, seq, &audio_payload(seq, &[seq as u8; 4], Some(true)));
        }
        let segment = p.finalize_capture(&k, &Map::new()).await;
        assert_eq!(segment.accepted_frames, 2);
        assert_eq!(segment.overflow_dropped, 3);
    }
}
