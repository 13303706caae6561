//! The connection runtime: canonical event dispatch, the per-session state
//! machine, TTS fan-out, barge-in, offline buffering and post-reconnect
//! replay.
//!
//! Events arrive in order from the adapter stream. Handlers run inline so
//! per-session ordering holds; only turn processing (dialogue + TTS) and
//! image work leave the dispatch path, guarded by the session's turn
//! generation so barge-in and abort cancel them cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use opencane_protocol::envelope::now_ms;
use opencane_protocol::{DeviceCommandType, DeviceEventType, Envelope};

use crate::adapter::GatewayAdapter;
use crate::audio::AudioPipeline;
use crate::error::RuntimeError;
use crate::ingest::{ImageJob, IngestQueue};
use crate::observability::RuntimeMetrics;
use crate::providers::{DialogueEngine, TtsProvider};
use crate::safety::{RiskLevel, SafetyContext, SafetyGate};
use crate::session::{SeqOutcome, SessionKey, SessionManager, SessionState};
use crate::store::{lifelog, operations, Store};
use crate::task::{DigitalTaskService, TaskRequest, TaskStatusUpdate};
use crate::telemetry::normalize_telemetry_payload;
use crate::vision::VisionDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsMode {
    DeviceText,
    ServerAudio,
}

impl TtsMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "device_text" => Some(TtsMode::DeviceText),
            "server_audio" => Some(TtsMode::ServerAudio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub tts_mode: TtsMode,
    pub tts_audio_chunk_bytes: usize,
    pub tts_text_chunk_chars: usize,
    pub idle_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub dialogue_timeout_ms: u64,
    pub tts_timeout_ms: u64,
    pub partial_max_chars: usize,
    pub tool_result_enabled: bool,
    pub telemetry_normalize_enabled: bool,
    pub telemetry_persist_samples: bool,
    /// Only devices with an activated binding may open sessions.
    pub require_activated_devices: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tts_mode: TtsMode::DeviceText,
            tts_audio_chunk_bytes: 4096,
            tts_text_chunk_chars: 220,
            idle_timeout_ms: 30 * 60 * 1000,
            watchdog_interval_ms: 2_000,
            dialogue_timeout_ms: 30_000,
            tts_timeout_ms: 15_000,
            partial_max_chars: 160,
            tool_result_enabled: false,
            telemetry_normalize_enabled: false,
            telemetry_persist_samples: false,
            require_activated_devices: false,
        }
    }
}

pub struct ConnectionRuntime {
    adapter: Arc<dyn GatewayAdapter>,
    pub sessions: Arc<SessionManager>,
    audio: Arc<AudioPipeline>,
    dialogue: Arc<dyn DialogueEngine>,
    tts: Option<Arc<dyn TtsProvider>>,
    safety: SafetyGate,
    pub ingest: Arc<IngestQueue>,
    tasks: Option<Arc<DigitalTaskService>>,
    store: Arc<Store>,
    pub metrics: Arc<RuntimeMetrics>,
    config: ConnectionConfig,
    running: AtomicBool,
    digest_rx: Mutex<Option<mpsc::Receiver<VisionDigest>>>,
    stt_partial_state: Mutex<HashMap<SessionKey, (String, u64)>>,
    /// Serializes seq allocation + delivery per session so the device always
    /// observes strictly increasing outbound seqs.
    send_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn GatewayAdapter>,
        sessions: Arc<SessionManager>,
        audio: Arc<AudioPipeline>,
        dialogue: Arc<dyn DialogueEngine>,
        tts: Option<Arc<dyn TtsProvider>>,
        safety: SafetyGate,
        ingest: Arc<IngestQueue>,
        tasks: Option<Arc<DigitalTaskService>>,
        store: Arc<Store>,
        config: ConnectionConfig,
        digest_rx: mpsc::Receiver<VisionDigest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            sessions,
            audio,
            dialogue,
            tts,
            safety,
            ingest,
            tasks,
            store,
            metrics: Arc::new(RuntimeMetrics::default()),
            config,
            running: AtomicBool::new(false),
            digest_rx: Mutex::new(Some(digest_rx)),
            stt_partial_state: Mutex::new(HashMap::new()),
            send_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Start the adapter, the dispatch loop, the idle watchdog, and the
    /// vision digest consumer. Install the task push callback.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let mut events = self.adapter.start().await?;
        self.running.store(true, Ordering::SeqCst);

        if let Some(tasks) = &self.tasks {
            let runtime = self.clone();
            tasks.set_push_fn(Arc::new(move |update| {
                let runtime = runtime.clone();
                Box::pin(async move { runtime.push_task_update(update).await })
            }));
        }

        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !runtime.running.load(Ordering::SeqCst) {
                    break;
                }
                runtime.handle_event(event).await;
            }
            debug!("runtime event loop stopped");
        });

        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(runtime.config.watchdog_interval_ms));
            loop {
                ticker.tick().await;
                if !runtime.running.load(Ordering::SeqCst) {
                    break;
                }
                runtime.close_idle_sessions().await;
            }
        });

        if let Some(mut digest_rx) = self.digest_rx.lock().unwrap().take() {
            let runtime = self.clone();
            tokio::spawn(async move {
                while let Some(digest) = digest_rx.recv().await {
                    runtime.handle_vision_digest(digest).await;
                }
            });
        }

        info!(adapter = self.adapter.name(), "connection runtime started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for snapshot in self.sessions.all_snapshots() {
            if !snapshot.is_closed() {
                self.sessions.close(&snapshot.key(), "runtime_stop");
            }
        }
        self.adapter.stop().await;
        self.stt_partial_state.lock().unwrap().clear();
        info!("connection runtime stopped");
    }

    async fn close_idle_sessions(&self) {
        let deadline = now_ms().saturating_sub(self.config.idle_timeout_ms);
        for snapshot in self.sessions.all_snapshots() {
            if snapshot.is_closed() || snapshot.last_seen_ms >= deadline {
                continue;
            }
            let key = snapshot.key();
            info!(device_id = %key.0, session_id = %key.1, "closing idle session");
            self.ingest.cancel_session(&key.1);
            self.sessions.close(&key, "idle_timeout");
            self.adapter.close_session(&key.0, &key.1, "idle_timeout").await;
        }
    }

    fn trace_id_for(event: &Envelope) -> String {
        event
            .payload_str("trace_id")
            .map(str::to_string)
            .unwrap_or_else(|| event.msg_id.clone())
    }

    /// Dispatch one inbound envelope.
    pub async fn handle_event(self: &Arc<Self>, event: Envelope) {
        let Some(event_type) = event.event_type() else {
            debug!(kind = event.kind.as_str(), "ignoring non-event envelope");
            return;
        };
        let trace_id = Self::trace_id_for(&event);
        self.metrics.record_event(event.kind.as_str());
        debug!(
            event = event.kind.as_str(),
            device_id = %event.device_id,
            session_id = %event.session_id,
            seq = event.seq,
            trace_id = %trace_id,
            "device event"
        );

        let session_hint = (!event.session_id.is_empty()).then_some(event.session_id.as_str());
        let snapshot = self.sessions.get_or_create(&event.device_id, session_hint);
        let key = snapshot.key();

        if event_type == DeviceEventType::Hello && !self.ensure_authorized(&key, &trace_id).await {
            return;
        }

        let outcome = self.sessions.check_and_commit_seq(&key, event.seq);
        if outcome == SeqOutcome::Duplicate {
            self.metrics.record_duplicate();
            // Re-emit the idempotent response; never drop silently.
            match event_type {
                DeviceEventType::Hello => self.on_hello(&key, &event, &trace_id).await,
                _ => {
                    self.send_ack(&key, event.seq, &trace_id).await;
                }
            }
            debug!(seq = event.seq, "duplicate event re-acked");
            return;
        }

        match event_type {
            DeviceEventType::Hello => {
                self.on_hello(&key, &event, &trace_id).await;
                self.record_lifelog(
                    &key.1,
                    "hello",
                    json!({"trace_id": trace_id, "capabilities": event.payload.get("capabilities")}),
                    RiskLevel::P3,
                    1.0,
                );
            }
            DeviceEventType::Heartbeat => {
                self.sessions.touch(&key);
                self.send_ack(&key, event.seq, &trace_id).await;
            }
            DeviceEventType::ListenStart => {
                self.on_listen_start(&key, &event, &trace_id).await;
            }
            DeviceEventType::AudioChunk => {
                self.send_ack(&key, event.seq, &trace_id).await;
                let partial = self.audio.append_chunk(&key, event.seq, &event.payload);
                if let Some(partial) = partial {
                    self.maybe_emit_stt_partial(&key, &partial, &trace_id).await;
                }
            }
            DeviceEventType::ListenStop => {
                self.stt_partial_state.lock().unwrap().remove(&key);
                self.sessions.update_state(&key, SessionState::Thinking);
                self.send_ack(&key, event.seq, &trace_id).await;
                let runtime = self.clone();
                let payload = event.payload.clone();
                let turn = self.sessions.turn_generation(&key);
                let key = key.clone();
                let trace_id = trace_id.clone();
                tokio::spawn(async move {
                    runtime.process_listen_stop(&key, payload, turn, &trace_id).await;
                });
            }
            DeviceEventType::Abort => {
                self.on_abort(&key, &event, &trace_id).await;
            }
            DeviceEventType::ImageReady => {
                self.send_ack(&key, event.seq, &trace_id).await;
                self.on_image_ready(&key, &event, &trace_id).await;
            }
            DeviceEventType::Telemetry => {
                self.on_telemetry(&key, &event, &trace_id).await;
            }
            DeviceEventType::ToolResult => {
                self.on_tool_result(&key, &event, &trace_id).await;
            }
            DeviceEventType::Error => {
                let error_payload = Value::Object(event.payload.clone());
                warn!(
                    device_id = %key.0,
                    session_id = %key.1,
                    payload = %error_payload,
                    "device reported error"
                );
                self.record_lifelog(
                    &key.1,
                    "device_error",
                    json!({"trace_id": trace_id, "error": event.payload}),
                    RiskLevel::P1,
                    1.0,
                );
            }
        }
    }

    /// Device identity gate. Disabled by default; when enabled, a device
    /// without an activated binding is closed with `unauthorized`.
    async fn ensure_authorized(&self, key: &SessionKey, trace_id: &str) -> bool {
        if !self.config.require_activated_devices {
            return true;
        }
        let binding = crate::store::sessions::get_device_binding(&self.store.conn(), &key.0);
        let authorized = binding.as_ref().is_some_and(|b| b.status == "activated");
        if authorized {
            return true;
        }
        warn!(device_id = %key.0, "unauthorized device rejected");
        self.send_command(key, DeviceCommandType::Close, json_map(json!({"reason": "unauthorized"})), trace_id)
            .await;
        self.record_lifelog(
            &key.1,
            "device_auth_denied",
            json!({"trace_id": trace_id, "device_id": key.0}),
            RiskLevel::P1,
            1.0,
        );
        self.sessions.close(key, "unauthorized");
        false
    }

    async fn on_hello(&self, key: &SessionKey, event: &Envelope, trace_id: &str) {
        if let Some(capabilities) = event.payload.get("capabilities").and_then(Value::as_object) {
            self.sessions.update_metadata(key, capabilities);
        }
        self.sessions.update_state(key, SessionState::Ready);

        // Replay first: every retained command past the device's frontier, in
        // original order with original seqs. Audio is never retained, so it
        // is never replayed.
        if let Some(last_recv_seq) = extract_last_recv_seq(&event.payload) {
            let replay = self.sessions.replay_after(key, last_recv_seq);
            if !replay.is_empty() {
                info!(
                    device_id = %key.0,
                    count = replay.len(),
                    last_recv_seq,
                    "replaying command window"
                );
            }
            for command in replay {
                self.deliver(key, command).await;
            }
        }

        // Then whatever queued while the device was offline.
        for command in self.sessions.drain_pending(key) {
            self.deliver(key, command).await;
        }

        self.send_command(
            key,
            DeviceCommandType::HelloAck,
            json_map(json!({
                "runtime": "opencane",
                "protocol": event.version,
                "session_id": key.1,
                "ack_seq": event.seq,
            })),
            trace_id,
        )
        .await;

        if let Some(tasks) = &self.tasks {
            let tasks = tasks.clone();
            let device_id = key.0.clone();
            tokio::spawn(async move {
                let (sent, retried) = tasks.flush_pending_pushes(&device_id, 20).await;
                if sent + retried > 0 {
                    debug!(device_id = %device_id, sent, retried, "task push flush after hello");
                }
            });
        }
    }

    async fn on_listen_start(&self, key: &SessionKey, event: &Envelope, trace_id: &str) {
        let was_speaking = self.sessions.state(key) == Some(SessionState::Speaking);
        if was_speaking {
            // Barge-in: the stop must be observable before anything belonging
            // to the new turn.
            self.sessions.update_state(key, SessionState::Interrupted);
            self.send_tts_stop(key, true, "barge_in", trace_id).await;
            self.record_lifelog(
                &key.1,
                "voice_interrupt",
                json!({"trace_id": trace_id, "reason": "barge_in"}),
                RiskLevel::P3,
                1.0,
            );
        }
        self.sessions.bump_turn(key);
        self.sessions.update_state(key, SessionState::Listening);
        self.audio.start_capture(key);
        self.stt_partial_state.lock().unwrap().remove(key);
        self.send_ack(key, event.seq, trace_id).await;
        self.record_lifelog(
            &key.1,
            "listen_start",
            json!({"trace_id": trace_id, "seq": event.seq, "barge_in": was_speaking}),
            RiskLevel::P3,
            1.0,
        );
    }

    async fn on_abort(&self, key: &SessionKey, event: &Envelope, trace_id: &str) {
        let reason = event.payload_str("reason").unwrap_or("device_abort").to_string();
        self.audio.reset_capture(key);
        self.stt_partial_state.lock().unwrap().remove(key);
        self.sessions.bump_turn(key);
        self.sessions.update_state(key, SessionState::Ready);
        self.send_tts_stop(key, true, &reason, trace_id).await;

        // Cancel the active digital task when the device asks for it.
        let cancel_task = event.payload_bool("cancel_task").unwrap_or(false);
        if cancel_task {
            if let (Some(tasks), Some(task_id)) = (&self.tasks, self.sessions.active_task(key)) {
                if let Err(e) = tasks.cancel(&task_id, "device_abort").await {
                    debug!(task_id, error = %e, "abort task cancel skipped");
                }
                self.sessions.set_active_task(key, None);
            }
        }
        self.record_lifelog(
            &key.1,
            "abort",
            json!({"trace_id": trace_id, "reason": reason, "cancel_task": cancel_task}),
            RiskLevel::P3,
            1.0,
        );
    }

    async fn on_image_ready(self: &Arc<Self>, key: &SessionKey, event: &Envelope, trace_id: &str) {
        let Some(image_b64) = event
            .payload_str("image_base64")
            .or_else(|| event.payload_str("image"))
        else {
            debug!("image_ready without image payload");
            return;
        };
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(image_b64) else {
            self.record_lifelog(
                &key.1,
                "image_ingest_failed",
                json!({"trace_id": trace_id, "error": "invalid base64 image"}),
                RiskLevel::P2,
                1.0,
            );
            return;
        };
        let job = ImageJob::new(
            key.1.clone(),
            key.0.clone(),
            bytes,
            event.payload_str("mime").unwrap_or("image/jpeg"),
            event
                .payload_str("question")
                .or_else(|| event.payload_str("prompt"))
                .map(str::to_string),
            trace_id,
        );
        if let Err(e) = self.ingest.enqueue(job).await {
            warn!(error = %e, "image enqueue failed");
            self.record_lifelog(
                &key.1,
                "image_ingest_failed",
                json!({"trace_id": trace_id, "error": e.to_string()}),
                RiskLevel::P2,
                1.0,
            );
        }
    }

    async fn on_telemetry(&self, key: &SessionKey, event: &Envelope, trace_id: &str) {
        self.sessions.update_telemetry(key, &event.payload);
        let mut structured = Map::new();
        if self.config.telemetry_normalize_enabled {
            structured = normalize_telemetry_payload(&event.payload, event.ts);
            if !structured.is_empty() {
                let mut metadata = Map::new();
                metadata.insert("telemetry_structured".into(), Value::Object(structured.clone()));
                self.sessions.update_metadata(key, &metadata);
                if self.config.telemetry_persist_samples {
                    self.record_lifelog(
                        &key.1,
                        "telemetry_sample",
                        json!({
                            "trace_id": trace_id,
                            "device_id": key.0,
                            "sample": structured,
                            "raw": event.payload,
                        }),
                        RiskLevel::P3,
                        1.0,
                    );
                }
            }
        }
        self.send_ack(key, event.seq, trace_id).await;
        let mut payload = json!({"trace_id": trace_id, "telemetry": event.payload});
        if !structured.is_empty() {
            payload["telemetry_structured"] = Value::Object(structured);
        }
        self.record_lifelog(&key.1, "telemetry", payload, RiskLevel::P3, 0.0);
    }

    async fn on_tool_result(&self, key: &SessionKey, event: &Envelope, trace_id: &str) {
        self.send_ack(key, event.seq, trace_id).await;
        let operation_id = event
            .payload_str("operation_id")
            .or_else(|| event.payload_str("op_id"))
            .unwrap_or("")
            .to_string();
        let error = event.payload_str("error").unwrap_or("").to_string();
        let success = event.payload_bool("success").unwrap_or(error.is_empty());

        if !self.config.tool_result_enabled {
            self.record_lifelog(
                &key.1,
                "tool_result_ignored",
                json!({"trace_id": trace_id, "operation_id": operation_id, "reason": "feature_disabled"}),
                RiskLevel::P3,
                1.0,
            );
            return;
        }
        self.record_lifelog(
            &key.1,
            "tool_result",
            json!({
                "trace_id": trace_id,
                "operation_id": operation_id,
                "success": success,
                "result": event.payload.get("result"),
                "error": error,
            }),
            if success { RiskLevel::P3 } else { RiskLevel::P2 },
            if success { 0.9 } else { 0.7 },
        );
        if !operation_id.is_empty() {
            let status = if success { "acked" } else { "failed" };
            operations::mark_operation(
                &self.store.conn(),
                &operation_id,
                status,
                event.payload.get("result"),
                &error,
            );
        }
    }

    /// Finalize the capture and run the turn: transcript → dialogue → safety
    /// gate → TTS. Runs off the dispatch path; `turn` guards against
    /// barge-in/abort racing it.
    async fn process_listen_stop(
        self: &Arc<Self>,
        key: &SessionKey,
        payload: Map<String, Value>,
        turn: u64,
        trace_id: &str,
    ) {
        let turn_started = now_ms();
        let segment = self.audio.finalize_capture(key, &payload).await;
        let stt_latency = now_ms().saturating_sub(turn_started);
        let explicit_transcript = payload
            .get("transcript")
            .or_else(|| payload.get("text"))
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty());

        if self.sessions.turn_generation(key) != turn {
            debug!(trace_id, "turn superseded during finalization");
            return;
        }

        if segment.transcription_failed {
            self.record_lifelog(
                &key.1,
                "voice_turn_failure",
                json!({"trace_id": trace_id, "stage": "transcription"}),
                RiskLevel::P2,
                1.0,
            );
        }

        if segment.transcript.is_empty() {
            self.send_tts_text(
                key,
                "I could not understand the audio. Please try again.",
                "stt_error",
                1.0,
                RiskLevel::P2,
                turn,
                trace_id,
            )
            .await;
            self.sessions.update_state(key, SessionState::Ready);
            self.metrics
                .record_voice_turn(false, now_ms().saturating_sub(turn_started), stt_latency);
            self.record_lifelog(
                &key.1,
                "voice_turn",
                json!({
                    "trace_id": trace_id,
                    "transcript": "",
                    "success": false,
                    "stt_latency_ms": stt_latency,
                }),
                RiskLevel::P2,
                1.0,
            );
            return;
        }

        // The device already knows its own transcript; only pipeline-derived
        // text goes back down as stt_final.
        if !explicit_transcript {
            self.send_command(
                key,
                DeviceCommandType::SttFinal,
                json_map(json!({"text": segment.transcript})),
                trace_id,
            )
            .await;
        }

        // Voice-initiated digital tasks bypass the dialogue engine.
        if let Some(tasks) = &self.tasks {
            if crate::task::looks_like_task_goal(&segment.transcript) {
                let request = TaskRequest {
                    goal: segment.transcript.clone(),
                    session_id: Some(key.1.clone()),
                    device_id: Some(key.0.clone()),
                    interrupt_previous: true,
                    ..Default::default()
                };
                match tasks.execute(request).await {
                    Ok(task) => {
                        self.sessions.set_active_task(key, Some(task.task_id.clone()));
                        self.sessions.update_state(key, SessionState::Ready);
                        self.metrics.record_voice_turn(
                            true,
                            now_ms().saturating_sub(turn_started),
                            stt_latency,
                        );
                        self.record_lifelog(
                            &key.1,
                            "digital_task_turn",
                            json!({
                                "trace_id": trace_id,
                                "transcript": segment.transcript,
                                "task_id": task.task_id,
                            }),
                            RiskLevel::P3,
                            0.8,
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "voice task routing failed");
                        self.send_tts_text(
                            key,
                            "I could not start that task. Please try again shortly.",
                            "digital_task_route",
                            1.0,
                            RiskLevel::P2,
                            turn,
                            trace_id,
                        )
                        .await;
                        self.sessions.update_state(key, SessionState::Ready);
                        return;
                    }
                }
            }
        }

        let context = self.sessions.session_context(key);
        let dialogue_started = now_ms();
        let reply = tokio::time::timeout(
            Duration::from_millis(self.config.dialogue_timeout_ms),
            self.dialogue.reply(&context, &segment.transcript),
        )
        .await;
        let agent_latency = now_ms().saturating_sub(dialogue_started);

        if self.sessions.turn_generation(key) != turn {
            debug!(trace_id, "turn superseded during dialogue");
            return;
        }

        let (text, thought_trace, success) = match reply {
            Ok(Ok((text, trace))) => (text, trace, true),
            Ok(Err(e)) => {
                warn!(error = %e, "dialogue engine failed");
                (String::new(), None, false)
            }
            Err(_) => {
                warn!(timeout_ms = self.config.dialogue_timeout_ms, "dialogue engine timed out");
                (String::new(), None, false)
            }
        };
        if let Some(trace) = thought_trace {
            let _ = lifelog::add_thought_trace(
                &self.store.conn(),
                trace_id,
                &key.1,
                "dialogue",
                "reply",
                &trace,
            );
        }

        self.send_tts_text(
            key,
            &text,
            "agent_reply",
            if success { 0.75 } else { 0.3 },
            RiskLevel::P3,
            turn,
            trace_id,
        )
        .await;
        if self.sessions.turn_generation(key) == turn {
            self.sessions.update_state(key, SessionState::Ready);
        }
        let total_latency = now_ms().saturating_sub(turn_started);
        self.metrics.record_voice_turn(success, total_latency, stt_latency);
        self.record_lifelog(
            &key.1,
            "voice_turn",
            json!({
                "trace_id": trace_id,
                "transcript": segment.transcript,
                "response": truncate(&text, 1000),
                "success": success,
                "stt_latency_ms": stt_latency,
                "agent_latency_ms": agent_latency,
                "total_latency_ms": total_latency,
                "vad_accepted": segment.vad_accepted,
                "late_dropped": segment.late_dropped,
            }),
            RiskLevel::P3,
            0.7,
        );
    }

    async fn handle_vision_digest(self: &Arc<Self>, digest: VisionDigest) {
        // Jobs enqueued over HTTP may have no device attached: record the
        // outcome but dispatch nothing.
        if digest.device_id.is_empty() {
            self.record_lifelog(
                &digest.session_id,
                "image_turn",
                json!({
                    "trace_id": digest.trace_id,
                    "result": truncate(&digest.text, 1000),
                    "dedup": digest.dedup,
                    "success": !digest.failed,
                }),
                digest.risk_level,
                digest.confidence,
            );
            return;
        }
        let key = (digest.device_id.clone(), digest.session_id.clone());
        if digest.risk_level == RiskLevel::P0 {
            self.sessions.note_p0_hint(&key);
        }
        let turn = self.sessions.turn_generation(&key);
        self.send_tts_text(
            &key,
            &digest.text,
            "vision_reply",
            digest.confidence,
            digest.risk_level,
            turn,
            &digest.trace_id,
        )
        .await;
        if self.sessions.turn_generation(&key) == turn {
            self.sessions.update_state(&key, SessionState::Ready);
        }
        self.record_lifelog(
            &digest.session_id,
            "image_turn",
            json!({
                "trace_id": digest.trace_id,
                "result": truncate(&digest.text, 1000),
                "dedup": digest.dedup,
                "success": !digest.failed,
            }),
            digest.risk_level,
            digest.confidence,
        );
    }

    /// Deliver one task status push. Returns whether the device accepted it.
    pub async fn push_task_update(self: &Arc<Self>, update: TaskStatusUpdate) -> bool {
        let snapshot = if update.session_id.is_empty() {
            self.sessions.latest_for_device(&update.device_id)
        } else {
            self.sessions
                .get(&update.device_id, &update.session_id)
                .or_else(|| self.sessions.latest_for_device(&update.device_id))
        };
        let Some(snapshot) = snapshot.filter(|s| !s.is_closed()) else {
            return false;
        };
        if !self.adapter.is_device_online(&update.device_id) {
            return false;
        }
        let key = snapshot.key();
        let trace_id = format!("task-{}", update.task_id);

        // Status text goes through the safety gate once, and the gated text
        // is what both the task_update and the spoken chunk carry.
        let decision = self.safety.evaluate(
            &update.message,
            status_confidence(&update.status),
            status_risk(&update.status),
            &SafetyContext {
                source: "task_update".into(),
                recent_p0_age_ms: self.sessions.p0_hint_age_ms(&key),
                ..Default::default()
            },
        );
        self.record_lifelog(
            &key.1,
            "safety_policy",
            Value::Object(decision.to_audit_payload(&trace_id)),
            decision.risk_level,
            decision.confidence,
        );

        let sent = self
            .send_command(
                &key,
                DeviceCommandType::TaskUpdate,
                json_map(json!({
                    "task_id": update.task_id,
                    "status": update.status,
                    "message": decision.text,
                    "event": update.event,
                })),
                &trace_id,
            )
            .await;
        if !sent {
            return false;
        }
        if update.speak && !decision.text.is_empty() {
            let turn = self.sessions.turn_generation(&key);
            self.stream_tts(&key, &decision.text, turn, &trace_id).await;
            if self.sessions.turn_generation(&key) == turn {
                self.sessions.update_state(&key, SessionState::Ready);
            }
        }
        true
    }

    async fn maybe_emit_stt_partial(&self, key: &SessionKey, partial: &str, trace_id: &str) {
        let text = truncate(partial, self.config.partial_max_chars);
        let now = now_ms();
        {
            let mut state = self.stt_partial_state.lock().unwrap();
            if let Some((last_text, last_ts)) = state.get(key) {
                if *last_text == text && now.saturating_sub(*last_ts) < 1_000 {
                    return;
                }
            }
            state.insert(key.clone(), (text.clone(), now));
        }
        self.send_command(
            key,
            DeviceCommandType::SttPartial,
            json_map(json!({"text": text})),
            trace_id,
        )
        .await;
    }

    /// Apply the safety gate and stream the text as one TTS turn.
    #[allow(clippy::too_many_arguments)]
    async fn send_tts_text(
        self: &Arc<Self>,
        key: &SessionKey,
        text: &str,
        source: &str,
        confidence: f64,
        risk_level: RiskLevel,
        turn: u64,
        trace_id: &str,
    ) {
        let decision = self.safety.evaluate(
            text,
            confidence,
            risk_level,
            &SafetyContext {
                source: source.into(),
                recent_p0_age_ms: self.sessions.p0_hint_age_ms(key),
                ..Default::default()
            },
        );
        if decision.risk_level == RiskLevel::P0 {
            self.sessions.note_p0_hint(key);
        }
        self.record_lifelog(
            &key.1,
            "safety_policy",
            Value::Object(decision.to_audit_payload(trace_id)),
            decision.risk_level,
            decision.confidence,
        );
        self.stream_tts(key, &decision.text, turn, trace_id).await;
    }

    /// `tts_start` / `tts_chunk`+ / `tts_stop`, respecting mode and turn
    /// generation. A stale generation stops silently: the barge-in handler
    /// already emitted `tts_stop{aborted:true}`.
    async fn stream_tts(self: &Arc<Self>, key: &SessionKey, text: &str, turn: u64, trace_id: &str) {
        let text = text.trim();
        if text.is_empty() {
            self.send_tts_stop(key, false, "", trace_id).await;
            return;
        }
        if self.sessions.turn_generation(key) != turn {
            return;
        }
        self.sessions.update_state(key, SessionState::Speaking);

        let audio = match (self.config.tts_mode, &self.tts) {
            (TtsMode::ServerAudio, Some(tts)) => {
                match tokio::time::timeout(
                    Duration::from_millis(self.config.tts_timeout_ms),
                    tts.synthesize(text),
                )
                .await
                {
                    Ok(Ok(bytes)) if !bytes.is_empty() => Some(bytes),
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => {
                        warn!(error = %e, "tts synthesis failed, falling back to device text");
                        None
                    }
                    Err(_) => {
                        warn!("tts synthesis timed out, falling back to device text");
                        None
                    }
                }
            }
            _ => None,
        };

        let preview = truncate(text, 80);
        let start_payload = match &audio {
            Some(_) => json!({"text": preview, "mode": "server_audio", "encoding": "wav"}),
            None => json!({"text": preview}),
        };
        if !self
            .send_command(key, DeviceCommandType::TtsStart, json_map(start_payload), trace_id)
            .await
        {
            return;
        }

        match audio {
            Some(bytes) => {
                for chunk in bytes.chunks(self.config.tts_audio_chunk_bytes.max(256)) {
                    if self.sessions.turn_generation(key) != turn {
                        return;
                    }
                    self.send_command(
                        key,
                        DeviceCommandType::TtsChunk,
                        json_map(json!({
                            "audio_b64": base64::engine::general_purpose::STANDARD.encode(chunk),
                            "encoding": "wav",
                        })),
                        trace_id,
                    )
                    .await;
                }
            }
            None => {
                for chunk in chunk_chars(text, self.config.tts_text_chunk_chars.max(16)) {
                    if self.sessions.turn_generation(key) != turn {
                        return;
                    }
                    self.send_command(
                        key,
                        DeviceCommandType::TtsChunk,
                        json_map(json!({"text": chunk})),
                        trace_id,
                    )
                    .await;
                }
            }
        }
        if self.sessions.turn_generation(key) == turn {
            self.send_tts_stop(key, false, "", trace_id).await;
        }
    }

    async fn send_tts_stop(&self, key: &SessionKey, aborted: bool, reason: &str, trace_id: &str) {
        let mut payload = Map::new();
        payload.insert("aborted".into(), Value::Bool(aborted));
        if !reason.is_empty() {
            payload.insert("reason".into(), Value::String(reason.to_string()));
        }
        self.send_command(key, DeviceCommandType::TtsStop, payload, trace_id)
            .await;
    }

    async fn send_ack(&self, key: &SessionKey, ack_seq: i64, trace_id: &str) {
        if ack_seq < 0 {
            return;
        }
        self.send_command(
            key,
            DeviceCommandType::Ack,
            json_map(json!({"ack_seq": ack_seq})),
            trace_id,
        )
        .await;
    }

    /// Allocate a seq, remember the command for replay, and try delivery.
    /// Returns whether the transport accepted it; on failure the command is
    /// buffered in `pending_commands` and the operation log.
    pub async fn send_command(
        &self,
        key: &SessionKey,
        kind: DeviceCommandType,
        payload: Map<String, Value>,
        trace_id: &str,
    ) -> bool {
        self.send_command_with_seq(key, kind, payload, trace_id)
            .await
            .1
    }

    /// As `send_command`, also exposing the allocated outbound seq.
    pub async fn send_command_with_seq(
        &self,
        key: &SessionKey,
        kind: DeviceCommandType,
        payload: Map<String, Value>,
        trace_id: &str,
    ) -> (i64, bool) {
        let lock = {
            let mut locks = self.send_locks.lock().unwrap();
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = lock.lock().await;
        let seq = self.sessions.next_outbound_seq(key);
        let command = Envelope::command(kind, key.0.clone(), key.1.clone(), seq, payload);
        self.metrics.record_command(command.kind.as_str());
        debug!(
            command = command.kind.as_str(),
            device_id = %key.0,
            session_id = %key.1,
            seq,
            trace_id,
            "device command"
        );
        // The replay window holds *sent* commands; a failed delivery lands in
        // `pending_commands` instead (via `deliver`) and is flushed, not
        // replayed, on the next hello.
        let delivered = self.deliver(key, command.clone()).await;
        if delivered {
            self.sessions.record_command(key, &command);
        }
        (seq, delivered)
    }

    /// Hand one already-sequenced command to the adapter, buffering on
    /// failure.
    async fn deliver(&self, key: &SessionKey, command: Envelope) -> bool {
        match self.adapter.send_command(command.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    error = %e,
                    command = command.kind.as_str(),
                    seq = command.seq,
                    "delivery failed, buffering for replay"
                );
                let operation_id = format!("cmd-{}-{}", key.0, command.seq);
                let _ = operations::create_operation(
                    &self.store.conn(),
                    &operation_id,
                    &key.0,
                    &key.1,
                    "runtime_command",
                    command.kind.as_str(),
                    "queued",
                    &Value::Object(command.payload.clone()),
                );
                self.sessions.push_pending(key, command);
                false
            }
        }
    }

    fn record_lifelog(
        &self,
        session_id: &str,
        event_type: &str,
        payload: Value,
        risk_level: RiskLevel,
        confidence: f64,
    ) {
        let payload = match payload {
            Value::Object(map) => map,
            other => json_map(json!({"value": other})),
        };
        if let Err(e) = lifelog::add_event(
            &self.store.conn(),
            session_id,
            event_type,
            &payload,
            risk_level.as_str(),
            confidence,
            None,
        ) {
            debug!(error = %e, event_type, "lifelog record failed");
        }
    }

    /// Dispatch one ad-hoc operation to a device (control API path).
    pub async fn dispatch_operation(
        &self,
        device_id: &str,
        session_id: Option<&str>,
        op_type: &str,
        payload: Map<String, Value>,
    ) -> Result<(String, i64), RuntimeError> {
        let kind = match op_type.trim().to_ascii_lowercase().as_str() {
            "set_config" => DeviceCommandType::SetConfig,
            "tool_call" => DeviceCommandType::ToolCall,
            "ota_plan" => DeviceCommandType::OtaPlan,
            "close" => DeviceCommandType::Close,
            other => {
                return Err(RuntimeError::InvalidControlPayload(format!(
                    "unsupported op_type: {other}"
                )))
            }
        };
        let snapshot = match session_id {
            Some(session_id) => self.sessions.get(device_id, session_id),
            None => self.sessions.latest_for_device(device_id),
        };
        let Some(snapshot) = snapshot else {
            return Err(RuntimeError::InvalidControlPayload(
                "device session not found".into(),
            ));
        };
        let key = snapshot.key();
        let operation_id = uuid::Uuid::new_v4().to_string();
        let command_type = opencane_protocol::EnvelopeType::Command(kind);
        let _ = operations::create_operation(
            &self.store.conn(),
            &operation_id,
            device_id,
            &key.1,
            op_type,
            command_type.as_str(),
            "queued",
            &Value::Object(payload.clone()),
        );
        let (seq, sent) = self
            .send_command_with_seq(&key, kind, payload, &operation_id)
            .await;
        operations::mark_operation(
            &self.store.conn(),
            &operation_id,
            if sent { "sent" } else { "queued" },
            None,
            "",
        );
        Ok((operation_id, seq))
    }

    /// Status snapshot for the control API.
    pub fn runtime_status(&self) -> Value {
        let devices: Vec<Value> = self
            .sessions
            .all_snapshots()
            .into_iter()
            .map(|s| {
                json!({
                    "device_id": s.device_id,
                    "session_id": s.session_id,
                    "state": s.state.as_str(),
                    "last_seen_ms": s.last_seen_ms,
                    "last_recv_seq": s.last_recv_seq,
                    "outbound_seq": s.outbound_seq,
                    "pending_commands": s.pending_commands,
                })
            })
            .collect();
        let digital_task = self
            .tasks
            .as_ref()
            .map(|t| Value::Object(t.stats(None)))
            .unwrap_or(Value::Null);
        let safety_stats = lifelog::safety_stats(&self.store.conn());
        json!({
            "adapter": self.adapter.name(),
            "transport": self.adapter.transport(),
            "running": self.running.load(Ordering::SeqCst),
            "session_count": self.sessions.open_session_count(),
            "metrics": self.metrics.snapshot(),
            "ingest_queue": self.ingest.stats().to_json(),
            "digital_task": digital_task,
            "safety": {
                "enabled": self.safety.enabled(),
                "applied": safety_stats.total,
                "downgraded": safety_stats.downgraded,
            },
            "devices": devices,
        })
    }
}

fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn extract_last_recv_seq(payload: &Map<String, Value>) -> Option<i64> {
    if let Some(seq) = payload.get("last_recv_seq").and_then(Value::as_i64) {
        return Some(seq);
    }
    payload
        .get("resume")
        .and_then(Value::as_object)?
        .get("last_recv_seq")
        .and_then(Value::as_i64)
}

fn status_confidence(status: &str) -> f64 {
    match status {
        "success" | "running" | "pending" => 0.9,
        "failed" | "timeout" | "canceled" => 0.8,
        _ => 0.75,
    }
}

fn status_risk(status: &str) -> RiskLevel {
    match status {
        "failed" | "timeout" => RiskLevel::P2,
        _ => RiskLevel::P3,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
