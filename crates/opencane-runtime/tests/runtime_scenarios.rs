//! End-to-end runtime scenarios driven through the mock adapter: full voice
//! turns, duplicate handling, barge-in, reconnect replay, and image dedup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify};

use opencane_protocol::{DeviceCommandType, DeviceEventType, Envelope, EnvelopeType};
use opencane_runtime::adapter::mock::MockAdapter;
use opencane_runtime::audio::{AudioConfig, AudioPipeline};
use opencane_runtime::connection::{ConnectionConfig, ConnectionRuntime};
use opencane_runtime::error::RuntimeError;
use opencane_runtime::ingest::{IngestQueue, OverflowPolicy};
use opencane_runtime::providers::{
    DialogueEngine, EchoDialogueEngine, InMemoryVectorIndex, StructuredVisionResult, VisionProvider,
};
use opencane_runtime::safety::{RiskLevel, SafetyGate, SafetyGateConfig};
use opencane_runtime::session::{SessionKey, SessionManager, SessionState};
use opencane_runtime::store::{lifelog, tasks as task_store, Store};
use opencane_runtime::task::{DigitalTaskService, TaskConfig};
use opencane_runtime::vision::assets::ImageAssetStore;
use opencane_runtime::vision::{VisionConfig, VisionPipeline};

/// Tool executor stub with a configurable delay, for timeout scenarios.
struct SleepExecutor {
    delay_ms: u64,
}

impl SleepExecutor {
    fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

#[async_trait]
impl opencane_runtime::providers::ToolExecutor for SleepExecutor {
    async fn execute(
        &self,
        step: &opencane_runtime::providers::TaskStep,
    ) -> Result<opencane_runtime::providers::StepResult, RuntimeError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(opencane_runtime::providers::StepResult {
            text: format!("completed: {}", step.goal),
            execution_path: "stub".into(),
            needs_fallback: false,
        })
    }
}

struct StubVision;

#[async_trait]
impl VisionProvider for StubVision {
    async fn analyze(
        &self,
        _image: &[u8],
        _mime: &str,
        _question: Option<&str>,
    ) -> Result<StructuredVisionResult, RuntimeError> {
        Ok(StructuredVisionResult {
            summary: "a clear hallway".into(),
            actionable_summary: "the hallway ahead is clear".into(),
            risk_level: Some(RiskLevel::P3),
            confidence: 0.9,
            ..Default::default()
        })
    }
}

/// Dialogue engine that parks until released, so tests can interleave
/// barge-in with an in-flight turn.
struct GatedDialogue {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl DialogueEngine for GatedDialogue {
    async fn reply(
        &self,
        _session_context: &Map<String, Value>,
        transcript: &str,
    ) -> Result<(String, Option<Value>), RuntimeError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok((format!("delayed reply to: {transcript}"), None))
    }
}

struct Harness {
    adapter: Arc<MockAdapter>,
    runtime: Arc<ConnectionRuntime>,
    // Held so the runtime's push callback stays wired to a live service.
    _tasks: Arc<DigitalTaskService>,
    store: Arc<Store>,
    _assets_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(dialogue: Arc<dyn DialogueEngine>) -> Self {
        let assets_dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let store = Arc::new(Store::new_in_memory().unwrap());
        let sessions = Arc::new(SessionManager::new(Some(store.clone()), 64, 32));
        let audio = Arc::new(AudioPipeline::new(AudioConfig::default(), None));
        let vector = Arc::new(InMemoryVectorIndex::default());

        let (digest_tx, digest_rx) = mpsc::channel(32);
        let ingest = IngestQueue::new(16, OverflowPolicy::Reject, 2);
        let vision = Arc::new(VisionPipeline::new(
            ImageAssetStore::new(assets_dir.path(), 1_000, 100),
            store.clone(),
            vector,
            Some(Arc::new(StubVision)),
            VisionConfig::default(),
            digest_tx,
        ));
        ingest.spawn_workers(vision);

        let tasks = DigitalTaskService::new(
            store.clone(),
            None,
            Arc::new(SleepExecutor::new(0)),
            TaskConfig {
                status_retry_count: 0,
                status_retry_backoff_ms: 10,
                ..Default::default()
            },
        );

        let runtime = ConnectionRuntime::new(
            adapter.clone(),
            sessions,
            audio,
            dialogue,
            None,
            SafetyGate::new(SafetyGateConfig::default()),
            ingest,
            Some(tasks.clone()),
            store.clone(),
            ConnectionConfig::default(),
            digest_rx,
        );
        runtime.start().await.unwrap();

        Self {
            adapter,
            runtime,
            _tasks: tasks,
            store,
            _assets_dir: assets_dir,
        }
    }

    async fn inject(&self, event: Envelope) {
        self.adapter.inject_event(event).await.unwrap();
    }

    async fn wait_for<F: Fn(&[Envelope]) -> bool>(&self, predicate: F) -> Vec<Envelope> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let sent = self.adapter.sent_commands();
            if predicate(&sent) {
                return sent;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for commands; got {:?}", kinds(&sent));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn kinds(commands: &[Envelope]) -> Vec<&'static str> {
    commands.iter().map(|c| c.kind.as_str()).collect()
}

fn event(kind: DeviceEventType, seq: i64, payload: Value) -> Envelope {
    Envelope::event(
        kind,
        "dev-001",
        "s1",
        seq,
        payload.as_object().cloned().unwrap_or_default(),
    )
}

fn audio_chunk(seq: i64) -> Envelope {
    event(
        DeviceEventType::AudioChunk,
        seq,
        json!({
            "audio_b64": base64::engine::general_purpose::STANDARD.encode([seq as u8; 20]),
            "is_speech": true,
        }),
    )
}

fn key() -> SessionKey {
    ("dev-001".to_string(), "s1".to_string())
}

fn count_kind(commands: &[Envelope], kind: DeviceCommandType) -> usize {
    commands
        .iter()
        .filter(|c| c.kind == EnvelopeType::Command(kind))
        .count()
}

async fn run_nominal_turn(harness: &Harness) -> Vec<Envelope> {
    harness.inject(event(DeviceEventType::Hello, 1, json!({}))).await;
    harness.inject(event(DeviceEventType::ListenStart, 2, json!({}))).await;
    for seq in 3..=7 {
        harness.inject(audio_chunk(seq)).await;
    }
    harness
        .inject(event(
            DeviceEventType::ListenStop,
            8,
            json!({"transcript": "what is ahead"}),
        ))
        .await;
    harness
        .wait_for(|sent| {
            sent.iter().any(|c| {
                c.kind == EnvelopeType::Command(DeviceCommandType::TtsStop)
                    && c.payload_bool("aborted") == Some(false)
            })
        })
        .await
}

#[tokio::test]
async fn scenario_nominal_voice_turn() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    let sent = run_nominal_turn(&harness).await;

    // hello_ack first, then acks for every sequenced event 2..=8.
    assert_eq!(
        sent[0].kind,
        EnvelopeType::Command(DeviceCommandType::HelloAck)
    );
    let acked: Vec<i64> = sent
        .iter()
        .filter(|c| c.kind == EnvelopeType::Command(DeviceCommandType::Ack))
        .filter_map(|c| c.payload_i64("ack_seq"))
        .collect();
    assert_eq!(acked, vec![2, 3, 4, 5, 6, 7, 8]);

    // The spoken turn: tts_start, at least one chunk, clean stop.
    let names = kinds(&sent);
    let start = names.iter().position(|n| *n == "tts_start").unwrap();
    let stop = names.iter().position(|n| *n == "tts_stop").unwrap();
    assert!(start < stop);
    assert!(count_kind(&sent, DeviceCommandType::TtsChunk) >= 1);
    let chunk_text: String = sent
        .iter()
        .filter(|c| c.kind == EnvelopeType::Command(DeviceCommandType::TtsChunk))
        .filter_map(|c| c.payload_str("text"))
        .collect();
    assert_eq!(chunk_text, "I heard: what is ahead");

    // Strictly increasing outbound seq across every command.
    let seqs: Vec<i64> = sent.iter().map(|c| c.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs not monotonic: {seqs:?}");
    assert_eq!(harness.runtime.sessions.state(&key()), Some(SessionState::Ready));
}

#[tokio::test]
async fn scenario_duplicates_are_reacked_not_reprocessed() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    run_nominal_turn(&harness).await;
    harness.adapter.take_sent();

    harness.inject(audio_chunk(5)).await;
    harness.inject(event(DeviceEventType::Heartbeat, 8, json!({}))).await;

    let sent = harness
        .wait_for(|sent| count_kind(sent, DeviceCommandType::Ack) >= 2)
        .await;
    let acked: Vec<i64> = sent.iter().filter_map(|c| c.payload_i64("ack_seq")).collect();
    assert_eq!(acked, vec![5, 8]);
    // No segment mutation: the duplicate never reaches the audio pipeline, so
    // no new tts/stt traffic appears.
    assert_eq!(count_kind(&sent, DeviceCommandType::TtsStart), 0);
    assert_eq!(count_kind(&sent, DeviceCommandType::SttPartial), 0);
}

#[tokio::test]
async fn scenario_barge_in_stop_precedes_new_turn() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    run_nominal_turn(&harness).await;

    // Device starts talking while the server is mid-TTS.
    harness
        .runtime
        .sessions
        .update_state(&key(), SessionState::Speaking);
    harness.adapter.take_sent();
    harness.inject(event(DeviceEventType::ListenStart, 9, json!({}))).await;

    let sent = harness
        .wait_for(|sent| count_kind(sent, DeviceCommandType::Ack) >= 1)
        .await;
    // tts_stop{aborted:true} is observable before anything of the new turn.
    assert_eq!(sent[0].kind, EnvelopeType::Command(DeviceCommandType::TtsStop));
    assert_eq!(sent[0].payload_bool("aborted"), Some(true));
    assert_eq!(sent[1].kind, EnvelopeType::Command(DeviceCommandType::Ack));
    assert_eq!(sent[1].payload_i64("ack_seq"), Some(9));
    assert_eq!(
        harness.runtime.sessions.state(&key()),
        Some(SessionState::Listening)
    );
}

#[tokio::test]
async fn scenario_barge_in_cancels_in_flight_dialogue() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let harness = Harness::new(Arc::new(GatedDialogue {
        entered: entered.clone(),
        release: release.clone(),
    }))
    .await;

    harness.inject(event(DeviceEventType::Hello, 1, json!({}))).await;
    harness.inject(event(DeviceEventType::ListenStart, 2, json!({}))).await;
    harness
        .inject(event(
            DeviceEventType::ListenStop,
            3,
            json!({"transcript": "first question"}),
        ))
        .await;
    entered.notified().await;

    // New turn begins while the old dialogue is still thinking.
    harness.inject(event(DeviceEventType::ListenStart, 4, json!({}))).await;
    harness
        .wait_for(|sent| {
            sent.iter()
                .any(|c| c.payload_i64("ack_seq") == Some(4))
        })
        .await;
    harness.adapter.take_sent();
    release.notify_one();

    // The stale turn's reply must never be spoken.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let sent = harness.adapter.sent_commands();
    assert_eq!(count_kind(&sent, DeviceCommandType::TtsStart), 0, "{:?}", kinds(&sent));
}

#[tokio::test]
async fn scenario_reconnect_replays_window_then_pending() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    let sent = run_nominal_turn(&harness).await;
    // K: the last outbound seq the device actually received.
    let k = sent[2].seq;
    let lost: Vec<i64> = sent.iter().map(|c| c.seq).filter(|seq| *seq > k).collect();

    // Transport drops; task status pushes generated while offline queue up.
    harness.adapter.set_online(false);
    for (task_id, status) in [("t-a", "running"), ("t-b", "running")] {
        task_store::enqueue_push(
            &harness.store.conn(),
            task_id,
            "dev-001",
            "s1",
            status,
            &json!({
                "event": status, "task_id": task_id, "status": status,
                "message": format!("update for {task_id}"),
                "device_id": "dev-001", "session_id": "s1", "speak": false,
            }),
            "offline",
        )
        .unwrap();
    }

    harness.adapter.set_online(true);
    harness.adapter.take_sent();
    harness
        .inject(event(
            DeviceEventType::Hello,
            9,
            json!({"last_recv_seq": k}),
        ))
        .await;

    let sent = harness
        .wait_for(|sent| count_kind(sent, DeviceCommandType::TaskUpdate) >= 2)
        .await;

    // Replay first: every retained command past K, in original order.
    let replayed: Vec<i64> = sent.iter().take(lost.len()).map(|c| c.seq).collect();
    assert_eq!(replayed, lost);
    // Then the queued task updates.
    let task_ids: Vec<&str> = sent
        .iter()
        .filter(|c| c.kind == EnvelopeType::Command(DeviceCommandType::TaskUpdate))
        .filter_map(|c| c.payload_str("task_id"))
        .collect();
    assert_eq!(task_ids.len(), 2);
    assert!(task_ids.contains(&"t-a") && task_ids.contains(&"t-b"));
    // hello_ack still goes out for the reconnect.
    assert_eq!(count_kind(&sent, DeviceCommandType::HelloAck), 1);
}

#[tokio::test]
async fn scenario_image_dedup_single_context_row() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    harness.inject(event(DeviceEventType::Hello, 1, json!({}))).await;

    let image = base64::engine::general_purpose::STANDARD.encode(b"camera-frame-bytes");
    harness
        .inject(event(
            DeviceEventType::ImageReady,
            2,
            json!({"image_base64": image, "mime": "image/jpeg", "question": "what is ahead"}),
        ))
        .await;
    harness
        .wait_for(|sent| {
            sent.iter().any(|c| {
                c.payload_str("text")
                    .is_some_and(|t| t.contains("hallway"))
            })
        })
        .await;
    assert_eq!(lifelog::context_count(&harness.store.conn()), 1);

    // Same bytes again: dedup, no second context row, still answered.
    harness.adapter.take_sent();
    harness
        .inject(event(
            DeviceEventType::ImageReady,
            3,
            json!({"image_base64": image, "mime": "image/jpeg"}),
        ))
        .await;
    harness
        .wait_for(|sent| {
            sent.iter()
                .any(|c| c.kind == EnvelopeType::Command(DeviceCommandType::TtsStop))
        })
        .await;
    assert_eq!(lifelog::context_count(&harness.store.conn()), 1);

    let events = lifelog::timeline(
        &harness.store.conn(),
        &lifelog::TimelineFilter {
            session_id: Some("s1"),
            event_type: Some("image_ingested"),
            limit: 10,
            ..Default::default()
        },
    );
    assert_eq!(events.len(), 2);
    let dedup_flags: Vec<bool> = events
        .iter()
        .filter_map(|e| e.payload.as_ref()?.get("dedup")?.as_bool())
        .collect();
    // Newest first: second ingest was the duplicate.
    assert_eq!(dedup_flags, vec![true, false]);
}

#[tokio::test]
async fn scenario_task_timeout_pushes_all_transitions() {
    let harness = Harness::new(Arc::new(EchoDialogueEngine)).await;
    harness.inject(event(DeviceEventType::Hello, 1, json!({}))).await;
    harness
        .wait_for(|sent| count_kind(sent, DeviceCommandType::HelloAck) >= 1)
        .await;
    harness.adapter.take_sent();

    let slow = Arc::new(SleepExecutor::new(2_000));
    let tasks = DigitalTaskService::new(
        harness.store.clone(),
        None,
        slow,
        TaskConfig {
            status_retry_count: 0,
            status_retry_backoff_ms: 10,
            ..Default::default()
        },
    );
    let runtime = harness.runtime.clone();
    tasks.set_push_fn(Arc::new(move |update| {
        let runtime = runtime.clone();
        Box::pin(async move { runtime.push_task_update(update).await })
    }));

    let started = std::time::Instant::now();
    let task = tasks
        .execute(opencane_runtime::task::TaskRequest {
            goal: "long op".into(),
            session_id: Some("s1".into()),
            device_id: Some("dev-001".into()),
            timeout_seconds: Some(1),
            notify: Some(true),
            speak: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    let sent = harness
        .wait_for(|sent| {
            sent.iter()
                .any(|c| c.payload_str("status") == Some("timeout"))
        })
        .await;
    assert!(started.elapsed() < Duration::from_millis(1_800));
    assert_eq!(tasks.get(&task.task_id).unwrap().status, "timeout");
    let statuses: Vec<&str> = sent
        .iter()
        .filter(|c| c.kind == EnvelopeType::Command(DeviceCommandType::TaskUpdate))
        .filter_map(|c| c.payload_str("status"))
        .collect();
    assert_eq!(statuses, vec!["pending", "running", "timeout"]);
}
