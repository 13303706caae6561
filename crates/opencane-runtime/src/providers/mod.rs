//! Pluggable provider interfaces the runtime consumes.
//!
//! Providers are defined by capability, not hierarchy; concrete
//! implementations are injected at construction. Every call must be
//! cancellable or bounded by a timeout — the runtime wraps calls with
//! `tokio::time::timeout` where providers cannot guarantee it themselves.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;
use crate::safety::RiskLevel;

/// Speech-to-text over a finished capture segment.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Returns the transcript and a confidence in `[0, 1]`.
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<(String, f64), RuntimeError>;
}

/// Text-to-speech synthesis for `server_audio` mode.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, RuntimeError>;
}

/// Structured output of the vision provider. Free-text providers fill only
/// `summary`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredVisionResult {
    pub summary: String,
    pub objects: Vec<Value>,
    pub ocr: Vec<Value>,
    pub risk_hints: Vec<String>,
    pub actionable_summary: String,
    pub risk_level: Option<RiskLevel>,
    pub risk_score: f64,
    pub confidence: f64,
}

#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn analyze(
        &self,
        image: &[u8],
        mime: &str,
        question: Option<&str>,
    ) -> Result<StructuredVisionResult, RuntimeError>;
}

/// Produces the assistant reply for one finalized transcript.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    /// Returns the reply text and an optional thought trace for auditing.
    async fn reply(
        &self,
        session_context: &Map<String, Value>,
        transcript: &str,
    ) -> Result<(String, Option<Value>), RuntimeError>;
}

/// One unit of digital-task work handed to a tool executor.
#[derive(Debug, Clone)]
pub struct TaskStep {
    pub task_id: String,
    pub session_id: String,
    pub goal: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub text: String,
    pub execution_path: String,
    /// When set, the executor could not cover the goal and the caller should
    /// try the next stage.
    pub needs_fallback: bool,
}

/// Digital-task tool execution. The service runs an MCP-capable executor
/// first and falls back to the general web/exec path.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, step: &TaskStep) -> Result<StepResult, RuntimeError>;
}

/// Vector search over lifelog text.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, id: &str, text: &str, metadata: Map<String, Value>);
    async fn query(
        &self,
        text: &str,
        session_id: Option<&str>,
        top_k: usize,
    ) -> Vec<(String, f64, Map<String, Value>)>;
}

/// In-process vector index: naive token-overlap scoring. Stands in when no
/// external backend is configured; also used by tests.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: Mutex<Vec<IndexEntry>>,
}

struct IndexEntry {
    id: String,
    text: String,
    metadata: Map<String, Value>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(&self, id: &str, text: &str, metadata: Map<String, Value>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.id != id);
        entries.push(IndexEntry {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
        });
    }

    async fn query(
        &self,
        text: &str,
        session_id: Option<&str>,
        top_k: usize,
    ) -> Vec<(String, f64, Map<String, Value>)> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return vec![];
        }
        let entries = self.entries.lock().unwrap();
        let mut scored: Vec<(String, f64, Map<String, Value>)> = entries
            .iter()
            .filter(|e| match session_id {
                Some(sid) => e
                    .metadata
                    .get("session_id")
                    .and_then(Value::as_str)
                    .is_some_and(|s| s == sid),
                None => true,
            })
            .filter_map(|e| {
                let entry_tokens: HashSet<String> = tokenize(&e.text).into_iter().collect();
                let hits = query_tokens
                    .iter()
                    .filter(|t| entry_tokens.contains(*t))
                    .count();
                if hits == 0 {
                    return None;
                }
                let score = hits as f64 / query_tokens.len() as f64;
                Some((e.id.clone(), score, e.metadata.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.max(1));
        scored
    }
}

/// Dialogue engine that echoes a canned acknowledgement. Used when no agent
/// backend is wired and by the scenario tests.
pub struct EchoDialogueEngine;

#[async_trait]
impl DialogueEngine for EchoDialogueEngine {
    async fn reply(
        &self,
        _session_context: &Map<String, Value>,
        transcript: &str,
    ) -> Result<(String, Option<Value>), RuntimeError> {
        Ok((format!("I heard: {transcript}"), None))
    }
}
