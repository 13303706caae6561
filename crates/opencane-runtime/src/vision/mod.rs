//! Vision ingest pipeline.
//!
//! Workers pull [`ImageJob`]s off the ingest queue and run them through:
//! asset persistence, perceptual dedup, the external vision provider, context
//! persistence, vector indexing, and finally a digest handed back to the
//! runtime for dispatch to the device.

pub mod assets;
pub mod dedup;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use opencane_protocol::envelope::now_ms;

use crate::error::RuntimeError;
use crate::ingest::{ImageJob, JobProcessor, JobStatus};
use crate::providers::{StructuredVisionResult, VectorIndex, VisionProvider};
use crate::safety::RiskLevel;
use crate::store::{lifelog, Store};

use assets::ImageAssetStore;

pub const DEGRADED_VISION_REPLY: &str =
    "I couldn't process the image clearly. Please try again.";

#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Max Hamming distance (64-bit dHash) treated as a near-duplicate.
    pub dedup_threshold: u32,
    /// How far back to look for duplicate candidates.
    pub dedup_window_ms: u64,
    pub dedup_candidates: usize,
    pub provider_timeout_ms: u64,
    /// Transient provider errors are retried this many times before the
    /// conservative degraded reply.
    pub provider_retries: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 8,
            dedup_window_ms: 30 * 60 * 1000,
            dedup_candidates: 50,
            provider_timeout_ms: 20_000,
            provider_retries: 2,
        }
    }
}

/// What the runtime speaks back to the session once a job settles.
#[derive(Debug, Clone)]
pub struct VisionDigest {
    pub session_id: String,
    pub device_id: String,
    pub trace_id: String,
    pub text: String,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub dedup: bool,
    pub failed: bool,
}

pub struct VisionPipeline {
    assets: ImageAssetStore,
    store: Arc<Store>,
    vector: Arc<dyn VectorIndex>,
    provider: Option<Arc<dyn VisionProvider>>,
    config: VisionConfig,
    digest_tx: mpsc::Sender<VisionDigest>,
}

impl VisionPipeline {
    pub fn new(
        assets: ImageAssetStore,
        store: Arc<Store>,
        vector: Arc<dyn VectorIndex>,
        provider: Option<Arc<dyn VisionProvider>>,
        config: VisionConfig,
        digest_tx: mpsc::Sender<VisionDigest>,
    ) -> Self {
        Self {
            assets,
            store,
            vector,
            provider,
            config,
            digest_tx,
        }
    }

    /// Prior non-dedup record whose hash matches the incoming image, if any.
    fn find_duplicate(
        &self,
        session_id: &str,
        dhash: Option<u64>,
        content_hash: &str,
    ) -> Option<lifelog::ImageRecord> {
        let since = now_ms().saturating_sub(self.config.dedup_window_ms);
        let candidates = lifelog::recent_images(
            &self.store.conn(),
            session_id,
            since,
            self.config.dedup_candidates,
        );
        candidates.into_iter().find(|prior| {
            if !prior.content_hash.is_empty() && prior.content_hash == content_hash {
                return true;
            }
            match (dhash, dedup::parse_dhash(&prior.dhash)) {
                (Some(current), Some(previous)) => {
                    dedup::hamming_distance(current, previous) <= self.config.dedup_threshold
                }
                _ => false,
            }
        })
    }

    async fn analyze_with_retry(
        &self,
        provider: &Arc<dyn VisionProvider>,
        job: &ImageJob,
    ) -> Result<StructuredVisionResult, RuntimeError> {
        let timeout = Duration::from_millis(self.config.provider_timeout_ms);
        let mut last_error = RuntimeError::Provider("vision provider unavailable".into());
        for attempt in 0..=self.config.provider_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            let call = provider.analyze(&job.bytes, &job.mime, job.question.as_deref());
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "vision provider attempt failed");
                    last_error = e;
                }
                Err(_) => {
                    debug!(attempt, "vision provider attempt timed out");
                    last_error = RuntimeError::Timeout(self.config.provider_timeout_ms);
                }
            }
        }
        Err(last_error)
    }

    fn record_event(
        &self,
        session_id: &str,
        event_type: &str,
        payload: Map<String, Value>,
        risk_level: RiskLevel,
        confidence: f64,
    ) {
        if let Err(e) = lifelog::add_event(
            &self.store.conn(),
            session_id,
            event_type,
            &payload,
            risk_level.as_str(),
            confidence,
            None,
        ) {
            debug!(error = %e, "lifelog event record failed");
        }
    }

    async fn publish(&self, digest: VisionDigest) {
        if self.digest_tx.send(digest).await.is_err() {
            debug!("vision digest receiver dropped");
        }
    }
}

#[async_trait]
impl JobProcessor for VisionPipeline {
    async fn process(&self, job: ImageJob) -> JobStatus {
        let ts = now_ms();
        let content_hash = dedup::content_hash(&job.bytes);
        let dhash = dedup::compute_dhash(&job.bytes);
        let dhash_text = dhash.map(dedup::dhash_hex).unwrap_or_default();

        let uri = match self
            .assets
            .persist(&job.session_id, &job.bytes, &job.mime, &content_hash, ts)
        {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, job_id = %job.job_id, "asset persistence failed");
                String::new()
            }
        };

        // Near-duplicate: reuse the prior structured result, no new VLM call
        // and no new context row.
        if let Some(prior) = self.find_duplicate(&job.session_id, dhash, &content_hash) {
            let _ = lifelog::add_image(
                &self.store.conn(),
                &job.session_id,
                &uri,
                &dhash_text,
                &content_hash,
                true,
                ts,
            );
            let prior_context = lifelog::context_by_image(&self.store.conn(), prior.id);
            let (text, risk, confidence) = match &prior_context {
                Some(context) => (
                    if context.actionable_summary.is_empty() {
                        context.semantic_summary.clone()
                    } else {
                        context.actionable_summary.clone()
                    },
                    RiskLevel::parse(&context.risk_level).unwrap_or(RiskLevel::P3),
                    context.confidence,
                ),
                None => (String::new(), RiskLevel::P3, 0.5),
            };

            let mut payload = Map::new();
            payload.insert("trace_id".into(), json!(job.trace_id));
            payload.insert("dedup".into(), json!(true));
            payload.insert("image_uri".into(), json!(uri));
            payload.insert("prior_image_id".into(), json!(prior.id));
            self.record_event(&job.session_id, "image_ingested", payload, risk, confidence);

            self.publish(VisionDigest {
                session_id: job.session_id.clone(),
                device_id: job.device_id.clone(),
                trace_id: job.trace_id.clone(),
                text,
                risk_level: risk,
                confidence,
                dedup: true,
                failed: false,
            })
            .await;
            return JobStatus::Deduped;
        }

        let Some(provider) = self.provider.clone() else {
            let mut payload = Map::new();
            payload.insert("trace_id".into(), json!(job.trace_id));
            payload.insert("reason".into(), json!("vision provider not configured"));
            self.record_event(&job.session_id, "image_ingest_failed", payload, RiskLevel::P2, 1.0);
            self.publish(VisionDigest {
                session_id: job.session_id.clone(),
                device_id: job.device_id.clone(),
                trace_id: job.trace_id.clone(),
                text: DEGRADED_VISION_REPLY.to_string(),
                risk_level: RiskLevel::P2,
                confidence: 1.0,
                dedup: false,
                failed: true,
            })
            .await;
            return JobStatus::Failed;
        };

        match self.analyze_with_retry(&provider, &job).await {
            Ok(result) => {
                let risk = result.risk_level.unwrap_or(RiskLevel::P3);
                let image_id = lifelog::add_image(
                    &self.store.conn(),
                    &job.session_id,
                    &uri,
                    &dhash_text,
                    &content_hash,
                    false,
                    ts,
                )
                .unwrap_or(0);
                if image_id > 0 {
                    let _ = lifelog::add_context(
                        &self.store.conn(),
                        image_id,
                        &result.summary,
                        &result.objects,
                        &result.ocr,
                        &result.risk_hints,
                        &result.actionable_summary,
                        risk.as_str(),
                        result.risk_score,
                        result.confidence,
                        ts,
                    );
                }

                let mut index_meta = Map::new();
                index_meta.insert("session_id".into(), json!(job.session_id));
                index_meta.insert("image_id".into(), json!(image_id));
                index_meta.insert("risk_level".into(), json!(risk.as_str()));
                self.vector
                    .add(&format!("img-{image_id}"), &result.summary, index_meta.clone())
                    .await;
                if !result.actionable_summary.is_empty() {
                    self.vector
                        .add(
                            &format!("img-{image_id}-action"),
                            &result.actionable_summary,
                            index_meta,
                        )
                        .await;
                }

                let mut payload = Map::new();
                payload.insert("trace_id".into(), json!(job.trace_id));
                payload.insert("dedup".into(), json!(false));
                payload.insert("image_uri".into(), json!(uri));
                payload.insert("image_id".into(), json!(image_id));
                payload.insert("summary".into(), json!(result.summary));
                self.record_event(
                    &job.session_id,
                    "image_ingested",
                    payload,
                    risk,
                    result.confidence,
                );

                let text = if result.actionable_summary.is_empty() {
                    result.summary.clone()
                } else {
                    result.actionable_summary.clone()
                };
                self.publish(VisionDigest {
                    session_id: job.session_id.clone(),
                    device_id: job.device_id.clone(),
                    trace_id: job.trace_id.clone(),
                    text,
                    risk_level: risk,
                    confidence: result.confidence,
                    dedup: false,
                    failed: false,
                })
                .await;
                JobStatus::Done
            }
            Err(e) => {
                warn!(error = %e, job_id = %job.job_id, "vision analysis failed");
                let mut payload = Map::new();
                payload.insert("trace_id".into(), json!(job.trace_id));
                payload.insert("error".into(), json!(e.to_string()));
                self.record_event(&job.session_id, "image_ingest_failed", payload, RiskLevel::P2, 1.0);
                self.publish(VisionDigest {
                    session_id: job.session_id.clone(),
                    device_id: job.device_id.clone(),
                    trace_id: job.trace_id.clone(),
                    text: DEGRADED_VISION_REPLY.to_string(),
                    risk_level: RiskLevel::P2,
                    confidence: 1.0,
                    dedup: false,
                    failed: true,
                })
                .await;
                JobStatus::Failed
            }
        }
    }
}
