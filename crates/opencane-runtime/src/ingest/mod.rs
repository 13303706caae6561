//! Bounded image-ingest queue with a fixed worker pool.
//!
//! Producers enqueue [`ImageJob`]s from the runtime and the HTTP surface;
//! workers drain them through the vision pipeline. The queue is the
//! backpressure point: an explicit overflow policy decides what happens at
//! capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opencane_protocol::envelope::now_ms;

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Reject,
    Wait,
    DropOldest,
}

impl OverflowPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(OverflowPolicy::Reject),
            "wait" => Some(OverflowPolicy::Wait),
            "drop_oldest" => Some(OverflowPolicy::DropOldest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Deduped,
    Rejected,
    Failed,
}

/// One image awaiting vision processing. Owned by the queue until a worker
/// takes it; the owning worker is the only mutator after that.
#[derive(Debug, Clone)]
pub struct ImageJob {
    pub job_id: String,
    pub session_id: String,
    pub device_id: String,
    pub bytes: Vec<u8>,
    pub mime: String,
    pub question: Option<String>,
    pub trace_id: String,
    pub enqueued_at_ms: u64,
    pub status: JobStatus,
}

impl ImageJob {
    pub fn new(
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        bytes: Vec<u8>,
        mime: impl Into<String>,
        question: Option<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            device_id: device_id.into(),
            bytes,
            mime: mime.into(),
            question,
            trace_id: trace_id.into(),
            enqueued_at_ms: now_ms(),
            status: JobStatus::Queued,
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    rejected: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    deduped: AtomicU64,
    processing_ms_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub rejected_total: u64,
    pub dropped_total: u64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub deduped_total: u64,
    pub avg_processing_ms: f64,
    pub workers: usize,
}

impl QueueStats {
    pub fn to_json(&self) -> Value {
        json!({
            "depth": self.depth,
            "max_size": self.capacity,
            "utilization": self.utilization,
            "rejected_total": self.rejected_total,
            "dropped_total": self.dropped_total,
            "processed_total": self.processed_total,
            "failed_total": self.failed_total,
            "deduped_total": self.deduped_total,
            "avg_processing_ms": self.avg_processing_ms,
            "workers": self.workers,
        })
    }
}

struct Inner {
    queue: VecDeque<ImageJob>,
    closed: bool,
    in_flight: usize,
}

/// What a worker does with one job.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    /// Returns the terminal status and how long processing took.
    async fn process(&self, job: ImageJob) -> JobStatus;
}

pub struct IngestQueue {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
    space: Arc<Notify>,
    capacity: usize,
    policy: OverflowPolicy,
    worker_count: usize,
    metrics: Metrics,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
                in_flight: 0,
            }),
            notify: Arc::new(Notify::new()),
            space: Arc::new(Notify::new()),
            capacity: capacity.max(1),
            policy,
            worker_count: worker_count.max(1),
            metrics: Metrics::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue one job, applying the overflow policy at capacity.
    pub async fn enqueue(&self, job: ImageJob) -> Result<(), RuntimeError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return Err(RuntimeError::QueueFull);
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(job);
                    drop(inner);
                    self.notify.notify_one();
                    return Ok(());
                }
                match self.policy {
                    OverflowPolicy::Reject => {
                        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(RuntimeError::QueueFull);
                    }
                    OverflowPolicy::DropOldest => {
                        inner.queue.pop_front();
                        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        inner.queue.push_back(job);
                        drop(inner);
                        self.notify.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::Wait => {}
                }
            }
            // Wait policy: block until a worker frees a slot.
            self.space.notified().await;
        }
    }

    async fn next_job(&self) -> Option<ImageJob> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(mut job) = inner.queue.pop_front() {
                    job.status = JobStatus::Processing;
                    inner.in_flight += 1;
                    drop(inner);
                    self.space.notify_one();
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Start the worker pool. Call once.
    pub fn spawn_workers(self: &Arc<Self>, processor: Arc<dyn JobProcessor>) {
        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.worker_count {
            let queue = self.clone();
            let processor = processor.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "ingest worker started");
                while let Some(job) = queue.next_job().await {
                    let started = now_ms();
                    let job_id = job.job_id.clone();
                    let status = processor.process(job).await;
                    let elapsed = now_ms().saturating_sub(started);
                    queue.record_outcome(status, elapsed);
                    debug!(worker_id, job_id = %job_id, ?status, elapsed_ms = elapsed, "ingest job finished");
                    {
                        let mut inner = queue.inner.lock().unwrap();
                        inner.in_flight -= 1;
                    }
                }
                debug!(worker_id, "ingest worker stopped");
            }));
        }
        info!(workers = self.worker_count, capacity = self.capacity, "ingest queue started");
    }

    fn record_outcome(&self, status: JobStatus, elapsed_ms: u64) {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .processing_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        match status {
            JobStatus::Failed => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Deduped => {
                self.metrics.deduped.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Remove not-yet-started jobs for one session. In-flight jobs run to
    /// completion.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.queue.len();
        inner.queue.retain(|job| job.session_id != session_id);
        let removed = before - inner.queue.len();
        if removed > 0 {
            drop(inner);
            self.space.notify_one();
        }
        removed
    }

    /// Close the queue and drain workers within the grace period, then abort.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.space.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        let drain = async {
            for handle in &handles {
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    // Wake any worker still parked on the notify.
                    self.notify.notify_waiters();
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("ingest shutdown grace elapsed, interrupting workers");
            for handle in &handles {
                handle.abort();
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let processed = self.metrics.processed.load(Ordering::Relaxed);
        let total_ms = self.metrics.processing_ms_total.load(Ordering::Relaxed);
        QueueStats {
            depth: inner.queue.len(),
            capacity: self.capacity,
            utilization: inner.queue.len() as f64 / self.capacity as f64,
            rejected_total: self.metrics.rejected.load(Ordering::Relaxed),
            dropped_total: self.metrics.dropped.load(Ordering::Relaxed),
            processed_total: processed,
            failed_total: self.metrics.failed.load(Ordering::Relaxed),
            deduped_total: self.metrics.deduped.load(Ordering::Relaxed),
            avg_processing_ms: if processed > 0 {
                total_ms as f64 / processed as f64
            } else {
                0.0
            },
            workers: self.worker_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProcessor {
        seen: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait::async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, _job: ImageJob) -> JobStatus {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            JobStatus::Done
        }
    }

    fn job(session: &str) -> ImageJob {
        ImageJob::new(session, "dev-1", vec![1, 2, 3], "image/jpeg", None, "t-1")
    }

    #[tokio::test]
    async fn reject_policy_fails_at_exact_capacity() {
        let queue = IngestQueue::new(2, OverflowPolicy::Reject, 1);
        queue.enqueue(job("s1")).await.unwrap();
        queue.enqueue(job("s1")).await.unwrap();
        let err = queue.enqueue(job("s1")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::QueueFull));
        let stats = queue.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.rejected_total, 1);
        assert!((stats.utilization - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn drop_oldest_policy_keeps_newest() {
        let queue = IngestQueue::new(2, OverflowPolicy::DropOldest, 1);
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();
        queue.enqueue(job("c")).await.unwrap();
        let stats = queue.stats();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.dropped_total, 1);
        let remaining: Vec<String> = queue
            .inner
            .lock()
            .unwrap()
            .queue
            .iter()
            .map(|j| j.session_id.clone())
            .collect();
        assert_eq!(remaining, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn workers_drain_jobs() {
        let queue = IngestQueue::new(8, OverflowPolicy::Reject, 2);
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
            delay_ms: 0,
        });
        queue.spawn_workers(processor.clone());
        for _ in 0..5 {
            queue.enqueue(job("s1")).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while processor.seen.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.stats().processed_total, 5);
        queue.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn wait_policy_blocks_until_space() {
        let queue = IngestQueue::new(1, OverflowPolicy::Wait, 1);
        queue.enqueue(job("s1")).await.unwrap();
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
            delay_ms: 10,
        });
        queue.spawn_workers(processor);
        // Second enqueue must wait for the worker to free the slot, then land.
        tokio::time::timeout(Duration::from_secs(2), queue.enqueue(job("s1")))
            .await
            .expect("wait-policy enqueue should unblock")
            .unwrap();
        queue.shutdown(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn session_close_cancels_only_queued_jobs() {
        let queue = IngestQueue::new(8, OverflowPolicy::Reject, 1);
        queue.enqueue(job("keep")).await.unwrap();
        queue.enqueue(job("drop")).await.unwrap();
        queue.enqueue(job("drop")).await.unwrap();
        assert_eq!(queue.cancel_session("drop"), 2);
        assert_eq!(queue.stats().depth, 1);
    }
}
