//! Digital task execution: async goal execution with persistence, bounded
//! concurrency, deadlines, and reliable status pushes to the device.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opencane_protocol::envelope::now_ms;

use crate::error::RuntimeError;
use crate::providers::{StepResult, TaskStep, ToolExecutor};
use crate::store::tasks::{self, NewTask, StoredTask};
use crate::store::Store;

/// One status push destined for a device session. Delivery is attempted by
/// the runtime; the service retries and queues on failure.
#[derive(Debug, Clone)]
pub struct TaskStatusUpdate {
    pub task_id: String,
    pub device_id: String,
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub speak: bool,
    pub event: String,
}

impl TaskStatusUpdate {
    pub fn to_payload(&self) -> Value {
        json!({
            "event": self.event,
            "task_id": self.task_id,
            "status": self.status,
            "message": self.message,
            "device_id": self.device_id,
            "session_id": self.session_id,
            "speak": self.speak,
        })
    }

    pub fn from_payload(payload: &Value) -> Option<Self> {
        Some(Self {
            task_id: payload.get("task_id")?.as_str()?.to_string(),
            device_id: payload.get("device_id")?.as_str()?.to_string(),
            session_id: payload
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: payload.get("status")?.as_str()?.to_string(),
            message: payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            speak: payload.get("speak").and_then(Value::as_bool).unwrap_or(true),
            event: payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Push delivery callback installed by the runtime. Returns whether the
/// device accepted the push.
pub type StatusPushFn = Arc<dyn Fn(TaskStatusUpdate) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub default_timeout_seconds: u64,
    pub max_concurrent_tasks: usize,
    pub status_retry_count: u32,
    pub status_retry_backoff_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 120,
            max_concurrent_tasks: 4,
            status_retry_count: 2,
            status_retry_backoff_ms: 300,
        }
    }
}

/// Inputs accepted by `execute` (HTTP body or voice routing).
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub goal: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub notify: Option<bool>,
    pub speak: Option<bool>,
    pub interrupt_previous: bool,
    pub task_id: Option<String>,
    pub steps: Vec<Value>,
}

pub struct DigitalTaskService {
    store: Arc<Store>,
    mcp_executor: Option<Arc<dyn ToolExecutor>>,
    fallback_executor: Arc<dyn ToolExecutor>,
    config: TaskConfig,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    push_fn: Mutex<Option<StatusPushFn>>,
}

impl DigitalTaskService {
    pub fn new(
        store: Arc<Store>,
        mcp_executor: Option<Arc<dyn ToolExecutor>>,
        fallback_executor: Arc<dyn ToolExecutor>,
        config: TaskConfig,
    ) -> Arc<Self> {
        let permits = config.max_concurrent_tasks.max(1);
        Arc::new(Self {
            store,
            mcp_executor,
            fallback_executor,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            running: Mutex::new(HashMap::new()),
            push_fn: Mutex::new(None),
        })
    }

    /// Install the runtime's push callback.
    pub fn set_push_fn(&self, push: StatusPushFn) {
        *self.push_fn.lock().unwrap() = Some(push);
    }

    pub fn stats(&self, session_id: Option<&str>) -> Map<String, Value> {
        let mut stats = tasks::task_stats(&self.store.conn(), session_id);
        stats.insert(
            "in_flight".into(),
            json!(self.running.lock().unwrap().len()),
        );
        stats.insert(
            "max_concurrent".into(),
            json!(self.config.max_concurrent_tasks),
        );
        stats
    }

    pub fn get(&self, task_id: &str) -> Option<StoredTask> {
        tasks::get_task(&self.store.conn(), task_id)
    }

    pub fn list(
        &self,
        session_id: Option<&str>,
        status: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<StoredTask> {
        tasks::list_tasks(&self.store.conn(), session_id, status, limit, offset)
    }

    /// Create and schedule one task.
    pub async fn execute(self: &Arc<Self>, request: TaskRequest) -> Result<StoredTask, RuntimeError> {
        let goal = request.goal.trim().to_string();
        if goal.is_empty() {
            return Err(RuntimeError::InvalidControlPayload("goal is required".into()));
        }
        let task_id = request
            .task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());
        if self.get(&task_id).is_some() {
            return Err(RuntimeError::InvalidControlPayload(format!(
                "task already exists: {task_id}"
            )));
        }
        let session_id = request
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("digital-{task_id}"));
        let device_id = request.device_id.unwrap_or_default();
        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds)
            .max(1);

        // Cancel the device's previous non-terminal task before creating the
        // new one. A missing previous task is a no-op, not an error.
        if request.interrupt_previous && !device_id.is_empty() {
            let previous = tasks::active_task_for_device(&self.store.conn(), &device_id);
            if let Some(previous) = previous {
                if previous.task_id != task_id {
                    let _ = self.cancel(&previous.task_id, "interrupt_previous").await;
                }
            }
        }

        let task = tasks::create_task(
            &self.store.conn(),
            &NewTask {
                task_id: task_id.clone(),
                session_id: session_id.clone(),
                device_id: device_id.clone(),
                goal: goal.clone(),
                steps: request.steps,
                timeout_seconds,
                notify: request.notify.unwrap_or(true),
                speak: request.speak.unwrap_or(true),
            },
        )
        .map_err(|e| RuntimeError::Storage(e.to_string()))?;
        tasks::append_step(&self.store.conn(), &task_id, "accepted", "ok", "task accepted");

        // Pending push goes out before the task spawns so the device never
        // observes `running` ahead of `pending`.
        self.emit_status(&task, "pending", "Task accepted, starting now.", "accepted")
            .await;
        self.spawn_task(&task);
        Ok(self.get(&task_id).unwrap_or(task))
    }

    fn spawn_task(self: &Arc<Self>, task: &StoredTask) {
        let service = self.clone();
        let task_id = task.task_id.clone();
        let session_id = task.session_id.clone();
        let goal = task.goal.clone();
        let deadline_ms = task.deadline_ms;
        let handle = tokio::spawn(async move {
            service.run_task(&task_id, &session_id, &goal, deadline_ms).await;
        });
        self.running.lock().unwrap().insert(task.task_id.clone(), handle);
    }

    async fn run_task(self: &Arc<Self>, task_id: &str, session_id: &str, goal: &str, deadline_ms: u64) {
        // Tasks beyond the concurrency cap stay `pending` until a permit
        // frees up; the absolute deadline keeps ticking while they wait.
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let pending: HashSet<&str> = ["pending"].into();
        if !tasks::update_task_if_status(&self.store.conn(), task_id, &pending, "running", None, "") {
            self.finish_task(task_id);
            return;
        }
        tasks::append_step(&self.store.conn(), task_id, "running", "ok", "task running");
        if let Some(task) = self.get(task_id) {
            self.emit_status(&task, "running", "Task is running, one moment.", "running")
                .await;
        }

        let remaining = deadline_ms.saturating_sub(now_ms());
        let outcome = tokio::time::timeout(
            Duration::from_millis(remaining.max(1)),
            self.execute_stages(task_id, session_id, goal),
        )
        .await;
        drop(permit);

        let running: HashSet<&str> = ["running"].into();
        match outcome {
            Ok(Ok(result)) => {
                let result_value = json!({
                    "text": result.text,
                    "execution_path": result.execution_path,
                });
                if tasks::update_task_if_status(
                    &self.store.conn(),
                    task_id,
                    &running,
                    "success",
                    Some(&result_value),
                    "",
                ) {
                    tasks::append_step(
                        &self.store.conn(),
                        task_id,
                        "success",
                        "ok",
                        &result.execution_path,
                    );
                    if let Some(task) = self.get(task_id) {
                        let preview = shorten(result.text.trim(), 120);
                        let message = if preview.is_empty() {
                            "Task completed.".to_string()
                        } else {
                            format!("Task completed. {preview}")
                        };
                        self.emit_status(&task, "success", &message, "success").await;
                    }
                }
            }
            Ok(Err(e)) => {
                if tasks::update_task_if_status(
                    &self.store.conn(),
                    task_id,
                    &running,
                    "failed",
                    None,
                    &e.to_string(),
                ) {
                    tasks::append_step(&self.store.conn(), task_id, "failed", "error", &e.to_string());
                    if let Some(task) = self.get(task_id) {
                        self.emit_status(&task, "failed", "Task execution failed.", "failed")
                            .await;
                    }
                }
            }
            Err(_) => {
                let message = format!("timeout after {}ms", remaining);
                if tasks::update_task_if_status(
                    &self.store.conn(),
                    task_id,
                    &running,
                    "timeout",
                    None,
                    &message,
                ) {
                    tasks::append_step(&self.store.conn(), task_id, "timeout", "error", &message);
                    if let Some(task) = self.get(task_id) {
                        self.emit_status(&task, "timeout", "Task timed out, please retry later.", "timeout")
                            .await;
                    }
                }
            }
        }
        self.finish_task(task_id);
    }

    /// MCP-first, then the general web/exec path on any non-success outcome.
    async fn execute_stages(
        &self,
        task_id: &str,
        session_id: &str,
        goal: &str,
    ) -> Result<StepResult, RuntimeError> {
        let step = TaskStep {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            goal: goal.to_string(),
        };
        if let Some(mcp) = &self.mcp_executor {
            match mcp.execute(&step).await {
                Ok(result) if !result.needs_fallback && !result.text.trim().is_empty() => {
                    return Ok(StepResult {
                        execution_path: "mcp".into(),
                        ..result
                    });
                }
                Ok(_) => debug!(task_id, "mcp stage requested fallback"),
                Err(e) => debug!(task_id, error = %e, "mcp stage failed, falling back"),
            }
        }
        let result = self.fallback_executor.execute(&step).await?;
        Ok(StepResult {
            execution_path: if result.execution_path.is_empty() {
                "web_exec_fallback".into()
            } else {
                result.execution_path
            },
            ..result
        })
    }

    fn finish_task(&self, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
    }

    /// Cancel a non-terminal task. Terminal statuses are sinks: cancelling a
    /// finished task reports a conflict.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<StoredTask, RuntimeError> {
        let expected: HashSet<&str> = ["pending", "running"].into();
        let changed = tasks::update_task_if_status(
            &self.store.conn(),
            task_id,
            &expected,
            "canceled",
            None,
            reason,
        );
        if !changed {
            return match self.get(task_id) {
                None => Err(RuntimeError::InvalidControlPayload(format!(
                    "task not found: {task_id}"
                ))),
                Some(task) => Err(RuntimeError::InvalidControlPayload(format!(
                    "task already {}",
                    task.status
                ))),
            };
        }
        tasks::append_step(&self.store.conn(), task_id, "canceled", "ok", reason);

        // Cooperative cancellation of the in-flight tool call.
        if let Some(handle) = self.running.lock().unwrap().remove(task_id) {
            handle.abort();
        }
        let task = self.get(task_id).expect("canceled task exists");
        self.emit_status(&task, "canceled", "Task was canceled.", "canceled")
            .await;
        Ok(task)
    }

    /// Push one status transition. Retries with backoff; exhausted pushes are
    /// queued and replayed on the device's next hello.
    async fn emit_status(&self, task: &StoredTask, status: &str, message: &str, event: &str) {
        if !task.notify || task.device_id.is_empty() {
            return;
        }
        let update = TaskStatusUpdate {
            task_id: task.task_id.clone(),
            device_id: task.device_id.clone(),
            session_id: task.session_id.clone(),
            status: status.to_string(),
            message: message.to_string(),
            speak: task.speak,
            event: event.to_string(),
        };
        let push = self.push_fn.lock().unwrap().clone();
        let Some(push) = push else {
            self.queue_push(&update, "no push callback installed");
            return;
        };

        let max_attempts = self.config.status_retry_count + 1;
        for attempt in 0..max_attempts {
            if push(update.clone()).await {
                return;
            }
            if attempt + 1 < max_attempts {
                let backoff = self.config.status_retry_backoff_ms * (attempt as u64 + 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        debug!(task_id = %update.task_id, status, "status push exhausted retries, queuing");
        self.queue_push(&update, "push delivery failed");
    }

    fn queue_push(&self, update: &TaskStatusUpdate, error: &str) {
        if let Err(e) = tasks::enqueue_push(
            &self.store.conn(),
            &update.task_id,
            &update.device_id,
            &update.session_id,
            &update.status,
            &update.to_payload(),
            error,
        ) {
            warn!(error = %e, "failed to queue task push");
        }
    }

    /// Replay queued pushes for one device (called on hello).
    pub async fn flush_pending_pushes(&self, device_id: &str, limit: usize) -> (usize, usize) {
        let push = self.push_fn.lock().unwrap().clone();
        let Some(push) = push else {
            return (0, 0);
        };
        let entries = tasks::pending_pushes(&self.store.conn(), device_id, limit);
        let mut sent = 0;
        let mut retried = 0;
        for entry in entries {
            let Some(update) = entry.payload.as_ref().and_then(TaskStatusUpdate::from_payload)
            else {
                tasks::mark_push_sent(&self.store.conn(), entry.id);
                continue;
            };
            if push(update).await {
                tasks::mark_push_sent(&self.store.conn(), entry.id);
                sent += 1;
            } else {
                let delay =
                    self.config.status_retry_backoff_ms * (entry.attempts as u64 + 1).max(1);
                tasks::mark_push_retry(&self.store.conn(), entry.id, "push delivery failed", delay);
                retried += 1;
            }
        }
        (sent, retried)
    }

    /// Startup recovery: expire past-deadline tasks, reschedule the rest.
    pub async fn recover(self: &Arc<Self>, limit: usize) -> usize {
        let unfinished = tasks::list_unfinished_tasks(&self.store.conn(), limit);
        let mut recovered = 0;
        for task in unfinished {
            if self.running.lock().unwrap().contains_key(&task.task_id) {
                continue;
            }
            if task.deadline_ms <= now_ms() {
                let expected: HashSet<&str> = ["pending", "running"].into();
                if tasks::update_task_if_status(
                    &self.store.conn(),
                    &task.task_id,
                    &expected,
                    "timeout",
                    None,
                    "deadline elapsed during restart",
                ) {
                    tasks::append_step(
                        &self.store.conn(),
                        &task.task_id,
                        "timeout",
                        "error",
                        "deadline elapsed during restart",
                    );
                    if let Some(task) = self.get(&task.task_id) {
                        self.emit_status(&task, "timeout", "Task timed out, please retry later.", "timeout")
                            .await;
                    }
                }
                continue;
            }
            if task.status == "running" {
                let running: HashSet<&str> = ["running"].into();
                tasks::update_task_if_status(
                    &self.store.conn(),
                    &task.task_id,
                    &running,
                    "pending",
                    None,
                    "recovered_after_restart",
                );
            }
            tasks::append_step(
                &self.store.conn(),
                &task.task_id,
                "recovered",
                "ok",
                "task recovered after restart",
            );
            if let Some(task) = self.get(&task.task_id) {
                self.spawn_task(&task);
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "digital tasks rescheduled after restart");
        }
        recovered
    }

    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .running
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}

/// Heuristic used by the voice path to decide whether a transcript is a
/// digital-task request rather than a conversational turn.
pub fn looks_like_task_goal(transcript: &str) -> bool {
    let text = transcript.trim().to_lowercase();
    if text.is_empty() {
        return false;
    }
    const PREFIXES: &[&str] = &["help me", "please help me", "can you help me", "could you"];
    const KEYWORDS: &[&str] = &["book", "reserve", "register", "schedule", "order", "look up"];
    PREFIXES.iter().any(|p| text.starts_with(p)) || KEYWORDS.iter().any(|k| text.contains(k))
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubExecutor {
        delay_ms: u64,
        text: String,
        fail: bool,
        needs_fallback: bool,
        calls: AtomicUsize,
    }

    impl StubExecutor {
        fn ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                delay_ms: 0,
                text: text.into(),
                fail: false,
                needs_fallback: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                delay_ms,
                text: "slow result".into(),
                fail: false,
                needs_fallback: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn fallback_required() -> Arc<Self> {
            Arc::new(Self {
                delay_ms: 0,
                text: String::new(),
                fail: false,
                needs_fallback: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ToolExecutor for StubExecutor {
        async fn execute(&self, _step: &TaskStep) -> Result<StepResult, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(RuntimeError::Provider("executor failed".into()));
            }
            Ok(StepResult {
                text: self.text.clone(),
                execution_path: String::new(),
                needs_fallback: self.needs_fallback,
            })
        }
    }

    /// Collects pushes; optionally refuses the first N deliveries.
    struct PushCollector {
        updates: Mutex<Vec<TaskStatusUpdate>>,
        refuse_first: AtomicUsize,
    }

    impl PushCollector {
        fn new(refuse_first: usize) -> Arc<Self> {
            Arc::new(Self {
                updates: Mutex::new(Vec::new()),
                refuse_first: AtomicUsize::new(refuse_first),
            })
        }

        fn install(self: &Arc<Self>, service: &DigitalTaskService) {
            let collector = self.clone();
            service.set_push_fn(Arc::new(move |update| {
                let collector = collector.clone();
                Box::pin(async move {
                    if collector
                        .refuse_first
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return false;
                    }
                    collector.updates.lock().unwrap().push(update);
                    true
                })
            }));
        }

        fn statuses(&self) -> Vec<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.status.clone())
                .collect()
        }
    }

    fn service(
        mcp: Option<Arc<dyn ToolExecutor>>,
        fallback: Arc<dyn ToolExecutor>,
    ) -> Arc<DigitalTaskService> {
        let store = Arc::new(Store::new_in_memory().unwrap());
        DigitalTaskService::new(
            store,
            mcp,
            fallback,
            TaskConfig {
                status_retry_count: 1,
                status_retry_backoff_ms: 10,
                ..Default::default()
            },
        )
    }

    fn request(goal: &str, device: &str) -> TaskRequest {
        TaskRequest {
            goal: goal.into(),
            device_id: Some(device.into()),
            session_id: Some("s1".into()),
            ..Default::default()
        }
    }

    async fn wait_for_status(service: &DigitalTaskService, task_id: &str, status: &str) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if service.get(task_id).is_some_and(|t| t.status == status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task never reached {status}"));
    }

    #[tokio::test]
    async fn successful_task_pushes_each_transition_once() {
        let svc = service(None, StubExecutor::ok("booked the appointment"));
        let collector = PushCollector::new(0);
        collector.install(&svc);

        let task = svc.execute(request("book a checkup", "dev-1")).await.unwrap();
        wait_for_status(&svc, &task.task_id, "success").await;
        // Allow the final push to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(collector.statuses(), vec!["pending", "running", "success"]);
        let stored = svc.get(&task.task_id).unwrap();
        assert!(stored.result.unwrap()["text"]
            .as_str()
            .unwrap()
            .contains("booked"));
    }

    #[tokio::test]
    async fn mcp_first_with_fallback() {
        let mcp = StubExecutor::fallback_required();
        let fallback = StubExecutor::ok("done via web");
        let svc = service(Some(mcp.clone() as Arc<dyn ToolExecutor>), fallback.clone());
        let task = svc.execute(request("look up the pharmacy hours", "")).await.unwrap();
        wait_for_status(&svc, &task.task_id, "success").await;
        assert_eq!(mcp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        let stored = svc.get(&task.task_id).unwrap();
        assert_eq!(stored.result.unwrap()["execution_path"], "web_exec_fallback");
    }

    #[tokio::test]
    async fn deadline_forces_timeout() {
        let svc = service(None, StubExecutor::slow(2_000));
        let collector = PushCollector::new(0);
        collector.install(&svc);

        let started = std::time::Instant::now();
        let task = svc
            .execute(TaskRequest {
                goal: "long op".into(),
                device_id: Some("dev-1".into()),
                timeout_seconds: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_status(&svc, &task.task_id, "timeout").await;
        assert!(started.elapsed() < Duration::from_millis(1_800));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.statuses(), vec!["pending", "running", "timeout"]);
    }

    #[tokio::test]
    async fn interrupt_previous_cancels_only_existing_task() {
        let svc = service(None, StubExecutor::slow(5_000));
        let first = svc.execute(request("first goal", "dev-1")).await.unwrap();
        wait_for_status(&svc, &first.task_id, "running").await;

        // No prior task on another device: plain no-op.
        let other = svc
            .execute(TaskRequest {
                goal: "elsewhere".into(),
                device_id: Some("dev-9".into()),
                interrupt_previous: true,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_status(&svc, &other.task_id, "running").await;

        let second = svc
            .execute(TaskRequest {
                goal: "second goal".into(),
                device_id: Some("dev-1".into()),
                interrupt_previous: true,
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_status(&svc, &first.task_id, "canceled").await;
        let first_stored = svc.get(&first.task_id).unwrap();
        assert_eq!(first_stored.error, "interrupt_previous");
        assert!(svc.get(&second.task_id).is_some());
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn failed_pushes_queue_and_flush_on_hello() {
        let svc = service(None, StubExecutor::ok("ok"));
        // Refuse every delivery attempt: 3 transitions × (1 try + 1 retry).
        let collector = PushCollector::new(100);
        collector.install(&svc);

        let task = svc.execute(request("book it", "dev-1")).await.unwrap();
        wait_for_status(&svc, &task.task_id, "success").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.statuses().is_empty());

        // Device reconnects: deliveries now succeed.
        let accepting = PushCollector::new(0);
        accepting.install(&svc);
        let (sent, retried) = svc.flush_pending_pushes("dev-1", 20).await;
        assert_eq!(retried, 0);
        assert_eq!(sent, 3);
        let mut statuses = accepting.statuses();
        statuses.sort();
        assert_eq!(statuses, vec!["pending", "running", "success"]);
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_tasks() {
        let svc = service(None, StubExecutor::ok("ok"));
        let task = svc.execute(request("quick", "")).await.unwrap();
        wait_for_status(&svc, &task.task_id, "success").await;
        let err = svc.cancel(&task.task_id, "manual").await.unwrap_err();
        assert!(err.to_string().contains("already success"));
    }

    #[tokio::test]
    async fn recovery_times_out_expired_and_reschedules_rest() {
        let store = Arc::new(Store::new_in_memory().unwrap());
        // Seed one expired and one live pending task directly.
        tasks::create_task(
            &store.conn(),
            &NewTask {
                task_id: "expired".into(),
                session_id: "s1".into(),
                device_id: "dev-1".into(),
                goal: "stale".into(),
                steps: vec![],
                timeout_seconds: 1,
                notify: false,
                speak: false,
            },
        )
        .unwrap();
        store
            .conn()
            .execute("UPDATE digital_tasks SET deadline_ms = 1 WHERE task_id = 'expired'", [])
            .unwrap();
        tasks::create_task(
            &store.conn(),
            &NewTask {
                task_id: "live".into(),
                session_id: "s1".into(),
                device_id: "dev-1".into(),
                goal: "still valid".into(),
                steps: vec![],
                timeout_seconds: 600,
                notify: false,
                speak: false,
            },
        )
        .unwrap();

        let svc = DigitalTaskService::new(
            store,
            None,
            StubExecutor::ok("recovered fine") as Arc<dyn ToolExecutor>,
            TaskConfig::default(),
        );
        let recovered = svc.recover(100).await;
        assert_eq!(recovered, 1);
        assert_eq!(svc.get("expired").unwrap().status, "timeout");
        wait_for_status(&svc, "live", "success").await;
    }

    #[test]
    fn task_goal_heuristic() {
        assert!(looks_like_task_goal("help me book a dentist appointment"));
        assert!(looks_like_task_goal("please ORDER groceries for tomorrow"));
        assert!(!looks_like_task_goal("what is the weather like"));
        assert!(!looks_like_task_goal(""));
    }
}
