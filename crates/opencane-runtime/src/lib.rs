//! OpenCane device-session runtime.
//!
//! Wires the transport adapter, session manager, voice/vision pipelines,
//! digital-task executor, safety gate, store, and the control HTTP surface
//! into one process. `run_runtime` blocks until shutdown.

pub mod adapter;
pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod ingest;
pub mod observability;
pub mod providers;
pub mod safety;
pub mod session;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod vision;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use adapter::mock::MockAdapter;
use adapter::mqtt::{GenericMqttAdapter, MqttConnection};
use adapter::websocket::WebSocketAdapter;
use adapter::GatewayAdapter;
use audio::AudioPipeline;
use config::Configuration;
use connection::ConnectionRuntime;
use ingest::IngestQueue;
use observability::{observability_payload, ObservabilityThresholds};
use providers::{EchoDialogueEngine, InMemoryVectorIndex, StepResult, TaskStep, ToolExecutor, VectorIndex};
use safety::{SafetyGate, SafetyGateConfig};
use session::SessionManager;
use store::Store;
use task::DigitalTaskService;
use vision::assets::ImageAssetStore;
use vision::VisionPipeline;
use web::{AppState, SecurityState};
use web::security::{RequestRateLimiter, RequestReplayProtector};

/// Startup failures that map to distinct process exit codes.
#[derive(Debug)]
pub enum StartupError {
    /// Exit code 2: a dependency failed while strict startup was requested.
    StrictDependency(anyhow::Error),
    /// Exit code 1 territory: anything else fatal during boot.
    Fatal(anyhow::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::StrictDependency(e) => write!(f, "strict startup failure: {e:#}"),
            StartupError::Fatal(e) => write!(f, "{e:#}"),
        }
    }
}

/// Tool executor used when no agent backend is wired in. Tasks complete with
/// an explicit "not configured" result instead of hanging.
struct UnconfiguredToolExecutor;

#[async_trait::async_trait]
impl ToolExecutor for UnconfiguredToolExecutor {
    async fn execute(&self, step: &TaskStep) -> Result<StepResult, error::RuntimeError> {
        Ok(StepResult {
            text: format!("No tool backend is configured; goal was recorded: {}", step.goal),
            execution_path: "unconfigured".into(),
            needs_fallback: false,
        })
    }
}

/// Build and run the whole runtime until a shutdown signal.
pub async fn run_runtime(config: Configuration) -> Result<(), StartupError> {
    info!(
        adapter = %config.adapter,
        profile = %config.profile.name,
        listen = %format!("{}:{}", config.listen_host, config.listen_port),
        strict = config.strict_startup,
        "starting opencane runtime"
    );

    // Store: fatal under strict startup, degraded (in-memory) otherwise.
    let store = match Store::new(&config.db_path.to_string_lossy()) {
        Ok(store) => Arc::new(store),
        Err(e) if config.strict_startup => {
            return Err(StartupError::StrictDependency(e));
        }
        Err(e) => {
            warn!(error = %e, "persistent store unavailable, continuing in memory");
            Arc::new(
                Store::new_in_memory()
                    .context("in-memory store fallback failed")
                    .map_err(StartupError::Fatal)?,
            )
        }
    };

    // Transport adapter.
    let mut mock_adapter: Option<Arc<MockAdapter>> = None;
    let gateway: Arc<dyn GatewayAdapter> = match config.adapter.as_str() {
        "mock" => {
            let mock = Arc::new(MockAdapter::new());
            mock_adapter = Some(mock.clone());
            mock
        }
        "websocket" => Arc::new(WebSocketAdapter::new(config.websocket_bind.clone())),
        // generic_mqtt and the legacy ec600 alias share the implementation;
        // the profile (fixed for ec600) carries the differences.
        "generic_mqtt" | "ec600" => Arc::new(GenericMqttAdapter::new(
            config.profile.clone(),
            MqttConnection {
                host: config.mqtt_host.clone(),
                port: config.mqtt_port,
                client_id: config.mqtt_client_id.clone(),
                username: config.mqtt_username.clone(),
                password: config.mqtt_password.clone(),
            },
        )),
        other => {
            return Err(StartupError::Fatal(anyhow::anyhow!(
                "unsupported adapter: {other}"
            )))
        }
    };

    let sessions = Arc::new(SessionManager::new(Some(store.clone()), 64, 32));
    let audio = Arc::new(AudioPipeline::new(config.audio.clone(), None));
    let vector: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::default());

    // Image ingest: bounded queue feeding the vision pipeline workers.
    let (digest_tx, digest_rx) = mpsc::channel(64);
    let ingest = IngestQueue::new(
        config.ingest_capacity,
        config.ingest_overflow_policy,
        config.ingest_workers,
    );
    let vision_pipeline = Arc::new(VisionPipeline::new(
        ImageAssetStore::new(&config.assets_root, 5_000, 100),
        store.clone(),
        vector.clone(),
        None,
        config.vision.clone(),
        digest_tx,
    ));
    ingest.spawn_workers(vision_pipeline);

    let tasks = DigitalTaskService::new(
        store.clone(),
        None,
        Arc::new(UnconfiguredToolExecutor),
        config.tasks.clone(),
    );

    let runtime = ConnectionRuntime::new(
        gateway,
        sessions,
        audio,
        Arc::new(EchoDialogueEngine),
        None,
        SafetyGate::new(SafetyGateConfig::default()),
        ingest.clone(),
        Some(tasks.clone()),
        store.clone(),
        config.connection.clone(),
        digest_rx,
    );
    runtime
        .start()
        .await
        .map_err(|e| match config.strict_startup {
            true => StartupError::StrictDependency(anyhow::anyhow!(e)),
            false => StartupError::Fatal(anyhow::anyhow!(e)),
        })?;

    let recovered = tasks.recover(200).await;
    if recovered > 0 {
        info!(recovered, "digital tasks recovered");
    }

    // Observability sampler: persisted trend points for the history endpoint.
    let thresholds = ObservabilityThresholds::default();
    {
        let runtime = runtime.clone();
        let store = store.clone();
        let thresholds = thresholds.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let payload = observability_payload(&runtime.runtime_status(), &thresholds);
                let ts = opencane_protocol::envelope::now_ms();
                if let Err(e) = store::lifelog::add_observability_sample(&store.conn(), ts, &payload)
                {
                    warn!(error = %e, "observability sample persist failed");
                }
            }
        });
    }

    // Control HTTP surface.
    let app_state = AppState {
        runtime: runtime.clone(),
        tasks: tasks.clone(),
        store: store.clone(),
        vector,
        mock_adapter,
        auth_token: config.auth_token.clone(),
        security: Arc::new(SecurityState {
            rate_limiter: RequestRateLimiter::new(600, 120),
            replay_protector: config
                .replay_protection
                .then(|| RequestReplayProtector::new(config.replay_window_seconds)),
        }),
        thresholds,
    };
    let router = web::build_router(app_state);
    let listen_addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind control listener on {listen_addr}"))
        .map_err(|e| {
            if config.strict_startup {
                StartupError::StrictDependency(e)
            } else {
                StartupError::Fatal(e)
            }
        })?;
    info!(addr = %listen_addr, "control api listening");

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_for_server = shutdown_notify.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_server.notified().await;
            })
            .await
    });

    shutdown_signal().await;

    info!("shutting down");
    runtime.stop().await;
    ingest.shutdown(Duration::from_secs(5)).await;
    tasks.shutdown().await;
    shutdown_notify.notify_one();
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        warn!("graceful shutdown timed out, forcing exit");
    }
    info!("runtime stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
