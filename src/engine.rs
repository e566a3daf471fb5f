//! Engine: task submission, per-task event streams, shared resources.
//!
//! One engine owns one oracle, one approval sink, one sandbox manager, and
//! one checkpoint manager per workspace root. Tasks run as spawned tokio
//! tasks; callers hold a [`TaskHandle`] to consume events and to cancel.

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::events::{EventChannel, TaskEvent, TaskOutcome};
use crate::gateway::{ApprovalSink, ToolGateway};
use crate::oracle::Oracle;
use crate::orchestrator::Orchestrator;
use crate::sandbox::{SandboxConfig, SandboxManager};
use crate::task::{Task, TaskId, TaskSpec};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Caller's handle to a running task.
pub struct TaskHandle {
    pub id: TaskId,
    /// Ordered event stream. Ends with [`TaskEvent::Finished`].
    pub events: mpsc::UnboundedReceiver<TaskEvent>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Request cancellation. The loop observes it at its next suspension
    /// point; in-flight sandbox commands are killed, the session is not.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to reach a terminal state.
    pub async fn wait(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("task panicked: {err}");
                TaskOutcome::Aborted {
                    reason: format!("task panicked: {err}"),
                }
            }
        }
    }
}

pub struct Engine {
    config: Config,
    oracle: Arc<dyn Oracle>,
    approvals: Arc<dyn ApprovalSink>,
    sandbox: Arc<SandboxManager>,
    /// One checkpoint manager per workspace root, so tasks sharing a root
    /// share one mutation lock.
    checkpoints: Mutex<HashMap<PathBuf, Arc<CheckpointManager>>>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine, probing for a sandbox backend.
    pub async fn new(
        config: Config,
        oracle: Arc<dyn Oracle>,
        approvals: Arc<dyn ApprovalSink>,
    ) -> Arc<Self> {
        let sandbox_config = SandboxConfig {
            image: config.sandbox_image.clone(),
            memory_limit: config.sandbox_memory_limit.clone(),
            cpus: config.sandbox_cpus,
            exec_timeout: config.exec_timeout(),
            lease_ttl: config.session_lease(),
        };
        let sandbox = Arc::new(SandboxManager::detect(sandbox_config).await);
        Self::with_sandbox(config, oracle, approvals, sandbox)
    }

    /// Build an engine around an explicit sandbox manager.
    pub fn with_sandbox(
        config: Config,
        oracle: Arc<dyn Oracle>,
        approvals: Arc<dyn ApprovalSink>,
        sandbox: Arc<SandboxManager>,
    ) -> Arc<Self> {
        let engine = Arc::new(Engine {
            config,
            oracle,
            approvals,
            sandbox,
            checkpoints: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        });
        Engine::spawn_reaper(&engine);
        engine
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    /// Background sweep of sessions whose lease has lapsed, so a consumer
    /// that vanished without cancelling does not leak containers.
    fn spawn_reaper(engine: &Arc<Self>) {
        let sandbox = Arc::clone(&engine.sandbox);
        let shutdown = engine.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REAPER_INTERVAL) => sandbox.sweep_expired().await,
                }
            }
        });
        if let Ok(mut slot) = engine.reaper.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn checkpoints_for(&self, root: &PathBuf) -> Arc<CheckpointManager> {
        let mut map = self.checkpoints.lock().await;
        Arc::clone(
            map.entry(root.clone())
                .or_insert_with(|| Arc::new(CheckpointManager::new(root.clone()))),
        )
    }

    /// Submit a task. Returns immediately; the loop runs in the
    /// background and reports through the handle's event stream.
    pub async fn submit(&self, spec: TaskSpec) -> TaskHandle {
        let task = Task::new(spec, self.config.default_retry_budget);
        let id = task.id.clone();
        info!(task = %id, goal = %task.spec.goal, "task submitted");

        let (events, receiver) = EventChannel::new(id.clone());
        let cancel = self.shutdown.child_token();
        let gateway = ToolGateway::new(task.spec.workspace_root.clone(), Arc::clone(&self.approvals));
        let checkpoints = self.checkpoints_for(&task.spec.workspace_root).await;

        let orchestrator = Orchestrator::new(
            task,
            Arc::clone(&self.oracle),
            gateway,
            checkpoints,
            Arc::clone(&self.sandbox),
            events,
            cancel.clone(),
        );
        let join = tokio::spawn(orchestrator.run());

        TaskHandle {
            id,
            events: receiver,
            cancel,
            join,
        }
    }

    /// Cancel all tasks, stop the reaper, and tear down every session
    /// including orphans from previous runs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.reaper.lock().await.take() {
            let _ = handle.await;
        }
        self.sandbox.shutdown().await;
    }
}
