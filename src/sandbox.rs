//! Persistent isolated execution sessions, backed by Docker.
//!
//! A session is a long-lived container (not re-created per command) so
//! state like installed packages or running servers persists across turns
//! of one task, and across tasks that share a session key. When no Docker
//! backend is available the manager reports itself unavailable and every
//! exec returns a clearly tagged "not executed" result instead of silently
//! running on the bare host.
//!
//! Timeouts are enforced inside the container: each command runs under
//! coreutils `timeout`, because killing the `docker exec` client on the
//! host detaches the command rather than stopping it, and a detached
//! command would keep mutating the bind-mounted workspace after the loop
//! has already reported it finished. A host-side cap with a grace margin
//! backstops containers whose image lacks `timeout`.

use crate::task::{Artifact, SandboxResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Containers are named with this prefix so orphans can be swept up even
/// after a hard crash.
pub const CONTAINER_PREFIX: &str = "crucible-sbx-";

/// Directory inside the workspace that commands write artifacts into.
pub const ARTIFACTS_DIR: &str = ".crucible/artifacts";

/// Stdout/stderr are capped to keep a runaway command from flooding the
/// event stream.
const MAX_OUTPUT_LEN: usize = 50_000;

const DOCKER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Margin added to the host-side wall-clock cap. The in-container
/// `timeout` is the real enforcement; the host cap only fires when that
/// never ran.
const HOST_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Seconds `timeout` waits after TERM before escalating to KILL.
const IN_CONTAINER_KILL_GRACE: u64 = 5;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_limit: String,
    pub cpus: f64,
    /// Default wall-clock limit per exec.
    pub exec_timeout: Duration,
    /// Sessions idle longer than this are reaped.
    pub lease_ttl: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            image: "python:3.10-slim".to_string(),
            memory_limit: "512m".to_string(),
            cpus: 0.5,
            exec_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(3600),
        }
    }
}

/// Raw outcome of a capped docker invocation.
#[derive(Debug, Clone)]
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

/// The docker CLI seam. Session logic goes through this so the exec and
/// timeout paths can be driven without a daemon.
#[async_trait]
trait DockerRunner: Send + Sync {
    /// Run to completion, capturing stdout. Non-zero exit is an error.
    async fn run(&self, args: &[String]) -> Result<String>;

    /// Run with a wall-clock cap. `None` means the cap elapsed and the
    /// client process was killed.
    async fn run_capped(&self, args: &[String], cap: Duration) -> Result<Option<RawOutput>>;
}

struct CliRunner;

#[async_trait]
impl DockerRunner for CliRunner {
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run docker")?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(anyhow!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn run_capped(&self, args: &[String], cap: Duration) -> Result<Option<RawOutput>> {
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().context("failed to spawn docker")?;
        match tokio::time::timeout(cap, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("docker invocation failed")?;
                Ok(Some(RawOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

struct Session {
    /// Container name; `None` in degraded mode.
    container: Option<String>,
    workspace_root: PathBuf,
    last_used: Instant,
    /// Artifact filenames already reported, so each is returned once.
    seen_artifacts: HashSet<String>,
}

/// Owns every live session. One per engine.
pub struct SandboxManager {
    config: SandboxConfig,
    available: bool,
    runner: Arc<dyn DockerRunner>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SandboxManager {
    /// Probe for a Docker backend and build the manager. Unavailability is
    /// a policy outcome, not an error: the engine keeps running with
    /// self-verification disabled.
    pub async fn detect(config: SandboxConfig) -> Self {
        let runner: Arc<dyn DockerRunner> = Arc::new(CliRunner);
        let available = probe(runner.as_ref()).await;
        if available {
            info!("sandbox backend available");
        } else {
            warn!("no sandbox backend; commands will be skipped, not executed");
        }
        Self::assemble(config, available, runner)
    }

    /// A manager with no backend, for tests and explicit degraded mode.
    pub fn disabled(config: SandboxConfig) -> Self {
        Self::assemble(config, false, Arc::new(CliRunner))
    }

    fn assemble(config: SandboxConfig, available: bool, runner: Arc<dyn DockerRunner>) -> Self {
        SandboxManager {
            config,
            available,
            runner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn exec_timeout(&self) -> Duration {
        self.config.exec_timeout
    }

    /// Idempotent: returns an existing live session for the key or creates
    /// one. Degraded mode still registers the session so artifact scans
    /// and teardown stay uniform.
    pub async fn open(&self, key: &str, workspace_root: &Path) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(key) {
            session.last_used = Instant::now();
            return Ok(());
        }

        let container = if self.available {
            Some(self.start_container(key, workspace_root).await?)
        } else {
            None
        };
        sessions.insert(
            key.to_string(),
            Session {
                container,
                workspace_root: workspace_root.to_path_buf(),
                last_used: Instant::now(),
                seen_artifacts: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn start_container(&self, key: &str, workspace_root: &Path) -> Result<String> {
        let name = container_name(key);
        // Clear any collision left over from a previous run.
        self.runner.run(&argv(&["rm", "-f", &name])).await.ok();

        let mount = format!("{}:/workspace:rw", workspace_root.display());
        let cpus = self.config.cpus.to_string();
        let output = self
            .runner
            .run(&argv(&[
                "run",
                "-d",
                "--name",
                &name,
                "-w",
                "/workspace",
                "-v",
                &mount,
                "--memory",
                &self.config.memory_limit,
                "--cpus",
                &cpus,
                &self.config.image,
                // Keep-alive command; work happens through `docker exec`.
                "tail",
                "-f",
                "/dev/null",
            ]))
            .await
            .context("failed to start sandbox container")?;
        debug!(container = %name, id = %output.trim(), "sandbox container started");
        Ok(name)
    }

    /// Run a command inside the session, enforcing a hard wall-clock
    /// timeout inside the container. Timeout kills the command, not the
    /// session; the container stays usable for subsequent commands.
    pub async fn exec(&self, key: &str, command: &str, timeout: Duration) -> Result<SandboxResult> {
        let container = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(key)
                .ok_or_else(|| anyhow!("no open sandbox session for key '{key}'"))?;
            session.last_used = Instant::now();
            session.container.clone()
        };

        let Some(container) = container else {
            return Ok(SandboxResult {
                stderr: "not executed - no sandbox backend available".to_string(),
                skipped: true,
                ..Default::default()
            });
        };

        let secs = timeout.as_secs().max(1);
        let script = format!(
            "exec timeout -k {IN_CONTAINER_KILL_GRACE} {secs} /bin/sh -c {}",
            shell_quote(command)
        );
        let args = argv(&["exec", &container, "/bin/sh", "-lc", &script]);

        match self.runner.run_capped(&args, timeout + HOST_TIMEOUT_GRACE).await? {
            Some(raw) => {
                // coreutils timeout exits 124 after TERM, 137 after the
                // follow-up KILL.
                let timed_out = raw.exit_code == 124 || raw.exit_code == 137;
                let mut stderr = truncate_output(&String::from_utf8_lossy(&raw.stderr));
                if timed_out && stderr.is_empty() {
                    stderr = format!("command terminated after {secs}s timeout");
                }
                Ok(SandboxResult {
                    stdout: truncate_output(&String::from_utf8_lossy(&raw.stdout)),
                    stderr,
                    exit_code: raw.exit_code,
                    timed_out,
                    ..Default::default()
                })
            }
            None => {
                // The in-container timeout never fired (image without
                // coreutils, wedged exec). The client is dead but the
                // command may still be running; sweep the container so
                // nothing keeps mutating the workspace.
                warn!(container = %container, "command exceeded {secs}s cap; killing container processes");
                self.kill_all_in(&container).await;
                Ok(SandboxResult {
                    stderr: format!("command terminated after {secs}s timeout"),
                    exit_code: -1,
                    timed_out: true,
                    ..Default::default()
                })
            }
        }
    }

    /// Kill every process in the session's container except its keep-alive
    /// PID 1. Used when a task is cancelled mid-exec and as the exec
    /// backstop; the session itself stays usable.
    pub async fn interrupt(&self, key: &str) {
        let container = {
            let sessions = self.sessions.lock().await;
            sessions.get(key).and_then(|s| s.container.clone())
        };
        if let Some(container) = container {
            self.kill_all_in(&container).await;
        }
    }

    async fn kill_all_in(&self, container: &str) {
        // kill(-1) from an exec'd shell signals everything it may reach,
        // which excludes PID 1, so the keep-alive survives. The shell
        // kills itself too, so a non-zero exit here is expected.
        let args = argv(&["exec", container, "/bin/sh", "-c", "kill -KILL -1"]);
        if let Err(err) = self.runner.run(&args).await {
            debug!(container, "process sweep exit: {err:#}");
        }
    }

    /// Scan the session's artifact directory for files produced since the
    /// last scan, base64-encoded for transport.
    pub async fn collect_artifacts(&self, key: &str) -> Result<Vec<Artifact>> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| anyhow!("no open sandbox session for key '{key}'"))?;

        let dir = session.workspace_root.join(ARTIFACTS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            if !session.seen_artifacts.insert(filename.clone()) {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            artifacts.push(Artifact {
                filename,
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            });
        }
        Ok(artifacts)
    }

    /// Tear down the session's container and release its entry.
    pub async fn close(&self, key: &str) -> Result<()> {
        let session = self.sessions.lock().await.remove(key);
        if let Some(Session {
            container: Some(name),
            ..
        }) = session
        {
            self.runner
                .run(&argv(&["rm", "-f", &name]))
                .await
                .with_context(|| format!("failed to remove container {name}"))?;
            debug!(container = %name, "sandbox session closed");
        }
        Ok(())
    }

    /// Close sessions whose lease has expired. Called periodically by the
    /// engine's reaper; this is the portable replacement for tying session
    /// liveness to a parent process.
    pub async fn sweep_expired(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, s)| s.last_used.elapsed() > self.config.lease_ttl)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in expired {
            info!(key, "reaping expired sandbox session");
            if let Err(err) = self.close(&key).await {
                warn!(key, "failed to reap session: {err:#}");
            }
        }
    }

    /// Close everything, then sweep any orphaned container matching the
    /// naming convention. Catches containers left behind by a hard crash.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for key in keys {
            self.close(&key).await.ok();
        }
        if !self.available {
            return;
        }
        let filter = format!("name={CONTAINER_PREFIX}");
        if let Ok(listing) = self.runner.run(&argv(&["ps", "-aq", "--filter", &filter])).await {
            for id in listing.split_whitespace() {
                info!(id, "removing orphaned sandbox container");
                self.runner.run(&argv(&["rm", "-f", id])).await.ok();
            }
        }
    }
}

async fn probe(runner: &dyn DockerRunner) -> bool {
    matches!(
        runner.run_capped(&argv(&["info"]), DOCKER_PROBE_TIMEOUT).await,
        Ok(Some(raw)) if raw.exit_code == 0
    )
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Single-quote a string for /bin/sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Container name derived from the session key, restricted to characters
/// Docker accepts.
fn container_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    format!("{CONTAINER_PREFIX}{safe}")
}

/// Char-boundary-safe truncation of captured output.
fn truncate_output(s: &str) -> String {
    let trimmed = s.trim_end();
    if trimmed.chars().count() <= MAX_OUTPUT_LEN {
        return trimmed.to_string();
    }
    let snippet: String = trimmed.chars().take(MAX_OUTPUT_LEN).collect();
    format!("{snippet}\n\n... [output truncated]")
}
