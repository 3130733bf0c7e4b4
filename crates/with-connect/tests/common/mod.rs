//! Test utilities and common setup.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use with_connect::bootstrap::{
    BOOTSTRAP_ENDPOINT, BootstrapApi, BootstrapCredential, BootstrapError, BootstrapResult,
    BootstrapSecret,
};
use with_connect::container::{
    ContainerConfig, ContainerError, ContainerHandle, ContainerResult, ContainerRuntimeApi,
    ContainerState, LogStream,
};
use with_connect::readiness::{HealthProbe, PING_PATH, ProbeOutcome, ReadinessPoller};
use with_connect::runner::CommandRunner;
use with_connect::session::{SessionConfig, SessionOrchestrator};

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    next_id: u32,
    images: HashSet<String>,
    containers: HashMap<String, ContainerState>,
    configs: Vec<ContainerConfig>,
    calls: Vec<String>,
    stops: HashMap<String, u32>,
    removals: HashMap<String, u32>,
    forced_removals: HashMap<String, u32>,
    names: HashMap<String, String>,
}

impl FakeState {
    /// Resolve a container name to its id, like the engine CLI does.
    fn resolve(&self, key: &str) -> String {
        self.names.get(key).cloned().unwrap_or_else(|| key.to_string())
    }
}

/// In-memory container engine.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    unavailable: bool,
    fail_pull: bool,
    fail_start: bool,
    exit_on_start: bool,
    lose_create_reply: bool,
    logs: Vec<String>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine cannot be reached.
    pub fn unreachable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Image pulls fail.
    pub fn failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    /// Containers are created but fail to start.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Containers exit right after starting.
    pub fn exiting_on_start(mut self) -> Self {
        self.exit_on_start = true;
        self
    }

    /// The engine creates the container but the CLI call still fails,
    /// as when `create` is killed mid-flight.
    pub fn losing_create_reply(mut self) -> Self {
        self.lose_create_reply = true;
        self
    }

    /// Log lines every container reports.
    pub fn with_logs(mut self, lines: &[&str]) -> Self {
        self.logs = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    /// Verbs invoked so far, e.g. `create`, `start`, `rm`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.state.lock().unwrap().configs.clone()
    }

    pub fn last_config(&self) -> Option<ContainerConfig> {
        self.state.lock().unwrap().configs.last().cloned()
    }

    /// Containers that still exist, running or not.
    pub fn existing(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn running(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|s| **s == ContainerState::Running)
            .count()
    }

    pub fn removals(&self, id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.removals.get(id).copied().unwrap_or(0)
            + state.forced_removals.get(id).copied().unwrap_or(0)
    }

    pub fn forced_removals(&self, id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .forced_removals
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stops(&self, id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .stops
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Mark a container exited, as if its process died.
    pub fn kill(&self, id: &str) {
        if let Some(state) = self.state.lock().unwrap().containers.get_mut(id) {
            *state = ContainerState::Exited;
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn health_check(&self) -> ContainerResult<String> {
        self.record("version");
        if self.unavailable {
            return Err(ContainerError::RuntimeUnavailable(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        Ok("fake 1.0".to_string())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.record("image inspect");
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.record("pull");
        if self.fail_pull {
            return Err(ContainerError::ImagePull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let mut state = self.state.lock().unwrap();
        state.calls.push("create".to_string());
        state.next_id += 1;
        let id = format!("fake{:08}", state.next_id);
        state.containers.insert(id.clone(), ContainerState::Created);
        state.configs.push(config.clone());
        if let Some(ref name) = config.name {
            state.names.insert(name.clone(), id.clone());
        }
        if self.lose_create_reply {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "signal: interrupt".to_string(),
            });
        }
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.record("start");
        if self.fail_start {
            return Err(ContainerError::PortConflict {
                port: 3939,
                message: "port is already allocated".to_string(),
            });
        }
        let next = if self.exit_on_start {
            ContainerState::Exited
        } else {
            ContainerState::Running
        };
        match self.state.lock().unwrap().containers.get_mut(container_id) {
            Some(state) => {
                *state = next;
                Ok(())
            }
            None => Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: format!("No such container: {container_id}"),
            }),
        }
    }

    async fn container_state(&self, container_id: &str) -> ContainerResult<Option<ContainerState>> {
        let state = self.state.lock().unwrap();
        let id = state.resolve(container_id);
        Ok(state.containers.get(&id).copied())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stop".to_string());
        let id = state.resolve(container_id);
        *state.stops.entry(id.clone()).or_default() += 1;
        if let Some(s) = state.containers.get_mut(&id) {
            *s = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rm".to_string());
        let id = state.resolve(container_id);
        *state.removals.entry(id.clone()).or_default() += 1;
        state.containers.remove(&id);
        Ok(())
    }

    async fn get_logs(&self, _container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        let skip = tail
            .map(|t| self.logs.len().saturating_sub(t as usize))
            .unwrap_or(0);
        Ok(self.logs[skip..].join("\n"))
    }

    async fn stream_logs(&self, _container_id: &str) -> ContainerResult<LogStream> {
        Ok(futures::stream::iter(self.logs.clone()).boxed())
    }

    fn force_remove_blocking(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("rm -f".to_string());
        let id = state.resolve(container_id);
        *state.forced_removals.entry(id.clone()).or_default() += 1;
        state.containers.remove(&id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

struct CapturingLogger {
    lines: Mutex<Vec<String>>,
}

static LOGGER: CapturingLogger = CapturingLogger {
    lines: Mutex::new(Vec::new()),
};
static INSTALL_LOGGER: std::sync::Once = std::sync::Once::new();

impl log::Log for CapturingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("{} {}", record.level(), record.args()));
    }

    fn flush(&self) {}
}

/// Route `log` records of this test binary into memory.
pub fn capture_logs() {
    INSTALL_LOGGER.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
    });
}

/// Captured messages at `level` containing `needle`.
pub fn logged(level: log::Level, needle: &str) -> Vec<String> {
    let prefix = format!("{level} ");
    LOGGER
        .lines
        .lock()
        .unwrap()
        .iter()
        .filter_map(|line| line.strip_prefix(&prefix))
        .filter(|message| message.contains(needle))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Health probe and bootstrap
// ---------------------------------------------------------------------------

/// Probe that turns healthy after a fixed number of attempts, or never.
pub struct ScriptedProbe {
    calls: AtomicU32,
    healthy_on: Option<u32>,
}

impl ScriptedProbe {
    pub fn healthy_after(attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            healthy_on: Some(attempts),
        })
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            healthy_on: None,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> ProbeOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.healthy_on.is_some_and(|h| n >= h) {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::NotYet("connection refused".to_string())
        }
    }
}

/// Bootstrap double that returns a fixed key or a fixed HTTP failure.
pub struct FakeBootstrap {
    calls: AtomicU32,
    reject_with: Option<u16>,
    api_key: String,
    secrets: Mutex<Vec<String>>,
}

impl FakeBootstrap {
    pub fn ok(api_key: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            reject_with: None,
            api_key: api_key.to_string(),
            secrets: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            reject_with: Some(status),
            api_key: String::new(),
            secrets: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Base64 secrets the bootstrap was asked to sign with.
    pub fn secrets(&self) -> Vec<String> {
        self.secrets.lock().unwrap().clone()
    }
}

#[async_trait]
impl BootstrapApi for FakeBootstrap {
    async fn bootstrap(
        &self,
        base_url: &str,
        secret: &BootstrapSecret,
    ) -> BootstrapResult<BootstrapCredential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.secrets.lock().unwrap().push(secret.to_base64());
        match self.reject_with {
            Some(status) => Err(BootstrapError::Rejected {
                status,
                message: "bootstrap already completed".to_string(),
            }),
            None => Ok(BootstrapCredential {
                server_url: base_url.to_string(),
                api_key: self.api_key.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake Connect HTTP server
// ---------------------------------------------------------------------------

/// Behaviour and recorded traffic of the fake Connect server.
#[derive(Default)]
pub struct ConnectState {
    /// Pings answered with 503 before the first 200.
    pub unready_pings: u32,
    /// Status for the bootstrap endpoint; 200 when unset.
    pub bootstrap_status: Option<u16>,
    /// Raw body for the bootstrap endpoint when set.
    pub bootstrap_body: Option<String>,
    pub api_key: String,
    pub pings: AtomicU32,
    pub bootstrap_calls: AtomicU32,
    pub authorizations: Mutex<Vec<String>>,
}

pub struct FakeConnect {
    pub base_url: String,
    pub port: u16,
    pub state: Arc<ConnectState>,
}

impl FakeConnect {
    pub fn authorizations(&self) -> Vec<String> {
        self.state.authorizations.lock().unwrap().clone()
    }

    pub fn bootstrap_calls(&self) -> u32 {
        self.state.bootstrap_calls.load(Ordering::SeqCst)
    }
}

async fn ping(State(state): State<Arc<ConnectState>>) -> StatusCode {
    let n = state.pings.fetch_add(1, Ordering::SeqCst);
    if n < state.unready_pings {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn bootstrap(State(state): State<Arc<ConnectState>>, headers: HeaderMap) -> impl IntoResponse {
    state.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        state
            .authorizations
            .lock()
            .unwrap()
            .push(value.to_string());
    }

    let status = state
        .bootstrap_status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);

    let body = match state.bootstrap_body {
        Some(ref body) => body.clone(),
        None if status.is_success() => json!({ "api_key": state.api_key }).to_string(),
        None => json!({ "code": 4, "error": "bootstrap already completed" }).to_string(),
    };

    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
}

/// Start a fake Connect server on an ephemeral port.
pub async fn spawn_fake_connect(state: ConnectState) -> FakeConnect {
    spawn_fake_connect_with(state, true).await
}

/// Start a fake server; without the bootstrap route when `with_bootstrap` is false.
pub async fn spawn_fake_connect_with(state: ConnectState, with_bootstrap: bool) -> FakeConnect {
    let state = Arc::new(state);
    let mut app = Router::new().route(PING_PATH, get(ping));
    if with_bootstrap {
        app = app.route(BOOTSTRAP_ENDPOINT, post(bootstrap));
    }
    let app = app.with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    FakeConnect {
        base_url: format!("http://127.0.0.1:{port}"),
        port,
        state,
    }
}

// ---------------------------------------------------------------------------
// Session fixtures
// ---------------------------------------------------------------------------

pub fn license_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".lic")
        .tempfile()
        .unwrap();
    writeln!(file, "fake license").unwrap();
    file
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn session_config(license: &Path, command: &[&str]) -> SessionConfig {
    SessionConfig {
        license: license.to_path_buf(),
        host_port: free_port(),
        command: command.iter().map(|s| s.to_string()).collect(),
        readiness_timeout: Duration::from_secs(5),
        log_tail_lines: 10,
        ..SessionConfig::default()
    }
}

pub fn orchestrator(
    runtime: Arc<FakeRuntime>,
    bootstrap: Arc<dyn BootstrapApi>,
    probe: Arc<dyn HealthProbe>,
) -> SessionOrchestrator {
    SessionOrchestrator::new(ContainerHandle::new(runtime), bootstrap)
        .with_poller(ReadinessPoller::new(Duration::from_millis(20)))
        .with_runner(CommandRunner::new(Duration::from_secs(5)))
        .with_service_probe(probe)
}

/// Shell command list for `sh -c <script>`.
pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

pub fn read_to_string(path: &PathBuf) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
