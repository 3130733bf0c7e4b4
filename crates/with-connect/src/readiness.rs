//! Readiness detection for the Connect container.
//!
//! A [`ReadinessPoller`] repeatedly runs a [`HealthProbe`] at a fixed interval
//! until it reports healthy, reports an explicit failure, or the deadline
//! elapses. Transport errors during startup count as "not yet".

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::container::{ContainerHandle, ContainerRef, ContainerStatus, LogStream};

/// Path of Connect's unauthenticated liveness endpoint.
pub const PING_PATH: &str = "/__ping__";

/// Result type for readiness operations.
pub type ReadinessResult<T> = Result<T, ReadinessError>;

/// Errors that end readiness polling early.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The service or its container explicitly reported failure.
    #[error("service is unhealthy after {attempts} probe(s): {reason}")]
    Unhealthy { reason: String, attempts: u32 },

    /// The HTTP client could not be built.
    #[error("failed to build health probe client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Readiness of the session's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Pending,
    Ready,
    TimedOut,
}

impl ReadinessState {
    /// Ready and TimedOut end polling.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Pending)
    }
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Not ready yet; the string describes what was seen.
    NotYet(String),
    /// An explicit failure signal; polling stops.
    Unhealthy(String),
}

/// A single health check against the service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

#[async_trait]
impl<T: HealthProbe + ?Sized> HealthProbe for Arc<T> {
    async fn probe(&self) -> ProbeOutcome {
        (**self).probe().await
    }
}

/// Probe that treats any 2xx response from a URL as healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Probe `<base_url>/__ping__`.
    pub fn ping(base_url: &str, timeout: Duration) -> ReadinessResult<Self> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), PING_PATH);
        Self::new(url, timeout)
    }

    pub fn new(url: impl Into<String>, timeout: Duration) -> ReadinessResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(res) if res.status().is_success() => ProbeOutcome::Healthy,
            Ok(res) => ProbeOutcome::NotYet(format!("HTTP {}", res.status())),
            Err(e) if e.is_connect() => ProbeOutcome::NotYet("connection refused".to_string()),
            Err(e) if e.is_timeout() => ProbeOutcome::NotYet("request timed out".to_string()),
            Err(e) => ProbeOutcome::NotYet(e.to_string()),
        }
    }
}

/// Probe that first checks the container is still alive, then asks the service.
///
/// An exited or vanished container can never become ready, so it is reported
/// as an explicit failure instead of waiting out the deadline.
pub struct ContainerHealthProbe<P> {
    handle: ContainerHandle,
    container: ContainerRef,
    service: P,
}

impl<P: HealthProbe> ContainerHealthProbe<P> {
    pub fn new(handle: ContainerHandle, container: ContainerRef, service: P) -> Self {
        Self {
            handle,
            container,
            service,
        }
    }
}

#[async_trait]
impl<P: HealthProbe> HealthProbe for ContainerHealthProbe<P> {
    async fn probe(&self) -> ProbeOutcome {
        match self.handle.inspect(&self.container).await {
            Ok(ContainerStatus::Exited) => {
                return ProbeOutcome::Unhealthy(format!(
                    "container {} exited during startup",
                    self.container.short()
                ));
            }
            Ok(ContainerStatus::Missing) => {
                return ProbeOutcome::Unhealthy(format!(
                    "container {} disappeared during startup",
                    self.container.short()
                ));
            }
            Ok(ContainerStatus::Running) | Ok(ContainerStatus::Unknown) => {}
            Err(e) => debug!("inspect during readiness failed: {}", e),
        }

        self.service.probe().await
    }
}

/// Outcome of a completed poll.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub state: ReadinessState,
    pub attempts: u32,
    pub elapsed: Duration,
    /// What the last unsuccessful probe saw.
    pub last_observation: Option<String>,
}

/// Polls a probe at a fixed interval until ready or the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl ReadinessPoller {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the probe succeeds, fails explicitly, or `deadline` elapses.
    ///
    /// Returns `Ready` or `TimedOut`; an explicit failure is `Err(Unhealthy)`.
    pub async fn wait_until_ready(
        &self,
        probe: &dyn HealthProbe,
        deadline: Duration,
    ) -> ReadinessResult<Readiness> {
        let start = Instant::now();
        let mut state = ReadinessState::Pending;
        let mut attempts: u32 = 0;
        let mut last_observation = None;

        while !state.is_terminal() {
            attempts += 1;

            match probe.probe().await {
                ProbeOutcome::Healthy => {
                    state = ReadinessState::Ready;
                    continue;
                }
                ProbeOutcome::Unhealthy(reason) => {
                    return Err(ReadinessError::Unhealthy { reason, attempts });
                }
                ProbeOutcome::NotYet(observation) => {
                    debug!("not ready (attempt {}): {}", attempts, observation);
                    last_observation = Some(observation);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                state = ReadinessState::TimedOut;
                continue;
            }

            tokio::time::sleep(self.interval.min(deadline - elapsed)).await;
        }

        let elapsed = start.elapsed();
        if state == ReadinessState::Ready {
            info!("Service ready after {:.1?} ({} probe(s))", elapsed, attempts);
        }

        Ok(Readiness {
            state,
            attempts,
            elapsed,
            last_observation,
        })
    }
}

/// Background task that follows container logs and keeps the most recent lines.
///
/// Started alongside readiness polling and cancelled as soon as readiness
/// resolves, so no follower outlives the wait.
pub struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<()>,
}

impl LogTail {
    pub fn spawn(mut stream: LogStream, capacity: usize) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let sink = Arc::clone(&lines);

        let task = tokio::spawn(async move {
            while let Some(line) = stream.next().await {
                debug!(target: "with_connect::container_log", "{}", line);
                if let Ok(mut buf) = sink.lock() {
                    if buf.len() == capacity {
                        buf.pop_front();
                    }
                    if capacity > 0 {
                        buf.push_back(line);
                    }
                }
            }
        });

        Self { lines, task }
    }

    /// Stop following and return the retained lines, oldest first.
    pub fn cancel(self) -> Vec<String> {
        self.task.abort();
        self.snapshot()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
