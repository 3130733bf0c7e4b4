//! Container runtime management module.
//!
//! Provides an async interface to manage containers via Docker or Podman CLI.
//! The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;
mod handle;

pub use container::{
    ContainerConfig, ContainerState, Mount, PortMapping, validate_container_id_or_name,
    validate_env_var_key, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};
pub use handle::{ContainerHandle, ContainerRef, ContainerStatus, ProvisionError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;

/// A lazily produced sequence of container log lines.
///
/// The stream ends once the container stops and the engine closes the log.
pub type LogStream = BoxStream<'static, String>;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            other => Err(ContainerError::InvalidInput(format!(
                "unknown container runtime '{other}' (expected docker or podman)"
            ))),
        }
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Check that the engine is reachable, returning its version report.
    async fn health_check(&self) -> ContainerResult<String>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;
    /// Create (but do not start) a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    /// Current state, or `None` when the container does not exist.
    async fn container_state(&self, container_id: &str) -> ContainerResult<Option<ContainerState>>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String>;
    async fn stream_logs(&self, container_id: &str) -> ContainerResult<LogStream>;

    /// Synchronous force-removal for use from `Drop`, where no runtime is available.
    fn force_remove_blocking(&self, container_id: &str) -> ContainerResult<()>;
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::detect()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then falls back to Podman.
    pub fn detect() -> Self {
        if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else {
            // Fall back to docker, will fail at runtime with RuntimeUnavailable
            Self::with_type(RuntimeType::Docker)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Get the binary used to talk to the engine.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the engine binary and capture its output.
    ///
    /// A missing binary is reported as `RuntimeUnavailable` rather than a plain IO error.
    async fn exec(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        // Arguments may carry secrets in `-e` pairs; only the verb is logged.
        log::debug!("running {} {}", self.binary, command);

        let mut engine = Command::new(&self.binary);
        engine
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Terminal signals go to the session, never to the engine CLI.
        #[cfg(unix)]
        engine.process_group(0);

        engine
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::RuntimeUnavailable(format!(
                        "'{}' not found in PATH",
                        self.binary
                    ))
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    /// Build the `create` argument vector for a config.
    pub fn create_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut owned_args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if config.interactive {
            owned_args.push("--tty".to_string());
            owned_args.push("--interactive".to_string());
        }

        if config.privileged {
            owned_args.push("--privileged".to_string());
        }

        for port in &config.ports {
            owned_args.push("-p".to_string());
            owned_args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for mount in &config.mounts {
            owned_args.push("-v".to_string());
            owned_args.push(mount.to_volume_arg(self.runtime_type.needs_selinux_labels()));
        }

        for (key, value) in &config.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        owned_args.push(config.image.clone());
        owned_args
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let output = self.exec("version", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::RuntimeUnavailable(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect`, which works for both Docker and Podman.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let args = vec!["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.exec("image inspect", &args).await?;

        Ok(output.status.success())
    }

    /// Pull an image.
    pub async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let args = vec!["pull".to_string(), image.to_string()];
        let output = self.exec("pull", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match ContainerError::from_stderr("pull", &stderr, None) {
                ContainerError::RuntimeUnavailable(message) => {
                    Err(ContainerError::RuntimeUnavailable(message))
                }
                _ => Err(ContainerError::ImagePull {
                    image: image.to_string(),
                    message: stderr.trim().to_string(),
                }),
            };
        }

        Ok(())
    }

    /// Create a new container without starting it.
    ///
    /// The configuration is validated before creating the container to prevent
    /// injection attacks and ensure all inputs are well-formed.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = self.create_args(config);
        let output = self.exec("create", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(
                "create",
                &stderr,
                config.primary_host_port(),
            ));
        }

        // Podman may print pull progress before the ID; the ID is the last line.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();

        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "create returned no container ID".to_string(),
            ));
        }

        Ok(id)
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let args = vec!["start".to_string(), container_id.to_string()];
        let output = self.exec("start", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(
                "start",
                &stderr,
                self.published_port(container_id).await,
            ));
        }

        Ok(())
    }

    /// Host port published for a container, if any, used to classify start failures.
    async fn published_port(&self, container_id: &str) -> Option<u16> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{range $p, $b := .HostConfig.PortBindings}}{{range $b}}{{.HostPort}} {{end}}{{end}}"
                .to_string(),
            container_id.to_string(),
        ];
        let output = self.exec("inspect", &args).await.ok()?;
        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .find_map(|p| p.parse().ok())
    }

    /// Get the container state via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state(
        &self,
        container_id: &str,
    ) -> ContainerResult<Option<ContainerState>> {
        validate_container_id_or_name(container_id)?;

        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            container_id.to_string(),
        ];
        let output = self.exec("inspect", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = ContainerError::from_stderr("inspect", &stderr, None);
            return match err {
                ContainerError::RuntimeUnavailable(_) => Err(err),
                // Container not found is not an error; callers treat it as missing.
                _ => Ok(None),
            };
        }

        let status = String::from_utf8_lossy(&output.stdout);
        if status.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(ContainerState::parse(&status)))
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("stop", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr("stop", &stderr, None));
        }

        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("rm", &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr("rm", &stderr, None));
        }

        Ok(())
    }

    /// Get container logs.
    pub async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("logs", &args).await?;

        // Logs command outputs to stderr for container stderr
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("{}{}", stdout, stderr))
    }

    /// Follow container logs as a stream of lines.
    ///
    /// The `logs --follow` child is killed when the stream is dropped.
    pub async fn stream_logs(&self, container_id: &str) -> ContainerResult<LogStream> {
        validate_container_id_or_name(container_id)?;

        let mut follow = Command::new(&self.binary);
        follow
            .args(["logs", "--follow", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        follow.process_group(0);

        let mut child = follow
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::RuntimeUnavailable(format!(
                        "'{}' not found in PATH",
                        self.binary
                    ))
                } else {
                    ContainerError::Io(e)
                }
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ContainerError::ParseError("logs process has no stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ContainerError::ParseError("logs process has no stderr".to_string())
        })?;

        let lines = futures::stream::select(
            LinesStream::new(BufReader::new(stdout).lines()),
            LinesStream::new(BufReader::new(stderr).lines()),
        );

        let stream = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            loop {
                match lines.next().await {
                    Some(Ok(line)) => return Some((line, (child, lines))),
                    Some(Err(e)) => {
                        log::debug!("skipping unreadable log line: {}", e);
                        continue;
                    }
                    None => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    /// Force-remove a container from synchronous code.
    pub fn force_remove_blocking(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut rm = std::process::Command::new(&self.binary);
        rm.args(["rm", "-f", container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut rm, 0);

        let output = rm.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = ContainerError::from_stderr("rm", &stderr, None);
            if !err.is_not_found() {
                return Err(err);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn health_check(&self) -> ContainerResult<String> {
        self.health_check().await
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.image_exists(image).await
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.pull_image(image).await
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn container_state(&self, container_id: &str) -> ContainerResult<Option<ContainerState>> {
        self.container_state(container_id).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn get_logs(&self, container_id: &str, tail: Option<u32>) -> ContainerResult<String> {
        self.get_logs(container_id, tail).await
    }

    async fn stream_logs(&self, container_id: &str) -> ContainerResult<LogStream> {
        self.stream_logs(container_id).await
    }

    fn force_remove_blocking(&self, container_id: &str) -> ContainerResult<()> {
        self.force_remove_blocking(container_id)
    }
}
