//! Session-scoped capability over the container runtime.
//!
//! Wraps a [`ContainerRuntimeApi`] with the lifecycle semantics a session
//! needs: image preparation, create-then-start provisioning that reports a
//! half-created container, coarse status inspection, and idempotent teardown.

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

use super::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerState,
    LogStream,
};

/// Opaque identifier of a container owned by one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(String);

impl ContainerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse container status used for control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    /// The container no longer exists.
    Missing,
    Unknown,
}

impl From<Option<ContainerState>> for ContainerStatus {
    fn from(state: Option<ContainerState>) -> Self {
        match state {
            None => ContainerStatus::Missing,
            Some(ContainerState::Running)
            | Some(ContainerState::Paused)
            | Some(ContainerState::Restarting) => ContainerStatus::Running,
            Some(ContainerState::Exited) | Some(ContainerState::Dead) => ContainerStatus::Exited,
            Some(ContainerState::Created)
            | Some(ContainerState::Removing)
            | Some(ContainerState::Unknown) => ContainerStatus::Unknown,
        }
    }
}

/// Provisioning failure, carrying the container if it was created before failing.
#[derive(Debug)]
pub struct ProvisionError {
    pub created: Option<ContainerRef>,
    pub source: ContainerError,
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.created {
            Some(ref container) => write!(
                f,
                "container {} created but failed to start: {}",
                container.short(),
                self.source
            ),
            None => write!(f, "{}", self.source),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Container lifecycle operations for a single session.
#[derive(Clone)]
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntimeApi>,
    stop_timeout_seconds: u32,
}

impl ContainerHandle {
    /// Default grace period given to the container on stop.
    pub const DEFAULT_STOP_TIMEOUT_SECONDS: u32 = 10;

    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>) -> Self {
        Self {
            runtime,
            stop_timeout_seconds: Self::DEFAULT_STOP_TIMEOUT_SECONDS,
        }
    }

    pub fn with_stop_timeout(mut self, seconds: u32) -> Self {
        self.stop_timeout_seconds = seconds;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    /// Make sure the image is present locally, pulling it when absent.
    pub async fn ensure_image(&self, image: &str) -> ContainerResult<()> {
        self.runtime.health_check().await?;

        if self.runtime.image_exists(image).await? {
            debug!("image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}...", image);
        self.runtime.pull_image(image).await?;
        info!("Pulled image {}", image);
        Ok(())
    }

    /// Create and start a container.
    ///
    /// A container that was created but failed to start is returned in the
    /// error so the caller can still tear it down.
    pub async fn provision(&self, config: &ContainerConfig) -> Result<ContainerRef, ProvisionError> {
        let id = self
            .runtime
            .create_container(config)
            .await
            .map_err(|source| ProvisionError {
                created: None,
                source,
            })?;
        let container = ContainerRef::new(id);
        debug!("created container {}", container.short());

        if let Err(source) = self.runtime.start_container(container.as_str()).await {
            return Err(ProvisionError {
                created: Some(container),
                source,
            });
        }

        info!(
            "Started container {} from {}",
            container.short(),
            config.image
        );
        Ok(container)
    }

    /// Non-blocking status check.
    pub async fn inspect(&self, container: &ContainerRef) -> ContainerResult<ContainerStatus> {
        let state = self.runtime.container_state(container.as_str()).await?;
        Ok(ContainerStatus::from(state))
    }

    /// Stop the container; a no-op when it is already stopped or gone.
    pub async fn stop(&self, container: &ContainerRef) -> ContainerResult<()> {
        match self.inspect(container).await? {
            ContainerStatus::Missing | ContainerStatus::Exited => return Ok(()),
            ContainerStatus::Running | ContainerStatus::Unknown => {}
        }

        match self
            .runtime
            .stop_container(container.as_str(), Some(self.stop_timeout_seconds))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Remove the container; a no-op when it is already gone.
    pub async fn remove(&self, container: &ContainerRef) -> ContainerResult<()> {
        if self.inspect(container).await? == ContainerStatus::Missing {
            return Ok(());
        }

        match self.runtime.remove_container(container.as_str(), true).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Stop then remove. Removal is attempted even when stop fails.
    pub async fn teardown(&self, container: &ContainerRef) -> ContainerResult<()> {
        if let Err(e) = self.stop(container).await {
            warn!(
                "Stop container {} failed, forcing removal: {}",
                container.short(),
                e
            );
        }
        self.remove(container).await
    }

    /// Follow the container's log output.
    pub async fn stream_logs(&self, container: &ContainerRef) -> ContainerResult<LogStream> {
        self.runtime.stream_logs(container.as_str()).await
    }

    /// The last `tail` log lines, for diagnostics. Errors yield an empty list.
    pub async fn recent_logs(&self, container: &ContainerRef, tail: u32) -> Vec<String> {
        match self.runtime.get_logs(container.as_str(), Some(tail)).await {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(e) => {
                debug!("could not read logs of {}: {}", container.short(), e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ContainerStatus::from(None), ContainerStatus::Missing);
        assert_eq!(
            ContainerStatus::from(Some(ContainerState::Running)),
            ContainerStatus::Running
        );
        assert_eq!(
            ContainerStatus::from(Some(ContainerState::Dead)),
            ContainerStatus::Exited
        );
        assert_eq!(
            ContainerStatus::from(Some(ContainerState::Created)),
            ContainerStatus::Unknown
        );
    }

    #[test]
    fn container_ref_short_form() {
        let container = ContainerRef::new("0123456789abcdef0123");
        assert_eq!(container.short(), "0123456789ab");
        assert_eq!(ContainerRef::new("abc").short(), "abc");
    }

    #[test]
    fn provision_error_mentions_created_container() {
        let err = ProvisionError {
            created: Some(ContainerRef::new("deadbeef")),
            source: ContainerError::PortConflict {
                port: 3939,
                message: "port is already allocated".to_string(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("deadbeef"));
        assert!(text.contains("3939"));
    }
}
