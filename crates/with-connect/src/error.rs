//! Session-level error taxonomy and exit codes.

use std::path::PathBuf;
use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::container::ContainerError;
use crate::image::ConnectVersion;
use crate::readiness::ReadinessError;
use crate::runner::SpawnError;

/// Result type for session orchestration.
pub type SessionResult<T> = Result<T, SessionError>;

/// Failure class, each with its own process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Provisioning,
    Readiness,
    Bootstrap,
    UnsupportedVersion,
    Spawn,
    Interrupted,
    Internal,
}

impl FailureKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::Config => 78,
            FailureKind::Provisioning => 69,
            FailureKind::Readiness => 75,
            FailureKind::Bootstrap => 76,
            FailureKind::UnsupportedVersion => 65,
            FailureKind::Spawn => 127,
            FailureKind::Interrupted => 130,
            FailureKind::Internal => 70,
        }
    }
}

/// Everything that can end a session early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("License file does not exist: {}", .0.display())]
    LicenseMissing(PathBuf),

    #[error("Config file does not exist: {}", .0.display())]
    ConfigFileMissing(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Connect {version} does not support bootstrapping; version {minimum} or later is required"
    )]
    UnsupportedVersion {
        version: ConnectVersion,
        minimum: ConnectVersion,
    },

    #[error("provisioning failed: {0}")]
    Provisioning(#[source] ContainerError),

    #[error("Connect did not become ready within {seconds}s ({observation})")]
    ReadinessTimeout { seconds: u64, observation: String },

    #[error(transparent)]
    Unhealthy(#[from] ReadinessError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("interrupted")]
    Interrupted,

    #[error("cleanup failed: {0}")]
    Cleanup(#[source] ContainerError),
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::LicenseMissing(_)
            | SessionError::ConfigFileMissing(_)
            | SessionError::InvalidConfig(_) => FailureKind::Config,
            SessionError::UnsupportedVersion { .. } => FailureKind::UnsupportedVersion,
            SessionError::Provisioning(_) => FailureKind::Provisioning,
            SessionError::ReadinessTimeout { .. } => FailureKind::Readiness,
            SessionError::Unhealthy(ReadinessError::Unhealthy { .. }) => FailureKind::Readiness,
            SessionError::Unhealthy(ReadinessError::Client(_)) => FailureKind::Internal,
            SessionError::Bootstrap(_) => FailureKind::Bootstrap,
            SessionError::Spawn(_) => FailureKind::Spawn,
            SessionError::Interrupted => FailureKind::Interrupted,
            SessionError::Cleanup(_) => FailureKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

impl From<ContainerError> for SessionError {
    fn from(err: ContainerError) -> Self {
        SessionError::Provisioning(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_are_distinct() {
        let kinds = [
            FailureKind::Config,
            FailureKind::Provisioning,
            FailureKind::Readiness,
            FailureKind::Bootstrap,
            FailureKind::UnsupportedVersion,
            FailureKind::Spawn,
            FailureKind::Interrupted,
            FailureKind::Internal,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(FailureKind::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn missing_license_message() {
        let err = SessionError::LicenseMissing(PathBuf::from("/tmp/nope.lic"));
        assert_eq!(err.to_string(), "License file does not exist: /tmp/nope.lic");
        assert_eq!(err.exit_code(), 78);
    }

    #[test]
    fn provisioning_errors_map_to_provisioning() {
        let err: SessionError = ContainerError::RuntimeUnavailable("no docker".into()).into();
        assert_eq!(err.kind(), FailureKind::Provisioning);
    }

    #[test]
    fn unsupported_version_mentions_both_versions() {
        let err = SessionError::UnsupportedVersion {
            version: "2022.09.0".parse().unwrap(),
            minimum: "2022.10.0".parse().unwrap(),
        };
        let text = err.to_string();
        assert!(text.contains("2022.09.0"));
        assert!(text.contains("2022.10.0"));
        assert_eq!(err.exit_code(), 65);
    }
}
