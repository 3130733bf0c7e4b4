//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container engine could not be reached (binary missing or daemon down).
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The image could not be resolved or pulled.
    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    /// The requested host port is already bound.
    #[error("host port {port} is already in use: {message}")]
    PortConflict { port: u16, message: String },

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Classify a failed engine invocation by its stderr.
    ///
    /// Docker and Podman report daemon and port problems only as text, so the
    /// distinguished variants are recovered from well-known phrases.
    pub fn from_stderr(command: &str, stderr: &str, host_port: Option<u16>) -> Self {
        let lower = stderr.to_ascii_lowercase();

        if lower.contains("cannot connect to the docker daemon")
            || lower.contains("is the docker daemon running")
            || lower.contains("cannot connect to podman")
            || lower.contains("unable to connect to podman")
        {
            return ContainerError::RuntimeUnavailable(stderr.trim().to_string());
        }

        if let Some(port) = host_port
            && (lower.contains("port is already allocated")
                || lower.contains("address already in use")
                || lower.contains("bind: address already"))
        {
            return ContainerError::PortConflict {
                port,
                message: stderr.trim().to_string(),
            };
        }

        ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        }
    }

    /// Whether the engine reported that the container does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::CommandFailed { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("no such container") || lower.contains("no container with")
            }
            _ => false,
        }
    }
}
