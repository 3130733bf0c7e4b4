//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new TCP port mapping.
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// A bind mount from a host file into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Absolute path on the host.
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl Mount {
    /// Create a read-only bind mount.
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Check both sides can be passed to `-v`.
    pub fn validate(&self) -> ContainerResult<()> {
        if !self.source.is_absolute() {
            return Err(ContainerError::InvalidInput(format!(
                "mount source '{}' must be an absolute path",
                self.source.display()
            )));
        }
        validate_mount_path(&self.source.to_string_lossy(), "host")?;
        validate_mount_path(&self.target, "container")?;
        validate_container_path(&self.target)
    }

    /// Render as a `-v` argument value, read-only mounts suffixed `ro`.
    ///
    /// Podman on SELinux hosts needs the private `Z` relabel option as well.
    pub fn to_volume_arg(&self, selinux_label: bool) -> String {
        let mut options: Vec<&str> = Vec::new();
        if self.read_only {
            options.push("ro");
        }
        if selinux_label {
            options.push("Z");
        }

        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if !options.is_empty() {
            arg.push(':');
            arg.push_str(&options.join(","));
        }
        arg
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Run with extended privileges.
    pub privileged: bool,
    /// Allocate a pseudo-TTY and keep stdin open.
    pub interactive: bool,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are safe and well-formed.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for mount in &self.mounts {
            mount.validate()?;
        }

        for port in &self.ports {
            if port.host_port == 0 || port.container_port == 0 {
                return Err(ContainerError::InvalidInput(
                    "port mappings must use non-zero ports".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a bind mount.
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Run the container privileged.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Allocate a TTY and keep stdin open.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// The first mapped host port, used to classify bind failures.
    pub fn primary_host_port(&self) -> Option<u16> {
        self.ports.first().map(|p| p.host_port)
    }
}

/// Container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container has exited.
    Exited,
    /// Container is dead.
    Dead,
    /// Unknown state.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the `{{.State.Status}}` inspect output.
    pub fn parse(status: &str) -> Self {
        match status.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names are alphanumeric with `-` and `_`.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a container name.
///
/// Container names must be alphanumeric with hyphens and underscores.
/// They must start with a letter or underscore.
fn validate_container_name(name: &str) -> ContainerResult<()> {
    validate_container_id_or_name(name)?;

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_ok {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    Ok(())
}

/// Validate an environment variable key.
///
/// Environment variable names should follow POSIX conventions:
/// alphanumeric and underscores, starting with a letter or underscore.
pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let starts_ok = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a mount path (host or container side).
fn validate_mount_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path cannot contain null bytes",
            side
        )));
    }

    // `-v` is colon separated
    if path.contains(':') || path.contains('\n') || path.contains('\r') {
        return Err(ContainerError::InvalidInput(format!(
            "{} mount path '{}' contains a character that cannot be passed to -v",
            side, path
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("rstudio/rstudio-connect:jammy-2025.09.0").is_ok());
        assert!(validate_image_name("ghcr.io/org/connect@sha256:abc123").is_ok());
        assert!(validate_image_name("connect").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("with-connect-3939-ab12").is_ok());
        assert!(validate_container_name("_private").is_ok());
        assert!(validate_container_name("-leading-dash").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("CONNECT_BOOTSTRAP_ENABLED").is_ok());
        assert!(validate_env_var_key("_X").is_ok());
        assert!(validate_env_var_key("1X").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
        assert!(validate_env_var_key("").is_err());
    }

    #[test]
    fn test_volume_arg_rendering() {
        let mount = Mount::read_only("/tmp/license.lic", "/var/lib/rstudio-connect/x.lic");
        assert_eq!(
            mount.to_volume_arg(false),
            "/tmp/license.lic:/var/lib/rstudio-connect/x.lic:ro"
        );
        assert_eq!(
            mount.to_volume_arg(true),
            "/tmp/license.lic:/var/lib/rstudio-connect/x.lic:ro,Z"
        );
    }

    #[test]
    fn test_container_config_validate() {
        let config = ContainerConfig::new("rstudio/rstudio-connect:jammy-2025.09.0")
            .name("with-connect-3939")
            .env("CONNECT_BOOTSTRAP_ENABLED", "true")
            .port(3939, 3939)
            .mount(Mount::read_only("/tmp/a.lic", "/var/lib/a.lic"));
        assert!(config.validate().is_ok());
        assert_eq!(config.primary_host_port(), Some(3939));
    }

    #[test]
    fn test_container_config_rejects_relative_mount() {
        let config = ContainerConfig::new("connect").mount(Mount::read_only("a.lic", "/a.lic"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_config_rejects_colon_in_mount() {
        let config =
            ContainerConfig::new("connect").mount(Mount::read_only("/tmp/a:b.lic", "/a.lic"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running\n"), ContainerState::Running);
        assert_eq!(ContainerState::parse("\"exited\""), ContainerState::Exited);
        assert_eq!(ContainerState::parse("stopped"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("weird"), ContainerState::Unknown);
    }
}
