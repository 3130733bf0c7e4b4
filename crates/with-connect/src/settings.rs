//! Tool settings: defaults, optional TOML file, `WITH_CONNECT__*` environment.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use with_connect::container::RuntimeType;
use with_connect::image::{ConnectVersion, DEFAULT_MIN_BOOTSTRAP_VERSION, DEFAULT_REPOSITORY, DEFAULT_VERSION};

pub const APP_NAME: &str = "with-connect";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeSettings,
    pub connect: ConnectSettings,
    pub readiness: ReadinessSettings,
    pub bootstrap: BootstrapSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// "docker" or "podman"; auto-detected when unset.
    pub engine: Option<RuntimeType>,
    /// Custom path to the engine binary.
    pub binary: Option<String>,
    /// Seconds the container gets to stop before it is killed.
    pub stop_timeout: u32,
    /// Seconds an interrupted command gets before it is killed.
    pub command_grace: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            engine: None,
            binary: None,
            stop_timeout: 10,
            command_grace: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    pub repository: String,
    /// Version used when neither --version nor --image is given.
    pub version: String,
    pub container_port: u16,
    /// Host name in the server URL given to the command.
    pub host: String,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.to_string(),
            version: DEFAULT_VERSION.to_string(),
            container_port: 3939,
            host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Seconds to wait for the health endpoint.
    pub timeout: u64,
    pub poll_interval_ms: u64,
    /// Seconds per health request.
    pub probe_timeout: u64,
    /// Container log lines shown when startup fails.
    pub log_tail: usize,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout: 60,
            poll_interval_ms: 1000,
            probe_timeout: 5,
            log_tail: 50,
        }
    }
}

impl ReadinessSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Oldest Connect release with the bootstrap endpoint.
    pub min_version: String,
    /// Seconds for the bootstrap request.
    pub request_timeout: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            min_version: DEFAULT_MIN_BOOTSTRAP_VERSION.to_string(),
            request_timeout: 30,
        }
    }
}

impl BootstrapSettings {
    pub fn min_version(&self) -> Result<ConnectVersion> {
        self.min_version
            .parse()
            .map_err(|e: String| anyhow!("bootstrap.min_version: {e}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Settings file location: the override (a file or a directory holding
/// `config.toml`) or the XDG config directory.
pub fn settings_path(override_path: Option<&str>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = expand_str_path(path)?;
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

/// Load settings from defaults, the settings file if present, and the environment.
pub fn load_settings(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("readiness.timeout", 60_i64)?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix().as_str()).separator("__"))
        .build()
        .with_context(|| format!("reading settings from {}", path.display()))?;

    let config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing settings from {}", path.display()))?;
    Ok(config)
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
