//! Session orchestration: provision, wait, bootstrap, run, tear down.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bootstrap::{BootstrapApi, BootstrapCredential, BootstrapSecret};
use crate::container::{
    ContainerConfig, ContainerError, ContainerHandle, ContainerRef, Mount, ProvisionError,
    validate_env_var_key, validate_image_name,
};
use crate::error::{SessionError, SessionResult};
use crate::image::{
    ConnectVersion, DEFAULT_MIN_BOOTSTRAP_VERSION, DEFAULT_REPOSITORY, ImageSelector,
    ResolvedImage, resolve_image,
};
use crate::interrupt::Interrupt;
use crate::readiness::{
    ContainerHealthProbe, HealthProbe, HttpHealthProbe, LogTail, ReadinessError, ReadinessPoller,
    ReadinessState,
};
use crate::runner::{CommandOutcome, CommandRunner, base_env, credential_env, overlay_env};

use super::guard::ContainerGuard;
use super::state::{SessionState, StateTracker};

/// Port Connect listens on inside the container.
pub const CONNECT_CONTAINER_PORT: u16 = 3939;
/// Where the license file is mounted.
pub const LICENSE_MOUNT_PATH: &str = "/var/lib/rstudio-connect/rstudio-connect.lic";
/// Where the optional server configuration is mounted.
pub const CONFIG_MOUNT_PATH: &str = "/etc/rstudio-connect/rstudio-connect.gcfg";
/// Label marking containers started by this tool.
pub const SESSION_LABEL: &str = "with-connect.session";

const BOOTSTRAP_ENABLED_VAR: &str = "CONNECT_BOOTSTRAP_ENABLED";
const BOOTSTRAP_SECRET_VAR: &str = "CONNECT_BOOTSTRAP_SECRETKEY";

/// Everything one session needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Version alias or explicit image.
    pub image: ImageSelector,
    /// Repository used to resolve version aliases.
    pub repository: String,
    /// Oldest Connect release that supports bootstrapping.
    pub min_version: ConnectVersion,
    /// License file on the host.
    pub license: PathBuf,
    /// Optional `rstudio-connect.gcfg` on the host.
    pub config_file: Option<PathBuf>,
    pub host_port: u16,
    pub container_port: u16,
    /// Host name used in the server URL handed to the command.
    pub host: String,
    /// Extra container environment; bootstrap variables win on collision.
    pub container_env: BTreeMap<String, String>,
    /// Extra command environment (`-e`); credential variables win on collision.
    pub command_env: BTreeMap<String, String>,
    /// Empty means idle until interrupted.
    pub command: Vec<String>,
    pub readiness_timeout: Duration,
    /// Log lines kept for diagnostics when startup fails.
    pub log_tail_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: ImageSelector::default(),
            repository: DEFAULT_REPOSITORY.to_string(),
            min_version: default_min_version(),
            license: PathBuf::from("rstudio-connect.lic"),
            config_file: None,
            host_port: CONNECT_CONTAINER_PORT,
            container_port: CONNECT_CONTAINER_PORT,
            host: "localhost".to_string(),
            container_env: BTreeMap::new(),
            command_env: BTreeMap::new(),
            command: Vec::new(),
            readiness_timeout: ReadinessPoller::DEFAULT_DEADLINE,
            log_tail_lines: 50,
        }
    }
}

impl SessionConfig {
    /// URL the command uses to reach the server.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.host_port)
    }

    /// Check inputs and resolve everything that can fail before provisioning.
    pub fn prepare(&self) -> SessionResult<PreparedSession> {
        let license = existing_file(&self.license)
            .ok_or_else(|| SessionError::LicenseMissing(self.license.clone()))?;

        let config_file = match self.config_file {
            Some(ref path) => Some(
                existing_file(path).ok_or_else(|| SessionError::ConfigFileMissing(path.clone()))?,
            ),
            None => None,
        };

        if self.host_port == 0 || self.container_port == 0 {
            return Err(SessionError::InvalidConfig(
                "port must be between 1 and 65535".to_string(),
            ));
        }

        for key in self.container_env.keys().chain(self.command_env.keys()) {
            validate_env_var_key(key)
                .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        }

        let image = resolve_image(&self.image, &self.repository);
        validate_image_name(&image.reference)
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        let mounts = std::iter::once((&license, LICENSE_MOUNT_PATH))
            .chain(config_file.as_ref().map(|path| (path, CONFIG_MOUNT_PATH)));
        for (path, target) in mounts {
            Mount::read_only(path, target)
                .validate()
                .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;
        }

        match image.version {
            Some(version) if version < self.min_version => {
                return Err(SessionError::UnsupportedVersion {
                    version,
                    minimum: self.min_version,
                });
            }
            Some(_) => {}
            None => warn!(
                "Cannot determine the Connect version of {}; assuming it supports bootstrapping",
                image.reference
            ),
        }

        Ok(PreparedSession {
            image,
            license,
            config_file,
        })
    }
}

/// Minimum bootstrap version as a parsed value.
pub fn default_min_version() -> ConnectVersion {
    DEFAULT_MIN_BOOTSTRAP_VERSION
        .parse()
        .unwrap_or(ConnectVersion::new(2022, 10, 0))
}

fn existing_file(path: &Path) -> Option<PathBuf> {
    if !path.is_file() {
        return None;
    }
    std::path::absolute(path).ok()
}

/// Validated session inputs.
#[derive(Debug, Clone)]
pub struct PreparedSession {
    pub image: ResolvedImage,
    /// Absolute license path.
    pub license: PathBuf,
    /// Absolute config path.
    pub config_file: Option<PathBuf>,
}

impl PreparedSession {
    /// Container definition for this session.
    pub fn container_config(
        &self,
        config: &SessionConfig,
        secret: &BootstrapSecret,
    ) -> ContainerConfig {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let mut container = ContainerConfig::new(&self.image.reference)
            .name(format!(
                "with-connect-{}-{}",
                config.host_port,
                &session_id[..12]
            ))
            .port(config.host_port, config.container_port)
            .mount(Mount::read_only(&self.license, LICENSE_MOUNT_PATH))
            .envs(config.container_env.clone())
            .env(BOOTSTRAP_ENABLED_VAR, "true")
            .env(BOOTSTRAP_SECRET_VAR, secret.to_base64())
            .label(SESSION_LABEL, session_id)
            .privileged(true)
            .interactive(true);

        if let Some(ref path) = self.config_file {
            container = container.mount(Mount::read_only(path, CONFIG_MOUNT_PATH));
        }

        container
    }
}

/// What happened during a session.
#[derive(Debug)]
pub struct SessionReport {
    /// Process exit code for this outcome.
    pub exit_code: i32,
    /// The error that ended the session, if any.
    pub error: Option<SessionError>,
    /// Phase in which the session failed.
    pub failed_in: Option<SessionState>,
    /// States visited, in order.
    pub states: Vec<SessionState>,
    /// The container this session created, if any.
    pub container: Option<ContainerRef>,
    /// Whether the container was stopped and removed.
    pub cleaned_up: bool,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn final_state(&self) -> SessionState {
        self.states.last().copied().unwrap_or(SessionState::Idle)
    }
}

/// Sequences one session and guarantees its container is torn down.
pub struct SessionOrchestrator {
    handle: ContainerHandle,
    bootstrapper: Arc<dyn BootstrapApi>,
    poller: ReadinessPoller,
    runner: CommandRunner,
    probe_timeout: Duration,
    /// Replaces the HTTP probe against the server URL.
    service_probe: Option<Arc<dyn HealthProbe>>,
    port_check: bool,
}

impl SessionOrchestrator {
    pub fn new(handle: ContainerHandle, bootstrapper: Arc<dyn BootstrapApi>) -> Self {
        Self {
            handle,
            bootstrapper,
            poller: ReadinessPoller::default(),
            runner: CommandRunner::default(),
            probe_timeout: HttpHealthProbe::DEFAULT_TIMEOUT,
            service_probe: None,
            port_check: true,
        }
    }

    pub fn with_poller(mut self, poller: ReadinessPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_service_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.service_probe = Some(probe);
        self
    }

    /// Whether to check the host port is free before provisioning.
    pub fn with_port_check(mut self, enabled: bool) -> Self {
        self.port_check = enabled;
        self
    }

    /// Run one session to completion.
    ///
    /// Never returns while a container it created is still present, unless
    /// teardown itself failed, which is reported as an internal error.
    pub async fn run(&self, config: &SessionConfig, interrupt: &Interrupt) -> SessionReport {
        let mut tracker = StateTracker::new();
        let mut guard: Option<ContainerGuard> = None;

        let mut result = self
            .drive(config, interrupt, &mut tracker, &mut guard)
            .await;

        if let Err(ref e) = result {
            tracker.mark_failed();
            error!("Session failed while {}: {}", tracker.current(), e);
            if let Some(guard) = guard.as_ref().filter(|_| !logs_already_reported(e)) {
                self.report_logs(guard.container(), Vec::new(), config.log_tail_lines)
                    .await;
            }
        }

        let container = guard.as_ref().map(|g| g.container().clone());
        let mut cleaned_up = false;

        if let Some(mut guard) = guard.take() {
            tracker.advance(SessionState::Stopping);
            match guard.release().await {
                Ok(_) => cleaned_up = true,
                Err(e) => {
                    error!(
                        "Failed to remove container {}: {}",
                        guard.container().short(),
                        e
                    );
                    tracker.mark_failed();
                    if result.is_ok() {
                        result = Err(SessionError::Cleanup(e));
                    }
                }
            }
        }

        tracker.finish();

        let (exit_code, error) = match result {
            Ok(code) => (code, None),
            Err(e) => (e.exit_code(), Some(e)),
        };

        SessionReport {
            exit_code,
            error,
            failed_in: tracker.failed_in(),
            states: tracker.history().to_vec(),
            container,
            cleaned_up,
        }
    }

    async fn drive(
        &self,
        config: &SessionConfig,
        interrupt: &Interrupt,
        tracker: &mut StateTracker,
        guard: &mut Option<ContainerGuard>,
    ) -> SessionResult<i32> {
        let prepared = config.prepare()?;
        if interrupt.is_triggered() {
            return Err(SessionError::Interrupted);
        }

        tracker.advance(SessionState::Provisioning);
        if self.port_check {
            ensure_port_free(config.host_port)?;
        }

        let secret = BootstrapSecret::generate();
        let container_config = prepared.container_config(config, &secret);

        tokio::select! {
            res = self.handle.ensure_image(&prepared.image.reference) => res?,
            _ = interrupt.triggered() => return Err(SessionError::Interrupted),
        }

        // Create and start are not interruptible so a created container is
        // always handed to the guard.
        let container = match self.handle.provision(&container_config).await {
            Ok(container) => container,
            Err(ProvisionError { created, source }) => {
                match created {
                    Some(container) => {
                        *guard = Some(ContainerGuard::new(self.handle.clone(), container));
                    }
                    None => self.sweep_by_name(&container_config).await,
                }
                return Err(SessionError::Provisioning(source));
            }
        };
        *guard = Some(ContainerGuard::new(self.handle.clone(), container.clone()));

        tracker.advance(SessionState::AwaitingReady);
        if interrupt.is_triggered() {
            return Err(SessionError::Interrupted);
        }
        let base_url = config.server_url();
        info!("Waiting for Connect at {}...", base_url);
        self.await_ready(config, &container, &base_url, interrupt)
            .await?;

        tracker.advance(SessionState::Bootstrapping);
        let credential = tokio::select! {
            res = self.bootstrapper.bootstrap(&base_url, &secret) => res?,
            _ = interrupt.triggered() => return Err(SessionError::Interrupted),
        };
        info!("Bootstrapped API key for {}", credential.server_url);

        tracker.advance(SessionState::Running);
        self.execute(config, &credential, interrupt).await
    }

    async fn await_ready(
        &self,
        config: &SessionConfig,
        container: &ContainerRef,
        base_url: &str,
        interrupt: &Interrupt,
    ) -> SessionResult<()> {
        let service: Arc<dyn HealthProbe> = match self.service_probe {
            Some(ref probe) => Arc::clone(probe),
            None => Arc::new(HttpHealthProbe::ping(base_url, self.probe_timeout)?),
        };
        let probe = ContainerHealthProbe::new(self.handle.clone(), container.clone(), service);

        let tail = match self.handle.stream_logs(container).await {
            Ok(stream) => Some(LogTail::spawn(stream, config.log_tail_lines)),
            Err(e) => {
                debug!("not following container logs: {}", e);
                None
            }
        };

        let outcome = tokio::select! {
            res = self.poller.wait_until_ready(&probe, config.readiness_timeout) => Some(res),
            _ = interrupt.triggered() => None,
        };

        let recent = tail.map(LogTail::cancel).unwrap_or_default();

        match outcome {
            None => Err(SessionError::Interrupted),
            Some(Ok(readiness)) if readiness.state == ReadinessState::Ready => Ok(()),
            Some(Ok(readiness)) => {
                self.report_logs(container, recent, config.log_tail_lines)
                    .await;
                Err(SessionError::ReadinessTimeout {
                    seconds: config.readiness_timeout.as_secs(),
                    observation: readiness
                        .last_observation
                        .unwrap_or_else(|| "no response".to_string()),
                })
            }
            Some(Err(e)) => {
                self.report_logs(container, recent, config.log_tail_lines)
                    .await;
                Err(e.into())
            }
        }
    }

    async fn execute(
        &self,
        config: &SessionConfig,
        credential: &BootstrapCredential,
        interrupt: &Interrupt,
    ) -> SessionResult<i32> {
        if config.command.is_empty() {
            info!(
                "Connect is running at {}. Press Ctrl-C to stop.",
                credential.server_url
            );
            interrupt.triggered().await;
            return Ok(0);
        }

        let env = overlay_env(base_env(), &config.command_env, &credential_env(credential));

        info!("Running {}", config.command.join(" "));
        match self.runner.run(&config.command, &env, interrupt).await? {
            CommandOutcome::Exited { code } => Ok(code),
            CommandOutcome::Interrupted { code } => {
                debug!("interrupted command exited with {}", code);
                Err(SessionError::Interrupted)
            }
        }
    }

    /// Remove a container the engine may have created even though `create`
    /// reported failure. A no-op when nothing carries the session's name.
    async fn sweep_by_name(&self, container_config: &ContainerConfig) {
        let Some(ref name) = container_config.name else {
            return;
        };
        let orphan = ContainerRef::new(name.clone());
        match self.handle.teardown(&orphan).await {
            Ok(()) => debug!("swept container name {}", name),
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }

    async fn report_logs(&self, container: &ContainerRef, recent: Vec<String>, tail: usize) {
        let lines = if recent.is_empty() {
            self.handle
                .recent_logs(container, u32::try_from(tail).unwrap_or(u32::MAX))
                .await
        } else {
            recent
        };

        if lines.is_empty() {
            return;
        }
        error!("Last {} line(s) of container output:", lines.len());
        for line in lines {
            error!("  {}", line);
        }
    }
}

/// Readiness failures print the log tail they collected while polling.
fn logs_already_reported(err: &SessionError) -> bool {
    matches!(
        err,
        SessionError::Interrupted
            | SessionError::ReadinessTimeout { .. }
            | SessionError::Unhealthy(ReadinessError::Unhealthy { .. })
    )
}

/// Fail with a port conflict when something on this host already holds `port`.
pub fn ensure_port_free(port: u16) -> SessionResult<()> {
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(()),
        Err(e) => Err(SessionError::Provisioning(ContainerError::PortConflict {
            port,
            message: e.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn license_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "license").unwrap();
        file
    }

    #[test]
    fn prepare_rejects_missing_license() {
        let config = SessionConfig {
            license: PathBuf::from("/nonexistent/rstudio-connect.lic"),
            ..SessionConfig::default()
        };
        let err = config.prepare().unwrap_err();
        assert_eq!(
            err.to_string(),
            "License file does not exist: /nonexistent/rstudio-connect.lic"
        );
    }

    #[test]
    fn prepare_rejects_missing_config_file() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            config_file: Some(PathBuf::from("/nonexistent/rstudio-connect.gcfg")),
            ..SessionConfig::default()
        };
        let err = config.prepare().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config file does not exist: /nonexistent/rstudio-connect.gcfg"
        );
    }

    #[test]
    fn prepare_rejects_old_versions() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            image: ImageSelector::Version("2022.09.0".to_string()),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.prepare(),
            Err(SessionError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn prepare_accepts_unversioned_explicit_image() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            image: ImageSelector::Image("registry.local/connect:custom".to_string()),
            ..SessionConfig::default()
        };
        let prepared = config.prepare().unwrap();
        assert_eq!(prepared.image.reference, "registry.local/connect:custom");
        assert!(prepared.license.is_absolute());
    }

    #[test]
    fn prepare_rejects_bad_env_keys() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            command_env: BTreeMap::from([("BAD KEY".to_string(), "x".to_string())]),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.prepare(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn prepare_rejects_malformed_image() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            image: ImageSelector::Image("connect latest!".to_string()),
            ..SessionConfig::default()
        };
        let err = config.prepare().unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig(_)));
        assert_eq!(err.exit_code(), 78);
    }

    #[test]
    fn prepare_rejects_paths_that_cannot_be_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let license = dir.path().join("connect:2025.lic");
        std::fs::write(&license, "license").unwrap();

        let config = SessionConfig {
            license,
            ..SessionConfig::default()
        };
        let err = config.prepare().unwrap_err();
        assert!(err.to_string().contains("-v"), "{err}");
        assert_eq!(err.exit_code(), 78);

        let license = license_file();
        let gcfg = dir.path().join("a:b.gcfg");
        std::fs::write(&gcfg, "[Server]").unwrap();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            config_file: Some(gcfg),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.prepare(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn container_name_is_unique_per_session() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            host_port: 4949,
            ..SessionConfig::default()
        };
        let prepared = config.prepare().unwrap();
        let secret = BootstrapSecret::generate();
        let first = prepared.container_config(&config, &secret);
        let second = prepared.container_config(&config, &secret);

        let name = first.name.clone().unwrap();
        assert!(name.starts_with("with-connect-4949-"), "{name}");
        assert_ne!(first.name, second.name);
        assert!(first.validate().is_ok());
        assert!(name.ends_with(&first.labels[SESSION_LABEL][..12]));
    }

    #[test]
    fn container_config_carries_bootstrap_secret_and_mounts() {
        let license = license_file();
        let config = SessionConfig {
            license: license.path().to_path_buf(),
            host_port: 4949,
            container_env: BTreeMap::from([
                (BOOTSTRAP_ENABLED_VAR.to_string(), "false".to_string()),
                ("EXTRA".to_string(), "1".to_string()),
            ]),
            ..SessionConfig::default()
        };
        let prepared = config.prepare().unwrap();
        let secret = BootstrapSecret::generate();
        let container = prepared.container_config(&config, &secret);

        assert_eq!(container.env[BOOTSTRAP_ENABLED_VAR], "true");
        assert_eq!(container.env[BOOTSTRAP_SECRET_VAR], secret.to_base64());
        assert_eq!(container.env["EXTRA"], "1");
        assert_eq!(container.primary_host_port(), Some(4949));
        assert_eq!(container.mounts.len(), 1);
        assert_eq!(container.mounts[0].target, LICENSE_MOUNT_PATH);
        assert!(container.mounts[0].read_only);
        assert!(container.privileged);
        assert!(container.labels.contains_key(SESSION_LABEL));
    }

    #[test]
    fn occupied_port_is_a_conflict() {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = ensure_port_free(port).unwrap_err();
        assert_eq!(err.exit_code(), 69);
    }

    #[test]
    fn default_min_version_parses() {
        assert_eq!(default_min_version(), ConnectVersion::new(2022, 10, 0));
    }
}
