//! Runs the caller's command with the session credential in its environment.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::bootstrap::BootstrapCredential;
use crate::interrupt::Interrupt;

/// Variable carrying the Connect server URL.
pub const CONNECT_SERVER_VAR: &str = "CONNECT_SERVER";
/// Variable carrying the bootstrap API key.
pub const CONNECT_API_KEY_VAR: &str = "CONNECT_API_KEY";

/// Conventional shell encoding: 128 + signal number.
pub const EXIT_CODE_SIGNAL_BASE: i32 = 128;

/// Result type for command execution.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// The command could not be run at all.
///
/// A command that starts and exits non-zero is not an error.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no command given")]
    EmptyCommand,

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Ran to completion on its own.
    Exited { code: i32 },
    /// Stopped because the session was interrupted.
    Interrupted { code: i32 },
}

impl CommandOutcome {
    pub fn code(&self) -> i32 {
        match *self {
            CommandOutcome::Exited { code } | CommandOutcome::Interrupted { code } => code,
        }
    }
}

/// The two variables a command needs to reach the session's server.
pub fn credential_env(credential: &BootstrapCredential) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            CONNECT_SERVER_VAR.to_string(),
            credential.server_url.clone(),
        ),
        (CONNECT_API_KEY_VAR.to_string(), credential.api_key.clone()),
    ])
}

/// The invoking process's environment. Non-UTF-8 entries are skipped.
pub fn base_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Build the command environment.
///
/// Later layers win: `base`, then caller `overrides`, then `credential_vars`.
pub fn overlay_env<I>(
    base: I,
    overrides: &BTreeMap<String, String>,
    credential_vars: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base.into_iter().collect();
    for (key, value) in overrides {
        if credential_vars.contains_key(key) {
            warn!("{} is set by the session and overrides the -e value", key);
        }
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in credential_vars {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Map an exit status to a shell-style exit code.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_CODE_SIGNAL_BASE + signal;
        }
    }

    1
}

/// Spawns the caller's command with inherited stdio and waits for it.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    /// How long an interrupted command gets to exit before it is killed.
    grace: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GRACE)
    }
}

impl CommandRunner {
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run `command` with exactly `env` as its environment.
    ///
    /// On interrupt the child receives SIGTERM, then SIGKILL after the grace
    /// period.
    pub async fn run(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        interrupt: &Interrupt,
    ) -> SpawnResult<CommandOutcome> {
        let (program, args) = command.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: program.clone(),
                source,
            })?;

        debug!("spawned {} (pid {:?})", program, child.id());

        let wait_error = |source| SpawnError::Wait {
            program: program.clone(),
            source,
        };

        tokio::select! {
            status = child.wait() => {
                let code = exit_code_of(status.map_err(wait_error)?);
                info!("Command exited with code {}", code);
                Ok(CommandOutcome::Exited { code })
            }
            _ = interrupt.triggered() => {
                let status = self.terminate(&mut child).await.map_err(wait_error)?;
                let code = exit_code_of(status);
                info!("Command stopped after interrupt (code {})", code);
                Ok(CommandOutcome::Interrupted { code })
            }
        }
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        forward_terminate(child);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Command did not exit within {:?}, killing it",
                    self.grace
                );
                child.start_kill()?;
                child.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn forward_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling our own child by pid; failure only means it already exited.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result == -1 {
            debug!(
                "SIGTERM to pid {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn forward_terminate(child: &mut Child) {
    let _ = child.start_kill();
}
