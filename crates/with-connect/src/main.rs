use std::collections::BTreeMap;
use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use log::{LevelFilter, debug, error};

use with_connect::bootstrap::BootstrapClient;
use with_connect::container::{ContainerHandle, ContainerRuntime, RuntimeType};
use with_connect::error::{FailureKind, SessionError};
use with_connect::image::ImageSelector;
use with_connect::interrupt::Interrupt;
use with_connect::readiness::ReadinessPoller;
use with_connect::runner::CommandRunner;
use with_connect::session::{SessionConfig, SessionOrchestrator};

mod settings;

use settings::AppConfig;

fn main() {
    let code = match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            FailureKind::Internal.exit_code()
        }
    };
    std::process::exit(code);
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    // Logging depends on the settings, so load failures go straight to stderr.
    let ctx = match RuntimeContext::new(cli.common.clone()) {
        Ok(ctx) => ctx,
        Err(err) => {
            let _ = writeln!(io::stderr(), "Error: {err:#}");
            return Ok(FailureKind::Config.exit_code());
        }
    };
    ctx.init_logging()?;
    debug!("settings file: {}", ctx.settings_file.display());

    let session = match build_session_config(&cli.session, &ctx.config) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return Ok(e.exit_code());
        }
    };

    run_session(ctx, cli.session, session)
}

#[tokio::main]
async fn run_session(ctx: RuntimeContext, opts: SessionOpts, session: SessionConfig) -> Result<i32> {
    let runtime = match (opts.runtime, ctx.config.runtime.binary.as_deref()) {
        (Some(kind), _) => ContainerRuntime::with_type(kind.into()),
        (None, Some(binary)) => ContainerRuntime::with_binary(
            ctx.config.runtime.engine.unwrap_or_default(),
            binary,
        ),
        (None, None) => match ctx.config.runtime.engine {
            Some(kind) => ContainerRuntime::with_type(kind),
            None => ContainerRuntime::detect(),
        },
    };
    debug!(
        "using {} runtime ({})",
        runtime.runtime_type(),
        runtime.binary()
    );

    let handle =
        ContainerHandle::new(Arc::new(runtime)).with_stop_timeout(ctx.config.runtime.stop_timeout);
    let bootstrapper = BootstrapClient::new(Duration::from_secs(
        ctx.config.bootstrap.request_timeout,
    ))
    .context("building bootstrap client")?;

    let orchestrator = SessionOrchestrator::new(handle, Arc::new(bootstrapper))
        .with_poller(ReadinessPoller::new(ctx.config.readiness.poll_interval()))
        .with_probe_timeout(Duration::from_secs(ctx.config.readiness.probe_timeout))
        .with_runner(CommandRunner::new(Duration::from_secs(
            ctx.config.runtime.command_grace,
        )));

    let interrupt = Interrupt::install();
    let report = orchestrator.run(&session, &interrupt).await;

    debug!(
        "session states: {}",
        report
            .states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    Ok(report.exit_code)
}

#[derive(Debug, Parser)]
#[command(
    author,
    about = "Run a command against a throwaway Posit Connect server.",
    disable_version_flag = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(flatten)]
    session: SessionOpts,
}

#[derive(Debug, Clone, Args)]
struct SessionOpts {
    /// Posit Connect version to run
    #[arg(long = "version", value_name = "VERSION", conflicts_with = "image")]
    connect_version: Option<String>,
    /// Container image to run instead of a version alias
    #[arg(long, value_name = "IMAGE")]
    image: Option<String>,
    /// Path to the Posit Connect license file
    #[arg(long, value_name = "PATH", default_value = "./rstudio-connect.lic")]
    license: String,
    /// Path to an rstudio-connect.gcfg file
    #[arg(long, value_name = "PATH")]
    config: Option<String>,
    /// Host port for Connect
    #[arg(long, value_name = "PORT", default_value_t = 3939)]
    port: u16,
    /// Environment variable for the command (KEY=VALUE, repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Environment variable for the container (KEY=VALUE, repeatable)
    #[arg(long = "container-env", value_name = "KEY=VALUE")]
    container_env: Vec<String>,
    /// Seconds to wait for Connect to become ready
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
    /// Container engine to use
    #[arg(long, value_enum)]
    runtime: Option<RuntimeArg>,
    /// Command to run once Connect is ready
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the settings file path
    #[arg(long, value_name = "PATH")]
    settings: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuntimeArg {
    Docker,
    Podman,
}

impl From<RuntimeArg> for RuntimeType {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => RuntimeType::Docker,
            RuntimeArg::Podman => RuntimeType::Podman,
        }
    }
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    settings_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let settings_file = settings::settings_path(common.settings.as_deref())?;
        let config = settings::load_settings(&settings_file)?;
        Ok(Self {
            common,
            settings_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("with_connect={level}")));

        // Logs go to stderr; stdout belongs to the command.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.effective_log_level() >= LevelFilter::Debug)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            let base = self
                .config
                .logging
                .level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::Info);
            match self.common.verbose {
                0 => base,
                1 => base.max(LevelFilter::Debug),
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Translate CLI flags and settings into a session.
fn build_session_config(opts: &SessionOpts, config: &AppConfig) -> Result<SessionConfig, SessionError> {
    let image = match (&opts.image, &opts.connect_version) {
        (Some(image), _) => ImageSelector::Image(image.clone()),
        (None, Some(version)) => ImageSelector::Version(version.clone()),
        (None, None) => ImageSelector::Version(config.connect.version.clone()),
    };

    let license = expand(&opts.license)?;
    let config_file = opts.config.as_deref().map(expand).transpose()?;

    let min_version = config
        .bootstrap
        .min_version()
        .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

    let timeout = opts.timeout.unwrap_or(config.readiness.timeout);

    Ok(SessionConfig {
        image,
        repository: config.connect.repository.clone(),
        min_version,
        license,
        config_file,
        host_port: opts.port,
        container_port: config.connect.container_port,
        host: config.connect.host.clone(),
        container_env: parse_env_pairs(&opts.container_env)?,
        command_env: parse_env_pairs(&opts.env)?,
        command: opts.command.clone(),
        readiness_timeout: Duration::from_secs(timeout),
        log_tail_lines: config.readiness.log_tail,
    })
}

fn expand(path: &str) -> Result<PathBuf, SessionError> {
    settings::expand_str_path(path).map_err(|e| SessionError::InvalidConfig(format!("{path}: {e}")))
}

/// Parse repeated `KEY=VALUE` arguments; later duplicates win.
fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, SessionError> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(SessionError::InvalidConfig(format!(
                "environment variable '{pair}' must be KEY=VALUE"
            )));
        };
        if key.is_empty() {
            return Err(SessionError::InvalidConfig(format!(
                "environment variable '{pair}' has an empty name"
            )));
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
