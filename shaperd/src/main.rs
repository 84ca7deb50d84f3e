//! shaperd: a long-running daemon that enforces a traffic-shaping and
//! kernel-tuning policy on the host it runs on.
//!
//! Startup order matters: kernel parameters first (they affect system-wide
//! behavior), then system-wide resource limits, then the daemon's own
//! rlimits, and finally traffic shaping with its netlink watch loop.

mod app;
mod detector;
mod limits;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use shaper_core::command::{CommandRunner, ProcessRunner};
use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::netlink::RtNetlink;
use shaper_core::templates::{self, TrafficInit};
use shaper_tc::settings::{Settings, WindowSettings};
use shaper_tc::Shaper;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::app::Daemon;
use crate::limits::{LimitsConfApplier, RlimitApplier, SysctlConfApplier};

const CONFIG_DIR_ENV: &str = "SHAPERD_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = "/etc/shaperd";

#[derive(Parser, Debug)]
#[command(name = "shaperd", version, about = "CAKE-based traffic shaping and kernel tuning daemon")]
struct Args {
    /// Configuration directory path (default: /etc/shaperd).
    #[arg(long)]
    conf: Option<PathBuf>,

    /// Traffic mode: client, server, or aggregate.
    #[arg(long)]
    mode: Option<String>,

    /// Deprecated positional mode argument; use --mode instead.
    #[arg(value_name = "MODE", hide = true)]
    legacy_mode: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()).await {
        tracing::error!(error = %err, "daemon terminated");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), CategorizedError> {
    let template_dir = resolve_template_dir(args.conf.as_deref())?;
    tracing::info!(path = %template_dir.display(), "using template directory");

    let mode = match (args.mode, args.legacy_mode) {
        (Some(mode), _) => Some(mode),
        (None, Some(legacy)) if !legacy.trim().is_empty() => {
            tracing::warn!(argument = %legacy, "legacy mode argument detected; use --mode instead");
            Some(legacy)
        }
        _ => None,
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::default());

    detector::validate_kernel_modules(runner.as_ref()).await?;
    detector::validate_runtime(runner.as_ref()).await?;

    let init = match templates::load_traffic_init(&template_dir, mode.as_deref()) {
        Ok(init) => init,
        Err(err) => {
            let fallback = TrafficInit::default();
            tracing::warn!(
                error = %err,
                fallback_mode = %fallback.mode,
                "falling back to default traffic template"
            );
            fallback
        }
    };
    tracing::info!(mode = %init.mode, "traffic template applied");

    let settings = Settings {
        routes: WindowSettings {
            init_cwnd_bytes: init.init_cwnd_bytes,
            init_rwnd_bytes: init.init_rwnd_bytes,
            loopback_window_bytes: init.init_loopback_window_bytes,
            ..Default::default()
        },
        ..Default::default()
    };

    let netlink = Arc::new(RtNetlink::new().map_err(|err| {
        CategorizedError::critical(
            format!("open netlink connection: {err}"),
            ErrorContext::new().op("netlink_connect"),
        )
    })?);

    let shaper = Shaper::new(settings, netlink, Arc::clone(&runner));

    let daemon = Daemon::new(
        SysctlConfApplier::new(template_dir.clone(), init.mode, Arc::clone(&runner)),
        LimitsConfApplier::new(template_dir.clone()),
        RlimitApplier::new(template_dir),
        shaper,
    );

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    daemon.run(token).await
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let signals = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        let (Ok(mut int), Ok(mut term), Ok(mut hup)) = signals else {
            tracing::error!("failed to install signal handlers");
            return;
        };

        tokio::select! {
            _ = int.recv() => tracing::info!("received SIGINT"),
            _ = term.recv() => tracing::info!("received SIGTERM"),
            _ = hup.recv() => tracing::info!("received SIGHUP"),
        }
        token.cancel();
    });
}

/// Resolves the template directory: flag, environment, `/etc/shaperd`, then
/// a `templates` directory next to the executable.
fn resolve_template_dir(flag: Option<&Path>) -> Result<PathBuf, CategorizedError> {
    if let Some(dir) = flag {
        validate_template_dir(dir).map_err(|reason| {
            CategorizedError::critical(
                format!("invalid template directory {}: {reason}", dir.display()),
                ErrorContext::new().op("resolve_template_dir"),
            )
        })?;
        return Ok(dir.to_path_buf());
    }

    if let Ok(env_dir) = std::env::var(CONFIG_DIR_ENV) {
        let env_dir = env_dir.trim();
        if !env_dir.is_empty() {
            let path = PathBuf::from(env_dir);
            if validate_template_dir(&path).is_ok() {
                return Ok(path);
            }
        }
    }

    let default = PathBuf::from(DEFAULT_CONFIG_DIR);
    if validate_template_dir(&default).is_ok() {
        return Ok(default);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let local = dir.join("templates");
            if validate_template_dir(&local).is_ok() {
                return Ok(local);
            }
        }
    }

    Err(CategorizedError::critical(
        "no valid template directory found",
        ErrorContext::new().op("resolve_template_dir"),
    ))
}

/// A usable template directory carries `common.conf`, at least one memory
/// tier file, and at least one role file.
fn validate_template_dir(dir: &Path) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    if !dir.join("common.conf").is_file() {
        return Err("missing required file common.conf".to_string());
    }
    templates::scan_memory_tiers(dir).map_err(|err| err.to_string())?;
    templates::detect_traffic_mode(dir).map_err(|err| err.to_string())?;
    Ok(())
}
