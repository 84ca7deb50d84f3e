//! Daemon composition: ordered startup and the long-lived watch task.

use std::sync::Arc;

use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_tc::Shaper;
use tokio_util::sync::CancellationToken;

use crate::limits::{LimitsConfApplier, RlimitApplier, SysctlConfApplier};

/// Coordinates subsystems and the watch loop.
pub struct Daemon {
    sysctl_applier: SysctlConfApplier,
    limits_applier: LimitsConfApplier,
    rlimit_applier: RlimitApplier,
    shaper: Arc<Shaper>,
}

impl Daemon {
    pub fn new(
        sysctl_applier: SysctlConfApplier,
        limits_applier: LimitsConfApplier,
        rlimit_applier: RlimitApplier,
        shaper: Arc<Shaper>,
    ) -> Self {
        Self { sysctl_applier, limits_applier, rlimit_applier, shaper }
    }

    /// Runs initialization and blocks until cancellation or a fatal watch
    /// failure. Cancellation itself surfaces as an error so the process
    /// exits non-zero under service supervision.
    ///
    /// Priority order:
    /// 1. kernel parameters (sysctl) - system-wide foundation
    /// 2. system-wide resource limits (PAM) - affects future sessions
    /// 3. process resource limits (rlimit) - immediate effect on this daemon
    /// 4. traffic shaping, then the watch loop
    pub async fn run(self, token: CancellationToken) -> Result<(), CategorizedError> {
        self.sysctl_applier.apply().await.inspect_err(|err| {
            tracing::error!(error = %err, "sysctl apply failed");
        })?;

        self.limits_applier.apply().await.inspect_err(|err| {
            tracing::error!(error = %err, "limits apply failed");
        })?;

        self.rlimit_applier.apply().await.inspect_err(|err| {
            tracing::error!(error = %err, "rlimit apply failed");
        })?;

        self.shaper.apply(&token).await.inspect_err(|err| {
            tracing::error!(error = %err, "traffic apply failed");
        })?;

        let shaper = Arc::clone(&self.shaper);
        let watch_token = token.clone();
        let mut watch_task = tokio::spawn(async move { shaper.watch(watch_token).await });

        tokio::select! {
            _ = token.cancelled() => {}
            joined = &mut watch_task => {
                return match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "watch loop failed");
                        Err(err)
                    }
                    // A panic inside the watch task ends the daemon, not the
                    // process.
                    Err(join_err) => Err(CategorizedError::critical(
                        format!("watch task aborted: {join_err}"),
                        ErrorContext::new().op("watch"),
                    )),
                };
            }
        }

        // Cancelled: let the watch loop observe the token and wind down,
        // then report the cancellation to the caller.
        let _ = watch_task.await;
        Err(CategorizedError::critical(
            "context cancelled",
            ErrorContext::new().op("run"),
        ))
    }
}
