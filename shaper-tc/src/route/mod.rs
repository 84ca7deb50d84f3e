//! Route-table optimization.
//!
//! Rewrites loopback, local, and primary-NIC route entries with tuned MTU,
//! initial congestion/receive windows, TCP fast open, and a locked
//! congestion-control algorithm. Works on `ip route show` output lines:
//! previously applied tokens are stripped before the rewritten entry is fed
//! back through `ip route change`, which keeps the operation idempotent.

mod detect;

use std::sync::Arc;

use shaper_core::command::{CommandError, CommandRunner};
use shaper_core::error::{Category, CategorizedError, ErrorContext, MultiError};
use shaper_core::netlink::Netlink;

use crate::settings::WindowSettings;

const STANDARD_MTU: u32 = 1500;
const LOOPBACK_MTU: u32 = 65_520;

/// Rewrites route-table entries with tuned TCP window parameters.
pub struct RouteOptimizer {
    netlink: Arc<dyn Netlink>,
    runner: Arc<dyn CommandRunner>,
    init_cwnd_segments: u64,
    init_rwnd_segments: u64,
    loopback_window_segments: u64,
    /// Fallback procfs path for the congestion-control read.
    congestion_control_path: std::path::PathBuf,
}

impl RouteOptimizer {
    pub fn new(
        window: WindowSettings,
        netlink: Arc<dyn Netlink>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let window = window.with_defaults();
        let init_cwnd_segments = bytes_to_segments(window.init_cwnd_bytes, window.mss_bytes);
        let init_rwnd_segments = bytes_to_segments(window.init_rwnd_bytes, window.mss_bytes);
        let loopback_window_segments =
            bytes_to_segments(window.loopback_window_bytes, window.loopback_mss_bytes);

        tracing::info!(
            mss_bytes = window.mss_bytes,
            initcwnd_bytes = window.init_cwnd_bytes,
            initcwnd_segments = init_cwnd_segments,
            initrwnd_bytes = window.init_rwnd_bytes,
            initrwnd_segments = init_rwnd_segments,
            loopback_window_bytes = window.loopback_window_bytes,
            loopback_window_segments = loopback_window_segments,
            "route optimizer initialized"
        );

        Self {
            netlink,
            runner,
            init_cwnd_segments,
            init_rwnd_segments,
            loopback_window_segments,
            congestion_control_path: std::path::PathBuf::from(
                "/proc/sys/net/ipv4/tcp_congestion_control",
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_congestion_control_path(mut self, path: std::path::PathBuf) -> Self {
        self.congestion_control_path = path;
        self
    }

    /// Applies route tuning for the loopback, local, and NIC categories.
    /// Each category failure is recoverable; the aggregate is returned when
    /// at least one category failed.
    pub async fn optimize(&self) -> Result<(), MultiError> {
        let mut errs = MultiError::new();

        for result in [
            self.optimize_loopback().await,
            self.optimize_local().await,
            self.optimize_nic().await,
        ] {
            if let Err(err) = result {
                tracing::warn!(error = %err, "route category optimization failed");
                errs.push(err);
            }
        }

        if errs.is_empty() {
            tracing::info!("route optimization completed successfully");
        } else {
            tracing::warn!(error_count = errs.len(), "route optimization completed with errors");
        }
        errs.into_result()
    }

    async fn optimize_loopback(&self) -> Result<(), CategorizedError> {
        let job = RouteJob {
            category: "loopback",
            route_args: &["route", "show", "table", "local"],
            filter: &detect::should_optimize_loopback,
            params: RouteParams::new(
                LOOPBACK_MTU,
                self.loopback_window_segments,
                self.loopback_window_segments,
                Some("cubic".to_string()),
            ),
            fetch_operation: "fetch_loopback_routes",
            apply_operation: "optimize_loopback_routes",
            interface: None,
        };
        self.optimize_category(job).await
    }

    async fn optimize_local(&self) -> Result<(), CategorizedError> {
        let job = RouteJob {
            category: "local",
            route_args: &["route", "show", "table", "local"],
            filter: &detect::should_optimize_local,
            params: RouteParams::new(
                STANDARD_MTU,
                self.init_cwnd_segments,
                self.init_rwnd_segments,
                Some("cubic".to_string()),
            ),
            fetch_operation: "fetch_local_routes",
            apply_operation: "optimize_local_routes",
            interface: None,
        };
        self.optimize_category(job).await
    }

    async fn optimize_nic(&self) -> Result<(), CategorizedError> {
        let nic = self.primary_nic().await.map_err(|err| {
            CategorizedError::recoverable(
                format!("failed to detect primary NIC: {err}"),
                ErrorContext::new().op("detect_primary_nic"),
            )
        })?;

        let congctl = self
            .current_congestion_control()
            .await
            .unwrap_or_else(|_| "cubic".to_string());
        tracing::debug!(interface = %nic, congctl = %congctl, "primary NIC detected");

        let filter = |line: &str| detect::should_optimize_nic(line, &nic);
        let job = RouteJob {
            category: "nic",
            route_args: &["route", "show"],
            filter: &filter,
            params: RouteParams::new(
                STANDARD_MTU,
                self.init_cwnd_segments,
                self.init_rwnd_segments,
                Some(congctl),
            ),
            fetch_operation: "fetch_nic_routes",
            apply_operation: "optimize_nic_routes",
            interface: Some(&nic),
        };
        self.optimize_category(job).await
    }

    async fn optimize_category(&self, job: RouteJob<'_>) -> Result<(), CategorizedError> {
        let lines = self.fetch_routes(job.route_args).await.map_err(|err| {
            CategorizedError::new(
                Category::Recoverable,
                format!("fetch {} routes: {err}", job.category),
                job.context(job.fetch_operation),
            )
        })?;

        let filtered: Vec<&str> = lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| (job.filter)(line))
            .collect();

        tracing::info!(
            category = job.category,
            total_routes = filtered.len(),
            interface = job.interface.unwrap_or(""),
            "{} routes optimization started",
            job.category
        );

        let start = std::time::Instant::now();
        let params = job.params.args();
        let (optimized, skipped, first_err) =
            self.apply_routes(&filtered, &params, job.category).await;

        tracing::info!(
            category = job.category,
            optimized,
            skipped,
            total = filtered.len(),
            duration = ?start.elapsed(),
            "{} routes optimization completed",
            job.category
        );

        match first_err {
            Some(err) => Err(CategorizedError::new(
                Category::Recoverable,
                format!("apply {} route changes: {err}", job.category),
                job.context(job.apply_operation),
            )),
            None => Ok(()),
        }
    }

    async fn apply_routes(
        &self,
        routes: &[&str],
        params: &[String],
        category: &str,
    ) -> (usize, usize, Option<CommandError>) {
        let mut optimized = 0;
        let mut failures = 0;
        let mut first_err = None;

        for route in routes {
            let cleaned = clean_route_line(route);
            if cleaned.is_empty() {
                continue;
            }
            match self.apply_route_change(&cleaned, params).await {
                Ok(()) => {
                    optimized += 1;
                    tracing::debug!(category, route = %cleaned, "route optimization applied");
                }
                Err(err) => {
                    tracing::debug!(category, route = %cleaned, error = %err, "route optimization skipped");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    failures += 1;
                }
            }
        }

        (optimized, failures, first_err)
    }

    async fn apply_route_change(
        &self,
        route_line: &str,
        params: &[String],
    ) -> Result<(), CommandError> {
        let mut args: Vec<&str> = vec!["route", "change"];
        args.extend(route_line.split_whitespace());
        args.extend(params.iter().map(String::as_str));
        self.runner.run("ip", &args).await?;
        Ok(())
    }

    pub(crate) async fn fetch_routes(
        &self,
        args: &[&str],
    ) -> Result<Vec<String>, CommandError> {
        let output = self.runner.run("ip", args).await?;
        Ok(output.lines().map(str::to_string).collect())
    }
}

struct RouteJob<'a> {
    category: &'static str,
    route_args: &'a [&'a str],
    filter: &'a (dyn Fn(&str) -> bool + Sync),
    params: RouteParams,
    fetch_operation: &'static str,
    apply_operation: &'static str,
    interface: Option<&'a str>,
}

impl RouteJob<'_> {
    fn context(&self, operation: &str) -> ErrorContext {
        let mut ctx = ErrorContext::new().op(operation);
        if let Some(iface) = self.interface {
            ctx = ctx.iface(iface);
        }
        ctx
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteParams {
    mtu: u32,
    init_cwnd: u64,
    init_rwnd: u64,
    congctl: Option<String>,
}

impl RouteParams {
    fn new(mtu: u32, init_cwnd: u64, init_rwnd: u64, congctl: Option<String>) -> Self {
        Self { mtu, init_cwnd, init_rwnd, congctl }
    }

    fn args(&self) -> Vec<String> {
        let mut result = vec![
            "mtu".to_string(),
            self.mtu.to_string(),
            "initcwnd".to_string(),
            self.init_cwnd.to_string(),
            "initrwnd".to_string(),
            self.init_rwnd.to_string(),
            "fastopen_no_cookie".to_string(),
            "1".to_string(),
        ];
        if let Some(congctl) = &self.congctl {
            result.push("congctl".to_string());
            result.push("lock".to_string());
            result.push(congctl.clone());
        }
        result
    }
}

/// Strips previously applied tuning tokens from a route line so the change
/// command gets a clean key.
pub(crate) fn clean_route_line(line: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut result: Vec<&str> = Vec::with_capacity(tokens.len());

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "mtu" | "initcwnd" | "initrwnd" | "fastopen_no_cookie" => {
                i += if i + 1 < tokens.len() { 2 } else { 1 };
            }
            "congctl" if i + 2 < tokens.len() && tokens[i + 1] == "lock" => {
                i += 3;
            }
            token => {
                result.push(token);
                i += 1;
            }
        }
    }

    result.join(" ")
}

/// `ceil(bytes / mss)`, zero when either side is zero.
pub(crate) fn bytes_to_segments(bytes: u64, mss: u64) -> u64 {
    if mss == 0 || bytes == 0 {
        return 0;
    }
    bytes.div_ceil(mss)
}
