//! The traffic-shaping reconciler.
//!
//! [`Shaper::apply`] runs the route optimizer and then converges every
//! relevant interface onto its shaping profile; [`Shaper::watch`] keeps the
//! host converged by reacting to netlink topology events. A desired-state
//! signature is recorded per interface after a fully successful apply so
//! unchanged interfaces cost nothing on reapply.

pub(crate) mod apply;
pub(crate) mod cleanup;
pub(crate) mod ethtool;
pub(crate) mod exec;
pub(crate) mod ifb;
pub(crate) mod steps;
pub(crate) mod watch;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use shaper_core::command::CommandRunner;
use shaper_core::error::{Category, CategorizedError, ErrorContext};
use shaper_core::netlink::Netlink;
use tokio_util::sync::CancellationToken;

use crate::classifier::InterfaceClassifier;
use crate::profiles::ProfileSet;
use crate::route::RouteOptimizer;
use crate::settings::{Settings, WatcherSettings};

/// Orchestrates traffic shaping for network interfaces.
pub struct Shaper {
    netlink: Arc<dyn Netlink>,
    runner: Arc<dyn CommandRunner>,
    route_optimizer: RouteOptimizer,
    classifier: InterfaceClassifier,
    profiles: ProfileSet,
    /// Interface name -> signature of the last fully applied configuration.
    applied: RwLock<FxHashMap<String, String>>,
    did_initial_cleanup: AtomicBool,
    watcher: WatcherSettings,
    worker_count: usize,
}

impl Shaper {
    pub fn new(
        settings: Settings,
        netlink: Arc<dyn Netlink>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        let settings = settings.with_defaults();
        let route_optimizer =
            RouteOptimizer::new(settings.routes, Arc::clone(&netlink), Arc::clone(&runner));
        let classifier = InterfaceClassifier::with_sysfs_root(
            Arc::clone(&netlink),
            settings.sysfs_net_root.clone(),
        );

        Arc::new(Self {
            netlink,
            runner,
            route_optimizer,
            classifier,
            profiles: ProfileSet::new(&settings.profiles),
            applied: RwLock::new(FxHashMap::default()),
            did_initial_cleanup: AtomicBool::new(false),
            watcher: settings.watcher,
            worker_count: settings.worker_count,
        })
    }

    /// Configures traffic shaping for all relevant interfaces. The route
    /// optimizer runs first; its failure never prevents interface shaping.
    pub async fn apply(self: &Arc<Self>, token: &CancellationToken) -> Result<(), CategorizedError> {
        if let Err(errs) = self.route_optimizer.optimize().await {
            let err = CategorizedError::recoverable(errs, ErrorContext::new().op("optimize_routes"));
            self.log_error("route optimization failed", &err);
        }

        self.apply_interfaces(token, None).await
    }

    pub(crate) fn log_error(&self, message: &str, err: &CategorizedError) {
        match err.category {
            Category::Optional => {
                tracing::debug!(category = %err.category, error = %err, "{message}")
            }
            _ => tracing::error!(category = %err.category, error = %err, "{message}"),
        }
    }

    pub(crate) fn log_optional(
        &self,
        message: &str,
        err: impl std::fmt::Display,
        context: ErrorContext,
    ) {
        tracing::debug!(error = %err, context = %context, "{message}");
    }
}
