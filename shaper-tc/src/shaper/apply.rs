//! The apply pass: link enumeration, the bounded worker pool, and result
//! aggregation.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use shaper_core::error::{CategorizedError, ErrorContext, MultiError};
use shaper_core::LinkInfo;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Shaper;
use crate::classifier::LinkClass;
use crate::profiles::ShapingProfile;

#[derive(Default)]
struct WorkerStats {
    processed: usize,
    failed: usize,
    errors: Vec<CategorizedError>,
}

impl Shaper {
    /// Applies shaping to all interfaces (`only == None`) or to the provided
    /// set of names. Per-interface failures are aggregated and logged; only
    /// link enumeration failure aborts the pass.
    pub(crate) async fn apply_interfaces(
        self: &Arc<Self>,
        token: &CancellationToken,
        only: Option<FxHashSet<String>>,
    ) -> Result<(), CategorizedError> {
        let links = self.list_and_prepare_links().await?;

        self.ensure_initial_cleanup(&links).await;

        let required_ifbs = self.determine_required_ifbs(&links);

        if let Err(err) = self.apply_to_links(token, &links, only).await {
            self.log_error("interface configuration encountered errors", &err);
        }

        self.prune_stale_ifbs(&links, &required_ifbs).await;
        Ok(())
    }

    async fn list_and_prepare_links(&self) -> Result<Vec<LinkInfo>, CategorizedError> {
        let links = self.netlink.link_list().await.map_err(|err| {
            CategorizedError::critical(
                format!("list links: {err}"),
                ErrorContext::new().op("link_list"),
            )
        })?;

        if let Err(err) = self.classifier.refresh_external_interfaces().await {
            tracing::warn!(error = %err, "failed to refresh external interface cache");
        }

        Ok(links)
    }

    async fn apply_to_links(
        self: &Arc<Self>,
        token: &CancellationToken,
        links: &[LinkInfo],
        only: Option<FxHashSet<String>>,
    ) -> Result<(), CategorizedError> {
        if links.is_empty() {
            return Ok(());
        }

        let worker_count = self.worker_count.min(links.len()).max(1);
        let (tx, rx) = mpsc::channel::<LinkInfo>(links.len());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let only = only.map(Arc::new);

        let mut workers: JoinSet<WorkerStats> = JoinSet::new();
        for _ in 0..worker_count {
            let this = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let token = token.clone();
            let only = only.clone();
            workers.spawn(async move {
                let mut stats = WorkerStats::default();
                loop {
                    // Cancellation is observed between links; the link in
                    // flight finishes its steps.
                    if token.is_cancelled() {
                        break;
                    }
                    let link = { rx.lock().await.recv().await };
                    let Some(link) = link else { break };
                    match this.process_link(&link, only.as_deref()).await {
                        None => continue,
                        Some(Ok(())) => stats.processed += 1,
                        Some(Err(err)) => {
                            stats.processed += 1;
                            stats.failed += 1;
                            stats.errors.push(err);
                        }
                    }
                }
                stats
            });
        }

        for link in links {
            if tx.send(link.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut errs = MultiError::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(stats) => {
                    processed += stats.processed;
                    failed += stats.failed;
                    errs.extend(stats.errors);
                }
                Err(join_err) => errs.push(CategorizedError::recoverable(
                    format!("link worker failed: {join_err}"),
                    ErrorContext::new().op("apply_links"),
                )),
            }
        }

        if errs.is_empty() {
            return Ok(());
        }

        tracing::warn!(failed, processed, "some interfaces failed");
        Err(CategorizedError::wrap_recoverable(
            errs,
            "apply_links",
            ErrorContext::new()
                .extra("failed", failed.to_string())
                .extra("processed", processed.to_string()),
        ))
    }

    /// Classifies one link and dispatches it to its profile. Returns `None`
    /// for links the pass does not touch at all.
    async fn process_link(
        &self,
        link: &LinkInfo,
        only: Option<&FxHashSet<String>>,
    ) -> Option<Result<(), CategorizedError>> {
        let name = link.name.as_str();
        if name.is_empty() || name.starts_with("ifb") {
            return None;
        }
        if let Some(only) = only {
            if !only.contains(name) {
                return None;
            }
        }

        match self.classifier.classify(link) {
            LinkClass::Loopback => Some(
                self.apply_profile(link, &self.profiles.loopback, "loopback", "loopback configure failed")
                    .await,
            ),
            LinkClass::ExternalPhysical => Some(
                self.apply_profile(
                    link,
                    &self.profiles.external_physical,
                    "external-physical",
                    "external physical configure failed",
                )
                .await,
            ),
            LinkClass::ExternalVirtual => Some(
                self.apply_profile(
                    link,
                    &self.profiles.external_virtual,
                    "external-virtual",
                    "external virtual configure failed",
                )
                .await,
            ),
            LinkClass::InternalVirtual => Some(
                self.apply_profile(
                    link,
                    &self.profiles.internal_virtual,
                    "internal-virtual",
                    "internal virtual configure failed",
                )
                .await,
            ),
            LinkClass::InternalVirtualSkip => {
                tracing::debug!(interface = name, "skipping internal virtual interface");
                Some(Ok(()))
            }
            LinkClass::Unknown => {
                tracing::warn!(interface = name, "unknown interface classification");
                Some(Ok(()))
            }
        }
    }

    async fn apply_profile(
        &self,
        link: &LinkInfo,
        profile: &ShapingProfile,
        profile_name: &'static str,
        error_message: &'static str,
    ) -> Result<(), CategorizedError> {
        let result = self.configure_profile(link, profile, profile_name).await;
        if let Err(err) = &result {
            self.log_error(error_message, err);
        }
        result
    }
}
