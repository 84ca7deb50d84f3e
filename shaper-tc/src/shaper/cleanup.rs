//! One-time cleanup of skip-prefixed interfaces, required-IFB computation,
//! and stale-signature pruning.

use std::sync::atomic::Ordering;

use rustc_hash::FxHashSet;
use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::LinkInfo;

use super::exec::string_args;
use super::Shaper;
use crate::classifier::LinkClass;
use crate::patterns;
use crate::tc::{ifb_name, INGRESS_HANDLE};

impl Shaper {
    /// Runs the skipped-interface cleanup exactly once per process
    /// lifetime.
    pub(crate) async fn ensure_initial_cleanup(&self, links: &[LinkInfo]) {
        if self.did_initial_cleanup.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanup_skipped_virtual_interfaces(links).await;
    }

    /// Removes qdisc and IFB state left on skip-prefixed interfaces by runs
    /// that predate the skip rules. All failures are benign.
    async fn cleanup_skipped_virtual_interfaces(&self, links: &[LinkInfo]) {
        for link in links {
            let name = link.name.as_str();
            if name.starts_with("ifb") || link.loopback {
                continue;
            }
            if !patterns::has_internal_virtual_prefix(name) {
                continue;
            }

            if let Err(err) =
                self.run_quiet("tc", &string_args(&["qdisc", "del", "dev", name, "root"])).await
            {
                self.log_optional(
                    "skip virtual qdisc root cleanup",
                    err,
                    ErrorContext::new().iface(name).command("tc qdisc del root"),
                );
            }
            if let Err(err) = self
                .run_quiet(
                    "tc",
                    &string_args(&["qdisc", "del", "dev", name, "handle", INGRESS_HANDLE, "ingress"]),
                )
                .await
            {
                self.log_optional(
                    "skip virtual ingress qdisc cleanup",
                    err,
                    ErrorContext::new().iface(name).command("tc qdisc del ingress"),
                );
            }

            let ifb = ifb_name(name);
            if let Err(err) = self.run_quiet("ip", &string_args(&["link", "del", &ifb])).await {
                self.log_optional(
                    "skip virtual ifb cleanup",
                    err,
                    ErrorContext::new().ifb(ifb.as_str()).command("ip link del"),
                );
            }

            tracing::debug!(interface = name, "cleaned up qdisc from skipped virtual interface");
        }
    }

    /// The set of IFB names the current link table requires: one mirror per
    /// shaped interface.
    pub(crate) fn determine_required_ifbs(&self, links: &[LinkInfo]) -> FxHashSet<String> {
        let mut required = FxHashSet::default();
        for link in links {
            let name = link.name.as_str();
            if name.is_empty() || name.starts_with("ifb") {
                continue;
            }
            match self.classifier.classify(link) {
                LinkClass::Loopback
                | LinkClass::ExternalPhysical
                | LinkClass::ExternalVirtual
                | LinkClass::InternalVirtual => {
                    required.insert(ifb_name(name));
                }
                LinkClass::InternalVirtualSkip | LinkClass::Unknown => {}
            }
        }
        required
    }

    /// Drops applied signatures whose interface no longer exists.
    pub(crate) async fn cleanup_stale_signatures(&self) -> Result<(), CategorizedError> {
        let links = self.netlink.link_list().await.map_err(|err| {
            CategorizedError::recoverable(
                format!("list links for signature cleanup: {err}"),
                ErrorContext::new().op("link_list_cleanup"),
            )
        })?;

        let current: FxHashSet<&str> =
            links.iter().map(|l| l.name.as_str()).filter(|n| !n.is_empty()).collect();

        self.applied.write().unwrap().retain(|name, _| current.contains(name.as_str()));
        Ok(())
    }
}
