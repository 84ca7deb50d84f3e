//! IFB mirror management: creation, parameter sync, and stale pruning.

use rustc_hash::FxHashSet;
use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::LinkInfo;

use super::exec::string_args;
use super::Shaper;
use crate::tc::IFB_PREFIX;

impl Shaper {
    /// Ensures an IFB device exists with the desired MTU and queue length
    /// and is up.
    pub(crate) async fn ensure_ifb(
        &self,
        name: &str,
        mtu: &str,
        qlen: &str,
    ) -> Result<(), CategorizedError> {
        let mut link = match self.netlink.link_by_name(name).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                self.run("ip", &string_args(&["link", "add", "name", name, "type", "ifb"]))
                    .await
                    .map_err(|err| {
                        CategorizedError::recoverable(
                            format!("create ifb {name}: {err}"),
                            ErrorContext::new().ifb(name).command("ip link add"),
                        )
                    })?;
                match self.netlink.link_by_name(name).await {
                    Ok(Some(link)) => link,
                    _ => {
                        return Err(CategorizedError::recoverable(
                            format!("lookup ifb {name} after create"),
                            ErrorContext::new().ifb(name).op("link_lookup_post_create"),
                        ))
                    }
                }
            }
            Err(err) => {
                return Err(CategorizedError::recoverable(
                    format!("lookup ifb {name}: {err}"),
                    ErrorContext::new().ifb(name).op("link_lookup"),
                ))
            }
        };

        let desired_mtu: u32 = mtu.parse().map_err(|_| {
            CategorizedError::recoverable(
                format!("parse mtu {mtu:?} for {name}"),
                ErrorContext::new().ifb(name).value(mtu),
            )
        })?;
        let desired_qlen: u32 = qlen.parse().map_err(|_| {
            CategorizedError::recoverable(
                format!("parse qlen {qlen:?} for {name}"),
                ErrorContext::new().ifb(name).value(qlen),
            )
        })?;

        if link.mtu != desired_mtu || link.tx_queue_len != desired_qlen {
            self.run("ip", &string_args(&["link", "set", name, "qlen", qlen, "mtu", mtu]))
                .await
                .map_err(|err| {
                    CategorizedError::recoverable(
                        format!("update ifb {name} parameters: {err}"),
                        ErrorContext::new().ifb(name).command("ip link set"),
                    )
                })?;
            if let Ok(Some(refreshed)) = self.netlink.link_by_name(name).await {
                link = refreshed;
            }
        }

        if !link.up {
            self.run("ip", &string_args(&["link", "set", name, "up"])).await.map_err(|err| {
                CategorizedError::recoverable(
                    format!("set ifb {name} up: {err}"),
                    ErrorContext::new().ifb(name).command("ip link set up"),
                )
            })?;
        }

        Ok(())
    }

    /// Removes IFB devices that no longer correspond to a base interface.
    pub(crate) async fn prune_stale_ifbs(
        &self,
        links: &[LinkInfo],
        required_ifbs: &FxHashSet<String>,
    ) {
        for link in links {
            let name = link.name.as_str();
            if !name.starts_with(IFB_PREFIX) || required_ifbs.contains(name) {
                continue;
            }

            match self.netlink.link_del(link.index).await {
                Ok(()) => tracing::debug!(interface = name, "pruned stale ifb"),
                Err(_) => {
                    // ip as a fallback, then give up quietly.
                    if let Err(err) =
                        self.run_quiet("ip", &string_args(&["link", "del", name])).await
                    {
                        self.log_optional(
                            "fallback ifb delete failed",
                            err,
                            ErrorContext::new().ifb(name).command("ip link del"),
                        );
                    }
                }
            }
        }
    }
}
