//! The ordered profile steps: link parameters, root qdisc, ingress + IFB,
//! offloads. The sequence stops at the first error and the signature is
//! committed only after the last step succeeds.

use shaper_core::error::{Category, CategorizedError, ErrorContext};
use shaper_core::LinkInfo;

use super::Shaper;
use crate::profiles::ShapingProfile;
use crate::settings::{MAX_MTU, MAX_QUEUE_LEN, MIN_MTU, MIN_QUEUE_LEN};
use crate::signature::make_signature;
use crate::tc::{
    ifb_name, ifb_root_qdisc_config, ingress_qdisc_config, root_qdisc_config, FilterConfig,
};

pub(crate) struct ProfileContext<'a> {
    pub iface: &'a str,
    pub attrs: &'a LinkInfo,
    pub profile: &'a ShapingProfile,
    pub profile_name: &'static str,
    pub mtu_str: String,
    pub queue_len: String,
    pub desired_mtu: u32,
    pub desired_qlen: u32,
    pub signature: String,
    pub ifb_name: String,
}

impl Shaper {
    pub(crate) async fn configure_profile(
        &self,
        attrs: &LinkInfo,
        profile: &ShapingProfile,
        profile_name: &'static str,
    ) -> Result<(), CategorizedError> {
        let Some(pc) = self.build_profile_context(attrs, profile, profile_name).await? else {
            // Already configured with a live mirror.
            return Ok(());
        };

        self.configure_link_params(&pc).await?;
        self.configure_root_qdisc(&pc).await?;
        self.configure_ingress_and_ifb(&pc).await?;
        self.ensure_offloads(pc.iface, &pc.profile.offloads).await;

        self.applied.write().unwrap().insert(pc.iface.to_string(), pc.signature.clone());
        tracing::info!(interface = pc.iface, profile = pc.profile_name, "interface shaped");
        Ok(())
    }

    /// Builds the configuration context for an interface, or `None` when the
    /// recorded signature matches and the IFB mirror is up.
    async fn build_profile_context<'a>(
        &self,
        attrs: &'a LinkInfo,
        profile: &'a ShapingProfile,
        profile_name: &'static str,
    ) -> Result<Option<ProfileContext<'a>>, CategorizedError> {
        if attrs.name.is_empty() {
            return Err(CategorizedError::recoverable(
                "link name missing for profile",
                ErrorContext::new().profile(profile_name),
            ));
        }
        let iface = attrs.name.as_str();

        let mtu_str =
            profile.mtu_override.clone().unwrap_or_else(|| attrs.mtu.to_string());
        let queue_len = profile.queue_len.clone();
        let signature = make_signature(&mtu_str, &queue_len, profile);

        if self.is_already_configured(iface, &signature).await {
            return Ok(None);
        }

        let (desired_mtu, desired_qlen) =
            parse_profile_parameters(iface, &mtu_str, &queue_len, profile_name)?;

        Ok(Some(ProfileContext {
            iface,
            attrs,
            profile,
            profile_name,
            desired_mtu,
            desired_qlen,
            signature,
            ifb_name: ifb_name(iface),
            mtu_str,
            queue_len,
        }))
    }

    /// The skip check: the signature of the last successful apply matches
    /// and the mirror device exists and is up.
    async fn is_already_configured(&self, iface: &str, signature: &str) -> bool {
        {
            let applied = self.applied.read().unwrap();
            if applied.get(iface).map(String::as_str) != Some(signature) {
                return false;
            }
        }

        match self.netlink.link_by_name(&ifb_name(iface)).await {
            Ok(Some(link)) => link.up,
            _ => false,
        }
    }

    async fn configure_link_params(&self, pc: &ProfileContext<'_>) -> Result<(), CategorizedError> {
        if pc.attrs.mtu == pc.desired_mtu && pc.attrs.tx_queue_len == pc.desired_qlen {
            return Ok(());
        }

        if pc.attrs.mtu != pc.desired_mtu {
            self.netlink.link_set_mtu(pc.attrs.index, pc.desired_mtu).await.map_err(|err| {
                CategorizedError::wrap_recoverable(
                    format!("set mtu {} for {}: {err}", pc.desired_mtu, pc.iface),
                    "configure_link_params",
                    ErrorContext::new()
                        .iface(pc.iface)
                        .profile(pc.profile_name)
                        .value(pc.mtu_str.as_str()),
                )
            })?;
        }

        if pc.attrs.tx_queue_len != pc.desired_qlen {
            self.netlink
                .link_set_tx_queue_len(pc.attrs.index, pc.desired_qlen)
                .await
                .map_err(|err| {
                    CategorizedError::wrap_recoverable(
                        format!("set tx queue len {} for {}: {err}", pc.desired_qlen, pc.iface),
                        "configure_link_params",
                        ErrorContext::new()
                            .iface(pc.iface)
                            .profile(pc.profile_name)
                            .value(pc.queue_len.as_str()),
                    )
                })?;
        }

        Ok(())
    }

    async fn configure_root_qdisc(&self, pc: &ProfileContext<'_>) -> Result<(), CategorizedError> {
        if pc.profile.root_qdisc.is_empty() {
            return Ok(());
        }
        let qdisc = root_qdisc_config(pc.iface, &pc.profile.root_qdisc);
        self.run("tc", &qdisc.replace_args()).await.map_err(|err| {
            CategorizedError::wrap_recoverable(
                format!("configure root qdisc for {}: {err}", pc.iface),
                "configure_root_qdisc",
                ErrorContext::new()
                    .iface(pc.iface)
                    .profile(pc.profile_name)
                    .command("tc qdisc replace root"),
            )
        })
    }

    async fn configure_ingress_and_ifb(
        &self,
        pc: &ProfileContext<'_>,
    ) -> Result<(), CategorizedError> {
        let ingress = ingress_qdisc_config(pc.iface);
        self.run("tc", &ingress.replace_args()).await.map_err(|err| {
            CategorizedError::wrap_recoverable(
                format!("configure ingress qdisc for {}: {err}", pc.iface),
                "configure_ingress_qdisc",
                ErrorContext::new()
                    .iface(pc.iface)
                    .profile(pc.profile_name)
                    .command("tc qdisc replace ingress"),
            )
        })?;

        self.ensure_ifb(&pc.ifb_name, &pc.mtu_str, &pc.queue_len).await.map_err(|err| {
            CategorizedError::new(
                Category::Recoverable,
                format!("ensure ifb {} for {}: {err}", pc.ifb_name, pc.iface),
                ErrorContext::new()
                    .op("ensure_ifb")
                    .iface(pc.iface)
                    .profile(pc.profile_name)
                    .ifb(pc.ifb_name.as_str()),
            )
        })?;

        if !pc.profile.ifb_qdisc.is_empty() {
            let ifb_root = ifb_root_qdisc_config(&pc.ifb_name, &pc.profile.ifb_qdisc);
            self.run("tc", &ifb_root.replace_args()).await.map_err(|err| {
                CategorizedError::wrap_recoverable(
                    format!("configure ifb root qdisc {}: {err}", pc.ifb_name),
                    "configure_ifb_root_qdisc",
                    ErrorContext::new()
                        .iface(pc.iface)
                        .profile(pc.profile_name)
                        .ifb(pc.ifb_name.as_str())
                        .command("tc qdisc replace ifb"),
                )
            })?;
        }

        let filter = FilterConfig::mirred_redirect(pc.iface, &pc.ifb_name);
        self.replace_filter(&filter).await.map_err(|err| {
            CategorizedError::wrap_recoverable(
                format!("replace filter for {} -> {}: {err}", pc.iface, pc.ifb_name),
                "configure_tc_filter",
                ErrorContext::new()
                    .iface(pc.iface)
                    .profile(pc.profile_name)
                    .ifb(pc.ifb_name.as_str())
                    .command("tc filter replace"),
            )
        })?;

        Ok(())
    }
}

/// Validates and converts the MTU and queue-length strings.
fn parse_profile_parameters(
    iface: &str,
    mtu_str: &str,
    queue_len: &str,
    profile_name: &'static str,
) -> Result<(u32, u32), CategorizedError> {
    let desired_mtu: u32 = mtu_str.parse().map_err(|_| {
        interface_error(
            format!("parse mtu {mtu_str:?} for {iface}"),
            iface,
            "parse_profile_mtu",
            profile_name,
            mtu_str,
        )
    })?;
    if !(MIN_MTU..=MAX_MTU).contains(&desired_mtu) {
        return Err(interface_error(
            format!("mtu {desired_mtu} out of range [{MIN_MTU}, {MAX_MTU}]"),
            iface,
            "validate_profile_mtu",
            profile_name,
            mtu_str,
        ));
    }

    let desired_qlen: u32 = queue_len.parse().map_err(|_| {
        interface_error(
            format!("parse qlen {queue_len:?} for {iface}"),
            iface,
            "parse_profile_queue",
            profile_name,
            queue_len,
        )
    })?;
    if !(MIN_QUEUE_LEN..=MAX_QUEUE_LEN).contains(&desired_qlen) {
        return Err(interface_error(
            format!("queue length {desired_qlen} out of range [{MIN_QUEUE_LEN}, {MAX_QUEUE_LEN}]"),
            iface,
            "validate_profile_queue",
            profile_name,
            queue_len,
        ));
    }

    Ok((desired_mtu, desired_qlen))
}

fn interface_error(
    message: String,
    iface: &str,
    operation: &str,
    profile_name: &str,
    value: &str,
) -> CategorizedError {
    CategorizedError::new(
        Category::Recoverable,
        message,
        ErrorContext::new().op(operation).iface(iface).profile(profile_name).value(value),
    )
}
