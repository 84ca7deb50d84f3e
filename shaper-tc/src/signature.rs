//! Desired-state signatures.
//!
//! A signature summarizes the configuration an interface should end up with.
//! The reconciler stores the signature of the last fully successful apply per
//! interface and skips reapplies whose signature has not changed.

use crate::profiles::ShapingProfile;
use crate::shaper::ethtool::normalize_set_feature_name;

/// Builds the deterministic signature for a desired interface state.
///
/// Offload pairs are normalized and sorted so the result does not depend on
/// the recipe order.
pub fn make_signature(mtu: &str, qlen: &str, profile: &ShapingProfile) -> String {
    let mut out = String::new();
    out.push_str("mtu=");
    out.push_str(mtu);
    out.push_str(";qlen=");
    out.push_str(qlen);
    out.push_str(";root=");
    out.push_str(&profile.root_qdisc.join(","));
    out.push_str(";ifb=");
    out.push_str(&profile.ifb_qdisc.join(","));
    out.push_str(";off=");

    if !profile.offloads.is_empty() {
        let mut pairs: Vec<String> = profile
            .offloads
            .iter()
            .map(|o| {
                format!("{}={}", normalize_set_feature_name(o.feature), o.state.to_lowercase())
            })
            .collect();
        pairs.sort();
        out.push_str(&pairs.join(","));
    }

    out
}
