//! NIC offload negotiation through ethtool.
//!
//! One `ethtool -k` read per interface; features marked `[fixed]` are left
//! alone, matching features are skipped, and the remaining mismatches are
//! batched into a single `ethtool -K` call. Kernels reject unsupported
//! feature bits with a handful of known messages that are treated as
//! success.

use rustc_hash::{FxHashMap, FxHashSet};
use shaper_core::error::ErrorContext;

use super::exec::string_args;
use super::Shaper;
use crate::profiles::OffloadSetting;

pub(crate) const SUPPRESS_OFFLOADS: &[&str] = &[
    "Operation not supported",
    "bit name not found",
    "cannot modify an unsupported parameter",
];

impl Shaper {
    pub(crate) async fn ensure_offloads(&self, iface: &str, settings: &[OffloadSetting]) {
        if settings.is_empty() {
            return;
        }

        let Some((current, fixed)) = self.read_ethtool_features(iface).await else {
            // The read failed; fall back to best-effort single calls.
            for setting in settings {
                let feature = normalize_set_feature_name(setting.feature);
                let args = string_args(&["-K", iface, &feature, setting.state]);
                if let Err(err) = self.run_optional("ethtool", &args, SUPPRESS_OFFLOADS).await {
                    self.log_optional(
                        "ethtool feature apply skipped",
                        err,
                        ErrorContext::new()
                            .iface(iface)
                            .command("ethtool -K")
                            .extra("feature", feature.clone())
                            .extra("state", setting.state),
                    );
                }
            }
            return;
        };

        let mut batched: Vec<String> = Vec::new();
        for setting in settings {
            let Some(read_key) = map_desired_to_read_key(setting.feature) else {
                continue;
            };
            if fixed.contains(read_key) {
                continue;
            }
            if current
                .get(read_key)
                .is_some_and(|state| state.eq_ignore_ascii_case(setting.state))
            {
                continue;
            }
            batched.push(normalize_set_feature_name(setting.feature));
            batched.push(setting.state.to_string());
        }

        if batched.is_empty() {
            return;
        }

        let mut args = vec!["-K".to_string(), iface.to_string()];
        args.extend(batched.iter().cloned());
        if let Err(err) = self.run_optional("ethtool", &args, SUPPRESS_OFFLOADS).await {
            self.log_optional(
                "batched ethtool features skipped",
                err,
                ErrorContext::new()
                    .iface(iface)
                    .command("ethtool -K")
                    .extra("features", batched.join(" ")),
            );
        }
    }

    async fn read_ethtool_features(
        &self,
        iface: &str,
    ) -> Option<(FxHashMap<String, String>, FxHashSet<String>)> {
        let output = self.run_get_output("ethtool", &["-k", iface]).await.ok()?;
        if output.trim().is_empty() {
            return None;
        }
        Some(parse_ethtool_features(&output))
    }
}

/// Parses `ethtool -k` output into feature states and the set of `[fixed]`
/// features.
pub(crate) fn parse_ethtool_features(
    output: &str,
) -> (FxHashMap<String, String>, FxHashSet<String>) {
    let mut features = FxHashMap::default();
    let mut fixed = FxHashSet::default();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("features for ") || lower.starts_with("offload parameters for ") {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().to_ascii_lowercase();

        let state = if value.contains("on") {
            "on"
        } else if value.contains("off") {
            "off"
        } else {
            ""
        };
        if value.contains("[fixed]") {
            fixed.insert(key.clone());
        }
        features.insert(key, state.to_string());
    }

    (features, fixed)
}

/// Maps feature aliases to the canonical `ethtool -K` set-name. The
/// checksum aliases collapse to the short `rx`/`tx` names the source tool
/// accepts.
pub(crate) fn normalize_set_feature_name(name: &str) -> String {
    match name.trim().to_ascii_lowercase().as_str() {
        "rx-checksum" | "rx_checksum" => "rx".to_string(),
        "tx-checksum" | "tx_checksum" => "tx".to_string(),
        other => other.to_string(),
    }
}

/// Maps a desired feature name to its `ethtool -k` output key.
pub(crate) fn map_desired_to_read_key(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "rx" | "rx-checksum" | "rx_checksum" => Some("rx-checksumming"),
        "tx" | "tx-checksum" | "tx_checksum" => Some("tx-checksumming"),
        "sg" | "scatter-gather" => Some("scatter-gather"),
        "tso" => Some("tcp-segmentation-offload"),
        "gso" => Some("generic-segmentation-offload"),
        "gro" => Some("generic-receive-offload"),
        "lro" => Some("large-receive-offload"),
        "ufo" => Some("udp-fragmentation-offload"),
        "tx-gso-partial" => Some("tx-gso-partial"),
        "tx-scatter-gather" => Some("tx-scatter-gather"),
        _ => None,
    }
}
