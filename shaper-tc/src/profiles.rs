//! Static shaping profiles, one per interface class.
//!
//! Each profile carries the CAKE token vectors for the egress root qdisc and
//! the IFB (ingress) qdisc, the offload recipe, and an optional MTU
//! override. The offload order is fixed so signatures stay reproducible.

use std::time::Duration;

use crate::settings::ProfileSettings;

/// A single ethtool feature and the state it should be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadSetting {
    pub feature: &'static str,
    pub state: &'static str,
}

/// The qdisc and offload recipe for one interface class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingProfile {
    pub queue_len: String,
    pub root_qdisc: Vec<String>,
    pub ifb_qdisc: Vec<String>,
    pub offloads: Vec<OffloadSetting>,
    pub mtu_override: Option<String>,
}

/// The four profiles the reconciler dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSet {
    pub internal_virtual: ShapingProfile,
    pub external_virtual: ShapingProfile,
    pub external_physical: ShapingProfile,
    pub loopback: ShapingProfile,
}

const OFFLOAD_PREFIX: &[OffloadSetting] = &[
    OffloadSetting { feature: "rx", state: "on" },
    OffloadSetting { feature: "tx", state: "on" },
    OffloadSetting { feature: "sg", state: "off" },
    OffloadSetting { feature: "tso", state: "off" },
    OffloadSetting { feature: "gso", state: "off" },
];

const OFFLOAD_SUFFIX: &[OffloadSetting] = &[
    OffloadSetting { feature: "lro", state: "off" },
    OffloadSetting { feature: "ufo", state: "off" },
    OffloadSetting { feature: "rx-checksum", state: "on" },
    OffloadSetting { feature: "tx-checksum", state: "on" },
    OffloadSetting { feature: "tx-scatter-gather", state: "off" },
    OffloadSetting { feature: "tx-gso-partial", state: "off" },
];

impl ProfileSet {
    pub fn new(cfg: &ProfileSettings) -> Self {
        let queue = cfg.default_queue_len.to_string();
        let loopback_queue = cfg.loopback_queue_len.to_string();
        let internal_rtt = render_duration(cfg.internal_rtt);
        let loopback_rtt = render_duration(cfg.loopback_rtt);
        let loopback_mtu = cfg.loopback_mtu_override.to_string();

        let internal_root = tokens(&[
            "cake", "unlimited", "rtt", &internal_rtt, "besteffort", "dual-srchost",
            "nonat", "nowash", "no-split-gso", "ack-filter", "raw", "egress",
        ]);
        let internal_ifb = tokens(&[
            "cake", "unlimited", "rtt", &internal_rtt, "diffserv4", "dual-dsthost",
            "nonat", "nowash", "no-split-gso", "no-ack-filter", "raw", "ingress",
        ]);

        let external_root = tokens(&[
            "cake", "unlimited", "besteffort", "dual-srchost", "nonat",
            "nowash", "no-split-gso", "ack-filter", "ethernet", "egress",
        ]);
        let external_ifb = tokens(&[
            "cake", "unlimited", "diffserv4", "dual-dsthost", "nonat",
            "nowash", "no-split-gso", "no-ack-filter", "ethernet", "ingress",
        ]);

        let loopback_root = tokens(&[
            "cake", "unlimited", "rtt", &loopback_rtt, "diffserv4", "dual-srchost",
            "nonat", "nowash", "no-split-gso", "ack-filter-aggressive", "raw", "egress",
        ]);
        let loopback_ifb = tokens(&[
            "cake", "unlimited", "rtt", &loopback_rtt, "diffserv4", "dual-dsthost",
            "nonat", "nowash", "no-split-gso", "no-ack-filter", "raw", "ingress",
        ]);

        Self {
            internal_virtual: ShapingProfile {
                queue_len: queue.clone(),
                root_qdisc: internal_root,
                ifb_qdisc: internal_ifb,
                offloads: offloads_with_gro("off"),
                mtu_override: None,
            },
            external_virtual: ShapingProfile {
                queue_len: queue.clone(),
                root_qdisc: external_root.clone(),
                ifb_qdisc: external_ifb.clone(),
                offloads: offloads_with_gro("off"),
                mtu_override: None,
            },
            external_physical: ShapingProfile {
                queue_len: queue,
                root_qdisc: external_root,
                ifb_qdisc: external_ifb,
                offloads: offloads_with_gro("on"),
                mtu_override: None,
            },
            loopback: ShapingProfile {
                queue_len: loopback_queue,
                root_qdisc: loopback_root,
                ifb_qdisc: loopback_ifb,
                offloads: offloads_with_gro("off"),
                mtu_override: Some(loopback_mtu),
            },
        }
    }
}

fn tokens(spec: &[&str]) -> Vec<String> {
    spec.iter().map(|s| s.to_string()).collect()
}

/// The fixed prefix, the per-profile `gro` entry, then the fixed suffix.
fn offloads_with_gro(state: &'static str) -> Vec<OffloadSetting> {
    let mut result = Vec::with_capacity(OFFLOAD_PREFIX.len() + 1 + OFFLOAD_SUFFIX.len());
    result.extend_from_slice(OFFLOAD_PREFIX);
    result.push(OffloadSetting { feature: "gro", state });
    result.extend_from_slice(OFFLOAD_SUFFIX);
    result
}

/// Renders a duration as an ASCII tc time token (`100us`, `2ms`, `1s`).
pub(crate) fn render_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let micros = d.as_micros();
    if micros % 1_000_000 == 0 {
        format!("{}s", micros / 1_000_000)
    } else if micros % 1_000 == 0 {
        format!("{}ms", micros / 1_000)
    } else {
        format!("{micros}us")
    }
}
