//! Name, driver, and vendor patterns used by interface classification.

/// Naming patterns for internal-only virtual interfaces. These are skipped
/// from tc configuration entirely.
pub const INTERNAL_VIRTUAL_PREFIXES: &[&str] = &[
    "br",     // Linux bridge
    "docker", // Docker container bridge
    "veth",   // virtual ethernet pair (container)
    "virbr",  // libvirt bridge
    "fwbr",   // firewall bridge (Proxmox/OpenStack)
    "fwpr",   // firewall provider
    "fwln",   // firewall link
    "tap",
];

/// Naming patterns for external-facing virtual interfaces (VPNs, tunnels,
/// overlays). These may carry external traffic and get shaped.
pub const EXTERNAL_VIRTUAL_PREFIXES: &[&str] = &[
    "tun",     // TUN device (VPN)
    "tap",     // TAP device (VPN)
    "wg",      // WireGuard
    "zt",      // ZeroTier
    "gre",     // GRE tunnel
    "gretap",  // GRE tunnel tap
    "sit",     // IPv6-in-IPv4 tunnel
    "vxlan",   // VXLAN overlay
    "macvlan", // MAC VLAN
    "macvtap", // MAC VLAN tap
    "ipvlan",  // IP VLAN
];

/// Kernel modules of paravirtualized NICs, read from
/// `/sys/class/net/<iface>/device/driver[/module]`.
pub const VIRTUAL_DRIVER_MODULES: &[&str] = &[
    "ena",        // AWS Elastic Network Adapter
    "gve",        // Google Virtual Ethernet
    "hv_netvsc",  // Hyper-V network service client
    "netvsc",     // legacy Hyper-V driver
    "virtio_net", // VirtIO (KVM/QEMU)
    "virtio_pci", // VirtIO PCI transport
    "vmxnet3",    // VMware paravirtualized NIC
];

/// PCI vendor ids of virtualization platforms, read from
/// `/sys/class/net/<iface>/device/vendor`.
pub const VIRTUAL_VENDOR_IDS: &[&str] = &[
    "0x1414", // Microsoft Hyper-V
    "0x15ad", // VMware
    "0x1af4", // Red Hat (VirtIO)
    "0x1d0f", // Amazon Web Services
    "0x1ae0", // Google Cloud Platform
    "0x1ec1", // Alibaba Cloud
    "0x5853", // XenSource
];

pub fn has_internal_virtual_prefix(name: &str) -> bool {
    INTERNAL_VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

pub fn has_external_virtual_prefix(name: &str) -> bool {
    EXTERNAL_VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

pub fn is_virtual_driver_module(module: &str) -> bool {
    let normalized = normalize_identifier(module);
    VIRTUAL_DRIVER_MODULES.contains(&normalized.as_str())
}

pub fn is_virtual_vendor_id(vendor: &str) -> bool {
    let normalized = normalize_identifier(vendor);
    VIRTUAL_VENDOR_IDS.contains(&normalized.as_str())
}

/// Canonicalizes vendor ids and driver names. Some systems report
/// hyphenated module names (`hv-netvsc`).
fn normalize_identifier(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', "_")
}
