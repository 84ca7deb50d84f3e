//! Interface classification with routing awareness.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use shaper_core::netlink::{Netlink, NetlinkError, RouteFamily};
use shaper_core::LinkInfo;

use crate::patterns;

/// The classification of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkClass {
    Unknown,
    Loopback,
    /// Physical interface that carries external traffic.
    ExternalPhysical,
    /// Virtual interface that carries external traffic.
    ExternalVirtual,
    /// Virtual interface that carries only internal traffic.
    InternalVirtual,
    /// Virtual interface skipped entirely (matches skip prefixes).
    InternalVirtualSkip,
}

const DEFAULT_EXTERNAL_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct ClassifierCache {
    /// Link indexes that carry a default route.
    external_link_indexes: FxHashSet<u32>,
    /// Interface name -> is virtual.
    virtual_cache: FxHashMap<String, bool>,
    last_refresh: Option<Instant>,
}

/// Classifies links using name prefixes, sysfs inspection, driver and vendor
/// lookup, and default-route membership.
pub struct InterfaceClassifier {
    netlink: Arc<dyn Netlink>,
    sysfs_root: PathBuf,
    refresh_interval: Duration,
    cache: RwLock<ClassifierCache>,
}

impl InterfaceClassifier {
    pub fn new(netlink: Arc<dyn Netlink>) -> Self {
        Self::with_sysfs_root(netlink, PathBuf::from("/sys/class/net"))
    }

    /// Classifier with an alternative sysfs view. Tests point this at a
    /// fixture tree.
    pub fn with_sysfs_root(netlink: Arc<dyn Netlink>, sysfs_root: PathBuf) -> Self {
        Self {
            netlink,
            sysfs_root,
            refresh_interval: DEFAULT_EXTERNAL_REFRESH_INTERVAL,
            cache: RwLock::new(ClassifierCache::default()),
        }
    }

    /// Determines the class of a network interface.
    ///
    /// Classification priority:
    ///  1. loopback flag
    ///  2. internal skip prefixes
    ///  3. virtual-hardware detection (prefixes, sysfs path, driver, vendor)
    ///  4. external-traffic detection (external prefixes, default routes)
    ///
    /// Physical interfaces without a visible default route are treated as
    /// external: physical NICs are expected to carry outbound traffic even
    /// when routes are not yet visible at classification time.
    pub fn classify(&self, attrs: &LinkInfo) -> LinkClass {
        if attrs.loopback {
            return LinkClass::Loopback;
        }

        let name = attrs.name.as_str();
        if name.is_empty() {
            return LinkClass::Unknown;
        }

        if patterns::has_internal_virtual_prefix(name) {
            tracing::debug!(interface = name, "classified as internal virtual skip (name prefix)");
            return LinkClass::InternalVirtualSkip;
        }

        let is_virtual = self.is_virtual_interface(name);
        let is_external = self.is_external_interface(attrs.index, name);

        match (is_external, is_virtual) {
            (true, true) => {
                tracing::debug!(interface = name, "classified as external virtual");
                LinkClass::ExternalVirtual
            }
            (true, false) => {
                tracing::debug!(interface = name, "classified as external physical");
                LinkClass::ExternalPhysical
            }
            (false, true) => {
                tracing::debug!(interface = name, "classified as internal virtual");
                LinkClass::InternalVirtual
            }
            (false, false) => {
                tracing::debug!(interface = name, "classified as external physical (fallback)");
                LinkClass::ExternalPhysical
            }
        }
    }

    /// Rebuilds the cache of interfaces that carry a default route. Skipped
    /// when the previous refresh is younger than the refresh interval; the
    /// first call always refreshes.
    pub async fn refresh_external_interfaces(&self) -> Result<(), NetlinkError> {
        {
            let cache = self.cache.read().unwrap();
            if let Some(last) = cache.last_refresh {
                let since = last.elapsed();
                if since < self.refresh_interval {
                    tracing::debug!(
                        since_last_refresh = ?since,
                        refresh_interval = ?self.refresh_interval,
                        "skipping external interface refresh"
                    );
                    return Ok(());
                }
            }
        }

        let mut link_indexes = FxHashSet::default();
        for (family, label) in [(RouteFamily::V4, "ipv4"), (RouteFamily::V6, "ipv6")] {
            let routes = match self.netlink.route_list(family).await {
                Ok(routes) => routes,
                Err(err) => {
                    tracing::warn!(
                        family = label,
                        error = %err,
                        "failed to list routes for external interface detection"
                    );
                    continue;
                }
            };

            for route in routes {
                let Some(index) = route.link_index.filter(|&i| i > 0) else {
                    continue;
                };
                if !route.is_default() {
                    continue;
                }
                link_indexes.insert(index);
                tracing::debug!(
                    link_index = index,
                    family = label,
                    gateway = ?route.gateway,
                    "detected default route for interface"
                );
            }
        }

        let external_count = link_indexes.len();
        {
            let mut cache = self.cache.write().unwrap();
            cache.external_link_indexes = link_indexes;
            cache.last_refresh = Some(Instant::now());
        }

        tracing::info!(
            external_interfaces = external_count,
            refresh_interval = ?self.refresh_interval,
            "refreshed external interface cache"
        );
        Ok(())
    }

    /// An interface is external when its name matches an external-virtual
    /// pattern (VPNs, tunnels) or its index is cached as having a default
    /// route.
    fn is_external_interface(&self, link_index: u32, name: &str) -> bool {
        if patterns::has_external_virtual_prefix(name) {
            return true;
        }
        if link_index == 0 {
            return false;
        }
        self.cache.read().unwrap().external_link_indexes.contains(&link_index)
    }

    fn is_virtual_interface(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }

        if let Some(&cached) = self.cache.read().unwrap().virtual_cache.get(name) {
            return cached;
        }

        let is_virtual = detect_virtual_hardware(&self.sysfs_root, name);

        self.cache.write().unwrap().virtual_cache.insert(name.to_string(), is_virtual);
        is_virtual
    }
}

fn detect_virtual_hardware(sysfs_root: &Path, name: &str) -> bool {
    // Name patterns are the fast path.
    if patterns::has_internal_virtual_prefix(name) || patterns::has_external_virtual_prefix(name) {
        return true;
    }

    let sysfs_path = sysfs_root.join(name);

    if let Ok(resolved) = std::fs::canonicalize(&sysfs_path) {
        if is_sysfs_virtual_path(&resolved) {
            return true;
        }
    }

    if let Some(driver) = interface_driver_module(&sysfs_path) {
        if patterns::is_virtual_driver_module(&driver) {
            return true;
        }
    }

    if let Some(vendor) = interface_vendor(&sysfs_path) {
        if patterns::is_virtual_vendor_id(&vendor) {
            return true;
        }
    }

    false
}

/// Checks whether a resolved sysfs path indicates a virtual device.
fn is_sysfs_virtual_path(resolved: &Path) -> bool {
    let lower = resolved.to_string_lossy().to_ascii_lowercase();

    if lower.contains("/devices/virtual/") {
        return true;
    }

    // VirtIO and Hyper-V bus devices show up as path components, not as the
    // virtual-devices tree.
    lower.split('/').any(|segment| segment.starts_with("virtio") || segment == "vmbus")
}

/// Extracts the kernel driver module name: `device/driver/module` for
/// modular drivers, `device/driver` for built-ins.
fn interface_driver_module(sysfs_path: &Path) -> Option<String> {
    read_link_base(&sysfs_path.join("device/driver/module"))
        .or_else(|| read_link_base(&sysfs_path.join("device/driver")))
}

fn interface_vendor(sysfs_path: &Path) -> Option<String> {
    std::fs::read_to_string(sysfs_path.join("device/vendor"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Basename of a symlink target.
fn read_link_base(path: &Path) -> Option<String> {
    let target = std::fs::read_link(path).ok()?;
    target.file_name().map(|base| base.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockNetlink;
    use shaper_core::netlink::RouteInfo;
    use tempfile::TempDir;

    fn link(index: u32, name: &str) -> LinkInfo {
        LinkInfo { index, name: name.to_string(), mtu: 1500, tx_queue_len: 1000, up: true, loopback: false }
    }

    fn classifier_with(
        netlink: Arc<MockNetlink>,
        sysfs: &TempDir,
    ) -> InterfaceClassifier {
        InterfaceClassifier::with_sysfs_root(netlink, sysfs.path().to_path_buf())
    }

    /// Creates `<root>/<name>` as a symlink into a device tree, with
    /// optional driver module and vendor files.
    fn add_sysfs_device(
        root: &TempDir,
        name: &str,
        device_subtree: &str,
        driver_module: Option<&str>,
        vendor: Option<&str>,
    ) {
        let device_dir = root.path().join(device_subtree).join(name);
        std::fs::create_dir_all(&device_dir).unwrap();
        std::os::unix::fs::symlink(&device_dir, root.path().join(name)).unwrap();

        if let Some(module) = driver_module {
            let module_dir = root.path().join("module").join(module);
            std::fs::create_dir_all(&module_dir).unwrap();
            let driver_dir = device_dir.join("device/driver");
            std::fs::create_dir_all(&driver_dir).unwrap();
            std::os::unix::fs::symlink(&module_dir, driver_dir.join("module")).unwrap();
        }

        if let Some(vendor) = vendor {
            let device = device_dir.join("device");
            std::fs::create_dir_all(&device).unwrap();
            std::fs::write(device.join("vendor"), format!("{vendor}\n")).unwrap();
        }
    }

    #[tokio::test]
    async fn loopback_flag_wins() {
        let sysfs = TempDir::new().unwrap();
        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        let mut lo = link(1, "lo");
        lo.loopback = true;
        assert_eq!(classifier.classify(&lo), LinkClass::Loopback);
    }

    #[tokio::test]
    async fn skip_prefixes_win_over_everything_else() {
        let sysfs = TempDir::new().unwrap();
        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        assert_eq!(classifier.classify(&link(5, "docker0")), LinkClass::InternalVirtualSkip);
        assert_eq!(classifier.classify(&link(6, "veth01ab")), LinkClass::InternalVirtualSkip);
        assert_eq!(classifier.classify(&link(7, "virbr0")), LinkClass::InternalVirtualSkip);
    }

    #[tokio::test]
    async fn physical_nic_with_default_route_is_external_physical() {
        let sysfs = TempDir::new().unwrap();
        add_sysfs_device(&sysfs, "eth0", "devices/pci0000:00", None, Some("0x8086"));

        let netlink = MockNetlink::with_links(vec![]);
        netlink.push_route_v4(RouteInfo { link_index: Some(2), ..Default::default() });
        let classifier = classifier_with(netlink, &sysfs);
        classifier.refresh_external_interfaces().await.unwrap();

        assert_eq!(classifier.classify(&link(2, "eth0")), LinkClass::ExternalPhysical);
    }

    #[tokio::test]
    async fn virtio_driver_without_default_route_is_internal_virtual() {
        let sysfs = TempDir::new().unwrap();
        add_sysfs_device(&sysfs, "ens3", "devices/pci0000:00", Some("virtio_net"), None);

        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        assert_eq!(classifier.classify(&link(3, "ens3")), LinkClass::InternalVirtual);
    }

    #[tokio::test]
    async fn virtual_devices_tree_is_detected() {
        let sysfs = TempDir::new().unwrap();
        add_sysfs_device(&sysfs, "dummy0", "devices/virtual/net", None, None);

        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        assert_eq!(classifier.classify(&link(9, "dummy0")), LinkClass::InternalVirtual);
    }

    #[tokio::test]
    async fn wireguard_prefix_is_external_virtual() {
        let sysfs = TempDir::new().unwrap();
        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        assert_eq!(classifier.classify(&link(4, "wg0")), LinkClass::ExternalVirtual);
    }

    #[tokio::test]
    async fn physical_without_routes_falls_back_to_external_physical() {
        let sysfs = TempDir::new().unwrap();
        add_sysfs_device(&sysfs, "enp3s0", "devices/pci0000:00", None, Some("0x8086"));

        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);
        assert_eq!(classifier.classify(&link(8, "enp3s0")), LinkClass::ExternalPhysical);
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let sysfs = TempDir::new().unwrap();
        add_sysfs_device(&sysfs, "ens3", "devices/pci0000:00", Some("virtio_net"), None);
        let classifier = classifier_with(MockNetlink::with_links(vec![]), &sysfs);

        let attrs = link(3, "ens3");
        let first = classifier.classify(&attrs);
        for _ in 0..5 {
            assert_eq!(classifier.classify(&attrs), first);
        }
    }

    #[tokio::test]
    async fn refresh_respects_interval() {
        let sysfs = TempDir::new().unwrap();
        let netlink = MockNetlink::with_links(vec![]);
        let classifier = classifier_with(Arc::clone(&netlink), &sysfs);

        classifier.refresh_external_interfaces().await.unwrap();
        let after_first = netlink.route_list_calls();
        assert_eq!(after_first, 2); // v4 + v6

        // Within the interval the second refresh is a no-op.
        classifier.refresh_external_interfaces().await.unwrap();
        assert_eq!(netlink.route_list_calls(), after_first);
    }

    #[tokio::test]
    async fn subnet_routes_do_not_mark_external() {
        let sysfs = TempDir::new().unwrap();
        let netlink = MockNetlink::with_links(vec![]);
        netlink.push_route_v4(RouteInfo {
            link_index: Some(2),
            destination: Some(("10.0.0.0".parse().unwrap(), 24)),
            ..Default::default()
        });
        let classifier = classifier_with(netlink, &sysfs);
        classifier.refresh_external_interfaces().await.unwrap();

        // No default route, no virtual markers: fallback class.
        let sysfs_missing = classifier.classify(&link(2, "eno1"));
        assert_eq!(sysfs_missing, LinkClass::ExternalPhysical);
    }
}
