//! Primary-NIC discovery and route-line predicates.

use shaper_core::netlink::RouteFamily;

use super::RouteOptimizer;

impl RouteOptimizer {
    /// Detects the primary external interface: netlink first, with a
    /// command-output fallback when netlink yields nothing.
    pub(crate) async fn primary_nic(&self) -> Result<String, String> {
        match self.primary_nic_from_netlink().await {
            Ok(nic) if !nic.is_empty() => return Ok(nic),
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "netlink primary NIC detection failed");
            }
        }
        self.primary_nic_from_command().await
    }

    async fn primary_nic_from_netlink(&self) -> Result<String, String> {
        let routes = self
            .netlink
            .route_list(RouteFamily::V4)
            .await
            .map_err(|err| format!("route list: {err}"))?;

        // Prefer a default route with a resolvable link name.
        for route in &routes {
            if route.destination.is_some() {
                continue;
            }
            let Some(index) = route.link_index.filter(|&i| i > 0) else {
                continue;
            };
            if let Ok(Some(link)) = self.netlink.link_by_index(index).await {
                if !link.name.is_empty() {
                    return Ok(link.name);
                }
            }
        }

        // Otherwise any route whose link resolves to a non-virtual name.
        for route in &routes {
            let Some(index) = route.link_index.filter(|&i| i > 0) else {
                continue;
            };
            let Ok(Some(link)) = self.netlink.link_by_index(index).await else {
                continue;
            };
            if !link.name.is_empty() && !is_virtual_name(&link.name) {
                return Ok(link.name);
            }
        }

        Err("no suitable network interface found via netlink".to_string())
    }

    async fn primary_nic_from_command(&self) -> Result<String, String> {
        let lines = self
            .fetch_routes(&["route", "show"])
            .await
            .map_err(|err| err.to_string())?;

        for raw in &lines {
            let line = raw.trim();
            if !line.starts_with("default ") {
                continue;
            }
            if let Some(nic) = extract_device(line) {
                return Ok(nic);
            }
        }

        for raw in &lines {
            let line = raw.trim();
            if line.contains("linkdown") {
                continue;
            }
            let Some(nic) = extract_device(line) else {
                continue;
            };
            if nic != "lo" && !is_virtual_name(&nic) {
                return Ok(nic);
            }
        }

        Err("no suitable network interface found".to_string())
    }

    /// Reads the active congestion control algorithm, preferring sysctl
    /// output over the procfs fallback.
    pub(crate) async fn current_congestion_control(&self) -> Result<String, String> {
        if let Ok(output) = self.runner.run("sysctl", &["net.ipv4.tcp_congestion_control"]).await {
            if let Some((_, value)) = output.trim().split_once(" = ") {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }

        let data = std::fs::read_to_string(&self.congestion_control_path)
            .map_err(|err| format!("failed to read congestion control: {err}"))?;
        let congctl = data.trim();
        if congctl.is_empty() {
            return Err("empty congestion control value".to_string());
        }
        Ok(congctl.to_string())
    }
}

/// `local` table entries that are not broadcast, not linkdown, and not on
/// the loopback device.
pub(crate) fn should_optimize_local(line: &str) -> bool {
    if line.is_empty() || !line.starts_with("local ") {
        return false;
    }
    if line.contains("broadcast") || line.contains("linkdown") {
        return false;
    }
    !matches!(extract_device(line).as_deref(), Some("lo") | None)
}

/// `local` table entries on the loopback device.
pub(crate) fn should_optimize_loopback(line: &str) -> bool {
    if line.is_empty() || !line.starts_with("local ") {
        return false;
    }
    if line.contains("broadcast") || line.contains("linkdown") {
        return false;
    }
    extract_device(line).as_deref() == Some("lo")
}

/// Main-table entries on the primary NIC that have not already been locked.
pub(crate) fn should_optimize_nic(line: &str, nic: &str) -> bool {
    if line.is_empty() || line.contains("linkdown") || line.contains("congctl") {
        return false;
    }
    extract_device(line).as_deref() == Some(nic)
}

/// Finds the `dev <name>` token pair in a route line.
pub(crate) fn extract_device(line: &str) -> Option<String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    for window in fields.windows(2) {
        if window[0] == "dev" && !window[1].is_empty() {
            return Some(window[1].to_string());
        }
    }
    None
}

/// Interfaces the fallback scan refuses to treat as a primary NIC.
pub(crate) fn is_virtual_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    ["docker", "br-", "veth", "lo"].iter().any(|prefix| name.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::WindowSettings;
    use crate::testutil::{system_responder, MockNetlink, RecordingRunner};
    use shaper_core::netlink::RouteInfo;
    use shaper_core::LinkInfo;
    use std::sync::Arc;

    fn optimizer(netlink: Arc<MockNetlink>, runner: Arc<RecordingRunner>) -> RouteOptimizer {
        RouteOptimizer::new(WindowSettings::default(), netlink, runner)
    }

    fn link(index: u32, name: &str) -> LinkInfo {
        LinkInfo { index, name: name.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn default_route_wins_primary_nic_detection() {
        let netlink = MockNetlink::with_links(vec![link(2, "eth0"), link(3, "wg0")]);
        netlink.push_route_v4(RouteInfo { link_index: Some(2), ..Default::default() });
        netlink.push_route_v4(RouteInfo {
            link_index: Some(3),
            destination: Some(("10.8.0.0".parse().unwrap(), 24)),
            ..Default::default()
        });

        let optimizer = optimizer(netlink, RecordingRunner::new());
        assert_eq!(optimizer.primary_nic().await.unwrap(), "eth0");
    }

    #[tokio::test]
    async fn default_route_on_tunnel_is_still_primary() {
        // A wg0 bearing the default route is the primary NIC for route
        // optimization.
        let netlink = MockNetlink::with_links(vec![link(3, "wg0")]);
        netlink.push_route_v4(RouteInfo { link_index: Some(3), ..Default::default() });

        let optimizer = optimizer(netlink, RecordingRunner::new());
        assert_eq!(optimizer.primary_nic().await.unwrap(), "wg0");
    }

    #[tokio::test]
    async fn non_virtual_subnet_route_is_fallback() {
        let netlink = MockNetlink::with_links(vec![link(4, "enp3s0"), link(5, "docker0")]);
        netlink.push_route_v4(RouteInfo {
            link_index: Some(5),
            destination: Some(("172.17.0.0".parse().unwrap(), 16)),
            ..Default::default()
        });
        netlink.push_route_v4(RouteInfo {
            link_index: Some(4),
            destination: Some(("10.0.0.0".parse().unwrap(), 24)),
            ..Default::default()
        });

        let optimizer = optimizer(netlink, RecordingRunner::new());
        assert_eq!(optimizer.primary_nic().await.unwrap(), "enp3s0");
    }

    #[tokio::test]
    async fn command_fallback_parses_route_output() {
        let netlink = MockNetlink::with_links(vec![]);
        let runner = RecordingRunner::with_responder(system_responder(|name, args| {
            if name == "ip" && args == ["route", "show"] {
                Some(Ok(concat!(
                    "10.0.0.0/24 dev enp3s0 proto kernel scope link\n",
                    "172.17.0.0/16 dev docker0 proto kernel scope link linkdown\n",
                )
                .to_string()))
            } else {
                None
            }
        }));

        let optimizer = optimizer(netlink, runner);
        assert_eq!(optimizer.primary_nic().await.unwrap(), "enp3s0");
    }

    #[tokio::test]
    async fn congestion_control_parses_sysctl_output() {
        let netlink = MockNetlink::with_links(vec![]);
        let runner = RecordingRunner::with_responder(system_responder(|name, _| {
            if name == "sysctl" {
                Some(Ok("net.ipv4.tcp_congestion_control = bbr\n".to_string()))
            } else {
                None
            }
        }));

        let optimizer = optimizer(netlink, runner);
        assert_eq!(optimizer.current_congestion_control().await.unwrap(), "bbr");
    }

    #[tokio::test]
    async fn congestion_control_falls_back_to_procfs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "cubic\n").unwrap();

        let netlink = MockNetlink::with_links(vec![]);
        let runner = RecordingRunner::with_responder(system_responder(|name, _| {
            if name == "sysctl" {
                Some(Err(crate::testutil::command_failure("sysctl", "not permitted")))
            } else {
                None
            }
        }));

        let optimizer = optimizer(netlink, runner)
            .with_congestion_control_path(file.path().to_path_buf());
        assert_eq!(optimizer.current_congestion_control().await.unwrap(), "cubic");
    }

    #[test]
    fn local_predicates() {
        assert!(should_optimize_local("local 10.0.0.5 dev eth0 proto kernel"));
        assert!(!should_optimize_local("local 127.0.0.1 dev lo proto kernel"));
        assert!(!should_optimize_local("broadcast 10.0.0.255 dev eth0"));
        assert!(!should_optimize_local("local 10.0.0.5 dev eth0 linkdown"));
        assert!(!should_optimize_local(""));
    }

    #[test]
    fn loopback_predicates() {
        assert!(should_optimize_loopback("local 127.0.0.1 dev lo proto kernel"));
        assert!(!should_optimize_loopback("local 10.0.0.5 dev eth0 proto kernel"));
        assert!(!should_optimize_loopback("10.0.0.0/24 dev lo"));
    }

    #[test]
    fn nic_predicates() {
        assert!(should_optimize_nic("default via 10.0.0.1 dev eth0", "eth0"));
        assert!(!should_optimize_nic("default via 10.0.0.1 dev eth1", "eth0"));
        assert!(!should_optimize_nic("default via 10.0.0.1 dev eth0 linkdown", "eth0"));
        assert!(!should_optimize_nic("default via 10.0.0.1 dev eth0 congctl lock bbr", "eth0"));
    }

    #[test]
    fn device_extraction() {
        assert_eq!(extract_device("default via 10.0.0.1 dev eth0").as_deref(), Some("eth0"));
        assert_eq!(extract_device("10.0.0.0/24 proto kernel"), None);
        assert_eq!(extract_device(""), None);
    }

    #[test]
    fn virtual_name_prefixes() {
        assert!(is_virtual_name("docker0"));
        assert!(is_virtual_name("br-12ab"));
        assert!(is_virtual_name("veth99"));
        assert!(is_virtual_name("lo"));
        assert!(is_virtual_name(""));
        assert!(!is_virtual_name("eth0"));
        assert!(!is_virtual_name("wg0"));
    }
}
