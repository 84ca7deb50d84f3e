//! Argument builders for `tc` qdisc and filter invocations.

/// Prefix for IFB mirror names. Interface names are capped at 15 characters,
/// so the combined name is truncated.
pub const IFB_PREFIX: &str = "ifb4";

/// tc handle reserved for ingress qdiscs.
pub const INGRESS_HANDLE: &str = "ffff:";

/// Maximum Linux interface name length (IFNAMSIZ - 1).
pub const MAX_IFACE_NAME_LEN: usize = 15;

/// Returns the IFB mirror name for a base interface.
pub fn ifb_name(iface: &str) -> String {
    truncate_name(format!("{IFB_PREFIX}{iface}"))
}

fn truncate_name(mut name: String) -> String {
    if name.len() > MAX_IFACE_NAME_LEN {
        name.truncate(MAX_IFACE_NAME_LEN);
    }
    name
}

/// A tc qdisc operation.
#[derive(Debug, Clone, Default)]
pub struct QdiscConfig {
    pub device: String,
    pub root: bool,
    pub parent: Option<String>,
    pub handle: Option<String>,
    pub kind: String,
    pub options: Vec<String>,
}

impl QdiscConfig {
    /// Renders the tc arguments required to replace the qdisc.
    pub fn replace_args(&self) -> Vec<String> {
        let mut args = vec![
            "qdisc".to_string(),
            "replace".to_string(),
            "dev".to_string(),
            self.device.clone(),
        ];

        if self.root {
            args.push("root".to_string());
        } else if let Some(parent) = &self.parent {
            args.push("parent".to_string());
            args.push(parent.clone());
        }

        if let Some(handle) = &self.handle {
            args.push("handle".to_string());
            args.push(handle.clone());
        }

        if !self.kind.is_empty() {
            args.push(self.kind.clone());
        }
        args.extend(self.options.iter().cloned());
        args
    }
}

/// A tc filter managed through delete-then-add.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub device: String,
    pub parent: String,
    pub protocol: String,
    pub pref: String,
    pub kind: String,
    pub actions: Vec<String>,
}

impl FilterConfig {
    /// The redirect filter that mirrors ingress traffic of `device` into its
    /// IFB.
    pub fn mirred_redirect(device: &str, ifb: &str) -> Self {
        Self {
            device: device.to_string(),
            parent: INGRESS_HANDLE.to_string(),
            protocol: "all".to_string(),
            pref: "1".to_string(),
            kind: "matchall".to_string(),
            actions: ["action", "mirred", "egress", "redirect", "dev", ifb]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn delete_args(&self) -> Vec<String> {
        [
            "filter", "del", "dev", &self.device, "parent", &self.parent, "protocol",
            &self.protocol, "pref", &self.pref,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn add_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "filter", "add", "dev", &self.device, "parent", &self.parent, "protocol",
            &self.protocol, "pref", &self.pref, &self.kind,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(self.actions.iter().cloned());
        args
    }
}

fn split_qdisc_spec(spec: &[String]) -> (String, Vec<String>) {
    match spec.split_first() {
        Some((kind, options)) => (kind.clone(), options.to_vec()),
        None => (String::new(), Vec::new()),
    }
}

pub fn root_qdisc_config(device: &str, spec: &[String]) -> QdiscConfig {
    let (kind, options) = split_qdisc_spec(spec);
    QdiscConfig { device: device.to_string(), root: true, kind, options, ..Default::default() }
}

pub fn ifb_root_qdisc_config(ifb: &str, spec: &[String]) -> QdiscConfig {
    root_qdisc_config(ifb, spec)
}

pub fn ingress_qdisc_config(device: &str) -> QdiscConfig {
    QdiscConfig {
        device: device.to_string(),
        handle: Some(INGRESS_HANDLE.to_string()),
        kind: "ingress".to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifb_names_are_truncated() {
        assert_eq!(ifb_name("eth0"), "ifb4eth0");
        let long = ifb_name("verylongiface99");
        assert_eq!(long, "ifb4verylongifa");
        assert_eq!(long.len(), MAX_IFACE_NAME_LEN);
        assert!(long.starts_with(IFB_PREFIX));
    }

    #[test]
    fn root_qdisc_replace_args() {
        let spec: Vec<String> =
            ["cake", "unlimited", "besteffort"].iter().map(|s| s.to_string()).collect();
        let config = root_qdisc_config("eth0", &spec);
        assert_eq!(
            config.replace_args().join(" "),
            "qdisc replace dev eth0 root cake unlimited besteffort"
        );
    }

    #[test]
    fn ingress_qdisc_replace_args() {
        let config = ingress_qdisc_config("eth0");
        assert_eq!(config.replace_args().join(" "), "qdisc replace dev eth0 handle ffff: ingress");
    }

    #[test]
    fn redirect_filter_args() {
        let filter = FilterConfig::mirred_redirect("eth0", "ifb4eth0");
        assert_eq!(
            filter.delete_args().join(" "),
            "filter del dev eth0 parent ffff: protocol all pref 1"
        );
        assert_eq!(
            filter.add_args().join(" "),
            "filter add dev eth0 parent ffff: protocol all pref 1 matchall action mirred egress redirect dev ifb4eth0"
        );
    }

    #[test]
    fn empty_spec_yields_no_kind() {
        let config = root_qdisc_config("eth0", &[]);
        assert_eq!(config.replace_args().join(" "), "qdisc replace dev eth0 root");
    }
}
