//! Resource-limit appliers driven by the `rlimit.*` template keys.

mod limits_conf;
mod rlimit;
mod sysctl_conf;

pub use limits_conf::LimitsConfApplier;
pub use rlimit::RlimitApplier;
pub use sysctl_conf::SysctlConfApplier;

use std::io::Write;
use std::path::Path;

/// Resources the templates may configure. Matches the item names used by
/// PAM limits.conf.
const KNOWN_RESOURCES: &[&str] = &[
    "nofile", "nproc", "core", "stack", "cpu", "memlock", "as", "data", "fsize", "msgqueue",
    "sigpending", "locks",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitValue {
    Unlimited,
    Value(u64),
}

impl std::fmt::Display for RlimitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RlimitValue::Unlimited => f.write_str("unlimited"),
            RlimitValue::Value(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitEntry {
    pub resource: String,
    pub value: RlimitValue,
}

/// Extracts `rlimit.<resource>=<value>` entries from template content,
/// skipping unknown resources and unparseable values.
pub(crate) fn parse_rlimit_entries(content: &str) -> Vec<RlimitEntry> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("rlimit.") else {
            continue;
        };
        let Some((resource, value)) = rest.split_once('=') else {
            continue;
        };
        let resource = resource.trim();
        if !KNOWN_RESOURCES.contains(&resource) {
            continue;
        }

        let value = value.trim();
        let value = if value == "unlimited" {
            RlimitValue::Unlimited
        } else {
            match value.parse::<u64>() {
                Ok(v) => RlimitValue::Value(v),
                Err(_) => continue,
            }
        };

        entries.push(RlimitEntry { resource: resource.to_string(), value });
    }

    entries
}

/// Merges common and tier-specific entries; tier-specific values win.
pub(crate) fn merged_rlimit_entries(common: &str, specific: &str) -> Vec<RlimitEntry> {
    let mut merged: Vec<RlimitEntry> = Vec::new();
    for entry in parse_rlimit_entries(common).into_iter().chain(parse_rlimit_entries(specific)) {
        match merged.iter_mut().find(|e| e.resource == entry.resource) {
            Some(existing) => existing.value = entry.value,
            None => merged.push(entry),
        }
    }
    merged.sort_by(|a, b| a.resource.cmp(&b.resource));
    merged
}

/// Truncates the target, writes the payload with mode 0600, and fsyncs it.
pub(crate) fn write_file_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut file = std::fs::File::create(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_rlimit_entries() {
        let content = "\
# limits
rlimit.nofile=1048576
rlimit.stack=16384
rlimit.core=unlimited
rlimit.bogus=1
rlimit.nproc=notanumber
net.core.somaxconn = 8192
";
        let entries = parse_rlimit_entries(content);
        assert_eq!(
            entries,
            vec![
                RlimitEntry { resource: "nofile".into(), value: RlimitValue::Value(1_048_576) },
                RlimitEntry { resource: "stack".into(), value: RlimitValue::Value(16_384) },
                RlimitEntry { resource: "core".into(), value: RlimitValue::Unlimited },
            ]
        );
    }

    #[test]
    fn specific_entries_override_common() {
        let common = "rlimit.nofile=65536\nrlimit.core=0\n";
        let specific = "rlimit.nofile=1048576\nrlimit.memlock=unlimited\n";

        let merged = merged_rlimit_entries(common, specific);
        assert_eq!(
            merged,
            vec![
                RlimitEntry { resource: "core".into(), value: RlimitValue::Value(0) },
                RlimitEntry { resource: "memlock".into(), value: RlimitValue::Unlimited },
                RlimitEntry { resource: "nofile".into(), value: RlimitValue::Value(1_048_576) },
            ]
        );
    }
}
