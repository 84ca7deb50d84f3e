//! Writes kernel parameters from templates into `/etc/sysctl.conf` and
//! reloads them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use shaper_core::command::CommandRunner;
use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::templates::{self, MemoryTier, TemplateSet, TrafficMode};

const SYSCTL_CONF_PATH: &str = "/etc/sysctl.conf";
const THP_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";
const THP_MODE: &str = "madvise";

/// Renders the selected templates into sysctl.conf, preserving unmanaged
/// lines, and reloads with `sysctl --system`.
pub struct SysctlConfApplier {
    path: PathBuf,
    template_dir: PathBuf,
    mode: TrafficMode,
    meminfo_path: PathBuf,
    thp_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SysctlConfApplier {
    pub fn new(template_dir: PathBuf, mode: TrafficMode, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: PathBuf::from(SYSCTL_CONF_PATH),
            template_dir,
            mode,
            meminfo_path: PathBuf::from(shaper_core::sysinfo::MEMINFO_PATH),
            thp_path: PathBuf::from(THP_PATH),
            runner,
        }
    }

    /// Overrides the target path (for testing).
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn with_meminfo_path(mut self, path: PathBuf) -> Self {
        self.meminfo_path = path;
        self
    }

    pub fn with_thp_path(mut self, path: PathBuf) -> Self {
        self.thp_path = path;
        self
    }

    pub async fn apply(&self) -> Result<(), CategorizedError> {
        let template_set = self.detect_template_set();

        let role = templates::traffic_template_content(&self.template_dir, self.mode)
            .map_err(|err| {
                CategorizedError::critical(
                    format!("load traffic template: {err}"),
                    ErrorContext::new().op("sysctl_conf_apply"),
                )
            })?;

        let params = parse_template(&[&template_set.common, &template_set.specific, &role]);
        if params.is_empty() {
            return Err(CategorizedError::critical(
                "no parameters in templates",
                ErrorContext::new().op("sysctl_conf_apply"),
            ));
        }

        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let merged = merge(&existing, &params);

        if merged == existing {
            tracing::info!("sysctl.conf already up to date");
            return Ok(());
        }

        super::write_file_sync(&self.path, merged.as_bytes()).map_err(|err| {
            CategorizedError::critical(
                format!("persist sysctl.conf: {err}"),
                ErrorContext::new().op("sysctl_conf_apply"),
            )
        })?;

        tracing::info!(
            params = params.len(),
            memory_tier = %template_set.tier.label,
            system_memory_gb = template_set.system_memory_gb,
            effective_memory_gb = template_set.effective_memory_gb,
            mode = %self.mode,
            "sysctl.conf updated"
        );

        self.reload().await?;

        if let Err(err) = self.set_transparent_hugepage() {
            tracing::warn!(error = %err, "failed to set transparent hugepage");
        }

        Ok(())
    }

    fn detect_template_set(&self) -> TemplateSet {
        match templates::detect_template_set_with_meminfo(&self.template_dir, &self.meminfo_path) {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!(error = %err, "failed to detect memory, using default tier");
                TemplateSet {
                    common: String::new(),
                    specific: String::new(),
                    tier: MemoryTier {
                        memory_mb: 0.0,
                        label: String::new(),
                        file_name: String::new(),
                        content: String::new(),
                    },
                    system_memory_gb: 0.0,
                    effective_memory_gb: 0.0,
                }
            }
        }
    }

    async fn reload(&self) -> Result<(), CategorizedError> {
        match self.runner.run("sysctl", &["--system"]).await {
            Ok(output) => {
                let trimmed = output.trim();
                if !trimmed.is_empty() {
                    tracing::debug!(details = trimmed, "sysctl --system output");
                }
                Ok(())
            }
            Err(err) => {
                // Parameters absent from this kernel are tolerable.
                if err.output().contains("sysctl: cannot stat") {
                    tracing::warn!(
                        details = err.output().trim(),
                        "sysctl apply completed with missing kernel parameters"
                    );
                    return Ok(());
                }
                Err(CategorizedError::critical(
                    format!("sysctl --system failed: {err}"),
                    ErrorContext::new().op("sysctl_reload").command("sysctl --system"),
                ))
            }
        }
    }

    /// madvise mode lets applications opt into hugepages via madvise(2).
    fn set_transparent_hugepage(&self) -> Result<(), String> {
        if !self.thp_path.exists() {
            return Err(format!(
                "transparent hugepage not supported: {} does not exist",
                self.thp_path.display()
            ));
        }

        std::fs::write(&self.thp_path, format!("{THP_MODE}\n"))
            .map_err(|err| format!("write {}: {err}", self.thp_path.display()))?;

        tracing::info!(mode = THP_MODE, "transparent hugepage configured");
        Ok(())
    }
}

/// Extracts `key = value` kernel parameters from templates, skipping
/// `rlimit.*` entries (handled by the limit appliers) and anything that is
/// not a dotted sysctl key.
fn parse_template(contents: &[&str]) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    for content in contents {
        for line in content.lines() {
            let mut line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(idx) = line.find('#') {
                line = line[..idx].trim();
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || !is_sysctl_key(key) {
                continue;
            }
            params.insert(key.to_string(), value.trim().to_string());
        }
    }

    params
}

/// Sysctl keys are dot-separated namespaces without whitespace.
fn is_sysctl_key(key: &str) -> bool {
    if key.starts_with("rlimit.") {
        return false;
    }
    key.contains('.') && !key.contains(char::is_whitespace)
}

/// Updates managed parameters in the existing config, preserving every
/// other line, and appends missing ones at the end.
fn merge(existing: &str, params: &BTreeMap<String, String>) -> String {
    if existing.is_empty() {
        let mut out = String::from("# shaperd managed sysctl parameters\n");
        for (key, value) in params {
            out.push_str(&format!("{key} = {value}\n"));
        }
        return out;
    }

    let mut output: Vec<String> = Vec::new();
    let mut updated: BTreeMap<&str, bool> = BTreeMap::new();

    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            output.push(line.to_string());
            continue;
        }

        let Some(key) = extract_key(trimmed) else {
            output.push(line.to_string());
            continue;
        };

        match params.get_key_value(key.as_str()) {
            Some((key, value)) => {
                output.push(format!("{key} = {value}"));
                updated.insert(key, true);
            }
            None => output.push(line.to_string()),
        }
    }

    let missing: Vec<(&String, &String)> =
        params.iter().filter(|(key, _)| !updated.contains_key(key.as_str())).collect();
    if !missing.is_empty() {
        output.push(String::new());
        output.push("# shaperd managed parameters".to_string());
        for (key, value) in missing {
            output.push(format!("{key} = {value}"));
        }
    }

    let mut result = output.join("\n");
    if !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// The parameter key of a config line, in either `key = value` or
/// `key value` form.
fn extract_key(line: &str) -> Option<String> {
    let mut line = line;
    if let Some(idx) = line.find('#') {
        line = line[..idx].trim_end();
    }

    if let Some((key, _)) = line.split_once('=') {
        let key = key.trim();
        return (!key.is_empty()).then(|| key.to_string());
    }

    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(key), Some(_)) => Some(key.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubRunner;
    use tempfile::TempDir;

    #[test]
    fn template_parsing_skips_non_sysctl_keys() {
        let params = parse_template(&[
            "# tuning\nnet.core.somaxconn = 8192\nrlimit.nofile=1048576\n",
            "vm.swappiness = 10  # keep low\nnot_a_key = 1\nbroken line\n",
        ]);

        assert_eq!(params.get("net.core.somaxconn").map(String::as_str), Some("8192"));
        assert_eq!(params.get("vm.swappiness").map(String::as_str), Some("10"));
        assert!(!params.contains_key("rlimit.nofile"));
        assert!(!params.contains_key("not_a_key"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn merge_preserves_unmanaged_lines() {
        let existing = "\
# local tuning
kernel.panic = 10
net.core.somaxconn = 128
";
        let mut params = BTreeMap::new();
        params.insert("net.core.somaxconn".to_string(), "8192".to_string());
        params.insert("vm.swappiness".to_string(), "10".to_string());

        let merged = merge(existing, &params);
        assert!(merged.contains("# local tuning"));
        assert!(merged.contains("kernel.panic = 10"));
        assert!(merged.contains("net.core.somaxconn = 8192"));
        assert!(!merged.contains("somaxconn = 128"));
        assert!(merged.contains("# shaperd managed parameters"));
        assert!(merged.contains("vm.swappiness = 10"));
        assert!(merged.ends_with('\n'));
    }

    #[test]
    fn merge_from_scratch_writes_header() {
        let mut params = BTreeMap::new();
        params.insert("net.ipv4.tcp_sack".to_string(), "1".to_string());
        let merged = merge("", &params);
        assert!(merged.starts_with("# shaperd managed sysctl parameters\n"));
        assert!(merged.contains("net.ipv4.tcp_sack = 1"));
    }

    fn template_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("common.conf"),
            "net.core.somaxconn = 8192\nrlimit.nofile=1048576\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("limits_4gb.conf"), "vm.swappiness = 10\n").unwrap();
        std::fs::write(dir.path().join("limits_1gb.conf"), "vm.swappiness = 30\n").unwrap();
        std::fs::write(dir.path().join("1-client.conf"), "net.ipv4.tcp_fastopen = 3\n").unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 8388608 kB\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn apply_writes_and_reloads() {
        let dir = template_dir();
        let conf = dir.path().join("sysctl.conf");
        let thp = dir.path().join("thp");
        std::fs::write(&thp, "always [madvise] never\n").unwrap();

        let runner = StubRunner::new();
        let applier =
            SysctlConfApplier::new(dir.path().to_path_buf(), TrafficMode::Client, runner.clone())
                .with_path(conf.clone())
                .with_meminfo_path(dir.path().join("meminfo"))
                .with_thp_path(thp.clone());

        applier.apply().await.unwrap();

        let written = std::fs::read_to_string(&conf).unwrap();
        assert!(written.contains("net.core.somaxconn = 8192"));
        // The 8 GiB host selects the 4gb tier.
        assert!(written.contains("vm.swappiness = 10"));
        assert!(written.contains("net.ipv4.tcp_fastopen = 3"));
        assert!(!written.contains("rlimit.nofile"));

        assert!(runner.commands().iter().any(|c| c == "sysctl --system"));
        assert_eq!(std::fs::read_to_string(&thp).unwrap(), "madvise\n");
    }

    #[tokio::test]
    async fn unchanged_config_skips_write_and_reload() {
        let dir = template_dir();
        let conf = dir.path().join("sysctl.conf");

        let runner = StubRunner::new();
        let applier =
            SysctlConfApplier::new(dir.path().to_path_buf(), TrafficMode::Client, runner.clone())
                .with_path(conf.clone())
                .with_meminfo_path(dir.path().join("meminfo"))
                .with_thp_path(dir.path().join("missing-thp"));

        applier.apply().await.unwrap();
        let first = std::fs::read_to_string(&conf).unwrap();
        let reloads_after_first =
            runner.commands().iter().filter(|c| c.as_str() == "sysctl --system").count();

        applier.apply().await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), first);
        let reloads_after_second =
            runner.commands().iter().filter(|c| c.as_str() == "sysctl --system").count();
        assert_eq!(reloads_after_first, reloads_after_second);
    }

    #[tokio::test]
    async fn missing_kernel_parameters_are_tolerated() {
        let dir = template_dir();
        let runner = StubRunner::new();
        runner.respond("sysctl", Err("sysctl: cannot stat /proc/sys/net/ipv4/tcp_foo"));

        let applier =
            SysctlConfApplier::new(dir.path().to_path_buf(), TrafficMode::Client, runner.clone())
                .with_path(dir.path().join("sysctl.conf"))
                .with_meminfo_path(dir.path().join("meminfo"))
                .with_thp_path(dir.path().join("missing-thp"));

        applier.apply().await.unwrap();
    }
}
