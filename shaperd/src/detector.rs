//! Runtime prerequisite validation: kernel modules and required binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use shaper_core::command::CommandRunner;
use shaper_core::error::{CategorizedError, ErrorContext};

/// Kernel module metadata and requirement status.
pub struct ModuleInfo {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// Modules the daemon depends on.
pub const REQUIRED_MODULES: &[ModuleInfo] = &[
    ModuleInfo {
        name: "nf_conntrack",
        required: false,
        description: "Connection tracking for NAT optimization",
    },
    ModuleInfo {
        name: "ifb",
        required: true,
        description: "Intermediate Functional Block for ingress shaping",
    },
    ModuleInfo {
        name: "sch_cake",
        required: true,
        description: "CAKE qdisc for traffic shaping",
    },
];

const REQUIRED_COMMANDS: &[&str] = &["ip", "tc", "ethtool"];
const CAKE_MODULE_NAMES: &[&str] = &["sch_cake", "cake"];
const MODULE_ROOT: &str = "/sys/module";

/// Budget for the probe-only modprobe calls; tighter than the general
/// command timeout.
const CAKE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ensures required kernel modules are loaded, attempting modprobe for
/// missing ones. Optional modules only warn.
pub async fn validate_kernel_modules(runner: &dyn CommandRunner) -> Result<(), CategorizedError> {
    validate_kernel_modules_at(runner, Path::new(MODULE_ROOT)).await
}

pub async fn validate_kernel_modules_at(
    runner: &dyn CommandRunner,
    module_root: &Path,
) -> Result<(), CategorizedError> {
    let mut issues = Vec::new();

    for module in REQUIRED_MODULES {
        match ensure_module(runner, module_root, module.name).await {
            Ok(()) => {
                tracing::info!(
                    module = module.name,
                    description = module.description,
                    "kernel module ready"
                );
            }
            Err(reason) if module.required => {
                issues.push(format!("{}: {reason}", module.name));
            }
            Err(reason) => {
                tracing::warn!(
                    module = module.name,
                    description = module.description,
                    error = %reason,
                    "optional kernel module not available"
                );
            }
        }
    }

    if !issues.is_empty() {
        return Err(CategorizedError::critical(
            format!("required kernel modules missing: {}", issues.join(", ")),
            ErrorContext::new().op("module_validation"),
        ));
    }

    Ok(())
}

async fn ensure_module(
    runner: &dyn CommandRunner,
    module_root: &Path,
    name: &str,
) -> Result<(), String> {
    if module_root.join(name).exists() {
        return Ok(());
    }

    tracing::debug!(module = name, "attempting to load kernel module");
    runner
        .run("modprobe", &[name])
        .await
        .map_err(|err| format!("modprobe failed: {err}"))?;

    if !module_root.join(name).exists() {
        return Err(format!("module {name} not found after modprobe"));
    }
    Ok(())
}

/// Ensures required binaries and CAKE kernel support are available before
/// the traffic shaper starts.
pub async fn validate_runtime(runner: &dyn CommandRunner) -> Result<(), CategorizedError> {
    validate_runtime_at(runner, Path::new(MODULE_ROOT)).await
}

pub async fn validate_runtime_at(
    runner: &dyn CommandRunner,
    module_root: &Path,
) -> Result<(), CategorizedError> {
    tracing::info!("runtime prerequisite check started");

    let mut issues = Vec::new();

    for command in REQUIRED_COMMANDS {
        if find_in_path(command).is_none() {
            issues.push(format!("missing command {command:?}"));
        }
    }

    if let Err(reason) = ensure_cake_available(runner, module_root).await {
        issues.push(reason);
    }

    if !issues.is_empty() {
        let description = issues.join("; ");
        tracing::error!(issues = %description, "runtime prerequisite check failed");
        return Err(CategorizedError::critical(
            "runtime prerequisites missing",
            ErrorContext::new().op("runtime_validation").actual(description),
        ));
    }

    tracing::info!("runtime prerequisite check passed");
    Ok(())
}

/// CAKE is available when its module is loaded or modprobe can find it
/// (probe-only, `-n`).
async fn ensure_cake_available(
    runner: &dyn CommandRunner,
    module_root: &Path,
) -> Result<(), String> {
    for name in CAKE_MODULE_NAMES {
        if module_root.join(name).exists() {
            return Ok(());
        }
    }

    for name in CAKE_MODULE_NAMES {
        if runner.run_with_timeout("modprobe", &["-n", name], CAKE_PROBE_TIMEOUT).await.is_ok() {
            return Ok(());
        }
    }

    Err("cake qdisc kernel module (sch_cake) is not available".to_string())
}

fn find_in_path(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubRunner;
    use tempfile::TempDir;

    #[test]
    fn finds_binaries_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-binary-xyz").is_none());
    }

    #[tokio::test]
    async fn loaded_modules_pass_without_modprobe() {
        let root = TempDir::new().unwrap();
        for module in ["nf_conntrack", "ifb", "sch_cake"] {
            std::fs::create_dir(root.path().join(module)).unwrap();
        }

        let runner = StubRunner::new();
        validate_kernel_modules_at(runner.as_ref(), root.path()).await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn missing_required_module_is_critical() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new();
        runner.respond("modprobe", Err("FATAL: Module not found"));

        let err = validate_kernel_modules_at(runner.as_ref(), root.path()).await.unwrap_err();
        assert!(err.to_string().contains("required kernel modules missing"));
        assert!(err.to_string().contains("ifb"));
    }

    #[tokio::test]
    async fn modprobe_success_still_requires_module_presence() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new();
        // modprobe succeeds but /sys/module stays empty.
        runner.respond("modprobe", Ok(""));

        let err = validate_kernel_modules_at(runner.as_ref(), root.path()).await.unwrap_err();
        assert!(err.to_string().contains("not found after modprobe"));
    }

    #[tokio::test]
    async fn cake_probe_accepts_dry_run_success() {
        let root = TempDir::new().unwrap();
        let runner = StubRunner::new();
        runner.respond("modprobe", Ok(""));

        ensure_cake_available(runner.as_ref(), root.path()).await.unwrap();
        assert!(runner.commands().iter().any(|c| c == "modprobe -n sch_cake"));
    }
}
