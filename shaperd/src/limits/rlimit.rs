//! Applies `rlimit.*` template entries to the current process via
//! setrlimit(2). Runs last so the daemon itself ends up with the intended
//! limits.

use std::path::PathBuf;

use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use shaper_core::error::CategorizedError;
use shaper_core::templates;

use super::{merged_rlimit_entries, RlimitEntry, RlimitValue};

pub struct RlimitApplier {
    template_dir: PathBuf,
    meminfo_path: PathBuf,
}

impl RlimitApplier {
    pub fn new(template_dir: PathBuf) -> Self {
        Self { template_dir, meminfo_path: PathBuf::from(shaper_core::sysinfo::MEMINFO_PATH) }
    }

    pub fn with_meminfo_path(mut self, path: PathBuf) -> Self {
        self.meminfo_path = path;
        self
    }

    /// Sets resource limits for the current process. Only limits explicitly
    /// defined in the templates are touched; per-resource failures are
    /// logged and skipped.
    pub async fn apply(&self) -> Result<(), CategorizedError> {
        let (common, specific, tier_label) = match templates::detect_template_set_with_meminfo(
            &self.template_dir,
            &self.meminfo_path,
        ) {
            Ok(set) => (set.common, set.specific, set.tier.label),
            Err(err) => {
                tracing::warn!(error = %err, "memory detection failed, using default tier");
                (String::new(), String::new(), String::new())
            }
        };

        tracing::info!(memory_tier = %tier_label, "applying rlimit configuration");

        let mut applied = 0usize;
        for entry in merged_rlimit_entries(&common, &specific) {
            let Some(resource) = resource_from_name(&entry.resource) else {
                continue;
            };
            let value = effective_value(&entry);

            match set_limit(resource, value) {
                Ok(changed) => {
                    if changed {
                        tracing::debug!(resource = %entry.resource, value, "rlimit set");
                        applied += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(resource = %entry.resource, error = %err, "setrlimit failed");
                }
            }
        }

        tracing::info!(count = applied, "rlimit applied");
        Ok(())
    }
}

/// Sets soft and hard limits to `value` unless they already match. Returns
/// whether a change was made.
fn set_limit(resource: Resource, value: u64) -> Result<bool, nix::errno::Errno> {
    let (soft, hard) = getrlimit(resource)?;
    if soft == value && hard == value {
        return Ok(false);
    }
    setrlimit(resource, value, value)?;
    Ok(true)
}

/// Stack values in templates are kilobytes; the syscall wants bytes.
fn effective_value(entry: &RlimitEntry) -> u64 {
    match entry.value {
        RlimitValue::Unlimited => RLIM_INFINITY,
        RlimitValue::Value(v) if entry.resource == "stack" => v * 1024,
        RlimitValue::Value(v) => v,
    }
}

fn resource_from_name(name: &str) -> Option<Resource> {
    match name {
        "nofile" => Some(Resource::RLIMIT_NOFILE),
        "nproc" => Some(Resource::RLIMIT_NPROC),
        "core" => Some(Resource::RLIMIT_CORE),
        "stack" => Some(Resource::RLIMIT_STACK),
        "cpu" => Some(Resource::RLIMIT_CPU),
        "memlock" => Some(Resource::RLIMIT_MEMLOCK),
        "as" => Some(Resource::RLIMIT_AS),
        "data" => Some(Resource::RLIMIT_DATA),
        "fsize" => Some(Resource::RLIMIT_FSIZE),
        "msgqueue" => Some(Resource::RLIMIT_MSGQUEUE),
        "sigpending" => Some(Resource::RLIMIT_SIGPENDING),
        "locks" => Some(Resource::RLIMIT_LOCKS),
        _ => None,
    }
}
