//! Renders `rlimit.*` template entries into PAM `/etc/security/limits.conf`.
//!
//! The applier owns a marked block inside the file and leaves everything
//! else untouched. Changes take effect for future login sessions.

use std::path::PathBuf;

use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::templates;

use super::{merged_rlimit_entries, write_file_sync, RlimitEntry};

const LIMITS_CONF_PATH: &str = "/etc/security/limits.conf";
const BLOCK_BEGIN: &str = "# --- shaperd managed limits begin ---";
const BLOCK_END: &str = "# --- shaperd managed limits end ---";

pub struct LimitsConfApplier {
    path: PathBuf,
    template_dir: PathBuf,
    meminfo_path: PathBuf,
}

impl LimitsConfApplier {
    pub fn new(template_dir: PathBuf) -> Self {
        Self {
            path: PathBuf::from(LIMITS_CONF_PATH),
            template_dir,
            meminfo_path: PathBuf::from(shaper_core::sysinfo::MEMINFO_PATH),
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

    pub async fn apply(&self) -> Result<(), CategorizedError> {
        let (common, specific, tier_label) = match templates::detect_template_set_with_meminfo(
            &self.template_dir,
            &self.meminfo_path,
        ) {
            Ok(set) => (set.common, set.specific, set.tier.label),
            Err(err) => {
                tracing::warn!(error = %err, "failed to detect memory tier for limits.conf");
                (String::new(), String::new(), String::new())
            }
        };

        let entries = merged_rlimit_entries(&common, &specific);
        if entries.is_empty() {
            tracing::info!("no rlimit entries in templates; limits.conf left untouched");
            return Ok(());
        }

        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let rendered = replace_managed_block(&existing, &entries);

        if rendered == existing {
            tracing::info!("limits.conf already up to date");
            return Ok(());
        }

        write_file_sync(&self.path, rendered.as_bytes()).map_err(|err| {
            CategorizedError::critical(
                format!("persist limits.conf: {err}"),
                ErrorContext::new().op("limits_conf_apply"),
            )
        })?;

        tracing::info!(
            entries = entries.len(),
            memory_tier = %tier_label,
            "limits.conf updated; takes effect on next login session"
        );
        Ok(())
    }
}

/// Replaces (or appends) the managed block, preserving the rest of the
/// file.
fn replace_managed_block(existing: &str, entries: &[RlimitEntry]) -> String {
    let mut block = String::new();
    block.push_str(BLOCK_BEGIN);
    block.push('\n');
    for entry in entries {
        block.push_str(&format!("* soft {} {}\n", entry.resource, entry.value));
        block.push_str(&format!("* hard {} {}\n", entry.resource, entry.value));
    }
    block.push_str(BLOCK_END);
    block.push('\n');

    let mut out = String::new();
    let mut in_block = false;
    let mut replaced = false;

    for line in existing.lines() {
        if line.trim() == BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if in_block {
            if line.trim() == BLOCK_END {
                in_block = false;
                if !replaced {
                    out.push_str(&block);
                    replaced = true;
                }
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    if !replaced {
        if !out.is_empty() && !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(&block);
    }

    out
}
