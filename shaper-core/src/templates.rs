//! Template selection from the configuration directory.
//!
//! The directory carries three kinds of declarative templates:
//!
//! - memory-tier files named `limits_<number><mb|gb|tb>.conf` (case
//!   insensitive, decimals permitted), matched against the host's effective
//!   memory;
//! - role files `1-client.conf`, `1-server.conf`, `1-aggregate.conf`, from
//!   which the TCP window parameters are read;
//! - `common.conf`, shared by all tiers.
//!
//! Memory-tier applicability is decided purely from the filename, so the
//! selector never parses content it is not going to use.

use std::path::Path;

use crate::sysinfo;

/// Multiplier applied to raw system memory before tier matching, leaving
/// headroom for kernel and system overhead.
pub const MEMORY_EFFECTIVENESS_FACTOR: f64 = 0.8;

/// Guard against implausible meminfo readings (~100 TB).
pub const MAX_SUPPORTED_MEMORY_MB: f64 = 100.0 * 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no memory tier configuration found in {0}; ensure at least one limits_*.conf exists")]
    NoMemoryTiers(String),
    #[error("no traffic mode configuration found; ensure at least one of 1-client.conf, 1-server.conf, or 1-aggregate.conf exists")]
    NoTrafficMode,
    #[error("unsupported traffic mode {0:?}")]
    UnsupportedMode(String),
    #[error("invalid system memory: {0:.2} MB")]
    InvalidMemory(f64),
    #[error("system memory {0:.2} MB exceeds supported range")]
    MemoryOutOfRange(f64),
    #[error("parse {key}: {reason}")]
    BadExpression { key: String, reason: String },
    #[error("detect system memory: {0}")]
    Sysinfo(#[from] sysinfo::SysinfoError),
}

/// The runtime role selected for traffic tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficMode {
    Client,
    Server,
    Aggregate,
}

impl TrafficMode {
    /// Lower number wins during auto-detection.
    pub fn priority(self) -> u8 {
        match self {
            TrafficMode::Client => 1,
            TrafficMode::Server => 2,
            TrafficMode::Aggregate => 3,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            TrafficMode::Client => "1-client.conf",
            TrafficMode::Server => "1-server.conf",
            TrafficMode::Aggregate => "1-aggregate.conf",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficMode::Client => "client",
            TrafficMode::Server => "server",
            TrafficMode::Aggregate => "aggregate",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "1-client.conf" => Some(TrafficMode::Client),
            "1-server.conf" => Some(TrafficMode::Server),
            "1-aggregate.conf" => Some(TrafficMode::Aggregate),
            _ => None,
        }
    }

    /// Parses a user-supplied mode string, accepting the short aliases.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "c" | "client" => Some(TrafficMode::Client),
            "s" | "server" => Some(TrafficMode::Server),
            "a" | "agg" | "aggregate" => Some(TrafficMode::Aggregate),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrafficMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memory-tier template discovered in the configuration directory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTier {
    pub memory_mb: f64,
    pub label: String,
    pub file_name: String,
    pub content: String,
}

/// The selected templates for sysctl and limits generation.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub common: String,
    pub specific: String,
    pub tier: MemoryTier,
    pub system_memory_gb: f64,
    pub effective_memory_gb: f64,
}

/// TCP window tuning parameters extracted from a role template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficInit {
    pub mode: TrafficMode,
    pub init_cwnd_bytes: u64,
    pub init_rwnd_bytes: u64,
    pub init_loopback_window_bytes: u64,
}

impl Default for TrafficInit {
    fn default() -> Self {
        Self {
            mode: TrafficMode::Client,
            init_cwnd_bytes: 1024 * 1460,
            init_rwnd_bytes: 3 * 1024 * 1024,
            init_loopback_window_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Enumerates memory-tier templates, sorted ascending by megabytes.
pub fn scan_memory_tiers(dir: impl AsRef<Path>) -> Result<Vec<MemoryTier>, TemplateError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|source| TemplateError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut tiers = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some((memory_mb, label)) = parse_tier_file_name(&file_name) {
            tiers.push(MemoryTier { memory_mb, label, file_name, content: String::new() });
        }
    }

    if tiers.is_empty() {
        return Err(TemplateError::NoMemoryTiers(dir.display().to_string()));
    }

    tiers.sort_by(|a, b| a.memory_mb.total_cmp(&b.memory_mb));
    Ok(tiers)
}

/// Parses `limits_<number><mb|gb|tb>.conf` (case insensitive) into megabytes
/// and the lowercase size label.
fn parse_tier_file_name(name: &str) -> Option<(f64, String)> {
    let lower = name.to_ascii_lowercase();
    let stem = lower.strip_prefix("limits_")?.strip_suffix(".conf")?;
    if stem.len() < 3 {
        return None;
    }

    let (number, unit) = stem.split_at(stem.len() - 2);
    let multiplier = match unit {
        "mb" => 1.0,
        "gb" => 1024.0,
        "tb" => 1024.0 * 1024.0,
        _ => return None,
    };

    if number.is_empty()
        || !number.chars().all(|c| c.is_ascii_digit() || c == '.')
        || number.chars().filter(|&c| c == '.').count() > 1
        || number.starts_with('.')
    {
        return None;
    }
    let size: f64 = number.parse().ok()?;

    Some((size * multiplier, format!("{number}{unit}")))
}

/// Picks the tier for a host: the largest whose threshold fits under the
/// effective memory, falling back to the smallest when nothing fits.
/// Returns the tier and the effective megabytes it was matched against.
pub fn select_tier(
    system_memory_mb: f64,
    tiers: &[MemoryTier],
) -> Result<(&MemoryTier, f64), TemplateError> {
    let smallest = tiers.first().ok_or_else(|| TemplateError::NoMemoryTiers(String::new()))?;

    if system_memory_mb <= 0.0 {
        return Err(TemplateError::InvalidMemory(system_memory_mb));
    }
    if system_memory_mb > MAX_SUPPORTED_MEMORY_MB {
        return Err(TemplateError::MemoryOutOfRange(system_memory_mb));
    }

    let effective_mb = system_memory_mb * MEMORY_EFFECTIVENESS_FACTOR;
    let selected = tiers
        .iter()
        .rev()
        .find(|tier| tier.memory_mb <= effective_mb)
        .unwrap_or(smallest);

    Ok((selected, effective_mb))
}

/// Auto-detects the traffic mode from the role files present, preferring the
/// lowest priority number.
pub fn detect_traffic_mode(dir: impl AsRef<Path>) -> Result<TrafficMode, TemplateError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|source| TemplateError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut best: Option<TrafficMode> = None;
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if let Some(mode) = TrafficMode::from_file_name(&name) {
            if best.map_or(true, |current| mode.priority() < current.priority()) {
                best = Some(mode);
            }
        }
    }

    best.ok_or(TemplateError::NoTrafficMode)
}

/// Returns the raw template content for the given traffic mode.
pub fn traffic_template_content(
    dir: impl AsRef<Path>,
    mode: TrafficMode,
) -> Result<String, TemplateError> {
    read_template_file(dir.as_ref(), mode.file_name())
}

/// Reads and parses the role template, auto-detecting the mode when none is
/// given.
pub fn load_traffic_init(
    dir: impl AsRef<Path>,
    mode: Option<&str>,
) -> Result<TrafficInit, TemplateError> {
    let dir = dir.as_ref();
    let selected = match mode.map(str::trim).filter(|m| !m.is_empty()) {
        Some(raw) => {
            TrafficMode::parse(raw).ok_or_else(|| TemplateError::UnsupportedMode(raw.to_string()))?
        }
        None => detect_traffic_mode(dir)?,
    };

    let content = traffic_template_content(dir, selected)?;
    parse_traffic_template(selected, &content)
}

/// Detects the template set for this host: memory probe, tier scan, tier
/// selection, and content loading.
pub fn detect_template_set(dir: impl AsRef<Path>) -> Result<TemplateSet, TemplateError> {
    detect_template_set_with_meminfo(dir, sysinfo::MEMINFO_PATH)
}

pub fn detect_template_set_with_meminfo(
    dir: impl AsRef<Path>,
    meminfo: impl AsRef<Path>,
) -> Result<TemplateSet, TemplateError> {
    let dir = dir.as_ref();
    let memory_kb = sysinfo::read_memory_kb(meminfo)?;
    let system_memory_mb = memory_kb as f64 / 1024.0;

    let tiers = scan_memory_tiers(dir)?;
    let (selected, effective_mb) = select_tier(system_memory_mb, &tiers)?;

    let common = read_template_file(dir, "common.conf")?;
    let mut tier = selected.clone();
    tier.content = read_template_file(dir, &tier.file_name)?;

    Ok(TemplateSet {
        common,
        specific: tier.content.clone(),
        tier,
        system_memory_gb: system_memory_mb / 1024.0,
        effective_memory_gb: effective_mb / 1024.0,
    })
}

fn parse_traffic_template(
    mode: TrafficMode,
    content: &str,
) -> Result<TrafficInit, TemplateError> {
    let mut cfg = TrafficInit { mode, ..Default::default() };
    let defaults = TrafficInit::default();
    cfg.init_cwnd_bytes = 0;
    cfg.init_rwnd_bytes = 0;
    cfg.init_loopback_window_bytes = 0;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let target = match key {
            "initCwndBytes" => &mut cfg.init_cwnd_bytes,
            "initRwndBytes" => &mut cfg.init_rwnd_bytes,
            "initLoopbackWindowBytes" => &mut cfg.init_loopback_window_bytes,
            _ => continue,
        };
        *target = evaluate_product(strip_inline_comment(value)).map_err(|reason| {
            TemplateError::BadExpression { key: key.to_string(), reason }
        })?;
    }

    if cfg.init_cwnd_bytes == 0 {
        cfg.init_cwnd_bytes = defaults.init_cwnd_bytes;
    }
    if cfg.init_rwnd_bytes == 0 {
        cfg.init_rwnd_bytes = defaults.init_rwnd_bytes;
    }
    if cfg.init_loopback_window_bytes == 0 {
        cfg.init_loopback_window_bytes = defaults.init_loopback_window_bytes;
    }

    Ok(cfg)
}

fn strip_inline_comment(value: &str) -> &str {
    match value.find('#') {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    }
}

/// Evaluates a `*`-separated product of numeric literals, rounded to the
/// nearest integer.
fn evaluate_product(expr: &str) -> Result<u64, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty expression".to_string());
    }

    let mut result = 1.0_f64;
    for factor in expr.split('*') {
        let part = factor.trim();
        if part.is_empty() {
            return Err(format!("invalid factor in {expr:?}"));
        }
        let value: f64 = part.parse().map_err(|_| format!("invalid number {part:?}"))?;
        result *= value;
    }

    if result < 0.0 {
        return Err(format!("negative result {result}"));
    }
    Ok(result.round() as u64)
}

fn read_template_file(dir: &Path, file_name: &str) -> Result<String, TemplateError> {
    let path = dir.join(file_name);
    std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
        path: path.display().to_string(),
        source,
    })
}
