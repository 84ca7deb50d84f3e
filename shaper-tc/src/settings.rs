//! Reconciler settings with zero-means-default normalization.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest MTU the kernel accepts for IPv4.
pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 65535;
pub const MIN_QUEUE_LEN: u32 = 1;
pub const MAX_QUEUE_LEN: u32 = 1_000_000;

/// Concurrent interface configurators per apply pass.
pub const DEFAULT_WORKER_COUNT: usize = 4;

const DEFAULT_REAPPLY_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_QUEUE_LEN: u32 = 10_001;
const DEFAULT_LOOPBACK_QUEUE_LEN: u32 = 10_000;
const DEFAULT_LOOPBACK_MTU: u32 = 65_520;
const DEFAULT_INTERNAL_RTT: Duration = Duration::from_micros(100);
const DEFAULT_LOOPBACK_RTT: Duration = Duration::from_micros(20);
const DEFAULT_MSS: u64 = 1_460;
const DEFAULT_LOOPBACK_MSS: u64 = 65_520;

/// Cadence of the netlink watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// How often pending changes are drained and applied.
    pub reapply_interval: Duration,
    /// How often stale signatures are pruned.
    pub cleanup_interval: Duration,
    /// Deadline for a single apply pass.
    pub apply_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            reapply_interval: DEFAULT_REAPPLY_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }
}

/// Shaping profile parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSettings {
    pub default_queue_len: u32,
    pub loopback_queue_len: u32,
    /// MTU forced on the loopback profile.
    pub loopback_mtu_override: u32,
    /// RTT token embedded in the internal-virtual profile.
    pub internal_rtt: Duration,
    /// RTT token embedded in the loopback profile.
    pub loopback_rtt: Duration,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            default_queue_len: DEFAULT_QUEUE_LEN,
            loopback_queue_len: DEFAULT_LOOPBACK_QUEUE_LEN,
            loopback_mtu_override: DEFAULT_LOOPBACK_MTU,
            internal_rtt: DEFAULT_INTERNAL_RTT,
            loopback_rtt: DEFAULT_LOOPBACK_RTT,
        }
    }
}

/// TCP window byte sizes fed into the route optimizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSettings {
    pub mss_bytes: u64,
    pub loopback_mss_bytes: u64,
    pub init_cwnd_bytes: u64,
    pub init_rwnd_bytes: u64,
    pub loopback_window_bytes: u64,
}

impl WindowSettings {
    pub fn with_defaults(mut self) -> Self {
        if self.mss_bytes == 0 {
            self.mss_bytes = DEFAULT_MSS;
        }
        if self.loopback_mss_bytes == 0 {
            self.loopback_mss_bytes = DEFAULT_LOOPBACK_MSS;
        }
        self
    }
}

/// Everything required to build a [`crate::Shaper`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub routes: WindowSettings,
    pub watcher: WatcherSettings,
    pub profiles: ProfileSettings,
    /// Max concurrent interface configurators; 0 means the default.
    pub worker_count: usize,
    /// Root of the per-interface sysfs tree, overridable in tests.
    pub sysfs_net_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            routes: WindowSettings::default(),
            watcher: WatcherSettings::default(),
            profiles: ProfileSettings::default(),
            worker_count: DEFAULT_WORKER_COUNT,
            sysfs_net_root: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Settings {
    pub fn with_defaults(mut self) -> Self {
        self.routes = self.routes.with_defaults();
        let defaults = WatcherSettings::default();
        if self.watcher.reapply_interval.is_zero() {
            self.watcher.reapply_interval = defaults.reapply_interval;
        }
        if self.watcher.cleanup_interval.is_zero() {
            self.watcher.cleanup_interval = defaults.cleanup_interval;
        }
        if self.watcher.apply_timeout.is_zero() {
            self.watcher.apply_timeout = defaults.apply_timeout;
        }

        let profile_defaults = ProfileSettings::default();
        if self.profiles.default_queue_len == 0 {
            self.profiles.default_queue_len = profile_defaults.default_queue_len;
        }
        if self.profiles.loopback_queue_len == 0 {
            self.profiles.loopback_queue_len = profile_defaults.loopback_queue_len;
        }
        if self.profiles.loopback_mtu_override == 0 {
            self.profiles.loopback_mtu_override = profile_defaults.loopback_mtu_override;
        }
        if self.profiles.internal_rtt.is_zero() {
            self.profiles.internal_rtt = profile_defaults.internal_rtt;
        }
        if self.profiles.loopback_rtt.is_zero() {
            self.profiles.loopback_rtt = profile_defaults.loopback_rtt;
        }

        if self.worker_count == 0 {
            self.worker_count = DEFAULT_WORKER_COUNT;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_settings_are_normalized() {
        let settings = Settings {
            routes: WindowSettings::default(),
            watcher: WatcherSettings {
                reapply_interval: Duration::ZERO,
                cleanup_interval: Duration::ZERO,
                apply_timeout: Duration::ZERO,
            },
            profiles: ProfileSettings {
                default_queue_len: 0,
                loopback_queue_len: 0,
                loopback_mtu_override: 0,
                internal_rtt: Duration::ZERO,
                loopback_rtt: Duration::ZERO,
            },
            worker_count: 0,
            sysfs_net_root: PathBuf::from("/sys/class/net"),
        }
        .with_defaults();

        assert_eq!(settings.watcher.reapply_interval, Duration::from_secs(2));
        assert_eq!(settings.watcher.cleanup_interval, Duration::from_secs(300));
        assert_eq!(settings.watcher.apply_timeout, Duration::from_secs(45));
        assert_eq!(settings.profiles.default_queue_len, 10_001);
        assert_eq!(settings.profiles.loopback_queue_len, 10_000);
        assert_eq!(settings.profiles.loopback_mtu_override, 65_520);
        assert_eq!(settings.routes.mss_bytes, 1_460);
        assert_eq!(settings.routes.loopback_mss_bytes, 65_520);
        assert_eq!(settings.worker_count, DEFAULT_WORKER_COUNT);
    }
}
