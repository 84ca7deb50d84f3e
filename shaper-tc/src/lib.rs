//! Traffic-shaping reconciler for Linux hosts.
//!
//! Enumerates network links, classifies each one (loopback, external
//! physical, external virtual, internal virtual, or skipped), attaches a
//! CAKE-based qdisc hierarchy with an IFB mirror for ingress shaping,
//! negotiates NIC offloads, rewrites route-table windows, and watches
//! netlink for topology changes to keep the applied state converged.

pub mod classifier;
pub mod patterns;
pub mod profiles;
pub mod route;
pub mod settings;
pub mod shaper;
pub mod signature;
pub mod tc;

#[cfg(test)]
pub(crate) mod testutil;

pub use classifier::{InterfaceClassifier, LinkClass};
pub use profiles::{OffloadSetting, ProfileSet, ShapingProfile};
pub use route::RouteOptimizer;
pub use settings::{ProfileSettings, Settings, WatcherSettings, WindowSettings};
pub use shaper::Shaper;
