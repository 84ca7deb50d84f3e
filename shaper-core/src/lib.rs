//! Shared infrastructure for the shaperd daemon.
//!
//! This crate carries the pieces every other crate leans on: the categorized
//! error model, the async external-command runner, the netlink abstraction
//! with its rtnetlink backend, the memory probe, and the template selector
//! that picks memory-tier and role templates from the configuration
//! directory.

pub mod command;
pub mod error;
pub mod netlink;
pub mod sysinfo;
pub mod templates;

pub use command::{CommandError, CommandRunner, ProcessRunner};
pub use error::{Category, CategorizedError, ErrorContext, MultiError};
pub use netlink::{EventSubscription, LinkEvent, LinkInfo, Netlink, NetlinkError, RouteFamily, RouteInfo, RtNetlink};
