//! The netlink watch loop and its event accumulator.
//!
//! Events arriving between reapply ticks are coalesced into
//! [`PendingChanges`]: named link updates accumulate interface names, while
//! updates whose scope cannot be resolved escalate to a full reapply. The
//! drain is a single atomic snapshot-and-reset.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use shaper_core::error::{CategorizedError, ErrorContext};
use shaper_core::netlink::{LinkEvent, Netlink};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Shaper;

/// Buffer for the netlink event subscription channel.
pub(crate) const EVENT_BUFFER: usize = 32;

/// The outcome of draining [`PendingChanges`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drained {
    /// Nothing happened since the last tick.
    Idle,
    /// At least one event could not be attributed to an interface.
    All,
    /// The set of interfaces touched since the last tick.
    Names(FxHashSet<String>),
}

#[derive(Default)]
struct PendingState {
    all: bool,
    names: FxHashSet<String>,
}

/// Accumulator bridging netlink events to the debounced reapply tick.
pub(crate) struct PendingChanges {
    netlink: Arc<dyn Netlink>,
    state: Mutex<PendingState>,
}

impl PendingChanges {
    pub(crate) fn new(netlink: Arc<dyn Netlink>) -> Self {
        Self { netlink, state: Mutex::new(PendingState::default()) }
    }

    /// Records a link update. Updates without a usable name escalate to a
    /// full reapply.
    pub(crate) fn add_link(&self, name: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.all {
            return;
        }
        match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                state.names.insert(name);
            }
            None => mark_all(&mut state),
        }
    }

    /// Records an address update, resolving the interface name by index.
    pub(crate) async fn add_address(&self, link_index: u32) {
        if self.state.lock().unwrap().all {
            return;
        }

        let resolved = match self.netlink.link_by_index(link_index).await {
            Ok(Some(link)) if !link.name.is_empty() => Some(link.name),
            _ => None,
        };

        let mut state = self.state.lock().unwrap();
        if state.all {
            return;
        }
        match resolved {
            Some(name) => {
                state.names.insert(name);
            }
            None => mark_all(&mut state),
        }
    }

    /// Atomically snapshots the accumulated changes and resets to idle.
    pub(crate) fn drain(&self) -> Drained {
        let mut state = self.state.lock().unwrap();
        if state.all {
            state.all = false;
            state.names.clear();
            return Drained::All;
        }
        if state.names.is_empty() {
            return Drained::Idle;
        }
        Drained::Names(std::mem::take(&mut state.names))
    }
}

fn mark_all(state: &mut PendingState) {
    state.all = true;
    state.names.clear();
}

impl Shaper {
    /// Listens to netlink events and reapplies traffic shaping when needed.
    /// Returns on cancellation, or with a critical error when the
    /// subscription cannot be established or closes underneath us.
    pub async fn watch(self: &Arc<Self>, token: CancellationToken) -> Result<(), CategorizedError> {
        let mut subscription = self.netlink.subscribe(EVENT_BUFFER).await.map_err(|err| {
            CategorizedError::critical(
                format!("subscribe netlink events: {err}"),
                ErrorContext::new().op("netlink_subscribe"),
            )
        })?;

        let pending = PendingChanges::new(Arc::clone(&self.netlink));

        let start = tokio::time::Instant::now();
        let mut apply_tick = tokio::time::interval_at(
            start + self.watcher.reapply_interval,
            self.watcher.reapply_interval,
        );
        apply_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval_at(
            start + self.watcher.cleanup_interval,
            self.watcher.cleanup_interval,
        );
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = subscription.recv() => match event {
                    Some(LinkEvent::Link { name }) => pending.add_link(name),
                    Some(LinkEvent::Address { link_index }) => pending.add_address(link_index).await,
                    None => {
                        return Err(CategorizedError::critical(
                            "netlink event subscription closed",
                            ErrorContext::new().op("netlink_subscribe"),
                        ));
                    }
                },
                _ = apply_tick.tick() => {
                    if let Err(err) = self.apply_pending(&token, &pending).await {
                        self.log_error("reapply failed", &err);
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(err) = self.cleanup_stale_signatures().await {
                        self.log_error("cleanup stale signatures failed", &err);
                    }
                }
            }
        }
    }

    async fn apply_pending(
        self: &Arc<Self>,
        token: &CancellationToken,
        pending: &PendingChanges,
    ) -> Result<(), CategorizedError> {
        let only = match pending.drain() {
            Drained::Idle => return Ok(()),
            Drained::All => None,
            Drained::Names(names) => Some(names),
        };

        match tokio::time::timeout(
            self.watcher.apply_timeout,
            self.apply_interfaces(token, only),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CategorizedError::recoverable(
                format!("apply pass exceeded {:?}", self.watcher.apply_timeout),
                ErrorContext::new().op("apply_timeout"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockNetlink;
    use shaper_core::LinkInfo;

    fn pending_with(links: Vec<LinkInfo>) -> PendingChanges {
        PendingChanges::new(MockNetlink::with_links(links))
    }

    fn link(index: u32, name: &str) -> LinkInfo {
        LinkInfo { index, name: name.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn events_for_the_same_interface_coalesce() {
        let pending = pending_with(vec![]);
        pending.add_link(Some("eth0".to_string()));
        pending.add_link(Some("eth0".to_string()));
        pending.add_link(Some("eth1".to_string()));

        match pending.drain() {
            Drained::Names(names) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains("eth0"));
                assert!(names.contains("eth1"));
            }
            other => panic!("unexpected drain result: {other:?}"),
        }

        // The drain reset the accumulator.
        assert_eq!(pending.drain(), Drained::Idle);
    }

    #[tokio::test]
    async fn nameless_link_update_escalates_to_all() {
        let pending = pending_with(vec![]);
        pending.add_link(Some("eth0".to_string()));
        pending.add_link(None);
        // Once escalated, further names are ignored until the drain.
        pending.add_link(Some("eth1".to_string()));

        assert_eq!(pending.drain(), Drained::All);
        assert_eq!(pending.drain(), Drained::Idle);
    }

    #[tokio::test]
    async fn address_updates_resolve_names() {
        let pending = pending_with(vec![link(7, "eth2")]);
        pending.add_address(7).await;

        match pending.drain() {
            Drained::Names(names) => assert!(names.contains("eth2")),
            other => panic!("unexpected drain result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_address_update_escalates_to_all() {
        let pending = pending_with(vec![link(7, "eth2")]);
        pending.add_link(Some("eth0".to_string()));
        pending.add_link(Some("eth0".to_string()));
        pending.add_link(Some("eth1".to_string()));
        pending.add_address(99).await;

        assert_eq!(pending.drain(), Drained::All);
    }

    #[tokio::test]
    async fn empty_link_name_counts_as_unresolvable() {
        let pending = pending_with(vec![]);
        pending.add_link(Some(String::new()));
        assert_eq!(pending.drain(), Drained::All);
    }
}
