//! Test doubles: an in-memory netlink table and a recording command runner
//! that can emulate the `ip link` side effects the reconciler depends on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shaper_core::command::{CommandError, CommandRunner};
use shaper_core::netlink::{
    EventSubscription, LinkEvent, LinkInfo, Netlink, NetlinkError, RouteFamily, RouteInfo,
};
use tokio::sync::mpsc;

pub(crate) type Responder =
    Arc<dyn Fn(&str, &[&str]) -> Option<Result<String, CommandError>> + Send + Sync>;

pub(crate) fn system_responder<F>(f: F) -> Responder
where
    F: Fn(&str, &[&str]) -> Option<Result<String, CommandError>> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn command_failure(name: &str, output: &str) -> CommandError {
    use std::os::unix::process::ExitStatusExt;
    CommandError::NonZero {
        name: name.to_string(),
        status: std::process::ExitStatus::from_raw(1 << 8),
        output: output.to_string(),
    }
}

/// Records every invocation and answers from the configured responder;
/// unmatched commands succeed with empty output.
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responder: Responder,
}

impl RecordingRunner {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_responder(system_responder(|_, _| None))
    }

    pub(crate) fn with_responder(responder: Responder) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), responder })
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, name: &str, args: &[&str]) -> Result<String, CommandError> {
        let rendered = if args.is_empty() {
            name.to_string()
        } else {
            format!("{name} {}", args.join(" "))
        };
        self.calls.lock().unwrap().push(rendered);

        match (self.responder)(name, args) {
            Some(result) => result,
            None => Ok(String::new()),
        }
    }
}

/// An in-memory link and route table implementing [`Netlink`].
pub(crate) struct MockNetlink {
    links: Mutex<Vec<LinkInfo>>,
    routes_v4: Mutex<Vec<RouteInfo>>,
    routes_v6: Mutex<Vec<RouteInfo>>,
    deleted: Mutex<Vec<u32>>,
    mtu_calls: AtomicUsize,
    qlen_calls: AtomicUsize,
    route_list_calls: AtomicUsize,
    event_tx: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl MockNetlink {
    pub(crate) fn with_links(links: Vec<LinkInfo>) -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(links),
            routes_v4: Mutex::new(Vec::new()),
            routes_v6: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            mtu_calls: AtomicUsize::new(0),
            qlen_calls: AtomicUsize::new(0),
            route_list_calls: AtomicUsize::new(0),
            event_tx: Mutex::new(None),
        })
    }

    pub(crate) fn push_route_v4(&self, route: RouteInfo) {
        self.routes_v4.lock().unwrap().push(route);
    }

    pub(crate) fn add_link(&self, link: LinkInfo) {
        self.links.lock().unwrap().push(link);
    }

    pub(crate) fn update_link(&self, name: &str, update: impl FnOnce(&mut LinkInfo)) {
        let mut links = self.links.lock().unwrap();
        if let Some(link) = links.iter_mut().find(|l| l.name == name) {
            update(link);
        }
    }

    pub(crate) fn remove_link(&self, name: &str) {
        self.links.lock().unwrap().retain(|l| l.name != name);
    }

    pub(crate) fn link_by_name_sync(&self, name: &str) -> Option<LinkInfo> {
        self.links.lock().unwrap().iter().find(|l| l.name == name).cloned()
    }

    pub(crate) fn link_names(&self) -> Vec<String> {
        self.links.lock().unwrap().iter().map(|l| l.name.clone()).collect()
    }

    pub(crate) fn next_index(&self) -> u32 {
        self.links.lock().unwrap().iter().map(|l| l.index).max().unwrap_or(0) + 1
    }

    pub(crate) fn deleted_indexes(&self) -> Vec<u32> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn mtu_call_count(&self) -> usize {
        self.mtu_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn qlen_call_count(&self) -> usize {
        self.qlen_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn route_list_calls(&self) -> usize {
        self.route_list_calls.load(Ordering::SeqCst)
    }

    /// Sends an event into the most recent subscription, if any.
    #[allow(dead_code)]
    pub(crate) async fn emit(&self, event: LinkEvent) {
        let tx = self.event_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Netlink for MockNetlink {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, NetlinkError> {
        Ok(self.links.lock().unwrap().clone())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, NetlinkError> {
        Ok(self.link_by_name_sync(name))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, NetlinkError> {
        Ok(self.links.lock().unwrap().iter().find(|l| l.index == index).cloned())
    }

    async fn link_del(&self, index: u32) -> Result<(), NetlinkError> {
        self.deleted.lock().unwrap().push(index);
        self.links.lock().unwrap().retain(|l| l.index != index);
        Ok(())
    }

    async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<(), NetlinkError> {
        self.mtu_calls.fetch_add(1, Ordering::SeqCst);
        let mut links = self.links.lock().unwrap();
        if let Some(link) = links.iter_mut().find(|l| l.index == index) {
            link.mtu = mtu;
        }
        Ok(())
    }

    async fn link_set_tx_queue_len(&self, index: u32, qlen: u32) -> Result<(), NetlinkError> {
        self.qlen_calls.fetch_add(1, Ordering::SeqCst);
        let mut links = self.links.lock().unwrap();
        if let Some(link) = links.iter_mut().find(|l| l.index == index) {
            link.tx_queue_len = qlen;
        }
        Ok(())
    }

    async fn route_list(&self, family: RouteFamily) -> Result<Vec<RouteInfo>, NetlinkError> {
        self.route_list_calls.fetch_add(1, Ordering::SeqCst);
        let routes = match family {
            RouteFamily::V4 => self.routes_v4.lock().unwrap().clone(),
            RouteFamily::V6 => self.routes_v6.lock().unwrap().clone(),
        };
        Ok(routes)
    }

    async fn subscribe(&self, buffer: usize) -> Result<EventSubscription, NetlinkError> {
        let (tx, rx) = mpsc::channel(buffer);
        *self.event_tx.lock().unwrap() = Some(tx);
        Ok(EventSubscription::new(rx, Vec::new()))
    }
}

/// `ethtool -k` output where every feature already matches the
/// external-physical recipe, so no `-K` batch is issued.
pub(crate) const MATCHING_FEATURES: &str = "\
Features for eth0:
rx-checksumming: on
tx-checksumming: on
scatter-gather: off
tcp-segmentation-offload: off
generic-segmentation-offload: off
generic-receive-offload: on
large-receive-offload: off
udp-fragmentation-offload: off [fixed]
tx-scatter-gather: off
tx-gso-partial: off
";

/// A responder emulating the `ip link` commands the reconciler issues for
/// IFB devices, mutating the mock netlink table accordingly.
pub(crate) fn ifb_emulator(netlink: Arc<MockNetlink>) -> Responder {
    system_responder(move |name, args| {
        match (name, args) {
            ("ip", ["link", "add", "name", ifb, "type", "ifb"]) => {
                let index = netlink.next_index();
                netlink.add_link(LinkInfo {
                    index,
                    name: ifb.to_string(),
                    mtu: 1500,
                    tx_queue_len: 0,
                    up: false,
                    loopback: false,
                });
                Some(Ok(String::new()))
            }
            ("ip", ["link", "set", ifb, "qlen", qlen, "mtu", mtu]) => {
                let qlen: u32 = qlen.parse().unwrap();
                let mtu: u32 = mtu.parse().unwrap();
                netlink.update_link(ifb, |l| {
                    l.tx_queue_len = qlen;
                    l.mtu = mtu;
                });
                Some(Ok(String::new()))
            }
            ("ip", ["link", "set", ifb, "up"]) => {
                netlink.update_link(ifb, |l| l.up = true);
                Some(Ok(String::new()))
            }
            ("ip", ["link", "del", ifb]) => {
                netlink.remove_link(ifb);
                Some(Ok(String::new()))
            }
            ("ethtool", ["-k", _]) => Some(Ok(MATCHING_FEATURES.to_string())),
            _ => None,
        }
    })
}
