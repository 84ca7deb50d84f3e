//! Netlink access for link enumeration, link mutation, route listing, and
//! topology-change events.
//!
//! The [`Netlink`] trait is the seam the reconciler and route optimizer work
//! against; [`RtNetlink`] is the production implementation on top of the
//! `rtnetlink` crate. Event subscription binds a dedicated connection to the
//! link and IPv4/IPv6 address multicast groups and forwards decoded updates
//! into a bounded channel; dropping the [`EventSubscription`] tears both
//! tasks down.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, RTMGRP_LINK};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::RouteMessageBuilder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ENODEV: i32 = 19;

#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    #[error("netlink connection failed: {0}")]
    Connection(#[from] std::io::Error),
    #[error("netlink request failed: {0}")]
    Request(#[from] rtnetlink::Error),
}

/// The link attributes the reconciler cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub tx_queue_len: u32,
    pub up: bool,
    pub loopback: bool,
}

/// Address family for route listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFamily {
    V4,
    V6,
}

/// A route-table entry reduced to what classification and NIC detection
/// need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteInfo {
    pub link_index: Option<u32>,
    /// Destination prefix; `None` for a default route.
    pub destination: Option<(IpAddr, u8)>,
    pub gateway: Option<IpAddr>,
}

impl RouteInfo {
    /// A default route either has no destination at all or a zero-length
    /// prefix.
    pub fn is_default(&self) -> bool {
        match self.destination {
            None => true,
            Some((_, prefix_len)) => prefix_len == 0,
        }
    }
}

/// A decoded topology-change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link appeared, disappeared, or changed. `name` is `None` when the
    /// update did not carry one; receivers must escalate to a full reapply.
    Link { name: Option<String> },
    /// An address changed on the link with this index.
    Address { link_index: u32 },
}

/// A live event subscription. Dropping it aborts the underlying connection
/// and forwarding tasks, releasing the netlink socket on every exit path.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::Receiver<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::Receiver<LinkEvent>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { receiver, tasks }
    }

    /// Receives the next event; `None` means the subscription closed.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.receiver.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Netlink operations used by the reconciler, classifier, watcher, and
/// route optimizer.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, NetlinkError>;
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, NetlinkError>;
    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, NetlinkError>;
    async fn link_del(&self, index: u32) -> Result<(), NetlinkError>;
    async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<(), NetlinkError>;
    async fn link_set_tx_queue_len(&self, index: u32, qlen: u32) -> Result<(), NetlinkError>;
    async fn route_list(&self, family: RouteFamily) -> Result<Vec<RouteInfo>, NetlinkError>;
    /// Subscribes to link and address updates with the given channel buffer.
    /// Existing state is not replayed.
    async fn subscribe(&self, buffer: usize) -> Result<EventSubscription, NetlinkError>;
}

/// Production [`Netlink`] backed by an `rtnetlink` connection.
#[derive(Debug)]
pub struct RtNetlink {
    handle: rtnetlink::Handle,
    connection: JoinHandle<()>,
}

impl RtNetlink {
    pub fn new() -> Result<Self, NetlinkError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let connection = tokio::spawn(connection);
        Ok(Self { handle, connection })
    }
}

impl Drop for RtNetlink {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, NetlinkError> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(message) = stream.try_next().await? {
            links.push(link_info(&message));
        }
        Ok(links)
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, NetlinkError> {
        let mut stream = self.handle.link().get().match_name(name.to_string()).execute();
        match stream.try_next().await {
            Ok(message) => Ok(message.map(|m| link_info(&m))),
            Err(err) if is_no_device(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, NetlinkError> {
        let mut stream = self.handle.link().get().match_index(index).execute();
        match stream.try_next().await {
            Ok(message) => Ok(message.map(|m| link_info(&m))),
            Err(err) if is_no_device(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn link_del(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle.link().del(index).execute().await?;
        Ok(())
    }

    async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<(), NetlinkError> {
        let mut message = LinkMessage::default();
        message.header.index = index;
        message.attributes.push(LinkAttribute::Mtu(mtu));
        self.handle.link().set(message).execute().await?;
        Ok(())
    }

    async fn link_set_tx_queue_len(&self, index: u32, qlen: u32) -> Result<(), NetlinkError> {
        let mut message = LinkMessage::default();
        message.header.index = index;
        message.attributes.push(LinkAttribute::TxQueueLen(qlen));
        self.handle.link().set(message).execute().await?;
        Ok(())
    }

    async fn route_list(&self, family: RouteFamily) -> Result<Vec<RouteInfo>, NetlinkError> {
        let message = match family {
            RouteFamily::V4 => RouteMessageBuilder::<std::net::Ipv4Addr>::new().build(),
            RouteFamily::V6 => RouteMessageBuilder::<std::net::Ipv6Addr>::new().build(),
        };
        let mut stream = self.handle.route().get(message).execute();
        let mut routes = Vec::new();
        while let Some(message) = stream.try_next().await? {
            routes.push(route_info(&message));
        }
        Ok(routes)
    }

    async fn subscribe(&self, buffer: usize) -> Result<EventSubscription, NetlinkError> {
        let (mut connection, _, mut messages) = rtnetlink::new_connection()?;

        let groups = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;
        let addr = SocketAddr::new(0, groups);
        connection.socket_mut().socket_mut().bind(&addr)?;

        let connection_task = tokio::spawn(connection);

        let (tx, rx) = mpsc::channel(buffer);
        let forward_task = tokio::spawn(async move {
            while let Some((message, _)) = messages.next().await {
                let event = match message.payload {
                    NetlinkPayload::InnerMessage(
                        RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link),
                    ) => Some(LinkEvent::Link { name: link_name(&link) }),
                    NetlinkPayload::InnerMessage(
                        RouteNetlinkMessage::NewAddress(addr)
                        | RouteNetlinkMessage::DelAddress(addr),
                    ) => Some(LinkEvent::Address { link_index: addr.header.index }),
                    _ => None,
                };
                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(EventSubscription::new(rx, vec![connection_task, forward_task]))
    }
}

fn is_no_device(err: &rtnetlink::Error) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(message) => {
            message.code.map(|code| code.get()) == Some(-ENODEV)
        }
        _ => false,
    }
}

fn link_name(message: &LinkMessage) -> Option<String> {
    message.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) if !name.is_empty() => Some(name.clone()),
        _ => None,
    })
}

fn link_info(message: &LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        index: message.header.index,
        up: message.header.flags.contains(LinkFlags::Up),
        loopback: message.header.flags.contains(LinkFlags::Loopback),
        ..Default::default()
    };
    for attr in &message.attributes {
        match attr {
            LinkAttribute::IfName(name) => info.name = name.clone(),
            LinkAttribute::Mtu(mtu) => info.mtu = *mtu,
            LinkAttribute::TxQueueLen(qlen) => info.tx_queue_len = *qlen,
            _ => {}
        }
    }
    info
}

fn route_info(message: &RouteMessage) -> RouteInfo {
    let mut info = RouteInfo::default();
    let prefix_len = message.header.destination_prefix_length;
    for attr in &message.attributes {
        match attr {
            RouteAttribute::Destination(dst) => {
                if let Some(addr) = route_address(dst) {
                    info.destination = Some((addr, prefix_len));
                }
            }
            RouteAttribute::Gateway(gw) => info.gateway = route_address(gw),
            RouteAttribute::Oif(index) => info.link_index = Some(*index),
            _ => {}
        }
    }
    info
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}
