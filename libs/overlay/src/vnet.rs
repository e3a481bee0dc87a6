//! The virtual-network engine: one TAP, one peer network, one frame cache,
//! and the dispatch task that serialises every mutation.
//!
//! All public operations post onto the dispatch task's queue; the two
//! blocking queries (`create_link_endpoint`, `query_node_info`) wait on a
//! oneshot reply. TAP read completions and link events converge on the same
//! queue, so frame handling is totally ordered per network.

use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use eth_frame::{DTF_MAGIC, FWD_MAGIC, ICC_MAGIC, FrameKind, MAX_ICC, MacAddr, TAP_BUFFER_SIZE};
use frame_cache::{Frame, FrameCache};
use parking_lot::Mutex;
use serde::Serialize;
use tap::{TapDescriptor, TapDevice, TapIo};
use tokio::sync::{mpsc, oneshot};
use vlink::{LinkEvent, LinkStats, NodeIdentity, PeerDescriptor, VirtualLink, VlinkDescriptor};

use crate::peer_network::{PeerNetwork, spawn_scavenger};

/// Everything `CreateVnet` supplies.
#[derive(Debug, Clone, Default)]
pub struct VnetDescriptor {
    pub name: String,
    pub uid: String,
    pub description: String,
    pub vip4: String,
    pub prefix4: u8,
    pub mtu4: u16,
    pub l2tunnel_enabled: bool,
    pub stun_addr: String,
    pub turn_addr: String,
    pub turn_user: String,
    pub turn_pass: String,
}

/// How the engine reaches the controller process. Implemented over the
/// control channel; swapped in when the controller registers its endpoint.
pub trait ControllerHandle: Send + Sync + 'static {
    /// An inbound ICC payload for the controller.
    fn deliver_icc(&self, interface: &str, data: &[u8]);

    /// A frame had no adjacency and no route; the controller owns route
    /// repair. `frame` is the Ethernet bytes.
    fn request_route_update(&self, interface: &str, frame: &[u8]);

    /// The local candidate set of a pending link is complete.
    fn local_cas_ready(&self, interface: &str, mac: MacAddr, cas: &str);
}

/// `QueryNodeInfo` result, serialised into the control response.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    #[serde(rename = "Type")]
    pub node_type: String,
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "VIP4")]
    pub vip4: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
    #[serde(rename = "InterfaceName")]
    pub interface: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Stats", skip_serializing_if = "Option::is_none")]
    pub stats: Option<LinkStats>,
}

enum VnetMsg {
    CreateLink {
        peer: PeerDescriptor,
        sec_enabled: bool,
        created: oneshot::Sender<Result<VirtualLink>>,
    },
    StartConnection {
        mac: MacAddr,
    },
    EndConnection {
        mac: MacAddr,
    },
    SendIcc {
        mac: MacAddr,
        frame: Frame,
    },
    QueryLinkStats {
        mac: MacAddr,
        reply: oneshot::Sender<Option<LinkStats>>,
    },
    InjectFrame {
        frame: Frame,
    },
    Shutdown,
}

/// Handle to a running virtual network. Clones share the dispatch queue.
#[derive(Clone)]
pub struct VirtualNetwork {
    descriptor: Arc<VnetDescriptor>,
    tap_mac: MacAddr,
    fingerprint: String,
    peers: Arc<PeerNetwork<VirtualLink>>,
    cache: FrameCache,
    ignored_interfaces: Arc<Mutex<Vec<String>>>,
    msg_tx: mpsc::UnboundedSender<VnetMsg>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl VirtualNetwork {
    /// Opens the kernel TAP named by the descriptor and starts the engine.
    pub fn create(
        descriptor: VnetDescriptor,
        controller: Arc<dyn ControllerHandle>,
    ) -> Result<Self> {
        if !descriptor.l2tunnel_enabled {
            // The layer-3 pipeline was never built; everything runs the
            // layer-2 dataplane.
            tracing::warn!(name = %descriptor.name, "Layer-3 mode requested but unsupported; running layer-2");
        }

        let ip4 = descriptor
            .vip4
            .parse()
            .with_context(|| format!("`{}` is not an IPv4 address", descriptor.vip4))?;

        let device = TapDevice::open(&TapDescriptor {
            name: descriptor.name.clone(),
            ip4,
            prefix4: descriptor.prefix4,
            mtu4: descriptor.mtu4,
        })?;

        let cache = FrameCache::new();
        let tap_io = device.start(cache.clone());
        let tap_mac = device.mac();
        device.up()?;

        Self::spawn_with_device(descriptor, controller, tap_mac, tap_io, Some(device), cache)
    }

    /// Starts the engine over caller-supplied device channels. This is the
    /// seam the tests (and alternative device backends) use; [`Self::create`]
    /// plugs in the kernel TAP.
    pub fn spawn_with_device(
        descriptor: VnetDescriptor,
        controller: Arc<dyn ControllerHandle>,
        tap_mac: MacAddr,
        tap_io: TapIo,
        device: Option<TapDevice>,
        cache: FrameCache,
    ) -> Result<Self> {
        if descriptor.uid.is_empty() {
            bail!("a virtual network needs a node UID");
        }

        let identity = NodeIdentity::generate(descriptor.uid.clone());
        let fingerprint = identity.fingerprint();
        let descriptor = Arc::new(descriptor);
        let peers = Arc::new(PeerNetwork::new(descriptor.name.clone()));
        let ignored_interfaces = Arc::new(Mutex::new(Vec::new()));

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();

        let scavenger = spawn_scavenger(peers.clone());

        let worker = VnetWorker {
            descriptor: descriptor.clone(),
            identity,
            tap_mac,
            device,
            tap_reads: tap_io.reads,
            tap_writes: tap_io.writes,
            cache: cache.clone(),
            peers: peers.clone(),
            controller,
            ignored_interfaces: ignored_interfaces.clone(),
            link_events_tx: link_events_tx.clone(),
            link_events_rx,
            msg_rx,
            scavenger,
        };
        tokio::spawn(worker.run());

        tracing::info!(name = %descriptor.name, mac = %tap_mac, "Virtual network started");

        Ok(Self {
            descriptor,
            tap_mac,
            fingerprint,
            peers,
            cache,
            ignored_interfaces,
            msg_tx,
            link_events_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn mac(&self) -> MacAddr {
        self.tap_mac
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn descriptor(&self) -> &VnetDescriptor {
        &self.descriptor
    }

    pub fn peer_network(&self) -> &Arc<PeerNetwork<VirtualLink>> {
        &self.peers
    }

    /// Restricts which host NICs contribute candidates to future links.
    pub fn set_ignored_interfaces(&self, interfaces: Vec<String>) {
        *self.ignored_interfaces.lock() = interfaces;
    }

    /// The sender link workers report their events on; test harnesses use it
    /// to play a peer.
    #[doc(hidden)]
    pub fn link_events_sender(&self) -> mpsc::UnboundedSender<LinkEvent> {
        self.link_events_tx.clone()
    }

    /// Ensures a link to the peer exists, then returns it. Blocks on the
    /// dispatch worker when the link has to be created.
    pub async fn create_link_endpoint(
        &self,
        peer: PeerDescriptor,
        sec_enabled: bool,
    ) -> Result<VirtualLink> {
        if let Some(existing) = self.peers.get_vlink(peer.mac) {
            return Ok(existing);
        }

        let (created, done) = oneshot::channel();
        self.post(VnetMsg::CreateLink {
            peer,
            sec_enabled,
            created,
        })?;

        done.await.context("The dispatch worker went away")?
    }

    /// Applies a peer descriptor plus remote CAS and starts connectivity
    /// checks, creating the link first if needed.
    pub async fn connect_to_peer(&self, peer: PeerDescriptor, sec_enabled: bool) -> Result<()> {
        let mac = peer.mac;
        let cas = peer.cas.clone();
        if cas.is_empty() {
            bail!("the peer descriptor carries no connection candidates");
        }

        let link = self.create_link_endpoint(peer, sec_enabled).await?;
        link.set_peer_candidates(cas);
        self.post(VnetMsg::StartConnection { mac })?;

        Ok(())
    }

    pub fn remove_peer(&self, mac: MacAddr) -> Result<()> {
        self.post(VnetMsg::EndConnection { mac })
    }

    /// Route updates apply in receive order; the peer tables serialise
    /// themselves.
    pub fn update_route(&self, dest: MacAddr, via: MacAddr) -> Result<()> {
        if dest == self.tap_mac || via == self.tap_mac {
            bail!("the local TAP MAC never appears in the forwarding tables");
        }

        self.peers.update_route(dest, via)?;

        Ok(())
    }

    /// Sends an opaque controller payload to an adjacent peer.
    pub fn send_icc(&self, mac: MacAddr, data: &str) -> Result<()> {
        if data.len() > MAX_ICC {
            bail!("ICC payload of {} bytes exceeds the {MAX_ICC}-byte maximum", data.len());
        }

        let mut frame = self.cache.acquire_or_grow();
        frame.load_ethernet(data.as_bytes())?;
        frame.set_magic(ICC_MAGIC);

        self.post(VnetMsg::SendIcc { mac, frame })
    }

    /// Decodes a hex-encoded Ethernet frame and writes it to the local TAP.
    pub fn inject_frame(&self, frame_hex: &str) -> Result<()> {
        if frame_hex.len() > 2 * TAP_BUFFER_SIZE {
            bail!(
                "injected frame of {} bytes is larger than the maximum accepted {TAP_BUFFER_SIZE}",
                frame_hex.len() / 2
            );
        }

        let bytes = hex::decode(frame_hex).context("The injected frame is not valid hex")?;
        let mut frame = self.cache.acquire_or_grow();
        frame.load_ethernet(&bytes)?;

        self.post(VnetMsg::InjectFrame { frame })
    }

    /// Local node info, or an adjacent peer's descriptor and link stats.
    pub async fn query_node_info(&self, mac: Option<MacAddr>) -> NodeInfo {
        let mac = match mac {
            Some(mac) if mac != self.tap_mac => mac,
            _ => return self.local_node_info(),
        };

        let Some(link) = self.peers.get_vlink(mac) else {
            return NodeInfo {
                node_type: "peer".to_owned(),
                uid: String::new(),
                vip4: String::new(),
                mac: mac.to_hex(),
                fingerprint: String::new(),
                interface: self.descriptor.name.clone(),
                status: "unknown".to_owned(),
                stats: None,
            };
        };

        let peer = link.peer();
        let mut info = NodeInfo {
            node_type: "peer".to_owned(),
            uid: peer.uid.clone(),
            vip4: peer.vip4.clone(),
            mac: mac.to_hex(),
            fingerprint: peer.fingerprint.clone(),
            interface: self.descriptor.name.clone(),
            status: "offline".to_owned(),
            stats: None,
        };

        if link.is_ready() {
            let (reply, stats) = oneshot::channel();
            if self.post(VnetMsg::QueryLinkStats { mac, reply }).is_ok() {
                info.stats = stats.await.ok().flatten();
                info.status = "online".to_owned();
            }
        }

        info
    }

    fn local_node_info(&self) -> NodeInfo {
        NodeInfo {
            node_type: "local".to_owned(),
            uid: self.descriptor.uid.clone(),
            vip4: self.descriptor.vip4.clone(),
            mac: self.tap_mac.to_hex(),
            fingerprint: self.fingerprint.clone(),
            interface: self.descriptor.name.clone(),
            status: "online".to_owned(),
            stats: None,
        }
    }

    /// Stops the dispatch worker, tears down every link and closes the TAP.
    pub fn shutdown(&self) {
        let _ = self.msg_tx.send(VnetMsg::Shutdown);
    }

    fn post(&self, msg: VnetMsg) -> Result<()> {
        self.msg_tx
            .send(msg)
            .map_err(|_| anyhow!("the dispatch worker is gone"))
    }
}

struct VnetWorker {
    descriptor: Arc<VnetDescriptor>,
    identity: NodeIdentity,
    tap_mac: MacAddr,
    device: Option<TapDevice>,
    tap_reads: mpsc::Receiver<Frame>,
    tap_writes: mpsc::Sender<Frame>,
    cache: FrameCache,
    peers: Arc<PeerNetwork<VirtualLink>>,
    controller: Arc<dyn ControllerHandle>,
    ignored_interfaces: Arc<Mutex<Vec<String>>>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    msg_rx: mpsc::UnboundedReceiver<VnetMsg>,
    scavenger: tokio::task::JoinHandle<()>,
}

enum ForwardTarget {
    Adjacent(VirtualLink),
    Routed(VirtualLink),
    Unknown,
}

impl VnetWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    match msg {
                        None | Some(VnetMsg::Shutdown) => break,
                        Some(msg) => self.handle_msg(msg).await,
                    }
                }
                Some(frame) = self.tap_reads.recv() => {
                    self.tap_read_complete(frame);
                }
                Some(event) = self.link_events_rx.recv() => {
                    self.link_event(event).await;
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        tracing::info!(name = %self.descriptor.name, "Virtual network shutting down");

        self.scavenger.abort();
        self.peers.clear();

        if let Some(device) = &self.device {
            if let Err(e) = device.down() {
                tracing::warn!("Failed to bring the TAP down: {e:#}");
            }
            device.close();
        }
    }

    async fn handle_msg(&mut self, msg: VnetMsg) {
        match msg {
            VnetMsg::CreateLink {
                peer,
                sec_enabled,
                created,
            } => {
                let _ = created.send(self.create_link(peer, sec_enabled));
            }
            VnetMsg::StartConnection { mac } => {
                match self.peers.get_vlink(mac) {
                    Some(link) => link.start(),
                    None => tracing::warn!(%mac, "Cannot start a connection to a non-adjacent peer"),
                }
            }
            VnetMsg::EndConnection { mac } => {
                if let Err(e) = self.peers.remove(mac) {
                    tracing::warn!(%mac, "Peer removal failed: {e}");
                }
            }
            VnetMsg::SendIcc { mac, frame } => match self.peers.get_vlink(mac) {
                Some(link) => link.transmit(frame),
                None => tracing::warn!(%mac, "Dropping ICC for a non-adjacent peer"),
            },
            VnetMsg::QueryLinkStats { mac, reply } => {
                let stats = match self.peers.get_vlink(mac) {
                    Some(link) => link.stats().await,
                    None => None,
                };
                let _ = reply.send(stats);
            }
            VnetMsg::InjectFrame { frame } => {
                if self.tap_writes.try_send(frame).is_err() {
                    tracing::warn!("TAP write queue is full; injected frame dropped");
                }
            }
            VnetMsg::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn create_link(&mut self, peer: PeerDescriptor, sec_enabled: bool) -> Result<VirtualLink> {
        if peer.mac == self.tap_mac {
            bail!("refusing a link to our own TAP address {}", peer.mac);
        }
        if self.peers.is_adjacent(peer.mac) {
            tracing::warn!(mac = %peer.mac, "Link already exists and will be re-created");
        }

        let vlink_desc = VlinkDescriptor {
            name: format!("{}_{}", self.descriptor.name, peer.mac.to_hex()),
            sec_enabled,
            stun_addr: self.descriptor.stun_addr.clone(),
            turn_addr: self.descriptor.turn_addr.clone(),
            turn_user: self.descriptor.turn_user.clone(),
            turn_pass: self.descriptor.turn_pass.clone(),
        };

        let link = vlink::spawn(
            vlink_desc,
            peer,
            &self.identity,
            self.ignored_interfaces.lock().clone(),
            self.cache.clone(),
            self.link_events_tx.clone(),
        )?;

        self.peers.add(link.clone());

        Ok(link)
    }

    /// One TAP frame in: exactly one of transmit-to-adjacency,
    /// transmit-to-route, or controller notification happens.
    fn tap_read_complete(&mut self, mut frame: Frame) {
        let Some(dest) = frame.properties().destination_mac() else {
            tracing::warn!("Dropping a truncated TAP read");
            return;
        };

        match self.lookup(dest) {
            ForwardTarget::Adjacent(link) => {
                frame.set_magic(DTF_MAGIC);
                tracing::trace!(%dest, len = frame.len(), "Unicast");
                link.transmit(frame);
            }
            ForwardTarget::Routed(link) => {
                frame.set_magic(FWD_MAGIC);
                tracing::trace!(%dest, via = %link.mac(), len = frame.len(), "Forwarding via route");
                link.transmit(frame);
            }
            ForwardTarget::Unknown => {
                frame.set_magic(ICC_MAGIC);
                self.trace_unrouted(&frame, dest);

                // Only the controller can find a path for this frame.
                self.controller
                    .request_route_update(&self.descriptor.name, frame.ethernet());
                // The frame drops here; its buffer immediately backs a new
                // TAP read.
            }
        }
    }

    /// One frame in from a peer link: classified by its first two bytes.
    async fn link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCasReady { mac, cas } => {
                self.controller
                    .local_cas_ready(&self.descriptor.name, mac, &cas);
            }
            LinkEvent::Ready { mac } => {
                tracing::info!(%mac, "Tunnel established");
            }
            LinkEvent::Broken { mac } => {
                // Removal is the controller's decision, via RemovePeer.
                tracing::warn!(%mac, "Tunnel lost connectivity");
            }
            LinkEvent::Data { mac, frame } => self.link_read_complete(mac, frame).await,
        }
    }

    async fn link_read_complete(&mut self, from: MacAddr, frame: Frame) {
        match frame.kind() {
            FrameKind::Icc => {
                self.controller
                    .deliver_icc(&self.descriptor.name, frame.ethernet());
            }
            FrameKind::Fwd => {
                let Some(dest) = frame.properties().destination_mac() else {
                    tracing::warn!(%from, "Dropping a truncated forwarded frame");
                    return;
                };

                match self.lookup(dest) {
                    ForwardTarget::Adjacent(link) | ForwardTarget::Routed(link) => {
                        tracing::trace!(%dest, via = %link.mac(), "Relaying forwarded frame");
                        link.transmit(frame);
                    }
                    ForwardTarget::Unknown => {
                        self.controller
                            .request_route_update(&self.descriptor.name, frame.ethernet());
                    }
                }
            }
            FrameKind::Dtf => {
                tracing::trace!(%from, len = frame.len(), "Delivering frame to TAP");
                if self.tap_writes.try_send(frame).is_err() {
                    tracing::warn!("TAP write queue is full; frame dropped");
                }
            }
            FrameKind::Unknown(magic) => {
                tracing::warn!(%from, magic = %format!("{magic:#06x}"), "Unknown frame type received");
            }
        }
    }

    fn lookup(&self, dest: MacAddr) -> ForwardTarget {
        if let Some(link) = self.peers.get_vlink(dest) {
            return ForwardTarget::Adjacent(link);
        }
        if let Some(link) = self.peers.get_route(dest) {
            return ForwardTarget::Routed(link);
        }

        ForwardTarget::Unknown
    }

    fn trace_unrouted(&self, frame: &Frame, dest: MacAddr) {
        let props = frame.properties();
        if props.is_arp_request() {
            tracing::trace!(%dest, "ARP request");
        } else if props.is_arp_response() {
            tracing::trace!(%dest, "ARP response");
        } else if !dest.is_broadcast() {
            tracing::trace!(%dest, "No route for unicast frame");
        }
    }
}
