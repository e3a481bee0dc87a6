//! One ICE-negotiated channel to one peer.
//!
//! A [`VirtualLink`] is the engine-facing handle; the link worker task owns
//! the UDP socket, the ICE agent and (for sealed links) the cipher. Commands
//! flow in over an mpsc channel, state changes flow out as [`LinkEvent`]s on
//! the engine's dispatch queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use eth_frame::MacAddr;
use frame_cache::{Frame, FrameCache};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::OnceLock;
use str0m::crypto::{CryptoProvider, Sha1HmacProvider};
use str0m::ice::{IceAgent, IceAgentEvent, IceCreds, StunMessage, StunPacket};
use str0m::net::Protocol;
use str0m::{Candidate, IceConnectionState};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::candidates::{self, CandidateEntry, KIND_HOST, KIND_SRFLX};
use crate::identity::{self, NodeIdentity};
use crate::sealed::{Opened, SealedChannel};
use crate::stun::StunBinding;

/// How long we keep gathering before the CAS is declared ready regardless of
/// the STUN binding's fate.
const GATHER_TIMEOUT: Duration = Duration::from_secs(6);

/// Upper bound between two cipher timer ticks.
const CIPHER_TICK: Duration = Duration::from_millis(250);

/// Room for one sealed overlay frame.
const RECV_BUFFER_SIZE: usize = 2048;

/// Identifies a peer node. `mac` keys every forwarding table; `fingerprint`
/// pins the key a sealed link must handshake against; `cas` holds the
/// remote candidates until the connection is started.
#[derive(Debug, Clone, Default)]
pub struct PeerDescriptor {
    pub uid: String,
    pub vip4: String,
    pub vip6: String,
    pub mac: MacAddr,
    pub fingerprint: String,
    pub cas: String,
}

/// Per-link transport configuration, copied from the owning network's
/// descriptor.
#[derive(Debug, Clone, Default)]
pub struct VlinkDescriptor {
    pub name: String,
    pub sec_enabled: bool,
    pub stun_addr: String,
    pub turn_addr: String,
    pub turn_user: String,
    pub turn_pass: String,
}

/// Commands the engine posts to the link worker.
pub enum LinkCmd {
    SetPeerCandidates(String),
    Start,
    Transmit(Frame),
    QueryStats(oneshot::Sender<LinkStats>),
    Disconnect,
}

/// State changes the link worker reports to the engine.
pub enum LinkEvent {
    LocalCasReady { mac: MacAddr, cas: String },
    Ready { mac: MacAddr },
    Broken { mac: MacAddr },
    Data { mac: MacAddr, frame: Frame },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub local_addr: String,
    pub rem_addr: String,
    pub state: String,
    pub writable: bool,
    pub sealed: bool,
    pub sent_total_bytes: u64,
    pub sent_frames: u64,
    pub recv_total_bytes: u64,
    pub recv_frames: u64,
}

/// Engine-facing handle; cheap to clone, shared by the adjacency entry and
/// any number of route entries.
#[derive(Clone)]
pub struct VirtualLink {
    peer: Arc<PeerDescriptor>,
    ready: Arc<AtomicBool>,
    local_cas: Arc<Mutex<Option<String>>>,
    cmd_tx: mpsc::UnboundedSender<LinkCmd>,
}

impl VirtualLink {
    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn mac(&self) -> MacAddr {
        self.peer.mac
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The local CAS, once gathering concluded. Empty until then.
    pub fn local_cas(&self) -> Option<String> {
        self.local_cas.lock().clone()
    }

    /// Stores the remote CAS for a later [`VirtualLink::start`].
    pub fn set_peer_candidates(&self, cas: String) {
        self.post(LinkCmd::SetPeerCandidates(cas));
    }

    /// Applies the stored remote candidates and begins connectivity checks.
    pub fn start(&self) {
        self.post(LinkCmd::Start);
    }

    /// Queues one overlay frame. Dropped silently (with a trace) when the
    /// link is not writable.
    pub fn transmit(&self, frame: Frame) {
        self.post(LinkCmd::Transmit(frame));
    }

    pub async fn stats(&self) -> Option<LinkStats> {
        let (tx, rx) = oneshot::channel();
        self.post(LinkCmd::QueryStats(tx));

        rx.await.ok()
    }

    pub fn disconnect(&self) {
        self.post(LinkCmd::Disconnect);
    }

    fn post(&self, cmd: LinkCmd) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::trace!(peer = %self.peer.mac, "Link worker is gone; command dropped");
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn from_parts(
        peer: PeerDescriptor,
        cmd_tx: mpsc::UnboundedSender<LinkCmd>,
        ready: bool,
    ) -> Self {
        Self {
            peer: Arc::new(peer),
            ready: Arc::new(AtomicBool::new(ready)),
            local_cas: Arc::new(Mutex::new(None)),
            cmd_tx,
        }
    }
}

impl std::fmt::Debug for VirtualLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualLink")
            .field("peer", &self.peer.mac)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Creates the link worker and returns its handle.
///
/// Must be called within a tokio runtime. Setup failures after this returns
/// (socket bind, STUN resolution) are logged, never fatal: the link simply
/// never reaches ready and the controller decides whether to tear it down.
pub fn spawn(
    vlink_desc: VlinkDescriptor,
    peer: PeerDescriptor,
    identity: &NodeIdentity,
    ignored_interfaces: Vec<String>,
    cache: FrameCache,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<VirtualLink> {
    if identity.uid() == peer.uid {
        bail!("a node does not link to itself (uid {})", peer.uid);
    }

    // Lexicographically smaller uid takes the controlling role, so exactly
    // one side nominates and offers first.
    let controlling = identity.uid() < peer.uid.as_str();

    let cipher = if vlink_desc.sec_enabled {
        let pinned = identity::parse_fingerprint(&peer.fingerprint)
            .with_context(|| format!("Bad fingerprint for peer {}", peer.mac))?;
        Some(SealedChannel::new(identity.secret(), pinned)?)
    } else {
        None
    };

    if !vlink_desc.turn_addr.is_empty()
        && (vlink_desc.turn_user.is_empty() || vlink_desc.turn_pass.is_empty())
    {
        tracing::warn!(turn = %vlink_desc.turn_addr, "TURN server configured without credentials");
    }

    let peer = Arc::new(peer);
    let ready = Arc::new(AtomicBool::new(false));
    let local_cas = Arc::new(Mutex::new(None));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let handle = VirtualLink {
        peer: peer.clone(),
        ready: ready.clone(),
        local_cas: local_cas.clone(),
        cmd_tx,
    };

    tokio::spawn(run_link(
        vlink_desc,
        peer,
        controlling,
        cipher,
        ignored_interfaces,
        cache,
        events,
        ready,
        local_cas,
        cmd_rx,
    ));

    Ok(handle)
}

async fn run_link(
    vlink_desc: VlinkDescriptor,
    peer: Arc<PeerDescriptor>,
    controlling: bool,
    cipher: Option<SealedChannel>,
    ignored_interfaces: Vec<String>,
    cache: FrameCache,
    events: mpsc::UnboundedSender<LinkEvent>,
    ready: Arc<AtomicBool>,
    local_cas: Arc<Mutex<Option<String>>>,
    cmd_rx: mpsc::UnboundedReceiver<LinkCmd>,
) {
    let mac = peer.mac;

    let worker = match LinkWorker::init(
        vlink_desc,
        peer,
        controlling,
        cipher,
        ignored_interfaces,
        cache,
        events,
        ready,
        local_cas,
        cmd_rx,
    )
    .await
    {
        Ok(worker) => worker,
        Err(e) => {
            tracing::warn!(peer = %mac, "Link setup failed: {e:#}");
            return;
        }
    };

    worker.run().await;
}

struct LinkWorker {
    peer: Arc<PeerDescriptor>,
    peer_cas: String,
    controlling: bool,

    socket: UdpSocket,
    local_addr: SocketAddr,

    agent: IceAgent,
    stun: Option<StunBinding>,
    cipher: Option<SealedChannel>,

    local_candidates: Vec<CandidateEntry>,
    gather_started: Instant,
    cas_emitted: bool,
    local_cas: Arc<Mutex<Option<String>>>,

    nominated: Option<SocketAddr>,
    ready: Arc<AtomicBool>,
    ready_emitted: bool,

    sent_total_bytes: u64,
    sent_frames: u64,
    recv_total_bytes: u64,
    recv_frames: u64,

    cache: FrameCache,
    events: mpsc::UnboundedSender<LinkEvent>,
    cmd_rx: mpsc::UnboundedReceiver<LinkCmd>,
}

fn sha1_hmac_provider() -> &'static dyn Sha1HmacProvider {
    static PROVIDER: OnceLock<CryptoProvider> = OnceLock::new();
    PROVIDER
        .get_or_init(str0m::crypto::from_feature_flags)
        .sha1_hmac_provider
}

impl LinkWorker {
    async fn init(
        vlink_desc: VlinkDescriptor,
        peer: Arc<PeerDescriptor>,
        controlling: bool,
        cipher: Option<SealedChannel>,
        ignored_interfaces: Vec<String>,
        cache: FrameCache,
        events: mpsc::UnboundedSender<LinkEvent>,
        ready: Arc<AtomicBool>,
        local_cas: Arc<Mutex<Option<String>>>,
        cmd_rx: mpsc::UnboundedReceiver<LinkCmd>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind the link socket")?;
        let local_addr = socket.local_addr()?;

        let mut agent = IceAgent::new(IceCreds::new(), sha1_hmac_provider());
        agent.set_controlling(controlling);
        apply_stun_timings(&mut agent, controlling);

        let stun = match resolve_server(&vlink_desc.stun_addr).await {
            Ok(server) => server.map(StunBinding::new),
            Err(e) => {
                tracing::warn!(stun = %vlink_desc.stun_addr, "STUN server unusable: {e:#}");
                None
            }
        };

        if !vlink_desc.turn_addr.is_empty() {
            // Relay allocation is the controller's concern; remote relay
            // candidates are still paired when supplied.
            tracing::info!(turn = %vlink_desc.turn_addr, "TURN configured; relay candidates are accepted from the peer");
        }

        let mut worker = Self {
            peer,
            peer_cas: String::new(),
            controlling,
            socket,
            local_addr,
            agent,
            stun,
            cipher,
            local_candidates: Vec::new(),
            gather_started: Instant::now(),
            cas_emitted: false,
            local_cas,
            nominated: None,
            ready,
            ready_emitted: false,
            sent_total_bytes: 0,
            sent_frames: 0,
            recv_total_bytes: 0,
            recv_frames: 0,
            cache,
            events,
            cmd_rx,
        };

        worker.gather_host_candidates(&ignored_interfaces);
        worker.handle_timeout(Instant::now());

        Ok(worker)
    }

    async fn run(mut self) {
        let mac = self.peer.mac;
        let mut recv_buf = [0u8; RECV_BUFFER_SIZE];

        tracing::debug!(peer = %mac, local = %self.local_addr, controlling = self.controlling, "Link worker started");

        loop {
            self.drive(Instant::now()).await;

            let deadline = tokio::time::Instant::from_std(self.next_deadline(Instant::now()));

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(LinkCmd::Disconnect) => break,
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                result = self.socket.recv_from(&mut recv_buf) => {
                    match result {
                        Ok((n, from)) => self.handle_packet(&recv_buf[..n], from, Instant::now()).await,
                        Err(e) => {
                            tracing::warn!(peer = %mac, "Link socket receive failed: {e}");
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_timeout(Instant::now());
                }
            }
        }

        self.ready.store(false, Ordering::Release);
        tracing::debug!(peer = %mac, "Link worker stopped");
    }

    fn gather_host_candidates(&mut self, ignored: &[String]) {
        let interfaces = match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!("Failed to enumerate host interfaces: {e}");
                return;
            }
        };

        let creds = self.agent.local_credentials().clone();
        let port = self.local_addr.port();

        for (name, ip) in interfaces {
            if ignored.iter().any(|i| *i == name) || ip.is_loopback() || !ip.is_ipv4() {
                continue;
            }

            let addr = SocketAddr::new(ip, port);
            match Candidate::host(addr, Protocol::Udp) {
                Ok(candidate) => {
                    if self.agent.add_local_candidate(candidate).is_none() {
                        continue;
                    }
                }
                Err(e) => {
                    tracing::debug!(%addr, "Skipping host candidate: {e}");
                    continue;
                }
            }

            self.local_candidates
                .push(local_entry(KIND_HOST, addr, &creds));
        }

        tracing::debug!(count = self.local_candidates.len(), "Gathered host candidates");
    }

    async fn handle_cmd(&mut self, cmd: LinkCmd) {
        match cmd {
            LinkCmd::SetPeerCandidates(cas) => {
                self.peer_cas = cas;
            }
            LinkCmd::Start => self.start_connections(),
            LinkCmd::Transmit(frame) => self.transmit(frame).await,
            LinkCmd::QueryStats(reply) => {
                let _ = reply.send(self.stats());
            }
            LinkCmd::Disconnect => unreachable!("handled by the run loop"),
        }
    }

    fn start_connections(&mut self) {
        let entries = candidates::parse_cas(&self.peer_cas);
        if entries.is_empty() {
            tracing::warn!(peer = %self.peer.mac, "Cannot start connection: no usable remote candidates");
            return;
        }

        // Every entry carries the remote agent's credentials; the first one
        // is as good as any.
        self.agent.set_remote_credentials(IceCreds {
            ufrag: entries[0].username.clone(),
            pass: entries[0].password.clone(),
        });

        for entry in &entries {
            if let Some(candidate) = entry.to_agent_candidate() {
                self.agent.add_remote_candidate(candidate);
            }
        }

        self.handle_timeout(Instant::now());
    }

    async fn transmit(&mut self, frame: Frame) {
        let Some(dst) = self.nominated else {
            tracing::trace!(peer = %self.peer.mac, "Dropping frame: link not writable");
            return;
        };

        let datagram = match &mut self.cipher {
            Some(cipher) => match cipher.seal(frame.wire()) {
                Some(bytes) => bytes,
                None => return,
            },
            None => frame.wire().to_vec(),
        };

        match self.socket.send_to(&datagram, dst).await {
            Ok(_) => {
                self.sent_total_bytes += frame.wire().len() as u64;
                self.sent_frames += 1;
            }
            Err(e) => tracing::warn!(peer = %self.peer.mac, "Link send failed: {e}"),
        }
        // The frame drops here and its buffer returns to the cache.
    }

    async fn handle_packet(&mut self, packet: &[u8], from: SocketAddr, now: Instant) {
        if let Some(stun) = &mut self.stun
            && stun.handle_input(from, packet, now)
        {
            return;
        }

        if let Ok(message) = StunMessage::parse(packet) {
            if self.agent.accepts_message(&message) {
                self.agent.handle_packet(
                    now,
                    StunPacket {
                        proto: Protocol::Udp,
                        source: from,
                        destination: self.local_addr,
                        message,
                    },
                );
            }
            return;
        }

        let opened = match &mut self.cipher {
            Some(cipher) => cipher.open(from.ip(), packet),
            None => {
                self.deliver(packet);
                return;
            }
        };

        for result in opened {
            match result {
                Opened::Network(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, from).await {
                        tracing::warn!(peer = %self.peer.mac, "Cipher reply send failed: {e}");
                    }
                }
                Opened::Frame(bytes) => self.deliver(&bytes),
            }
        }
    }

    fn deliver(&mut self, frame_wire: &[u8]) {
        match self.cache.acquire_with_data(frame_wire) {
            Ok(frame) => {
                self.recv_total_bytes += frame_wire.len() as u64;
                self.recv_frames += 1;
                let _ = self.events.send(LinkEvent::Data {
                    mac: self.peer.mac,
                    frame,
                });
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer.mac, "Dropping inbound frame: {e}");
            }
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.agent.handle_timeout(now);

        if let Some(stun) = &mut self.stun {
            stun.handle_timeout(now);
        }
    }

    /// Drains every sans-IO component and reports resulting state changes.
    async fn drive(&mut self, now: Instant) {
        // STUN binding first: its transmits leave from our socket so the
        // mapped address matches the advertised port.
        let mut srflx = Vec::new();
        if let Some(stun) = &mut self.stun {
            while let Some((dst, bytes)) = stun.poll_transmit() {
                if let Err(e) = self.socket.send_to(&bytes, dst).await {
                    tracing::warn!("STUN request send failed: {e}");
                }
            }
            while let Some(mapped) = stun.poll_mapped_address() {
                srflx.push(mapped);
            }
        }
        for mapped in srflx {
            self.add_srflx_candidate(mapped);
        }

        while let Some(event) = self.agent.poll_event() {
            self.handle_agent_event(event);
        }

        while let Some(transmit) = self.agent.poll_transmit() {
            let payload = Vec::from(transmit.contents);
            if let Err(e) = self.socket.send_to(&payload, transmit.destination).await {
                tracing::warn!("ICE transmit failed: {e}");
            }
        }

        if let Some(cipher) = &mut self.cipher {
            if let Some(bytes) = cipher.tick()
                && let Some(dst) = self.nominated
                && let Err(e) = self.socket.send_to(&bytes, dst).await
            {
                tracing::warn!("Cipher timer send failed: {e}");
            }
        }

        self.maybe_emit_cas(now);
        self.maybe_emit_ready();
    }

    fn handle_agent_event(&mut self, event: IceAgentEvent) {
        match event {
            IceAgentEvent::NominatedSend { destination, .. } => {
                tracing::debug!(peer = %self.peer.mac, %destination, "ICE nominated a pair");
                self.nominated = Some(destination);

                if self.controlling
                    && let Some(cipher) = &mut self.cipher
                    && !cipher.is_established()
                    && let Some(init) = cipher.initiate()
                {
                    let socket = &self.socket;
                    // Fire-and-forget; retransmission is timer-driven.
                    if let Err(e) = socket.try_send_to(&init, destination) {
                        tracing::debug!("Handshake initiation send failed: {e}");
                    }
                }
            }
            IceAgentEvent::IceConnectionStateChange(IceConnectionState::Disconnected) => {
                tracing::info!(peer = %self.peer.mac, "Link is no longer writable");
                self.nominated = None;
                self.ready.store(false, Ordering::Release);

                if self.ready_emitted {
                    self.ready_emitted = false;
                    let _ = self.events.send(LinkEvent::Broken {
                        mac: self.peer.mac,
                    });
                }
            }
            IceAgentEvent::IceConnectionStateChange(state) => {
                tracing::trace!(peer = %self.peer.mac, ?state, "ICE connection state changed");
            }
            IceAgentEvent::DiscoveredRecv { .. } | IceAgentEvent::IceRestart(_) => {}
        }
    }

    fn add_srflx_candidate(&mut self, mapped: SocketAddr) {
        if mapped.port() == 0 {
            return;
        }

        let creds = self.agent.local_credentials().clone();
        let entry = local_entry(KIND_SRFLX, mapped, &creds);

        if self.local_candidates.contains(&entry) {
            return;
        }

        // Server-reflexive candidates are advertise-only: we always send
        // from their base, which the agent already knows.
        self.local_candidates.push(entry);
    }

    fn maybe_emit_cas(&mut self, now: Instant) {
        if self.cas_emitted {
            return;
        }

        let resolved = match &self.stun {
            Some(stun) => stun.is_resolved(now),
            None => true,
        };
        if !resolved && now.duration_since(self.gather_started) < GATHER_TIMEOUT {
            return;
        }

        self.cas_emitted = true;
        let cas = candidates::format_cas(&self.local_candidates);
        tracing::debug!(peer = %self.peer.mac, candidates = self.local_candidates.len(), "Local CAS ready");

        *self.local_cas.lock() = Some(cas.clone());
        let _ = self.events.send(LinkEvent::LocalCasReady {
            mac: self.peer.mac,
            cas,
        });
    }

    fn maybe_emit_ready(&mut self) {
        if self.ready_emitted || self.nominated.is_none() {
            return;
        }

        if let Some(cipher) = &self.cipher
            && !cipher.is_established()
        {
            return;
        }

        self.ready_emitted = true;
        self.ready.store(true, Ordering::Release);
        tracing::info!(peer = %self.peer.mac, "Link is ready");

        let _ = self.events.send(LinkEvent::Ready {
            mac: self.peer.mac,
        });
    }

    fn next_deadline(&mut self, now: Instant) -> Instant {
        let mut deadline = now + Duration::from_secs(1);

        if let Some(at) = self.agent.poll_timeout() {
            deadline = deadline.min(at);
        }
        if let Some(at) = self.stun.as_ref().and_then(StunBinding::poll_timeout) {
            deadline = deadline.min(at);
        }
        if self.cipher.is_some() {
            deadline = deadline.min(now + CIPHER_TICK);
        }
        if !self.cas_emitted {
            deadline = deadline.min(self.gather_started + GATHER_TIMEOUT);
        }

        deadline.max(now)
    }

    fn stats(&self) -> LinkStats {
        LinkStats {
            local_addr: self.local_addr.to_string(),
            rem_addr: self
                .nominated
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            state: format!("{:?}", self.agent.state()),
            writable: self.ready.load(Ordering::Acquire),
            sealed: self.cipher.is_some(),
            sent_total_bytes: self.sent_total_bytes,
            sent_frames: self.sent_frames,
            recv_total_bytes: self.recv_total_bytes,
            recv_frames: self.recv_frames,
        }
    }
}

fn local_entry(kind: &str, addr: SocketAddr, creds: &IceCreds) -> CandidateEntry {
    CandidateEntry {
        component: candidates::COMPONENT_DEFAULT,
        protocol: "udp".to_owned(),
        addr,
        priority: CandidateEntry::priority_for(kind),
        username: creds.ufrag.clone(),
        password: creds.pass.clone(),
        kind: kind.to_owned(),
        generation: 0,
        foundation: CandidateEntry::foundation_for(kind, addr),
    }
}

async fn resolve_server(addr: &str) -> Result<Option<SocketAddr>> {
    if addr.is_empty() {
        return Ok(None);
    }

    let resolved = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve `{addr}`"))?
        .find(SocketAddr::is_ipv4);

    Ok(resolved)
}

/// STUN check pacing: the controlling side probes fast and gives up fast;
/// the controlled side keeps answering for much longer.
fn apply_stun_timings(agent: &mut IceAgent, controlling: bool) {
    let retransmits = if controlling { 12 } else { 45 };
    let max_rto = if controlling { 1_500 } else { 15_000 };

    agent.set_max_stun_retransmits(retransmits);
    agent.set_max_stun_rto(Duration::from_millis(max_rto));
    agent.set_initial_stun_rto(Duration::from_millis(250));
}
