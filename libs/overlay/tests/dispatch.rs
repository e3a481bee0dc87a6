#![allow(clippy::unwrap_used)]

//! Frame dispatch behaviour of the virtual-network engine, driven through
//! channel-backed device and link endpoints.

use std::sync::Arc;
use std::time::Duration;

use eth_frame::{DTF_MAGIC, FWD_MAGIC, ICC_MAGIC, MacAddr};
use frame_cache::{Frame, FrameCache};
use parking_lot::Mutex;
use tap::TapIo;
use tincan_overlay::{ControllerHandle, VirtualNetwork, VnetDescriptor};
use tokio::sync::mpsc;
use vlink::{LinkCmd, LinkEvent, PeerDescriptor, VirtualLink};

const TAP_MAC: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x01]);
const PEER_B: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x02]);
const PEER_C: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x03]);

#[derive(Default)]
struct RecordingController {
    icc: Mutex<Vec<Vec<u8>>>,
    route_requests: Mutex<Vec<Vec<u8>>>,
    cas: Mutex<Vec<(MacAddr, String)>>,
}

impl ControllerHandle for RecordingController {
    fn deliver_icc(&self, _interface: &str, data: &[u8]) {
        self.icc.lock().push(data.to_vec());
    }

    fn request_route_update(&self, _interface: &str, frame: &[u8]) {
        self.route_requests.lock().push(frame.to_vec());
    }

    fn local_cas_ready(&self, _interface: &str, mac: MacAddr, cas: &str) {
        self.cas.lock().push((mac, cas.to_owned()));
    }
}

struct Harness {
    vnet: VirtualNetwork,
    cache: FrameCache,
    controller: Arc<RecordingController>,
    tap_reads_tx: mpsc::Sender<Frame>,
    tap_writes_rx: mpsc::Receiver<Frame>,
}

fn harness() -> Harness {
    let cache = FrameCache::new();
    let controller = Arc::new(RecordingController::default());
    let (tap_reads_tx, reads) = mpsc::channel(32);
    let (writes, tap_writes_rx) = mpsc::channel(32);

    let vnet = VirtualNetwork::spawn_with_device(
        VnetDescriptor {
            name: "tnl0".to_owned(),
            uid: "a".repeat(40),
            vip4: "10.10.10.1".to_owned(),
            prefix4: 24,
            mtu4: 1500,
            l2tunnel_enabled: true,
            ..Default::default()
        },
        controller.clone(),
        TAP_MAC,
        TapIo { reads, writes },
        None,
        cache.clone(),
    )
    .unwrap();

    Harness {
        vnet,
        cache,
        controller,
        tap_reads_tx,
        tap_writes_rx,
    }
}

/// A link whose worker is the test: commands posted by the engine arrive on
/// the returned receiver.
fn stub_link(mac: MacAddr) -> (VirtualLink, mpsc::UnboundedReceiver<LinkCmd>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let link = VirtualLink::from_parts(
        PeerDescriptor {
            uid: "b".repeat(40),
            mac,
            ..Default::default()
        },
        cmd_tx,
        true,
    );

    (link, cmd_rx)
}

fn eth_frame(dest: MacAddr, payload: &[u8]) -> Vec<u8> {
    let mut eth = dest.octets().to_vec();
    eth.extend_from_slice(&TAP_MAC.octets());
    eth.extend_from_slice(&[0x08, 0x00]);
    eth.extend_from_slice(payload);
    eth
}

async fn recv_transmit(cmd_rx: &mut mpsc::UnboundedReceiver<LinkCmd>) -> Frame {
    let cmd = tokio::time::timeout(Duration::from_secs(1), cmd_rx.recv())
        .await
        .expect("engine should have posted a command")
        .expect("link channel open");

    match cmd {
        LinkCmd::Transmit(frame) => frame,
        _ => panic!("expected a transmit command"),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within one second");
}

#[tokio::test]
async fn tap_frame_to_adjacent_peer_is_sent_as_dtf() {
    let h = harness();
    let (link, mut cmd_rx) = stub_link(PEER_B);
    h.vnet.peer_network().add(link);

    let eth = eth_frame(PEER_B, &[0u8; 64]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    h.tap_reads_tx.send(frame).await.unwrap();

    let sent = recv_transmit(&mut cmd_rx).await;
    assert_eq!(sent.magic(), DTF_MAGIC);
    assert_eq!(sent.ethernet(), &eth[..]);
    assert!(h.controller.route_requests.lock().is_empty());
}

#[tokio::test]
async fn tap_frame_to_routed_peer_is_sent_as_fwd() {
    let h = harness();
    let (via, mut cmd_rx) = stub_link(PEER_C);
    h.vnet.peer_network().add(via);
    h.vnet.update_route(PEER_B, PEER_C).unwrap();

    let eth = eth_frame(PEER_B, &[0u8; 32]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    h.tap_reads_tx.send(frame).await.unwrap();

    let sent = recv_transmit(&mut cmd_rx).await;
    assert_eq!(sent.magic(), FWD_MAGIC);
    assert_eq!(sent.ethernet(), &eth[..]);
}

#[tokio::test]
async fn tap_frame_without_a_path_notifies_the_controller() {
    let h = harness();

    let eth = eth_frame(PEER_B, &[0u8; 16]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    h.tap_reads_tx.send(frame).await.unwrap();

    wait_for(|| !h.controller.route_requests.lock().is_empty()).await;
    assert_eq!(h.controller.route_requests.lock()[0], eth);
    // The buffer came back to the pool once the notification was made.
    wait_for(|| h.cache.committed() == 0).await;
}

#[tokio::test]
async fn forwarded_frame_is_relayed_towards_an_adjacent_destination() {
    // The middle node of a dest|via route: it holds an adjacency for the
    // destination and relays the frame unchanged.
    let h = harness();
    let (link, mut cmd_rx) = stub_link(PEER_B);
    h.vnet.peer_network().add(link);

    let eth = eth_frame(PEER_B, &[0xAB; 40]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    frame.set_magic(FWD_MAGIC);

    h.vnet
        .link_events_sender()
        .send(LinkEvent::Data {
            mac: PEER_C,
            frame,
        })
        .unwrap();

    let sent = recv_transmit(&mut cmd_rx).await;
    assert_eq!(sent.magic(), FWD_MAGIC);
    assert_eq!(sent.ethernet(), &eth[..]);
}

#[tokio::test]
async fn forwarded_frame_without_a_route_goes_to_the_controller() {
    let h = harness();

    let eth = eth_frame(PEER_B, &[0xCD; 24]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    frame.set_magic(FWD_MAGIC);

    h.vnet
        .link_events_sender()
        .send(LinkEvent::Data {
            mac: PEER_C,
            frame,
        })
        .unwrap();

    wait_for(|| !h.controller.route_requests.lock().is_empty()).await;
    assert_eq!(h.controller.route_requests.lock()[0], eth);
}

#[tokio::test]
async fn dtf_frame_is_delivered_to_the_tap_unchanged() {
    let mut h = harness();

    let eth = eth_frame(TAP_MAC, &[0x55; 64]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    frame.set_magic(DTF_MAGIC);

    h.vnet
        .link_events_sender()
        .send(LinkEvent::Data {
            mac: PEER_B,
            frame,
        })
        .unwrap();

    let written = tokio::time::timeout(Duration::from_secs(1), h.tap_writes_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written.ethernet(), &eth[..]);
    assert_eq!(written.len(), eth.len());
}

#[tokio::test]
async fn icc_frame_reaches_the_controller_not_the_tap() {
    let mut h = harness();

    let payload = b"controller to controller".to_vec();
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&payload).unwrap();
    frame.set_magic(ICC_MAGIC);

    h.vnet
        .link_events_sender()
        .send(LinkEvent::Data {
            mac: PEER_B,
            frame,
        })
        .unwrap();

    wait_for(|| !h.controller.icc.lock().is_empty()).await;
    assert_eq!(h.controller.icc.lock()[0], payload);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), h.tap_writes_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unknown_magic_is_dropped() {
    let mut h = harness();

    let eth = eth_frame(TAP_MAC, &[0; 20]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    frame.set_magic(0x0D01);

    h.vnet
        .link_events_sender()
        .send(LinkEvent::Data {
            mac: PEER_B,
            frame,
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.controller.icc.lock().is_empty());
    assert!(h.controller.route_requests.lock().is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(50), h.tap_writes_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn removed_peer_leaves_no_route_behind() {
    let h = harness();
    let (via, _via_rx) = stub_link(PEER_C);
    h.vnet.peer_network().add(via);
    h.vnet.update_route(PEER_B, PEER_C).unwrap();
    assert!(h.vnet.peer_network().is_route_exists(PEER_B));

    h.vnet.remove_peer(PEER_C).unwrap();
    wait_for(|| !h.vnet.peer_network().is_adjacent(PEER_C)).await;

    assert!(!h.vnet.peer_network().is_route_exists(PEER_B));

    // A frame for the vanished destination now goes to the controller.
    let eth = eth_frame(PEER_B, &[0u8; 16]);
    let mut frame = h.cache.acquire_or_grow();
    frame.load_ethernet(&eth).unwrap();
    h.tap_reads_tx.send(frame).await.unwrap();

    wait_for(|| !h.controller.route_requests.lock().is_empty()).await;
}

#[tokio::test]
async fn the_local_tap_mac_never_enters_the_tables() {
    let h = harness();
    let (via, _via_rx) = stub_link(PEER_C);
    h.vnet.peer_network().add(via);

    assert!(h.vnet.update_route(TAP_MAC, PEER_C).is_err());
    assert!(h.vnet.update_route(PEER_B, TAP_MAC).is_err());
    assert!(!h.vnet.peer_network().is_route_exists(TAP_MAC));
}

#[tokio::test]
async fn cas_ready_events_reach_the_controller_handle() {
    let h = harness();

    h.vnet
        .link_events_sender()
        .send(LinkEvent::LocalCasReady {
            mac: PEER_B,
            cas: "1:udp:192.0.2.1:50000:2130706175:u:p:local:0:abcd".to_owned(),
        })
        .unwrap();

    wait_for(|| !h.controller.cas.lock().is_empty()).await;
    let (mac, cas) = h.controller.cas.lock()[0].clone();
    assert_eq!(mac, PEER_B);
    assert!(cas.contains("192.0.2.1"));
}
