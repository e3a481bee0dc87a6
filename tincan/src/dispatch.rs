//! Maps control commands onto supervisor and virtual-network operations and
//! serialises the responses.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use eth_frame::MacAddr;
use tincan_control::{
    ControlType, CreateCtrlRespLinkRequest, CreateVnetRequest, EchoRequest, IccRequest,
    InjectFrameRequest, LinkRequest, QueryNodeInfoRequest, RemovePeerRequest,
    SetIgnoredInterfacesRequest, SetLoggingLevelRequest, TincanControl, UpdateMapRequest,
};
use tincan_overlay::{VirtualNetwork, VnetDescriptor};
use vlink::PeerDescriptor;

use crate::supervisor::Supervisor;

/// What a handler wants sent back.
enum Reply {
    /// A `Success=true` response with this message.
    Message(String),
    /// No response now; either the command acks only on failure or the
    /// response is delivered later (pending CAS).
    Deferred,
}

pub async fn dispatch(supervisor: &Arc<Supervisor>, mut control: TincanControl) {
    if control.control_type != ControlType::Request {
        // Responses to our own requests; nothing correlates them today.
        tracing::debug!(command = %control.command, "Ignoring a controller response");
        return;
    }

    let command = control.command.clone();
    let result = match command.as_str() {
        "CreateCtrlRespLink" => create_ctrl_resp_link(supervisor, &control),
        "CreateVnet" => create_vnet(supervisor, &control),
        "CreateLinkListener" => create_link_listener(supervisor, &control).await,
        "ConnectToPeer" => connect_to_peer(supervisor, &control).await,
        "RemovePeer" => remove_peer(supervisor, &control),
        "UpdateMap" => update_map(supervisor, &control),
        "ICC" => send_icc(supervisor, &control),
        "InjectFrame" => inject_frame(supervisor, &control),
        "QueryNodeInfo" => query_node_info(supervisor, &control).await,
        "SetLoggingLevel" => set_logging_level(supervisor, &control),
        "SetIgnoredNetInterfaces" => set_ignored_interfaces(supervisor, &control),
        "Echo" => echo(&control),
        other => Err(anyhow::anyhow!("`{other}` is not a recognised command")),
    };

    match result {
        Ok(Reply::Message(message)) => {
            control.set_response(message, true);
            supervisor.responder().deliver(&control);
        }
        Ok(Reply::Deferred) => {}
        Err(e) => {
            tracing::warn!(%command, "Control failed: {e:#}");
            control.set_response(format!("The {command} operation failed. {e:#}"), false);
            supervisor.responder().deliver(&control);
        }
    }
}

fn create_ctrl_resp_link(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: CreateCtrlRespLinkRequest = control.request_payload()?;
    let ip: IpAddr = request
        .ip
        .parse()
        .with_context(|| format!("`{}` is not an IP address", request.ip))?;

    supervisor
        .responder()
        .register(SocketAddr::new(ip, request.port));

    Ok(Reply::Message(
        "Controller endpoint successfully created.".to_owned(),
    ))
}

fn create_vnet(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: CreateVnetRequest = control.request_payload()?;

    if supervisor.has_vnet(&request.interface_name) {
        bail!("interface `{}` already exists", request.interface_name);
    }

    let descriptor = VnetDescriptor {
        name: request.interface_name,
        uid: request.uid,
        description: request.description,
        vip4: request.vip4,
        prefix4: request.prefix4,
        mtu4: request.mtu4,
        l2tunnel_enabled: request.l2tunnel_enabled,
        stun_addr: request.stun_addr,
        turn_addr: request.turn_addr,
        turn_user: request.turn_user,
        turn_pass: request.turn_pass,
    };

    let vnet = VirtualNetwork::create(descriptor, supervisor.clone())?;
    supervisor.add_vnet(vnet);

    Ok(Reply::Message(
        "The CreateVnet operation succeeded.".to_owned(),
    ))
}

async fn create_link_listener(
    supervisor: &Arc<Supervisor>,
    control: &TincanControl,
) -> Result<Reply> {
    let request: LinkRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;
    let peer = peer_descriptor(&request)?;

    let link = vnet
        .create_link_endpoint(peer, request.encryption_enabled)
        .await?;

    // A link created earlier may already have its candidate set; reply
    // immediately. Otherwise the control waits for `local_cas_ready`.
    match link.local_cas() {
        Some(cas) => Ok(Reply::Message(cas)),
        None => {
            supervisor.park_control(control.clone());

            // The CAS may have landed between the create and the park, in
            // which case its event found nothing to answer.
            if let Some(cas) = link.local_cas() {
                use tincan_overlay::ControllerHandle as _;
                supervisor.local_cas_ready(&request.interface_name, link.mac(), &cas);
            }

            Ok(Reply::Deferred)
        }
    }
}

async fn connect_to_peer(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: LinkRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;
    let peer = peer_descriptor(&request)?;

    vnet.connect_to_peer(peer, request.encryption_enabled)
        .await?;

    Ok(Reply::Message("Connection to peer node in progress.".to_owned()))
}

fn remove_peer(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: RemovePeerRequest = control.request_payload()?;
    if request.interface_name.is_empty() || request.mac.is_empty() {
        bail!(
            "invalid parameters in request to remove link. Received: TAP Name={} MAC={}",
            request.interface_name,
            request.mac
        );
    }

    let vnet = supervisor.vnet(&request.interface_name)?;
    let mac = MacAddr::from_str(&request.mac)?;

    // A pending listener control for a link that never produced its CAS is
    // cancelled, never replied to.
    if vnet
        .peer_network()
        .get_vlink(mac)
        .is_some_and(|link| link.local_cas().is_none())
    {
        supervisor.drop_parked_controls();
    }

    vnet.remove_peer(mac)?;

    Ok(Reply::Message(format!(
        "The virtual link to {} has been removed.",
        request.mac
    )))
}

fn update_map(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: UpdateMapRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;

    for route in &request.routes {
        if let Err(e) = apply_route(&vnet, route) {
            // One bad entry does not abort the batch.
            tracing::warn!(%route, "Route update rejected: {e:#}");
        }
    }

    Ok(Reply::Message(
        "The UpdateMap operation completed.".to_owned(),
    ))
}

fn apply_route(vnet: &VirtualNetwork, route: &str) -> Result<()> {
    let (dest, via) = route
        .split_once('|')
        .context("route entries take the form `dest_mac|path_mac`")?;

    vnet.update_route(MacAddr::from_str(dest)?, MacAddr::from_str(via)?)
}

fn send_icc(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: IccRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;

    vnet.send_icc(MacAddr::from_str(&request.recipient_mac)?, &request.data)?;

    // Acknowledged only on failure; the controller treats silence as sent.
    Ok(Reply::Deferred)
}

fn inject_frame(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: InjectFrameRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;

    vnet.inject_frame(&request.data)?;

    Ok(Reply::Deferred)
}

async fn query_node_info(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: QueryNodeInfoRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;

    let mac = if request.mac.is_empty() {
        None
    } else {
        Some(MacAddr::from_str(&request.mac)?)
    };

    let info = vnet.query_node_info(mac).await;
    let message = serde_json::to_string(&info).context("Failed to serialise node info")?;

    Ok(Reply::Message(message))
}

fn set_logging_level(supervisor: &Arc<Supervisor>, control: &TincanControl) -> Result<Reply> {
    let request: SetLoggingLevelRequest = control.request_payload()?;

    supervisor.log().set_level(&request.level)?;

    Ok(Reply::Message(format!(
        "The log level has been set to {}.",
        request.level
    )))
}

fn set_ignored_interfaces(
    supervisor: &Arc<Supervisor>,
    control: &TincanControl,
) -> Result<Reply> {
    let request: SetIgnoredInterfacesRequest = control.request_payload()?;
    let vnet = supervisor.vnet(&request.interface_name)?;

    vnet.set_ignored_interfaces(request.ignored);

    Ok(Reply::Message(
        "The SetIgnoredNetInterfaces operation succeeded.".to_owned(),
    ))
}

fn echo(control: &TincanControl) -> Result<Reply> {
    let request: EchoRequest = control.request_payload()?;

    Ok(Reply::Message(request.message))
}

fn peer_descriptor(request: &LinkRequest) -> Result<PeerDescriptor> {
    Ok(PeerDescriptor {
        uid: request.peer.uid.clone(),
        vip4: request.peer.vip4.clone(),
        vip6: request.peer.vip6.clone(),
        mac: MacAddr::from_str(&request.peer.mac)?,
        fingerprint: request.peer.fingerprint.clone(),
        cas: request.peer.cas.clone(),
    })
}
