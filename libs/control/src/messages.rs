//! Typed `Request` payloads for each recognised command. Field names match
//! the wire exactly; optional fields default so old controllers keep
//! working.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCtrlRespLinkRequest {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVnetRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "LocalUID")]
    pub uid: String,
    #[serde(rename = "LocalVirtIP4")]
    pub vip4: String,
    #[serde(rename = "LocalPrefix4")]
    pub prefix4: u8,
    #[serde(rename = "Mtu4", default = "default_mtu")]
    pub mtu4: u16,
    #[serde(rename = "L2TunnelEnabled", default = "default_true")]
    pub l2tunnel_enabled: bool,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "StunAddress", default)]
    pub stun_addr: String,
    #[serde(rename = "TurnAddress", default)]
    pub turn_addr: String,
    #[serde(rename = "TurnUser", default)]
    pub turn_user: String,
    #[serde(rename = "TurnPass", default)]
    pub turn_pass: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "VIP4", default)]
    pub vip4: String,
    #[serde(rename = "VIP6", default)]
    pub vip6: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "Fingerprint", default)]
    pub fingerprint: String,
    #[serde(rename = "CAS", default)]
    pub cas: String,
}

/// `ConnectToPeer` and `CreateLinkListener` share this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "EncryptionEnabled", default = "default_true")]
    pub encryption_enabled: bool,
    #[serde(rename = "PeerInfo")]
    pub peer: PeerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemovePeerRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "MAC")]
    pub mac: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMapRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    /// Entries of the form `dest_mac|path_mac`, 12 hex digits each.
    #[serde(rename = "Routes")]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IccRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "RecipientMac")]
    pub recipient_mac: String,
    #[serde(rename = "Data")]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InjectFrameRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    /// Hex-encoded Ethernet frame.
    #[serde(rename = "Data")]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryNodeInfoRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "MAC", default)]
    pub mac: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetLoggingLevelRequest {
    #[serde(rename = "LogLevel")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetIgnoredInterfacesRequest {
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,
    #[serde(rename = "IgnoredNetInterfaces")]
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EchoRequest {
    #[serde(rename = "Message", default)]
    pub message: String,
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1500
}
