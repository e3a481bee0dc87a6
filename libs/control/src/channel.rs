//! The localhost control endpoint.
//!
//! A reader task parses inbound datagrams into [`TincanControl`]s; outbound
//! traffic goes through the [`Responder`], which stays a logging sink until
//! the controller registers its reply endpoint. One `send_to` per document,
//! no queueing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::{MAX_CONTROL_DATAGRAM, TincanControl};

pub struct ControlChannel {
    responder: Arc<Responder>,
}

impl ControlChannel {
    /// Binds the control socket (IPv6 loopback preferred, IPv4 fallback) and
    /// starts the reader task. Inbound controls arrive on the returned
    /// receiver.
    pub async fn bind(port: u16) -> Result<(Self, mpsc::Receiver<TincanControl>)> {
        let socket = match UdpSocket::bind((IpAddr::from(Ipv6Addr::LOCALHOST), port)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::info!("IPv6 loopback unavailable ({e}); falling back to IPv4");
                UdpSocket::bind((IpAddr::from(Ipv4Addr::LOCALHOST), port))
                    .await
                    .with_context(|| format!("Failed to bind the control socket on port {port}"))?
            }
        };

        tracing::info!(addr = %socket.local_addr()?, "Control channel listening");

        let socket = Arc::new(socket);
        let responder = Arc::new(Responder {
            socket: socket.clone(),
            controller: Mutex::new(None),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        tokio::spawn(read_loop(socket, responder.clone(), inbound_tx));

        Ok((Self { responder }, inbound_rx))
    }

    pub fn responder(&self) -> Arc<Responder> {
        self.responder.clone()
    }
}

/// Sends documents to wherever the controller registered; before that, a
/// sink that only logs.
pub struct Responder {
    socket: Arc<UdpSocket>,
    controller: Mutex<Option<SocketAddr>>,
}

impl Responder {
    /// Registers the controller's reply endpoint (`CreateCtrlRespLink`).
    pub fn register(&self, addr: SocketAddr) {
        tracing::info!(%addr, "Controller reply endpoint registered");
        *self.controller.lock() = Some(addr);
    }

    pub fn is_registered(&self) -> bool {
        self.controller.lock().is_some()
    }

    /// One UDP datagram, no queueing. Failures are logged, never retried.
    pub fn deliver(&self, control: &TincanControl) {
        let Some(addr) = *self.controller.lock() else {
            tracing::warn!(command = %control.command, "No controller connected; dropping outbound control");
            return;
        };

        let document = control.to_json();
        if let Err(e) = self.socket.try_send_to(document.as_bytes(), addr) {
            tracing::warn!(%addr, "Failed to send control datagram: {e}");
        }
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    responder: Arc<Responder>,
    inbound_tx: mpsc::Sender<TincanControl>,
) {
    let mut buf = vec![0u8; MAX_CONTROL_DATAGRAM];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("Control socket receive failed: {e}");
                continue;
            }
        };

        match TincanControl::parse(&buf[..len]) {
            Ok(control) => {
                tracing::debug!(command = %control.command, txid = control.transaction_id, "Received control");
                if inbound_tx.send(control).await.is_err() {
                    // Dispatch is gone; the process is shutting down.
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(%from, "Discarding malformed control: {e}");
                // Correlate as best we can so the controller sees the error.
                if let Ok(value) =
                    serde_json::from_slice::<serde_json::Value>(&buf[..len])
                {
                    let mut reply = TincanControl::request(
                        value
                            .get("Command")
                            .and_then(|c| c.as_str())
                            .unwrap_or("Unknown"),
                        serde_json::Value::Null,
                    );
                    reply.transaction_id = value
                        .get("TransactionId")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0);
                    reply.set_response(format!("Malformed control: {e}"), false);
                    responder.deliver(&reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_any() -> (ControlChannel, mpsc::Receiver<TincanControl>, SocketAddr) {
        // Port 0 keeps the tests independent of the default port.
        let (channel, inbound) = ControlChannel::bind(0).await.unwrap();
        let addr = channel.responder.socket.local_addr().unwrap();
        (channel, inbound, addr)
    }

    #[tokio::test]
    async fn parses_inbound_controls() {
        let (_channel, mut inbound, addr) = bind_any().await;

        let client = UdpSocket::bind((addr.ip(), 0)).await.unwrap();
        let request = r#"{
            "ProtocolVersion": 4,
            "TransactionId": 5,
            "ControlType": "TincanRequest",
            "Command": "Echo",
            "Request": { "Message": "hello" }
        }"#;
        client.send_to(request.as_bytes(), addr).await.unwrap();

        let control = inbound.recv().await.unwrap();
        assert_eq!(control.command, "Echo");
        assert_eq!(control.transaction_id, 5);
    }

    #[tokio::test]
    async fn responds_to_malformed_controls_when_registered() {
        let (channel, _inbound, addr) = bind_any().await;

        let client = UdpSocket::bind((addr.ip(), 0)).await.unwrap();
        channel.responder().register(client.local_addr().unwrap());

        // Valid JSON, wrong protocol version.
        let request = r#"{
            "ProtocolVersion": 2,
            "TransactionId": 9,
            "ControlType": "TincanRequest",
            "Command": "Echo"
        }"#;
        client.send_to(request.as_bytes(), addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let reply = TincanControl::parse(&buf[..len]).unwrap();

        assert_eq!(reply.transaction_id, 9);
        assert!(!reply.response.unwrap().success);
    }

    #[tokio::test]
    async fn unregistered_responder_only_logs() {
        let (channel, _inbound, _addr) = bind_any().await;

        let control = TincanControl::request("ICC", serde_json::json!({"Data": "x"}));
        // Must not panic or block.
        channel.responder().deliver(&control);
        assert!(!channel.responder().is_registered());
    }
}
