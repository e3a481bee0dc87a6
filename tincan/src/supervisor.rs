//! Process-level state: the set of virtual networks, the controller reply
//! endpoint, and the controls parked until their link reports a CAS.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use eth_frame::MacAddr;
use parking_lot::Mutex;
use tincan_control::{Responder, TincanControl};
use tincan_overlay::{ControllerHandle, VirtualNetwork};

use crate::logging::LogController;

pub struct Supervisor {
    responder: Arc<Responder>,
    log: LogController,
    vnets: Mutex<Vec<VirtualNetwork>>,
    /// `CreateLinkListener` controls waiting for their link's CAS, oldest
    /// first.
    pending_controls: Mutex<Vec<TincanControl>>,
}

impl Supervisor {
    pub fn new(responder: Arc<Responder>, log: LogController) -> Arc<Self> {
        Arc::new(Self {
            responder,
            log,
            vnets: Mutex::new(Vec::new()),
            pending_controls: Mutex::new(Vec::new()),
        })
    }

    pub fn responder(&self) -> &Arc<Responder> {
        &self.responder
    }

    pub fn log(&self) -> &LogController {
        &self.log
    }

    pub fn add_vnet(&self, vnet: VirtualNetwork) {
        self.vnets.lock().push(vnet);
    }

    /// The list stays small; a linear scan beats maintaining an index.
    pub fn vnet(&self, interface_name: &str) -> Result<VirtualNetwork> {
        self.vnets
            .lock()
            .iter()
            .find(|vnet| vnet.name() == interface_name)
            .cloned()
            .ok_or_else(|| anyhow!("no virtual network exists by the name `{interface_name}`"))
    }

    pub fn has_vnet(&self, interface_name: &str) -> bool {
        self.vnet(interface_name).is_ok()
    }

    /// Parks a `CreateLinkListener` control until its CAS is ready.
    pub fn park_control(&self, control: TincanControl) {
        self.pending_controls.lock().push(control);
    }

    /// Drops any parked control for a link that is being removed; it will
    /// never be replied to.
    pub fn drop_parked_controls(&self) {
        let mut pending = self.pending_controls.lock();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Dropping parked controls");
            pending.clear();
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down");

        for vnet in self.vnets.lock().drain(..) {
            vnet.shutdown();
        }
    }
}

impl ControllerHandle for Supervisor {
    fn deliver_icc(&self, interface: &str, data: &[u8]) {
        let control = TincanControl::request(
            "ICC",
            serde_json::json!({
                "InterfaceName": interface,
                "Data": String::from_utf8_lossy(data),
            }),
        );

        self.responder.deliver(&control);
    }

    fn request_route_update(&self, interface: &str, frame: &[u8]) {
        let control = TincanControl::request(
            "UpdateRoutes",
            serde_json::json!({
                "InterfaceName": interface,
                "Data": hex::encode(frame),
            }),
        );

        self.responder.deliver(&control);
    }

    fn local_cas_ready(&self, interface: &str, mac: MacAddr, cas: &str) {
        tracing::debug!(%interface, %mac, "Local CAS ready");

        let parked = {
            let mut pending = self.pending_controls.lock();
            let position = pending
                .iter()
                .position(|control| control.command == "CreateLinkListener");

            position.map(|at| pending.remove(at))
        };

        let Some(mut control) = parked else {
            // CAS for a link nobody is waiting on (e.g. ConnectToPeer).
            return;
        };

        if cas.is_empty() {
            tracing::warn!(%mac, "No local candidates available on this vlink");
            control.set_response("No local candidates available on this vlink", true);
        } else {
            control.set_response(cas, true);
        }

        self.responder.deliver(&control);
    }
}
