// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fabric of well-behaved remote ports, standing in for adapter firmware.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, info, warn, Logger};
use tokio::sync::mpsc;

use fcdisc::exchange::{
    Command, ExchangeId, ExchangeStatus, IdListEntry, LoginStatus,
    NameListEntry, NsEntry, NsQuery, Payload, PortDatabase, PrliStatus,
};
use fcdisc::ops::{
    DmaBuf, DmaOps, FirmwareOps, FwError, LinkOps, ResetKind, SessionOps,
};
use fcdisc::port::{FwLoginState, PortInfo};
use fcdisc::{LocalPort, LoopId, PortId, Topology, Wwn};

use crate::config::{Config, SimPort};

/// Completion on its way back to the host.
pub struct Completion {
    pub id: ExchangeId,
    pub status: ExchangeStatus,
    pub payload: Payload,
}

struct State {
    /// Logins the simulated firmware holds, by remote WWPN.
    logged_in: BTreeMap<Wwn, LoopId>,
    failures_left: BTreeMap<Wwn, u32>,
}

pub struct SimFabric {
    log: Logger,
    topology: Topology,
    local: LocalPort,
    ports: Vec<SimPort>,
    online: AtomicBool,
    state: Mutex<State>,
    next_dma: AtomicU64,
    tx: mpsc::UnboundedSender<Completion>,
}

impl SimFabric {
    pub fn new(
        config: &Config,
        log: Logger,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = config.main.local();
        let topology = config.main.topology;
        let ports: Vec<SimPort> = config.ports.values().cloned().collect();

        let mut logged_in = BTreeMap::new();
        if topology.is_n2n() {
            // A peer with the larger name logs in to us on its own.
            let peers = ports.iter().filter(|p| p.wwpn > local.wwpn);
            for (n, p) in peers.enumerate() {
                logged_in.insert(p.wwpn, LoopId(n as u16));
            }
        }
        let failures_left =
            ports.iter().map(|p| (p.wwpn, p.login_failures)).collect();

        let fabric = Arc::new(Self {
            log,
            topology,
            local,
            ports,
            online: AtomicBool::new(config.main.link_up_delay_ms == 0),
            state: Mutex::new(State { logged_in, failures_left }),
            next_dma: AtomicU64::new(1),
            tx,
        });
        (fabric, rx)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn by_port_id(&self, port_id: PortId) -> Option<&SimPort> {
        self.ports.iter().find(|p| p.port_id == port_id)
    }

    fn by_wwn(&self, wwn: Wwn) -> Option<&SimPort> {
        self.ports.iter().find(|p| p.wwpn == wwn)
    }

    fn ns_entry(p: &SimPort) -> NsEntry {
        NsEntry {
            port_id: p.port_id,
            port_name: p.wwpn,
            node_name: p.wwnn,
            fc4_types: p.fc4_types(),
        }
    }

    fn send(&self, id: ExchangeId, status: ExchangeStatus, payload: Payload) {
        if self.tx.send(Completion { id, status, payload }).is_err() {
            warn!(self.log, "completion dropped, host is gone"; "xid" => %id);
        }
    }

    /// What the remote end would say to `cmd`.
    fn respond(&self, cmd: &Command) -> (ExchangeStatus, Payload) {
        use ExchangeStatus::{Failed, Success};

        let mut state = self.state.lock().unwrap();
        match *cmd {
            Command::NameServer { query: NsQuery::ByType(types), .. } => {
                if !self.topology.has_name_server() {
                    return (Failed, Payload::None);
                }
                let entries = self
                    .ports
                    .iter()
                    .filter(|p| p.fc4_types().intersects(types))
                    .map(Self::ns_entry)
                    .collect();
                (Success, Payload::NameServer(entries))
            }
            Command::NameServer { query: NsQuery::NextAfter(after), .. } => {
                let next = self
                    .ports
                    .iter()
                    .filter(|p| p.port_id > after)
                    .min_by_key(|p| p.port_id)
                    .map(Self::ns_entry)
                    .unwrap_or(NsEntry {
                        port_id: self.local.port_id,
                        port_name: self.local.wwpn,
                        node_name: self.local.wwnn,
                        fc4_types: Default::default(),
                    });
                (Success, Payload::NameServer(vec![next]))
            }
            Command::GetIdList { .. } => {
                let entries = self
                    .ports
                    .iter()
                    .map(|p| IdListEntry {
                        port_id: p.port_id,
                        port_name: p.wwpn,
                        node_name: p.wwnn,
                    })
                    .collect();
                (Success, Payload::IdList(entries))
            }
            Command::GetNameList { .. } => {
                let entries = state
                    .logged_in
                    .iter()
                    .filter_map(|(wwn, lid)| {
                        let p = self.by_wwn(*wwn)?;
                        Some(NameListEntry {
                            port_name: p.wwpn,
                            node_name: p.wwnn,
                            port_id: p.port_id,
                            loop_id: *lid,
                            login_state: FwLoginState::PrliComplete,
                            port_type: p.port_type,
                            fc4_types: p.fc4_types(),
                        })
                    })
                    .collect();
                (Success, Payload::NameList(entries))
            }
            Command::Login { loop_id, port_id, .. } => {
                let Some(p) = self.by_port_id(port_id) else {
                    return (Failed, Payload::None);
                };
                if let Some(left) = state.failures_left.get_mut(&p.wwpn) {
                    if *left > 0 {
                        *left -= 1;
                        return (
                            Success,
                            Payload::Login(LoginStatus::CommandError {
                                retried: true,
                            }),
                        );
                    }
                }
                let holder = state
                    .logged_in
                    .iter()
                    .find(|(wwn, lid)| **lid == loop_id && **wwn != p.wwpn)
                    .and_then(|(wwn, _)| self.by_wwn(*wwn));
                if let Some(holder) = holder {
                    let port_id = holder.port_id;
                    let status = LoginStatus::LoopIdUsed { port_id };
                    return (Success, Payload::Login(status));
                }
                if let Some(lid) = state.logged_in.get(&p.wwpn) {
                    if *lid != loop_id {
                        let loop_id = *lid;
                        let status = LoginStatus::PortIdUsed { loop_id };
                        return (Success, Payload::Login(status));
                    }
                }
                state.logged_in.insert(p.wwpn, loop_id);
                (Success, Payload::Login(LoginStatus::Complete))
            }
            Command::Prli { port_id, fc4, .. } => {
                match self.by_port_id(port_id) {
                    Some(p) if p.fc4_types().contains(fc4) => {
                        (Success, Payload::Prli(PrliStatus::Complete))
                    }
                    Some(_) => (Success, Payload::Prli(PrliStatus::Rejected)),
                    None => (Failed, Payload::None),
                }
            }
            Command::GetPortDatabase { loop_id, .. } => {
                let found = state
                    .logged_in
                    .iter()
                    .find(|(_, lid)| **lid == loop_id)
                    .and_then(|(wwn, _)| self.by_wwn(*wwn));
                match found {
                    Some(p) => (
                        Success,
                        Payload::PortDatabase(PortDatabase {
                            login_state: FwLoginState::PrliComplete,
                            node_name: p.wwnn,
                            port_id: p.port_id,
                            port_type: p.port_type,
                            fcp2: false,
                        }),
                    ),
                    None => (Failed, Payload::None),
                }
            }
            Command::Adisc { port_id, .. } => {
                let known = self
                    .by_port_id(port_id)
                    .is_some_and(|p| state.logged_in.contains_key(&p.wwpn));
                match known {
                    true => (Success, Payload::None),
                    false => (Failed, Payload::None),
                }
            }
            Command::Logout { loop_id, .. } => {
                state.logged_in.retain(|_, lid| *lid != loop_id);
                (Success, Payload::None)
            }
            Command::TaskMgmt { .. } => (Success, Payload::None),
        }
    }
}

impl FirmwareOps for SimFabric {
    fn issue(&self, id: ExchangeId, cmd: &Command) -> Result<(), FwError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(FwError::Failed("link down".to_string()));
        }
        let (status, payload) = self.respond(cmd);
        debug!(self.log, "exchange";
            "xid" => %id,
            "kind" => %cmd.kind(),
            "status" => ?status,
        );
        self.send(id, status, payload);
        Ok(())
    }

    fn abort(&self, id: ExchangeId, target: ExchangeId) -> Result<(), FwError> {
        // Everything here completes immediately, so there is never anything
        // left to abort.
        debug!(self.log, "abort"; "xid" => %id, "target" => %target);
        self.send(id, ExchangeStatus::Success, Payload::None);
        Ok(())
    }
}

impl LinkOps for SimFabric {
    fn current_topology(&self) -> Option<Topology> {
        Some(self.topology)
    }
    fn link_is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
    fn request_reset(&self, kind: ResetKind) {
        warn!(self.log, "reset requested"; "kind" => <&str>::from(kind));
    }
}

impl DmaOps for SimFabric {
    fn alloc(&self, size: usize) -> Option<DmaBuf> {
        let handle = self.next_dma.fetch_add(1, Ordering::Relaxed);
        Some(DmaBuf { handle, size })
    }
    fn free(&self, _buf: DmaBuf) {}
}

impl SessionOps for SimFabric {
    fn register_port_ready(&self, port: &PortInfo) {
        info!(self.log, "session ready";
            "wwpn" => %port.wwpn,
            "port_id" => %port.port_id,
            "loop_id" => %port.loop_id,
        );
    }
    fn unregister_port(&self, port: &PortInfo) {
        info!(self.log, "session gone"; "wwpn" => %port.wwpn);
    }
}
