// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-adapter discovery context and its public entry points.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use crate::config::{ConfigError, HostConfig};
use crate::discovery::DiscoveryState;
use crate::dispatch::{Ctx, EventDispatcher, Notice, Work};
use crate::exchange::{
    Command, ExchangeId, ExchangeStatus, ExchangeTracker, IssueError,
    NoneOutstanding, Payload, Request, TaskMgmtKind, Waiter,
};
use crate::login::{AlternatingPolicy, Fc4Policy};
use crate::loop_id::LoopIdAllocator;
use crate::ops::HostOps;
use crate::port::{DiscState, PortInfo};
use crate::registry::PortRegistry;
use crate::types::{PortId, Topology, Wwn};
use crate::util::id::define_id;

define_id! {
    /// Tells hosts in one process apart in logs.
    pub HostId, "hba"
}

/// Identity of the adapter port itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPort {
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    pub port_id: PortId,
}

/// Parts of the host which are immutable or internally synchronized.
pub(crate) struct Shared {
    pub cfg: HostConfig,
    pub ops: HostOps,
    pub loop_ids: LoopIdAllocator,
    pub exchanges: ExchangeTracker,
    pub policy: Box<dyn Fc4Policy>,
}

/// Discovery and login state, guarded by the host lock.
pub(crate) struct Core {
    pub ports: PortRegistry,
    pub disc: DiscoveryState,
    pub topology: Option<Topology>,
    pub online: bool,
    pub local: LocalPort,
}

#[derive(Debug, Error)]
pub enum TaskMgmtError {
    #[error("port {0} is not logged in")]
    NotLoggedIn(Wwn),
    #[error("could not issue task management: {0}")]
    Issue(#[from] IssueError),
    #[error("task management failed: {0:?}")]
    Failed(ExchangeStatus),
    #[error("no response to task management")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum AbortError {
    #[error("could not issue abort: {0}")]
    Issue(#[from] IssueError),
    #[error("abort failed: {0:?}")]
    Failed(ExchangeStatus),
    #[error("no response to abort")]
    TimedOut,
}

/// One adapter port and everything discovered through it.
pub struct FcHost {
    id: HostId,
    log: Logger,
    shared: Shared,
    core: Mutex<Core>,
    events: EventDispatcher,
}

impl FcHost {
    pub fn new(
        log: Logger,
        cfg: HostConfig,
        local: LocalPort,
        ops: HostOps,
    ) -> Result<Arc<Self>, ConfigError> {
        let policy = AlternatingPolicy::new(cfg.fc4_priority);
        Self::with_policy(log, cfg, local, ops, Box::new(policy))
    }

    pub fn with_policy(
        log: Logger,
        cfg: HostConfig,
        local: LocalPort,
        ops: HostOps,
        policy: Box<dyn Fc4Policy>,
    ) -> Result<Arc<Self>, ConfigError> {
        cfg.validate()?;
        let id = HostId::next();
        let log = log.new(o!(
            "host" => id.to_string(),
            "wwpn" => local.wwpn.to_string(),
        ));
        info!(log, "fc host created";
            "port_id" => %local.port_id,
            "handle_space" => ?cfg.handle_space,
        );
        let shared = Shared {
            loop_ids: LoopIdAllocator::new(cfg.handle_space),
            exchanges: ExchangeTracker::new(cfg.max_outstanding),
            cfg,
            ops,
            policy,
        };
        let core = Core {
            ports: PortRegistry::new(),
            disc: DiscoveryState::default(),
            topology: None,
            online: false,
            local,
        };
        Ok(Arc::new(Self {
            id,
            log,
            shared,
            core: Mutex::new(core),
            events: EventDispatcher::default(),
        }))
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.cfg
    }

    pub fn loop_ids(&self) -> &LoopIdAllocator {
        &self.shared.loop_ids
    }

    pub fn exchanges(&self) -> &ExchangeTracker {
        &self.shared.exchanges
    }

    /// The link came up, went down, or changed topology.
    pub fn notify_topology_changed(&self) {
        self.submit(Work::TopologyChanged);
    }

    /// A registered state change notification named `port_id`.
    pub fn notify_state_change(&self, port_id: PortId) {
        self.submit(Work::StateChange(port_id));
    }

    /// Firmware finished exchange `id`.  May be called from the firmware's
    /// own `issue` path.
    pub fn on_exchange_complete(
        &self,
        id: ExchangeId,
        status: ExchangeStatus,
        payload: Payload,
    ) {
        self.submit(Work::Completion { id, status, payload });
    }

    /// Expire exchanges, run deferred logins and rescans, and revalidate
    /// ports that are due.  Called periodically by
    /// [`FcHost::spawn_reconciler`] or by hand.
    pub fn reconcile(&self) {
        self.submit(Work::Reconcile);
    }

    fn submit(&self, work: Work) {
        self.events.push(work);
        self.run_pending();
    }

    /// Drain queued work if nobody else is.  Session and reset callbacks run
    /// after the drain, without the host lock.
    fn run_pending(&self) {
        let mut notices = Vec::new();
        while self.events.begin_drain() {
            while let Some(work) = self.events.next() {
                let mut core = self.core.lock().unwrap();
                let mut ctx = Ctx {
                    log: &self.log,
                    shared: &self.shared,
                    core: &mut *core,
                    work: &self.events,
                    notices: &mut notices,
                    now: self.shared.ops.clock.now(),
                };
                ctx.process(work);
            }
            self.flush(std::mem::take(&mut notices));
            if self.events.pending() == 0 {
                break;
            }
        }
    }

    fn flush(&self, notices: Vec<Notice>) {
        let ops = &self.shared.ops;
        for n in notices {
            match n {
                Notice::Ready(info) => ops.sessions.register_port_ready(&info),
                Notice::Gone(info) => ops.sessions.unregister_port(&info),
                Notice::Reset(kind) => {
                    warn!(self.log, "requesting adapter reset";
                        "kind" => <&str>::from(kind));
                    ops.link.request_reset(kind);
                }
            }
        }
    }

    /// Snapshot of every known remote port, ordered by WWPN.
    pub fn ports(&self) -> Vec<PortInfo> {
        let core = self.core.lock().unwrap();
        let mut out: Vec<PortInfo> =
            core.ports.iter().map(|(_, p)| p.info()).collect();
        out.sort_by_key(|p| p.wwpn);
        out
    }

    /// Current record for `wwpn`.
    pub fn port(&self, wwpn: Wwn) -> Option<PortInfo> {
        let core = self.core.lock().unwrap();
        let h = core.ports.find_by_wwn(wwpn)?;
        core.ports.get(h).map(|p| p.info())
    }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        f(&mut self.core.lock().unwrap())
    }

    pub fn topology(&self) -> Option<Topology> {
        self.core.lock().unwrap().topology
    }

    pub fn is_online(&self) -> bool {
        self.core.lock().unwrap().online
    }

    /// Send a task management function to a logged-in port and block until
    /// it finishes.  Must not be called from a session callback.
    pub fn task_management(
        &self,
        wwpn: Wwn,
        kind: TaskMgmtKind,
        lun: u64,
    ) -> Result<(), TaskMgmtError> {
        let timeout = self.shared.cfg.exchange_timeout();
        let waiter = Waiter::new();
        let (req, online) = {
            let core = self.core.lock().unwrap();
            let found = core.ports.find_by_wwn(wwpn).and_then(|h| {
                core.ports
                    .get(h)
                    .filter(|p| p.disc_state == DiscState::LoginComplete)
                    .map(|p| (h, p))
            });
            let Some((h, port)) = found else {
                return Err(TaskMgmtError::NotLoggedIn(wwpn));
            };
            let req = Request {
                cmd: Command::TaskMgmt {
                    loop_id: port.loop_id,
                    port_id: port.port_id,
                    kind,
                    lun,
                },
                target: Some((h, port.gens())),
                timeout,
                waiter: Some(waiter.clone()),
            };
            let online = core.online && self.shared.ops.link.link_is_online();
            (req, online)
        };

        let now = self.shared.ops.clock.now();
        let fw = &*self.shared.ops.fw;
        let id = self.shared.exchanges.issue(fw, online, req, now)?;
        info!(self.log, "task management issued";
            "target" => %wwpn,
            "kind" => ?kind,
            "lun" => lun,
            "xid" => %id,
        );
        match waiter.wait(timeout * 2) {
            Some(ExchangeStatus::Success) => Ok(()),
            Some(status) => Err(TaskMgmtError::Failed(status)),
            None => Err(TaskMgmtError::TimedOut),
        }
    }

    /// Abort outstanding exchange `id`.  With `wait`, block until the abort
    /// itself finishes.
    pub fn abort_exchange(
        &self,
        id: ExchangeId,
        wait: bool,
    ) -> Result<(), AbortError> {
        let timeout = self.shared.cfg.exchange_timeout();
        let waiter = wait.then(Waiter::new);
        let now = self.shared.ops.clock.now();
        let fw = &*self.shared.ops.fw;
        let abort =
            self.shared.exchanges.abort(fw, id, now, waiter.clone())?;
        info!(self.log, "abort issued"; "xid" => %id, "abort" => %abort);
        let Some(waiter) = waiter else {
            return Ok(());
        };
        match waiter.wait(timeout * 2) {
            Some(ExchangeStatus::Success) => Ok(()),
            Some(status) => Err(AbortError::Failed(status)),
            None => Err(AbortError::TimedOut),
        }
    }

    /// Resolves once no exchanges are outstanding.
    pub fn quiesce(&self) -> NoneOutstanding {
        self.shared.exchanges.none_outstanding()
    }

    /// Run [`FcHost::reconcile`] on the configured interval for as long as
    /// the host is alive.
    pub fn spawn_reconciler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let host = Arc::downgrade(self);
        let period: Duration = self.shared.cfg.reconcile_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(host) = host.upgrade() else {
                    break;
                };
                host.reconcile();
            }
        })
    }
}
