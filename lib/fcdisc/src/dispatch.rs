// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing of completions and events into the discovery and login machines.
//!
//! Everything that can change port state arrives here as a [`Work`] item.
//! Items are queued and drained by one thread at a time, so a handler never
//! runs while another is in progress: follow-up work a handler generates is
//! queued rather than executed in place.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use slog::{debug, warn, Logger};

use crate::exchange::{
    Command, ExchangeId, ExchangeKind, ExchangeStatus, Finished, IssueError,
    Payload, Request,
};
use crate::host::{Core, Shared};
use crate::ops::{DmaBuf, ResetKind};
use crate::port::{Port, PortFlags, PortInfo};
use crate::registry::PortHandle;
use crate::types::{PortId, Topology};

pub(crate) enum Work {
    Completion { id: ExchangeId, status: ExchangeStatus, payload: Payload },
    TopologyChanged,
    StateChange(PortId),
    Scan,
    Relogin(PortHandle),
    Reconcile,
}

/// Side effects which must run outside the host lock.
#[derive(Debug)]
pub(crate) enum Notice {
    Ready(PortInfo),
    Gone(PortInfo),
    Reset(ResetKind),
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Work>,
    draining: bool,
}

#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<QueueInner>,
}

impl EventDispatcher {
    pub(crate) fn push(&self, work: Work) {
        self.inner.lock().unwrap().items.push_back(work);
    }

    /// Claim the queue for draining.  Fails if another caller holds it,
    /// in which case that caller will pick up anything just pushed.
    pub(crate) fn begin_drain(&self) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.draining {
            return false;
        }
        guard.draining = true;
        true
    }

    /// Next queued item.  Releases the drain claim once the queue is empty.
    pub(crate) fn next(&self) -> Option<Work> {
        let mut guard = self.inner.lock().unwrap();
        let item = guard.items.pop_front();
        if item.is_none() {
            guard.draining = false;
        }
        item
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

/// State handed to every handler for the duration of one work item.
pub(crate) struct Ctx<'a> {
    pub log: &'a Logger,
    pub shared: &'a Shared,
    pub core: &'a mut Core,
    pub work: &'a EventDispatcher,
    pub notices: &'a mut Vec<Notice>,
    pub now: Instant,
}

impl Ctx<'_> {
    pub(crate) fn process(&mut self, work: Work) {
        match work {
            Work::Completion { id, status, payload } => {
                let shared = self.shared;
                let finished = shared.exchanges.complete(id, status, self.now);
                if finished.is_empty() {
                    debug!(self.log, "completion for exchange not outstanding";
                        "xid" => %id);
                    return;
                }
                let mut payload = Some(payload);
                for f in finished {
                    let p = match f.id == id {
                        true => payload.take().unwrap_or_default(),
                        false => Payload::None,
                    };
                    self.route(f, p);
                }
            }
            Work::TopologyChanged => self.topology_changed(),
            Work::StateChange(port_id) => self.state_change_notice(port_id),
            Work::Scan => self.scan(),
            Work::Relogin(h) => self.relogin_event(h),
            Work::Reconcile => self.reconcile(),
        }
    }

    /// Deliver a finished exchange to whoever is waiting on it.
    pub(crate) fn route(&mut self, f: Finished, payload: Payload) {
        if let Some(waiter) = f.waiter.as_ref() {
            waiter.signal(f.status);
        }
        if f.deliver {
            match f.kind {
                ExchangeKind::GetNameList => {
                    self.gnl_done(f.id, f.status, payload)
                }
                ExchangeKind::GetIdList => {
                    self.loop_scan_done(f.id, f.status, payload)
                }
                ExchangeKind::NameServer => {
                    self.fabric_scan_done(f.id, f.status, payload)
                }
                ExchangeKind::Abort | ExchangeKind::TaskMgmt => {}
                kind => self.route_to_port(&f, kind, payload),
            }
        }
        if let Some(buf) = f.dma {
            self.shared.ops.dma.free(buf);
        }
    }

    fn route_to_port(
        &mut self,
        f: &Finished,
        kind: ExchangeKind,
        payload: Payload,
    ) {
        let Some(h) = f.target else {
            return;
        };
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else {
            debug!(log, "dropping completion for destroyed port";
                "xid" => %f.id, "kind" => %kind);
            return;
        };
        if port.owner != Some(f.id) {
            warn!(log, "completion does not match port's exchange";
                "xid" => %f.id,
                "kind" => %kind,
                "wwpn" => %port.port_name,
            );
            return;
        }
        port.release_exchange();

        match kind {
            ExchangeKind::Login => self.plogi_done(h, f, payload),
            ExchangeKind::Prli => self.prli_done(h, f, payload),
            ExchangeKind::GetPortDatabase => self.gpdb_done(h, f, payload),
            ExchangeKind::Adisc => self.adisc_done(h, f),
            ExchangeKind::Logout => self.logout_done(h),
            _ => {}
        }
        self.resume_deferred(h);
    }

    /// Periodic pass: expire exchanges, run deferred relogins, rescan if
    /// needed, and revalidate logins that are due.
    pub(crate) fn reconcile(&mut self) {
        let shared = self.shared;
        for f in shared.exchanges.expire(&*shared.ops.fw, self.now) {
            match (f.deliver, f.kind) {
                (true, kind) => {
                    warn!(self.log, "exchange timed out";
                        "xid" => %f.id, "kind" => %kind);
                }
                (false, ExchangeKind::Abort) => {
                    warn!(self.log, "abort timed out, reclaiming exchanges";
                        "xid" => %f.id);
                }
                (false, _) => {}
            }
            self.route(f, Payload::None);
        }

        if std::mem::take(&mut self.core.disc.relogin_needed) {
            for h in self.core.ports.handles() {
                let due = self.port(h).is_some_and(|p| {
                    p.flags.contains(PortFlags::RELOGIN_NEEDED)
                });
                if due {
                    self.relogin_event(h);
                }
            }
        }

        self.retry_deferred();
        if self.core.disc.scan_needed {
            self.scan();
        }
        self.revalidate_due();
        self.reap_lost();
    }

    pub(crate) fn port(&self, h: PortHandle) -> Option<&Port> {
        self.core.ports.get(h)
    }

    pub(crate) fn port_mut(&mut self, h: PortHandle) -> Option<&mut Port> {
        self.core.ports.get_mut(h)
    }

    pub(crate) fn topology(&self) -> Option<Topology> {
        self.core.topology
    }

    pub(crate) fn is_n2n(&self) -> bool {
        self.core.topology.is_some_and(Topology::is_n2n)
    }

    pub(crate) fn online(&self) -> bool {
        self.core.online && self.shared.ops.link.link_is_online()
    }

    /// Queue an immediate relogin pass for `h`.
    pub(crate) fn kick(&self, h: PortHandle) {
        self.work.push(Work::Relogin(h));
    }

    /// Ask for a relogin pass on the next reconcile.
    pub(crate) fn schedule_relogin(&mut self, h: PortHandle) {
        if let Some(port) = self.core.ports.get_mut(h) {
            port.flags |= PortFlags::RELOGIN_NEEDED;
            self.core.disc.relogin_needed = true;
        }
    }

    pub(crate) fn alloc_dma(
        &self,
        kind: ExchangeKind,
    ) -> Result<DmaBuf, IssueError> {
        let size = kind.reply_size().unwrap_or(0);
        self.shared.ops.dma.alloc(size).ok_or(IssueError::NoDmaBuffer(kind))
    }

    /// Issue an exchange on behalf of port `h`, which then owns it until it
    /// completes.
    pub(crate) fn issue_port(
        &mut self,
        h: PortHandle,
        cmd: Command,
    ) -> Result<ExchangeId, IssueError> {
        let dma = cmd.dma();
        let online = self.online();
        let res = match self.core.ports.get(h) {
            None => Err(IssueError::PortGone),
            Some(port) => match port.owner.filter(|_| port.is_busy()) {
                Some(owner) => Err(IssueError::AlreadyInFlight(owner)),
                None => self.shared.exchanges.issue(
                    &*self.shared.ops.fw,
                    online,
                    Request {
                        cmd,
                        target: Some((h, port.gens())),
                        timeout: self.shared.cfg.exchange_timeout(),
                        waiter: None,
                    },
                    self.now,
                ),
            },
        };
        match res {
            Ok(id) => {
                if let Some(port) = self.core.ports.get_mut(h) {
                    port.take_exchange(id);
                }
                Ok(id)
            }
            Err(e) => {
                if let Some(buf) = dma {
                    self.shared.ops.dma.free(buf);
                }
                Err(e)
            }
        }
    }

    /// Issue an exchange not tied to any port (scans).
    pub(crate) fn issue_unbound(
        &mut self,
        cmd: Command,
    ) -> Result<ExchangeId, IssueError> {
        let dma = cmd.dma();
        let online = self.online();
        let res = self.shared.exchanges.issue(
            &*self.shared.ops.fw,
            online,
            Request {
                cmd,
                target: None,
                timeout: self.shared.cfg.exchange_timeout(),
                waiter: None,
            },
            self.now,
        );
        if let (Err(_), Some(buf)) = (&res, dma) {
            self.shared.ops.dma.free(buf);
        }
        res
    }

    /// Common handling when a port's exchange could not be issued.
    pub(crate) fn issue_failed(
        &mut self,
        h: PortHandle,
        what: &str,
        e: IssueError,
    ) {
        let log = self.log;
        if let Some(port) = self.port(h) {
            debug!(log, "could not issue {what}: {e}";
                "wwpn" => %port.port_name,
                "port_id" => %port.port_id,
            );
        }
        match e {
            // Discovery starts over when the link returns.
            IssueError::NotOnline | IssueError::PortGone => {}
            _ => self.schedule_relogin(h),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_drainer() {
        let d = EventDispatcher::default();
        d.push(Work::Scan);
        assert!(d.begin_drain());
        assert!(!d.begin_drain());
        d.push(Work::Reconcile);
        assert_eq!(d.pending(), 2);
        assert!(matches!(d.next(), Some(Work::Scan)));
        assert!(matches!(d.next(), Some(Work::Reconcile)));
        assert!(d.next().is_none());
        // The claim is released with the last item.
        assert!(d.begin_drain());
        assert!(d.next().is_none());
    }
}
