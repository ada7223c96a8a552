// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion handlers for login exchanges.

use slog::{debug, info, warn};

use crate::dispatch::{Ctx, Notice, Work};
use crate::exchange::{
    ExchangeStatus, Finished, LoginStatus, Payload, PortDatabase, PrliStatus,
};
use crate::ops::ResetKind;
use crate::port::{DiscState, FwLoginState, Generations, Port, PortFlags};
use crate::registry::PortHandle;
use crate::types::{Fc4Types, LoopId};

/// How a completion relates to the port's current generations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Freshness {
    Current,
    /// The login identity changed since issue: ignore the completion.
    Stale,
    /// A state change notice arrived in flight: rediscover instead.
    Replay,
}

pub(crate) fn freshness(port: &Port, issued: Generations) -> Freshness {
    if issued.login != port.login_gen {
        Freshness::Stale
    } else if issued.rscn != port.rscn_gen {
        Freshness::Replay
    } else {
        Freshness::Current
    }
}

impl Ctx<'_> {
    /// Common gate for completions: returns true if the payload should be
    /// applied.
    fn accept(&mut self, h: PortHandle, f: &Finished, what: &str) -> bool {
        let log = self.log;
        let Some(port) = self.port(h) else { return false };
        if !port.disc_state.is_live() {
            debug!(log, "{what} completion for port being deleted";
                "wwpn" => %port.port_name);
            return false;
        }
        match freshness(port, f.gens) {
            Freshness::Current => true,
            Freshness::Stale => {
                debug!(log, "discarding stale {what} completion";
                    "wwpn" => %port.port_name,
                    "xid" => %f.id,
                    "issued_login_gen" => f.gens.login,
                    "login_gen" => port.login_gen,
                );
                false
            }
            Freshness::Replay => {
                self.rscn_replay(h);
                false
            }
        }
    }

    /// A state change notice named this port while an exchange was in
    /// flight.  Throw the result away and go through discovery again.
    pub(crate) fn rscn_replay(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.port(h) else { return };
        info!(log, "state change during exchange, rediscovering port";
            "wwpn" => %port.port_name,
            "port_id" => %port.port_id,
            "rscn_gen" => port.rscn_gen,
        );
        if port.flags.contains(PortFlags::SCAN_NEEDED) {
            self.core.disc.scan_needed = true;
            self.work.push(Work::Scan);
        }
        self.schedule_deletion(h);
    }

    pub(crate) fn plogi_done(
        &mut self,
        h: PortHandle,
        f: &Finished,
        payload: Payload,
    ) {
        if !self.accept(h, f, "PLOGI") {
            return;
        }
        let log = self.log;
        let status = match (f.status, payload) {
            (ExchangeStatus::Success, Payload::Login(s)) => s,
            (ExchangeStatus::Success, _) => {
                LoginStatus::CommandError { retried: false }
            }
            (status, _) => {
                info!(log, "PLOGI did not complete"; "status" => ?status);
                return self.login_failed(h);
            }
        };
        let Some(port) = self.core.ports.get_mut(h) else { return };
        debug!(log, "PLOGI done";
            "wwpn" => %port.port_name,
            "status" => ?status,
        );

        match status {
            LoginStatus::Complete => {
                self.shared.loop_ids.claim(port.loop_id);
                port.flags |= PortFlags::LOGOUT_ON_DELETE;
                if port.fc4_types.contains(Fc4Types::NVME) {
                    port.fw_login_state = FwLoginState::PlogiComplete;
                    self.post_prli(h);
                } else {
                    // FCP process login rides along with PLOGI.
                    port.fw_login_state = FwLoginState::PrliComplete;
                    self.post_gpdb(h);
                }
            }
            LoginStatus::CommandError { .. } => self.login_failed(h),
            LoginStatus::LoopIdUsed { port_id } => {
                // The firmware keeps that handle for whoever is at
                // `port_id`; find out what ours should be.
                info!(log, "loop ID already in use";
                    "wwpn" => %port.port_name,
                    "loop_id" => %port.loop_id,
                    "holder" => %port_id,
                );
                self.shared.loop_ids.claim(port.loop_id);
                port.loop_id = LoopId::NONE;
                self.post_gnl(h);
            }
            LoginStatus::PortIdUsed { loop_id } => {
                let other =
                    self.core.ports.find_live_by_loop_id(loop_id, Some(h));
                match other {
                    Some(other) => self.mark_conflict(h, other),
                    None => self.adopt_loop_id(h, loop_id),
                }
            }
        }
    }

    /// The firmware already has this port logged in under `loop_id`.  Move
    /// to that handle and log out of it so the next login starts clean.
    fn adopt_loop_id(&mut self, h: PortHandle, loop_id: LoopId) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        let old = port.loop_id;
        info!(log, "port already logged in under another loop ID";
            "wwpn" => %port.port_name,
            "ours" => %old,
            "firmware" => %loop_id,
        );
        port.loop_id = loop_id;
        port.flags |= PortFlags::LOGOUT_ON_DELETE;
        self.shared.loop_ids.claim(loop_id);
        if old != loop_id && !self.core.ports.loop_id_shared(old, h) {
            self.shared.loop_ids.release(old);
        }
        self.schedule_deletion(h);
    }

    fn login_failed(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.port_mut(h) else { return };
        port.set_disc_state(log, DiscState::LoginFailed);
        self.schedule_relogin(h);
    }

    pub(crate) fn prli_done(
        &mut self,
        h: PortHandle,
        f: &Finished,
        payload: Payload,
    ) {
        if !self.accept(h, f, "PRLI") {
            return;
        }
        let log = self.log;
        let n2n = self.is_n2n();
        let reset_limit = self.shared.cfg.prli_link_reset_limit;
        let status = match (f.status, payload) {
            (ExchangeStatus::Success, Payload::Prli(s)) => s,
            (ExchangeStatus::Success, _) => PrliStatus::Complete,
            _ => PrliStatus::Rejected,
        };
        let Some(port) = self.core.ports.get_mut(h) else { return };
        debug!(log, "PRLI done";
            "wwpn" => %port.port_name,
            "status" => ?status,
        );

        match status {
            PrliStatus::Complete => {
                port.fw_login_state = FwLoginState::PrliComplete;
                port.flags |= PortFlags::LOGOUT_ON_DELETE;
                self.post_gpdb(h);
            }
            PrliStatus::Busy => {
                // The peer is still working through our PLOGI.
                port.fw_login_state = FwLoginState::PlogiComplete;
                self.schedule_relogin(h);
            }
            PrliStatus::Rejected => {
                port.prli_failures = port.prli_failures.saturating_add(1);
                if !n2n {
                    self.schedule_deletion(h);
                } else if port.n2n.prli_link_resets < reset_limit {
                    port.n2n.prli_link_resets += 1;
                    port.fw_login_state = FwLoginState::Unknown;
                    port.set_disc_state(log, DiscState::Deleted);
                    warn!(log, "PRLI rejected, resetting link";
                        "wwpn" => %port.port_name,
                        "attempt" => port.n2n.prli_link_resets,
                    );
                    self.notices.push(Notice::Reset(ResetKind::Link));
                    self.schedule_relogin(h);
                } else {
                    warn!(log, "unable to reconnect to point-to-point peer";
                        "wwpn" => %port.port_name);
                    port.flags |= PortFlags::UNREACHABLE;
                    port.set_disc_state(log, DiscState::LoginFailed);
                }
            }
        }
    }

    pub(crate) fn gpdb_done(
        &mut self,
        h: PortHandle,
        f: &Finished,
        payload: Payload,
    ) {
        if !self.accept(h, f, "GPDB") {
            return;
        }
        let pd: PortDatabase = match (f.status, payload) {
            (ExchangeStatus::Success, Payload::PortDatabase(pd)) => pd,
            (status, _) => return self.gpdb_failed(h, status),
        };

        match pd.login_state {
            FwLoginState::PrliComplete => {
                if let Some(port) = self.port_mut(h) {
                    if !pd.node_name.is_none() {
                        port.node_name = pd.node_name;
                    }
                    port.port_type = pd.port_type;
                    port.flags.set(PortFlags::FCP2_DEVICE, pd.fcp2);
                    port.fw_login_state = FwLoginState::PrliComplete;
                }
                self.login_complete(h);
            }
            FwLoginState::PlogiPending
            | FwLoginState::PlogiComplete
            | FwLoginState::PrliPending => {
                if let Some(port) = self.port_mut(h) {
                    port.fw_login_state = pd.login_state;
                }
                self.post_gnl(h);
            }
            _ => self.schedule_deletion(h),
        }
    }

    /// Ask the firmware where the port stands and take it from there, as
    /// long as retries remain.
    fn gpdb_failed(&mut self, h: PortHandle, status: ExchangeStatus) {
        let log = self.log;
        let Some(port) = self.port_mut(h) else { return };
        info!(log, "GPDB failed";
            "wwpn" => %port.port_name,
            "status" => ?status,
            "retries" => port.login_retry,
        );
        if port.login_retry == 0 {
            return self.give_up(h);
        }
        port.login_retry -= 1;
        self.post_gnl(h);
    }

    pub(crate) fn adisc_done(&mut self, h: PortHandle, f: &Finished) {
        let log = self.log;
        if !self.accept(h, f, "ADISC") {
            return;
        }
        if f.status != ExchangeStatus::Success {
            if let Some(port) = self.port(h) {
                info!(log, "ADISC failed, deleting port";
                    "wwpn" => %port.port_name,
                    "status" => ?f.status,
                );
            }
            return self.schedule_deletion(h);
        }
        self.login_complete(h);
    }

    /// Port is logged in and verified.  Hand it to the session layer unless
    /// it is already there.
    pub(crate) fn login_complete(&mut self, h: PortHandle) {
        let log = self.log;
        let now = self.now;
        let retries = self.shared.cfg.login_retry_count;
        let Some(port) = self.core.ports.get_mut(h) else { return };

        port.login_gen += 1;
        port.login_retry = retries;
        port.prli_failures = 0;
        port.n2n = Default::default();
        port.last_validated = Some(now);
        port.flags.remove(PortFlags::DEFERRED | PortFlags::SCAN_NEEDED);
        port.flags |= PortFlags::LOGOUT_ON_DELETE;
        self.shared.loop_ids.claim(port.loop_id);
        port.set_disc_state(log, DiscState::LoginComplete);

        if !port.flags.contains(PortFlags::SESSION_REGISTERED) {
            port.flags |= PortFlags::SESSION_REGISTERED;
            info!(log, "port logged in";
                "wwpn" => %port.port_name,
                "port_id" => %port.port_id,
                "loop_id" => %port.loop_id,
                "port_type" => <&str>::from(port.port_type),
            );
            self.notices.push(Notice::Ready(port.info()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{PortId, Wwn};

    #[test]
    fn generation_rule_order() {
        let mut p = Port::new(Wwn(1), Wwn(2), PortId::from_raw(0x010100), 8);
        p.login_gen = 5;
        p.rscn_gen = 3;
        let cur = Generations { login: 5, rscn: 3 };
        assert_eq!(freshness(&p, cur), Freshness::Current);
        let replay = Generations { login: 5, rscn: 2 };
        assert_eq!(freshness(&p, replay), Freshness::Replay);
        // A login generation mismatch wins even if the rscn one also differs.
        let stale = Generations { login: 4, rscn: 2 };
        assert_eq!(freshness(&p, stale), Freshness::Stale);
    }
}
