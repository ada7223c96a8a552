// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-port login state machine.
//!
//! A relogin pass for a port selects one handler from a table indexed by
//! topology class and [`DiscState`].  Completion handlers (see `events`)
//! advance the state and queue the next pass.

use slog::{debug, info, warn};
use strum::EnumCount;

use crate::dispatch::{Ctx, Notice};
use crate::exchange::{Command, ExchangeKind};
use crate::port::{DiscState, FwLoginState, PortFlags, ScanState};
use crate::registry::PortHandle;
use crate::types::Topology;

pub(crate) mod events;
pub mod policy;

pub use policy::{AlternatingPolicy, Fc4Policy};

type Handler = fn(&mut Ctx<'_>, PortHandle);

/// Loop and fabric topologies.
const SWITCHED: [Handler; DiscState::COUNT] = [
    from_deleted,    // Deleted
    teardown,        // DeletePending
    check_login,     // GetNameList
    pending_login,   // LoginPending
    failed_switched, // LoginFailed
    wait,            // GetPortDatabase
    stable,          // LoginComplete
    update_port,     // UpdatePort
    wait,            // Adisc
];

const POINT_TO_POINT: [Handler; DiscState::COUNT] = [
    from_deleted_n2n, // Deleted
    teardown,         // DeletePending
    name_list_n2n,    // GetNameList
    pending_login,    // LoginPending
    check_login,      // LoginFailed
    wait,             // GetPortDatabase
    stable,           // LoginComplete
    update_port,      // UpdatePort
    wait,             // Adisc
];

fn handler(topology: Topology, state: DiscState) -> Handler {
    let table = match topology.is_n2n() {
        true => &POINT_TO_POINT,
        false => &SWITCHED,
    };
    table[state as usize]
}

fn from_deleted(ctx: &mut Ctx<'_>, h: PortHandle) {
    let Some(port) = ctx.port(h) else { return };
    if port.loop_id.is_none() {
        ctx.post_gnl(h);
    } else {
        check_login(ctx, h);
    }
}

fn from_deleted_n2n(ctx: &mut Ctx<'_>, h: PortHandle) {
    let local = ctx.core.local.wwpn;
    let Some(port) = ctx.port(h) else { return };
    if local > port.port_name {
        check_login(ctx, h);
    } else {
        // The peer is expected to log in to us.
        ctx.post_gnl(h);
    }
}

fn name_list_n2n(ctx: &mut Ctx<'_>, h: PortHandle) {
    let Some(port) = ctx.port(h) else { return };
    match port.fw_login_state {
        FwLoginState::PrliComplete => ctx.post_gpdb(h),
        _ => check_login(ctx, h),
    }
}

/// Decide whether to log in now and, if so, make sure the port has a loop
/// ID and send the PLOGI.
fn check_login(ctx: &mut Ctx<'_>, h: PortHandle) {
    let log = ctx.log;
    let n2n = ctx.is_n2n();
    let local = ctx.core.local.wwpn;
    let now = ctx.now;
    let unassigned = ctx.port(h).is_some_and(|p| p.loop_id.is_none());
    if unassigned && ctx.yield_address(h) {
        if let Some(port) = ctx.port_mut(h) {
            port.set_disc_state(log, DiscState::Deleted);
        }
        return;
    }
    let Some(port) = ctx.core.ports.get_mut(h) else { return };

    let proceed = !n2n
        || local > port.port_name
        || (port.fw_login_state == FwLoginState::PlogiComplete
            && port.n2n.plogi_ack_deadline.is_some_and(|d| now >= d));
    if !proceed {
        // Keep checking whether the peer has logged in to us.
        port.set_disc_state(log, DiscState::Deleted);
        ctx.schedule_relogin(h);
        return;
    }

    if port.login_retry == 0 {
        ctx.give_up(h);
        return;
    }
    port.login_retry -= 1;

    if port.loop_id.is_none() {
        match ctx.shared.loop_ids.allocate() {
            Ok(lid) => {
                port.loop_id = lid;
                port.fw_login_state = FwLoginState::PortUnavailable;
                debug!(log, "allocated loop ID";
                    "wwpn" => %port.port_name,
                    "loop_id" => %lid,
                );
            }
            Err(_) => {
                ctx.defer_for_handles(h);
                return;
            }
        }
    }
    ctx.post_login(h);
}

fn pending_login(ctx: &mut Ctx<'_>, h: PortHandle) {
    let Some(port) = ctx.port(h) else { return };
    match port.fw_login_state {
        FwLoginState::PlogiComplete => ctx.post_prli(h),
        FwLoginState::PrliComplete => ctx.post_gpdb(h),
        _ => check_login(ctx, h),
    }
}

fn failed_switched(ctx: &mut Ctx<'_>, h: PortHandle) {
    ctx.schedule_deletion(h);
}

fn stable(ctx: &mut Ctx<'_>, h: PortHandle) {
    let Some(port) = ctx.core.ports.get_mut(h) else { return };
    if port.flags.contains(PortFlags::SCAN_NEEDED) {
        port.flags.remove(PortFlags::SCAN_NEEDED);
        ctx.post_adisc(h);
    }
}

fn update_port(ctx: &mut Ctx<'_>, h: PortHandle) {
    if let Some(port) = ctx.core.ports.get_mut(h) {
        port.flags.remove(PortFlags::SCAN_NEEDED);
    }
    ctx.post_adisc(h);
}

fn teardown(ctx: &mut Ctx<'_>, h: PortHandle) {
    ctx.continue_teardown(h);
}

fn wait(_ctx: &mut Ctx<'_>, _h: PortHandle) {}

impl Ctx<'_> {
    /// Run the login handler for the port's current state, unless something
    /// else must happen first.
    pub(crate) fn handle_login(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(topology) = self.topology() else { return };
        let Some(port) = self.core.ports.get(h) else { return };
        let state = port.disc_state;

        if state != DiscState::DeletePending {
            if port.scan_state != ScanState::Found
                || port.flags.contains(PortFlags::UNREACHABLE)
            {
                return;
            }
            if port.is_busy() {
                self.schedule_relogin(h);
                return;
            }
            if port.flags.contains(PortFlags::LOGIN_PAUSE) {
                let blocked = port
                    .conflict
                    .and_then(|c| self.core.ports.get(c))
                    .is_some_and(|c| c.disc_state != DiscState::Deleted);
                if blocked {
                    self.schedule_relogin(h);
                    return;
                }
                if let Some(port) = self.core.ports.get_mut(h) {
                    port.flags.remove(PortFlags::LOGIN_PAUSE);
                    port.conflict = None;
                }
            }
            if state == DiscState::Deleted && self.yield_address(h) {
                return;
            }
        }

        if let Some(port) = self.core.ports.get(h) {
            debug!(log, "handle login";
                "wwpn" => %port.port_name,
                "port_id" => %port.port_id,
                "disc_state" => <&str>::from(state),
                "fw_login_state" => ?port.fw_login_state,
                "topology" => %topology,
            );
        }
        handler(topology, state)(self, h);
    }

    /// If another record still holds `h`'s address, tear that one down and
    /// make `h` wait for it.  Returns whether `h` must wait.
    pub(crate) fn yield_address(&mut self, h: PortHandle) -> bool {
        let Some(port) = self.port(h) else { return false };
        let port_id = port.port_id;
        match self.core.ports.find_claimant_by_port_id(port_id, h) {
            Some(other) => {
                self.mark_conflict(h, other);
                true
            }
            None => false,
        }
    }

    /// Relogin pass, queued by completion handlers and the reconciler.
    pub(crate) fn relogin_event(&mut self, h: PortHandle) {
        let Some(port) = self.core.ports.get_mut(h) else { return };
        port.flags.remove(PortFlags::RELOGIN_NEEDED);
        if port.is_busy() {
            self.schedule_relogin(h);
            return;
        }
        let rescan = port.last_rscn_gen != port.rscn_gen
            && port.scan_state == ScanState::Found
            && !matches!(
                port.disc_state,
                DiscState::UpdatePort | DiscState::DeletePending
            );
        if rescan && self.topology().is_some() {
            self.post_gnl(h);
        } else {
            self.handle_login(h);
        }
    }

    pub(crate) fn post_login(&mut self, h: PortHandle) {
        let log = self.log;
        let els = self.is_n2n();
        let Some(port) = self.port(h) else { return };
        let (loop_id, port_id) = (port.loop_id, port.port_id);
        let cmd = Command::Login { loop_id, port_id, els };
        match self.issue_port(h, cmd) {
            Ok(xid) => {
                let Some(port) = self.port_mut(h) else { return };
                port.fw_login_state = FwLoginState::PlogiPending;
                port.set_disc_state(log, DiscState::LoginPending);
                info!(log, "PLOGI issued";
                    "wwpn" => %port.port_name,
                    "port_id" => %port.port_id,
                    "loop_id" => %port.loop_id,
                    "xid" => %xid,
                );
            }
            Err(e) => self.issue_failed(h, "PLOGI", e),
        }
    }

    pub(crate) fn post_prli(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.port(h) else { return };
        let fc4 = self
            .shared
            .policy
            .prli_choice(port.fc4_types, port.prli_failures);
        let (loop_id, port_id) = (port.loop_id, port.port_id);
        let cmd = Command::Prli { loop_id, port_id, fc4 };
        match self.issue_port(h, cmd) {
            Ok(_) => {
                let Some(port) = self.port_mut(h) else { return };
                port.fw_login_state = FwLoginState::PrliPending;
                port.set_disc_state(log, DiscState::LoginPending);
                debug!(log, "PRLI issued";
                    "wwpn" => %port.port_name,
                    "fc4" => ?fc4,
                );
            }
            Err(e) => self.issue_failed(h, "PRLI", e),
        }
    }

    pub(crate) fn post_gpdb(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.port(h) else { return };
        let loop_id = port.loop_id;
        let buf = match self.alloc_dma(ExchangeKind::GetPortDatabase) {
            Ok(buf) => buf,
            Err(e) => return self.issue_failed(h, "GPDB", e),
        };
        match self.issue_port(h, Command::GetPortDatabase { loop_id, buf }) {
            Ok(_) => {
                if let Some(port) = self.port_mut(h) {
                    port.set_disc_state(log, DiscState::GetPortDatabase);
                }
            }
            Err(e) => self.issue_failed(h, "GPDB", e),
        }
    }

    pub(crate) fn post_adisc(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.port(h) else { return };
        let (loop_id, port_id) = (port.loop_id, port.port_id);
        let cmd = Command::Adisc { loop_id, port_id };
        match self.issue_port(h, cmd) {
            Ok(_) => {
                if let Some(port) = self.port_mut(h) {
                    port.set_disc_state(log, DiscState::Adisc);
                }
            }
            Err(e) => self.issue_failed(h, "ADISC", e),
        }
    }

    /// Start tearing down a port.  Bumping the login generation makes any
    /// completion still in flight for it stale.
    pub(crate) fn schedule_deletion(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        match port.disc_state {
            DiscState::DeletePending => return,
            DiscState::Deleted
                if !port.is_busy()
                    && port.loop_id.is_none()
                    && !port.flags.intersects(
                        PortFlags::SESSION_REGISTERED
                            | PortFlags::LOGOUT_ON_DELETE,
                    ) =>
            {
                // Nothing to undo.
                if port.flags.contains(PortFlags::SUPERSEDED)
                    || port.scan_state == ScanState::Lost
                {
                    self.finish_teardown(h);
                }
                return;
            }
            _ => {}
        }

        port.login_gen += 1;
        info!(log, "scheduling port deletion";
            "wwpn" => %port.port_name,
            "port_id" => %port.port_id,
            "loop_id" => %port.loop_id,
            "from" => <&str>::from(port.disc_state),
        );
        port.set_disc_state(log, DiscState::DeletePending);
        if !port.is_busy() {
            self.continue_teardown(h);
        }
    }

    /// Pick teardown back up once a port's outstanding exchange is done.
    pub(crate) fn resume_deferred(&mut self, h: PortHandle) {
        let waiting = self.port(h).is_some_and(|p| {
            p.disc_state == DiscState::DeletePending && !p.is_busy()
        });
        if waiting {
            self.continue_teardown(h);
        }
    }

    pub(crate) fn continue_teardown(&mut self, h: PortHandle) {
        let online = self.online();
        let Some(port) = self.core.ports.get_mut(h) else { return };
        if port.disc_state != DiscState::DeletePending || port.is_busy() {
            return;
        }
        if port.flags.contains(PortFlags::SESSION_REGISTERED) {
            port.flags.remove(PortFlags::SESSION_REGISTERED);
            self.notices.push(Notice::Gone(port.info()));
        }

        let logged_in = port.flags.contains(PortFlags::LOGOUT_ON_DELETE)
            || port.fw_login_state.is_logged_in();
        if online
            && logged_in
            && !port.loop_id.is_none()
            && port.fw_login_state != FwLoginState::LogoPending
        {
            let (loop_id, port_id) = (port.loop_id, port.port_id);
            let cmd = Command::Logout { loop_id, port_id };
            match self.issue_port(h, cmd) {
                Ok(_) => {
                    if let Some(port) = self.port_mut(h) {
                        port.fw_login_state = FwLoginState::LogoPending;
                    }
                    return;
                }
                Err(e) => {
                    debug!(self.log,
                        "logout not sent, finishing teardown: {e}");
                }
            }
        }
        self.finish_teardown(h);
    }

    pub(crate) fn logout_done(&mut self, h: PortHandle) {
        self.finish_teardown(h);
    }

    /// Last step of teardown: give back the loop ID, let any port waiting on
    /// this one proceed, and either destroy the record or log in again.
    pub(crate) fn finish_teardown(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        let lid = port.loop_id;
        port.loop_id = crate::types::LoopId::NONE;
        port.fw_login_state = FwLoginState::Unknown;
        port.flags.remove(PortFlags::LOGOUT_ON_DELETE);
        port.set_disc_state(log, DiscState::Deleted);

        let destroy = port.flags.contains(PortFlags::SUPERSEDED)
            || port.scan_state == ScanState::Lost;
        let relogin = !destroy
            && port.scan_state == ScanState::Found
            && !port.flags.contains(PortFlags::UNREACHABLE);

        let freed = !lid.is_none() && !self.core.ports.loop_id_shared(lid, h);
        if freed {
            self.shared.loop_ids.release(lid);
        }

        let waiting: Vec<PortHandle> = self
            .core
            .ports
            .iter()
            .filter(|(_, p)| {
                p.conflict == Some(h)
                    || (freed && p.flags.contains(PortFlags::DEFERRED))
            })
            .map(|(oh, _)| oh)
            .collect();
        for oh in waiting {
            if let Some(other) = self.core.ports.get_mut(oh) {
                if other.conflict == Some(h) {
                    other.conflict = None;
                    other.flags.remove(PortFlags::LOGIN_PAUSE);
                }
                other.flags.remove(PortFlags::DEFERRED);
            }
            self.kick(oh);
        }

        if destroy {
            if let Some(port) = self.core.ports.remove(h) {
                info!(log, "port removed";
                    "wwpn" => %port.port_name,
                    "port_id" => %port.port_id,
                );
            }
        } else if relogin {
            self.kick(h);
        }
    }

    /// Consume one retry after a transient failure, or give up on the port.
    pub(crate) fn retry_or_give_up(&mut self, h: PortHandle) {
        let Some(port) = self.core.ports.get_mut(h) else { return };
        if port.login_retry > 0 {
            port.login_retry -= 1;
            self.schedule_relogin(h);
        } else {
            self.give_up(h);
        }
    }

    /// Out of login retries: tear the port down for good.  It comes back
    /// only if a later discovery pass finds it again.
    pub(crate) fn give_up(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        warn!(log, "login retries exhausted";
            "wwpn" => %port.port_name,
            "port_id" => %port.port_id,
        );
        port.scan_state = ScanState::Lost;
        self.schedule_deletion(h);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tables_cover_every_state() {
        // Each table entry lines up with its DiscState discriminant.
        let states = [
            DiscState::Deleted,
            DiscState::DeletePending,
            DiscState::GetNameList,
            DiscState::LoginPending,
            DiscState::LoginFailed,
            DiscState::GetPortDatabase,
            DiscState::LoginComplete,
            DiscState::UpdatePort,
            DiscState::Adisc,
        ];
        for (i, s) in states.iter().enumerate() {
            assert_eq!(*s as usize, i);
        }
        assert_eq!(
            handler(Topology::Fabric, DiscState::LoginFailed) as usize,
            failed_switched as Handler as usize
        );
        assert_eq!(
            handler(Topology::PointToPoint, DiscState::LoginFailed) as usize,
            check_login as Handler as usize
        );
        assert_eq!(
            handler(Topology::PrivateLoop, DiscState::Deleted) as usize,
            from_deleted as Handler as usize
        );
    }
}
