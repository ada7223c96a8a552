// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding remote ports and reconciling them with the registry.

use slog::{debug, info, warn};

use crate::dispatch::{Ctx, Notice, Work};
use crate::exchange::{
    Command, ExchangeId, ExchangeKind, ExchangeStatus, IdListEntry,
    NameListEntry, NsEntry, NsQuery, Payload,
};
use crate::login::events::{freshness, Freshness};
use crate::ops::ResetKind;
use crate::port::{
    DiscState, FwLoginState, Generations, Port, PortFlags, ScanState,
};
use crate::registry::PortHandle;
use crate::types::{Fc4Types, LoopId, PortId, Wwn};

/// Upper bound on single-step name server queries in one fabric walk.
const MAX_FABRIC_WALK: usize = 2048;

#[derive(Copy, Clone, Debug)]
pub(crate) struct ScanInFlight {
    pub id: ExchangeId,
    /// Name server query, for fabric scans.
    pub query: Option<NsQuery>,
}

#[derive(Default)]
pub(crate) struct DiscoveryState {
    pub scan_needed: bool,
    pub scan: Option<ScanInFlight>,
    /// Rescans triggered by empty results or handle exhaustion since the
    /// last topology change.
    pub scan_retry: u8,
    pub handles_exhausted: bool,
    pub relogin_needed: bool,
    /// Name list query shared by every port in `gnl_waiters`.
    pub gnl: Option<ExchangeId>,
    pub gnl_waiters: Vec<PortHandle>,
    /// Entries collected so far by a step-by-step fabric walk.
    pub walk: Option<Vec<NsEntry>>,
}

/// One port reported by a scan.
#[derive(Copy, Clone, Debug)]
struct ScanEntry {
    port_id: PortId,
    port_name: Wwn,
    node_name: Wwn,
    fc4_types: Option<Fc4Types>,
}

impl From<&IdListEntry> for ScanEntry {
    fn from(e: &IdListEntry) -> Self {
        Self {
            port_id: e.port_id,
            port_name: e.port_name,
            node_name: e.node_name,
            fc4_types: None,
        }
    }
}

impl From<&NsEntry> for ScanEntry {
    fn from(e: &NsEntry) -> Self {
        Self {
            port_id: e.port_id,
            port_name: e.port_name,
            node_name: e.node_name,
            fc4_types: Some(e.fc4_types),
        }
    }
}

impl Ctx<'_> {
    /// Re-read link state after the link layer reports a change.
    pub(crate) fn topology_changed(&mut self) {
        let log = self.log;
        let link = &self.shared.ops.link;
        let online = link.link_is_online();
        let topology = link.current_topology().filter(|_| online);
        info!(log, "link state changed";
            "online" => online,
            "topology" => topology.map(<&str>::from).unwrap_or("none"),
        );

        let disc = &mut self.core.disc;
        disc.scan = None;
        disc.walk = None;
        disc.scan_retry = 0;
        disc.handles_exhausted = false;

        match topology {
            Some(topology) => {
                self.core.online = true;
                self.core.topology = Some(topology);
                self.core.disc.scan_needed = true;
                self.work.push(Work::Scan);
            }
            None => {
                self.core.online = false;
                self.core.topology = None;
                self.link_down();
            }
        }
    }

    /// Logins do not survive the link going down.  Tape devices keep their
    /// sessions and get revalidated once the link is back.
    fn link_down(&mut self) {
        for h in self.core.ports.handles() {
            let Some(port) = self.core.ports.get_mut(h) else { continue };
            if !port.disc_state.is_live() {
                continue;
            }
            if port.removable_when_lost() {
                self.schedule_deletion(h);
            } else {
                port.flags |= PortFlags::SCAN_NEEDED;
            }
        }
    }

    /// Start a discovery pass suited to the topology, unless one is
    /// already running.
    pub(crate) fn scan(&mut self) {
        let Some(topology) = self.topology() else { return };
        if !self.online() {
            return;
        }
        if self.core.disc.scan.is_some() {
            self.core.disc.scan_needed = true;
            return;
        }
        self.core.disc.scan_needed = false;
        if topology.has_name_server() {
            self.scan_fabric();
        } else {
            self.scan_local_loop();
        }
    }

    pub(crate) fn scan_local_loop(&mut self) {
        let buf = match self.alloc_dma(ExchangeKind::GetIdList) {
            Ok(buf) => buf,
            Err(e) => return self.scan_issue_failed(e),
        };
        match self.issue_unbound(Command::GetIdList { buf }) {
            Ok(id) => {
                debug!(self.log, "local loop scan started"; "xid" => %id);
                self.core.disc.scan = Some(ScanInFlight { id, query: None });
            }
            Err(e) => self.scan_issue_failed(e),
        }
    }

    pub(crate) fn scan_fabric(&mut self) {
        self.core.disc.walk = None;
        self.query_name_server(NsQuery::ByType(Fc4Types::FCP | Fc4Types::NVME));
    }

    fn query_name_server(&mut self, query: NsQuery) {
        let buf = match self.alloc_dma(ExchangeKind::NameServer) {
            Ok(buf) => buf,
            Err(e) => return self.scan_issue_failed(e),
        };
        match self.issue_unbound(Command::NameServer { query, buf }) {
            Ok(id) => {
                debug!(self.log, "name server query";
                    "xid" => %id,
                    "query" => ?query,
                );
                let query = Some(query);
                self.core.disc.scan = Some(ScanInFlight { id, query });
            }
            Err(e) => self.scan_issue_failed(e),
        }
    }

    fn scan_issue_failed(&mut self, e: crate::exchange::IssueError) {
        warn!(self.log, "could not start discovery: {e}");
        self.core.disc.walk = None;
        self.rescan_later();
    }

    /// Arrange for another pass, within the rescan budget.
    fn rescan_later(&mut self) {
        let max = self.shared.cfg.max_scan_retries;
        let disc = &mut self.core.disc;
        if disc.scan_retry < max {
            disc.scan_retry += 1;
            disc.scan_needed = true;
        } else {
            warn!(self.log, "rescan limit reached";
                "scan_retry" => disc.scan_retry);
        }
    }

    fn take_scan(&mut self, id: ExchangeId) -> Option<ScanInFlight> {
        match self.core.disc.scan {
            Some(s) if s.id == id => self.core.disc.scan.take(),
            _ => {
                debug!(self.log, "ignoring completion of abandoned scan";
                    "xid" => %id);
                None
            }
        }
    }

    pub(crate) fn loop_scan_done(
        &mut self,
        id: ExchangeId,
        status: ExchangeStatus,
        payload: Payload,
    ) {
        if self.take_scan(id).is_none() {
            return;
        }
        let entries = match (status, payload) {
            (ExchangeStatus::Success, Payload::IdList(entries)) => entries,
            (status, _) => {
                warn!(self.log, "local loop scan failed"; "status" => ?status);
                return self.rescan_later();
            }
        };
        let entries: Vec<ScanEntry> = entries
            .iter()
            .filter(|e| !e.port_id.is_reserved_domain())
            .map(ScanEntry::from)
            .collect();
        if entries.is_empty()
            && self.core.disc.scan_retry < self.shared.cfg.max_scan_retries
        {
            // Devices may still be initializing; look again before
            // declaring everything lost.
            return self.rescan_later();
        }
        self.reconcile_scan(entries, false);
    }

    pub(crate) fn fabric_scan_done(
        &mut self,
        id: ExchangeId,
        status: ExchangeStatus,
        payload: Payload,
    ) {
        let Some(scan) = self.take_scan(id) else { return };
        let log = self.log;
        let local = self.core.local.port_id;
        match scan.query {
            Some(NsQuery::ByType(_)) => match (status, payload) {
                (ExchangeStatus::Success, Payload::NameServer(entries)) => {
                    let entries = entries.iter().map(ScanEntry::from).collect();
                    self.reconcile_scan(entries, true);
                }
                (status, _) => {
                    info!(log, "name server type query failed, walking fabric";
                        "status" => ?status);
                    self.core.disc.walk = Some(Vec::new());
                    self.query_name_server(NsQuery::NextAfter(local));
                }
            },
            Some(NsQuery::NextAfter(_)) => {
                let Some(mut walk) = self.core.disc.walk.take() else { return };
                let next = match (status, payload) {
                    (ExchangeStatus::Success, Payload::NameServer(e)) => {
                        e.first().copied()
                    }
                    (status, _) => {
                        warn!(log, "fabric walk failed"; "status" => ?status);
                        return self.rescan_later();
                    }
                };
                let done = match next {
                    None => true,
                    Some(e) => {
                        e.port_id.is_zero()
                            || e.port_id == local
                            || walk.iter().any(|w| w.port_id == e.port_id)
                            || walk.len() >= MAX_FABRIC_WALK
                    }
                };
                match (done, next) {
                    (false, Some(e)) => {
                        walk.push(e);
                        self.core.disc.walk = Some(walk);
                        self.query_name_server(NsQuery::NextAfter(e.port_id));
                    }
                    _ => {
                        let entries =
                            walk.iter().map(ScanEntry::from).collect();
                        self.reconcile_scan(entries, true);
                    }
                }
            }
            None => {}
        }
    }

    /// Match a pass's results against the registry: create or update what
    /// was seen, drive out what was not, then run logins.
    fn reconcile_scan(&mut self, entries: Vec<ScanEntry>, fabric: bool) {
        let log = self.log;
        let local = self.core.local;
        let snapshot = self.core.ports.handles();
        for h in snapshot.iter() {
            if let Some(port) = self.core.ports.get_mut(*h) {
                port.scan_state = ScanState::Scan;
            }
        }

        let mut seen: Vec<PortHandle> = Vec::new();
        let mut addresses: Vec<(PortId, PortHandle)> = Vec::new();
        for e in entries.iter() {
            if e.port_name.is_none()
                || e.port_name == local.wwpn
                || e.port_id == local.port_id
                || (fabric && e.port_id.is_sw_reserved())
            {
                continue;
            }
            let earlier = addresses
                .iter()
                .find(|(pid, _)| *pid == e.port_id)
                .map(|(_, h)| *h);
            if let Some(h) = self.observe(e, fabric, earlier) {
                if !seen.contains(&h) {
                    seen.push(h);
                }
                addresses.retain(|(pid, _)| *pid != e.port_id);
                addresses.push((e.port_id, h));
            }
        }

        for h in snapshot {
            let Some(port) = self.core.ports.get_mut(h) else { continue };
            if port.scan_state != ScanState::Scan {
                continue;
            }
            port.scan_state = ScanState::Lost;
            if port.disc_state.is_live() && !port.removable_when_lost() {
                debug!(log, "keeping lost port with persistent session";
                    "wwpn" => %port.port_name);
                continue;
            }
            info!(log, "port lost"; "wwpn" => %port.port_name);
            self.schedule_deletion(h);
        }

        info!(log, "discovery pass complete";
            "found" => seen.len(),
            "fabric" => fabric,
            "ports" => self.core.ports.len(),
        );
        for h in seen {
            self.handle_login(h);
        }
    }

    /// Fold one scan result into the registry.  `earlier` is the port this
    /// pass already placed at the same address, if any.
    fn observe(
        &mut self,
        e: &ScanEntry,
        fabric: bool,
        earlier: Option<PortHandle>,
    ) -> Option<PortHandle> {
        let log = self.log;
        let n2n = self.is_n2n();
        let h = match self.core.ports.find_by_wwn(e.port_name) {
            None => self.create_port(e, fabric),
            Some(h) => {
                let retries = self.shared.cfg.login_retry_count;
                let port = self.core.ports.get_mut(h)?;
                let moved =
                    !port.port_id.is_zero() && port.port_id != e.port_id;
                let in_use =
                    port.disc_state != DiscState::Deleted || port.is_busy();
                if moved && in_use {
                    // Same WWPN at a new address while the old record is
                    // still in use: start a new record, which waits for
                    // the old one to finish teardown.
                    info!(log, "port moved while logged in, superseding";
                        "wwpn" => %port.port_name,
                        "old" => %port.port_id,
                        "new" => %e.port_id,
                    );
                    port.flags |= PortFlags::SUPERSEDED;
                    port.scan_state = ScanState::Lost;
                    let new = self.create_port(e, fabric);
                    if let Some(p) = self.core.ports.get_mut(new) {
                        p.conflict = Some(h);
                        p.flags |= PortFlags::LOGIN_PAUSE;
                    }
                    self.schedule_deletion(h);
                    new
                } else {
                    if moved {
                        info!(log, "port moved";
                            "wwpn" => %port.port_name,
                            "old" => %port.port_id,
                            "new" => %e.port_id,
                        );
                        let lid = std::mem::replace(
                            &mut port.loop_id,
                            LoopId::NONE,
                        );
                        if !self.core.ports.loop_id_shared(lid, h) {
                            self.shared.loop_ids.release(lid);
                        }
                    }
                    let port = self.core.ports.get_mut(h)?;
                    if port.scan_state == ScanState::Lost {
                        port.login_retry = retries;
                    }
                    port.port_id = e.port_id;
                    if !e.node_name.is_none() {
                        port.node_name = e.node_name;
                    }
                    if let Some(fc4) = e.fc4_types.filter(|f| !f.is_empty()) {
                        port.fc4_types = fc4;
                    }
                    port.scan_state = ScanState::Found;
                    h
                }
            }
        };

        let other = earlier
            .filter(|o| *o != h && self.core.ports.contains(*o))
            .or_else(|| {
                self.core.ports.find_live_by_port_id(e.port_id, Some(h))
            });
        if let Some(other) = other {
            self.mark_conflict(h, other);
        }
        if n2n && !fabric {
            let deadline = self.now + self.shared.cfg.n2n_login_wait();
            if let Some(port) = self.core.ports.get_mut(h) {
                port.flags |= PortFlags::N2N;
                port.n2n.login_deadline.get_or_insert(deadline);
            }
        }
        Some(h)
    }

    fn create_port(&mut self, e: &ScanEntry, fabric: bool) -> PortHandle {
        let mut port = Port::new(
            e.port_name,
            e.node_name,
            e.port_id,
            self.shared.cfg.login_retry_count,
        );
        if let Some(fc4) = e.fc4_types.filter(|f| !f.is_empty()) {
            port.fc4_types = fc4;
        }
        if fabric {
            port.flags |= PortFlags::FABRIC_DEVICE;
        }
        info!(self.log, "new port discovered";
            "wwpn" => %port.port_name,
            "port_id" => %port.port_id,
        );
        self.core.ports.insert(port)
    }

    /// `h` and the live port `other` claim the same address.  The earlier
    /// port is torn down and `h` waits for that to finish.
    pub(crate) fn mark_conflict(&mut self, h: PortHandle, other: PortHandle) {
        let log = self.log;
        if let Some(o) = self.core.ports.get(other) {
            info!(log, "address conflict, deleting earlier port";
                "wwpn" => %o.port_name,
                "port_id" => %o.port_id,
                "loop_id" => %o.loop_id,
            );
        }
        if let Some(port) = self.core.ports.get_mut(h) {
            port.conflict = Some(other);
            port.flags |= PortFlags::LOGIN_PAUSE;
        }
        if let Some(o) = self.core.ports.get_mut(other) {
            o.scan_state = ScanState::Lost;
        }
        self.schedule_deletion(other);
        self.schedule_relogin(h);
    }

    /// Loop IDs ran out.  Park the port until one is released or a later
    /// pass tries again.
    pub(crate) fn defer_for_handles(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        warn!(log, "no free loop IDs, deferring login";
            "wwpn" => %port.port_name,
            "port_id" => %port.port_id,
        );
        // Running out of handles is not the port's fault.
        port.login_retry = port.login_retry.saturating_add(1);
        port.flags |= PortFlags::DEFERRED;
        port.set_disc_state(log, DiscState::Deleted);
        self.core.disc.handles_exhausted = true;
    }

    /// Called from the reconciler: one rescan per pass that ran short of
    /// loop IDs, within the rescan budget.
    pub(crate) fn retry_deferred(&mut self) {
        if std::mem::take(&mut self.core.disc.handles_exhausted) {
            self.rescan_later();
        }
    }

    /// A state change notice arrived for `port_id`.
    pub(crate) fn state_change_notice(&mut self, port_id: PortId) {
        let log = self.log;
        match self.core.ports.find_by_port_id(port_id) {
            Some(h) => {
                let Some(port) = self.core.ports.get_mut(h) else { return };
                port.rscn_gen += 1;
                port.flags |= PortFlags::SCAN_NEEDED;
                info!(log, "state change notice";
                    "wwpn" => %port.port_name,
                    "port_id" => %port_id,
                    "rscn_gen" => port.rscn_gen,
                );
                if port.disc_state == DiscState::LoginComplete {
                    port.set_disc_state(log, DiscState::UpdatePort);
                }
                self.kick(h);
            }
            None => {
                info!(log, "state change notice for unknown port, rescanning";
                    "port_id" => %port_id);
                self.core.disc.scan_needed = true;
                self.work.push(Work::Scan);
            }
        }
    }

    /// Ask the firmware which ports it has logged in, coalescing with a
    /// query already in flight.
    pub(crate) fn post_gnl(&mut self, h: PortHandle) {
        let log = self.log;
        let Some(port) = self.core.ports.get_mut(h) else { return };
        if port.is_busy() {
            return;
        }
        if let Some(batch) = self.core.disc.gnl {
            port.take_exchange(batch);
            port.set_disc_state(log, DiscState::GetNameList);
            self.core.disc.gnl_waiters.push(h);
            return;
        }

        let buf = match self.alloc_dma(ExchangeKind::GetNameList) {
            Ok(buf) => buf,
            Err(e) => return self.issue_failed(h, "GNL", e),
        };
        match self.issue_port(h, Command::GetNameList { buf }) {
            Ok(id) => {
                self.core.disc.gnl = Some(id);
                self.core.disc.gnl_waiters.push(h);
                if let Some(port) = self.core.ports.get_mut(h) {
                    port.set_disc_state(log, DiscState::GetNameList);
                }
            }
            Err(e) => self.issue_failed(h, "GNL", e),
        }
    }

    pub(crate) fn gnl_done(
        &mut self,
        id: ExchangeId,
        status: ExchangeStatus,
        payload: Payload,
    ) {
        if self.core.disc.gnl != Some(id) {
            debug!(self.log, "ignoring unexpected name list"; "xid" => %id);
            return;
        }
        self.core.disc.gnl = None;
        let waiters = std::mem::take(&mut self.core.disc.gnl_waiters);
        let entries = match (status, payload) {
            (ExchangeStatus::Success, Payload::NameList(e)) => Some(e),
            (status, _) => {
                info!(self.log, "name list query failed"; "status" => ?status);
                None
            }
        };
        if let Some(entries) = entries.as_ref() {
            for e in entries {
                self.shared.loop_ids.claim(e.loop_id);
            }
        }

        for h in waiters {
            let Some(port) = self.core.ports.get_mut(h) else { continue };
            if port.owner != Some(id) {
                continue;
            }
            port.release_exchange();
            match entries.as_ref() {
                Some(entries) => self.gnl_port(h, entries),
                None => {
                    if let Some(port) = self.core.ports.get_mut(h) {
                        if port.disc_state != DiscState::DeletePending {
                            port.set_disc_state(self.log, DiscState::Deleted);
                            self.retry_or_give_up(h);
                        }
                    }
                }
            }
            self.resume_deferred(h);
        }

        if let Some(entries) = entries {
            self.adopt_unknown(&entries);
        }
    }

    /// Apply a name list to one waiting port.
    fn gnl_port(&mut self, h: PortHandle, entries: &[NameListEntry]) {
        let Some(port) = self.port(h) else { return };
        if port.disc_state == DiscState::DeletePending {
            return;
        }
        let issued = Generations {
            login: port.last_login_gen,
            rscn: port.last_rscn_gen,
        };
        match freshness(port, issued) {
            Freshness::Current => {}
            Freshness::Stale => return,
            Freshness::Replay => return self.rscn_replay(h),
        }
        let wwn = port.port_name;
        let found = entries
            .iter()
            .find(|e| e.port_name == wwn && !e.port_id.is_sw_reserved())
            .copied();
        match found {
            Some(e) => self.gnl_found(h, e),
            None if self.is_n2n() => self.gnl_missing_n2n(h),
            None => self.gnl_missing(h, entries),
        }
    }

    fn gnl_found(&mut self, h: PortHandle, e: NameListEntry) {
        let log = self.log;
        let n2n = self.is_n2n();
        let now = self.now;
        let ack_wait = self.shared.cfg.plogi_ack_wait();
        let Some(port) = self.core.ports.get_mut(h) else { return };

        let moved = !port.loop_id.is_none()
            && ((!n2n && !port.port_id.is_zero() && e.port_id != port.port_id)
                || e.loop_id != port.loop_id);
        if moved {
            info!(log, "firmware reports port at a different address";
                "wwpn" => %port.port_name,
                "port_id" => %port.port_id,
                "fw_port_id" => %e.port_id,
                "loop_id" => %port.loop_id,
                "fw_loop_id" => %e.loop_id,
            );
            return self.schedule_deletion(h);
        }

        if !e.loop_id.is_none() {
            port.loop_id = e.loop_id;
        }
        if n2n {
            port.port_id = e.port_id;
        }
        port.port_type = e.port_type;
        if !e.fc4_types.is_empty() {
            port.fc4_types = e.fc4_types;
        }
        port.fw_login_state = e.login_state;
        let (port_id, loop_id) = (port.port_id, port.loop_id);
        if e.login_state == FwLoginState::PlogiComplete && n2n {
            port.n2n.plogi_ack_deadline.get_or_insert(now + ack_wait);
        }

        let other = self
            .core
            .ports
            .find_live_by_port_id(port_id, Some(h))
            .or_else(|| self.core.ports.find_live_by_loop_id(loop_id, Some(h)));
        if let Some(other) = other {
            return self.mark_conflict(h, other);
        }

        match e.login_state {
            FwLoginState::PrliComplete => self.post_adisc(h),
            _ => self.handle_login(h),
        }
    }

    fn gnl_missing(&mut self, h: PortHandle, entries: &[NameListEntry]) {
        let Some(port) = self.port(h) else { return };
        let (wwn, port_id, loop_id) =
            (port.port_name, port.port_id, port.loop_id);

        // Someone else at our address per the firmware: that record is
        // out of date.
        let squatters = entries
            .iter()
            .filter(|e| e.port_id == port_id && e.port_name != wwn);
        for e in squatters {
            if let Some(other) = self.core.ports.find_by_wwn(e.port_name) {
                if self.port(other).is_some_and(|p| p.disc_state.is_live()) {
                    self.schedule_deletion(other);
                }
            }
        }
        if !loop_id.is_none() && entries.iter().any(|e| e.loop_id == loop_id) {
            // Our handle went to another port; pick a new one.
            if let Some(port) = self.port_mut(h) {
                port.loop_id = LoopId::NONE;
            }
        }
        if let Some(port) = self.port_mut(h) {
            if port.loop_id.is_none() {
                port.fw_login_state = FwLoginState::PortUnavailable;
            }
        }
        self.handle_login(h);
    }

    /// The point-to-point peer has not logged in to us.  Wait for it up to
    /// a deadline, then escalate with resets, and finally give up.
    fn gnl_missing_n2n(&mut self, h: PortHandle) {
        let log = self.log;
        let now = self.now;
        let local = self.core.local.wwpn;
        let shared = self.shared;
        let cfg = &shared.cfg;
        let wait = cfg.n2n_login_wait();
        let Some(port) = self.core.ports.get_mut(h) else { return };
        if local > port.port_name {
            // We are the initiator here.
            return self.handle_login(h);
        }
        port.set_disc_state(log, DiscState::Deleted);
        let deadline = *port.n2n.login_deadline.get_or_insert(now + wait);
        if now < deadline {
            return self.schedule_relogin(h);
        }

        let reset = if port.n2n.link_resets < cfg.n2n_link_reset_limit {
            port.n2n.link_resets += 1;
            Some(ResetKind::Link)
        } else if port.n2n.chip_resets < cfg.n2n_chip_reset_limit {
            port.n2n.chip_resets += 1;
            Some(ResetKind::Chip)
        } else {
            None
        };
        match reset {
            Some(kind) => {
                warn!(log, "peer has not logged in, requesting reset";
                    "wwpn" => %port.port_name,
                    "reset" => <&str>::from(kind),
                );
                port.n2n.login_deadline = Some(now + wait);
                self.notices.push(Notice::Reset(kind));
                self.schedule_relogin(h);
            }
            None => {
                warn!(log, "unable to reach point-to-point peer";
                    "wwpn" => %port.port_name);
                port.flags |= PortFlags::UNREACHABLE;
            }
        }
    }

    /// Create records for ports the firmware knows about that discovery
    /// has not seen yet.
    fn adopt_unknown(&mut self, entries: &[NameListEntry]) {
        let local = self.core.local.wwpn;
        for e in entries {
            if e.port_name.is_none()
                || e.port_name == local
                || e.port_id.is_sw_reserved()
                || self.core.ports.find_by_wwn(e.port_name).is_some()
            {
                continue;
            }
            let entry = ScanEntry {
                port_id: e.port_id,
                port_name: e.port_name,
                node_name: e.node_name,
                fc4_types: Some(e.fc4_types),
            };
            let fabric = self.topology().is_some_and(|t| t.has_name_server());
            let h = self.create_port(&entry, fabric);
            self.kick(h);
        }
    }

    /// Remove records that were lost and have finished teardown.
    pub(crate) fn reap_lost(&mut self) {
        let doomed: Vec<PortHandle> = self
            .core
            .ports
            .iter()
            .filter(|(_, p)| {
                p.scan_state == ScanState::Lost
                    && p.disc_state == DiscState::Deleted
                    && !p.is_busy()
                    && p.removable_when_lost()
            })
            .map(|(h, _)| h)
            .collect();
        for h in doomed {
            self.core.ports.remove(h);
        }
    }

    /// Periodic ADISC of logged-in ports.
    pub(crate) fn revalidate_due(&mut self) {
        let Some(interval) = self.shared.cfg.adisc_interval() else { return };
        let now = self.now;
        let due: Vec<PortHandle> = self
            .core
            .ports
            .iter()
            .filter(|(_, p)| {
                p.disc_state == DiscState::LoginComplete
                    && !p.is_busy()
                    && p.last_validated.is_some_and(|t| now >= t + interval)
            })
            .map(|(h, _)| h)
            .collect();
        for h in due {
            self.post_adisc(h);
        }
    }
}
