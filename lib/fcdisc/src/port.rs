// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote port records.

use std::time::Instant;

use serde::Serialize;
use slog::{debug, Logger};

use crate::exchange::ExchangeId;
use crate::registry::PortHandle;
use crate::types::{Fc4Types, LoopId, PortId, PortType, Wwn};

#[usdt::provider(provider = "fcdisc")]
mod probes {
    fn port_disc_state(port_id: u32, from: u8, to: u8, login_gen: u64) {}
}

/// Where a port stands in discovery and login.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    strum::IntoStaticStr,
    strum::EnumCount,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum DiscState {
    Deleted = 0,
    DeletePending,
    GetNameList,
    LoginPending,
    LoginFailed,
    GetPortDatabase,
    LoginComplete,
    UpdatePort,
    Adisc,
}

impl DiscState {
    /// Neither torn down nor on the way there.
    pub const fn is_live(self) -> bool {
        !matches!(self, DiscState::Deleted | DiscState::DeletePending)
    }
}

/// Login state for the port as the firmware sees it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FwLoginState {
    #[default]
    Unknown,
    PortUnavailable,
    PlogiPending,
    PlogiComplete,
    PrliPending,
    PrliComplete,
    LogoPending,
}

impl FwLoginState {
    /// Whether the firmware holds a login that must be undone on teardown.
    pub const fn is_logged_in(self) -> bool {
        matches!(
            self,
            FwLoginState::PlogiComplete
                | FwLoginState::PrliPending
                | FwLoginState::PrliComplete
        )
    }
}

/// Presence of the port in the most recent discovery pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanState {
    #[default]
    Scan,
    Found,
    Lost,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        /// An exchange targeting this port is outstanding.
        const ASYNC_SENT = 1 << 0;
        const FABRIC_DEVICE = 1 << 2;
        /// Tape-class device which survives link events without relogin.
        const FCP2_DEVICE = 1 << 3;
        /// Waiting for a conflicting port to finish teardown.
        const LOGIN_PAUSE = 1 << 4;
        /// A state change notice named this port.
        const SCAN_NEEDED = 1 << 5;
        const SESSION_REGISTERED = 1 << 6;
        /// Firmware holds a login for this port that teardown must undo.
        const LOGOUT_ON_DELETE = 1 << 7;
        const RELOGIN_NEEDED = 1 << 8;
        const N2N = 1 << 9;
        /// Replaced by a newer record with the same WWPN; destroy once
        /// teardown completes.
        const SUPERSEDED = 1 << 10;
        /// Parked until a loop ID frees up.
        const DEFERRED = 1 << 11;
        /// Point-to-point peer that could not be reached after resets.
        const UNREACHABLE = 1 << 12;
    }
}

/// Generation counters captured when an exchange is issued, compared against
/// the port's current values when it completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Generations {
    pub login: u64,
    pub rscn: u64,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct N2nState {
    pub login_deadline: Option<Instant>,
    pub link_resets: u8,
    pub chip_resets: u8,
    pub prli_link_resets: u8,
    /// Set once the peer has logged in to us; we log in ourselves if it
    /// does not finish by then.
    pub plogi_ack_deadline: Option<Instant>,
}

/// One remote port known to the host.
#[derive(Debug)]
pub struct Port {
    pub port_name: Wwn,
    pub node_name: Wwn,
    pub port_id: PortId,
    pub loop_id: LoopId,
    pub fw_login_state: FwLoginState,
    pub port_type: PortType,
    pub fc4_types: Fc4Types,

    pub(crate) disc_state: DiscState,
    pub(crate) scan_state: ScanState,
    pub(crate) flags: PortFlags,

    pub(crate) login_gen: u64,
    pub(crate) rscn_gen: u64,
    pub(crate) last_login_gen: u64,
    pub(crate) last_rscn_gen: u64,

    pub(crate) login_retry: u8,
    pub(crate) prli_failures: u8,
    pub(crate) conflict: Option<PortHandle>,
    pub(crate) owner: Option<ExchangeId>,
    pub(crate) n2n: N2nState,
    pub(crate) last_validated: Option<Instant>,
}

impl Port {
    pub(crate) fn new(
        port_name: Wwn,
        node_name: Wwn,
        port_id: PortId,
        login_retry: u8,
    ) -> Self {
        Self {
            port_name,
            node_name,
            port_id,
            loop_id: LoopId::NONE,
            fw_login_state: FwLoginState::Unknown,
            port_type: PortType::Unknown,
            fc4_types: Fc4Types::FCP,
            disc_state: DiscState::Deleted,
            scan_state: ScanState::Found,
            flags: PortFlags::empty(),
            login_gen: 0,
            rscn_gen: 0,
            last_login_gen: 0,
            last_rscn_gen: 0,
            login_retry,
            prli_failures: 0,
            conflict: None,
            owner: None,
            n2n: N2nState::default(),
            last_validated: None,
        }
    }

    pub fn disc_state(&self) -> DiscState {
        self.disc_state
    }
    pub fn scan_state(&self) -> ScanState {
        self.scan_state
    }
    pub fn flags(&self) -> PortFlags {
        self.flags
    }
    pub fn login_gen(&self) -> u64 {
        self.login_gen
    }
    pub fn rscn_gen(&self) -> u64 {
        self.rscn_gen
    }
    pub fn login_retry(&self) -> u8 {
        self.login_retry
    }
    pub fn conflict(&self) -> Option<PortHandle> {
        self.conflict
    }

    pub(crate) fn gens(&self) -> Generations {
        Generations { login: self.login_gen, rscn: self.rscn_gen }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.flags.contains(PortFlags::ASYNC_SENT)
    }

    /// Whether a discovery pass that no longer sees this port may remove
    /// it.  Tape devices and initiators are left alone.
    pub(crate) fn removable_when_lost(&self) -> bool {
        !self.flags.contains(PortFlags::FCP2_DEVICE)
            && self.port_type != PortType::Initiator
    }

    pub(crate) fn set_disc_state(&mut self, log: &Logger, to: DiscState) {
        let from = self.disc_state;
        if from == to {
            return;
        }
        self.disc_state = to;
        probes::port_disc_state!(|| (
            self.port_id.raw(),
            from as u8,
            to as u8,
            self.login_gen
        ));
        debug!(log, "disc_state {} -> {}",
            <&str>::from(from), <&str>::from(to);
            "wwpn" => %self.port_name,
            "port_id" => %self.port_id,
            "loop_id" => %self.loop_id,
        );
    }

    pub(crate) fn take_exchange(&mut self, id: ExchangeId) {
        self.flags |= PortFlags::ASYNC_SENT;
        self.owner = Some(id);
        self.last_login_gen = self.login_gen;
        self.last_rscn_gen = self.rscn_gen;
    }

    pub(crate) fn release_exchange(&mut self) {
        self.flags.remove(PortFlags::ASYNC_SENT);
        self.owner = None;
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            wwpn: self.port_name,
            wwnn: self.node_name,
            port_id: self.port_id,
            loop_id: self.loop_id,
            disc_state: self.disc_state,
            fw_login_state: self.fw_login_state,
            scan_state: self.scan_state,
            port_type: self.port_type,
            fc4_types: self.fc4_types,
            login_gen: self.login_gen,
            rscn_gen: self.rscn_gen,
        }
    }
}

/// Point-in-time copy of a [`Port`] handed to callers outside the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    pub port_id: PortId,
    pub loop_id: LoopId,
    pub disc_state: DiscState,
    pub fw_login_state: FwLoginState,
    pub scan_state: ScanState,
    pub port_type: PortType,
    pub fc4_types: Fc4Types,
    pub login_gen: u64,
    pub rscn_gen: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::{o, Discard};
    use strum::EnumCount;

    #[test]
    fn new_port_defaults() {
        let p = Port::new(Wwn(1), Wwn(2), PortId::from_raw(0x010203), 8);
        assert_eq!(p.disc_state(), DiscState::Deleted);
        assert_eq!(p.scan_state(), ScanState::Found);
        assert!(p.loop_id.is_none());
        assert_eq!(p.gens(), Generations::default());
        assert!(!p.is_busy());
    }

    #[test]
    fn exchange_ownership_snapshots_generations() {
        let mut p = Port::new(Wwn(1), Wwn(2), PortId::from_raw(0x010203), 8);
        p.login_gen = 5;
        p.rscn_gen = 2;
        p.take_exchange(ExchangeId(7));
        assert!(p.is_busy());
        assert_eq!(p.owner, Some(ExchangeId(7)));
        assert_eq!((p.last_login_gen, p.last_rscn_gen), (5, 2));
        p.release_exchange();
        assert!(!p.is_busy());
        assert_eq!(p.owner, None);
    }

    #[test]
    fn state_transitions() {
        let log = slog::Logger::root(Discard, o!());
        let mut p = Port::new(Wwn(1), Wwn(2), PortId::from_raw(0x010203), 8);
        p.set_disc_state(&log, DiscState::GetNameList);
        assert!(p.disc_state().is_live());
        p.set_disc_state(&log, DiscState::DeletePending);
        assert!(!p.disc_state().is_live());
        assert_eq!(DiscState::COUNT, 9);
    }

    #[test]
    fn lost_exemptions() {
        let mut p = Port::new(Wwn(1), Wwn(2), PortId::from_raw(0x010203), 8);
        assert!(p.removable_when_lost());
        p.flags |= PortFlags::FCP2_DEVICE;
        assert!(!p.removable_when_lost());
        p.flags.remove(PortFlags::FCP2_DEVICE);
        p.port_type = PortType::Initiator;
        assert!(!p.removable_when_lost());
    }
}
