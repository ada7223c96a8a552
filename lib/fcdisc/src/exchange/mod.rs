// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous exchanges with the adapter firmware.

use std::fmt;

use thiserror::Error;

use crate::ops::{DmaBuf, FwError};
use crate::port::FwLoginState;
use crate::types::{Fc4Types, LoopId, PortId, PortType, Wwn};

mod tracker;

pub use tracker::{ExchangeTracker, NoneOutstanding};
pub(crate) use tracker::{Finished, Request, Waiter};

#[usdt::provider(provider = "fcdisc")]
mod probes {
    fn exchange_issue(xid: u32, kind: u8, port_id: u32) {}
    fn exchange_complete(xid: u32, kind: u8, status: u8, proc_ns: u64) {}
    fn exchange_timeout(xid: u32, kind: u8) {}
    fn exchange_reclaim(xid: u32, kind: u8) {}
}

/// Identifier for an exchange, unique among those outstanding on a host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(pub u32);

impl ExchangeId {
    const START: Self = ExchangeId(1);

    fn advance(&mut self) {
        self.0 = self.0.checked_add(1).unwrap_or(Self::START.0);
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr, strum::Display,
)]
#[repr(u8)]
pub enum ExchangeKind {
    Login,
    Logout,
    Prli,
    Adisc,
    GetNameList,
    GetPortDatabase,
    GetIdList,
    NameServer,
    Abort,
    TaskMgmt,
}

impl ExchangeKind {
    /// Kinds that drive a port's login state.  A port may have only one of
    /// these outstanding at a time.
    pub const fn is_port_exclusive(self) -> bool {
        matches!(
            self,
            ExchangeKind::Login
                | ExchangeKind::Logout
                | ExchangeKind::Prli
                | ExchangeKind::Adisc
                | ExchangeKind::GetNameList
                | ExchangeKind::GetPortDatabase
        )
    }

    /// Size of the reply buffer the firmware needs, for kinds that return
    /// bulk data.
    pub const fn reply_size(self) -> Option<usize> {
        match self {
            ExchangeKind::GetNameList => Some(NAME_LIST_ENTRIES * 64),
            ExchangeKind::GetPortDatabase => Some(64),
            ExchangeKind::GetIdList => Some(ID_LIST_ENTRIES * 8),
            ExchangeKind::NameServer => Some(NAME_LIST_ENTRIES * 16),
            _ => None,
        }
    }
}

const NAME_LIST_ENTRIES: usize = 2048;
const ID_LIST_ENTRIES: usize = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskMgmtKind {
    AbortTaskSet,
    ClearTaskSet,
    LunReset,
    TargetReset,
}

/// Name server query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NsQuery {
    /// All ports registered for any of the given FC-4 types.
    ByType(Fc4Types),
    /// The single port following the given address.
    NextAfter(PortId),
}

/// What the firmware is asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// PLOGI.  `els` selects an ELS-pass-through login, used on
    /// point-to-point links.
    Login { loop_id: LoopId, port_id: PortId, els: bool },
    Logout { loop_id: LoopId, port_id: PortId },
    Prli { loop_id: LoopId, port_id: PortId, fc4: Fc4Types },
    Adisc { loop_id: LoopId, port_id: PortId },
    GetNameList { buf: DmaBuf },
    GetPortDatabase { loop_id: LoopId, buf: DmaBuf },
    GetIdList { buf: DmaBuf },
    NameServer { query: NsQuery, buf: DmaBuf },
    TaskMgmt { loop_id: LoopId, port_id: PortId, kind: TaskMgmtKind, lun: u64 },
}

impl Command {
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Command::Login { .. } => ExchangeKind::Login,
            Command::Logout { .. } => ExchangeKind::Logout,
            Command::Prli { .. } => ExchangeKind::Prli,
            Command::Adisc { .. } => ExchangeKind::Adisc,
            Command::GetNameList { .. } => ExchangeKind::GetNameList,
            Command::GetPortDatabase { .. } => ExchangeKind::GetPortDatabase,
            Command::GetIdList { .. } => ExchangeKind::GetIdList,
            Command::NameServer { .. } => ExchangeKind::NameServer,
            Command::TaskMgmt { .. } => ExchangeKind::TaskMgmt,
        }
    }

    pub fn dma(&self) -> Option<DmaBuf> {
        match self {
            Command::GetNameList { buf }
            | Command::GetPortDatabase { buf, .. }
            | Command::GetIdList { buf }
            | Command::NameServer { buf, .. } => Some(*buf),
            _ => None,
        }
    }

    pub fn port_id(&self) -> PortId {
        match self {
            Command::Login { port_id, .. }
            | Command::Logout { port_id, .. }
            | Command::Prli { port_id, .. }
            | Command::Adisc { port_id, .. }
            | Command::TaskMgmt { port_id, .. } => *port_id,
            _ => PortId::ZERO,
        }
    }
}

/// Transport-level outcome of an exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[repr(u8)]
pub enum ExchangeStatus {
    Success = 0,
    Failed,
    TimedOut,
    Aborted,
}

/// Result of a PLOGI as the firmware reports it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoginStatus {
    Complete,
    /// Rejected; `retried` is set if the firmware had already retried.
    CommandError { retried: bool },
    /// The loop ID we chose is in use by the port at `port_id`.
    LoopIdUsed { port_id: PortId },
    /// The target is already logged in under `loop_id`.
    PortIdUsed { loop_id: LoopId },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrliStatus {
    Complete,
    /// LS_RJT with "logical busy": the peer is still processing our login.
    Busy,
    Rejected,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NameListEntry {
    pub port_name: Wwn,
    pub node_name: Wwn,
    pub port_id: PortId,
    pub loop_id: LoopId,
    pub login_state: FwLoginState,
    pub port_type: PortType,
    pub fc4_types: Fc4Types,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortDatabase {
    pub login_state: FwLoginState,
    pub node_name: Wwn,
    pub port_id: PortId,
    pub port_type: PortType,
    /// Target advertised FCP-2 error recovery (tape and similar).
    pub fcp2: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdListEntry {
    pub port_id: PortId,
    pub port_name: Wwn,
    pub node_name: Wwn,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NsEntry {
    pub port_id: PortId,
    pub port_name: Wwn,
    pub node_name: Wwn,
    pub fc4_types: Fc4Types,
}

/// Decoded reply data accompanying a completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    Login(LoginStatus),
    Prli(PrliStatus),
    NameList(Vec<NameListEntry>),
    PortDatabase(PortDatabase),
    IdList(Vec<IdListEntry>),
    NameServer(Vec<NsEntry>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssueError {
    #[error("adapter link is not online")]
    NotOnline,
    #[error("port already owns outstanding exchange {0}")]
    AlreadyInFlight(ExchangeId),
    #[error("no free exchange slots")]
    NoFreeSlots,
    #[error("no DMA buffer available for {0} reply")]
    NoDmaBuffer(ExchangeKind),
    #[error("exchange {0} is not outstanding")]
    NotOutstanding(ExchangeId),
    #[error("target port no longer exists")]
    PortGone,
    #[error("firmware refused exchange: {0}")]
    Firmware(#[from] FwError),
}
