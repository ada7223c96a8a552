// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric and loop port discovery for a Fibre Channel host bus adapter.
//!
//! An [`FcHost`] finds remote ports over whatever topology the link comes up
//! in (private loop, point-to-point, public loop, or switched fabric), drives
//! each of them through login, keeps a registry of what it found, and
//! revalidates or tears down those ports as the fabric reports changes.  All
//! firmware interaction happens through asynchronous exchanges whose
//! completions are fed back via [`FcHost::on_exchange_complete`].

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod config;
pub mod dispatch;
pub mod discovery;
pub mod exchange;
pub mod host;
pub mod login;
pub mod loop_id;
pub mod ops;
pub mod port;
pub mod registry;
pub mod types;
pub mod util;


pub use config::HostConfig;
pub use host::{FcHost, LocalPort};
pub use port::{DiscState, PortInfo};
pub use types::{LoopId, PortId, Topology, Wwn};

pub fn version() -> &'static str {
    concat!("v", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_version() {
        let v = version();
        eprintln!("fcdisc {v}");
        assert!(v.contains(env!("CARGO_PKG_VERSION")));
    }
}
