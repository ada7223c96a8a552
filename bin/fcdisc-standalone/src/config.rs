// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fcdisc::types::{Fc4Types, PortType};
use fcdisc::{HostConfig, LocalPort, PortId, Topology, Wwn};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub main: Main,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default, rename = "port")]
    pub ports: BTreeMap<String, SimPort>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Main {
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    pub port_id: PortId,
    pub topology: Topology,

    /// Link starts out down and comes up after this many milliseconds.
    ///
    /// Default: 0, link is up at start
    #[serde(default)]
    pub link_up_delay_ms: u64,
}
impl Main {
    pub fn local(&self) -> LocalPort {
        LocalPort { wwpn: self.wwpn, wwnn: self.wwnn, port_id: self.port_id }
    }
}

/// A remote port attached to the simulated fabric.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimPort {
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    pub port_id: PortId,

    #[serde(default = "default_true")]
    pub fcp: bool,
    #[serde(default)]
    pub nvme: bool,

    #[serde(default = "default_port_type")]
    pub port_type: PortType,

    /// Reject this many PLOGIs before accepting one.
    #[serde(default)]
    pub login_failures: u32,
}
impl SimPort {
    pub fn fc4_types(&self) -> Fc4Types {
        let mut fc4 = Fc4Types::empty();
        fc4.set(Fc4Types::FCP, self.fcp);
        fc4.set(Fc4Types::NVME, self.nvme);
        fc4
    }
}

fn default_true() -> bool {
    true
}

fn default_port_type() -> PortType {
    PortType::Target
}

pub fn parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;
    let config = toml::from_str::<Config>(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )?;
    config.host.validate().context("invalid [host] section")?;
    Ok(config)
}
