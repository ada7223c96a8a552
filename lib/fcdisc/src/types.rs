// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fibre Channel addressing primitives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// World Wide Name: the 64-bit identity of a port or node, which stays with
/// the device regardless of where it is plugged in.
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Wwn(pub u64);

impl Wwn {
    pub const NONE: Wwn = Wwn(0);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Debug for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wwn({self})")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid WWN {0:?}: expected 16 hex digits")]
pub struct ParseWwnError(String);

impl FromStr for Wwn {
    type Err = ParseWwnError;

    /// Accepts both the colon-separated form and a bare run of 16 hex digits,
    /// with or without a leading `0x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .trim_start_matches("0x")
            .chars()
            .filter(|c| *c != ':')
            .collect();
        if digits.len() != 16 {
            return Err(ParseWwnError(s.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(Wwn)
            .map_err(|_| ParseWwnError(s.to_string()))
    }
}

impl TryFrom<String> for Wwn {
    type Error = ParseWwnError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Wwn> for String {
    fn from(value: Wwn) -> Self {
        value.to_string()
    }
}

/// 24-bit fabric address: domain, area, and arbitrated-loop physical address.
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PortId(u32);

impl PortId {
    pub const ZERO: PortId = PortId(0);
    /// Well-known address of the fabric name server.
    pub const NAME_SERVER: PortId = PortId(0xfffffc);

    pub const fn new(domain: u8, area: u8, al_pa: u8) -> Self {
        PortId((domain as u32) << 16 | (area as u32) << 8 | al_pa as u32)
    }
    pub const fn from_raw(raw: u32) -> Self {
        PortId(raw & 0xff_ffff)
    }
    pub const fn raw(self) -> u32 {
        self.0
    }
    pub const fn domain(self) -> u8 {
        (self.0 >> 16) as u8
    }
    pub const fn area(self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub const fn al_pa(self) -> u8 {
        self.0 as u8
    }
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Addresses in the `FF.Fx.xx` block belong to fabric services (name
    /// server, fabric controller, and the like) rather than to devices.
    pub const fn is_sw_reserved(self) -> bool {
        self.0 & 0xfff000 == 0xfff000
    }

    /// Domains `Fx` are never assigned to loop devices.
    pub const fn is_reserved_domain(self) -> bool {
        self.domain() & 0xf0 == 0xf0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({self})")
    }
}

/// Adapter-local handle used to address a logged-in remote port.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub u16);

impl LoopId {
    /// Sentinel meaning "no handle held".
    pub const NONE: LoopId = LoopId(u16::MAX);

    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

impl fmt::Debug for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopId({self})")
    }
}

impl Serialize for LoopId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if self.is_none() {
            s.serialize_none()
        } else {
            s.serialize_some(&self.0)
        }
    }
}

/// How the adapter's link came up.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Topology {
    /// Arbitrated loop with no fabric attachment.
    PrivateLoop,
    /// Direct N_Port to N_Port link.
    PointToPoint,
    /// Arbitrated loop with an FL_Port into a fabric.
    PublicLoop,
    /// Attached to a switch F_Port.
    Fabric,
}

impl Topology {
    pub const fn is_n2n(self) -> bool {
        matches!(self, Topology::PointToPoint)
    }

    /// Whether remote ports are found through the fabric name server.
    pub const fn has_name_server(self) -> bool {
        matches!(self, Topology::PublicLoop | Topology::Fabric)
    }
}

bitflags! {
    /// FC-4 protocols a remote port advertises (or we negotiate with it).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Fc4Types: u8 {
        const FCP = 1 << 0;
        const NVME = 1 << 1;
    }
}

impl Serialize for Fc4Types {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let names: Vec<&str> = self.iter_names().map(|(n, _)| n).collect();
        names.serialize(s)
    }
}

/// Role of a remote port as reported by its process login parameters.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum PortType {
    #[default]
    Unknown,
    Initiator,
    Target,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wwn_parse_forms() {
        let want = Wwn(0x2100_0024_ff12_3456);
        assert_eq!("21:00:00:24:ff:12:34:56".parse::<Wwn>(), Ok(want));
        assert_eq!("21000024ff123456".parse::<Wwn>(), Ok(want));
        assert_eq!("0x21000024ff123456".parse::<Wwn>(), Ok(want));
        assert!("21:00".parse::<Wwn>().is_err());
        assert!("zz000024ff123456".parse::<Wwn>().is_err());
        assert_eq!(want.to_string(), "21:00:00:24:ff:12:34:56");
    }

    #[test]
    fn port_id_fields() {
        let pid = PortId::new(0x01, 0x02, 0xef);
        assert_eq!(pid.raw(), 0x0102ef);
        assert_eq!((pid.domain(), pid.area(), pid.al_pa()), (1, 2, 0xef));
        assert_eq!(PortId::from_raw(0xff0102ef), pid);
        assert_eq!(pid.to_string(), "0102ef");
    }

    #[test]
    fn reserved_addresses() {
        assert!(PortId::NAME_SERVER.is_sw_reserved());
        assert!(PortId::from_raw(0xfff001).is_sw_reserved());
        assert!(!PortId::from_raw(0xffe001).is_sw_reserved());
        assert!(PortId::from_raw(0xf00001).is_reserved_domain());
        assert!(!PortId::from_raw(0x010001).is_reserved_domain());
    }

    #[test]
    fn loop_id_none() {
        assert!(LoopId::default().is_none());
        assert!(!LoopId(0x81).is_none());
        assert_eq!(LoopId::NONE.to_string(), "none");
    }
}
