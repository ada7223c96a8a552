// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Set of known remote ports.
//!
//! Ports live in an arena of generation-tagged slots.  A [`PortHandle`] names
//! a slot *and* the generation it was issued for, so a handle held by an
//! outstanding exchange simply stops resolving once its port is destroyed
//! and the slot is reused.  That is what lets completions for ports that no
//! longer exist be dropped without any dangling reference.

use std::collections::BTreeMap;
use std::fmt;

use crate::port::{DiscState, Port};
use crate::types::{LoopId, PortId, Wwn};

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle {
    index: u32,
    gen: u32,
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortHandle({}.{})", self.index, self.gen)
    }
}

struct Slot {
    gen: u32,
    port: Option<Port>,
}

#[derive(Default)]
pub struct PortRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Newest record for each WWPN.  Superseded records stay in the arena
    /// until their teardown completes, but are no longer found by name.
    by_wwn: BTreeMap<Wwn, PortHandle>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port, making it the record found for its WWPN.
    pub fn insert(&mut self, port: Port) -> PortHandle {
        let wwn = port.port_name;
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.port = Some(port);
                PortHandle { index, gen: slot.gen }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { gen: 0, port: Some(port) });
                PortHandle { index, gen: 0 }
            }
        };
        self.by_wwn.insert(wwn, handle);
        handle
    }

    /// Destroy a port.  Every outstanding copy of `handle` stops resolving.
    pub fn remove(&mut self, handle: PortHandle) -> Option<Port> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.gen != handle.gen {
            return None;
        }
        let port = slot.port.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(handle.index);
        if self.by_wwn.get(&port.port_name) == Some(&handle) {
            self.by_wwn.remove(&port.port_name);
        }
        Some(port)
    }

    pub fn get(&self, handle: PortHandle) -> Option<&Port> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.gen != handle.gen {
            return None;
        }
        slot.port.as_ref()
    }

    pub fn get_mut(&mut self, handle: PortHandle) -> Option<&mut Port> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.gen != handle.gen {
            return None;
        }
        slot.port.as_mut()
    }

    pub fn contains(&self, handle: PortHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn find_by_wwn(&self, wwn: Wwn) -> Option<PortHandle> {
        self.by_wwn.get(&wwn).copied()
    }

    /// A port other than `except` at `port_id` that is still live.
    pub fn find_live_by_port_id(
        &self,
        port_id: PortId,
        except: Option<PortHandle>,
    ) -> Option<PortHandle> {
        self.iter()
            .find(|(h, p)| {
                Some(*h) != except
                    && p.port_id == port_id
                    && p.disc_state().is_live()
            })
            .map(|(h, _)| h)
    }

    /// A port other than `except` that still holds on to `port_id`: live,
    /// tearing down, or owning a loop ID or an exchange.  Live ports come
    /// first.
    pub fn find_claimant_by_port_id(
        &self,
        port_id: PortId,
        except: PortHandle,
    ) -> Option<PortHandle> {
        if port_id.is_zero() {
            return None;
        }
        let mut found = None;
        let at = self
            .iter()
            .filter(|(h, p)| *h != except && p.port_id == port_id);
        for (h, p) in at {
            if p.disc_state().is_live() {
                return Some(h);
            }
            let claims = p.disc_state() == DiscState::DeletePending
                || p.is_busy()
                || !p.loop_id.is_none();
            if claims {
                found.get_or_insert(h);
            }
        }
        found
    }

    /// Any port at `port_id`, torn down or not, preferring the current
    /// record for its WWPN.
    pub fn find_by_port_id(&self, port_id: PortId) -> Option<PortHandle> {
        let mut found = None;
        for (h, p) in self.iter().filter(|(_, p)| p.port_id == port_id) {
            if self.by_wwn.get(&p.port_name) == Some(&h) {
                return Some(h);
            }
            found.get_or_insert(h);
        }
        found
    }

    /// A port other than `except` that is live and holds `loop_id`.
    pub fn find_live_by_loop_id(
        &self,
        loop_id: LoopId,
        except: Option<PortHandle>,
    ) -> Option<PortHandle> {
        if loop_id.is_none() {
            return None;
        }
        self.iter()
            .find(|(h, p)| {
                Some(*h) != except
                    && p.loop_id == loop_id
                    && p.disc_state().is_live()
            })
            .map(|(h, _)| h)
    }

    /// Whether any port besides `except`, torn down or not, still records
    /// `loop_id`.
    pub fn loop_id_shared(&self, loop_id: LoopId, except: PortHandle) -> bool {
        !loop_id.is_none()
            && self.iter().any(|(h, p)| h != except && p.loop_id == loop_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortHandle, &Port)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.port.as_ref().map(|p| {
                (PortHandle { index: index as u32, gen: slot.gen }, p)
            })
        })
    }

    /// Snapshot of current handles.  Walk this (re-resolving each handle)
    /// when the loop body may add or destroy ports.
    pub fn handles(&self) -> Vec<PortHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.port.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::{o, Discard, Logger};

    fn port(wwn: u64, pid: u32) -> Port {
        Port::new(Wwn(wwn), Wwn(wwn + 1), PortId::from_raw(pid), 8)
    }

    #[test]
    fn tombstoned_handles_stop_resolving() {
        let mut reg = PortRegistry::new();
        let a = reg.insert(port(0x10, 0x010100));
        assert!(reg.contains(a));
        assert!(reg.remove(a).is_some());
        assert!(!reg.contains(a));
        assert!(reg.remove(a).is_none());

        // Slot reuse hands out a different generation.
        let b = reg.insert(port(0x20, 0x010200));
        assert_ne!(a, b);
        assert!(reg.get(a).is_none());
        assert_eq!(reg.get(b).unwrap().port_name, Wwn(0x20));
    }

    #[test]
    fn wwn_index_tracks_newest() {
        let mut reg = PortRegistry::new();
        let old = reg.insert(port(0x10, 0x010100));
        let new = reg.insert(port(0x10, 0x010200));
        assert_eq!(reg.find_by_wwn(Wwn(0x10)), Some(new));

        // Destroying the superseded record leaves the index alone.
        reg.remove(old);
        assert_eq!(reg.find_by_wwn(Wwn(0x10)), Some(new));
        reg.remove(new);
        assert_eq!(reg.find_by_wwn(Wwn(0x10)), None);
    }

    #[test]
    fn lookup_by_address() {
        let log = Logger::root(Discard, o!());
        let mut reg = PortRegistry::new();
        let pid = PortId::from_raw(0x010100);
        let a = reg.insert(port(0x10, pid.raw()));
        let b = reg.insert(port(0x20, pid.raw()));

        // Both start Deleted, so neither is live.
        assert_eq!(reg.find_live_by_port_id(pid, None), None);
        reg.get_mut(a).unwrap().set_disc_state(&log, DiscState::GetNameList);
        assert_eq!(reg.find_live_by_port_id(pid, None), Some(a));
        assert_eq!(reg.find_live_by_port_id(pid, Some(a)), None);
        assert!(reg.find_by_port_id(pid).is_some());

        reg.get_mut(b).unwrap().loop_id = LoopId(4);
        assert!(reg.loop_id_shared(LoopId(4), a));
        assert!(!reg.loop_id_shared(LoopId(4), b));
        assert_eq!(reg.find_live_by_loop_id(LoopId(4), None), None);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.handles().len(), 2);
    }

    #[test]
    fn address_claimants() {
        let log = Logger::root(Discard, o!());
        let mut reg = PortRegistry::new();
        let pid = PortId::from_raw(0x0000e8);
        let a = reg.insert(port(0x10, pid.raw()));
        let b = reg.insert(port(0x20, pid.raw()));
        let c = reg.insert(port(0x30, pid.raw()));

        // Idle records with nothing allocated hold no claim.
        assert_eq!(reg.find_claimant_by_port_id(pid, a), None);

        reg.get_mut(b).unwrap().set_disc_state(&log, DiscState::DeletePending);
        assert_eq!(reg.find_claimant_by_port_id(pid, a), Some(b));

        // A live record wins over one being torn down.
        reg.get_mut(c).unwrap().set_disc_state(&log, DiscState::LoginPending);
        assert_eq!(reg.find_claimant_by_port_id(pid, a), Some(c));
        assert_eq!(reg.find_claimant_by_port_id(pid, c), Some(b));

        reg.get_mut(b).unwrap().set_disc_state(&log, DiscState::Deleted);
        reg.get_mut(b).unwrap().loop_id = LoopId(7);
        assert_eq!(reg.find_claimant_by_port_id(pid, c), Some(b));
        assert_eq!(reg.find_claimant_by_port_id(PortId::from_raw(0), c), None);
    }
}
