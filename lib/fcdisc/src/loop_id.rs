// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocation of adapter-local port handles (loop IDs).

use std::sync::Mutex;

use bitvec::prelude::*;
use thiserror::Error;

use crate::config::HandleSpace;
use crate::types::LoopId;

/// Size of the extended N_Port handle space.
pub const EXTENDED_HANDLES: usize = 0x800;
/// Last handle usable for a remote port in the extended space.
pub const NPH_LAST_HANDLE: u16 = 0x7ee;
pub const NPH_MGMT_SERVER: u16 = 0x7ef;
pub const NPH_SNS: u16 = 0x7fc;
pub const NPH_FABRIC_CONTROLLER: u16 = 0x7fd;
pub const NPH_F_PORT: u16 = 0x7fe;
pub const NPH_BROADCAST: u16 = 0x7ff;

/// Size of the legacy 8-bit loop ID space.
pub const LEGACY_HANDLES: usize = 0x100;
pub const LEGACY_LAST_LOCAL_LOOP_ID: u16 = 0x7d;
pub const LEGACY_SNS_FIRST_LOOP_ID: u16 = 0x81;
pub const LEGACY_MANAGEMENT_SERVER: u16 = 0xfe;
pub const LEGACY_BROADCAST: u16 = 0xff;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("no free loop IDs remain")]
pub struct OutOfHandles;

/// Bitmap of loop IDs in use, shared by everything that logs ports in.
///
/// Reserved IDs are marked in-use at construction and can never be handed
/// out or released.
pub struct LoopIdAllocator {
    space: HandleSpace,
    map: Mutex<BitVec<u64, Lsb0>>,
}

impl LoopIdAllocator {
    pub fn new(space: HandleSpace) -> Self {
        let len = match space {
            HandleSpace::Extended => EXTENDED_HANDLES,
            HandleSpace::Legacy { .. } => LEGACY_HANDLES,
        };
        let mut map = bitvec![u64, Lsb0; 0; len];
        for id in 0..len {
            if is_reserved(space, id as u16) {
                map.set(id, true);
            }
        }
        Self { space, map: Mutex::new(map) }
    }

    /// Whether `id` belongs to fabric services or lies outside the usable
    /// range for this handle space.
    pub fn is_reserved(&self, id: LoopId) -> bool {
        is_reserved(self.space, id.0)
    }

    /// Hand out the lowest free, non-reserved loop ID.
    pub fn allocate(&self) -> Result<LoopId, OutOfHandles> {
        let mut map = self.map.lock().unwrap();
        let idx = map.first_zero().ok_or(OutOfHandles)?;
        map.set(idx, true);
        Ok(LoopId(idx as u16))
    }

    /// Return `id` to the pool.  Releasing a free, reserved, or `NONE` ID
    /// does nothing.
    pub fn release(&self, id: LoopId) {
        if id.is_none() || self.is_reserved(id) {
            return;
        }
        let idx = id.0 as usize;
        let mut map = self.map.lock().unwrap();
        if idx < map.len() {
            map.set(idx, false);
        }
    }

    /// Mark an ID the firmware assigned on its own as in use.  Returns false
    /// if the ID is reserved (and thus cannot belong to a remote port).
    pub fn claim(&self, id: LoopId) -> bool {
        if id.is_none() || self.is_reserved(id) {
            return false;
        }
        let idx = id.0 as usize;
        let mut map = self.map.lock().unwrap();
        if idx >= map.len() {
            return false;
        }
        map.set(idx, true);
        true
    }

    pub fn in_use(&self, id: LoopId) -> bool {
        let map = self.map.lock().unwrap();
        map.get(id.0 as usize).map(|b| *b).unwrap_or(true)
    }

    pub fn free_count(&self) -> usize {
        self.map.lock().unwrap().count_zeros()
    }
}

fn is_reserved(space: HandleSpace, id: u16) -> bool {
    match space {
        HandleSpace::Extended => id > NPH_LAST_HANDLE,
        HandleSpace::Legacy { max_loop_id } => {
            (id > max_loop_id && id < LEGACY_SNS_FIRST_LOOP_ID)
                || id == LEGACY_MANAGEMENT_SERVER
                || id >= LEGACY_BROADCAST
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lowest_free_first() {
        let alloc = LoopIdAllocator::new(HandleSpace::Extended);
        assert_eq!(alloc.allocate(), Ok(LoopId(0)));
        assert_eq!(alloc.allocate(), Ok(LoopId(1)));
        assert_eq!(alloc.allocate(), Ok(LoopId(2)));
        alloc.release(LoopId(1));
        assert_eq!(alloc.allocate(), Ok(LoopId(1)));
        assert_eq!(alloc.allocate(), Ok(LoopId(3)));
    }

    #[test]
    fn reserved_never_allocated() {
        let alloc = LoopIdAllocator::new(HandleSpace::Extended);
        for id in [NPH_MGMT_SERVER, NPH_SNS, NPH_F_PORT, NPH_BROADCAST] {
            assert!(alloc.is_reserved(LoopId(id)));
        }
        assert!(!alloc.is_reserved(LoopId(NPH_LAST_HANDLE)));

        let usable = NPH_LAST_HANDLE as usize + 1;
        assert_eq!(alloc.free_count(), usable);
        for expect in 0..usable {
            assert_eq!(alloc.allocate(), Ok(LoopId(expect as u16)));
        }
        assert_eq!(alloc.allocate(), Err(OutOfHandles));

        // Releasing a reserved ID must not make it allocatable.
        alloc.release(LoopId(NPH_SNS));
        assert_eq!(alloc.allocate(), Err(OutOfHandles));
    }

    #[test]
    fn legacy_gaps() {
        let alloc = LoopIdAllocator::new(HandleSpace::Legacy {
            max_loop_id: LEGACY_LAST_LOCAL_LOOP_ID,
        });
        assert!(alloc.is_reserved(LoopId(0x7e)));
        assert!(alloc.is_reserved(LoopId(0x80)));
        assert!(!alloc.is_reserved(LoopId(0x81)));
        assert!(alloc.is_reserved(LoopId(LEGACY_MANAGEMENT_SERVER)));
        assert!(alloc.is_reserved(LoopId(LEGACY_BROADCAST)));

        for _ in 0..=LEGACY_LAST_LOCAL_LOOP_ID {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.allocate(), Ok(LoopId(LEGACY_SNS_FIRST_LOOP_ID)));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = LoopIdAllocator::new(HandleSpace::Extended);
        let before = alloc.free_count();
        let id = alloc.allocate().unwrap();
        alloc.release(id);
        alloc.release(id);
        alloc.release(LoopId::NONE);
        assert_eq!(alloc.free_count(), before);
        assert!(!alloc.in_use(id));
    }

    #[test]
    fn claim_firmware_assigned() {
        let alloc = LoopIdAllocator::new(HandleSpace::Extended);
        assert!(alloc.claim(LoopId(0)));
        assert!(alloc.in_use(LoopId(0)));
        assert_eq!(alloc.allocate(), Ok(LoopId(1)));
        assert!(!alloc.claim(LoopId(NPH_SNS)));
        assert!(!alloc.claim(LoopId::NONE));
    }
}
