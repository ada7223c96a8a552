// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Choice of FC-4 protocol for process login.

use crate::config::Fc4Priority;
use crate::types::Fc4Types;

/// Picks the protocol requested by each PRLI attempt to a port.
pub trait Fc4Policy: Send + Sync + 'static {
    /// `supported` is what the port advertised; `failures` counts PRLI
    /// attempts to it that have failed since its last successful login.
    fn prli_choice(&self, supported: Fc4Types, failures: u8) -> Fc4Types;
}

/// Start with the configured priority and swap protocols after every
/// failure, for ports that support both.
#[derive(Copy, Clone, Debug)]
pub struct AlternatingPolicy {
    pub priority: Fc4Priority,
}

impl AlternatingPolicy {
    pub fn new(priority: Fc4Priority) -> Self {
        Self { priority }
    }
}

impl Fc4Policy for AlternatingPolicy {
    fn prli_choice(&self, supported: Fc4Types, failures: u8) -> Fc4Types {
        let (first, second) = match self.priority {
            Fc4Priority::Fcp => (Fc4Types::FCP, Fc4Types::NVME),
            Fc4Priority::Nvme => (Fc4Types::NVME, Fc4Types::FCP),
        };
        match (supported.contains(first), supported.contains(second)) {
            (true, true) if failures % 2 == 1 => second,
            (true, _) => first,
            (false, true) => second,
            (false, false) => Fc4Types::FCP,
        }
    }
}
