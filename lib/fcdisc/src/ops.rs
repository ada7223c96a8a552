// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the world outside the discovery core.
//!
//! The adapter firmware, link control, DMA memory, the upper session layer,
//! and time are all reached through the traits here so that the state
//! machines can be driven by a simulated fabric in tests.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::exchange::{Command, ExchangeId};
use crate::port::PortInfo;
use crate::types::Topology;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FwError {
    #[error("firmware is busy")]
    Busy,
    #[error("request queue is full")]
    QueueFull,
    #[error("firmware command failed: {0}")]
    Failed(String),
}

/// Submission path into the adapter firmware.
///
/// Completions are not returned from these calls: the firmware reports them
/// later through [`crate::FcHost::on_exchange_complete`], possibly from
/// another thread, possibly before `issue` even returns.
pub trait FirmwareOps: Send + Sync + 'static {
    fn issue(&self, id: ExchangeId, cmd: &Command) -> Result<(), FwError>;

    /// Ask the firmware to abort `target`.  The abort itself is tracked as
    /// exchange `id` and completes like any other.
    fn abort(&self, id: ExchangeId, target: ExchangeId) -> Result<(), FwError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum ResetKind {
    /// Re-initialize the link without resetting the adapter.
    Link,
    /// Full adapter reset.
    Chip,
}

pub trait LinkOps: Send + Sync + 'static {
    fn current_topology(&self) -> Option<Topology>;
    fn link_is_online(&self) -> bool;
    fn request_reset(&self, kind: ResetKind);
}

/// Handle to a DMA-able buffer the firmware fills with a command's reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DmaBuf {
    pub handle: u64,
    pub size: usize,
}

pub trait DmaOps: Send + Sync + 'static {
    fn alloc(&self, size: usize) -> Option<DmaBuf>;
    fn free(&self, buf: DmaBuf);
}

/// Upper layer which exposes logged-in ports (to SCSI or NVMe).
///
/// These are called without any discovery lock held; implementations may
/// call back into the host.
pub trait SessionOps: Send + Sync + 'static {
    fn register_port_ready(&self, port: &PortInfo);
    fn unregister_port(&self, port: &PortInfo);
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Bundle of everything an [`crate::FcHost`] needs from its environment.
#[derive(Clone)]
pub struct HostOps {
    pub fw: Arc<dyn FirmwareOps>,
    pub link: Arc<dyn LinkOps>,
    pub dma: Arc<dyn DmaOps>,
    pub sessions: Arc<dyn SessionOps>,
    pub clock: Arc<dyn Clock>,
}
