// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Record keeping for outstanding exchanges.

use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::{
    probes, Command, ExchangeId, ExchangeKind, ExchangeStatus, IssueError,
};
use crate::ops::{DmaBuf, FirmwareOps};
use crate::port::Generations;
use crate::registry::PortHandle;
use crate::types::PortId;

/// Tracking structure for exchanges issued to the firmware.
///
/// Each exchange is recorded here, tagged with a unique [`ExchangeId`], along
/// with the port it targets and the generation counters of that port at the
/// time of issue.  Completions reported by the firmware are matched back to
/// that record by id.  Exchanges which run past their timeout are aborted;
/// if the abort itself times out, both are reclaimed regardless of what the
/// firmware has to say.
///
/// The firmware is called without any tracker lock held, so it is free to
/// report a completion before `issue` returns.
pub struct ExchangeTracker {
    inner: Mutex<TrackerInner>,
    /// True while nothing is outstanding.
    idle: watch::Sender<bool>,
    capacity: usize,
}
struct TrackerInner {
    next_id: ExchangeId,
    outstanding: BTreeMap<ExchangeId, Entry>,
}
struct Entry {
    kind: ExchangeKind,
    target: Option<PortHandle>,
    gens: Generations,
    port_id: PortId,
    issued: Instant,
    timeout: Duration,
    phase: Phase,
    dma: Option<DmaBuf>,
    waiter: Option<Arc<Waiter>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    /// An abort (exchange `abort`) is outstanding for this one.  If
    /// `delivered`, its outcome was already reported as a timeout and the
    /// entry lingers only to keep its id and buffer from being reused.
    Aborting { abort: ExchangeId, delivered: bool },
    /// This entry is the abort of another exchange.
    AbortOf(ExchangeId),
}

/// Parameters for [`ExchangeTracker::issue`].
pub(crate) struct Request {
    pub cmd: Command,
    pub target: Option<(PortHandle, Generations)>,
    pub timeout: Duration,
    pub waiter: Option<Arc<Waiter>>,
}

/// An exchange which has left the tracker (or whose outcome has been
/// decided).
#[derive(Debug)]
pub(crate) struct Finished {
    pub id: ExchangeId,
    pub kind: ExchangeKind,
    pub target: Option<PortHandle>,
    pub gens: Generations,
    pub status: ExchangeStatus,
    /// Whether this outcome should reach the state machines.  Clear when it
    /// was already reported, or for aborts, which only matter to waiters.
    pub deliver: bool,
    /// Reply buffer to hand back to the allocator.
    pub dma: Option<DmaBuf>,
    pub waiter: Option<Arc<Waiter>>,
}

impl Entry {
    fn finish(
        self,
        id: ExchangeId,
        status: ExchangeStatus,
        deliver: bool,
    ) -> Finished {
        Finished {
            id,
            kind: self.kind,
            target: self.target,
            gens: self.gens,
            status,
            deliver,
            dma: self.dma,
            waiter: self.waiter,
        }
    }
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued) >= self.timeout
    }
}

impl TrackerInner {
    fn alloc_id(&mut self) -> ExchangeId {
        loop {
            let id = self.next_id;
            self.next_id.advance();
            if !self.outstanding.contains_key(&id) {
                return id;
            }
        }
    }
}

impl ExchangeTracker {
    pub fn new(capacity: usize) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Mutex::new(TrackerInner {
                next_id: ExchangeId::START,
                outstanding: BTreeMap::new(),
            }),
            idle,
            capacity,
        }
    }

    /// Record and submit an exchange.
    ///
    /// On error nothing remains tracked, and any reply buffer in the command
    /// is still the caller's to free.
    pub(crate) fn issue(
        &self,
        fw: &dyn FirmwareOps,
        online: bool,
        req: Request,
        now: Instant,
    ) -> Result<ExchangeId, IssueError> {
        if !online {
            return Err(IssueError::NotOnline);
        }
        let kind = req.cmd.kind();
        let id = {
            let mut guard = self.inner.lock().unwrap();
            let active = guard
                .outstanding
                .values()
                .filter(|e| !matches!(e.phase, Phase::AbortOf(_)))
                .count();
            if active >= self.capacity {
                return Err(IssueError::NoFreeSlots);
            }
            if let (true, Some((handle, _))) =
                (kind.is_port_exclusive(), req.target)
            {
                let conflict = guard.outstanding.iter().find(|(_, e)| {
                    e.target == Some(handle)
                        && e.kind.is_port_exclusive()
                        && e.phase == Phase::Active
                });
                if let Some((other, _)) = conflict {
                    return Err(IssueError::AlreadyInFlight(*other));
                }
            }

            let began_empty = guard.outstanding.is_empty();
            let id = guard.alloc_id();
            let (target, gens) = match req.target {
                Some((h, g)) => (Some(h), g),
                None => (None, Generations::default()),
            };
            guard.outstanding.insert(
                id,
                Entry {
                    kind,
                    target,
                    gens,
                    port_id: req.cmd.port_id(),
                    issued: now,
                    timeout: req.timeout,
                    phase: Phase::Active,
                    dma: req.cmd.dma(),
                    waiter: req.waiter,
                },
            );
            if began_empty {
                self.idle.send_replace(false);
            }
            id
        };

        probes::exchange_issue!(|| (id.0, kind as u8, req.cmd.port_id().raw()));
        if let Err(e) = fw.issue(id, &req.cmd) {
            self.forget(id);
            return Err(e.into());
        }
        Ok(id)
    }

    /// Drop an entry without producing an outcome.
    fn forget(&self, id: ExchangeId) {
        let mut guard = self.inner.lock().unwrap();
        guard.outstanding.remove(&id);
        if guard.outstanding.is_empty() {
            self.idle.send_replace(true);
        }
    }

    /// Account for a completion reported by the firmware.
    ///
    /// Returns nothing if `id` is not outstanding, which is the case for
    /// duplicate completions and for exchanges already reclaimed after a
    /// timeout.
    pub(crate) fn complete(
        &self,
        id: ExchangeId,
        status: ExchangeStatus,
        now: Instant,
    ) -> Vec<Finished> {
        let mut guard = self.inner.lock().unwrap();
        let Some(entry) = guard.outstanding.remove(&id) else {
            return Vec::new();
        };
        let proc_ns =
            now.saturating_duration_since(entry.issued).as_nanos() as u64;
        probes::exchange_complete!(|| (
            id.0,
            entry.kind as u8,
            status as u8,
            proc_ns
        ));

        let mut out = Vec::with_capacity(2);
        match entry.phase {
            Phase::Active => out.push(entry.finish(id, status, true)),
            Phase::Aborting { delivered, .. } => {
                // The original finished on its own despite the abort.  Its
                // abort stays tracked until it too completes or times out.
                let status =
                    if delivered { ExchangeStatus::TimedOut } else { status };
                out.push(entry.finish(id, status, !delivered));
            }
            Phase::AbortOf(orig) => {
                out.push(entry.finish(id, status, false));
                if let Some(f) = Self::take_aborted(
                    &mut guard,
                    orig,
                    id,
                    ExchangeStatus::Aborted,
                ) {
                    out.push(f);
                }
            }
        }

        if guard.outstanding.is_empty() {
            self.idle.send_replace(true);
        }
        out
    }

    /// Remove `orig` if it is still waiting on abort `abort`.
    fn take_aborted(
        guard: &mut TrackerInner,
        orig: ExchangeId,
        abort: ExchangeId,
        status: ExchangeStatus,
    ) -> Option<Finished> {
        let delivered = match guard.outstanding.get(&orig)?.phase {
            Phase::Aborting { abort: a, delivered } if a == abort => delivered,
            _ => return None,
        };
        let entry = guard.outstanding.remove(&orig)?;
        let status = if delivered { ExchangeStatus::TimedOut } else { status };
        Some(entry.finish(orig, status, !delivered))
    }

    /// Handle every exchange which has outlived its timeout.
    ///
    /// An expired exchange is reported as timed out right away and an abort
    /// is issued for it; the original keeps its slot until that abort
    /// resolves.  Should the abort also expire, both are reclaimed.
    pub(crate) fn expire(
        &self,
        fw: &dyn FirmwareOps,
        now: Instant,
    ) -> Vec<Finished> {
        let (timed_out, stale_aborts) = {
            let guard = self.inner.lock().unwrap();
            let mut timed_out = Vec::new();
            let mut stale_aborts = Vec::new();
            for (id, e) in guard.outstanding.iter() {
                if !e.expired(now) {
                    continue;
                }
                match e.phase {
                    Phase::Active => timed_out.push(*id),
                    Phase::AbortOf(_) => stale_aborts.push(*id),
                    Phase::Aborting { .. } => {}
                }
            }
            (timed_out, stale_aborts)
        };

        let mut out = Vec::new();
        for abort in stale_aborts {
            let mut guard = self.inner.lock().unwrap();
            let Some(entry) = guard.outstanding.remove(&abort) else {
                continue;
            };
            let Phase::AbortOf(orig) = entry.phase else {
                continue;
            };
            probes::exchange_reclaim!(|| (abort.0, entry.kind as u8));
            out.push(entry.finish(abort, ExchangeStatus::TimedOut, false));
            if let Some(f) = Self::take_aborted(
                &mut guard,
                orig,
                abort,
                ExchangeStatus::TimedOut,
            ) {
                probes::exchange_reclaim!(|| (orig.0, f.kind as u8));
                out.push(f);
            }
            if guard.outstanding.is_empty() {
                self.idle.send_replace(true);
            }
        }

        for id in timed_out {
            if let Some(f) = self.time_out(fw, id, now) {
                out.push(f);
            }
        }
        out
    }

    fn time_out(
        &self,
        fw: &dyn FirmwareOps,
        id: ExchangeId,
        now: Instant,
    ) -> Option<Finished> {
        let abort = self.start_abort(fw, id, now, None, true);
        let mut guard = self.inner.lock().unwrap();
        let res = match abort {
            Ok(_) => {
                let entry = guard.outstanding.get_mut(&id)?;
                probes::exchange_timeout!(|| (id.0, entry.kind as u8));
                Some(Finished {
                    id,
                    kind: entry.kind,
                    target: entry.target,
                    gens: entry.gens,
                    status: ExchangeStatus::TimedOut,
                    deliver: true,
                    dma: None,
                    waiter: entry.waiter.take(),
                })
            }
            Err(_) => {
                // No abort could be sent, so there is nothing left to wait
                // for: finalize the original now.
                let entry = guard.outstanding.remove(&id)?;
                probes::exchange_timeout!(|| (id.0, entry.kind as u8));
                Some(entry.finish(id, ExchangeStatus::TimedOut, true))
            }
        };
        if guard.outstanding.is_empty() {
            self.idle.send_replace(true);
        }
        res
    }

    /// Ask the firmware to abort exchange `target`.
    ///
    /// The outcome of `target` is reported when either it or the abort
    /// completes.  Abort exchanges inherit the timeout of their target and
    /// do not count against the outstanding limit.
    pub(crate) fn abort(
        &self,
        fw: &dyn FirmwareOps,
        target: ExchangeId,
        now: Instant,
        waiter: Option<Arc<Waiter>>,
    ) -> Result<ExchangeId, IssueError> {
        self.start_abort(fw, target, now, waiter, false)
    }

    fn start_abort(
        &self,
        fw: &dyn FirmwareOps,
        target: ExchangeId,
        now: Instant,
        waiter: Option<Arc<Waiter>>,
        delivered: bool,
    ) -> Result<ExchangeId, IssueError> {
        let abort = {
            let mut guard = self.inner.lock().unwrap();
            let orig = guard
                .outstanding
                .get(&target)
                .ok_or(IssueError::NotOutstanding(target))?;
            match orig.phase {
                Phase::Active => {}
                Phase::Aborting { abort, .. } => {
                    return Err(IssueError::AlreadyInFlight(abort))
                }
                Phase::AbortOf(_) => {
                    return Err(IssueError::NotOutstanding(target))
                }
            }
            let entry = Entry {
                kind: ExchangeKind::Abort,
                target: orig.target,
                gens: orig.gens,
                port_id: orig.port_id,
                issued: now,
                timeout: orig.timeout,
                phase: Phase::AbortOf(target),
                dma: None,
                waiter,
            };
            let abort = guard.alloc_id();
            guard.outstanding.insert(abort, entry);
            if let Some(orig) = guard.outstanding.get_mut(&target) {
                orig.phase = Phase::Aborting { abort, delivered };
            }
            abort
        };

        probes::exchange_issue!(|| (
            abort.0,
            ExchangeKind::Abort as u8,
            target.0
        ));
        if let Err(e) = fw.abort(abort, target) {
            let mut guard = self.inner.lock().unwrap();
            guard.outstanding.remove(&abort);
            if let Some(orig) = guard.outstanding.get_mut(&target) {
                orig.phase = Phase::Active;
            }
            return Err(e.into());
        }
        Ok(abort)
    }

    /// Number of tracked exchanges, aborts and lingering timed-out entries
    /// included.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding.len()
    }

    /// Query if there are any tracked exchanges outstanding
    pub fn any_outstanding(&self) -> bool {
        !self.inner.lock().unwrap().outstanding.is_empty()
    }

    /// Exchanges still driving the state of `target`.
    pub fn active_for(
        &self,
        target: PortHandle,
    ) -> Vec<(ExchangeId, ExchangeKind)> {
        let guard = self.inner.lock().unwrap();
        guard
            .outstanding
            .iter()
            .filter(|(_, e)| {
                e.target == Some(target) && e.phase == Phase::Active
            })
            .map(|(id, e)| (*id, e.kind))
            .collect()
    }

    pub fn kind_of(&self, id: ExchangeId) -> Option<ExchangeKind> {
        self.inner.lock().unwrap().outstanding.get(&id).map(|e| e.kind)
    }

    /// Handle to await until every exchange issued so far has finished or
    /// been reclaimed.
    pub fn none_outstanding(&self) -> NoneOutstanding {
        NoneOutstanding { idle: self.idle.subscribe() }
    }
}

/// One-shot rendezvous for a caller blocked on an exchange outcome.
#[derive(Debug, Default)]
pub(crate) struct Waiter {
    status: Mutex<Option<ExchangeStatus>>,
    cv: Condvar,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self, status: ExchangeStatus) {
        let mut guard = self.status.lock().unwrap();
        if guard.is_none() {
            *guard = Some(status);
        }
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for an outcome.
    pub fn wait(&self, timeout: Duration) -> Option<ExchangeStatus> {
        let guard = self.status.lock().unwrap();
        let (guard, _res) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| s.is_none())
            .unwrap();
        *guard
    }
}

/// Resolves, once awaited, when the [`ExchangeTracker`] it came from has no
/// exchanges outstanding.
pub struct NoneOutstanding {
    idle: watch::Receiver<bool>,
}

impl IntoFuture for NoneOutstanding {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let mut idle = self.idle;
        Box::pin(async move {
            // A dropped tracker has nothing left outstanding either.
            let _ = idle.wait_for(|idle| *idle).await;
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exchange::ExchangeKind;
    use crate::ops::FwError;
    use crate::types::LoopId;

    #[derive(Default)]
    struct Fw {
        refuse_issue: bool,
        refuse_abort: bool,
        aborts: Mutex<Vec<(ExchangeId, ExchangeId)>>,
    }
    impl FirmwareOps for Fw {
        fn issue(
            &self,
            _id: ExchangeId,
            _cmd: &Command,
        ) -> Result<(), FwError> {
            if self.refuse_issue {
                Err(FwError::QueueFull)
            } else {
                Ok(())
            }
        }
        fn abort(
            &self,
            id: ExchangeId,
            target: ExchangeId,
        ) -> Result<(), FwError> {
            if self.refuse_abort {
                return Err(FwError::Busy);
            }
            self.aborts.lock().unwrap().push((id, target));
            Ok(())
        }
    }

    const TMO: Duration = Duration::from_secs(10);

    fn login(h: Option<PortHandle>) -> Request {
        Request {
            cmd: Command::Login {
                loop_id: LoopId(1),
                port_id: PortId::from_raw(0x010100),
                els: false,
            },
            target: h.map(|h| (h, Generations { login: 3, rscn: 1 })),
            timeout: TMO,
            waiter: None,
        }
    }

    fn handle() -> PortHandle {
        let mut reg = crate::registry::PortRegistry::new();
        reg.insert(crate::port::Port::new(
            crate::types::Wwn(1),
            crate::types::Wwn(2),
            PortId::from_raw(0x010100),
            8,
        ))
    }

    #[test]
    fn issue_and_complete() {
        let fw = Fw::default();
        let trk = ExchangeTracker::new(4);
        let now = Instant::now();
        let h = handle();
        let id = trk.issue(&fw, true, login(Some(h)), now).unwrap();
        assert!(trk.any_outstanding());
        assert_eq!(trk.active_for(h), vec![(id, ExchangeKind::Login)]);

        let fin = trk.complete(id, ExchangeStatus::Success, now);
        assert_eq!(fin.len(), 1);
        assert!(fin[0].deliver);
        assert_eq!(fin[0].gens, Generations { login: 3, rscn: 1 });
        assert_eq!(fin[0].target, Some(h));
        assert!(!trk.any_outstanding());

        // A duplicate completion finds nothing.
        assert!(trk.complete(id, ExchangeStatus::Success, now).is_empty());
    }

    #[test]
    fn issue_refusals() {
        let fw = Fw::default();
        let trk = ExchangeTracker::new(2);
        let now = Instant::now();
        let h = handle();

        assert_eq!(
            trk.issue(&fw, false, login(Some(h)), now),
            Err(IssueError::NotOnline)
        );
        let first = trk.issue(&fw, true, login(Some(h)), now).unwrap();
        assert_eq!(
            trk.issue(&fw, true, login(Some(h)), now),
            Err(IssueError::AlreadyInFlight(first))
        );
        trk.issue(&fw, true, login(None), now).unwrap();
        assert_eq!(
            trk.issue(&fw, true, login(None), now),
            Err(IssueError::NoFreeSlots)
        );

        let refusing = Fw { refuse_issue: true, ..Default::default() };
        let trk = ExchangeTracker::new(2);
        assert!(matches!(
            trk.issue(&refusing, true, login(None), now),
            Err(IssueError::Firmware(_))
        ));
        assert!(!trk.any_outstanding());
    }

    #[test]
    fn timeout_then_abort_completes() {
        let fw = Fw::default();
        let trk = ExchangeTracker::new(4);
        let t0 = Instant::now();
        let id = trk.issue(&fw, true, login(Some(handle())), t0).unwrap();

        assert!(trk.expire(&fw, t0 + TMO / 2).is_empty());
        let fin = trk.expire(&fw, t0 + TMO);
        assert_eq!(fin.len(), 1);
        assert_eq!(fin[0].id, id);
        assert_eq!(fin[0].status, ExchangeStatus::TimedOut);
        assert!(fin[0].deliver);

        let (abort, target) = fw.aborts.lock().unwrap()[0];
        assert_eq!(target, id);
        // Original and its abort are both still tracked.
        assert_eq!(trk.outstanding(), 2);

        let fin = trk.complete(abort, ExchangeStatus::Success, t0 + TMO);
        assert_eq!(fin.len(), 2);
        assert!(fin.iter().all(|f| !f.deliver));
        assert!(!trk.any_outstanding());
    }

    #[test]
    fn abort_timeout_reclaims_both() {
        let fw = Fw::default();
        let trk = ExchangeTracker::new(4);
        let t0 = Instant::now();
        let id = trk.issue(&fw, true, login(Some(handle())), t0).unwrap();
        trk.expire(&fw, t0 + TMO);
        assert_eq!(trk.outstanding(), 2);

        let fin = trk.expire(&fw, t0 + TMO * 2);
        assert_eq!(fin.len(), 2);
        assert!(fin.iter().any(|f| f.id == id && !f.deliver));
        assert!(!trk.any_outstanding());

        // Late completion of the original is ignored.
        let late = trk.complete(id, ExchangeStatus::Success, t0 + TMO * 3);
        assert!(late.is_empty());
    }

    #[test]
    fn failed_abort_finalizes_immediately() {
        let fw = Fw { refuse_abort: true, ..Default::default() };
        let trk = ExchangeTracker::new(4);
        let t0 = Instant::now();
        let id = trk.issue(&fw, true, login(Some(handle())), t0).unwrap();
        let fin = trk.expire(&fw, t0 + TMO);
        assert_eq!(fin.len(), 1);
        assert_eq!(fin[0].id, id);
        assert!(fin[0].deliver);
        assert!(!trk.any_outstanding());
    }

    #[test]
    fn explicit_abort_reports_original() {
        let fw = Fw::default();
        let trk = ExchangeTracker::new(4);
        let t0 = Instant::now();
        let id = trk.issue(&fw, true, login(None), t0).unwrap();
        let abort = trk.abort(&fw, id, t0, None).unwrap();
        assert_eq!(
            trk.abort(&fw, id, t0, None),
            Err(IssueError::AlreadyInFlight(abort))
        );

        let fin = trk.complete(abort, ExchangeStatus::Success, t0);
        let orig = fin.iter().find(|f| f.id == id).unwrap();
        assert_eq!(orig.status, ExchangeStatus::Aborted);
        assert!(orig.deliver);
    }

    #[test]
    fn waiter_times_out_without_signal() {
        let w = Waiter::new();
        assert_eq!(w.wait(Duration::from_millis(1)), None);
        w.signal(ExchangeStatus::Success);
        w.signal(ExchangeStatus::Failed);
        assert_eq!(
            w.wait(Duration::from_millis(1)),
            Some(ExchangeStatus::Success)
        );
    }

    #[tokio::test]
    async fn none_outstanding_resolves() {
        let fw = Fw::default();
        let trk = Arc::new(ExchangeTracker::new(4));
        let now = Instant::now();
        let id = trk.issue(&fw, true, login(None), now).unwrap();

        let waiter = tokio::spawn({
            let trk = trk.clone();
            async move { trk.none_outstanding().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        trk.complete(id, ExchangeStatus::Success, now);
        waiter.await.unwrap();
    }
}
