//! KSE and KSE group allocation
//!
//! Released objects go back to their zone's free list and are reused,
//! stack and queue storage included, by the next allocation. Objects
//! released while the free list is at its high-water mark are destroyed.

use alloc::sync::Arc;

use crate::error::{Result, SchedError};
use crate::host::Host;
use crate::kern::kse::Kse;
use crate::kern::kseg::{Kseg, KsegState};
use crate::kern::stack::Stack;
use crate::scheduler::Scheduler;
use crate::types::{KseId, KsegId};

/// Either a recycled object or the parts to build a fresh one
enum Reuse<T, P> {
    Cached(T),
    Fresh(P),
}

impl<H: Host> Scheduler<H> {
    /// Allocate a KSE, detached from any group
    pub fn alloc_kse(&self) -> Result<KseId> {
        self.new_kse().map(|kse| kse.id())
    }

    pub(crate) fn new_kse(&self) -> Result<Arc<Kse>> {
        self.ensure_running()?;
        let cached = self.kses.lock().take_cached(|kse| Arc::try_unwrap(kse).ok());
        let parts = match cached {
            Some(kse) => Reuse::Cached(kse),
            None => Reuse::Fresh(Stack::new(self.config.kse_stack_size)?),
        };

        let mut zone = self.kses.lock();
        let id = zone.activate_with(|id| {
            Arc::new(match parts {
                Reuse::Cached(kse) => kse.recycle(id),
                Reuse::Fresh(stack) => Kse::with_stack(id, stack),
            })
        })?;
        let kse = zone.get(id).cloned().ok_or(SchedError::InvalidKse(id))?;
        drop(zone);

        self.counters.kse_allocs.inc();
        log::debug!("allocated {}", id);
        Ok(kse)
    }

    /// Release a KSE that no longer belongs to a group
    pub fn free_kse(&self, id: KseId) -> Result<()> {
        let kse = self.kse(id)?;
        if kse.kseg().is_some() {
            return Err(SchedError::NotPermitted("KSE is still attached to a group"));
        }
        drop(kse);
        self.release_kse(id);
        Ok(())
    }

    pub(crate) fn release_kse(&self, id: KseId) {
        let destroyed = {
            let mut zone = self.kses.lock();
            zone.deactivate(id).and_then(|kse| zone.recycle(kse))
        };
        self.counters.kse_frees.inc();
        log::debug!("released {}", id);
        drop(destroyed);
    }

    /// Allocate an empty KSE group
    pub fn alloc_kseg(&self) -> Result<KsegId> {
        self.new_kseg().map(|kseg| kseg.id())
    }

    pub(crate) fn new_kseg(&self) -> Result<Arc<Kseg>> {
        self.ensure_running()?;
        let cached = self.ksegs.lock().take_cached(|kseg| Arc::try_unwrap(kseg).ok());
        let parts = match cached {
            Some(kseg) => Reuse::Cached(kseg),
            None => Reuse::Fresh(KsegState::new(&self.config)?),
        };

        let mut zone = self.ksegs.lock();
        let id = zone.activate_with(|id| {
            Arc::new(match parts {
                Reuse::Cached(kseg) => kseg.recycle(id),
                Reuse::Fresh(state) => Kseg::with_state(id, state),
            })
        })?;
        let kseg = zone.get(id).cloned().ok_or(SchedError::InvalidKseg(id))?;
        drop(zone);

        self.counters.kseg_allocs.inc();
        log::debug!("allocated {}", id);
        Ok(kseg)
    }

    /// Release a group with no KSEs and no threads
    ///
    /// `caller` is the KSE taking the group's lock to check it is empty.
    pub fn free_kseg(&self, caller: KseId, id: KsegId) -> Result<()> {
        let kse = self.kse(caller)?;
        let kseg = self.kseg(id)?;
        if !self.sched_lock(&kse, &kseg).is_empty() {
            return Err(SchedError::NotPermitted("KSE group is not empty"));
        }
        drop(kseg);
        self.release_kseg(id);
        Ok(())
    }

    pub(crate) fn release_kseg(&self, id: KsegId) {
        let destroyed = {
            let mut zone = self.ksegs.lock();
            zone.deactivate(id).and_then(|kseg| zone.recycle(kseg))
        };
        self.counters.kseg_frees.inc();
        log::debug!("released {}", id);
        drop(destroyed);
    }

    /// Release a dedicated KSE and its group together
    pub(crate) fn release_pair(&self, kse: &Arc<Kse>, kseg: &Arc<Kseg>) {
        kse.set_kseg(None);
        self.release_kse(kse.id());
        self.release_kseg(kseg.id());
    }

    // ========================================================================
    // Group membership
    // ========================================================================

    /// Make `kse` schedule for `kseg`; the KSE takes the group lock itself
    pub(crate) fn attach(&self, kse: &Arc<Kse>, kseg: &Arc<Kseg>) {
        let mut guard = self.sched_lock(kse, kseg);
        if !guard.kses.contains(&kse.id()) {
            guard.kses.push(kse.id());
        }
        kse.set_kseg(Some(kseg.id()));
    }

    /// Attach a free KSE to a group
    pub fn attach_kse(&self, kse: KseId, kseg: KsegId) -> Result<()> {
        let kse = self.kse(kse)?;
        if kse.kseg().is_some() {
            return Err(SchedError::NotPermitted("KSE already belongs to a group"));
        }
        self.attach(&kse, &self.kseg(kseg)?);
        Ok(())
    }

    /// Take a KSE out of its group
    pub fn detach_kse(&self, kse: KseId) -> Result<()> {
        let kse = self.kse(kse)?;
        let Some(id) = kse.kseg() else {
            return Ok(());
        };
        let kseg = self.kseg(id)?;
        let mut guard = self.sched_lock(&kse, &kseg);
        guard.kses.retain(|&k| k != kse.id());
        guard.idle_kses.retain(|(k, _)| *k != kse.id());
        kse.set_kseg(None);
        Ok(())
    }

    /// Add a KSE to `kseg` and start it in the kernel
    ///
    /// On kernel failure the KSE is taken back out and released.
    pub fn spawn_kse(&self, kseg: KsegId) -> Result<KseId> {
        let kseg = self.kseg(kseg)?;
        let kse = self.new_kse()?;
        self.attach(&kse, &kseg);

        if let Err(err) = self.host.kse_create(kse.mailbox(), false) {
            log::warn!("kse_create for {} failed: {}", kse.id(), err);
            self.detach_kse(kse.id())?;
            self.release_kse(kse.id());
            return Err(SchedError::KernelResource(err));
        }
        log::debug!("spawned {} in {}", kse.id(), kseg.id());
        Ok(kse.id())
    }
}
