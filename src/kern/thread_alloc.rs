//! Thread allocation and garbage collection
//!
//! Descriptors of threads that died are parked on the GC list of the
//! process-wide thread list. The collector frees their stacks as soon as
//! they are safe to touch, and frees the descriptors themselves once they
//! are also detached and unreferenced. Nothing is freed while the thread
//! list lock is held.

use alloc::vec::Vec;

use crate::error::Result;
use crate::host::Host;
use crate::kern::thread::{Scope, Thread, ThreadEntry, ThreadFlags};
use crate::scheduler::Scheduler;
use crate::types::KseId;

impl<H: Host> Scheduler<H> {
    /// Allocate a thread descriptor and register it in the directory
    ///
    /// The cache is tried first; when it is empty the collector runs once
    /// to refill it before a fresh descriptor is built.
    pub fn alloc_thread(&self, caller: KseId) -> Result<Thread> {
        self.ensure_running()?;
        let kse = self.kse(caller)?;

        let mut cached = self.thread_cache.lock().pop();
        if cached.is_none() {
            self.gc(caller)?;
            cached = self.thread_cache.lock().pop();
        }

        let mut made = None;
        {
            let mut list = self.thread_list(&kse);
            list.directory.try_insert_with(|id| {
                let thread = match cached {
                    Some(thread) => thread.recycle(id),
                    None => Thread::new(id),
                };
                let entry = ThreadEntry {
                    kseg: None,
                    shared: thread.shared.clone(),
                    refcount: 0,
                    retired: false,
                };
                made = Some(thread);
                entry
            })?;
        }
        let Some(thread) = made else {
            crate::sched_fatal!("thread directory insert produced no thread");
        };

        self.counters.thread_allocs.inc();
        log::trace!("allocated {}", thread.id);
        Ok(thread)
    }

    /// Return a descriptor that is not owned by any group
    pub fn free_thread(&self, caller: KseId, thread: Thread) -> Result<()> {
        let kse = self.kse(caller)?;
        self.thread_list(&kse).directory.remove(thread.id);
        self.cache_thread(thread);
        Ok(())
    }

    fn cache_thread(&self, thread: Thread) {
        log::trace!("freed {}", thread.id);
        let destroyed = self.thread_cache.lock().push(thread).err();
        self.counters.thread_frees.inc();
        drop(destroyed);
    }

    /// Collect retired threads; returns how many were reclaimed
    pub fn gc(&self, caller: KseId) -> Result<usize> {
        let kse = self.kse(caller)?;
        let mut stacks = Vec::new();
        let mut reclaimed = Vec::new();

        {
            let mut list = self.thread_list(&kse);
            let list = &mut *list;
            let mut idx = 0;
            while idx < list.gc.len() {
                let thread = &mut list.gc[idx];
                if !thread.flags.contains(ThreadFlags::GC_SAFE) {
                    idx += 1;
                    continue;
                }
                if let Some(stack) = thread.stack.take() {
                    stacks.push(stack);
                }
                let refs = list.directory.get(thread.id).map_or(0, |e| e.refcount);
                if thread.flags.contains(ThreadFlags::DETACHED) && refs == 0 {
                    let thread = list.gc.swap_remove(idx);
                    list.directory.remove(thread.id);
                    reclaimed.push(thread);
                } else {
                    idx += 1;
                }
            }
        }
        drop(stacks);

        let count = reclaimed.len();
        for mut thread in reclaimed {
            thread.flags.remove(ThreadFlags::IN_GCLIST);
            if thread.attr.scope == Scope::System {
                self.release_dedicated(&thread);
            }
            self.cache_thread(thread);
        }
        if count > 0 {
            self.counters.gc_reclaimed.add(count as u64);
            log::debug!("gc reclaimed {} threads", count);
        }
        Ok(count)
    }

    /// Free the group and KSE a scope-system thread ran on
    fn release_dedicated(&self, thread: &Thread) {
        let (Some(kse), Some(kseg)) = (thread.kse, thread.kseg) else {
            return;
        };
        let (Ok(kse), Ok(kseg)) = (self.kse(kse), self.kseg(kseg)) else {
            return;
        };
        self.release_pair(&kse, &kseg);
    }

    /// Threads parked on the GC list
    pub fn gc_pending(&self, caller: KseId) -> Result<usize> {
        let kse = self.kse(caller)?;
        let pending = self.thread_list(&kse).gc.len();
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::testing::NullHost;
    use crate::types::Handle;

    fn sched(limit: usize) -> Scheduler<NullHost> {
        let config = SchedConfig::new()
            .with_cache_limits(4, 4, limit)
            .with_kse_stack_size(4096)
            .with_thread_stack_size(4096);
        Scheduler::new(NullHost::default(), config).unwrap()
    }

    #[test]
    fn test_alloc_registers_thread() {
        let sched = sched(4);
        let me = sched.initial_kse();
        let thread = sched.alloc_thread(me).unwrap();
        let id = thread.id;
        assert_eq!(sched.snapshot().thread_allocs, 1);

        sched.free_thread(me, thread).unwrap();
        assert_eq!(sched.cache_info().cached_threads, 1);
        assert!(sched.thread_info(me, id).is_err());

        let again = sched.alloc_thread(me).unwrap();
        assert_ne!(again.id, id);
        assert_eq!(again.id.index(), id.index());
    }

    #[test]
    fn test_cache_high_water() {
        let sched = sched(1);
        let me = sched.initial_kse();
        let a = sched.alloc_thread(me).unwrap();
        let b = sched.alloc_thread(me).unwrap();
        sched.free_thread(me, a).unwrap();
        sched.free_thread(me, b).unwrap();
        assert_eq!(sched.cache_info().cached_threads, 1);
        assert_eq!(sched.snapshot().thread_frees, 2);
    }
}
