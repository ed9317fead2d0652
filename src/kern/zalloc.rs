//! Zone-based Object Caches
//!
//! A zone is a collection of same-typed scheduler objects (KSEs, KSE groups)
//! made of two parts:
//!
//! - an **active slab**: live objects addressed by generation-checked handles
//! - a **free list**: pre-initialized objects kept for quick reuse, bounded
//!   by a high-water mark
//!
//! Objects released while the free list is at its high-water mark are handed
//! back to the caller for destruction instead of being cached.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::error::{Result, SchedError};
use crate::types::Handle;

// ============================================================================
// Zone Statistics
// ============================================================================

/// Zone statistics for debugging and monitoring
///
/// Zones are always used under their allocator lock, so the counters are
/// plain integers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    /// Objects handed out (cached or fresh)
    pub alloc_count: u64,
    /// Objects handed out straight from the free list
    pub cache_hits: u64,
    /// Objects returned to the zone
    pub free_count: u64,
    /// Objects destroyed because the free list was full
    pub destroyed: u64,
    /// Maximum objects ever live at once
    pub max_in_use: usize,
}

// ============================================================================
// Slab
// ============================================================================

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Generation-checked arena
///
/// Removing an entry bumps the slot's generation, so handles issued for the
/// previous occupant stop resolving.
#[derive(Debug)]
pub struct Slab<H, T> {
    entries: Vec<Entry<T>>,
    vacant: Vec<u32>,
    len: usize,
    _handle: PhantomData<H>,
}

impl<H: Handle, T> Slab<H, T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
            len: 0,
            _handle: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, growing the arena fallibly
    pub fn try_insert(&mut self, value: T) -> Result<H> {
        self.try_insert_with(|_| value)
    }

    /// Insert a value built from the handle it will live under
    pub fn try_insert_with(&mut self, make: impl FnOnce(H) -> T) -> Result<H> {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.entries[index as usize];
            let generation = match slot {
                Entry::Vacant { generation } => *generation,
                Entry::Occupied { .. } => crate::sched_fatal!("slab vacant list names a live slot"),
            };
            let handle = H::from_parts(index, generation);
            *slot = Entry::Occupied {
                generation,
                value: make(handle),
            };
            self.len += 1;
            return Ok(handle);
        }

        self.entries
            .try_reserve(1)
            .map_err(|_| SchedError::NoMemory("slab entry"))?;
        // Reserve the vacant slot up front so remove() never allocates.
        self.vacant
            .try_reserve(self.entries.len() + 1 - self.vacant.len())
            .map_err(|_| SchedError::NoMemory("slab entry"))?;

        let handle = H::from_parts(self.entries.len() as u32, 0);
        self.entries.push(Entry::Occupied {
            generation: 0,
            value: make(handle),
        });
        self.len += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        match self.entries.get(handle.index())? {
            Entry::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        match self.entries.get_mut(handle.index())? {
            Entry::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Remove an entry, retiring its handle
    pub fn remove(&mut self, handle: H) -> Option<T> {
        let slot = self.entries.get_mut(handle.index())?;
        match slot {
            Entry::Occupied { generation, .. } if *generation == handle.generation() => {
                let next = generation.wrapping_add(1);
                let old = core::mem::replace(slot, Entry::Vacant { generation: next });
                self.vacant.push(handle.index() as u32);
                self.len -= 1;
                match old {
                    Entry::Occupied { value, .. } => Some(value),
                    Entry::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    /// Iterate over live entries
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => {
                    Some((H::from_parts(index as u32, *generation), value))
                }
                Entry::Vacant { .. } => None,
            })
    }

    /// Handles of every live entry
    pub fn handles(&self) -> Vec<H> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Drop every entry except those `keep` accepts
    pub fn retain(&mut self, mut keep: impl FnMut(H, &T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        for handle in self.handles() {
            let keep_it = self.get(handle).is_some_and(|value| keep(handle, value));
            if !keep_it {
                if let Some(value) = self.remove(handle) {
                    removed.push(value);
                }
            }
        }
        removed
    }
}

impl<H: Handle, T> Default for Slab<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Free List
// ============================================================================

/// Bounded cache of recycled objects
#[derive(Debug)]
pub struct FreeList<T> {
    name: &'static str,
    items: Vec<T>,
    high_water: usize,
}

impl<T> FreeList<T> {
    pub const fn new(name: &'static str, high_water: usize) -> Self {
        Self {
            name,
            items: Vec::new(),
            high_water,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Cache an object; gives it back if the cache is at its high-water mark
    pub fn push(&mut self, item: T) -> core::result::Result<(), T> {
        if self.items.len() >= self.high_water || self.items.try_reserve(1).is_err() {
            return Err(item);
        }
        self.items.push(item);
        Ok(())
    }

    /// Empty the cache, returning everything it held
    pub fn drain(&mut self) -> Vec<T> {
        core::mem::take(&mut self.items)
    }
}

// ============================================================================
// Zone
// ============================================================================

/// Active slab plus free list for one object type
#[derive(Debug)]
pub struct Zone<H, T> {
    active: Slab<H, T>,
    free: FreeList<T>,
    stats: ZoneStats,
}

impl<H: Handle, T> Zone<H, T> {
    pub const fn new(name: &'static str, high_water: usize) -> Self {
        Self {
            active: Slab::new(),
            free: FreeList::new(name, high_water),
            stats: ZoneStats {
                alloc_count: 0,
                cache_hits: 0,
                free_count: 0,
                destroyed: 0,
                max_in_use: 0,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.free.name()
    }

    /// Pop a cached object and `claim` it for reuse
    ///
    /// A cached object `claim` refuses is dropped and not counted as a hit.
    pub fn take_cached<U>(&mut self, claim: impl FnOnce(T) -> Option<U>) -> Option<U> {
        let item = self.free.pop().and_then(claim);
        if item.is_some() {
            self.stats.cache_hits += 1;
        }
        item
    }

    /// Make an object live and return its handle
    pub fn activate(&mut self, item: T) -> Result<H> {
        self.activate_with(|_| item)
    }

    /// Make an object live, building it from its new handle
    pub fn activate_with(&mut self, make: impl FnOnce(H) -> T) -> Result<H> {
        let handle = self.active.try_insert_with(make)?;
        self.stats.alloc_count += 1;
        self.stats.max_in_use = self.stats.max_in_use.max(self.active.len());
        Ok(handle)
    }

    /// Retire a live object, returning it to the caller
    pub fn deactivate(&mut self, handle: H) -> Option<T> {
        self.active.remove(handle)
    }

    /// Cache a retired object; gives it back if it must be destroyed
    pub fn recycle(&mut self, item: T) -> Option<T> {
        self.stats.free_count += 1;
        match self.free.push(item) {
            Ok(()) => None,
            Err(item) => {
                self.stats.destroyed += 1;
                Some(item)
            }
        }
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.active.get(handle)
    }

    pub fn active(&self) -> &Slab<H, T> {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut Slab<H, T> {
        &mut self.active
    }

    pub fn cached(&self) -> usize {
        self.free.len()
    }

    pub fn high_water(&self) -> usize {
        self.free.high_water()
    }

    pub fn stats(&self) -> ZoneStats {
        self.stats
    }

    /// Empty the free list, returning what it held
    pub fn purge(&mut self) -> Vec<T> {
        self.free.drain()
    }
}

/// Zone information for debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub name: &'static str,
    pub active: usize,
    pub cached: usize,
    pub high_water: usize,
    pub stats: ZoneStats,
}

impl<H: Handle, T> From<&Zone<H, T>> for ZoneInfo {
    fn from(zone: &Zone<H, T>) -> Self {
        Self {
            name: zone.name(),
            active: zone.active.len(),
            cached: zone.cached(),
            high_water: zone.high_water(),
            stats: zone.stats,
        }
    }
}
