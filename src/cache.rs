//! Cache lifecycle and the small-object slab path.
//!
//! A [`Cache`] owns an ordered sequence of slabs plus a cursor to the slab most recently known
//! to have spare capacity. The cursor is deliberately loose: it may point at a slab that has
//! since filled up, in which case allocation grows the cache and takes the first object from the
//! fresh slab. Growth never recurses into allocation.
//!
//! Small-object slabs colocate their bookkeeping record with their objects: one page is carved
//! into `object_size`-byte slots from offset zero, and the [`Slab`] record itself is written
//! into the reserved tail of the same page. Resolving which slab owns a freed address is
//! arithmetic on each slab's recorded base and slot span; nothing is ever dereferenced across a
//! page boundary. The large-object path lives in the `large` module.

use std::collections::HashMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use log::debug;

use crate::backing::BlockSource;
use crate::freelist::Freelist;
use crate::large::Bufctl;
use crate::{CacheContext, Error, PAGE_SIZE};

/// Allocation strategy, fixed at cache creation.
pub(crate) enum Mode<B: BlockSource> {
    /// Objects packed into single pages with a colocated tail header.
    Small,
    /// One page-rounded buffer per slab, with slab and bufctl records drawn from the bootstrap
    /// caches and an address index mapping each buffer to its owning slab.
    Large {
        bootstrap: Rc<CacheContext<B>>,
        index: HashMap<usize, NonNull<Bufctl>>,
    },
}

/// Bookkeeping for one slab.
///
/// For small objects the record lives in the tail of the page it describes; for large objects
/// it is allocated from the bootstrap slab-record cache and describes a separate buffer.
pub(crate) struct Slab {
    /// Object slots currently handed out. Always `<= capacity`.
    pub(crate) allocated: usize,
    /// Maximum objects this slab can hold: `(page_size - header) / object_size` for small
    /// objects, exactly 1 for large objects.
    pub(crate) capacity: usize,
    /// Free object addresses, all drawn from this slab's backing block.
    pub(crate) freelist: Freelist,
    /// Base address of the backing block.
    pub(crate) base: usize,
    /// Size of the backing block in bytes.
    pub(crate) len: usize,
    /// Page offset of this record. Informational, surfaced by `describe`.
    pub(crate) header_offset: usize,
}

/// An object cache for one fixed object size.
pub struct Cache<B: BlockSource> {
    name: String,
    object_size: usize,
    pub(crate) source: B,
    slabs: Vec<NonNull<Slab>>,
    free_cursor: Option<usize>,
    pub(crate) mode: Mode<B>,
}

/// Read-only snapshot of a cache, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub name: String,
    pub object_size: usize,
    pub large: bool,
    pub slabs: Vec<SlabInfo>,
}

/// Per-slab counters within a [`CacheInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabInfo {
    pub allocated: usize,
    pub capacity: usize,
    pub header_offset: usize,
}

impl CacheInfo {
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Total live objects across all slabs.
    pub fn total_allocated(&self) -> usize {
        self.slabs.iter().map(|s| s.allocated).sum()
    }
}

impl<B: BlockSource> Cache<B> {
    pub(crate) fn with_mode(name: &str, object_size: usize, source: B, mode: Mode<B>) -> Cache<B> {
        debug_assert!(object_size > 0);
        debug_assert!(object_size <= *PAGE_SIZE / 8 || matches!(mode, Mode::Large { .. }));
        Cache {
            name: name.to_owned(),
            object_size,
            source,
            slabs: Vec::new(),
            free_cursor: None,
            mode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Whether this cache is in large-object mode (`object_size > page_size / 8`).
    pub fn is_large(&self) -> bool {
        matches!(self.mode, Mode::Large { .. })
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Takes a snapshot of the cache's slab state. Read-only; no side effects.
    pub fn describe(&self) -> CacheInfo {
        CacheInfo {
            name: self.name.clone(),
            object_size: self.object_size,
            large: self.is_large(),
            slabs: self
                .slabs
                .iter()
                .map(|slab| {
                    let rec = unsafe { slab.as_ref() };
                    SlabInfo {
                        allocated: rec.allocated,
                        capacity: rec.capacity,
                        header_offset: rec.header_offset,
                    }
                })
                .collect(),
        }
    }

    /// Allocates one object, growing the cache by a slab if no spare capacity is at hand.
    ///
    /// On `OutOfMemory` the cache is exactly as it was before the call; no partial slab is left
    /// registered.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, Error> {
        // At most one growth attempt, then one take; growth never re-enters allocation.
        let idx = match self.usable_cursor() {
            Some(idx) => idx,
            None => {
                self.grow()?;
                match self.free_cursor {
                    Some(idx) => idx,
                    None => return Err(Error::OutOfMemory),
                }
            }
        };
        let rec = unsafe { self.slabs[idx].as_mut() };
        let addr = match rec.freelist.pop_front() {
            Some(addr) => addr,
            None => return Err(Error::OutOfMemory),
        };
        rec.allocated += 1;
        debug_assert!(rec.allocated <= rec.capacity);
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Returns a previously allocated object to its owning slab, reaping the slab if it drains
    /// to zero live objects.
    ///
    /// Addresses the cache does not own - including double frees - are rejected with
    /// `InvalidFree` and leave the cache untouched.
    pub fn free(&mut self, addr: NonNull<u8>) -> Result<(), Error> {
        let addr = addr.as_ptr() as usize;
        let idx = self.owning_slab(addr)?;
        let rec = unsafe { self.slabs[idx].as_mut() };
        if rec.allocated == 0 {
            return Err(Error::InvalidFree { addr });
        }
        rec.allocated -= 1;
        rec.freelist.append(addr);
        if rec.allocated == 0 {
            self.reap();
        }
        Ok(())
    }

    /// Destroys the cache. Refused with `NotEmpty` - handing the intact cache back - while any
    /// slab is still live; callers must drain the cache first.
    pub fn destroy(self) -> Result<(), (Error, Cache<B>)> {
        if self.slabs.is_empty() {
            Ok(())
        } else {
            Err((Error::NotEmpty, self))
        }
    }

    /// Resolves the index of the slab owning `addr`, with the defensive checks that keep a bad
    /// free from corrupting a freelist.
    fn owning_slab(&self, addr: usize) -> Result<usize, Error> {
        match &self.mode {
            Mode::Large { index, .. } => {
                let ctl = unsafe { index.get(&addr).ok_or(Error::InvalidFree { addr })?.as_ref() };
                debug_assert_eq!(ctl.buffer, addr);
                let slab = ctl.slab;
                self.slabs
                    .iter()
                    .position(|s| *s == slab)
                    .ok_or(Error::InvalidFree { addr })
            }
            Mode::Small => {
                for (idx, slab) in self.slabs.iter().enumerate() {
                    let rec = unsafe { slab.as_ref() };
                    let span = rec.capacity * self.object_size;
                    if addr < rec.base || addr >= rec.base + span {
                        continue;
                    }
                    if (addr - rec.base) % self.object_size != 0 || rec.freelist.contains(addr) {
                        return Err(Error::InvalidFree { addr });
                    }
                    return Ok(idx);
                }
                Err(Error::InvalidFree { addr })
            }
        }
    }

    /// Index of the cursor slab if it still has spare capacity.
    fn usable_cursor(&self) -> Option<usize> {
        let idx = self.free_cursor?;
        let rec = unsafe { self.slabs[idx].as_ref() };
        (rec.allocated < rec.capacity).then_some(idx)
    }

    /// Adds one slab and points the cursor at it.
    fn grow(&mut self) -> Result<(), Error> {
        let slab = if self.is_large() {
            self.grow_large()?
        } else {
            self.grow_small()?
        };
        self.slabs.push(slab);
        self.free_cursor = Some(self.slabs.len() - 1);
        debug!(
            "{}: grew by one slab (header offset {})",
            self.name,
            unsafe { slab.as_ref() }.header_offset
        );
        Ok(())
    }

    /// Acquires one page, carves it into slots, and writes the slab record into the reserved
    /// tail of the same page.
    fn grow_small(&mut self) -> Result<NonNull<Slab>, Error> {
        let page = *PAGE_SIZE;
        let header_offset = page - mem::size_of::<Slab>();
        let capacity = header_offset / self.object_size;
        debug_assert!(capacity > 0);

        let block = self.source.acquire(page)?;
        let base = block.as_ptr() as usize;
        let mut freelist = Freelist::new();
        for slot in 0..capacity {
            freelist.append(base + slot * self.object_size);
        }
        let rec_ptr = (base + header_offset) as *mut Slab;
        debug_assert_eq!(rec_ptr as usize % mem::align_of::<Slab>(), 0);
        unsafe {
            ptr::write(
                rec_ptr,
                Slab {
                    allocated: 0,
                    capacity,
                    freelist,
                    base,
                    len: page,
                    header_offset,
                },
            );
            Ok(NonNull::new_unchecked(rec_ptr))
        }
    }

    /// Releases the first fully-empty slab, if any. Reaping is eager: it runs on every free
    /// that drains a slab, with no batching or watermark hysteresis.
    fn reap(&mut self) {
        let idx = match self
            .slabs
            .iter()
            .position(|s| unsafe { s.as_ref() }.allocated == 0)
        {
            Some(idx) => idx,
            None => return,
        };
        if self.slabs.len() == 1 {
            self.free_cursor = None;
        } else if self.free_cursor == Some(idx) {
            self.free_cursor = idx.checked_sub(1);
        }
        // The sequence is about to close up over the removed slot.
        if let Some(cursor) = self.free_cursor {
            if cursor > idx {
                self.free_cursor = Some(cursor - 1);
            }
        }
        let rec_ptr = self.slabs.remove(idx);
        debug_assert_eq!(unsafe { rec_ptr.as_ref() }.freelist.len(), unsafe {
            rec_ptr.as_ref().capacity
        });
        self.release_slab(rec_ptr);
        debug!("{}: reaped one empty slab", self.name);
    }

    /// Tears down one slab record and returns its backing block to the source. The record must
    /// already be out of `self.slabs`.
    fn release_slab(&mut self, rec_ptr: NonNull<Slab>) {
        if self.is_large() {
            self.release_large(rec_ptr);
        } else {
            unsafe {
                // Take the record out of the page before the page goes away; dropping it
                // releases the freelist.
                let rec = ptr::read(rec_ptr.as_ptr());
                let block = NonNull::new_unchecked(rec.base as *mut u8);
                let len = rec.len;
                drop(rec);
                self.source.release(block, len);
            }
        }
    }
}

impl<B: BlockSource> Drop for Cache<B> {
    fn drop(&mut self) {
        // Dropping a non-drained cache tears everything down; any outstanding object addresses
        // dangle from here on, as with any allocator teardown.
        while let Some(rec_ptr) = self.slabs.pop() {
            self.release_slab(rec_ptr);
        }
        self.free_cursor = None;
    }
}
