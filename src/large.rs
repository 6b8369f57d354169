//! The large-object slab path: bufctl records and the address index.
//!
//! Objects bigger than an eighth of a page cannot share their page with a colocated slab
//! header, so each large-object slab is a single page-rounded buffer described entirely
//! out-of-band: the slab record comes from the bootstrap slab-record cache, and a buffer-control
//! record ("bufctl") linking the buffer's address to that slab comes from the bootstrap bufctl
//! cache. The cache-local index maps each live buffer address to its bufctl, keyed by the full
//! native address width, which is how a freed address finds its owning slab without any layout
//! tricks.

use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::backing::BlockSource;
use crate::cache::{Cache, Mode, Slab};
use crate::freelist::Freelist;
use crate::{Error, PAGE_SIZE};

/// Out-of-band record linking a large object's buffer to the slab that owns it.
pub(crate) struct Bufctl {
    pub(crate) slab: NonNull<Slab>,
    pub(crate) buffer: usize,
}

/// Smallest page multiple that holds `size` bytes (at least one page).
fn pages_for(size: usize, page: usize) -> Option<usize> {
    let pages = size.checked_add(page - 1)? / page;
    pages.checked_mul(page)
}

impl<B: BlockSource> Cache<B> {
    /// Builds one large-object slab: a slab record from the bootstrap cache, a page-rounded
    /// buffer as its sole object, and a bufctl indexed by the buffer's address.
    ///
    /// A failure at any step unwinds the metadata already taken, so the cache never sees a
    /// partial slab.
    pub(crate) fn grow_large(&mut self) -> Result<NonNull<Slab>, Error> {
        let page = *PAGE_SIZE;
        let len = match pages_for(self.object_size(), page) {
            Some(len) => len,
            None => return Err(Error::OutOfMemory),
        };
        let bootstrap = match &self.mode {
            Mode::Large { bootstrap, .. } => Rc::clone(bootstrap),
            Mode::Small => unreachable!("grow_large on a small-object cache"),
        };

        let rec_mem = bootstrap.slab_records.borrow_mut().allocate()?;
        let buffer = match self.source.acquire(len) {
            Ok(buffer) => buffer,
            Err(e) => {
                let res = bootstrap.slab_records.borrow_mut().free(rec_mem);
                debug_assert!(res.is_ok());
                return Err(e);
            }
        };
        let ctl_mem = match bootstrap.bufctls.borrow_mut().allocate() {
            Ok(ctl_mem) => ctl_mem,
            Err(e) => {
                unsafe { self.source.release(buffer, len) };
                let res = bootstrap.slab_records.borrow_mut().free(rec_mem);
                debug_assert!(res.is_ok());
                return Err(e);
            }
        };

        let base = buffer.as_ptr() as usize;
        let mut freelist = Freelist::new();
        freelist.append(base);

        let rec_ptr = rec_mem.cast::<Slab>();
        debug_assert_eq!(rec_ptr.as_ptr() as usize % mem::align_of::<Slab>(), 0);
        let ctl_ptr = ctl_mem.cast::<Bufctl>();
        debug_assert_eq!(ctl_ptr.as_ptr() as usize % mem::align_of::<Bufctl>(), 0);
        unsafe {
            ptr::write(
                rec_ptr.as_ptr(),
                Slab {
                    allocated: 0,
                    capacity: 1,
                    freelist,
                    base,
                    len,
                    header_offset: rec_ptr.as_ptr() as usize % page,
                },
            );
            ptr::write(
                ctl_ptr.as_ptr(),
                Bufctl {
                    slab: rec_ptr,
                    buffer: base,
                },
            );
        }

        match &mut self.mode {
            Mode::Large { index, .. } => {
                let prev = index.insert(base, ctl_ptr);
                debug_assert!(prev.is_none());
            }
            Mode::Small => unreachable!("grow_large on a small-object cache"),
        }
        Ok(rec_ptr)
    }

    /// Undoes `grow_large` for one slab: drops the bufctl from the index, returns both records
    /// to the bootstrap caches, and releases the buffer. The record must already be out of the
    /// slab sequence.
    pub(crate) fn release_large(&mut self, rec_ptr: NonNull<Slab>) {
        let rec = unsafe { ptr::read(rec_ptr.as_ptr()) };
        let (bootstrap, ctl_ptr) = match &mut self.mode {
            Mode::Large { bootstrap, index } => (Rc::clone(bootstrap), index.remove(&rec.base)),
            Mode::Small => unreachable!("release_large on a small-object cache"),
        };
        debug_assert!(ctl_ptr.is_some());

        unsafe {
            let buffer = NonNull::new_unchecked(rec.base as *mut u8);
            self.source.release(buffer, rec.len);
        }
        if let Some(ctl_ptr) = ctl_ptr {
            // Bufctls are plain data; handing the address back is the whole teardown.
            let res = bootstrap.bufctls.borrow_mut().free(ctl_ptr.cast());
            debug_assert!(res.is_ok());
        }
        let res = bootstrap.slab_records.borrow_mut().free(rec_ptr.cast());
        debug_assert!(res.is_ok());
        drop(rec);
    }
}
