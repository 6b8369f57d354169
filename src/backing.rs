// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sources of page-aligned memory blocks.
//!
//! A [`BlockSource`] provides the raw memory that backs slabs: page-aligned blocks whose size is
//! a multiple of the page size. Small-object slabs always request exactly one page; large-object
//! slabs request the object size rounded up to a page multiple. Two sources are provided - one
//! backed by the standard heap and, on Unix, one backed by anonymous `mmap`.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::{Error, PAGE_SIZE};

/// A source of page-aligned memory blocks.
pub trait BlockSource {
    /// Acquires a block of `size` bytes aligned to the platform page size. `size` is always a
    /// non-zero multiple of the page size. The block's contents are uninitialized.
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, Error>;

    /// Releases a block previously returned by [`acquire`](Self::acquire).
    ///
    /// # Safety
    /// `block` must have been returned by `acquire` on this source with the same `size`, and
    /// must not be released more than once.
    unsafe fn release(&mut self, block: NonNull<u8>, size: usize);
}

/// A `BlockSource` backed by the standard heap, with alignment forced to the page size.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeapSource;

impl BlockSource for HeapSource {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        debug_assert!(size > 0 && size % *PAGE_SIZE == 0);
        let layout = match Layout::from_size_align(size, *PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => return Err(Error::OutOfMemory),
        };
        NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(Error::OutOfMemory)
    }

    unsafe fn release(&mut self, block: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, *PAGE_SIZE);
        alloc::dealloc(block.as_ptr(), layout);
    }
}

/// A `BlockSource` backed by anonymous private `mmap`. Mapped memory is page-aligned by
/// construction.
#[cfg(unix)]
#[derive(Copy, Clone, Debug, Default)]
pub struct MmapSource;

#[cfg(unix)]
impl BlockSource for MmapSource {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        debug_assert!(size > 0 && size % *PAGE_SIZE == 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        NonNull::new(ptr as *mut u8).ok_or(Error::OutOfMemory)
    }

    unsafe fn release(&mut self, block: NonNull<u8>, size: usize) {
        let ret = libc::munmap(block.as_ptr() as *mut libc::c_void, size);
        debug_assert_eq!(ret, 0);
    }
}
