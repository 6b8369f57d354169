// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space slab-cache object allocator.
//!
//! # Design
//!
//! This crate implements the slab-cache design originally introduced in the SunOS 5.4 kernel and
//! described in depth in [The Slab Allocator: An Object-Caching Kernel Memory Allocator][1]. A
//! [`Cache`] hands out fixed-size objects carved from page-granularity blocks of memory called
//! slabs. Small objects (at most one eighth of a page) are packed into a single page whose tail
//! holds the slab's own bookkeeping record; large objects each get a dedicated page-rounded
//! buffer, and an out-of-band buffer-control record ("bufctl") maps the buffer's address back to
//! the slab that owns it.
//!
//! Slab bookkeeping for large objects is itself allocated from two small-object caches - one for
//! slab records and one for bufctls. Those bootstrap caches are owned by a [`CacheContext`] and
//! shared by every large-object cache created from it, so the metadata-for-metadata cycle bottoms
//! out in the small-object path.
//!
//! Slabs are reaped eagerly: the moment a free drains a slab to zero live objects, the slab's
//! backing block goes back to the [`BlockSource`]. This keeps idle caches at zero memory at the
//! cost of extra allocator churn when alloc/free cycles straddle a slab boundary.
//!
//! The engine is single-threaded by design. Every type here is `!Send` and `!Sync`; concurrent
//! use requires external mutual exclusion around each cache and its context.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps

mod backing;
mod cache;
mod freelist;
mod large;

#[macro_use]
extern crate lazy_static;

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use cache::{Mode, Slab};
use large::Bufctl;

#[cfg(unix)]
pub use backing::MmapSource;
pub use backing::{BlockSource, HeapSource};
pub use cache::{Cache, CacheInfo, SlabInfo};

lazy_static! {
    static ref PAGE_SIZE: usize = sysconf::page::pagesize();
}

/// The platform page size used for all block acquisition and slab layout.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Errors reported by cache operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The block source could not satisfy a growth request. The cache is unchanged; retrying
    /// after releasing memory elsewhere is the caller's business.
    #[error("page-aligned block source exhausted")]
    OutOfMemory,
    /// The address does not belong to any live slab of the cache. Double frees and frees of
    /// foreign addresses both land here.
    #[error("invalid free of address {addr:#x}")]
    InvalidFree { addr: usize },
    /// Destruction was refused because the cache still owns live slabs.
    #[error("cache still owns live slabs")]
    NotEmpty,
}

/// Shared state for a family of caches: the block source they draw from and the two bootstrap
/// caches that back large-object metadata.
///
/// Classic slab implementations keep the bootstrap caches as process-wide globals initialized
/// on first use. Here they are ordinary caches owned by an explicitly-constructed context; every
/// large-object cache created through [`CacheContext::create_cache`] holds an `Rc` to the
/// context, preserving the created-once, shared-by-all lifecycle without hidden global state.
pub struct CacheContext<B: BlockSource> {
    pub(crate) slab_records: RefCell<Cache<B>>,
    pub(crate) bufctls: RefCell<Cache<B>>,
    source: B,
}

impl<B: BlockSource + Clone> CacheContext<B> {
    /// Creates a context, including the two bootstrap caches. No memory is acquired until a
    /// cache first grows.
    pub fn new(source: B) -> Rc<CacheContext<B>> {
        let slab_records = Cache::with_mode(
            "slab-records",
            mem::size_of::<Slab>(),
            source.clone(),
            Mode::Small,
        );
        let bufctls = Cache::with_mode(
            "bufctls",
            mem::size_of::<Bufctl>(),
            source.clone(),
            Mode::Small,
        );
        Rc::new(CacheContext {
            slab_records: RefCell::new(slab_records),
            bufctls: RefCell::new(bufctls),
            source,
        })
    }

    /// Creates a cache for objects of `object_size` bytes.
    ///
    /// Objects larger than one eighth of a page are placed in large-object mode, which routes
    /// slab and bufctl records through this context's bootstrap caches. No slabs are
    /// pre-allocated; the first allocation grows the cache.
    ///
    /// # Panics
    /// Panics if `name` is empty or `object_size` is zero.
    pub fn create_cache(self: &Rc<Self>, name: &str, object_size: usize) -> Cache<B> {
        assert!(!name.is_empty());
        assert!(object_size > 0);
        let mode = if object_size > *PAGE_SIZE / 8 {
            Mode::Large {
                bootstrap: Rc::clone(self),
                index: HashMap::new(),
            }
        } else {
            Mode::Small
        };
        Cache::with_mode(name, object_size, self.source.clone(), mode)
    }
}
