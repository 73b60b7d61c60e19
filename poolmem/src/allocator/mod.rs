//! Pool allocator for small fixed-size objects
//!
//! Requests are served from free lists indexed by exact byte size. Each
//! [ThreadCache] owns one such table and serves [allocate](ThreadCache::allocate)
//! and [deallocate](ThreadCache::deallocate) without any synchronization.
//! When a cache runs dry it refills from the [PoolAllocator]: either by
//! taking one block's worth of slices from the global pool, or by obtaining
//! a fresh block from the [BlockProvider] and slicing it. Memory only moves
//! back to the global pool when a cache is flushed (explicitly, or when it
//! is dropped). Blocks are returned to the provider only at teardown.
//!
//! With the `single-threaded` feature there is no global pool traffic:
//! refills always slice a new block and the lock is a `RefCell`.

use std::{
    any::type_name,
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{
    block::{carve_block, BlockChain, BlockProvider, SystemBlocks, BLOCK_HEADER_SZ},
    config::{ConfigError, PoolConfig, WORD_SIZE},
    free_list::{CountedList, FreeList, FreeSlice, SizeClassTable},
    loom_testing::PoolLock,
    util::UsizePtr,
};

/// Everything protected by the pool lock
struct SharedPool {
    /// Global free lists, with counts
    free: SizeClassTable<CountedList>,
    /// Every block obtained from the provider
    blocks: BlockChain,
    /// Bytes cut into slices so far, for the leak check
    carved_bytes: usize,
}
// safety: the pointers refer to blocks owned by the pool and are only
// followed while holding the pool lock
unsafe impl Send for SharedPool {}

impl SharedPool {
    fn free_bytes(&self) -> usize {
        self.free
            .iter()
            .map(|(size, list)| list.len() * PoolConfig::slice_bytes(size))
            .sum()
    }
}

/// Pool allocator root object
///
/// Owns the global pool and every block. Threads get at it through a
/// [ThreadCache] from [thread_cache](Self::thread_cache); because caches
/// borrow the pool, [cleanup](Self::cleanup) can only run after every cache
/// has been dropped (and so flushed).
pub struct PoolAllocator<P: BlockProvider = SystemBlocks> {
    config: PoolConfig,
    provider: P,
    shared: PoolLock<SharedPool>,
}

impl<P: BlockProvider> Debug for PoolAllocator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the shared state needs the lock, so only print what doesn't
        f.debug_struct("PoolAllocator")
            .field("@addr", &UsizePtr::from(self))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PoolAllocator<SystemBlocks> {
    /// Pool with the default geometry, backed by the global Rust allocator
    pub fn new() -> Self {
        Self::from_parts(PoolConfig::default(), SystemBlocks)
    }

    /// Pool with the given geometry, backed by the global Rust allocator
    pub fn with_config(config: PoolConfig) -> Result<Self, ConfigError> {
        Self::with_provider(config, SystemBlocks)
    }
}

impl Default for PoolAllocator<SystemBlocks> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: BlockProvider> PoolAllocator<P> {
    /// Pool with the given geometry and block source
    pub fn with_provider(config: PoolConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, provider))
    }

    fn from_parts(config: PoolConfig, provider: P) -> Self {
        debug_assert!(config.validate().is_ok());
        Self {
            shared: PoolLock::new(SharedPool {
                free: SizeClassTable::new(config.max_size),
                blocks: BlockChain::new(),
                carved_bytes: 0,
            }),
            config,
            provider,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Whether `size` can be requested from this pool
    #[inline]
    pub fn serves(&self, size: usize) -> bool {
        self.config.serves(size)
    }

    /// Get a cache for the current thread
    ///
    /// The cache flushes itself into the global pool when dropped.
    pub fn thread_cache(&self) -> ThreadCache<'_, P> {
        #[allow(unused_mut)]
        let mut lists = SizeClassTable::<FreeList>::new(self.config.max_size);

        // without a global pool, dropped caches park their lists in the
        // pool table and the next cache takes all of them back
        #[cfg(feature = "single-threaded")]
        {
            let mut shared = self.shared.lock();
            for (size, parked) in shared.free.iter_mut() {
                if !parked.is_empty() {
                    lists[size] = parked.take();
                }
            }
        }

        ThreadCache { pool: self, lists }
    }

    /// Allocation slow path
    ///
    /// Returns the slice for the caller plus the rest of a batch, which
    /// becomes the calling cache's new free list for `size`.
    fn refill(&self, size: usize) -> (NonNull<FreeSlice>, FreeList) {
        let trace_span = tracing::span!(Level::TRACE, "pool::refill", size);
        let _span_enter = trace_span.enter();

        let num_slices = self.config.slices_per_block(size);
        let mut shared = self.shared.lock();

        #[cfg(not(feature = "single-threaded"))]
        {
            // safety: global lists are only touched under the lock
            if let Some(batch) = unsafe { shared.free[size].detach_front(num_slices) } {
                drop(shared);
                tracing::event!(Level::TRACE, source = "global", slices = num_slices);
                return batch;
            }
        }

        let block = self.provider.allocate_block(self.config.block_size);
        // safety: the block is fresh from the provider
        unsafe { shared.blocks.push(block) };
        shared.carved_bytes += num_slices * PoolConfig::slice_bytes(size);
        drop(shared);

        tracing::event!(
            Level::TRACE,
            source = "block",
            block = ?UsizePtr::from(block),
            slices = num_slices
        );
        // safety: the block is registered, so only its body is left,
        // and config validation guarantees num_slices >= 1
        unsafe { carve_block(block, PoolConfig::slice_words(size), num_slices) }
    }

    /// Splice a whole local list onto the front of the global list for `size`
    ///
    /// Returns how many slices moved.
    fn donate(&self, size: usize, list: &mut FreeList) -> usize {
        // safety: the list belongs to the calling cache; walking it needs no lock
        let Some((tail, len)) = (unsafe { list.tail_and_len() }) else {
            return 0;
        };
        let Some(head) = list.take() else {
            return 0;
        };

        let mut shared = self.shared.lock();
        // safety: the chain was detached from the cache, so only we own it
        unsafe { shared.free[size].splice_front(head, tail, len) };
        drop(shared);

        tracing::event!(Level::TRACE, size, slices = len, head = ?UsizePtr::from(head));
        len
    }

    /// Relink every global free list in ascending address order
    ///
    /// Set membership and counts do not change. Holds the lock for the
    /// whole pass, so keep this out of hot paths.
    pub fn defrag(&self) {
        let trace_span = tracing::span!(Level::TRACE, "pool::defrag");
        let _span_enter = trace_span.enter();

        let mut shared = self.shared.lock();
        let longest = shared
            .free
            .iter()
            .map(|(_, list)| list.len())
            .max()
            .unwrap_or(0);
        if longest <= 1 {
            return;
        }

        let mut scratch = Vec::with_capacity(longest);
        let mut sorted_classes = 0;
        for (_, list) in shared.free.iter_mut() {
            if list.len() > 1 {
                // safety: global lists are only touched under the lock
                unsafe { list.sort_by_address(&mut scratch) };
                sorted_classes += 1;
            }
        }
        tracing::event!(Level::TRACE, sorted_classes, longest);
    }

    /// Bytes obtained from the provider so far
    pub fn memory_allocated_in_blocks(&self) -> usize {
        self.shared.lock().blocks.len() * self.config.block_size
    }

    /// Number of blocks obtained from the provider so far
    pub fn blocks_allocated(&self) -> usize {
        self.shared.lock().blocks.len()
    }

    /// Bytes sitting in the global free lists
    pub fn memory_in_global_free_list(&self) -> usize {
        self.shared.lock().free_bytes()
    }

    /// Bytes cut into slices so far
    ///
    /// Outside of any in-use allocation, this equals the global free bytes
    /// plus the free bytes of every live cache.
    pub fn carved_bytes(&self) -> usize {
        self.shared.lock().carved_bytes
    }

    /// Number of slices of `size` in the global pool
    ///
    /// `size` must be one this pool [serves](Self::serves).
    pub fn global_free_count(&self, size: usize) -> usize {
        debug_assert!(
            self.serves(size),
            "Size {} is outside the pool's size classes",
            size
        );
        self.shared.lock().free[size].len()
    }

    /// Walk the global free lists and verify them
    ///
    /// Panics if a slice is on a list twice, lies outside every block or
    /// off the slice grid of its block, or if a list's count is wrong.
    /// Returns the addresses of every free slice.
    pub fn debug_check_free_lists(&self) -> FxHashSet<UsizePtr> {
        let shared = self.shared.lock();
        let blocks = sorted_block_addrs(&shared.blocks);
        let mut seen = FxHashSet::default();
        for (size, list) in shared.free.iter() {
            // safety: global lists are only touched under the lock
            let n = unsafe { check_list(&self.config, &blocks, size, list.list(), &mut seen) };
            assert_eq!(n, list.len(), "Global count for size {} is wrong", size);
        }
        seen
    }

    /// Tear the pool down, handing every block back to the provider
    ///
    /// With debug assertions, first checks that every carved byte is back on
    /// a free list, i.e. that nothing allocated from this pool is still in use.
    pub fn cleanup(self) {
        let shared = self.shared.lock();
        let free = shared.free_bytes();
        tracing::event!(
            Level::DEBUG,
            blocks = shared.blocks.len(),
            carved_bytes = shared.carved_bytes,
            free_bytes = free,
            "pool cleanup"
        );
        debug_assert_eq!(
            free, shared.carved_bytes,
            "Memory leak: only {} of {} carved bytes were returned",
            free, shared.carved_bytes
        );
        drop(shared);
        // blocks go back in drop
    }
}

impl<P: BlockProvider> Drop for PoolAllocator<P> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        // safety: caches borrow the pool, so none can be alive any more;
        // any slice still held by the application dangles from here on
        unsafe { shared.blocks.release_all(&self.provider, self.config.block_size) };
    }
}

/// Start addresses of every block, ascending
fn sorted_block_addrs(blocks: &BlockChain) -> Vec<usize> {
    let mut addrs: Vec<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
    addrs.sort_unstable();
    addrs
}

/// Check one free list against the block layout, adding its slices to `seen`
///
/// Returns the length of the list.
///
/// # Safety
/// The list must not be modified concurrently.
unsafe fn check_list(
    config: &PoolConfig,
    blocks: &[usize],
    size: usize,
    list: &FreeList,
    seen: &mut FxHashSet<UsizePtr>,
) -> usize {
    let stride = PoolConfig::slice_bytes(size);
    let mut n = 0;
    for slice in list.iter() {
        let ptr = UsizePtr::from(slice);
        if !seen.insert(ptr) {
            panic!("Slice {:?} found in multiple free lists!", ptr);
        }

        let addr = ptr.addr();
        let block_i = blocks.partition_point(|&b| b <= addr);
        let on_grid = block_i > 0 && {
            let offs = addr - blocks[block_i - 1];
            offs >= BLOCK_HEADER_SZ
                && offs + stride <= config.block_size
                && (offs - BLOCK_HEADER_SZ) % stride == 0
        };
        if !on_grid {
            panic!("Slice {:?} of size {} is not inside any block!", ptr, size);
        }
        n += 1;
    }
    n
}

/// Per-thread cache of free slices
///
/// All operations are unsynchronized; exclusive access comes from `&mut self`.
/// Dropping the cache flushes it, which is what hands a thread's memory to
/// other threads when the thread ends.
pub struct ThreadCache<'pool, P: BlockProvider = SystemBlocks> {
    pool: &'pool PoolAllocator<P>,
    lists: SizeClassTable<FreeList>,
}
// safety: the free lists are only reachable through this handle, so moving
// it moves exclusive ownership of every slice on them
#[cfg(not(feature = "single-threaded"))]
unsafe impl<'pool, P: BlockProvider + Sync> Send for ThreadCache<'pool, P> {}

impl<'pool, P: BlockProvider> Debug for ThreadCache<'pool, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("@addr", &UsizePtr::from(self))
            .field("pool", &self.pool)
            .field("free_bytes", &self.memory_in_free_list())
            .finish()
    }
}

impl<'pool, P: BlockProvider> ThreadCache<'pool, P> {
    /// The pool this cache refills from
    pub fn pool(&self) -> &'pool PoolAllocator<P> {
        self.pool
    }

    /// Allocate `size` bytes, word aligned
    ///
    /// `size` must satisfy `0 < size < max_size`. The contents of the
    /// returned memory are undefined.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        debug_assert!(
            self.pool.serves(size),
            "Size {} is outside the pool's size classes",
            size
        );
        // safety: the local lists are only reachable through &mut self
        match unsafe { self.lists[size].pop() } {
            Some(slice) => slice.cast(), // fast path
            None => self.allocate_slow(size),
        }
    }

    #[cold]
    fn allocate_slow(&mut self, size: usize) -> NonNull<u8> {
        let (slice, rest) = self.pool.refill(size);
        self.lists[size] = rest;
        slice.cast()
    }

    /// Return memory from [allocate](Self::allocate)
    ///
    /// # Safety
    /// `ptr` must have been allocated from this cache's pool with exactly
    /// `size`, and must not be used afterwards.
    #[inline]
    pub unsafe fn deallocate(&mut self, size: usize, ptr: NonNull<u8>) {
        debug_assert!(
            self.pool.serves(size),
            "Size {} is outside the pool's size classes",
            size
        );
        self.lists[size].push(ptr.cast());
    }

    /// Return a whole chain of allocations of `size` at once
    ///
    /// The chain is linked through the first word of each element, as built
    /// by [link_chain](crate::link_chain).
    ///
    /// # Safety
    /// Every element of `head..=tail` must satisfy the requirements of
    /// [deallocate](Self::deallocate) and the chain must be properly linked
    /// from `head` to `tail`.
    #[inline]
    pub unsafe fn deallocate_list(&mut self, size: usize, head: NonNull<u8>, tail: NonNull<u8>) {
        debug_assert!(
            self.pool.serves(size),
            "Size {} is outside the pool's size classes",
            size
        );
        self.lists[size].splice_front(head.cast(), tail.cast());
    }

    /// Give every cached slice to the global pool
    ///
    /// Does nothing with the `single-threaded` feature.
    pub fn flush(&mut self) {
        #[cfg(not(feature = "single-threaded"))]
        self.donate_all();
    }

    fn donate_all(&mut self) {
        let trace_span = tracing::span!(Level::TRACE, "pool::flush", cache = ?UsizePtr::from(&*self));
        let _span_enter = trace_span.enter();

        let pool = self.pool;
        let mut bytes = 0;
        for (size, list) in self.lists.iter_mut() {
            bytes += pool.donate(size, list) * PoolConfig::slice_bytes(size);
        }
        tracing::event!(Level::TRACE, bytes);
    }

    /// Bytes sitting in this cache's free lists
    pub fn memory_in_free_list(&self) -> usize {
        self.lists
            .iter()
            .map(|(size, list)| {
                // safety: the local lists are only reachable through self
                let len = unsafe { list.tail_and_len() }.map_or(0, |(_, len)| len);
                len * PoolConfig::slice_bytes(size)
            })
            .sum()
    }

    /// Number of slices of `size` cached here
    ///
    /// `size` must be one the pool [serves](PoolAllocator::serves).
    pub fn free_count(&self, size: usize) -> usize {
        debug_assert!(
            self.pool.serves(size),
            "Size {} is outside the pool's size classes",
            size
        );
        // safety: the local lists are only reachable through self
        unsafe { self.lists[size].tail_and_len() }.map_or(0, |(_, len)| len)
    }

    /// Walk this cache's free lists and verify them
    ///
    /// Same checks as [PoolAllocator::debug_check_free_lists].
    pub fn debug_check_free_lists(&self) -> FxHashSet<UsizePtr> {
        let blocks = sorted_block_addrs(&self.pool.shared.lock().blocks);
        let mut seen = FxHashSet::default();
        for (size, list) in self.lists.iter() {
            // safety: the local lists are only reachable through self
            unsafe { check_list(&self.pool.config, &blocks, size, list, &mut seen) };
        }
        seen
    }

    fn object_size<T>(&self) -> usize {
        assert!(
            align_of::<T>() <= WORD_SIZE,
            "{} needs more than word alignment",
            type_name::<T>()
        );
        let size = size_of::<T>().max(1);
        assert!(
            self.pool.serves(size),
            "{} is too large for the pool",
            type_name::<T>()
        );
        size
    }

    /// Move `value` into pool memory
    ///
    /// Panics if `T` is too large or too strictly aligned for the pool.
    pub fn new_object<T>(&mut self, value: T) -> NonNull<T> {
        let size = self.object_size::<T>();
        let obj = self.allocate(size).cast::<T>();
        // safety: fresh slice, big enough and word aligned
        unsafe { obj.as_ptr().write(value) };
        obj
    }

    /// Drop an object from [new_object](Self::new_object) and free its memory
    ///
    /// # Safety
    /// `obj` must come from `new_object::<T>` on a cache of the same pool,
    /// and must not be used afterwards.
    pub unsafe fn drop_object<T>(&mut self, obj: NonNull<T>) {
        let size = self.object_size::<T>();
        ptr::drop_in_place(obj.as_ptr());
        self.deallocate(size, obj.cast());
    }
}

impl<'pool, P: BlockProvider> Drop for ThreadCache<'pool, P> {
    fn drop(&mut self) {
        self.donate_all();
    }
}
