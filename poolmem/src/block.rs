//! Raw blocks: where they come from, how they are remembered, how they are cut
//!
//! Each block starts with a [BlockHeader] linking it to the previously
//! obtained block, so the chain needs no storage of its own. The rest of
//! the block is cut into equally sized slices.

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::NonNull,
};

use crate::{
    config::WORD_SIZE,
    free_list::{FreeList, FreeSlice},
    util::UsizePtr,
};

/// Source of raw blocks
///
/// Blocks are requested one at a time, always of the pool's configured
/// `block_size`, and are handed back only when the pool is torn down.
/// Running out of memory is fatal; implementations do not return on failure.
pub trait BlockProvider {
    /// Obtain one block of `size` bytes, aligned to at least [WORD_SIZE]
    fn allocate_block(&self, size: usize) -> NonNull<u8>;

    /// Give back a block
    ///
    /// # Safety
    /// `block` must have come from [allocate_block](Self::allocate_block)
    /// on this provider with the same `size`, and must not be used afterwards.
    unsafe fn release_block(&self, block: NonNull<u8>, size: usize);
}

impl<'a, P: BlockProvider + ?Sized> BlockProvider for &'a P {
    fn allocate_block(&self, size: usize) -> NonNull<u8> {
        (**self).allocate_block(size)
    }

    unsafe fn release_block(&self, block: NonNull<u8>, size: usize) {
        (**self).release_block(block, size)
    }
}

/// Blocks from the global Rust allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBlocks;

impl SystemBlocks {
    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, WORD_SIZE) {
            Ok(x) => x,
            Err(_) => panic!("Invalid block size {}", size),
        }
    }
}

impl BlockProvider for SystemBlocks {
    fn allocate_block(&self, size: usize) -> NonNull<u8> {
        let layout = Self::layout(size);
        // safety: config validation makes size nonzero
        let p = unsafe { alloc::alloc(layout) };
        match NonNull::new(p) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        }
    }

    unsafe fn release_block(&self, block: NonNull<u8>, size: usize) {
        alloc::dealloc(block.as_ptr(), Self::layout(size));
    }
}

/// First word of every block
#[repr(C)]
pub struct BlockHeader {
    next: Option<NonNull<BlockHeader>>,
}

/// Bytes at the start of a block that are not sliced
pub const BLOCK_HEADER_SZ: usize = size_of::<BlockHeader>();
const _: () = assert!(BLOCK_HEADER_SZ == WORD_SIZE);
const _: () = assert!(align_of::<BlockHeader>() <= WORD_SIZE);

/// Every block ever obtained, newest first
pub struct BlockChain {
    head: Option<NonNull<BlockHeader>>,
    len: usize,
}

impl Debug for BlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChain")
            .field("head", &self.head.map(UsizePtr::from))
            .field("len", &self.len)
            .finish()
    }
}

impl BlockChain {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of blocks in the chain
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Record a freshly obtained block
    ///
    /// # Safety
    /// `block` must be a block of at least [BLOCK_HEADER_SZ] bytes that is
    /// not already in a chain; its header word is overwritten.
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        let hdr = block.cast::<BlockHeader>();
        hdr.as_ptr().write(BlockHeader { next: self.head });
        self.head = Some(hdr);
        self.len += 1;
    }

    /// Start addresses of all blocks, newest first
    pub fn iter(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let hdr = cur?;
            // safety: every header in the chain was written by push
            // and the block stays alive until release_all
            cur = unsafe { (*hdr.as_ptr()).next };
            Some(hdr.cast())
        })
    }

    /// Hand every block back to `provider`, leaving the chain empty
    ///
    /// # Safety
    /// Every block must have come from `provider` with `block_size`, and no
    /// slice of any of them may be used afterwards.
    pub unsafe fn release_all<P: BlockProvider + ?Sized>(
        &mut self,
        provider: &P,
        block_size: usize,
    ) {
        let mut cur = self.head.take();
        self.len = 0;
        while let Some(hdr) = cur {
            cur = (*hdr.as_ptr()).next;
            provider.release_block(hdr.cast(), block_size);
        }
    }
}

/// Cut the body of a block into a chain of `num_slices` slices of
/// `slice_words` words each
///
/// Returns the first slice and a list holding the rest.
///
/// # Safety
/// `block` must be a registered block nobody else is slicing, with room for
/// [BLOCK_HEADER_SZ] plus `num_slices * slice_words` words. `num_slices`
/// must be at least 1.
pub unsafe fn carve_block(
    block: NonNull<u8>,
    slice_words: usize,
    num_slices: usize,
) -> (NonNull<FreeSlice>, FreeList) {
    debug_assert!(num_slices >= 1);
    let stride = slice_words * WORD_SIZE;
    let body = block.as_ptr().add(BLOCK_HEADER_SZ);
    let slice_at = |i: usize| NonNull::new_unchecked(body.add(i * stride)).cast::<FreeSlice>();

    for i in 0..num_slices - 1 {
        FreeSlice::store_next(slice_at(i), Some(slice_at(i + 1)));
    }
    FreeSlice::store_next(slice_at(num_slices - 1), None);

    let first = slice_at(0);
    (first, FreeList::from_head(FreeSlice::load_next(first)))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Counts outstanding blocks so tests can check everything was released
    #[derive(Default)]
    struct Tally {
        live: Cell<isize>,
    }
    impl BlockProvider for Tally {
        fn allocate_block(&self, size: usize) -> NonNull<u8> {
            self.live.set(self.live.get() + 1);
            SystemBlocks.allocate_block(size)
        }
        unsafe fn release_block(&self, block: NonNull<u8>, size: usize) {
            self.live.set(self.live.get() - 1);
            SystemBlocks.release_block(block, size)
        }
    }

    #[test]
    fn chain_push_and_release() {
        let provider = Tally::default();
        let mut chain = BlockChain::new();
        let mut blocks = Vec::new();
        for _ in 0..3 {
            let b = provider.allocate_block(64);
            unsafe { chain.push(b) };
            blocks.push(b);
        }
        assert_eq!(chain.len(), 3);
        blocks.reverse();
        assert_eq!(chain.iter().collect::<Vec<_>>(), blocks);

        unsafe { chain.release_all(&provider, 64) };
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert_eq!(provider.live.get(), 0);
    }

    #[test]
    fn carve_links_every_slice() {
        let provider = Tally::default();
        let size = BLOCK_HEADER_SZ + 4 * 2 * WORD_SIZE;
        let block = provider.allocate_block(size);
        let mut chain = BlockChain::new();
        unsafe {
            chain.push(block);
            let (first, rest) = carve_block(block, 2, 4);
            assert_eq!(
                first.as_ptr() as usize,
                block.as_ptr() as usize + BLOCK_HEADER_SZ
            );
            let addrs: Vec<usize> = rest.iter().map(|p| p.as_ptr() as usize).collect();
            let base = first.as_ptr() as usize;
            let stride = 2 * WORD_SIZE;
            assert_eq!(addrs, vec![base + stride, base + 2 * stride, base + 3 * stride]);
            chain.release_all(&provider, size);
        }
    }

    #[test]
    fn carve_single_slice() {
        let size = BLOCK_HEADER_SZ + WORD_SIZE;
        let block = SystemBlocks.allocate_block(size);
        unsafe {
            let (_, rest) = carve_block(block, 1, 1);
            assert!(rest.is_empty());
            SystemBlocks.release_block(block, size);
        }
    }
}
