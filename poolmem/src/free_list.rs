//! Intrusive free lists and the direct-mapped size-class table
//!
//! A free slice stores nothing but the link to the next free slice of the
//! same size class, in its first word. The lists here never own memory;
//! they only thread through slices carved out of blocks that the
//! [BlockChain](crate::block::BlockChain) owns.

use std::{
    fmt::Debug,
    ops::{Index, IndexMut},
    ptr::NonNull,
};

use crate::util::UsizePtr;

/// Contents of a slice while it sits on a free list
#[repr(C)]
pub struct FreeSlice {
    // DO NOT MODIFY
    // a slice only has to be one word, so this must stay the only field
    next: Option<NonNull<FreeSlice>>,
}

impl FreeSlice {
    /// Read the link of a free slice
    ///
    /// # Safety
    /// `this` must point to a slice that is currently on a free list
    /// owned by the caller.
    #[inline]
    pub unsafe fn load_next(this: NonNull<FreeSlice>) -> Option<NonNull<FreeSlice>> {
        (*this.as_ptr()).next
    }

    /// Overwrite the link of a slice, making it a free slice
    ///
    /// # Safety
    /// `this` must point to at least one writable, word-aligned word that no
    /// one else is using.
    #[inline]
    pub unsafe fn store_next(this: NonNull<FreeSlice>, next: Option<NonNull<FreeSlice>>) {
        this.as_ptr().write(FreeSlice { next });
    }
}

/// Head-only free list, as kept in a thread cache
#[derive(Default)]
pub struct FreeList {
    head: Option<NonNull<FreeSlice>>,
}

impl Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("head", &self.head.map(UsizePtr::from))
            .finish()
    }
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Wrap an already-terminated chain
    pub fn from_head(head: Option<NonNull<FreeSlice>>) -> Self {
        Self { head }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Detach the whole chain, leaving this list empty
    #[inline]
    pub fn take(&mut self) -> Option<NonNull<FreeSlice>> {
        self.head.take()
    }

    /// Remove the first slice
    ///
    /// # Safety
    /// Every slice on this list must still be free and owned by the list.
    #[inline]
    pub unsafe fn pop(&mut self) -> Option<NonNull<FreeSlice>> {
        let slice = self.head?;
        self.head = FreeSlice::load_next(slice);
        Some(slice)
    }

    /// Push one slice onto the front
    ///
    /// # Safety
    /// `slice` must be a writable, word-aligned slice not on any other list.
    #[inline]
    pub unsafe fn push(&mut self, slice: NonNull<FreeSlice>) {
        FreeSlice::store_next(slice, self.head);
        self.head = Some(slice);
    }

    /// Put the chain `head..=tail` in front of this list in O(1)
    ///
    /// # Safety
    /// `head` must reach `tail` by following links, and none of the slices
    /// may be on any other list.
    #[inline]
    pub unsafe fn splice_front(&mut self, head: NonNull<FreeSlice>, tail: NonNull<FreeSlice>) {
        FreeSlice::store_next(tail, self.head);
        self.head = Some(head);
    }

    /// Walk the list once, returning its last slice and its length
    ///
    /// # Safety
    /// Every slice on this list must still be free and owned by the list.
    pub unsafe fn tail_and_len(&self) -> Option<(NonNull<FreeSlice>, usize)> {
        let mut tail = self.head?;
        let mut len = 1;
        while let Some(next) = FreeSlice::load_next(tail) {
            tail = next;
            len += 1;
        }
        Some((tail, len))
    }

    /// Iterate over the slices, front to back
    ///
    /// # Safety
    /// The list must not be modified while the iterator is alive, and every
    /// slice on it must still be free.
    pub unsafe fn iter(&self) -> FreeListIter<'_> {
        FreeListIter {
            cur: self.head,
            _list: self,
        }
    }
}

/// Iterator returned by [FreeList::iter]
pub struct FreeListIter<'list> {
    cur: Option<NonNull<FreeSlice>>,
    _list: &'list FreeList,
}

impl<'list> Iterator for FreeListIter<'list> {
    type Item = NonNull<FreeSlice>;

    fn next(&mut self) -> Option<Self::Item> {
        let slice = self.cur?;
        // safety: upheld by the caller of FreeList::iter
        self.cur = unsafe { FreeSlice::load_next(slice) };
        Some(slice)
    }
}

/// Free list that also knows its length, as kept in the global pool
#[derive(Debug, Default)]
pub struct CountedList {
    list: FreeList,
    len: usize,
}

impl CountedList {
    pub const fn new() -> Self {
        Self {
            list: FreeList::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn list(&self) -> &FreeList {
        &self.list
    }

    /// Put a chain of `len` slices in front of this list
    ///
    /// # Safety
    /// Same as [FreeList::splice_front], and the chain must have exactly
    /// `len` slices.
    pub unsafe fn splice_front(
        &mut self,
        head: NonNull<FreeSlice>,
        tail: NonNull<FreeSlice>,
        len: usize,
    ) {
        self.list.splice_front(head, tail);
        self.len += len;
    }

    /// Cut the first `n` slices off this list
    ///
    /// Returns the first slice and the remaining `n - 1` as a separate list.
    /// Costs O(n), independent of how long this list is.
    ///
    /// # Safety
    /// Every slice on this list must still be free and owned by the list.
    pub unsafe fn detach_front(&mut self, n: usize) -> Option<(NonNull<FreeSlice>, FreeList)> {
        if n == 0 || n > self.len {
            return None;
        }
        let first = self.list.head?;
        let mut last = first;
        for _ in 1..n {
            last = FreeSlice::load_next(last)?;
        }
        self.list.head = FreeSlice::load_next(last);
        self.len -= n;
        FreeSlice::store_next(last, None);
        let rest = FreeSlice::load_next(first);
        Some((first, FreeList::from_head(rest)))
    }

    /// Relink this list in ascending address order
    ///
    /// `scratch` is cleared and reused as the sort buffer.
    ///
    /// # Safety
    /// Every slice on this list must still be free and owned by the list.
    pub unsafe fn sort_by_address(&mut self, scratch: &mut Vec<NonNull<FreeSlice>>) {
        if self.len <= 1 {
            return;
        }
        scratch.clear();
        scratch.extend(self.list.iter());
        debug_assert_eq!(scratch.len(), self.len);
        scratch.sort_unstable_by_key(|p| p.as_ptr() as usize);
        for pair in scratch.windows(2) {
            FreeSlice::store_next(pair[0], Some(pair[1]));
        }
        if let Some(&last) = scratch.last() {
            FreeSlice::store_next(last, None);
        }
        self.list.head = scratch.first().copied();
    }

    /// Give up the whole list, resetting the count
    pub fn take(&mut self) -> FreeList {
        self.len = 0;
        FreeList::from_head(self.list.take())
    }
}

/// Table of free lists, direct-mapped by exact request size
///
/// Entry 0 exists only so that sizes index the table directly; it is
/// never used.
pub struct SizeClassTable<L> {
    classes: Box<[L]>,
}

impl<L: Default> SizeClassTable<L> {
    pub fn new(max_size: usize) -> Self {
        Self {
            classes: (0..max_size).map(|_| L::default()).collect(),
        }
    }
}

impl<L> SizeClassTable<L> {
    /// Exclusive upper bound on sizes
    #[inline]
    pub fn max_size(&self) -> usize {
        self.classes.len()
    }

    /// All usable size classes with their lists
    pub fn iter(&self) -> impl Iterator<Item = (usize, &L)> {
        self.classes.iter().enumerate().skip(1)
    }

    /// All usable size classes with their lists
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut L)> {
        self.classes.iter_mut().enumerate().skip(1)
    }
}

impl<L> Index<usize> for SizeClassTable<L> {
    type Output = L;

    #[inline]
    fn index(&self, size: usize) -> &L {
        &self.classes[size]
    }
}

impl<L> IndexMut<usize> for SizeClassTable<L> {
    #[inline]
    fn index_mut(&mut self, size: usize) -> &mut L {
        &mut self.classes[size]
    }
}

impl<L: Debug> Debug for SizeClassTable<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassTable")
            .field("max_size", &self.max_size())
            .finish_non_exhaustive()
    }
}

/// Link caller-held slices into a chain for
/// [ThreadCache::deallocate_list](crate::ThreadCache::deallocate_list)
///
/// Returns `(head, tail)`, or `None` for an empty slice.
///
/// # Safety
/// Every pointer must be a live allocation from the pool that the caller is
/// giving up; the first word of each is overwritten.
pub unsafe fn link_chain(slices: &[NonNull<u8>]) -> Option<(NonNull<u8>, NonNull<u8>)> {
    let (&head, _) = slices.split_first()?;
    let &tail = slices.last()?;
    for pair in slices.windows(2) {
        FreeSlice::store_next(pair[0].cast(), Some(pair[1].cast()));
    }
    FreeSlice::store_next(tail.cast(), None);
    Some((head, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing storage for slices in these tests
    fn words(n: usize) -> Vec<usize> {
        vec![0usize; n]
    }

    fn slice_at(buf: &mut [usize], i: usize) -> NonNull<FreeSlice> {
        NonNull::from(&mut buf[i]).cast()
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut buf = words(3);
        let a = slice_at(&mut buf, 0);
        let b = slice_at(&mut buf, 1);
        let c = slice_at(&mut buf, 2);
        let mut list = FreeList::new();
        unsafe {
            list.push(a);
            list.push(b);
            list.push(c);
            assert_eq!(list.tail_and_len(), Some((a, 3)));
            assert_eq!(list.pop(), Some(c));
            assert_eq!(list.pop(), Some(b));
            assert_eq!(list.pop(), Some(a));
            assert_eq!(list.pop(), None);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn counted_detach_front() {
        let mut buf = words(5);
        let slices: Vec<_> = (0..5).map(|i| slice_at(&mut buf, i)).collect();
        let mut counted = CountedList::new();
        unsafe {
            for &s in slices.iter().rev() {
                counted.splice_front(s, s, 1);
            }
            assert_eq!(counted.len(), 5);

            assert!(counted.detach_front(6).is_none());
            assert!(counted.detach_front(0).is_none());

            let (first, rest) = counted.detach_front(3).unwrap();
            assert_eq!(first, slices[0]);
            assert_eq!(rest.iter().collect::<Vec<_>>(), &slices[1..3]);
            assert_eq!(counted.len(), 2);
            assert_eq!(counted.list().iter().collect::<Vec<_>>(), &slices[3..5]);

            let (first, rest) = counted.detach_front(2).unwrap();
            assert_eq!(first, slices[3]);
            assert_eq!(rest.iter().collect::<Vec<_>>(), &slices[4..5]);
            assert!(counted.is_empty());
            assert!(counted.list().is_empty());
        }
    }

    #[test]
    fn counted_sort_by_address() {
        let mut buf = words(6);
        let slices: Vec<_> = (0..6).map(|i| slice_at(&mut buf, i)).collect();
        let mut counted = CountedList::new();
        unsafe {
            for i in [3, 0, 5, 1, 4, 2] {
                counted.splice_front(slices[i], slices[i], 1);
            }
            let mut scratch = Vec::new();
            counted.sort_by_address(&mut scratch);
            assert_eq!(counted.list().iter().collect::<Vec<_>>(), slices);
            assert_eq!(counted.len(), 6);
        }
    }

    #[test]
    fn link_chain_links_in_order() {
        let mut buf = words(4);
        let ptrs: Vec<NonNull<u8>> = (0..4).map(|i| slice_at(&mut buf, i).cast()).collect();
        unsafe {
            assert!(link_chain(&[]).is_none());
            let (head, tail) = link_chain(&ptrs).unwrap();
            assert_eq!(head, ptrs[0]);
            assert_eq!(tail, ptrs[3]);
            let list = FreeList::from_head(Some(head.cast()));
            let walked: Vec<NonNull<u8>> = list.iter().map(|p| p.cast()).collect();
            assert_eq!(walked, ptrs);
        }
    }

    #[test]
    fn table_skips_entry_zero() {
        let table = SizeClassTable::<CountedList>::new(4);
        assert_eq!(table.max_size(), 4);
        assert_eq!(
            table.iter().map(|(sz, _)| sz).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
