// Copyright (c) 2026 Anillo OS Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate alloc;

use crate::{
    ilist::{Link, LinkIter},
    intrusive::Adapter,
};
use alloc::boxed::Box;
use core::{
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

/// Control block of a [`Shared`]. Kernel objects that live in static
/// storage embed one directly; heap objects get one through
/// [`Shared::new`]. No weak counter: cycles are broken by the intrusive
/// lists never owning their nodes past unlink.
#[derive(Debug)]
pub struct SharedInner<T: Sized> {
    data: T,
    rc: AtomicUsize,
}

impl<T: Sized> SharedInner<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data,
            rc: AtomicUsize::new(1),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.rc.load(Ordering::Relaxed)
    }

    /// Retains unless the count has already reached zero. This is how
    /// stale handles to retired objects are rejected.
    pub fn try_retain(&self) -> Option<Shared<T>> {
        let mut rc = self.rc.load(Ordering::Relaxed);
        loop {
            if rc == 0 {
                return None;
            }
            match self
                .rc
                .compare_exchange_weak(rc, rc + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    return Some(Shared {
                        inner: NonNull::from(self),
                    })
                }
                Err(cur) => rc = cur,
            }
        }
    }

    /// Drops one reference without reclaiming storage. Only for inners
    /// whose memory is managed externally (static storage). Returns
    /// true when this was the last reference.
    ///
    /// # Safety
    ///
    /// Must never be paired with a [`Shared`] drop for the same
    /// conceptual reference, and the inner must not be heap-owned.
    pub unsafe fn release_raw(&self) -> bool {
        let old = self.rc.fetch_sub(1, Ordering::Release);
        assert_ne!(old, 0);
        old == 1
    }
}

unsafe impl<T> Send for SharedInner<T> {}
unsafe impl<T> Sync for SharedInner<T> {}

// repr(transparent) keeps Option<Shared<T>> pointer-sized.
#[derive(Debug)]
#[repr(transparent)]
pub struct Shared<T: Sized> {
    inner: NonNull<SharedInner<T>>,
}

impl<T> Shared<T> {
    #[inline]
    pub fn new(data: T) -> Self {
        let b = Box::new(SharedInner::new(data));
        Self {
            inner: unsafe { NonNull::new_unchecked(Box::into_raw(b)) },
        }
    }

    /// Adopts a static control block. The caller's static reference is
    /// the one the initial count of 1 accounts for; it must never be
    /// dropped through [`Shared`].
    ///
    /// # Safety
    ///
    /// `inner` must be in static storage and this must be called at
    /// most once per block.
    #[inline]
    pub const unsafe fn from_static(inner: &'static SharedInner<T>) -> Self {
        Shared {
            inner: NonNull::new_unchecked(inner as *const _ as *mut SharedInner<T>),
        }
    }

    /// Stable address of the control block; usable as an opaque id for
    /// the object's lifetime.
    #[inline]
    pub fn handle(this: &Self) -> *const u8 {
        this.inner.as_ptr() as *const u8
    }

    #[inline]
    pub fn strong_count(this: &Self) -> usize {
        unsafe { this.inner.as_ref() }.count()
    }

    #[inline]
    pub fn same(a: &Self, b: &Self) -> bool {
        a.inner == b.inner
    }

    /// Retains the object owning `data`, failing once the count has
    /// dropped to zero.
    ///
    /// # Safety
    ///
    /// `data` must be managed by a live `SharedInner<T>`.
    pub unsafe fn try_retain(data: &T) -> Option<Shared<T>> {
        let ptr = (data as *const T as *const u8).sub(core::mem::offset_of!(SharedInner<T>, data))
            as *const SharedInner<T>;
        (*ptr).try_retain()
    }

    /// # Safety
    ///
    /// The count must stay balanced by a later decrement.
    #[inline]
    pub unsafe fn increment_count(this: &Self) {
        let old = this.inner.as_ref().rc.fetch_add(1, Ordering::Relaxed);
        assert_ne!(old, 0);
    }

    /// # Safety
    ///
    /// Must not drop the count to zero: that path belongs to `Drop`.
    #[inline]
    pub unsafe fn decrement_count(this: &Self) {
        let old = this.inner.as_ref().rc.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 1);
    }
}

impl<T: Sized> Clone for Shared<T> {
    #[inline]
    fn clone(&self) -> Self {
        let old = unsafe { self.inner.as_ref() }
            .rc
            .fetch_add(1, Ordering::Relaxed);
        assert!(old >= 1);
        Shared { inner: self.inner }
    }
}

impl<T: Sized> Drop for Shared<T> {
    #[inline]
    fn drop(&mut self) {
        let old = unsafe { self.inner.as_ref() }
            .rc
            .fetch_sub(1, Ordering::Release);
        if old != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // Static control blocks must never reach zero.
        drop(unsafe { Box::from_raw(self.inner.as_ptr()) });
    }
}

impl<T: Sized> Deref for Shared<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &self.inner.as_ref().data }
    }
}

// Shared is a pointer to the value, not the value itself.
unsafe impl<T: Sized> Send for Shared<T> {}
unsafe impl<T: Sized> Sync for Shared<T> {}

/// Counted FIFO of [`Shared`] values linked through the adapter's
/// embedded [`Link`]. The list shares ownership of every linked value.
///
/// Must not move once an element has been linked (the sentinel links
/// point at each other). Access is serialized by the owning lock.
#[derive(Debug)]
pub struct SharedList<T: Sized, A: Adapter> {
    len: usize,
    head: Link<T, A>,
    tail: Link<T, A>,
    _t: PhantomData<T>,
}

impl<T: Sized, A: Adapter> Default for SharedList<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sized, A: Adapter> SharedList<T, A> {
    pub const fn new() -> Self {
        Self {
            len: 0,
            head: Link::new(),
            tail: Link::new(),
            _t: PhantomData,
        }
    }

    // Sentinels can't reference each other in a const context, so the
    // chain is closed on first use.
    #[inline]
    fn ensure_init(&mut self) {
        if self.head.next.is_none() {
            let ok = unsafe {
                Link::link_after(NonNull::from(&mut self.head), NonNull::from(&self.tail))
            };
            debug_assert!(ok);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn link_of(this: &Shared<T>) -> NonNull<Link<T, A>> {
        let ptr = this.deref() as *const T as *const u8;
        NonNull::from(unsafe { &*(ptr.add(A::offset()) as *const Link<T, A>) })
    }

    /// Rebuilds a retained handle from a linked node.
    ///
    /// # Safety
    ///
    /// `node` must be a link embedded in a `Shared`-managed `T`.
    pub unsafe fn retain_from_link(node: &Link<T, A>) -> Shared<T> {
        let owner: &T = node.owner();
        Shared::try_retain(owner).expect("linked node owner already retired")
    }

    pub fn push_back(&mut self, me: Shared<T>) -> bool {
        self.ensure_init();
        let node = Self::link_of(&me);
        if !unsafe { Link::link_before(NonNull::from(&mut self.tail), node) } {
            return false;
        }
        // The list keeps its own reference.
        unsafe { Shared::increment_count(&me) };
        self.len += 1;
        true
    }

    pub fn pop_front(&mut self) -> Option<Shared<T>> {
        if self.len == 0 {
            return None;
        }
        let first = self.head.next.expect("non-empty list has a first node");
        debug_assert_ne!(first, NonNull::from(&self.tail));
        let me = unsafe { Self::retain_from_link(first.as_ref()) };
        let ok = unsafe { Link::unlink(first) };
        debug_assert!(ok);
        // Ownership moves from the list to the caller.
        unsafe { Shared::decrement_count(&me) };
        self.len -= 1;
        Some(me)
    }

    pub fn front(&self) -> Option<Shared<T>> {
        if self.len == 0 {
            return None;
        }
        let first = self.head.next.expect("non-empty list has a first node");
        Some(unsafe { Self::retain_from_link(first.as_ref()) })
    }

    /// Unlinks `me` from this list. `me` must either be unlinked or be
    /// on this very list; unlinking through the wrong list corrupts
    /// both counts.
    pub fn remove(&mut self, me: &Shared<T>) -> bool {
        let node = Self::link_of(me);
        if !unsafe { Link::unlink(node) } {
            return false;
        }
        unsafe { Shared::decrement_count(me) };
        self.len -= 1;
        true
    }

    pub fn clear(&mut self) -> usize {
        let mut n = 0;
        while self.pop_front().is_some() {
            n += 1;
        }
        n
    }

    pub fn iter(&self) -> SharedListIter<T, A> {
        SharedListIter {
            it: LinkIter::new(self.head.next, Some(NonNull::from(&self.tail))),
        }
    }
}

impl<T: Sized, A: Adapter> Drop for SharedList<T, A> {
    fn drop(&mut self) {
        // Dropping a populated list would leak the list's references;
        // owners clear() first.
        debug_assert_eq!(self.len, 0);
    }
}

/// Yields retained handles; the current element may be removed from the
/// list while iterating.
pub struct SharedListIter<T, A: Adapter> {
    it: LinkIter<T, A>,
}

impl<T, A: Adapter> Iterator for SharedListIter<T, A> {
    type Item = Shared<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.it.next()?;
        Some(unsafe { SharedList::<T, A>::retain_from_link(node.as_ref()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_adapter;

    #[derive(Default, Debug)]
    struct Job {
        run_node: Link<Job, ViaRunNode>,
        done_node: Link<Job, ViaDoneNode>,
        id: usize,
    }
    link_adapter!(ViaRunNode, Job, run_node);
    link_adapter!(ViaDoneNode, Job, done_node);

    type RunList = SharedList<Job, ViaRunNode>;
    type DoneList = SharedList<Job, ViaDoneNode>;

    fn job(id: usize) -> Shared<Job> {
        Shared::new(Job {
            id,
            ..Default::default()
        })
    }

    #[test]
    fn push_pop_fifo() {
        let mut l = RunList::new();
        for i in 0..16 {
            let j = job(i);
            assert_eq!(Shared::strong_count(&j), 1);
            assert!(l.push_back(j.clone()));
            assert_eq!(Shared::strong_count(&j), 2);
        }
        assert_eq!(l.len(), 16);
        for i in 0..16 {
            let j = l.pop_front().unwrap();
            assert_eq!(j.id, i);
            assert_eq!(Shared::strong_count(&j), 1);
        }
        assert!(l.pop_front().is_none());
        assert!(l.is_empty());
    }

    #[test]
    fn double_link_refused() {
        let mut l = RunList::new();
        let j = job(0);
        assert!(l.push_back(j.clone()));
        assert!(!l.push_back(j.clone()));
        assert_eq!(l.len(), 1);
        l.clear();
    }

    #[test]
    fn two_lists_one_value() {
        let mut run = RunList::new();
        let mut done = DoneList::new();
        let j = job(3);
        assert!(run.push_back(j.clone()));
        assert!(done.push_back(j.clone()));
        assert_eq!(Shared::strong_count(&j), 3);
        assert!(run.remove(&j));
        assert_eq!(Shared::strong_count(&j), 2);
        let popped = done.pop_front().unwrap();
        assert!(Shared::same(&popped, &j));
    }

    #[test]
    fn remove_middle_keeps_order() {
        let mut l = RunList::new();
        let jobs: alloc::vec::Vec<_> = (0..5).map(job).collect();
        for j in &jobs {
            l.push_back(j.clone());
        }
        assert!(l.remove(&jobs[2]));
        assert!(!l.remove(&jobs[2]));
        let order: alloc::vec::Vec<_> = core::iter::from_fn(|| l.pop_front())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, [0, 1, 3, 4]);
    }

    #[test]
    fn iter_retains_and_allows_removal() {
        let mut l = RunList::new();
        for i in 0..4 {
            l.push_back(job(i));
        }
        for j in l.iter() {
            assert_eq!(Shared::strong_count(&j), 2);
        }
        let snapshot: alloc::vec::Vec<_> = l.iter().collect();
        for j in &snapshot {
            assert!(l.remove(j));
        }
        assert!(l.is_empty());
    }

    #[test]
    fn try_retain_fails_after_zero() {
        static GONE: SharedInner<u32> = SharedInner::new(9);
        assert_eq!(GONE.count(), 1);
        let extra = GONE.try_retain().unwrap();
        drop(extra);
        // Simulate the final release of an externally managed block.
        assert!(unsafe { GONE.release_raw() });
        assert!(GONE.try_retain().is_none());
    }

    #[test]
    fn handle_is_stable() {
        let j = job(1);
        let h = Shared::handle(&j);
        let c = j.clone();
        assert_eq!(h, Shared::handle(&c));
        assert!(Shared::same(&j, &c));
    }
}
