//! Page lists
//!
//! The free, modified, and standby lists are intrusive doubly-linked lists
//! threaded through the PFN link fields by frame number, with frame 0 as
//! the null link. Each list owns a lock and a page count; the count is
//! also readable without the lock for the scheduler's statistics.
//!
//! Lock discipline: the link fields of a frame belong to the list lock,
//! while the frame's other fields belong to its PFN lock, which orders
//! *before* the list lock. Operations that take a frame off a list
//! therefore acquire the PFN lock by trylock while walking under the list
//! lock, skipping frames another thread is working on, so the reversed
//! acquisition can never wait.

use core::sync::atomic::{AtomicU64, Ordering};

use super::pfn::Pfn;

type PfnGuard<'a> = spin::MutexGuard<'a, ()>;

struct ListInner {
    head: u64,
    tail: u64,
}

/// One of the free/modified/standby lists.
pub struct PageList {
    name: &'static str,
    inner: spin::Mutex<ListInner>,
    num_pages: AtomicU64,
}

impl PageList {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(ListInner { head: 0, tail: 0 }),
            num_pages: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Page count, readable without the list lock.
    #[inline]
    pub fn len(&self) -> u64 {
        self.num_pages.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_tail_locked(inner: &mut ListInner, pfns: &[Pfn], frame: u64) {
        let pfn = &pfns[frame as usize];
        pfn.flink.store(0, Ordering::Relaxed);
        pfn.blink.store(inner.tail, Ordering::Relaxed);
        if inner.tail == 0 {
            inner.head = frame;
        } else {
            pfns[inner.tail as usize].flink.store(frame, Ordering::Relaxed);
        }
        inner.tail = frame;
    }

    fn unlink_locked(inner: &mut ListInner, pfns: &[Pfn], frame: u64) {
        let pfn = &pfns[frame as usize];
        let flink = pfn.flink.load(Ordering::Relaxed);
        let blink = pfn.blink.load(Ordering::Relaxed);

        if blink == 0 {
            inner.head = flink;
        } else {
            pfns[blink as usize].flink.store(flink, Ordering::Relaxed);
        }
        if flink == 0 {
            inner.tail = blink;
        } else {
            pfns[flink as usize].blink.store(blink, Ordering::Relaxed);
        }
        pfn.flink.store(0, Ordering::Relaxed);
        pfn.blink.store(0, Ordering::Relaxed);
    }

    /// Link a frame at the tail. The caller holds the frame's PFN lock (or
    /// has exclusive ownership of a frame no other thread can see).
    pub fn push_tail(&self, pfns: &[Pfn], frame: u64) {
        let mut inner = self.inner.lock();
        Self::push_tail_locked(&mut inner, pfns, frame);
        self.num_pages.fetch_add(1, Ordering::AcqRel);
    }

    /// Link a frame at the head. Same ownership requirement as push_tail.
    pub fn push_head(&self, pfns: &[Pfn], frame: u64) {
        let mut inner = self.inner.lock();
        let pfn = &pfns[frame as usize];
        pfn.blink.store(0, Ordering::Relaxed);
        pfn.flink.store(inner.head, Ordering::Relaxed);
        if inner.head == 0 {
            inner.tail = frame;
        } else {
            pfns[inner.head as usize].blink.store(frame, Ordering::Relaxed);
        }
        inner.head = frame;
        self.num_pages.fetch_add(1, Ordering::AcqRel);
    }

    /// Pop the first frame whose PFN lock can be taken without waiting.
    /// Returns the frame with its lock still held.
    pub fn pop_head<'a>(&self, pfns: &'a [Pfn]) -> Option<(u64, PfnGuard<'a>)> {
        let mut inner = self.inner.lock();
        let mut current = inner.head;
        while current != 0 {
            let next = pfns[current as usize].flink.load(Ordering::Relaxed);
            if let Some(guard) = pfns[current as usize].lock.try_lock() {
                Self::unlink_locked(&mut inner, pfns, current);
                self.num_pages.fetch_sub(1, Ordering::AcqRel);
                return Some((current, guard));
            }
            current = next;
        }
        None
    }

    /// Pop up to `max` frames from the head, each returned with its PFN
    /// lock held. Frames whose locks are contended stay on the list.
    pub fn batch_pop<'a>(&self, pfns: &'a [Pfn], max: usize) -> Vec<(u64, PfnGuard<'a>)> {
        let mut popped = Vec::with_capacity(max);
        if max == 0 {
            return popped;
        }
        let mut inner = self.inner.lock();
        let mut current = inner.head;
        while current != 0 && popped.len() < max {
            let next = pfns[current as usize].flink.load(Ordering::Relaxed);
            if let Some(guard) = pfns[current as usize].lock.try_lock() {
                Self::unlink_locked(&mut inner, pfns, current);
                popped.push((current, guard));
            }
            current = next;
        }
        if !popped.is_empty() {
            self.num_pages
                .fetch_sub(popped.len() as u64, Ordering::AcqRel);
        }
        popped
    }

    /// Splice a chain of frames onto the tail. The caller holds every
    /// frame's PFN lock.
    pub fn link_tail_chain(&self, pfns: &[Pfn], frames: &[u64]) {
        if frames.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for &frame in frames {
            Self::push_tail_locked(&mut inner, pfns, frame);
        }
        self.num_pages
            .fetch_add(frames.len() as u64, Ordering::AcqRel);
    }

    /// Unlink a specific frame. The caller already holds the frame's PFN
    /// lock.
    pub fn remove(&self, pfns: &[Pfn], frame: u64) {
        let mut inner = self.inner.lock();
        Self::unlink_locked(&mut inner, pfns, frame);
        self.num_pages.fetch_sub(1, Ordering::AcqRel);
    }

    /// Snapshot the linked frames, head first.
    pub fn collect_frames(&self, pfns: &[Pfn]) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut frames = Vec::new();
        let mut current = inner.head;
        while current != 0 {
            frames.push(current);
            current = pfns[current as usize].flink.load(Ordering::Relaxed);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pfn_arena(count: usize) -> Vec<Pfn> {
        (0..count).map(|_| Pfn::new()).collect()
    }

    #[test]
    fn test_push_pop_fifo() {
        let pfns = pfn_arena(8);
        let list = PageList::new("test");

        list.push_tail(&pfns, 1);
        list.push_tail(&pfns, 2);
        list.push_tail(&pfns, 3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.collect_frames(&pfns), vec![1, 2, 3]);

        let (frame, guard) = list.pop_head(&pfns).unwrap();
        assert_eq!(frame, 1);
        drop(guard);
        assert_eq!(list.len(), 2);
        assert_eq!(list.collect_frames(&pfns), vec![2, 3]);
    }

    #[test]
    fn test_push_head() {
        let pfns = pfn_arena(8);
        let list = PageList::new("test");
        list.push_head(&pfns, 1);
        list.push_head(&pfns, 2);
        assert_eq!(list.collect_frames(&pfns), vec![2, 1]);
    }

    #[test]
    fn test_pop_head_skips_locked_frames() {
        let pfns = pfn_arena(8);
        let list = PageList::new("test");
        list.push_tail(&pfns, 1);
        list.push_tail(&pfns, 2);

        let held = pfns[1].lock.lock();
        let (frame, guard) = list.pop_head(&pfns).unwrap();
        assert_eq!(frame, 2);
        drop(guard);
        drop(held);

        assert_eq!(list.collect_frames(&pfns), vec![1]);
    }

    #[test]
    fn test_batch_pop_bounded() {
        let pfns = pfn_arena(8);
        let list = PageList::new("test");
        for frame in 1..=5 {
            list.push_tail(&pfns, frame);
        }

        let popped = list.batch_pop(&pfns, 3);
        let frames: Vec<u64> = popped.iter().map(|(frame, _)| *frame).collect();
        assert_eq!(frames, vec![1, 2, 3]);
        assert_eq!(list.len(), 2);
        drop(popped);

        let popped = list.batch_pop(&pfns, 10);
        assert_eq!(popped.len(), 2);
        drop(popped);
        assert!(list.is_empty());
        assert!(list.pop_head(&pfns).is_none());
    }

    #[test]
    fn test_link_tail_chain_and_remove() {
        let pfns = pfn_arena(8);
        let list = PageList::new("test");
        list.push_tail(&pfns, 1);

        let guards: Vec<_> = [4u64, 5, 6]
            .iter()
            .map(|&frame| pfns[frame as usize].lock.lock())
            .collect();
        list.link_tail_chain(&pfns, &[4, 5, 6]);
        drop(guards);
        assert_eq!(list.collect_frames(&pfns), vec![1, 4, 5, 6]);
        assert_eq!(list.len(), 4);

        let guard = pfns[5].lock.lock();
        list.remove(&pfns, 5);
        drop(guard);
        assert_eq!(list.collect_frames(&pfns), vec![1, 4, 6]);
        assert_eq!(list.len(), 3);

        // Removing the head and tail keeps the ends consistent.
        let guard = pfns[1].lock.lock();
        list.remove(&pfns, 1);
        drop(guard);
        let guard = pfns[6].lock.lock();
        list.remove(&pfns, 6);
        drop(guard);
        assert_eq!(list.collect_frames(&pfns), vec![4]);
    }
}
