// Copyright (c) 2025 RustyDB Contributors
//
// ABA-safe lock-free stack over a fixed-capacity node arena.
//
// The classic Treiber stack packs a generation counter into the unused
// high bits of a 64-bit pointer, which only works on platforms that leave
// pointer bits free (48-bit virtual addresses on x86_64). That is not
// portable, so instead of pointers this stack hands out 32-bit indices
// into a preallocated arena and packs a 32-bit generation counter above
// them in a single AtomicU64 "top" word. Because arena slots are never
// freed back to the allocator -- only recycled via a second lock-free
// list that reuses the same slot storage -- the generation counter alone
// is enough to defeat ABA without hazard pointers or epochs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{DbError, Result};

const NIL: u32 = u32::MAX;

fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct Slot<T> {
    value: UnsafeCell<Option<T>>,
    next: AtomicU32,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            value: UnsafeCell::new(None),
            next: AtomicU32::new(NIL),
        }
    }
}

/// A fixed-capacity, ABA-safe LIFO stack for small `Copy` values.
///
/// `push`/`pop` are lock-free: every retry loop makes progress via CAS on
/// a single 64-bit word, never a mutex. Capacity is fixed at construction;
/// `push` past capacity returns [`DbError::OutOfMemory`] rather than
/// growing, which matches every concrete user of this type in this crate
/// (the buffer pool's free-frame list has a hard capacity of `numFrames`).
pub struct LockFreeStack<T: Copy> {
    arena: Box<[Slot<T>]>,
    top: AtomicU64,
    free_top: AtomicU64,
    len: AtomicU32,
}

// SAFETY: access to slot contents is mediated entirely through the CAS
// loops on `top`/`free_top`; a slot's value is only read by the thread
// that won the pop linking it off `top`, and only written by the thread
// that won a slot off `free_top`.
unsafe impl<T: Copy + Send> Send for LockFreeStack<T> {}
unsafe impl<T: Copy + Send> Sync for LockFreeStack<T> {}

impl<T: Copy> LockFreeStack<T> {
    /// Create an empty stack with room for `capacity` live entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut arena = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let slot = Slot::empty();
            let next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
            slot.next.store(next, Ordering::Relaxed);
            arena.push(slot);
        }
        let free_top = if capacity == 0 { NIL } else { 0 };
        Self {
            arena: arena.into_boxed_slice(),
            top: AtomicU64::new(pack(0, NIL)),
            free_top: AtomicU64::new(pack(0, free_top)),
            len: AtomicU32::new(0),
        }
    }

    /// Number of capacity this stack was constructed with.
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push `value` onto the stack.
    ///
    /// Fails with [`DbError::OutOfMemory`] if every arena slot is
    /// currently occupied.
    pub fn push(&self, value: T) -> Result<()> {
        let index = self.take_free_slot()?;
        // SAFETY: this slot was just removed from the free list, so no
        // other thread can observe or mutate it until we link it onto
        // `top` below.
        unsafe {
            *self.arena[index as usize].value.get() = Some(value);
        }

        let mut top = self.top.load(Ordering::Acquire);
        loop {
            let (generation, head) = unpack(top);
            self.arena[index as usize].next.store(head, Ordering::Relaxed);
            let new_top = pack(generation.wrapping_add(1), index);
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(observed) => top = observed,
            }
        }
    }

    /// Pop the most recently pushed value, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            let (generation, head) = unpack(top);
            if head == NIL {
                return None;
            }
            let next = self.arena[head as usize].next.load(Ordering::Acquire);
            let new_top = pack(generation.wrapping_add(1), next);
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: we won the CAS that unlinked `head` from the
                    // live stack, so we are the sole owner of its value
                    // until we return the slot to the free list.
                    let value = unsafe { (*self.arena[head as usize].value.get()).take() };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    self.release_slot(head);
                    return value;
                }
                Err(observed) => top = observed,
            }
        }
    }

    fn take_free_slot(&self) -> Result<u32> {
        let mut top = self.free_top.load(Ordering::Acquire);
        loop {
            let (generation, head) = unpack(top);
            if head == NIL {
                return Err(DbError::OutOfMemory(format!(
                    "lock-free stack exhausted its {}-slot arena",
                    self.arena.len()
                )));
            }
            let next = self.arena[head as usize].next.load(Ordering::Acquire);
            let new_top = pack(generation.wrapping_add(1), next);
            match self.free_top.compare_exchange_weak(
                top,
                new_top,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(head),
                Err(observed) => top = observed,
            }
        }
    }

    fn release_slot(&self, index: u32) {
        let mut top = self.free_top.load(Ordering::Acquire);
        loop {
            let (generation, head) = unpack(top);
            self.arena[index as usize].next.store(head, Ordering::Relaxed);
            let new_top = pack(generation.wrapping_add(1), index);
            match self.free_top.compare_exchange_weak(
                top,
                new_top,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => top = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lifo_order_single_thread() {
        let stack = LockFreeStack::with_capacity(8);
        for v in 0..5 {
            stack.push(v).unwrap();
        }
        let popped: Vec<_> = std::iter::from_fn(|| stack.pop()).collect();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn empty_pop_returns_none() {
        let stack: LockFreeStack<u32> = LockFreeStack::with_capacity(4);
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn push_past_capacity_fails() {
        let stack = LockFreeStack::with_capacity(2);
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert!(stack.push(3).is_err());
    }

    #[test]
    fn push_pop_push_recycles_slot_without_aba() {
        let stack = LockFreeStack::with_capacity(1);
        stack.push(10).unwrap();
        assert_eq!(stack.pop(), Some(10));
        stack.push(20).unwrap();
        assert_eq!(stack.pop(), Some(20));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn conservation_under_concurrency() {
        let stack = Arc::new(LockFreeStack::with_capacity(1000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                for i in 0..250u32 {
                    stack.push(t * 250 + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut popped = HashSet::new();
        while let Some(v) = stack.pop() {
            assert!(popped.insert(v), "duplicate pop: {v}");
        }
        assert_eq!(popped.len(), 1000);
        assert_eq!(popped, (0..1000).collect::<HashSet<_>>());
    }

    #[test]
    fn concurrent_push_and_pop_conserve_total() {
        let stack = Arc::new(LockFreeStack::with_capacity(2000));
        let pushers: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        stack.push(t * 250 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in pushers {
            h.join().unwrap();
        }

        let popped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let poppers: Vec<_> = (0..4)
            .map(|_| {
                let stack = Arc::clone(&stack);
                let popped = Arc::clone(&popped);
                thread::spawn(move || loop {
                    match stack.pop() {
                        Some(v) => popped.lock().push(v),
                        None => break,
                    }
                })
            })
            .collect();
        for h in poppers {
            h.join().unwrap();
        }

        let popped = popped.lock();
        let set: HashSet<_> = popped.iter().copied().collect();
        assert_eq!(set.len(), 1000);
        assert_eq!(set, (0..1000).collect::<HashSet<_>>());
    }
}
