/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Side-channel correlation FIFO.
//!
//! A hardware descriptor has no room for the caller's user tag or for the
//! buffer handles a result must be reported with. The submission path records
//! them here, one [`CorrelationEntry`] per logical request, in the order the
//! descriptors go into the command ring; the completion path pops them in the
//! order results come out of the result ring. Both rings are strictly FIFO,
//! so the two sequences line up.
//!
//! The queue is split into a [`FifoProducer`] owned by the submission lock and
//! a [`FifoConsumer`] owned by the completion lock. They share a fixed array of
//! slots and two indices; one slot always stays empty so that "full"
//! (`write + 1 == read`) and "empty" (`write == read`) are distinguishable.
//!
//! Pushes are staged: the consumer only sees them after
//! [`FifoProducer::publish`]. Until then [`FifoProducer::withdraw_last`] can
//! take the newest staged entry back, which is how a partially accepted batch
//! is rolled back without the consumer ever observing the withdrawn entries.

#[cfg(not(all(test, loom)))]
use alloc::sync::Arc;
use alloc::boxed::Box;
use alloc::vec::Vec;
#[cfg(not(all(test, loom)))]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(all(test, loom))]
use loom::cell::UnsafeCell;
#[cfg(all(test, loom))]
use loom::sync::Arc;
#[cfg(all(test, loom))]
use loom::sync::atomic::{AtomicUsize, Ordering};

use crate::dmabuf::BufferHandle;

#[cfg(not(all(test, loom)))]
#[derive(Debug)]
struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

#[cfg(not(all(test, loom)))]
impl<T> UnsafeCell<T> {
    fn new(val: T) -> Self {
        Self(core::cell::UnsafeCell::new(val))
    }

    fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.0.get())
    }

    fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}

/// Per-request metadata that does not fit in a ring descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub user_tag: u64,
    pub src: Option<BufferHandle>,
    pub dst: Option<BufferHandle>,
    pub token: Option<BufferHandle>,
    pub bypass_word_count: u32,
}

struct Shared {
    slots: Box<[UnsafeCell<CorrelationEntry>]>,
    /// Next slot the consumer reads. Written by the consumer only.
    read: AtomicUsize,
    /// One past the last published slot. Written by the producer only.
    write: AtomicUsize,
}

// SAFETY: a slot is written only by the producer while it lies outside
// [read, write) and read only by the consumer while it lies inside. The
// Release/Acquire pairs on `read` and `write` order those accesses.
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.size() - from) % self.size()
    }
}

/// Create a FIFO with `slots` slots, of which `slots - 1` are usable.
///
/// Returns `None` if `slots < 2`.
pub fn correlation_fifo(slots: usize) -> Option<(FifoProducer, FifoConsumer)> {
    if slots < 2 {
        return None;
    }

    let cells: Vec<_> = (0..slots)
        .map(|_| UnsafeCell::new(CorrelationEntry::default()))
        .collect();
    let shared = Arc::new(Shared {
        slots: cells.into_boxed_slice(),
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0),
    });

    Some((
        FifoProducer {
            shared: shared.clone(),
            write: 0,
            published: 0,
        },
        FifoConsumer { shared, read: 0 },
    ))
}

/// Submission side of the correlation FIFO.
pub struct FifoProducer {
    shared: Arc<Shared>,
    /// Next slot to write, including staged entries.
    write: usize,
    /// Value last stored into `shared.write`.
    published: usize,
}

impl core::fmt::Debug for FifoProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FifoProducer")
            .field("write", &self.write)
            .field("published", &self.published)
            .field("free", &self.free())
            .finish()
    }
}

impl FifoProducer {
    /// Stage `entry`. Returns false, without side effects, when full.
    pub fn push(&mut self, entry: CorrelationEntry) -> bool {
        let next = (self.write + 1) % self.shared.size();
        if next == self.shared.read.load(Ordering::Acquire) {
            return false;
        }

        self.shared.slots[self.write].with_mut(|slot| {
            // SAFETY: `self.write` is outside [read, write) so the consumer
            // does not touch this slot until it is published.
            unsafe { *slot = entry }
        });
        self.write = next;
        true
    }

    /// Take back the most recently staged entry.
    ///
    /// Returns `None` when nothing is staged: published entries belong to the
    /// consumer and cannot be withdrawn.
    pub fn withdraw_last(&mut self) -> Option<CorrelationEntry> {
        if self.write == self.published {
            return None;
        }

        self.write = (self.write + self.shared.size() - 1) % self.shared.size();
        let entry = self.shared.slots[self.write].with(|slot| {
            // SAFETY: staged slots are only ever accessed by the producer.
            unsafe { *slot }
        });
        Some(entry)
    }

    /// Make every staged entry visible to the consumer.
    pub fn publish(&mut self) {
        if self.write != self.published {
            self.shared.write.store(self.write, Ordering::Release);
            self.published = self.write;
        }
    }

    /// Number of staged, unpublished entries.
    pub fn staged(&self) -> usize {
        self.shared.distance(self.published, self.write)
    }

    /// Number of entries that can still be pushed.
    pub fn free(&self) -> usize {
        let read = self.shared.read.load(Ordering::Acquire);
        self.shared.size() - 1 - self.shared.distance(read, self.write)
    }

    /// Number of usable slots.
    pub fn capacity(&self) -> usize {
        self.shared.size() - 1
    }

    /// Write cursor, staged entries included.
    pub fn cursor(&self) -> usize {
        self.write
    }
}

/// Completion side of the correlation FIFO.
pub struct FifoConsumer {
    shared: Arc<Shared>,
    read: usize,
}

impl core::fmt::Debug for FifoConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FifoConsumer")
            .field("read", &self.read)
            .field("len", &self.len())
            .finish()
    }
}

impl FifoConsumer {
    /// Pop the oldest published entry.
    pub fn pop(&mut self) -> Option<CorrelationEntry> {
        if self.read == self.shared.write.load(Ordering::Acquire) {
            return None;
        }

        let entry = self.shared.slots[self.read].with(|slot| {
            // SAFETY: the slot is inside [read, write) and was published with
            // Release ordering before `write` moved past it.
            unsafe { *slot }
        });
        self.read = (self.read + 1) % self.shared.size();
        self.shared.read.store(self.read, Ordering::Release);
        Some(entry)
    }

    /// Number of published entries waiting to be popped.
    pub fn len(&self) -> usize {
        let write = self.shared.write.load(Ordering::Acquire);
        self.shared.distance(self.read, write)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn entry(tag: u64) -> CorrelationEntry {
        CorrelationEntry {
            user_tag: tag,
            bypass_word_count: tag as u32,
            ..Default::default()
        }
    }

    #[test]
    fn test_too_small() {
        assert!(correlation_fifo(0).is_none());
        assert!(correlation_fifo(1).is_none());
    }

    #[test]
    fn test_staged_entries_are_invisible_until_published() {
        let (mut tx, mut rx) = correlation_fifo(4).unwrap();
        assert!(tx.push(entry(1)));
        assert_eq!(tx.staged(), 1);
        assert!(rx.pop().is_none());

        tx.publish();
        assert_eq!(tx.staged(), 0);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.pop(), Some(entry(1)));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_keeps_one_slot_empty() {
        let (mut tx, mut rx) = correlation_fifo(4).unwrap();
        assert_eq!(tx.capacity(), 3);
        assert!(tx.push(entry(1)));
        assert!(tx.push(entry(2)));
        assert!(tx.push(entry(3)));
        assert_eq!(tx.free(), 0);
        assert!(!tx.push(entry(4)));
        assert_eq!(tx.cursor(), 3);

        tx.publish();
        assert_eq!(rx.pop(), Some(entry(1)));
        assert_eq!(tx.free(), 1);
        assert!(tx.push(entry(4)));
    }

    #[test]
    fn test_withdraw_last_in_reverse_order() {
        let (mut tx, mut rx) = correlation_fifo(8).unwrap();
        tx.push(entry(1));
        tx.publish();

        tx.push(entry(2));
        tx.push(entry(3));
        let cursor = tx.cursor();
        assert_eq!(tx.withdraw_last(), Some(entry(3)));
        assert_eq!(tx.withdraw_last(), Some(entry(2)));
        assert_eq!(tx.cursor(), cursor - 2);

        // published entries stay put
        assert_eq!(tx.withdraw_last(), None);
        tx.publish();
        assert_eq!(rx.pop(), Some(entry(1)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut tx, mut rx) = correlation_fifo(3).unwrap();
        for round in 0..10u64 {
            assert!(tx.push(entry(2 * round)));
            assert!(tx.push(entry(2 * round + 1)));
            tx.publish();
            assert_eq!(rx.pop(), Some(entry(2 * round)));
            assert_eq!(rx.pop(), Some(entry(2 * round + 1)));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_withdraw_across_wrap() {
        let (mut tx, mut rx) = correlation_fifo(3).unwrap();
        tx.push(entry(1));
        tx.publish();
        rx.pop();
        tx.push(entry(2)); // slot 1
        tx.push(entry(3)); // slot 2 -> wraps to 0
        assert_eq!(tx.cursor(), 0);
        assert_eq!(tx.withdraw_last(), Some(entry(3)));
        assert_eq!(tx.cursor(), 2);
    }
}

#[cfg(all(test, not(loom)))]
mod fuzz {
    use std::collections::VecDeque;

    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    #[derive(Clone, Debug)]
    enum Op {
        Push,
        Withdraw,
        Publish,
        Pop,
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 4 {
                0 => Op::Push,
                1 => Op::Withdraw,
                2 => Op::Publish,
                _ => Op::Pop,
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        slots: usize,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let slots = usize::arbitrary(g) % 16 + 2;
            let ops = (0..usize::arbitrary(g) % 64 + 1)
                .map(|_| Op::arbitrary(g))
                .collect();
            Scenario { slots, ops }
        }
    }

    /// Checks the split FIFO against a VecDeque model.
    fn run_scenario(s: Scenario) -> bool {
        let Some((mut tx, mut rx)) = correlation_fifo(s.slots) else {
            return false;
        };
        let mut published: VecDeque<u64> = VecDeque::new();
        let mut staged: Vec<u64> = Vec::new();
        let mut next_tag = 0u64;

        for op in &s.ops {
            match op {
                Op::Push => {
                    let room = published.len() + staged.len() < s.slots - 1;
                    let pushed = tx.push(CorrelationEntry {
                        user_tag: next_tag,
                        ..Default::default()
                    });
                    if pushed != room {
                        return false;
                    }
                    if pushed {
                        staged.push(next_tag);
                        next_tag += 1;
                    }
                }
                Op::Withdraw => {
                    let got = tx.withdraw_last().map(|e| e.user_tag);
                    if got != staged.pop() {
                        return false;
                    }
                }
                Op::Publish => {
                    tx.publish();
                    published.extend(staged.drain(..));
                }
                Op::Pop => {
                    if rx.pop().map(|e| e.user_tag) != published.pop_front() {
                        return false;
                    }
                }
            }

            if rx.len() != published.len() || tx.staged() != staged.len() {
                return false;
            }
            if tx.free() != s.slots - 1 - published.len() - staged.len() {
                return false;
            }
        }
        true
    }

    #[test]
    fn prop_fifo_matches_model() {
        #[cfg(miri)]
        let tests = 10;
        #[cfg(not(miri))]
        let tests = 1000;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    //! Model-checks the producer/consumer handoff: every published entry is
    //! observed exactly once and in order, whatever the interleaving.

    use loom::thread;

    use super::*;

    #[test]
    fn test_spsc_handoff_in_order() {
        loom::model(|| {
            let (mut tx, mut rx) = correlation_fifo(3).unwrap();

            let producer = thread::spawn(move || {
                let mut sent = 0u64;
                while sent < 3 {
                    if tx.push(CorrelationEntry {
                        user_tag: sent,
                        ..Default::default()
                    }) {
                        tx.publish();
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            });

            let mut expected = 0u64;
            while expected < 3 {
                match rx.pop() {
                    Some(e) => {
                        assert_eq!(e.user_tag, expected);
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
            }

            producer.join().unwrap();
            assert!(rx.pop().is_none());
        });
    }

    #[test]
    fn test_withdrawn_entries_never_reach_consumer() {
        loom::model(|| {
            let (mut tx, mut rx) = correlation_fifo(4).unwrap();

            let producer = thread::spawn(move || {
                tx.push(CorrelationEntry {
                    user_tag: 1,
                    ..Default::default()
                });
                tx.push(CorrelationEntry {
                    user_tag: 2,
                    ..Default::default()
                });
                tx.withdraw_last();
                tx.publish();
            });

            let first = rx.pop();
            producer.join().unwrap();
            let rest = rx.pop();

            let tags: Vec<u64> = first.into_iter().chain(rest).map(|e| e.user_tag).collect();
            assert_eq!(tags, vec![1]);
        });
    }
}
