//! Thread-safe doubly linked queue with blocking pop and O(1) removal by handle
//!
//! Every buffer in the pipeline is one of these: the capture → sender intake,
//! per-device histories, smoothing windows and the calibration point list.
//! Nodes live in a slot vector and link to each other by index; a [`Handle`]
//! names a slot together with the generation it was issued for, so a handle
//! whose value has already been popped or removed is simply ignored.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Stable reference to a value inside a [`BoundedQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Link<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    link: Option<Link<T>>,
}

#[derive(Debug)]
struct List<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    closed: bool,
    /// Consumers currently parked in `pop_head(true)`; pushes only signal when non-zero
    waiters: usize,
}

impl<T> List<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            closed: false,
            waiters: 0,
        }
    }

    fn push_tail(&mut self, value: T) -> Handle {
        let link = Link {
            value,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].link = Some(link);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    link: Some(link),
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(prev) = self.slots[tail].link.as_mut() {
                    prev.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn is_live(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index)
            .map(|slot| slot.generation == handle.generation && slot.link.is_some())
            .unwrap_or(false)
    }

    fn get(&self, handle: Handle) -> Option<&T> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.index].link.as_ref().map(|link| &link.value)
    }

    /// Detaches the slot at `index`, relinking its neighbours
    fn unlink(&mut self, index: usize) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        let link = slot.link.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        match link.prev {
            Some(prev) => {
                if let Some(prev) = self.slots[prev].link.as_mut() {
                    prev.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next) = self.slots[next].link.as_mut() {
                    next.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }
        self.len -= 1;
        Some(link.value)
    }

    fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.is_live(handle) {
            return None;
        }
        self.unlink(handle.index)
    }

    fn pop_head(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    fn handle_at(&self, index: usize) -> Handle {
        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

/// Iterator over `(handle, value)` pairs from head to tail
pub struct Iter<'a, T> {
    list: &'a List<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let link = self.list.slots[index].link.as_ref()?;
        self.cursor = link.next;
        Some((self.list.handle_at(index), &link.value))
    }
}

/// FIFO of owned values guarded by one mutex and one condition variable.
///
/// Insertion order is the only order: new values go to the tail, consumers take
/// from the head. A closed queue still hands out what it holds but never blocks.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<List<T>>,
    available: Condvar,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BoundedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(List::new()),
            available: Condvar::new(),
        }
    }

    /// Appends `value` and wakes one blocked consumer if there is one. Never blocks.
    pub fn push_tail(&self, value: T) -> Handle {
        let mut list = self.lock_list();
        let handle = list.push_tail(value);
        if list.waiters > 0 {
            self.available.notify_one();
        }
        handle
    }

    /// Removes and returns the head.
    ///
    /// With `blocking`, waits while the queue is empty and open; `None` then
    /// means the queue was closed. Without it, `None` means the queue was empty.
    pub fn pop_head(&self, blocking: bool) -> Option<T> {
        let mut list = self.lock_list();
        loop {
            if let Some(value) = list.pop_head() {
                return Some(value);
            }
            if !blocking || list.closed {
                return None;
            }
            list.waiters += 1;
            list = self.available.wait(list).unwrap_or_else(|poisoned| {
                warn!("queue mutex poisoned while waiting; recovering");
                poisoned.into_inner()
            });
            list.waiters -= 1;
        }
    }

    /// Like a blocking `pop_head`, but gives up after `timeout`
    pub fn pop_head_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut list = self.lock_list();
        loop {
            if let Some(value) = list.pop_head() {
                return Some(value);
            }
            if list.closed {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            list.waiters += 1;
            list = match self.available.wait_timeout(list, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    warn!("queue mutex poisoned while waiting; recovering");
                    poisoned.into_inner().0
                }
            };
            list.waiters -= 1;
        }
    }

    /// O(1) removal of the value behind `handle`. Stale handles yield `None`.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        self.lock_list().remove(handle)
    }

    /// Marks the queue closed and wakes every blocked consumer
    pub fn close(&self) {
        let mut list = self.lock_list();
        if !list.closed {
            list.closed = true;
            trace!(waiters = list.waiters, "queue closed");
        }
        drop(list);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_list().closed
    }

    pub fn len(&self) -> usize {
        self.lock_list().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Holds the queue lock for a compound read or edit
    pub fn lock(&self) -> QueueGuard<'_, T> {
        QueueGuard {
            list: self.lock_list(),
            available: &self.available,
        }
    }

    fn lock_list(&self) -> MutexGuard<'_, List<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("queue mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Clones every value, head first
    pub fn to_vec(&self) -> Vec<T> {
        self.lock().iter().map(|(_, value)| value.clone()).collect()
    }
}

/// Exclusive access to a queue's contents while the guard lives
pub struct QueueGuard<'a, T> {
    list: MutexGuard<'a, List<T>>,
    available: &'a Condvar,
}

impl<'a, T> QueueGuard<'a, T> {
    pub fn len(&self) -> usize {
        self.list.len
    }

    pub fn is_empty(&self) -> bool {
        self.list.len == 0
    }

    pub fn front(&self) -> Option<&T> {
        let head = self.list.head?;
        self.list.slots[head].link.as_ref().map(|link| &link.value)
    }

    pub fn back(&self) -> Option<&T> {
        let tail = self.list.tail?;
        self.list.slots[tail].link.as_ref().map(|link| &link.value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.list.get(handle)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        self.list.iter()
    }

    pub fn push_tail(&mut self, value: T) -> Handle {
        let handle = self.list.push_tail(value);
        if self.list.waiters > 0 {
            self.available.notify_one();
        }
        handle
    }

    pub fn pop_head(&mut self) -> Option<T> {
        self.list.pop_head()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.list.remove(handle)
    }

    /// Removes every value matching `predicate`, keeping survivors in order.
    /// Returns how many were removed.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let doomed: Vec<Handle> = self
            .list
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(handle, _)| handle)
            .collect();
        doomed
            .into_iter()
            .filter_map(|handle| self.list.remove(handle))
            .count()
    }

    /// Empties the queue, returning the values head first
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.list.len);
        while let Some(value) = self.list.pop_head() {
            values.push(value);
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new();
        for i in 0..5 {
            queue.push_tail(i);
        }
        assert_eq!(queue.len(), 5);
        let popped: Vec<i32> = std::iter::from_fn(|| queue.pop_head(false)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop_head(false), None);
    }

    #[test]
    fn test_remove_middle_head_and_tail() {
        let queue = BoundedQueue::new();
        let handles: Vec<Handle> = (0..5).map(|i| queue.push_tail(i)).collect();

        assert_eq!(queue.remove(handles[2]), Some(2));
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.to_vec(), vec![0, 1, 3, 4]);

        assert_eq!(queue.remove(handles[0]), Some(0));
        assert_eq!(queue.to_vec(), vec![1, 3, 4]);
        assert_eq!(queue.lock().front(), Some(&1));

        assert_eq!(queue.remove(handles[4]), Some(4));
        assert_eq!(queue.to_vec(), vec![1, 3]);
        assert_eq!(queue.lock().back(), Some(&3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_only_node_resets_ends() {
        let queue = BoundedQueue::new();
        let handle = queue.push_tail("only");
        assert_eq!(queue.remove(handle), Some("only"));
        let guard = queue.lock();
        assert!(guard.is_empty());
        assert!(guard.front().is_none());
        assert!(guard.back().is_none());
    }

    #[test]
    fn test_stale_handle_is_ignored() {
        let queue = BoundedQueue::new();
        let first = queue.push_tail(1);
        assert_eq!(queue.pop_head(false), Some(1));
        // Slot gets reused by the next push
        let second = queue.push_tail(2);
        assert_eq!(queue.remove(first), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove(second), Some(2));
        assert_eq!(queue.remove(second), None);
    }

    #[test]
    fn test_remove_where_keeps_order() {
        let queue = BoundedQueue::new();
        for i in 0..10 {
            queue.push_tail(i);
        }
        let removed = queue.lock().remove_where(|v| v % 3 == 0);
        assert_eq!(removed, 4);
        assert_eq!(queue.to_vec(), vec![1, 2, 4, 5, 7, 8]);
    }

    #[test]
    fn test_blocking_pop_receives_later_push() {
        let queue = Arc::new(BoundedQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_head(true))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push_tail(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close_wakes_blocked_consumers() {
        let queue: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop_head(true))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
        assert!(queue.is_closed());
    }

    #[test]
    fn test_closed_queue_still_drains() {
        let queue = BoundedQueue::new();
        queue.push_tail(1);
        queue.close();
        assert_eq!(queue.pop_head(true), Some(1));
        assert_eq!(queue.pop_head(true), None);
    }

    #[test]
    fn test_pop_head_timeout_expires() {
        let queue: BoundedQueue<u8> = BoundedQueue::new();
        assert_eq!(queue.pop_head_timeout(Duration::from_millis(10)), None);
        queue.push_tail(9);
        assert_eq!(queue.pop_head_timeout(Duration::from_millis(10)), Some(9));
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(BoundedQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        queue.push_tail((p, i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let values = queue.lock().drain();
        assert_eq!(values.len(), 1000);
        for p in 0..4u32 {
            let seq: Vec<u32> = values.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..250).collect::<Vec<_>>());
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u16),
        Pop,
        RemoveNth(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u16>().prop_map(Op::Push),
            Just(Op::Pop),
            (0usize..16).prop_map(Op::RemoveNth),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_vecdeque_model(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let queue = BoundedQueue::new();
            let mut model: std::collections::VecDeque<(Handle, u16)> = Default::default();

            for op in ops {
                match op {
                    Op::Push(v) => {
                        let handle = queue.push_tail(v);
                        model.push_back((handle, v));
                    }
                    Op::Pop => {
                        let expected = model.pop_front().map(|(_, v)| v);
                        prop_assert_eq!(queue.pop_head(false), expected);
                    }
                    Op::RemoveNth(n) => {
                        if !model.is_empty() {
                            let (handle, v) = model.remove(n % model.len()).unwrap();
                            prop_assert_eq!(queue.remove(handle), Some(v));
                        }
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
                let guard = queue.lock();
                prop_assert_eq!(guard.front().is_none(), model.is_empty());
                prop_assert_eq!(guard.back().is_none(), model.is_empty());
            }

            let remaining: Vec<u16> = model.iter().map(|(_, v)| *v).collect();
            prop_assert_eq!(queue.to_vec(), remaining);
        }
    }
}
