//! Intrusive lock-free work queue feeding the index worker.
//!
//! Producers push with a CAS on the head pointer (LIFO). The single consumer
//! detaches the whole list at once and reverses it, so items come out in
//! the order they were pushed.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    item: T,
    next: *mut Node<T>,
}

pub struct WorkQueue<T> {
    head: AtomicPtr<Node<T>>,
    _owns: PhantomData<Box<Node<T>>>,
}

// Nodes are only reachable through the atomic head and move between threads
// together with their items.
unsafe impl<T: Send> Send for WorkQueue<T> {}
unsafe impl<T: Send> Sync for WorkQueue<T> {}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Push an item. Never blocks; ownership of the node passes to the queue
    /// on the successful CAS.
    pub fn push(&self, item: T) {
        let node = Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not published until the CAS below succeeds
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach everything pushed so far, oldest first.
    pub fn take_all(&self) -> Drain<T> {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        // Reverse the detached LIFO chain in place.
        let mut reversed: *mut Node<T> = ptr::null_mut();
        while !current.is_null() {
            // SAFETY: the swap gave this thread exclusive ownership of the chain
            let next = unsafe { (*current).next };
            unsafe { (*current).next = reversed };
            reversed = current;
            current = next;
        }

        Drain {
            current: reversed,
            _owns: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Dropping the drain frees whatever was never consumed.
        drop(self.take_all());
    }
}

/// Items detached from a [`WorkQueue`], yielded in push order.
pub struct Drain<T> {
    current: *mut Node<T>,
    _owns: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send> Send for Drain<T> {}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.current.is_null() {
            return None;
        }
        // SAFETY: every node in the chain came from Box::into_raw in push and
        // is owned exclusively by this drain
        let node = unsafe { Box::from_raw(self.current) };
        self.current = node.next;
        Some(node.item)
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}
