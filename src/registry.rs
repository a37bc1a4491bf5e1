//! A lock-free, last-in-first-out registry of pending callbacks.
//!
//! This is a Treiber stack: the top of the stack is an atomic reference that
//! `push` and `pop` update with compare-and-swap, retrying on conflict. Entries
//! are reference counted through [`ArcSwapOption`], so a popper inspecting an
//! entry never reads freed memory even when another popper unlinks it first.
//!
//! Ordering is LIFO. A drain hands callbacks out in reverse registration
//! order, and callers may rely on that.
//!
//! # Examples
//!
//! ```
//! use promise_cell::registry::Registry;
//!
//! let registry = Registry::new();
//! registry.push("first");
//! registry.push("second");
//! assert_eq!(registry.drain().collect::<Vec<_>>(), vec!["second", "first"]);
//! assert!(registry.is_empty());
//! ```
use arc_swap::ArcSwapOption;
use crossbeam_utils::atomic::AtomicCell;
use std::{fmt, sync::Arc};

struct Entry<C> {
    // Pointer-sized, so the cell is lock-free. Emptied by whoever unlinks
    // the entry.
    callback: AtomicCell<Option<Box<C>>>,
    next: Option<Arc<Entry<C>>>,
}

impl<C> Entry<C> {
    fn new(callback: Box<C>, next: Option<Arc<Entry<C>>>) -> Self {
        Self {
            callback: AtomicCell::new(Some(callback)),
            next,
        }
    }

    fn take(&self) -> Option<Box<C>> {
        self.callback.take()
    }
}

impl<C> Drop for Entry<C> {
    /// Unlinks the tail iteratively. A stale handle to an old top can be the
    /// last owner of a long popped chain.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(entry) = next {
            match Arc::into_inner(entry) {
                Some(mut entry) => next = entry.next.take(),
                None => break,
            }
        }
    }
}

fn same_entry<C>(a: &Option<Arc<Entry<C>>>, b: &Option<Arc<Entry<C>>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Concurrent stack of callbacks waiting for a promise to settle.
pub struct Registry<C> {
    top: ArcSwapOption<Entry<C>>,
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            top: ArcSwapOption::empty(),
        }
    }

    /// Pushes `callback` as the new top. Never blocks and never fails.
    pub fn push(&self, callback: C) {
        let mut callback = Box::new(callback);
        let mut next = self.top.load_full();
        loop {
            let entry = Arc::new(Entry::new(callback, next.clone()));
            let prev = self.top.compare_and_swap(&next, Some(Arc::clone(&entry)));
            if same_entry(&prev, &next) {
                return;
            }
            next = Option::clone(&prev);
            // Lost the race. The entry was never published, so the callback
            // is still ours to retry with.
            callback = match entry.take() {
                Some(callback) => callback,
                None => unreachable!("unpublished registry entry was popped"),
            };
        }
    }

    /// Removes and returns the current top, or `None` when empty.
    ///
    /// Any number of callers may pop concurrently; each entry is returned to
    /// exactly one of them.
    pub fn pop(&self) -> Option<C> {
        loop {
            let top = self.top.load_full()?;
            let prev = self.top.compare_and_swap(&top, top.next.clone());
            let unlinked = matches!(&*prev, Some(prev) if Arc::ptr_eq(prev, &top));
            if unlinked {
                if let Some(callback) = top.take() {
                    return Some(*callback);
                }
            }
        }
    }

    /// Pops until empty.
    pub fn drain(&self) -> impl Iterator<Item = C> + '_ {
        std::iter::from_fn(move || self.pop())
    }

    /// Snapshot check; a concurrent `push` may land right after.
    pub fn is_empty(&self) -> bool {
        self.top.load().is_none()
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Drop for Registry<C> {
    /// Drops the callbacks still queued without running them.
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<C> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
        thread,
    };

    #[test]
    fn test_pop_empty() {
        let registry = Registry::<u32>::new();
        assert!(registry.is_empty());
        assert_eq!(registry.pop(), None);
    }

    #[test]
    fn test_pop_is_lifo() {
        let registry = Registry::new();
        for i in 0..5 {
            registry.push(i);
        }
        assert_eq!(registry.drain().collect::<Vec<_>>(), vec![4, 3, 2, 1, 0]);
        assert_eq!(registry.pop(), None);
    }

    #[test]
    fn test_push_after_drain() {
        let registry = Registry::new();
        registry.push("a");
        assert_eq!(registry.pop(), Some("a"));
        registry.push("b");
        assert!(!registry.is_empty());
        assert_eq!(registry.pop(), Some("b"));
    }

    #[test]
    fn test_concurrent_push() {
        let registry = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(8));
        let tasks: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..1_000 {
                        registry.push(t * 1_000 + i);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.join().expect("The push thread has panicked");
        }
        let seen: HashSet<_> = registry.drain().collect();
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn test_concurrent_pop_hands_out_each_entry_once() {
        let registry = Arc::new(Registry::new());
        for i in 0..4_000 {
            registry.push(i);
        }
        let popped = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(4));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let popped = popped.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mine: Vec<_> = registry.drain().collect();
                    popped.lock().unwrap().extend(mine);
                })
            })
            .collect();
        for task in tasks {
            task.join().expect("The pop thread has panicked");
        }
        let mut popped = popped.lock().unwrap().clone();
        popped.sort_unstable();
        assert_eq!(popped, (0..4_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_stale_top_outliving_drain_drops_iteratively() {
        let task = thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(|| {
                let registry = Registry::new();
                for i in 0..200_000u32 {
                    registry.push(i);
                }
                let stale = registry.top.load_full();
                assert_eq!(registry.drain().count(), 200_000);
                drop(stale);
            })
            .expect("failed to spawn the drop thread");
        task.join().expect("The drop thread has panicked");
    }

    #[test]
    fn test_drop_releases_pending_entries() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new();
        for _ in 0..100_000 {
            registry.push(Counted(dropped.clone()));
        }
        drop(registry);
        assert_eq!(dropped.load(Ordering::SeqCst), 100_000);
    }
}
