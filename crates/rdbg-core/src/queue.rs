//! Bounded, interruptible, multi-producer / multi-consumer FIFO.
//!
//! [`BlockingQueue`] is the only synchronization primitive shared between
//! engine threads and the network I/O thread. It offers:
//!
//! - blocking `push` / `pop` that fail with [`Interrupted`] once the queue
//!   has been interrupted,
//! - non-blocking `add` / `get`,
//! - `peek` / `pop_only` so a consumer can leave an item queued until it
//!   can actually be handled,
//! - a signal observer invoked after every successful enqueue, outside the
//!   internal lock.
//!
//! Internally: one mutex, a `not_empty` and a `not_full` condition, and a
//! third `drained` condition broadcast whenever the queue becomes empty.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;

/// Raised by blocking queue calls after [`BlockingQueue::interrupt`].
///
/// Interruption is permanent: the queue never blocks again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("blocking queue interrupted")]
pub struct Interrupted;

/// Observer notified after an item has been enqueued.
///
/// Called synchronously on the enqueuing thread with no queue lock held,
/// so it may call straight back into the queue (e.g. drain it with `get`).
pub trait QueueSignalHandler<T>: Send + Sync {
    fn handle(&self, queue: &BlockingQueue<T>);
}

impl<T, F> QueueSignalHandler<T> for F
where
    F: Fn(&BlockingQueue<T>) + Send + Sync,
{
    fn handle(&self, queue: &BlockingQueue<T>) {
        self(queue)
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    interrupted: bool,
}

pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
    capacity: Option<usize>,
    observer: RwLock<Option<Arc<dyn QueueSignalHandler<T>>>>,
}

impl<T> BlockingQueue<T> {
    /// Queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// `None` means unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            capacity,
            observer: RwLock::new(None),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Install (or clear) the enqueue observer.
    pub fn set_signal_handler(&self, handler: Option<Arc<dyn QueueSignalHandler<T>>>) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Enqueue, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), Interrupted> {
        {
            let mut state = self.lock();
            loop {
                if state.interrupted {
                    return Err(Interrupted);
                }
                if !self.is_full(&state) {
                    break;
                }
                state = self
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.items.push_back(item);
            self.not_empty.notify_one();
        }
        self.signal();
        Ok(())
    }

    /// Non-blocking enqueue. A full queue hands the item back untouched.
    pub fn add(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if self.is_full(&state) {
                return Err(item);
            }
            state.items.push_back(item);
            self.not_empty.notify_one();
        }
        self.signal();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Dequeue, blocking while the queue is empty.
    pub fn pop(&self) -> Result<T, Interrupted> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return Err(Interrupted);
            }
            if let Some(item) = state.items.pop_front() {
                self.after_removal(&state);
                return Ok(item);
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking dequeue.
    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        self.after_removal(&state);
        Some(item)
    }

    /// Remove the front item without returning it. Returns `false` when empty.
    pub fn pop_only(&self) -> bool {
        let mut state = self.lock();
        if state.items.pop_front().is_none() {
            return false;
        }
        self.after_removal(&state);
        true
    }

    /// Drop every item `keep` rejects. Returns how many were dropped.
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(keep);
        let dropped = before - state.items.len();
        if dropped > 0 {
            self.not_full.notify_all();
            if state.items.is_empty() {
                self.drained.notify_all();
            }
        }
        dropped
    }

    /// Block until the queue is empty.
    pub fn wait_for_empty(&self) -> Result<(), Interrupted> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return Err(Interrupted);
            }
            if state.items.is_empty() {
                return Ok(());
            }
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // ------------------------------------------------------------------
    // Interruption and introspection
    // ------------------------------------------------------------------

    /// Trip the queue permanently and wake every waiter.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.drained.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self, state: &QueueState<T>) -> bool {
        self.capacity
            .map(|cap| state.items.len() >= cap)
            .unwrap_or(false)
    }

    fn after_removal(&self, state: &QueueState<T>) {
        self.not_full.notify_one();
        if state.items.is_empty() {
            self.drained.notify_all();
        }
    }

    fn signal(&self) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.handle(self);
        }
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// Copy of the front item, leaving it queued.
    pub fn peek(&self) -> Option<T> {
        self.lock().items.front().cloned()
    }
}

impl<T> std::fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockingQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("interrupted", &state.interrupted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_across_threads() {
        let queue = Arc::new(BlockingQueue::bounded(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..100 {
                    queue.push(i).unwrap();
                }
            })
        };

        let received: Vec<i32> = (0..100).map(|_| queue.pop().unwrap()).collect();
        producer.join().unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn add_rejects_when_full() {
        let queue = BlockingQueue::bounded(2);
        assert!(queue.add(1).is_ok());
        assert!(queue.add(2).is_ok());
        assert_eq!(queue.add(3), Err(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_unblocks_when_slot_frees() {
        let queue = Arc::new(BlockingQueue::bounded(1));
        queue.push("first").unwrap();

        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push("second"))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop().unwrap(), "first");
        pusher.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap(), "second");
    }

    #[test]
    fn interrupt_wakes_blocked_pop_and_stays_tripped() {
        let queue: Arc<BlockingQueue<u8>> = Arc::new(BlockingQueue::unbounded());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        queue.interrupt();
        queue.interrupt();

        assert_eq!(waiter.join().unwrap(), Err(Interrupted));
        assert_eq!(queue.pop(), Err(Interrupted));
        assert_eq!(queue.push(1), Err(Interrupted));
        assert_eq!(queue.wait_for_empty(), Err(Interrupted));
        assert!(queue.is_interrupted());
    }

    #[test]
    fn interrupt_wakes_blocked_push() {
        let queue = Arc::new(BlockingQueue::bounded(1));
        queue.push(0u8).unwrap();
        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1))
        };

        thread::sleep(Duration::from_millis(50));
        queue.interrupt();
        assert_eq!(pusher.join().unwrap(), Err(Interrupted));
    }

    #[test]
    fn peek_and_pop_only() {
        let queue = BlockingQueue::unbounded();
        assert_eq!(queue.peek(), None);
        assert!(!queue.pop_only());

        queue.add("a".to_string()).unwrap();
        queue.add("b".to_string()).unwrap();

        assert_eq!(queue.peek().as_deref(), Some("a"));
        assert_eq!(queue.len(), 2);
        assert!(queue.pop_only());
        assert_eq!(queue.get().as_deref(), Some("b"));
        assert!(queue.get().is_none());
    }

    #[test]
    fn retain_drops_rejected_items_and_frees_space() {
        let queue = BlockingQueue::bounded(3);
        for i in 0..3u8 {
            queue.add(i).unwrap();
        }
        assert_eq!(queue.add(9), Err(9));

        assert_eq!(queue.retain(|&i| i != 1), 1);
        assert_eq!(queue.retain(|_| true), 0);
        queue.add(3).unwrap();
        assert_eq!(queue.get(), Some(0));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), Some(3));
    }

    #[test]
    fn observer_fires_only_on_successful_enqueue() {
        let queue = BlockingQueue::bounded(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        queue.set_signal_handler(Some(Arc::new(move |_: &BlockingQueue<u8>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        queue.add(1).unwrap();
        assert!(queue.add(2).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_may_drain_the_queue() {
        let queue = BlockingQueue::unbounded();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        queue.set_signal_handler(Some(Arc::new(move |q: &BlockingQueue<usize>| {
            while let Some(v) = q.get() {
                sink.fetch_add(v, Ordering::SeqCst);
            }
        })));

        queue.push(3).unwrap();
        queue.push(4).unwrap();

        assert!(queue.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn wait_for_empty_returns_after_drain() {
        let queue = Arc::new(BlockingQueue::unbounded());
        queue.add(1).unwrap();
        queue.add(2).unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_for_empty())
        };

        thread::sleep(Duration::from_millis(20));
        queue.get();
        queue.get();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }
}
