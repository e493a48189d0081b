//! Bounded blocking FIFO used to feed the coordinator thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Wakes a single consumer that waits on several queues at once.
///
/// A ring that happens while nobody waits is remembered, so the consumer
/// cannot miss a push between checking its queues and going to sleep.
#[derive(Debug, Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(|p| p.into_inner());
        *rung = true;
        self.cond.notify_all();
    }

    /// Block until rung, then reset.
    pub fn wait(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(|p| p.into_inner());
        while !*rung {
            rung = self.cond.wait(rung).unwrap_or_else(|p| p.into_inner());
        }
        *rung = false;
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns whether it was rung.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let rung = self.rung.lock().unwrap_or_else(|p| p.into_inner());
        let (mut rung, _) = self
            .cond
            .wait_timeout_while(rung, timeout, |r| !*r)
            .unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *rung)
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO with blocking and non-blocking ends.
///
/// [`wakeup`](Self::wakeup) closes the queue: blocked callers return
/// immediately without data and later pushes are refused.
pub struct MessageQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    doorbell: Option<Arc<Doorbell>>,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            doorbell: None,
        }
    }

    /// Queue that also rings `doorbell` on every push.
    pub fn with_doorbell(capacity: usize, doorbell: Arc<Doorbell>) -> Self {
        Self {
            doorbell: Some(doorbell),
            ..Self::new(capacity)
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pushed(&self) {
        self.not_empty.notify_one();
        if let Some(bell) = &self.doorbell {
            bell.ring();
        }
    }

    /// Push without blocking. Gives the item back if full or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed || state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.pushed();
        Ok(())
    }

    /// Push, blocking while the queue is full. Gives the item back if the
    /// queue is closed.
    pub fn wait_and_push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        while !state.closed && state.items.len() >= self.capacity {
            state = self.not_full.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.pushed();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop, blocking while the queue is empty. Returns `None` once the queue
    /// is closed and drained.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.lock();
        while !state.closed && state.items.is_empty() {
            state = self.not_empty.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Close the queue and release every blocked caller.
    pub fn wakeup(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        if let Some(bell) = &self.doorbell {
            bell.ring();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
